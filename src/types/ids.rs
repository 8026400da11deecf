//! Strongly-typed identifiers.
//!
//! Numeric ids are allocated from monotonic counters and never reused within
//! a run. Hash ids are stable FNV-1a hashes of type names, identical across
//! compilation units within a build.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Macro to define a strongly-typed u64 id newtype wrapper.
///
/// Generates: struct, `from_raw()`, `as_u64()`, Display, Serialize, Deserialize.
macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        pub struct $name(u64);

        impl $name {
            pub const fn from_raw(raw: u64) -> Self {
                Self(raw)
            }

            pub const fn as_u64(self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

define_id!(
    /// Process-local service identifier, allocated from 1 upward.
    ServiceId
);
define_id!(
    /// Queue-local event identifier, monotonic per queue.
    EventId
);
define_id!(
    /// Identifier of a suspended continuation in the manager's table.
    PromiseId
);
define_id!(
    /// Process-local dependency-manager identifier.
    ManagerId
);
define_id!(
    /// Identifier of a registered event interceptor.
    InterceptorId
);

impl ServiceId {
    /// Origin used for events pushed by the framework itself.
    pub const FRAMEWORK: ServiceId = ServiceId(0);
}

/// FNV-1a over the input bytes; stable for a given type name.
const fn fnv1a_64(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    let mut i = 0;
    while i < bytes.len() {
        hash ^= bytes[i] as u64;
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
        i += 1;
    }
    hash
}

/// Stable 64-bit hash of an interface type's name.
///
/// The universal key for dependency matching, tracker keying, and the
/// interface index. Interfaces are usually trait objects, e.g.
/// `InterfaceHash::of::<dyn Logger>()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InterfaceHash(u64);

impl InterfaceHash {
    pub fn of<I: ?Sized + 'static>() -> Self {
        Self(fnv1a_64(std::any::type_name::<I>().as_bytes()))
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for InterfaceHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Stable 64-bit hash of an event type's name; keys handler and interceptor
/// tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EventTypeHash(u64);

impl EventTypeHash {
    pub fn of<E: 'static>() -> Self {
        Self(fnv1a_64(std::any::type_name::<E>().as_bytes()))
    }

    pub(crate) const fn from_name(name: &str) -> Self {
        Self(fnv1a_64(name.as_bytes()))
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for EventTypeHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}
