//! Service abstraction: lifecycle state, metadata, and the two service
//! flavors (advanced and constructor-injected).

use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use uuid::Uuid;

use crate::queue::EventQueue;
use crate::types::ServiceId;

pub mod advanced;
pub mod injected;

pub use advanced::AdvancedService;
pub use injected::{InjectedService, ResolvedDependencies};

/// Per-service key/value properties. Keys are unique; insertion order is
/// irrelevant.
pub type Properties = HashMap<String, serde_json::Value>;

/// Shared ownership cell for a service implementation.
pub type ServiceHandle<S> = Rc<RefCell<S>>;

/// Service lifecycle state.
///
/// State transitions:
/// ```text
/// INSTALLED → INJECTING → STARTING → ACTIVE
///     ↑           ↓           ↓         ↓
///     └───────────┴───────────┘      STOPPING → UNINJECTING → INSTALLED
///     └→ UNINSTALLING → UNINSTALLED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ServiceState {
    Installed,
    Injecting,
    Starting,
    Active,
    Stopping,
    Uninjecting,
    Uninstalling,
    Uninstalled,
}

impl ServiceState {
    pub fn is_active(self) -> bool {
        self == ServiceState::Active
    }

    /// Whether the service has left `Active` for good (until a restart).
    /// In-flight work coroutines owned by the service are discarded once
    /// this holds.
    pub fn is_past_active(self) -> bool {
        matches!(
            self,
            ServiceState::Stopping
                | ServiceState::Uninjecting
                | ServiceState::Uninstalling
                | ServiceState::Uninstalled
        )
    }

    /// Check if transition is valid.
    pub fn can_transition_to(self, to: ServiceState) -> bool {
        match (self, to) {
            // INSTALLED
            (ServiceState::Installed, ServiceState::Injecting) => true,
            (ServiceState::Installed, ServiceState::Uninstalling) => true,
            // INJECTING
            (ServiceState::Injecting, ServiceState::Starting) => true,
            (ServiceState::Injecting, ServiceState::Installed) => true, // Stop while waiting
            // STARTING
            (ServiceState::Starting, ServiceState::Active) => true,
            (ServiceState::Starting, ServiceState::Installed) => true, // Start failed
            // ACTIVE
            (ServiceState::Active, ServiceState::Stopping) => true,
            // STOPPING
            (ServiceState::Stopping, ServiceState::Uninjecting) => true,
            // UNINJECTING
            (ServiceState::Uninjecting, ServiceState::Installed) => true,
            // UNINSTALLING
            (ServiceState::Uninstalling, ServiceState::Uninstalled) => true,
            // UNINSTALLED is terminal
            _ => false,
        }
    }
}

/// Metadata describing a managed service instance.
#[derive(Debug, Clone)]
pub struct ServiceInfo {
    /// Process-local id, stable for the service's whole life.
    pub id: ServiceId,
    /// Globally unique id.
    pub gid: Uuid,
    /// Implementation type name.
    pub name: &'static str,
    /// Default priority the service's own events are pushed at.
    pub priority: u64,
    pub state: ServiceState,
    pub properties: Properties,
}

/// Per-service context handed to constructors and lifecycle methods.
///
/// Carries the service's identity and a handle to the owning loop's queue.
#[derive(Debug, Clone)]
pub struct ServiceContext {
    queue: EventQueue,
    service: ServiceId,
    priority: u64,
}

impl ServiceContext {
    pub(crate) fn new(queue: EventQueue, service: ServiceId, priority: u64) -> Self {
        Self {
            queue,
            service,
            priority,
        }
    }

    /// The id of the service this context belongs to.
    pub fn id(&self) -> ServiceId {
        self.service
    }

    /// The priority the service was created with.
    pub fn priority(&self) -> u64 {
        self.priority
    }

    /// The owning loop's event queue.
    pub fn queue(&self) -> &EventQueue {
        &self.queue
    }
}

/// Declares how a concrete implementation is viewed through one of its
/// provided interfaces. Usually generated with [`provides!`](crate::provides).
pub trait ProvideAs<I: ?Sized + 'static>: 'static {
    fn as_interface(this: ServiceHandle<Self>) -> Rc<RefCell<I>>
    where
        Self: Sized;
}

/// Generate [`ProvideAs`] impls coercing an implementation to each of its
/// provided interface trait objects.
///
/// ```ignore
/// provides!(CoutLogger: dyn Logger);
/// ```
#[macro_export]
macro_rules! provides {
    ($impl:ty : $($iface:ty),+ $(,)?) => {
        $(
            impl $crate::service::ProvideAs<$iface> for $impl {
                fn as_interface(
                    this: $crate::service::ServiceHandle<Self>,
                ) -> ::std::rc::Rc<::std::cell::RefCell<$iface>> {
                    this
                }
            }
        )+
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_transition_chain() {
        assert!(ServiceState::Installed.can_transition_to(ServiceState::Injecting));
        assert!(ServiceState::Injecting.can_transition_to(ServiceState::Starting));
        assert!(ServiceState::Starting.can_transition_to(ServiceState::Active));
        assert!(ServiceState::Active.can_transition_to(ServiceState::Stopping));
        assert!(ServiceState::Stopping.can_transition_to(ServiceState::Uninjecting));
        assert!(ServiceState::Uninjecting.can_transition_to(ServiceState::Installed));
        assert!(ServiceState::Installed.can_transition_to(ServiceState::Uninstalling));
        assert!(ServiceState::Uninstalling.can_transition_to(ServiceState::Uninstalled));
    }

    #[test]
    fn test_invalid_transitions_rejected() {
        assert!(!ServiceState::Installed.can_transition_to(ServiceState::Active));
        assert!(!ServiceState::Active.can_transition_to(ServiceState::Installed));
        assert!(!ServiceState::Uninstalled.can_transition_to(ServiceState::Installed));
        assert!(!ServiceState::Stopping.can_transition_to(ServiceState::Active));
    }

    #[test]
    fn test_start_failure_returns_to_installed() {
        assert!(ServiceState::Starting.can_transition_to(ServiceState::Installed));
    }

    #[test]
    fn test_past_active_classification() {
        assert!(!ServiceState::Active.is_past_active());
        assert!(!ServiceState::Starting.is_past_active());
        assert!(ServiceState::Stopping.is_past_active());
        assert!(ServiceState::Uninstalled.is_past_active());
    }
}
