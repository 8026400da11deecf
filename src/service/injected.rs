//! Constructor-injected services.
//!
//! These services never see the dependency machinery: the resolver collects
//! one provider per declared edge and the constructor pulls them, typed, in
//! declared order. The instance is only built once every required edge has
//! an active provider; losing one stops and destroys the instance.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use crate::dependency::{Dependency, ErasedInterface};
use crate::types::{InterfaceHash, ServiceId};

use super::{Properties, ServiceContext};

/// A service whose dependencies are supplied positionally at construction.
pub trait InjectedService: 'static {
    /// Declared edges, in constructor-parameter order.
    fn dependencies() -> Vec<Dependency>
    where
        Self: Sized;

    /// Build the instance from the resolved providers. Pull each declared
    /// interface with [`ResolvedDependencies::take`]; every required edge is
    /// guaranteed present.
    fn construct(deps: &mut ResolvedDependencies, props: &Properties, ctx: ServiceContext) -> Self
    where
        Self: Sized;
}

/// Resolved providers for a constructor-injected service, keyed by interface.
#[derive(Default)]
pub struct ResolvedDependencies {
    slots: HashMap<InterfaceHash, Vec<ErasedInterface>>,
}

impl ResolvedDependencies {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&mut self, interface: InterfaceHash, instance: ErasedInterface) {
        self.slots.entry(interface).or_default().push(instance);
    }

    pub(crate) fn remove_provider(&mut self, provider: ServiceId) {
        for slot in self.slots.values_mut() {
            slot.retain(|erased| erased.provider != provider);
        }
    }

    pub(crate) fn count(&self, interface: InterfaceHash) -> u64 {
        self.slots
            .get(&interface)
            .map(|slot| slot.len() as u64)
            .unwrap_or(0)
    }

    /// Take the next resolved provider of interface `I`.
    ///
    /// Panics when no provider is available; the resolver only invokes the
    /// constructor once all required edges are satisfied, so a panic here
    /// means `dependencies()` and the constructor disagree.
    #[allow(clippy::panic, clippy::expect_used)]
    pub fn take<I: ?Sized + 'static>(&mut self) -> Rc<RefCell<I>> {
        let hash = InterfaceHash::of::<I>();
        let slot = self.slots.get_mut(&hash);
        let erased = slot
            .and_then(|slot| (!slot.is_empty()).then(|| slot.remove(0)))
            .unwrap_or_else(|| {
                panic!(
                    "constructor requested unresolved interface {}",
                    std::any::type_name::<I>()
                )
            });
        erased
            .instance
            .downcast::<Rc<RefCell<I>>>()
            .map(|rc| *rc)
            .expect("resolved interface type mismatch")
    }

    /// Take the next provider of `I` if one was resolved (optional edges).
    pub fn try_take<I: ?Sized + 'static>(&mut self) -> Option<Rc<RefCell<I>>> {
        let hash = InterfaceHash::of::<I>();
        let slot = self.slots.get_mut(&hash)?;
        if slot.is_empty() {
            return None;
        }
        let erased = slot.remove(0);
        erased.instance.downcast::<Rc<RefCell<I>>>().map(|rc| *rc).ok()
    }
}

impl fmt::Debug for ResolvedDependencies {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedDependencies")
            .field("interfaces", &self.slots.len())
            .finish()
    }
}
