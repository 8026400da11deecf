//! Declared-edge registration for advanced services.
//!
//! An advanced service declares its edges in its constructor. Each edge pairs
//! typed add/remove callbacks with the dependency flags and an optional
//! properties predicate filtering candidate providers.

use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::marker::PhantomData;
use std::rc::Rc;

use crate::service::{Properties, ServiceHandle, ServiceInfo};

use super::{Dependency, DependencyFlags};

/// Type-erased edge callbacks stored by the lifecycle host.
///
/// `add`/`remove` receive the service handle (`Rc<RefCell<S>>`) and the
/// delivered interface (`Rc<RefCell<dyn I>>`), both as `&dyn Any`.
pub(crate) struct DependencyEntry {
    pub(crate) dep: Dependency,
    pub(crate) filter: Option<Rc<dyn Fn(&Properties) -> bool>>,
    pub(crate) add: Rc<dyn Fn(&dyn Any, &dyn Any, &ServiceInfo)>,
    pub(crate) remove: Rc<dyn Fn(&dyn Any, &dyn Any, &ServiceInfo)>,
}

impl fmt::Debug for DependencyEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DependencyEntry")
            .field("dep", &self.dep)
            .field("filtered", &self.filter.is_some())
            .finish()
    }
}

/// Edge registration API handed to an advanced service's constructor.
pub struct DependencyRegister<S> {
    entries: Vec<DependencyEntry>,
    _marker: PhantomData<fn(S)>,
}

impl<S: 'static> DependencyRegister<S> {
    pub(crate) fn new() -> Self {
        Self {
            entries: Vec::new(),
            _marker: PhantomData,
        }
    }

    /// Declare a dependency on interface `I`.
    ///
    /// `add` runs exactly once per provider transition to active, `remove`
    /// before the provider's stop completes.
    pub fn register<I: ?Sized + 'static>(
        &mut self,
        flags: DependencyFlags,
        add: impl Fn(&mut S, Rc<RefCell<I>>, &ServiceInfo) + 'static,
        remove: impl Fn(&mut S, Rc<RefCell<I>>, &ServiceInfo) + 'static,
    ) {
        self.register_inner::<I>(flags, None, add, remove);
    }

    /// Like [`register`](Self::register) with a predicate over candidate
    /// provider properties.
    pub fn register_filtered<I: ?Sized + 'static>(
        &mut self,
        flags: DependencyFlags,
        filter: impl Fn(&Properties) -> bool + 'static,
        add: impl Fn(&mut S, Rc<RefCell<I>>, &ServiceInfo) + 'static,
        remove: impl Fn(&mut S, Rc<RefCell<I>>, &ServiceInfo) + 'static,
    ) {
        self.register_inner::<I>(flags, Some(Rc::new(filter)), add, remove);
    }

    fn register_inner<I: ?Sized + 'static>(
        &mut self,
        flags: DependencyFlags,
        filter: Option<Rc<dyn Fn(&Properties) -> bool>>,
        add: impl Fn(&mut S, Rc<RefCell<I>>, &ServiceInfo) + 'static,
        remove: impl Fn(&mut S, Rc<RefCell<I>>, &ServiceInfo) + 'static,
    ) {
        self.entries.push(DependencyEntry {
            dep: Dependency::new::<I>(flags),
            filter,
            add: Rc::new(erase_callback::<S, I>(add)),
            remove: Rc::new(erase_callback::<S, I>(remove)),
        });
    }

    pub(crate) fn into_entries(self) -> Vec<DependencyEntry> {
        self.entries
    }
}

impl<S> fmt::Debug for DependencyRegister<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DependencyRegister")
            .field("entries", &self.entries.len())
            .finish()
    }
}

fn erase_callback<S: 'static, I: ?Sized + 'static>(
    callback: impl Fn(&mut S, Rc<RefCell<I>>, &ServiceInfo) + 'static,
) -> impl Fn(&dyn Any, &dyn Any, &ServiceInfo) {
    move |service_any, interface_any, provider_info| {
        let Some(service) = service_any.downcast_ref::<ServiceHandle<S>>() else {
            debug_assert!(false, "service instance downcast mismatch");
            return;
        };
        let Some(interface) = interface_any.downcast_ref::<Rc<RefCell<I>>>() else {
            debug_assert!(false, "interface instance downcast mismatch");
            return;
        };
        callback(
            &mut service.borrow_mut(),
            Rc::clone(interface),
            provider_info,
        );
    }
}
