//! Per-service lifecycle host.
//!
//! One host wraps one managed service: its metadata, the type-erased
//! instance, the interface cast table, declared and satisfied dependency
//! edges, and the dependent set. State transitions are validated here and
//! driven exclusively by events on the loop thread.

use futures::future::LocalBoxFuture;
use std::any::Any;
use std::collections::{BTreeSet, HashMap};
use std::fmt;

use crate::dependency::register::DependencyEntry;
use crate::dependency::{DependencyInfo, DependencyRegister, ErasedInterface};
use crate::service::{
    AdvancedService, InjectedService, Properties, ProvideAs, ResolvedDependencies, ServiceContext,
    ServiceHandle, ServiceInfo, ServiceState,
};
use crate::types::{Error, InterfaceHash, Result, ServiceId, StartError};

use std::cell::RefCell;
use std::rc::{Rc, Weak};

/// Pointer-adjusting accessor from the erased instance to one provided
/// interface.
pub(crate) struct InterfaceCast {
    pub(crate) name: &'static str,
    cast: Box<dyn Fn(&dyn Any) -> Box<dyn Any>>,
}

impl InterfaceCast {
    fn of<S, I>() -> Self
    where
        S: ProvideAs<I> + 'static,
        I: ?Sized + 'static,
    {
        InterfaceCast {
            name: std::any::type_name::<I>(),
            cast: Box::new(|instance_any| {
                let Some(handle) = instance_any.downcast_ref::<ServiceHandle<S>>() else {
                    debug_assert!(false, "interface cast applied to foreign instance");
                    return Box::new(());
                };
                Box::new(<S as ProvideAs<I>>::as_interface(Rc::clone(handle)))
            }),
        }
    }
}

impl fmt::Debug for InterfaceCast {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterfaceCast").field("name", &self.name).finish()
    }
}

/// How the user type behind a host is driven.
pub(crate) enum ServiceBacking {
    Advanced {
        /// Boxes a `ServiceHandle<S>`.
        instance: Box<dyn Any>,
        entries: Vec<DependencyEntry>,
        start: Box<dyn Fn(&dyn Any) -> LocalBoxFuture<'static, std::result::Result<(), StartError>>>,
        stop: Box<dyn Fn(&dyn Any) -> LocalBoxFuture<'static, ()>>,
    },
    Injected {
        /// Boxes a `ServiceHandle<S>` once constructed.
        instance: Option<Box<dyn Any>>,
        construct:
            Box<dyn Fn(&mut ResolvedDependencies, &Properties, ServiceContext) -> Box<dyn Any>>,
        resolved: ResolvedDependencies,
    },
}

impl fmt::Debug for ServiceBacking {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceBacking::Advanced { entries, .. } => f
                .debug_struct("Advanced")
                .field("edges", &entries.len())
                .finish(),
            ServiceBacking::Injected { instance, .. } => f
                .debug_struct("Injected")
                .field("constructed", &instance.is_some())
                .finish(),
        }
    }
}

/// The per-service state machine and bookkeeping record.
#[derive(Debug)]
pub(crate) struct LifecycleHost {
    pub(crate) info: ServiceInfo,
    pub(crate) backing: ServiceBacking,
    pub(crate) casts: HashMap<InterfaceHash, InterfaceCast>,
    pub(crate) provided: Vec<InterfaceHash>,
    pub(crate) declared: DependencyInfo,
    /// Which providers currently satisfy each edge.
    pub(crate) providers: HashMap<InterfaceHash, BTreeSet<ServiceId>>,
    /// Services holding at least one satisfied edge provided by this one.
    pub(crate) dependents: BTreeSet<ServiceId>,
    /// Stop requested while a start was in flight; `Some(remove_after)`.
    pub(crate) pending_stop: Option<bool>,
}

impl LifecycleHost {
    pub(crate) fn new_advanced<S: AdvancedService>(info: ServiceInfo, ctx: ServiceContext) -> Self {
        let mut register = DependencyRegister::<S>::new();
        let service = S::construct(&mut register, &info.properties, ctx);
        let handle: ServiceHandle<S> = Rc::new(RefCell::new(service));
        let entries = register.into_entries();

        let mut declared = DependencyInfo::new();
        for entry in &entries {
            declared.add(entry.dep.clone());
        }

        Self {
            info,
            backing: ServiceBacking::Advanced {
                instance: Box::new(handle),
                entries,
                // `async_trait` methods already return boxed local futures.
                start: Box::new(|instance_any| S::start(typed_handle::<S>(instance_any))),
                stop: Box::new(|instance_any| S::stop(typed_handle::<S>(instance_any))),
            },
            casts: HashMap::new(),
            provided: Vec::new(),
            declared,
            providers: HashMap::new(),
            dependents: BTreeSet::new(),
            pending_stop: None,
        }
    }

    pub(crate) fn new_injected<S: InjectedService>(info: ServiceInfo) -> Self {
        let mut declared = DependencyInfo::new();
        for dep in S::dependencies() {
            declared.add(dep);
        }

        Self {
            info,
            backing: ServiceBacking::Injected {
                instance: None,
                construct: Box::new(|resolved, props, ctx| {
                    let service = S::construct(resolved, props, ctx);
                    let handle: ServiceHandle<S> = Rc::new(RefCell::new(service));
                    Box::new(handle)
                }),
                resolved: ResolvedDependencies::new(),
            },
            casts: HashMap::new(),
            provided: Vec::new(),
            declared,
            providers: HashMap::new(),
            dependents: BTreeSet::new(),
            pending_stop: None,
        }
    }

    pub(crate) fn add_cast<S, I>(&mut self)
    where
        S: ProvideAs<I> + 'static,
        I: ?Sized + 'static,
    {
        let hash = InterfaceHash::of::<I>();
        self.casts.insert(hash, InterfaceCast::of::<S, I>());
        self.provided.push(hash);
    }

    pub(crate) fn id(&self) -> ServiceId {
        self.info.id
    }

    pub(crate) fn state(&self) -> ServiceState {
        self.info.state
    }

    pub(crate) fn transition(&mut self, to: ServiceState) -> Result<()> {
        let from = self.info.state;
        if !from.can_transition_to(to) {
            return Err(Error::state_transition(format!(
                "service {} ({}): {:?} -> {:?}",
                self.info.id, self.info.name, from, to
            )));
        }
        tracing::debug!(
            service = %self.info.id,
            name = self.info.name,
            ?from,
            ?to,
            "lifecycle transition"
        );
        self.info.state = to;
        Ok(())
    }

    /// View the instance through one of its provided interfaces.
    ///
    /// Returns `None` for unknown interfaces and for injected services that
    /// are not yet constructed.
    pub(crate) fn interface_instance(&self, interface: InterfaceHash) -> Option<Box<dyn Any>> {
        let cast = self.casts.get(&interface)?;
        let instance = match &self.backing {
            ServiceBacking::Advanced { instance, .. } => instance.as_ref(),
            ServiceBacking::Injected { instance, .. } => instance.as_ref()?.as_ref(),
        };
        Some((cast.cast)(instance))
    }

    /// Whether the declared edge for `interface` would accept `provider`.
    pub(crate) fn matches_edge(
        &self,
        interface: InterfaceHash,
        provider_properties: &Properties,
    ) -> bool {
        let Some(dep) = self.declared.find(interface) else {
            return false;
        };
        if !dep.accepts_more() {
            return false;
        }
        match &self.backing {
            ServiceBacking::Advanced { entries, .. } => entries
                .iter()
                .find(|entry| entry.dep.interface == interface)
                .map(|entry| {
                    entry
                        .filter
                        .as_ref()
                        .map(|filter| filter(provider_properties))
                        .unwrap_or(true)
                })
                .unwrap_or(false),
            ServiceBacking::Injected { .. } => true,
        }
    }

    /// Record a provider satisfying the edge for `interface` and hand the
    /// instance to the service.
    pub(crate) fn deliver(
        &mut self,
        interface: InterfaceHash,
        provider_info: &ServiceInfo,
        interface_instance: Box<dyn Any>,
    ) {
        match &mut self.backing {
            ServiceBacking::Advanced { instance, entries, .. } => {
                if let Some(entry) = entries
                    .iter()
                    .find(|entry| entry.dep.interface == interface)
                {
                    (entry.add)(
                        instance.as_ref(),
                        interface_instance.as_ref(),
                        provider_info,
                    );
                }
            }
            ServiceBacking::Injected { resolved, .. } => {
                resolved.insert(
                    interface,
                    ErasedInterface {
                        provider: provider_info.id,
                        instance: interface_instance,
                    },
                );
            }
        }
        if let Some(dep) = self.declared.find_mut(interface) {
            dep.satisfied += 1;
        }
        self.providers
            .entry(interface)
            .or_default()
            .insert(provider_info.id);
    }

    /// Withdraw a provider from the edge for `interface`, invoking the
    /// remove callback before decrementing the count.
    pub(crate) fn withdraw(
        &mut self,
        interface: InterfaceHash,
        provider_info: &ServiceInfo,
        interface_instance: Box<dyn Any>,
    ) {
        match &mut self.backing {
            ServiceBacking::Advanced { instance, entries, .. } => {
                if let Some(entry) = entries
                    .iter()
                    .find(|entry| entry.dep.interface == interface)
                {
                    (entry.remove)(
                        instance.as_ref(),
                        interface_instance.as_ref(),
                        provider_info,
                    );
                }
            }
            ServiceBacking::Injected { resolved, .. } => {
                resolved.remove_provider(provider_info.id);
            }
        }
        if let Some(dep) = self.declared.find_mut(interface) {
            dep.satisfied = dep.satisfied.saturating_sub(1);
            if dep.satisfied == 0 {
                dep.requested = false;
            }
        }
        if let Some(set) = self.providers.get_mut(&interface) {
            set.remove(&provider_info.id);
            if set.is_empty() {
                self.providers.remove(&interface);
            }
        }
    }

    /// Unsatisfied edges with no outstanding request event; marks them
    /// requested as a side effect.
    pub(crate) fn unrequested_edges(&mut self) -> Vec<InterfaceHash> {
        let mut pending = Vec::new();
        for dep in self.declared.iter_mut() {
            if dep.satisfied == 0 && !dep.requested {
                dep.requested = true;
                pending.push(dep.interface);
            }
        }
        pending
    }

    /// Whether this is a constructor-injected service with a live instance.
    pub(crate) fn is_constructed_injected(&self) -> bool {
        matches!(
            &self.backing,
            ServiceBacking::Injected {
                instance: Some(_),
                ..
            }
        )
    }

    /// Drop every satisfied edge (a destroyed injected instance releases its
    /// constructor parameters). Returns the providers that were released.
    pub(crate) fn release_all_edges(&mut self) -> Vec<ServiceId> {
        let mut released: BTreeSet<ServiceId> = BTreeSet::new();
        for set in self.providers.values() {
            released.extend(set.iter().copied());
        }
        self.providers.clear();
        for dep in self.declared.iter_mut() {
            dep.satisfied = 0;
            dep.requested = false;
        }
        if let ServiceBacking::Injected { resolved, .. } = &mut self.backing {
            *resolved = ResolvedDependencies::new();
        }
        released.into_iter().collect()
    }

    pub(crate) fn all_required_satisfied(&self) -> bool {
        self.declared.all_required_satisfied()
    }

    /// Build the instance of a constructor-injected service. No-op for
    /// advanced services and already-constructed instances.
    pub(crate) fn construct_injected(&mut self, ctx: ServiceContext) {
        if let ServiceBacking::Injected {
            instance,
            construct,
            resolved,
        } = &mut self.backing
        {
            if instance.is_none() {
                *instance = Some(construct(resolved, &self.info.properties, ctx));
            }
        }
    }

    pub(crate) fn has_instance(&self) -> bool {
        match &self.backing {
            ServiceBacking::Advanced { .. } => true,
            ServiceBacking::Injected { instance, .. } => instance.is_some(),
        }
    }

    /// Drop a constructor-injected instance (the service lost an edge).
    pub(crate) fn destroy_injected_instance(&mut self) {
        if let ServiceBacking::Injected { instance, .. } = &mut self.backing {
            *instance = None;
        }
    }

    pub(crate) fn start_future(
        &self,
    ) -> Option<LocalBoxFuture<'static, std::result::Result<(), StartError>>> {
        match &self.backing {
            ServiceBacking::Advanced { instance, start, .. } => Some(start(instance.as_ref())),
            ServiceBacking::Injected { .. } => None,
        }
    }

    pub(crate) fn stop_future(&self) -> Option<LocalBoxFuture<'static, ()>> {
        match &self.backing {
            ServiceBacking::Advanced { instance, stop, .. } => Some(stop(instance.as_ref())),
            ServiceBacking::Injected { .. } => None,
        }
    }

    /// Typed weak handle for service proxies.
    pub(crate) fn downgrade<S: 'static>(&self) -> Option<Weak<RefCell<S>>> {
        let instance = match &self.backing {
            ServiceBacking::Advanced { instance, .. } => instance.as_ref(),
            ServiceBacking::Injected { instance, .. } => instance.as_ref()?.as_ref(),
        };
        instance
            .downcast_ref::<ServiceHandle<S>>()
            .map(Rc::downgrade)
    }
}

fn typed_handle<S: 'static>(instance_any: &dyn Any) -> ServiceHandle<S> {
    match instance_any.downcast_ref::<ServiceHandle<S>>() {
        Some(handle) => Rc::clone(handle),
        // Unreachable by construction: the closure and the instance were
        // erased from the same S.
        None => unreachable!("lifecycle closure applied to foreign instance"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dependency::DependencyFlags;
    use crate::queue::EventQueue;
    use crate::types::QueueConfig;
    use uuid::Uuid;

    trait Beacon {
        fn ping(&self) -> u32;
    }

    struct BeaconImpl;

    impl Beacon for BeaconImpl {
        fn ping(&self) -> u32 {
            7
        }
    }

    impl AdvancedService for BeaconImpl {
        fn construct(
            _reg: &mut DependencyRegister<Self>,
            _props: &Properties,
            _ctx: ServiceContext,
        ) -> Self {
            BeaconImpl
        }
    }

    crate::provides!(BeaconImpl: dyn Beacon);

    struct Watcher {
        seen: Option<u32>,
    }

    impl AdvancedService for Watcher {
        fn construct(
            reg: &mut DependencyRegister<Self>,
            _props: &Properties,
            _ctx: ServiceContext,
        ) -> Self {
            reg.register::<dyn Beacon>(
                DependencyFlags::REQUIRED,
                |svc, beacon, _info| svc.seen = Some(beacon.borrow().ping()),
                |svc, _beacon, _info| svc.seen = None,
            );
            Watcher { seen: None }
        }
    }

    fn host_for<S: AdvancedService>(id: u64) -> LifecycleHost {
        let queue = EventQueue::new(QueueConfig::default());
        let info = ServiceInfo {
            id: ServiceId::from_raw(id),
            gid: Uuid::new_v4(),
            name: std::any::type_name::<S>(),
            priority: 1000,
            state: ServiceState::Installed,
            properties: Properties::new(),
        };
        let ctx = ServiceContext::new(queue, info.id, info.priority);
        LifecycleHost::new_advanced::<S>(info, ctx)
    }

    #[test]
    fn test_transition_validation() {
        let mut host = host_for::<BeaconImpl>(1);
        assert_eq!(host.state(), ServiceState::Installed);
        host.transition(ServiceState::Injecting).unwrap();
        host.transition(ServiceState::Starting).unwrap();
        host.transition(ServiceState::Active).unwrap();
        assert!(host.transition(ServiceState::Installed).is_err());
    }

    #[test]
    fn test_deliver_and_withdraw_round_trip() {
        let mut provider = host_for::<BeaconImpl>(1);
        provider.add_cast::<BeaconImpl, dyn Beacon>();
        let mut consumer = host_for::<Watcher>(2);

        let hash = InterfaceHash::of::<dyn Beacon>();
        assert!(consumer.matches_edge(hash, &provider.info.properties));
        assert!(!consumer.all_required_satisfied());

        let iface = provider.interface_instance(hash).unwrap();
        consumer.deliver(hash, &provider.info, iface);
        assert!(consumer.all_required_satisfied());
        let watcher = consumer.downgrade::<Watcher>().unwrap().upgrade().unwrap();
        assert_eq!(watcher.borrow().seen, Some(7));
        // A satisfied single-provider edge accepts no more.
        assert!(!consumer.matches_edge(hash, &provider.info.properties));

        let iface = provider.interface_instance(hash).unwrap();
        consumer.withdraw(hash, &provider.info, iface);
        assert!(!consumer.all_required_satisfied());
        assert_eq!(watcher.borrow().seen, None);
        assert!(consumer.providers.get(&hash).is_none());
    }

    #[test]
    fn test_interface_instance_unknown_interface() {
        let provider = host_for::<BeaconImpl>(1);
        assert!(provider
            .interface_instance(InterfaceHash::of::<dyn Beacon>())
            .is_none());
    }
}
