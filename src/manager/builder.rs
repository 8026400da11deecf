//! Service creation builders and the non-owning service proxy.

use std::cell::RefCell;
use std::fmt;
use std::marker::PhantomData;
use std::rc::{Rc, Weak};
use uuid::Uuid;

use crate::events::INTERNAL_EVENT_PRIORITY;
use crate::lifecycle::LifecycleHost;
use crate::service::{AdvancedService, InjectedService, Properties, ProvideAs};
use crate::types::{Result, ServiceId};

use super::DependencyManager;

pub(crate) type CastRegistrar = Box<dyn FnOnce(&mut LifecycleHost)>;

/// Builder returned by
/// [`DependencyManager::create_service_manager`](super::DependencyManager::create_service_manager).
///
/// Declare the provided interfaces, then `build()` to allocate the id and
/// schedule insertion.
pub struct AdvancedServiceBuilder<'a, S: AdvancedService> {
    pub(crate) dm: &'a DependencyManager,
    pub(crate) properties: Properties,
    pub(crate) priority: u64,
    pub(crate) casts: Vec<CastRegistrar>,
    pub(crate) _marker: PhantomData<fn(S)>,
}

impl<S: AdvancedService> AdvancedServiceBuilder<'_, S> {
    /// Default priority for events this service pushes.
    pub fn with_priority(mut self, priority: u64) -> Self {
        self.priority = priority;
        self
    }

    /// Declare that the service provides interface `I`.
    pub fn provides<I: ?Sized + 'static>(mut self) -> Self
    where
        S: ProvideAs<I>,
    {
        self.casts.push(Box::new(|host| host.add_cast::<S, I>()));
        self
    }

    /// Allocate the service id, run the constructor, and schedule insertion
    /// at the insert priority. Fails when a required edge would close a
    /// dependency cycle.
    pub fn build(self) -> Result<ServiceProxy<S>> {
        self.dm
            .install_advanced::<S>(self.properties, self.priority, self.casts)
    }
}

impl<S: AdvancedService> fmt::Debug for AdvancedServiceBuilder<'_, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdvancedServiceBuilder")
            .field("service", &std::any::type_name::<S>())
            .field("priority", &self.priority)
            .finish()
    }
}

/// Builder returned by
/// [`DependencyManager::create_injected_service_manager`](super::DependencyManager::create_injected_service_manager).
pub struct InjectedServiceBuilder<'a, S: InjectedService> {
    pub(crate) dm: &'a DependencyManager,
    pub(crate) properties: Properties,
    pub(crate) priority: u64,
    pub(crate) casts: Vec<CastRegistrar>,
    pub(crate) _marker: PhantomData<fn(S)>,
}

impl<S: InjectedService> InjectedServiceBuilder<'_, S> {
    pub fn with_priority(mut self, priority: u64) -> Self {
        self.priority = priority;
        self
    }

    pub fn provides<I: ?Sized + 'static>(mut self) -> Self
    where
        S: ProvideAs<I>,
    {
        self.casts.push(Box::new(|host| host.add_cast::<S, I>()));
        self
    }

    pub fn build(self) -> Result<ServiceProxy<S>> {
        self.dm
            .install_injected::<S>(self.properties, self.priority, self.casts)
    }
}

impl<S: InjectedService> fmt::Debug for InjectedServiceBuilder<'_, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InjectedServiceBuilder")
            .field("service", &std::any::type_name::<S>())
            .field("priority", &self.priority)
            .finish()
    }
}

pub(crate) fn default_builder_priority() -> u64 {
    INTERNAL_EVENT_PRIORITY
}

/// Non-owning view of a created service.
///
/// Only the id is stable; the instance handle is weak and degrades once the
/// service is destroyed. Constructor-injected proxies never carry an
/// instance handle (the instance is built later, on demand).
pub struct ServiceProxy<S> {
    pub(crate) id: ServiceId,
    pub(crate) gid: Uuid,
    pub(crate) instance: Option<Weak<RefCell<S>>>,
}

impl<S> ServiceProxy<S> {
    pub fn id(&self) -> ServiceId {
        self.id
    }

    pub fn gid(&self) -> Uuid {
        self.gid
    }

    /// Upgrade to the live instance, if the service still exists.
    pub fn get(&self) -> Option<Rc<RefCell<S>>> {
        self.instance.as_ref()?.upgrade()
    }
}

impl<S> Clone for ServiceProxy<S> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            gid: self.gid,
            instance: self.instance.clone(),
        }
    }
}

impl<S> fmt::Debug for ServiceProxy<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceProxy")
            .field("id", &self.id)
            .field("gid", &self.gid)
            .field("live", &self.get().is_some())
            .finish()
    }
}
