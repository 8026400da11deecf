//! RAII registration tokens.
//!
//! Dropping a token pushes the matching remove event at the registration's
//! priority; the table entry disappears when that event is processed.
//! Registrations are also removed automatically when their owning service
//! stops.

use crate::events::EventKind;
use crate::queue::EventQueue;
use crate::types::{EventTypeHash, InterceptorId, InterfaceHash, ServiceId};

/// Token for a registered event handler.
#[derive(Debug)]
pub struct EventHandlerRegistration {
    pub(crate) queue: EventQueue,
    pub(crate) service: ServiceId,
    pub(crate) event_type: EventTypeHash,
    pub(crate) priority: u64,
}

impl EventHandlerRegistration {
    pub fn service(&self) -> ServiceId {
        self.service
    }

    pub fn event_type(&self) -> EventTypeHash {
        self.event_type
    }
}

impl Drop for EventHandlerRegistration {
    fn drop(&mut self) {
        self.queue.push_kind(
            self.service,
            self.priority,
            EventKind::RemoveHandler {
                service: self.service,
                event_type: self.event_type,
            },
        );
    }
}

/// Token for a registered event interceptor.
#[derive(Debug)]
pub struct EventInterceptorRegistration {
    pub(crate) queue: EventQueue,
    pub(crate) service: ServiceId,
    pub(crate) interceptor: InterceptorId,
    pub(crate) priority: u64,
}

impl EventInterceptorRegistration {
    pub fn service(&self) -> ServiceId {
        self.service
    }
}

impl Drop for EventInterceptorRegistration {
    fn drop(&mut self) {
        self.queue.push_kind(
            self.service,
            self.priority,
            EventKind::RemoveInterceptor {
                service: self.service,
                interceptor: self.interceptor,
            },
        );
    }
}

/// Token for a registered dependency tracker.
#[derive(Debug)]
pub struct DependencyTrackerRegistration {
    pub(crate) queue: EventQueue,
    pub(crate) service: ServiceId,
    pub(crate) interface: InterfaceHash,
    pub(crate) priority: u64,
}

impl DependencyTrackerRegistration {
    pub fn service(&self) -> ServiceId {
        self.service
    }

    pub fn interface(&self) -> InterfaceHash {
        self.interface
    }
}

impl Drop for DependencyTrackerRegistration {
    fn drop(&mut self) {
        self.queue.push_kind(
            self.service,
            self.priority,
            EventKind::RemoveTracker {
                service: self.service,
                interface: self.interface,
            },
        );
    }
}
