//! Cross-loop broadcast bus.
//!
//! Sibling dependency managers running on different threads register here;
//! broadcasting pushes a clone of the payload into every peer queue except
//! the originator's. There is no reply channel; correlate by event id chosen
//! by the sender.

use parking_lot::RwLock;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::manager::DependencyManager;
use crate::queue::EventQueue;
use crate::types::{Error, EventId, ManagerId, Result, ServiceId};

/// Broadcast bus between event loops. Cheap to clone; thread-safe.
#[derive(Clone, Default)]
pub struct CommunicationChannel {
    peers: Arc<RwLock<HashMap<ManagerId, EventQueue>>>,
}

impl CommunicationChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a manager. Must be called from the manager's own thread.
    pub fn add_manager(&self, dm: &DependencyManager) {
        self.peers.write().insert(dm.id(), dm.event_queue().clone());
        dm.set_channel(Some(self.clone()));
    }

    /// Deregister a manager. Must be called from the manager's own thread.
    pub fn remove_manager(&self, dm: &DependencyManager) {
        self.peers.write().remove(&dm.id());
        dm.set_channel(None);
    }

    pub fn peer_count(&self) -> usize {
        self.peers.read().len()
    }

    /// Push a clone of `payload` into every peer queue except the
    /// originator's. Returns the number of peers reached.
    pub fn broadcast_event<E: Clone + Any + Send + Sync>(
        &self,
        origin: &DependencyManager,
        origin_service: ServiceId,
        priority: u64,
        payload: E,
    ) -> usize {
        let peers = self.peers.read();
        let mut reached = 0;
        for (id, queue) in peers.iter() {
            if *id == origin.id() {
                continue;
            }
            queue.push_prioritised_event(origin_service, priority, payload.clone());
            reached += 1;
        }
        reached
    }

    /// Request shutdown of every peer loop except the originator's.
    pub fn broadcast_quit(&self, origin: &DependencyManager) -> usize {
        let peers = self.peers.read();
        let mut reached = 0;
        for (id, queue) in peers.iter() {
            if *id == origin.id() {
                continue;
            }
            queue.quit();
            reached += 1;
        }
        reached
    }

    /// Push a payload into one specific peer queue.
    pub fn send_event_to<E: Any + Send + Sync>(
        &self,
        target: ManagerId,
        origin_service: ServiceId,
        priority: u64,
        payload: E,
    ) -> Result<EventId> {
        let peers = self.peers.read();
        let queue = peers
            .get(&target)
            .ok_or_else(|| Error::not_found(format!("manager {target}")))?;
        Ok(queue.push_prioritised_event(origin_service, priority, payload))
    }
}

impl fmt::Debug for CommunicationChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommunicationChannel")
            .field("peers", &self.peer_count())
            .finish()
    }
}
