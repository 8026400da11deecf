//! # Axon Core - Service Container Runtime
//!
//! Single-process runtime managing the lifecycle of user-supplied services:
//! - Typed dependency injection (declared edges or constructor injection)
//! - Priority-ordered event queue with thread-safe producers and one
//!   cooperative consumer per loop
//! - Coroutine integration: tasks, awaitable events, continuations scheduled
//!   back through the queue
//! - Dynamic dependency trackers that synthesize providers on demand
//! - Cross-loop broadcast between sibling managers
//!
//! ## Architecture
//!
//! ```text
//!   producers (any thread)        one loop thread
//!        │  push(priority, evt)  ┌──────────────────────────────┐
//!        ▼                       │      DependencyManager       │
//!   ┌───────────┐   pop          │  ┌─────────┐  ┌───────────┐  │
//!   │ EventQueue│ ─────────────▶ │  │Lifecycle│  │ Handlers  │  │
//!   └───────────┘                │  │  Hosts  │  │Interceptors│ │
//!        ▲                       │  └─────────┘  │ Trackers  │  │
//!        │ ContinuableEvent      │  ┌─────────┐  └───────────┘  │
//!        └───────────────────────│──│Continuations│             │
//!                                │  └─────────┘                 │
//!                                └──────────────────────────────┘
//! ```
//!
//! A service reaches `Active` once every required dependency edge is
//! satisfied and its `start` coroutine completes; stopping cascades through
//! dependents before the provider's own `stop` runs.

// Enforce strict safety at compile time
#![deny(unsafe_code)]
#![warn(missing_debug_implementations)]
#![warn(rust_2018_idioms)]

// Re-export public API
pub mod channel;
pub mod coroutines;
pub mod dependency;
pub mod events;
pub mod manager;
pub mod queue;
pub mod service;
pub mod services;
pub mod types;

// Internal: per-service state machine, owned by the manager
mod lifecycle;

// Internal utilities
pub mod observability;

pub use channel::CommunicationChannel;
pub use coroutines::{
    AsyncAutoResetEvent, AsyncManualResetEvent, AsyncSingleThreadedMutex, Task,
};
pub use dependency::{Dependency, DependencyFlags, DependencyInfo, DependencyRegister};
pub use events::{
    Behaviour, Event, EventKind, EventView, INTERNAL_COROUTINE_EVENT_PRIORITY,
    INTERNAL_DEPENDENCY_EVENT_PRIORITY, INTERNAL_EVENT_PRIORITY,
    INTERNAL_INSERT_SERVICE_EVENT_PRIORITY, INTERNAL_STOP_SERVICE_EVENT_PRIORITY,
};
pub use manager::{
    get_thread_local_event_queue, get_thread_local_manager, DependencyManager, DependencyRequest,
    DependencyTrackerRegistration, EventHandlerRegistration, EventInterceptorRegistration,
    RuntimeMetrics, ServiceProxy,
};
pub use queue::{EventCompletion, EventQueue};
pub use service::{
    AdvancedService, InjectedService, Properties, ProvideAs, ResolvedDependencies, ServiceContext,
    ServiceHandle, ServiceInfo, ServiceState,
};
pub use types::{
    Config, Error, ObservabilityConfig, QueueConfig, Result, ServiceId, StartError, TaskCancelled,
};
