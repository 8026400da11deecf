//! Logging bundle: the `Logger` interface, stdout/null implementations, and
//! a factory that creates one logger per requesting service through a
//! dependency tracker.

use async_trait::async_trait;
use std::collections::HashMap;

use crate::dependency::DependencyRegister;
use crate::manager::{get_thread_local_manager, DependencyTrackerRegistration};
use crate::provides;
use crate::service::{AdvancedService, Properties, ServiceContext, ServiceHandle};
use crate::types::{ServiceId, StartError};

/// Severity threshold for a logger instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            LogLevel::Trace => "TRACE",
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        };
        f.write_str(label)
    }
}

/// Call-site metadata attached to each log record.
#[derive(Debug, Clone, Copy)]
pub struct LogOrigin<'a> {
    pub file: &'a str,
    pub line: u32,
    pub function: &'a str,
}

/// Logger contract consumed by services.
pub trait Logger: 'static {
    fn log(&mut self, level: LogLevel, origin: LogOrigin<'_>, message: &str);

    fn set_log_level(&mut self, level: LogLevel);

    fn log_level(&self) -> LogLevel;
}

fn level_from_properties(props: &Properties) -> LogLevel {
    match props.get("log.level").and_then(|v| v.as_str()) {
        Some("trace") => LogLevel::Trace,
        Some("debug") => LogLevel::Debug,
        Some("warn") => LogLevel::Warn,
        Some("error") => LogLevel::Error,
        _ => LogLevel::Info,
    }
}

/// Logger writing to stdout.
#[derive(Debug)]
pub struct CoutLogger {
    level: LogLevel,
    owner: Option<u64>,
}

impl Logger for CoutLogger {
    fn log(&mut self, level: LogLevel, origin: LogOrigin<'_>, message: &str) {
        if level < self.level {
            return;
        }
        match self.owner {
            Some(owner) => println!(
                "[{level}] [svc {owner}] {}:{} {}: {message}",
                origin.file, origin.line, origin.function
            ),
            None => println!(
                "[{level}] {}:{} {}: {message}",
                origin.file, origin.line, origin.function
            ),
        }
    }

    fn set_log_level(&mut self, level: LogLevel) {
        self.level = level;
    }

    fn log_level(&self) -> LogLevel {
        self.level
    }
}

impl AdvancedService for CoutLogger {
    fn construct(
        _reg: &mut DependencyRegister<Self>,
        props: &Properties,
        _ctx: ServiceContext,
    ) -> Self {
        CoutLogger {
            level: level_from_properties(props),
            owner: props.get("logger.owner").and_then(|v| v.as_u64()),
        }
    }
}

provides!(CoutLogger: dyn Logger);

/// Logger that discards everything.
#[derive(Debug)]
pub struct NullLogger {
    level: LogLevel,
}

impl Logger for NullLogger {
    fn log(&mut self, _level: LogLevel, _origin: LogOrigin<'_>, _message: &str) {}

    fn set_log_level(&mut self, level: LogLevel) {
        self.level = level;
    }

    fn log_level(&self) -> LogLevel {
        self.level
    }
}

impl AdvancedService for NullLogger {
    fn construct(
        _reg: &mut DependencyRegister<Self>,
        props: &Properties,
        _ctx: ServiceContext,
    ) -> Self {
        NullLogger {
            level: level_from_properties(props),
        }
    }
}

provides!(NullLogger: dyn Logger);

/// Creates one `CoutLogger` per service requesting `dyn Logger`, and tears
/// it down when the requester goes away.
///
/// The created logger carries a `logger.owner` property and the requester's
/// edge is expected to filter on it (see
/// [`owner_filter`](LoggerFactory::owner_filter)).
pub struct LoggerFactory {
    ctx: ServiceContext,
    created: ServiceHandle<HashMap<ServiceId, ServiceId>>,
    registration: Option<DependencyTrackerRegistration>,
}

impl LoggerFactory {
    /// Property predicate matching only the logger created for `requester`.
    pub fn owner_filter(requester: ServiceId) -> impl Fn(&Properties) -> bool {
        move |props| {
            props.get("logger.owner").and_then(|v| v.as_u64()) == Some(requester.as_u64())
        }
    }

    /// The logger created for `requester`, if any.
    pub fn logger_for(&self, requester: ServiceId) -> Option<ServiceId> {
        self.created.borrow().get(&requester).copied()
    }
}

impl std::fmt::Debug for LoggerFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoggerFactory")
            .field("service", &self.ctx.id())
            .field("created", &self.created.borrow().len())
            .finish()
    }
}

#[async_trait(?Send)]
impl AdvancedService for LoggerFactory {
    fn construct(
        _reg: &mut DependencyRegister<Self>,
        _props: &Properties,
        ctx: ServiceContext,
    ) -> Self {
        LoggerFactory {
            ctx,
            created: std::rc::Rc::new(std::cell::RefCell::new(HashMap::new())),
            registration: None,
        }
    }

    async fn start(this: ServiceHandle<Self>) -> Result<(), StartError> {
        let dm = get_thread_local_manager()
            .ok_or_else(|| StartError::new("no manager on this thread"))?;
        let (factory_id, created) = {
            let factory = this.borrow();
            (factory.ctx.id(), ServiceHandle::clone(&factory.created))
        };

        let created_on_request = ServiceHandle::clone(&created);
        let created_on_undo = created;
        let registration = dm.register_dependency_tracker::<dyn Logger>(
            factory_id,
            move |dm, request| {
                let mut created = created_on_request.borrow_mut();
                if created.contains_key(&request.requester) {
                    return;
                }
                let mut props = Properties::new();
                props.insert(
                    "logger.owner".to_string(),
                    serde_json::json!(request.requester.as_u64()),
                );
                match dm
                    .create_service_manager::<CoutLogger>(props)
                    .provides::<dyn Logger>()
                    .build()
                {
                    Ok(proxy) => {
                        created.insert(request.requester, proxy.id());
                    }
                    Err(error) => {
                        tracing::warn!(%error, requester = %request.requester, "logger creation failed");
                    }
                }
            },
            move |dm, request| {
                if let Some(logger) = created_on_undo.borrow_mut().remove(&request.requester) {
                    dm.event_queue().push_stop_service(logger, true);
                }
            },
        );
        this.borrow_mut().registration = Some(registration);
        Ok(())
    }

    async fn stop(this: ServiceHandle<Self>) {
        let (registration, created): (
            Option<DependencyTrackerRegistration>,
            Vec<ServiceId>,
        ) = {
            let mut factory = this.borrow_mut();
            let created = factory.created.borrow_mut().drain().map(|(_, v)| v).collect();
            (factory.registration.take(), created)
        };
        // Tear down every logger this factory still owns, then let the
        // dropped registration remove the tracker entry.
        if let Some(dm) = get_thread_local_manager() {
            for logger in created {
                dm.event_queue().push_stop_service(logger, true);
            }
        }
        drop(registration);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_threshold() {
        let mut logger = NullLogger {
            level: LogLevel::Info,
        };
        assert_eq!(logger.log_level(), LogLevel::Info);
        logger.set_log_level(LogLevel::Error);
        assert_eq!(logger.log_level(), LogLevel::Error);
        assert!(LogLevel::Warn < LogLevel::Error);
        assert!(LogLevel::Trace < LogLevel::Debug);
    }

    #[test]
    fn test_level_from_properties() {
        let mut props = Properties::new();
        assert_eq!(level_from_properties(&props), LogLevel::Info);
        props.insert("log.level".to_string(), serde_json::json!("trace"));
        assert_eq!(level_from_properties(&props), LogLevel::Trace);
    }

    #[test]
    fn test_owner_filter_matches_only_owner() {
        let filter = LoggerFactory::owner_filter(ServiceId::from_raw(7));
        let mut props = Properties::new();
        assert!(!filter(&props));
        props.insert("logger.owner".to_string(), serde_json::json!(7));
        assert!(filter(&props));
        props.insert("logger.owner".to_string(), serde_json::json!(8));
        assert!(!filter(&props));
    }
}
