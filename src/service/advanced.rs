//! Advanced services: explicit dependency registration plus async start/stop.

use async_trait::async_trait;

use crate::dependency::DependencyRegister;
use crate::types::StartError;

use super::{Properties, ServiceContext, ServiceHandle};

/// A service that declares its dependency edges in its constructor and runs
/// coroutine-valued start/stop.
///
/// `start` runs once every required edge is satisfied; returning an error
/// puts the service back to `Installed` (retry is by event). `stop` runs
/// after the service's dependents have released it.
///
/// Lifecycle methods receive the shared handle; do not hold a `RefCell`
/// borrow of it across an `.await`.
#[async_trait(?Send)]
pub trait AdvancedService: 'static {
    /// Construct the instance, declaring dependency edges on `reg`.
    fn construct(
        reg: &mut DependencyRegister<Self>,
        props: &Properties,
        ctx: ServiceContext,
    ) -> Self
    where
        Self: Sized;

    async fn start(_this: ServiceHandle<Self>) -> Result<(), StartError>
    where
        Self: Sized,
    {
        Ok(())
    }

    async fn stop(_this: ServiceHandle<Self>)
    where
        Self: Sized,
    {
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    struct NoopService;

    impl AdvancedService for NoopService {
        fn construct(
            _reg: &mut DependencyRegister<Self>,
            _props: &Properties,
            _ctx: ServiceContext,
        ) -> Self {
            NoopService
        }
    }

    #[test]
    fn test_default_start_succeeds() {
        let handle: ServiceHandle<NoopService> = Rc::new(RefCell::new(NoopService));
        let result = futures::executor::block_on(NoopService::start(handle));
        assert!(result.is_ok());
    }
}
