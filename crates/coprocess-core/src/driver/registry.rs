use std::collections::HashMap;
use std::sync::Arc;

use coprocess_proto::Object;

use super::{DriverDispatcher, DriverError, GrpcDispatcher, MiddlewareDriver};
use crate::config::CoProcessOptions;

/// Loaded coprocess drivers, keyed by middleware driver.
#[derive(Clone, Default)]
pub struct DriverRegistry {
    enabled: bool,
    drivers: HashMap<MiddlewareDriver, Arc<dyn DriverDispatcher>>,
}

impl DriverRegistry {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            drivers: HashMap::new(),
        }
    }

    /// Loads the drivers configured in `options`. Load failures are logged
    /// and leave the driver unloaded.
    pub fn init(options: &CoProcessOptions) -> Self {
        let mut registry = Self::new(options.enable_coprocess);
        if !options.enable_coprocess {
            tracing::info!(target: "coprocess", "Rich plugins are disabled");
            return registry;
        }
        if !options.coprocess_grpc_server.is_empty() {
            match GrpcDispatcher::connect_lazy(options) {
                Ok(dispatcher) => {
                    registry.register(MiddlewareDriver::Grpc, Arc::new(dispatcher));
                    tracing::info!(target: "coprocess", "gRPC dispatcher was initialized");
                }
                Err(err) => {
                    tracing::error!(target: "coprocess", error = %err, "Couldn't load gRPC dispatcher");
                }
            }
        }
        registry
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn register(&mut self, driver: MiddlewareDriver, dispatcher: Arc<dyn DriverDispatcher>) {
        self.drivers.insert(driver, dispatcher);
    }

    pub fn get(&self, driver: MiddlewareDriver) -> Option<Arc<dyn DriverDispatcher>> {
        self.drivers.get(&driver).cloned()
    }

    /// Checks whether middleware using `driver` can run.
    pub fn enabled_for(&self, driver: MiddlewareDriver) -> Result<(), DriverError> {
        if !self.enabled {
            return Err(DriverError::Disabled);
        }
        if !driver.is_coprocess() {
            return Err(DriverError::Unsupported(driver));
        }
        if !self.drivers.contains_key(&driver) {
            return Err(DriverError::NotLoaded(driver));
        }
        Ok(())
    }

    /// Only the python driver supports reloading.
    pub fn reload(&self) {
        tracing::info!(target: "coprocess", "Reloading middlewares");
        if let Some(dispatcher) = self.drivers.get(&MiddlewareDriver::Python) {
            dispatcher.reload();
        }
    }

    pub async fn dispatch(
        &self,
        driver: MiddlewareDriver,
        object: Object,
    ) -> Result<Object, DriverError> {
        let dispatcher = self.get(driver).ok_or(DriverError::Unavailable(driver))?;
        dispatcher.dispatch(object).await
    }

    pub async fn dispatch_event(
        &self,
        driver: MiddlewareDriver,
        payload: String,
    ) -> Result<(), DriverError> {
        let dispatcher = self.get(driver).ok_or(DriverError::Unavailable(driver))?;
        dispatcher.dispatch_event(payload).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingDispatcher {
        dispatches: AtomicUsize,
        reloads: AtomicUsize,
    }

    #[tonic::async_trait]
    impl DriverDispatcher for CountingDispatcher {
        async fn dispatch(&self, mut object: Object) -> Result<Object, DriverError> {
            self.dispatches.fetch_add(1, Ordering::SeqCst);
            object.hook_name.push_str("-seen");
            Ok(object)
        }

        async fn dispatch_event(&self, _payload: String) -> Result<(), DriverError> {
            Ok(())
        }

        fn reload(&self) {
            self.reloads.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn disabled_registry_rejects_every_driver() {
        let registry = DriverRegistry::init(&CoProcessOptions::default());
        assert!(!registry.is_enabled());
        assert!(matches!(
            registry.enabled_for(MiddlewareDriver::Grpc),
            Err(DriverError::Disabled)
        ));
    }

    #[test]
    fn enabled_for_distinguishes_unsupported_and_unloaded() {
        let mut registry = DriverRegistry::new(true);
        registry.register(MiddlewareDriver::Python, Arc::new(CountingDispatcher::default()));

        assert!(registry.enabled_for(MiddlewareDriver::Python).is_ok());
        assert!(matches!(
            registry.enabled_for(MiddlewareDriver::Otto),
            Err(DriverError::Unsupported(MiddlewareDriver::Otto))
        ));
        assert!(matches!(
            registry.enabled_for(MiddlewareDriver::Grpc),
            Err(DriverError::NotLoaded(MiddlewareDriver::Grpc))
        ));
    }

    #[tokio::test]
    async fn init_loads_grpc_driver_when_server_configured() {
        let registry = DriverRegistry::init(&CoProcessOptions {
            enable_coprocess: true,
            coprocess_grpc_server: "tcp://127.0.0.1:5555".to_string(),
            ..Default::default()
        });
        assert!(registry.enabled_for(MiddlewareDriver::Grpc).is_ok());
    }

    #[tokio::test]
    async fn init_leaves_driver_unloaded_on_bad_target() {
        let registry = DriverRegistry::init(&CoProcessOptions {
            enable_coprocess: true,
            coprocess_grpc_server: "unix:///tmp/coprocess.sock".to_string(),
            ..Default::default()
        });
        assert!(registry.is_enabled());
        assert!(registry.get(MiddlewareDriver::Grpc).is_none());
    }

    #[tokio::test]
    async fn dispatch_uses_registered_driver() {
        let dispatcher = Arc::new(CountingDispatcher::default());
        let mut registry = DriverRegistry::new(true);
        registry.register(MiddlewareDriver::Python, dispatcher.clone());

        let object = registry
            .dispatch(
                MiddlewareDriver::Python,
                Object {
                    hook_name: "hook".to_string(),
                    ..Default::default()
                },
            )
            .await
            .expect("dispatch");
        assert_eq!(object.hook_name, "hook-seen");
        assert_eq!(dispatcher.dispatches.load(Ordering::SeqCst), 1);

        let err = registry
            .dispatch(MiddlewareDriver::Lua, Object::default())
            .await
            .expect_err("missing driver");
        assert_eq!(
            err.to_string(),
            "Couldn't dispatch request, driver 'lua' isn't available"
        );
    }

    #[test]
    fn reload_only_touches_python_driver() {
        let python = Arc::new(CountingDispatcher::default());
        let grpc = Arc::new(CountingDispatcher::default());
        let mut registry = DriverRegistry::new(true);
        registry.register(MiddlewareDriver::Python, python.clone());
        registry.register(MiddlewareDriver::Grpc, grpc.clone());

        registry.reload();
        assert_eq!(python.reloads.load(Ordering::SeqCst), 1);
        assert_eq!(grpc.reloads.load(Ordering::SeqCst), 0);
    }
}
