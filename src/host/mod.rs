//! Host wiring — builds the registry, configuration service, lifecycle
//! coordinator and dispatcher, and runs the background components.
//!
//! Startup order:
//!   1. live configuration service seeded from the file config
//!   2. command registry
//!   3. lifecycle coordinator + worker
//!   4. dispatcher
//!   5. core command set
//!   6. background components (lifecycle worker, control loop)

pub mod console;
pub mod control;
pub mod runtime;

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::commands::registry::CommandRegistry;
use crate::commands::{Dispatcher, builtin};
use crate::config::Config;
use crate::error::AppError;
use crate::extensions::lifecycle::{LifecycleCoordinator, LifecycleWorker};
use crate::platform::config::ConfigService;
use crate::product::{
    CommandService, HooksService, ProductManifest, ProductRegistry, Service, Services,
};
use console::ConsoleChannel;
use control::{ControlHandle, ControlLoop};
use runtime::{Component, ComponentFuture, ComponentsHandle, spawn_components};

/// Buffer of the control request channel.
const CONTROL_BUFFER: usize = 32;

struct WorkerComponent(LifecycleWorker);

impl Component for WorkerComponent {
    fn id(&self) -> &str {
        "lifecycle"
    }

    fn run(self: Box<Self>, shutdown: CancellationToken) -> ComponentFuture {
        Box::pin(async move {
            self.0.run(shutdown).await;
            Ok(())
        })
    }
}

/// A running command host.
pub struct CommandHost {
    config: Config,
    config_service: Arc<ConfigService>,
    registry: Arc<CommandRegistry>,
    coordinator: Arc<LifecycleCoordinator>,
    dispatcher: Arc<Dispatcher>,
    control: ControlHandle,
    products: ProductRegistry,
    shutdown: CancellationToken,
    components: Option<ComponentsHandle>,
}

impl CommandHost {
    /// Build the host and start its background components. Must be called
    /// inside a Tokio runtime.
    pub async fn start(config: Config) -> Result<Self, AppError> {
        let shutdown = CancellationToken::new();

        let config_service = Arc::new(ConfigService::new(config.host_config()));
        let registry = Arc::new(CommandRegistry::new());
        let (coordinator, worker) = LifecycleCoordinator::new(
            registry.clone(),
            config_service.clone(),
            config.dispatch.hook_timeout,
        );
        let dispatcher = Arc::new(Dispatcher::new(
            registry.clone(),
            config.dispatch.timeout,
            coordinator.events(),
        ));

        let (control_loop, control) = ControlLoop::new(CONTROL_BUFFER, coordinator.clone());
        let background: Vec<Box<dyn Component>> =
            vec![Box::new(WorkerComponent(worker)), Box::new(control_loop)];
        let components = spawn_components(background, shutdown.clone());

        builtin::register_all(&coordinator)
            .await
            .map_err(|e| AppError::Lifecycle(e.to_string()))?;

        info!(
            host = %config.host_name,
            timeout_ms = config.dispatch.timeout.as_millis() as u64,
            hook_timeout_ms = config.dispatch.hook_timeout.as_millis() as u64,
            registrations = registry.len(),
            "command host started"
        );

        Ok(Self {
            config,
            config_service,
            registry,
            coordinator,
            dispatcher,
            control,
            products: ProductRegistry::default(),
            shutdown,
            components: Some(components),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn config_service(&self) -> &Arc<ConfigService> {
        &self.config_service
    }

    pub fn registry(&self) -> &Arc<CommandRegistry> {
        &self.registry
    }

    pub fn coordinator(&self) -> &Arc<LifecycleCoordinator> {
        &self.coordinator
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn control(&self) -> &ControlHandle {
        &self.control
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Services offered to products.
    pub fn services(&self) -> Services {
        Services::new()
            .with(Service::Hooks(Arc::new(HooksService::new(self.coordinator.clone()))))
            .with(Service::Config(self.config_service.clone()))
            .with(Service::Commands(Arc::new(CommandService::new(self.coordinator.clone()))))
    }

    /// Construct and start products. Replaces any previously loaded set.
    pub async fn load_products(
        &mut self,
        manifests: BTreeMap<String, ProductManifest>,
    ) -> Result<(), AppError> {
        let products = ProductRegistry::initialize(manifests, &self.services())
            .map_err(|e| AppError::Product(e.to_string()))?;
        products
            .start_all()
            .await
            .map_err(|e| AppError::Product(e.to_string()))?;
        self.products = products;
        Ok(())
    }

    /// Console channel bound to this host's dispatcher and control plane.
    pub fn console(&self) -> ConsoleChannel {
        ConsoleChannel::new(
            self.dispatcher.clone(),
            self.control.clone(),
            self.config.console.clone(),
        )
    }

    /// Resolve once shutdown was requested (Ctrl-C, `:quit`, component error).
    pub async fn wait(&self) {
        self.shutdown.cancelled().await;
    }

    /// Stop products, deactivate every extension, stop the components.
    pub async fn shutdown(mut self) -> Result<(), AppError> {
        self.products.stop_all().await;
        self.coordinator.shutdown().await;
        self.shutdown.cancel();
        if let Some(components) = self.components.take() {
            components.join().await?;
        }
        info!("command host stopped");
        Ok(())
    }
}
