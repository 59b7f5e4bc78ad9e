//! Products — in-process subsystems that plug into the host through services.
//!
//! A product is described by a [`ProductManifest`]: an initializer plus the
//! set of [`ServiceKey`]s it depends on. [`ProductRegistry::initialize`]
//! checks every dependency against the available [`Services`] before
//! constructing anything, then builds products in id order.
//!
//! Products contribute commands through [`services::HooksService`] (which
//! activates a product-tier extension handle) and
//! [`services::CommandService`].

pub mod services;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info};

use crate::extensions::api::ApiError;
use crate::extensions::lifecycle::LifecycleError;
use crate::platform::config::ConfigService;
pub use services::{CommandService, HooksService};

#[derive(Debug, Error)]
pub enum ProductError {
    #[error("product {product} depends on unavailable service {service}")]
    MissingDependency { product: String, service: ServiceKey },

    #[error("product {product} failed to initialize: {message}")]
    Initialization { product: String, message: String },

    #[error("product {product} failed to start: {message}")]
    Start { product: String, message: String },

    #[error("product {0} has no registered hooks")]
    NotRegistered(String),

    #[error("hooks for {expected} report extension id {actual}")]
    IdMismatch { expected: String, actual: String },

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    #[error(transparent)]
    Api(#[from] ApiError),
}

// ── Services ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceKey {
    Hooks,
    Config,
    Commands,
}

impl fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceKey::Hooks => write!(f, "hooks"),
            ServiceKey::Config => write!(f, "config"),
            ServiceKey::Commands => write!(f, "commands"),
        }
    }
}

#[derive(Clone)]
pub enum Service {
    Hooks(Arc<HooksService>),
    Config(Arc<ConfigService>),
    Commands(Arc<CommandService>),
}

impl Service {
    pub fn key(&self) -> ServiceKey {
        match self {
            Service::Hooks(_) => ServiceKey::Hooks,
            Service::Config(_) => ServiceKey::Config,
            Service::Commands(_) => ServiceKey::Commands,
        }
    }
}

/// Services the host offers to products, keyed by [`ServiceKey`].
#[derive(Clone, Default)]
pub struct Services {
    map: HashMap<ServiceKey, Service>,
}

impl Services {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, service: Service) -> Self {
        self.insert(service);
        self
    }

    pub fn insert(&mut self, service: Service) {
        self.map.insert(service.key(), service);
    }

    pub fn contains(&self, key: ServiceKey) -> bool {
        self.map.contains_key(&key)
    }

    pub fn hooks(&self) -> Option<Arc<HooksService>> {
        match self.map.get(&ServiceKey::Hooks) {
            Some(Service::Hooks(s)) => Some(s.clone()),
            _ => None,
        }
    }

    pub fn config(&self) -> Option<Arc<ConfigService>> {
        match self.map.get(&ServiceKey::Config) {
            Some(Service::Config(s)) => Some(s.clone()),
            _ => None,
        }
    }

    pub fn commands(&self) -> Option<Arc<CommandService>> {
        match self.map.get(&ServiceKey::Commands) {
            Some(Service::Commands(s)) => Some(s.clone()),
            _ => None,
        }
    }
}

// ── Product ───────────────────────────────────────────────────────────────────

pub type ProductFuture = Pin<Box<dyn Future<Output = Result<(), ProductError>> + Send + 'static>>;

/// An in-process product. `start` runs after every product is constructed.
pub trait Product: Send + Sync + 'static {
    fn start(self: Arc<Self>) -> ProductFuture;
    fn stop(self: Arc<Self>) -> ProductFuture;
}

/// Builds a product from the services it declared.
pub type ProductInitializer =
    Arc<dyn Fn(&Services) -> Result<Arc<dyn Product>, ProductError> + Send + Sync>;

#[derive(Clone)]
pub struct ProductManifest {
    pub initializer: ProductInitializer,
    pub dependencies: BTreeSet<ServiceKey>,
}

impl ProductManifest {
    pub fn new<F>(initializer: F) -> Self
    where
        F: Fn(&Services) -> Result<Arc<dyn Product>, ProductError> + Send + Sync + 'static,
    {
        Self { initializer: Arc::new(initializer), dependencies: BTreeSet::new() }
    }

    pub fn depends_on(mut self, key: ServiceKey) -> Self {
        self.dependencies.insert(key);
        self
    }
}

/// Constructed products, in initialization order.
#[derive(Default)]
pub struct ProductRegistry {
    products: Vec<(String, Arc<dyn Product>)>,
}

impl ProductRegistry {
    /// Check every manifest's dependencies, then construct products in
    /// ascending id order. Nothing is constructed if any dependency is missing.
    pub fn initialize(
        manifests: BTreeMap<String, ProductManifest>,
        services: &Services,
    ) -> Result<Self, ProductError> {
        for (id, manifest) in &manifests {
            if let Some(missing) = manifest.dependencies.iter().find(|k| !services.contains(**k)) {
                return Err(ProductError::MissingDependency {
                    product: id.clone(),
                    service: *missing,
                });
            }
        }

        let mut products = Vec::with_capacity(manifests.len());
        for (id, manifest) in manifests {
            let product = (manifest.initializer)(services)?;
            info!(product = %id, "product initialized");
            products.push((id, product));
        }
        Ok(Self { products })
    }

    pub fn ids(&self) -> Vec<&str> {
        self.products.iter().map(|(id, _)| id.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.products.len()
    }

    pub fn is_empty(&self) -> bool {
        self.products.is_empty()
    }

    /// Start products in initialization order, stopping at the first failure.
    pub async fn start_all(&self) -> Result<(), ProductError> {
        for (id, product) in &self.products {
            product.clone().start().await?;
            info!(product = %id, "product started");
        }
        Ok(())
    }

    /// Stop products in reverse order. Failures are logged, not returned.
    pub async fn stop_all(&self) {
        for (id, product) in self.products.iter().rev() {
            match product.clone().stop().await {
                Ok(()) => info!(product = %id, "product stopped"),
                Err(e) => error!(product = %id, error = %e, "product stop failed"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::config::HostConfig;
    use std::sync::Mutex;

    struct Recorder {
        id: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl Product for Recorder {
        fn start(self: Arc<Self>) -> ProductFuture {
            Box::pin(async move {
                self.log.lock().unwrap().push(format!("start:{}", self.id));
                Ok(())
            })
        }

        fn stop(self: Arc<Self>) -> ProductFuture {
            Box::pin(async move {
                self.log.lock().unwrap().push(format!("stop:{}", self.id));
                Ok(())
            })
        }
    }

    fn manifest(id: &'static str, log: &Arc<Mutex<Vec<String>>>) -> ProductManifest {
        let log = log.clone();
        ProductManifest::new(move |_services| {
            log.lock().unwrap().push(format!("init:{id}"));
            Ok(Arc::new(Recorder { id, log: log.clone() }) as Arc<dyn Product>)
        })
    }

    fn config_services() -> Services {
        Services::new().with(Service::Config(Arc::new(ConfigService::new(HostConfig::default()))))
    }

    #[tokio::test]
    async fn products_run_in_id_order_and_stop_in_reverse() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut manifests = BTreeMap::new();
        manifests.insert("playbooks".to_string(), manifest("playbooks", &log));
        manifests.insert("boards".to_string(), manifest("boards", &log).depends_on(ServiceKey::Config));

        let registry = ProductRegistry::initialize(manifests, &config_services()).unwrap();
        assert_eq!(registry.ids(), ["boards", "playbooks"]);
        registry.start_all().await.unwrap();
        registry.stop_all().await;

        assert_eq!(
            *log.lock().unwrap(),
            [
                "init:boards",
                "init:playbooks",
                "start:boards",
                "start:playbooks",
                "stop:playbooks",
                "stop:boards",
            ]
        );
    }

    #[test]
    fn missing_dependency_constructs_nothing() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut manifests = BTreeMap::new();
        manifests.insert("a".to_string(), manifest("a", &log));
        manifests.insert("b".to_string(), manifest("b", &log).depends_on(ServiceKey::Hooks));

        let err = ProductRegistry::initialize(manifests, &config_services())
            .err()
            .expect("missing hooks service");
        assert!(matches!(
            err,
            ProductError::MissingDependency { ref product, service: ServiceKey::Hooks } if product == "b"
        ));
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn typed_lookup_matches_key() {
        let services = config_services();
        assert!(services.config().is_some());
        assert!(services.hooks().is_none());
        assert!(services.contains(ServiceKey::Config));
    }
}
