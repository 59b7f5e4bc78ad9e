//! Host services handed to products.

use std::sync::Arc;

use tracing::debug;

use super::ProductError;
use crate::commands::model::{Command, RegistrationId};
use crate::extensions::handle::ExtensionHandle;
use crate::extensions::lifecycle::LifecycleCoordinator;
use crate::extensions::{Extension, ExtensionKind};

/// Registers a product's hook implementation as a product-tier extension.
pub struct HooksService {
    coordinator: Arc<LifecycleCoordinator>,
}

impl HooksService {
    pub fn new(coordinator: Arc<LifecycleCoordinator>) -> Self {
        Self { coordinator }
    }

    /// Activate `hooks` under `product_id`. The extension must report the
    /// same id.
    pub async fn register_hooks(
        &self,
        product_id: &str,
        hooks: Arc<dyn Extension>,
    ) -> Result<Arc<ExtensionHandle>, ProductError> {
        if hooks.id() != product_id {
            return Err(ProductError::IdMismatch {
                expected: product_id.to_string(),
                actual: hooks.id().to_string(),
            });
        }
        let handle = self.coordinator.register_product(hooks).await?;
        debug!(product = %product_id, "product hooks registered");
        Ok(handle)
    }
}

/// Lets a product register commands outside its own hooks.
pub struct CommandService {
    coordinator: Arc<LifecycleCoordinator>,
}

impl CommandService {
    pub fn new(coordinator: Arc<LifecycleCoordinator>) -> Self {
        Self { coordinator }
    }

    fn product_handle(&self, product_id: &str) -> Result<Arc<ExtensionHandle>, ProductError> {
        self.coordinator
            .handle(product_id)
            .filter(|h| h.kind() == ExtensionKind::Product)
            .ok_or_else(|| ProductError::NotRegistered(product_id.to_string()))
    }

    /// Register `command` served by the product's hooks.
    pub fn register_product_command(
        &self,
        product_id: &str,
        command: Command,
    ) -> Result<RegistrationId, ProductError> {
        let handle = self.product_handle(product_id)?;
        let id = self.coordinator.api_for(&handle).register_command(command)?;
        Ok(id)
    }

    pub fn unregister_product_command(
        &self,
        product_id: &str,
        team_id: &str,
        trigger: &str,
    ) -> Result<bool, ProductError> {
        let handle = self.product_handle(product_id)?;
        Ok(self.coordinator.api_for(&handle).unregister_command(team_id, trigger))
    }
}
