//! Per-extension API handed to lifecycle hooks.
//!
//! An [`ExtensionApi`] is scoped to one extension handle: triggers it
//! registers are owned by that handle, and configuration reads/writes touch
//! only the `plugins.<id>` subtree. It holds the handle weakly so an API value
//! kept by the extension does not keep a removed handle alive.

use std::sync::{Arc, Weak};

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::{error, info, warn};

use super::handle::ExtensionHandle;
use crate::commands::model::{Command, HandlerError, Namespace, RegistrationId};
use crate::commands::registry::{CommandRegistry, RegistryError};
use crate::platform::config::{ConfigService, HostConfig};

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("extension {0} is no longer loaded")]
    Detached(String),

    #[error("configuration for {id} is invalid: {source}")]
    Configuration {
        id: String,
        source: serde_json::Error,
    },
}

impl From<ApiError> for HandlerError {
    fn from(e: ApiError) -> Self {
        let status = match &e {
            ApiError::Registry(RegistryError::InvalidTrigger(_)) => 400,
            ApiError::Registry(RegistryError::DuplicateTrigger { .. }) => 409,
            ApiError::Detached(_) | ApiError::Registry(RegistryError::ExtensionUnavailable { .. }) => 503,
            _ => 500,
        };
        HandlerError::with_status(e.to_string(), status)
    }
}

impl From<RegistryError> for HandlerError {
    fn from(e: RegistryError) -> Self {
        ApiError::from(e).into()
    }
}

#[derive(Clone)]
pub struct ExtensionApi {
    id: String,
    handle: Weak<ExtensionHandle>,
    registry: Arc<CommandRegistry>,
    config: Arc<ConfigService>,
}

impl ExtensionApi {
    pub(crate) fn new(
        handle: &Arc<ExtensionHandle>,
        registry: Arc<CommandRegistry>,
        config: Arc<ConfigService>,
    ) -> Self {
        Self {
            id: handle.id().to_string(),
            handle: Arc::downgrade(handle),
            registry,
            config,
        }
    }

    pub fn extension_id(&self) -> &str {
        &self.id
    }

    fn handle(&self) -> Result<Arc<ExtensionHandle>, ApiError> {
        self.handle.upgrade().ok_or_else(|| ApiError::Detached(self.id.clone()))
    }

    /// Register a trigger owned by this extension. An empty `team_id`
    /// registers it for every team.
    pub fn register_command(&self, command: Command) -> Result<RegistrationId, ApiError> {
        let handle = self.handle()?;
        let id = self.registry.register(
            &handle,
            command.namespace(),
            &command.trigger,
            command.metadata,
        )?;
        Ok(id)
    }

    /// Remove this extension's registration of `trigger` in `team_id`.
    /// Returns `false` when there was none.
    pub fn unregister_command(&self, team_id: &str, trigger: &str) -> bool {
        let Ok(handle) = self.handle() else {
            return false;
        };
        self.registry
            .unregister_trigger(&handle.source(), &Namespace::from_team_id(team_id), trigger)
            .is_some()
    }

    /// Deserialize this extension's configuration subtree. A missing subtree
    /// yields `T::default()`.
    pub fn load_configuration<T>(&self) -> Result<T, ApiError>
    where
        T: DeserializeOwned + Default,
    {
        let snapshot = self.config.config();
        match snapshot.plugin(&self.id) {
            None => Ok(T::default()),
            Some(value) => serde_json::from_value(value.clone()).map_err(|source| {
                ApiError::Configuration { id: self.id.clone(), source }
            }),
        }
    }

    /// Replace this extension's configuration subtree. Change listeners run
    /// before this returns; extension hooks they schedule run on their own tasks.
    pub fn save_configuration<T>(&self, value: &T) -> Result<(), ApiError>
    where
        T: Serialize,
    {
        let value = serde_json::to_value(value)
            .map_err(|source| ApiError::Configuration { id: self.id.clone(), source })?;
        self.config.save_plugin_config(&self.id, value);
        Ok(())
    }

    /// Current host configuration snapshot.
    pub fn host_config(&self) -> Arc<HostConfig> {
        self.config.config()
    }

    pub fn log_info(&self, message: &str) {
        info!(extension = %self.id, "{message}");
    }

    pub fn log_warn(&self, message: &str) {
        warn!(extension = %self.id, "{message}");
    }

    pub fn log_error(&self, message: &str) {
        error!(extension = %self.id, "{message}");
    }
}
