//! Live configuration service with change listeners.
//!
//! Holds the current [`HostConfig`] snapshot behind an `Arc` so readers never
//! block writers for longer than a pointer swap. Every successful change is
//! fanned out to the registered listeners with the `(old, new)` pair.
//!
//! Listeners run on the caller's thread *after* the config lock is released.
//! A listener may therefore call back into the service (read, or even save)
//! without deadlocking; the lifecycle coordinator relies on this when a
//! command handler saves its own configuration.

use std::collections::BTreeMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use tracing::{debug, error};
use uuid::Uuid;

/// Snapshot of the host's live configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HostConfig {
    /// Display name of the site.
    pub site_name: String,
    /// Per-extension configuration subtrees, keyed by extension id.
    #[serde(default)]
    pub plugins: BTreeMap<String, serde_json::Value>,
}

impl HostConfig {
    /// Configuration subtree for one extension.
    pub fn plugin(&self, id: &str) -> Option<&serde_json::Value> {
        self.plugins.get(id)
    }

    /// `true` when the subtree for `id` differs between `self` and `other`.
    pub fn plugin_changed(&self, other: &HostConfig, id: &str) -> bool {
        self.plugin(id) != other.plugin(id)
    }
}

/// Callback invoked with `(old, new)` after each configuration change.
pub type ConfigListener = Arc<dyn Fn(&HostConfig, &HostConfig) + Send + Sync>;

/// Opaque id returned by [`ConfigService::add_listener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(Uuid);

impl std::fmt::Display for ListenerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Shared configuration service. Clone the `Arc`, not the service.
pub struct ConfigService {
    current: RwLock<Arc<HostConfig>>,
    listeners: Mutex<Vec<(ListenerId, ConfigListener)>>,
}

impl ConfigService {
    pub fn new(initial: HostConfig) -> Self {
        Self {
            current: RwLock::new(Arc::new(initial)),
            listeners: Mutex::new(Vec::new()),
        }
    }

    /// Current configuration snapshot.
    pub fn config(&self) -> Arc<HostConfig> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Register a change listener. Listeners are called in registration order.
    pub fn add_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&HostConfig, &HostConfig) + Send + Sync + 'static,
    {
        let id = ListenerId(Uuid::new_v4());
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, Arc::new(listener)));
        debug!(listener = %id, "config listener added");
        id
    }

    /// Remove a listener. Returns `false` when the id was not registered.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        before != listeners.len()
    }

    /// Apply `f` to a copy of the current config and publish the result.
    ///
    /// Returns the `(old, new)` pair. Listeners are not called when `f`
    /// leaves the config unchanged.
    pub fn update<F>(&self, f: F) -> (Arc<HostConfig>, Arc<HostConfig>)
    where
        F: FnOnce(&mut HostConfig),
    {
        let (old, new) = {
            let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
            let mut next = HostConfig::clone(&current);
            f(&mut next);
            let old = current.clone();
            *current = Arc::new(next);
            (old, current.clone())
        };
        self.notify(&old, &new);
        (old, new)
    }

    /// Replace the whole configuration.
    pub fn save(&self, new_config: HostConfig) -> (Arc<HostConfig>, Arc<HostConfig>) {
        self.update(move |cfg| *cfg = new_config)
    }

    /// Replace one extension's configuration subtree.
    pub fn save_plugin_config(
        &self,
        id: &str,
        value: serde_json::Value,
    ) -> (Arc<HostConfig>, Arc<HostConfig>) {
        let id = id.to_string();
        self.update(move |cfg| {
            cfg.plugins.insert(id, value);
        })
    }

    fn notify(&self, old: &HostConfig, new: &HostConfig) {
        if old == new {
            debug!("config unchanged, listeners skipped");
            return;
        }

        // Snapshot so listeners may add/remove listeners themselves.
        let listeners: Vec<(ListenerId, ConfigListener)> = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        for (id, listener) in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(old, new))).is_err() {
                error!(listener = %id, "config listener panicked");
            }
        }
    }
}
