//! Lifecycle coordinator — activation, deactivation, crash cleanup and
//! configuration fan-out for extension handles.
//!
//! # Ownership
//!
//! The coordinator owns the `id → handle` table. Registrations and in-flight
//! dispatches hold `Arc` clones of a handle; removing a handle from the table
//! only prevents future resolution, it never cancels a running call.
//!
//! # Crash cleanup
//!
//! Faults are detected where they happen (dispatcher, hook tasks), which mark
//! the handle `Crashed` and push a [`LifecycleEvent::Crashed`] onto an
//! unbounded queue. [`LifecycleWorker`] drains that queue and revokes the
//! handle's registrations. Detection never waits for cleanup;
//! [`LifecycleCoordinator::settle`] waits for every event queued before it.
//!
//! # Configuration changes
//!
//! The coordinator listens on the [`ConfigService`]. Each change spawns one
//! task per interested extension, so a slow or crashing hook delays nobody and
//! a handler that saves its own configuration never waits on itself.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::api::ExtensionApi;
use super::handle::{CallError, ExtensionHandle, ExtensionState, InvalidTransition};
use super::{Capabilities, Extension, ExtensionKind, HookFuture};
use crate::commands::registry::{CommandRegistry, RegistryError};
use crate::platform::config::{ConfigService, HostConfig, ListenerId};

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LifecycleError {
    #[error("extension {0} is already active")]
    AlreadyActive(String),

    #[error("extension {0} not found")]
    NotFound(String),

    #[error("extension {id}: {source}")]
    InvalidTransition {
        id: String,
        source: InvalidTransition,
    },

    #[error("extension {id} failed to activate: {message}")]
    ActivationFailed { id: String, message: String },

    #[error("extension {id} crashed during activation: {reason}")]
    ActivationCrashed { id: String, reason: String },

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

// ── Events ────────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum LifecycleEvent {
    /// A handle was marked `Crashed`; revoke and forget it.
    Crashed(Arc<ExtensionHandle>),
    /// Reply once every earlier event has been processed.
    Barrier(oneshot::Sender<()>),
}

/// Sending side of the lifecycle queue. Never blocks.
#[derive(Clone)]
pub struct LifecycleEvents {
    tx: mpsc::UnboundedSender<LifecycleEvent>,
}

impl LifecycleEvents {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<LifecycleEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub(crate) fn crashed(&self, handle: Arc<ExtensionHandle>) {
        let id = handle.id().to_string();
        if self.tx.send(LifecycleEvent::Crashed(handle)).is_err() {
            debug!(extension = %id, "lifecycle worker stopped, crash cleanup dropped");
        }
    }

    fn barrier(&self) -> Option<oneshot::Receiver<()>> {
        let (tx, rx) = oneshot::channel();
        self.tx.send(LifecycleEvent::Barrier(tx)).ok()?;
        Some(rx)
    }
}

// ── ExtensionInfo ─────────────────────────────────────────────────────────────

/// Point-in-time view of one extension, for status output.
#[derive(Debug, Clone, Serialize)]
pub struct ExtensionInfo {
    pub id: String,
    pub kind: ExtensionKind,
    pub state: ExtensionState,
    pub capabilities: Capabilities,
    pub registrations: usize,
    pub in_flight: usize,
}

// ── LifecycleCoordinator ──────────────────────────────────────────────────────

pub struct LifecycleCoordinator {
    registry: Arc<CommandRegistry>,
    config: Arc<ConfigService>,
    handles: Mutex<HashMap<String, Arc<ExtensionHandle>>>,
    events: LifecycleEvents,
    hook_timeout: Duration,
    runtime: Option<tokio::runtime::Handle>,
    listener: Mutex<Option<ListenerId>>,
}

impl LifecycleCoordinator {
    /// Build the coordinator and its cleanup worker, and subscribe to
    /// configuration changes. The worker must be run for crash cleanup and
    /// [`settle`](Self::settle) to make progress.
    pub fn new(
        registry: Arc<CommandRegistry>,
        config: Arc<ConfigService>,
        hook_timeout: Duration,
    ) -> (Arc<Self>, LifecycleWorker) {
        let (events, rx) = LifecycleEvents::channel();
        let coordinator = Arc::new(Self {
            registry,
            config: config.clone(),
            handles: Mutex::new(HashMap::new()),
            events,
            hook_timeout,
            runtime: tokio::runtime::Handle::try_current().ok(),
            listener: Mutex::new(None),
        });

        let weak = Arc::downgrade(&coordinator);
        let listener = config.add_listener(move |old, new| {
            if let Some(coordinator) = weak.upgrade() {
                coordinator.on_configuration_changed(old, new);
            }
        });
        *coordinator.listener.lock().unwrap_or_else(PoisonError::into_inner) = Some(listener);

        let worker = LifecycleWorker { coordinator: coordinator.clone(), rx };
        (coordinator, worker)
    }

    fn table(&self) -> MutexGuard<'_, HashMap<String, Arc<ExtensionHandle>>> {
        self.handles.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn registry(&self) -> &Arc<CommandRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &Arc<ConfigService> {
        &self.config
    }

    /// Sender the dispatcher reports crashes on.
    pub fn events(&self) -> LifecycleEvents {
        self.events.clone()
    }

    pub fn handle(&self, id: &str) -> Option<Arc<ExtensionHandle>> {
        self.table().get(id).cloned()
    }

    /// API object scoped to `handle`.
    pub fn api_for(&self, handle: &Arc<ExtensionHandle>) -> ExtensionApi {
        ExtensionApi::new(handle, self.registry.clone(), self.config.clone())
    }

    /// Snapshot of every known extension, sorted by id.
    pub fn extensions(&self) -> Vec<ExtensionInfo> {
        let handles: Vec<Arc<ExtensionHandle>> = self.table().values().cloned().collect();
        let mut infos: Vec<ExtensionInfo> = handles
            .iter()
            .map(|h| ExtensionInfo {
                id: h.id().to_string(),
                kind: h.kind(),
                state: h.state(),
                capabilities: h.capabilities(),
                registrations: self.registry.count_for_handle(h),
                in_flight: h.in_flight(),
            })
            .collect();
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }

    pub async fn activate_plugin(
        &self,
        extension: Arc<dyn Extension>,
    ) -> Result<Arc<ExtensionHandle>, LifecycleError> {
        self.activate(ExtensionKind::Plugin, extension).await
    }

    pub async fn register_product(
        &self,
        extension: Arc<dyn Extension>,
    ) -> Result<Arc<ExtensionHandle>, LifecycleError> {
        self.activate(ExtensionKind::Product, extension).await
    }

    /// Create a handle for `extension`, deliver its initial configuration,
    /// run `on_activate`, and make it `Active`.
    pub async fn activate(
        &self,
        kind: ExtensionKind,
        extension: Arc<dyn Extension>,
    ) -> Result<Arc<ExtensionHandle>, LifecycleError> {
        let handle = ExtensionHandle::new(kind, extension);
        let id = handle.id().to_string();

        let stale = {
            let mut table = self.table();
            if let Some(existing) = table.get(&id)
                && matches!(
                    existing.state(),
                    ExtensionState::Activating | ExtensionState::Active | ExtensionState::Deactivating
                )
            {
                return Err(LifecycleError::AlreadyActive(id));
            }
            table.insert(id.clone(), handle.clone())
        };
        if let Some(stale) = stale {
            // A crashed predecessor whose cleanup has not run yet.
            let _ = self.registry.revoke(&stale, ExtensionState::Removed);
        }

        info!(extension = %id, %kind, "activating extension");
        let caps = handle.capabilities();

        // The change listener skips handles that are still `Activating`, so
        // the delivered subtree is compared again once the handle is active.
        let mut delivered = None;
        if caps.on_configuration_change {
            delivered = self.config.config().plugin(&id).cloned();
            let api = self.api_for(&handle);
            self.activation_hook(&handle, move |ext| ext.on_configuration_change(api))
                .await?;
        }
        if caps.on_activate {
            let api = self.api_for(&handle);
            self.activation_hook(&handle, move |ext| ext.on_activate(api)).await?;
        }

        handle
            .transition(ExtensionState::Active)
            .map_err(|source| LifecycleError::InvalidTransition { id: id.clone(), source })?;
        info!(
            extension = %id,
            registrations = self.registry.count_for_handle(&handle),
            "extension active"
        );

        if caps.on_configuration_change && self.config.config().plugin(&id) != delivered.as_ref() {
            debug!(extension = %id, "configuration changed during activation");
            match self.runtime() {
                Some(runtime) => self.deliver_configuration(&runtime, handle.clone()),
                None => warn!(extension = %id, "no runtime, configuration change not delivered"),
            }
        }
        Ok(handle)
    }

    async fn activation_hook<F>(
        &self,
        handle: &Arc<ExtensionHandle>,
        call: F,
    ) -> Result<(), LifecycleError>
    where
        F: FnOnce(Arc<dyn Extension>) -> HookFuture + Send + 'static,
    {
        let id = handle.id().to_string();
        let result = handle
            .invoke(self.hook_timeout, move |ext| -> HookFuture { call(ext) })
            .await;
        match result {
            Ok(()) => Ok(()),
            Err(e) if e.is_crash() => {
                error!(extension = %id, error = %e, "extension crashed during activation");
                let reason = e.to_string();
                if handle.mark_crashed() {
                    self.events.crashed(handle.clone());
                }
                Err(LifecycleError::ActivationCrashed { id, reason })
            }
            Err(e) => {
                warn!(extension = %id, error = %e, "extension activation failed");
                let _ = self.registry.revoke(handle, ExtensionState::Removed);
                self.forget(handle);
                let message = match e {
                    CallError::Handler(h) => h.message,
                    other => other.to_string(),
                };
                Err(LifecycleError::ActivationFailed { id, message })
            }
        }
    }

    /// Revoke `id`'s triggers, run its `on_deactivate` hook, and remove it.
    pub async fn deactivate(&self, id: &str) -> Result<usize, LifecycleError> {
        let handle = self.handle(id).ok_or_else(|| LifecycleError::NotFound(id.to_string()))?;
        let removed = self
            .registry
            .revoke(&handle, ExtensionState::Deactivating)
            .map_err(|source| LifecycleError::InvalidTransition { id: id.to_string(), source })?;

        if handle.capabilities().on_deactivate {
            let result = handle
                .invoke(self.hook_timeout, |ext| -> HookFuture { ext.on_deactivate() })
                .await;
            if let Err(e) = result {
                warn!(extension = %id, error = %e, "on_deactivate failed");
            }
        }

        let _ = handle.transition(ExtensionState::Removed);
        self.forget(&handle);
        info!(extension = %id, removed, "extension deactivated");
        Ok(removed)
    }

    /// Remove `id` immediately, without calling any hook.
    pub fn remove(&self, id: &str) -> Result<usize, LifecycleError> {
        let handle = self.handle(id).ok_or_else(|| LifecycleError::NotFound(id.to_string()))?;
        let removed = self
            .registry
            .revoke(&handle, ExtensionState::Removed)
            .map_err(|source| LifecycleError::InvalidTransition { id: id.to_string(), source })?;
        self.forget(&handle);
        info!(extension = %id, removed, "extension removed");
        Ok(removed)
    }

    /// Fan a configuration change out to every active extension whose
    /// subtree changed. Returns the number of notifications scheduled.
    pub fn on_configuration_changed(&self, old: &HostConfig, new: &HostConfig) -> usize {
        let targets: Vec<Arc<ExtensionHandle>> = self
            .table()
            .values()
            .filter(|h| {
                h.is_active()
                    && h.capabilities().on_configuration_change
                    && old.plugin_changed(new, h.id())
            })
            .cloned()
            .collect();

        if targets.is_empty() {
            return 0;
        }
        let Some(runtime) = self.runtime() else {
            warn!(count = targets.len(), "no runtime, configuration change not delivered");
            return 0;
        };

        let count = targets.len();
        for handle in targets {
            self.deliver_configuration(&runtime, handle);
        }
        count
    }

    fn runtime(&self) -> Option<tokio::runtime::Handle> {
        tokio::runtime::Handle::try_current()
            .ok()
            .or_else(|| self.runtime.clone())
    }

    /// Run `handle`'s configuration hook on its own task.
    fn deliver_configuration(&self, runtime: &tokio::runtime::Handle, handle: Arc<ExtensionHandle>) {
        let api = self.api_for(&handle);
        let events = self.events.clone();
        let timeout = self.hook_timeout;
        runtime.spawn(async move {
            let id = handle.id().to_string();
            debug!(extension = %id, "delivering configuration change");
            let result = handle
                .invoke(timeout, move |ext| -> HookFuture { ext.on_configuration_change(api) })
                .await;
            match result {
                Ok(()) => {}
                Err(e) if e.is_crash() => {
                    error!(extension = %id, error = %e, "extension crashed handling configuration change");
                    if handle.mark_crashed() {
                        events.crashed(handle);
                    }
                }
                Err(e) => warn!(extension = %id, error = %e, "configuration change hook failed"),
            }
        });
    }

    /// Resolve once every lifecycle event queued before this call has been
    /// processed. Returns immediately when the worker is gone.
    pub async fn settle(&self) {
        if let Some(rx) = self.events.barrier() {
            let _ = rx.await;
        }
    }

    /// Deactivate every extension and drop all registrations.
    pub async fn shutdown(&self) {
        let mut ids: Vec<String> = self.table().keys().cloned().collect();
        ids.sort();
        for id in ids {
            if let Err(e) = self.deactivate(&id).await {
                debug!(extension = %id, error = %e, "deactivate during shutdown");
                let _ = self.remove(&id);
            }
        }
        self.registry.clear();
        if let Some(listener) = self.listener.lock().unwrap_or_else(PoisonError::into_inner).take() {
            self.config.remove_listener(listener);
        }
        info!("lifecycle coordinator shut down");
    }

    fn process(&self, event: LifecycleEvent) {
        match event {
            LifecycleEvent::Crashed(handle) => {
                match self.registry.revoke(&handle, ExtensionState::Removed) {
                    Ok(removed) => {
                        info!(extension = %handle.id(), removed, "crashed extension cleaned up")
                    }
                    Err(e) => debug!(extension = %handle.id(), error = %e, "crash cleanup skipped"),
                }
                self.forget(&handle);
            }
            LifecycleEvent::Barrier(reply) => {
                let _ = reply.send(());
            }
        }
    }

    /// Drop `handle` from the table unless a newer handle replaced it.
    fn forget(&self, handle: &ExtensionHandle) {
        let mut table = self.table();
        if table.get(handle.id()).is_some_and(|h| h.uid() == handle.uid()) {
            table.remove(handle.id());
        }
    }
}

// ── LifecycleWorker ───────────────────────────────────────────────────────────

/// Background task draining the lifecycle queue.
pub struct LifecycleWorker {
    coordinator: Arc<LifecycleCoordinator>,
    rx: mpsc::UnboundedReceiver<LifecycleEvent>,
}

impl LifecycleWorker {
    pub async fn run(mut self, shutdown: CancellationToken) {
        debug!("lifecycle worker started");
        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    debug!("lifecycle worker shutting down");
                    break;
                }

                event = self.rx.recv() => match event {
                    Some(event) => self.coordinator.process(event),
                    None => break,
                },
            }
        }
    }

    /// Spawn [`run`](Self::run) on the current runtime.
    pub fn spawn(self, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }
}
