//! Host control plane.
//!
//! Management operations (status, extension listing, disabling an extension,
//! shutdown) go through a small request/reply channel served by
//! [`ControlLoop`]. Front-ends such as the console channel hold a cloneable
//! [`ControlHandle`].

use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::runtime::{Component, ComponentFuture};
use crate::commands::model::{CommandSource, Namespace};
use crate::extensions::lifecycle::{ExtensionInfo, LifecycleCoordinator, LifecycleError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    Health,
    Status,
    Extensions,
    Commands { namespace: Namespace },
    Disable { id: String },
    Shutdown,
}

/// One line of a command listing.
#[derive(Debug, Clone, Serialize)]
pub struct CommandEntry {
    pub trigger: String,
    pub namespace: Namespace,
    pub source: CommandSource,
    pub description: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlResponse {
    Health { uptime_ms: u64 },
    Status { uptime_ms: u64, extensions: usize, registrations: usize },
    Extensions { extensions: Vec<ExtensionInfo> },
    Commands { commands: Vec<CommandEntry> },
    Ack { message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Error)]
pub enum ControlError {
    #[error("not found: {message}")]
    NotFound { message: String },
    #[error("invalid: {message}")]
    Invalid { message: String },
}

pub type ControlResult = Result<ControlResponse, ControlError>;

#[derive(Debug)]
pub struct ControlMessage {
    pub command: ControlCommand,
    pub reply_tx: oneshot::Sender<ControlResult>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ControlCallError {
    #[error("control send failed: host is not running")]
    Send,
    #[error("control recv failed: host dropped reply sender")]
    Recv,
}

/// Client-facing handle for the control plane.
#[derive(Clone)]
pub struct ControlHandle {
    tx: mpsc::Sender<ControlMessage>,
}

impl ControlHandle {
    pub async fn request(&self, command: ControlCommand) -> Result<ControlResult, ControlCallError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(ControlMessage { command, reply_tx })
            .await
            .map_err(|_| ControlCallError::Send)?;
        reply_rx.await.map_err(|_| ControlCallError::Recv)
    }
}

/// Serves control requests until shutdown.
pub struct ControlLoop {
    rx: mpsc::Receiver<ControlMessage>,
    coordinator: Arc<LifecycleCoordinator>,
    started: Instant,
}

impl ControlLoop {
    pub fn new(buffer: usize, coordinator: Arc<LifecycleCoordinator>) -> (Self, ControlHandle) {
        let (tx, rx) = mpsc::channel(buffer);
        let this = Self { rx, coordinator, started: Instant::now() };
        (this, ControlHandle { tx })
    }

    async fn handle(&self, command: ControlCommand, shutdown: &CancellationToken) -> ControlResult {
        let uptime_ms = self.started.elapsed().as_millis() as u64;
        match command {
            ControlCommand::Health => Ok(ControlResponse::Health { uptime_ms }),
            ControlCommand::Status => Ok(ControlResponse::Status {
                uptime_ms,
                extensions: self.coordinator.extensions().len(),
                registrations: self.coordinator.registry().len(),
            }),
            ControlCommand::Extensions => Ok(ControlResponse::Extensions {
                extensions: self.coordinator.extensions(),
            }),
            ControlCommand::Commands { namespace } => {
                let commands = self
                    .coordinator
                    .registry()
                    .visible_for_namespace(&namespace)
                    .into_iter()
                    .map(|r| CommandEntry {
                        trigger: r.trigger,
                        namespace: r.namespace,
                        source: r.source,
                        description: r.metadata.auto_complete_desc,
                    })
                    .collect();
                Ok(ControlResponse::Commands { commands })
            }
            ControlCommand::Disable { id } => match self.coordinator.deactivate(&id).await {
                Ok(removed) => Ok(ControlResponse::Ack {
                    message: format!("{id} disabled, {removed} command(s) removed"),
                }),
                Err(LifecycleError::NotFound(_)) => Err(ControlError::NotFound {
                    message: format!("extension {id}"),
                }),
                Err(e) => Err(ControlError::Invalid { message: e.to_string() }),
            },
            ControlCommand::Shutdown => {
                info!("shutdown requested via control plane");
                shutdown.cancel();
                Ok(ControlResponse::Ack { message: "shutting down".into() })
            }
        }
    }

    async fn run_loop(mut self, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    debug!("control loop shutting down");
                    break;
                }

                msg = self.rx.recv() => {
                    let Some(ControlMessage { command, reply_tx }) = msg else {
                        break;
                    };
                    debug!(?command, "control request");
                    let result = self.handle(command, &shutdown).await;
                    let _ = reply_tx.send(result);
                }
            }
        }
    }
}

impl Component for ControlLoop {
    fn id(&self) -> &str {
        "control"
    }

    fn run(self: Box<Self>, shutdown: CancellationToken) -> ComponentFuture {
        Box::pin(async move {
            self.run_loop(shutdown).await;
            Ok(())
        })
    }
}
