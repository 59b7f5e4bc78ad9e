//! Extensions — plugins and products that contribute slash commands.
//!
//! # Capability model
//!
//! Every extension implements the single [`Extension`] trait. The host does
//! not probe for individual hook methods at call time: [`Extension::capabilities`]
//! is read once when the extension is activated and cached on its
//! [`handle::ExtensionHandle`]. Hooks the extension does not advertise are
//! never called.
//!
//! Hooks take `self: Arc<Self>` and return owned, boxed futures so the host
//! can call them and drive the result on their own Tokio task. That task is
//! the call boundary:
//! a panic inside it is converted into a typed fault instead of unwinding into
//! the host, whether the extension lives in-process or proxies to a separate
//! process.

pub mod api;
pub mod handle;
pub mod lifecycle;

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::commands::model::{CommandResponse, HandlerError, InvocationContext};
use api::ExtensionApi;

/// Boxed future returned by [`Extension::execute_command`].
pub type CommandFuture =
    Pin<Box<dyn Future<Output = Result<CommandResponse, HandlerError>> + Send + 'static>>;

/// Boxed future returned by lifecycle hooks.
pub type HookFuture = Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send + 'static>>;

/// Box a command future.
pub fn boxed_command<F>(future: F) -> CommandFuture
where
    F: Future<Output = Result<CommandResponse, HandlerError>> + Send + 'static,
{
    Box::pin(future)
}

/// Box a hook future.
pub fn boxed_hook<F>(future: F) -> HookFuture
where
    F: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    Box::pin(future)
}

/// Where an extension comes from. Decides the precedence tier of its triggers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtensionKind {
    /// The host's own built-in command set.
    Core,
    Plugin,
    Product,
}

impl fmt::Display for ExtensionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExtensionKind::Core => write!(f, "core"),
            ExtensionKind::Plugin => write!(f, "plugin"),
            ExtensionKind::Product => write!(f, "product"),
        }
    }
}

/// Hooks an extension implements. Cached at activation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    pub on_activate: bool,
    pub on_deactivate: bool,
    pub on_configuration_change: bool,
    pub execute_command: bool,
}

impl Capabilities {
    pub const fn all() -> Self {
        Self {
            on_activate: true,
            on_deactivate: true,
            on_configuration_change: true,
            execute_command: true,
        }
    }

    /// Only serves commands; no lifecycle hooks.
    pub const fn commands_only() -> Self {
        Self {
            on_activate: false,
            on_deactivate: false,
            on_configuration_change: false,
            execute_command: true,
        }
    }

    pub const fn with_on_activate(mut self) -> Self {
        self.on_activate = true;
        self
    }

    pub const fn with_configuration_change(mut self) -> Self {
        self.on_configuration_change = true;
        self
    }
}

/// The uniform capability interface the host calls extensions through.
///
/// Default hook bodies succeed without doing anything; `execute_command`
/// defaults to a 501 error so an extension that registers a trigger without
/// serving it fails loudly.
///
/// Hook methods are called on the host's call task, under the same deadline
/// as the future they return. The deadline is enforced at await points, so
/// blocking work (synchronous I/O, long computations) belongs in
/// `tokio::task::spawn_blocking`, not in the method body or between awaits.
pub trait Extension: Send + Sync + 'static {
    /// Stable extension id (plugin id or product id).
    fn id(&self) -> &str;

    /// Hooks this extension implements.
    fn capabilities(&self) -> Capabilities {
        Capabilities::all()
    }

    /// Called once while the handle is `Activating`. Triggers registered here
    /// become visible immediately.
    fn on_activate(self: Arc<Self>, _api: ExtensionApi) -> HookFuture {
        boxed_hook(async { Ok(()) })
    }

    /// Called after the extension's triggers were revoked.
    fn on_deactivate(self: Arc<Self>) -> HookFuture {
        boxed_hook(async { Ok(()) })
    }

    /// Called when this extension's configuration subtree changed, and once
    /// before `on_activate` with the initial configuration.
    fn on_configuration_change(self: Arc<Self>, _api: ExtensionApi) -> HookFuture {
        boxed_hook(async { Ok(()) })
    }

    /// Serve one command invocation. A panic before the future is returned is
    /// reported as a crash before execution, a panic while it runs as a crash
    /// during execution.
    fn execute_command(self: Arc<Self>, ctx: InvocationContext) -> CommandFuture {
        boxed_command(async move {
            Err(HandlerError::with_status(
                format!("command /{} is not implemented", ctx.trigger),
                501,
            ))
        })
    }
}
