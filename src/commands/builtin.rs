//! Core command set, served by the `core` extension in the built-in tier.
//!
//! Triggers are registered in the global namespace, so any plugin or product
//! registering the same word in a team shadows them there.

use std::sync::Arc;

use tracing::debug;

use super::model::{Command, CommandResponse, HandlerError, InvocationContext};
use crate::extensions::api::ExtensionApi;
use crate::extensions::handle::ExtensionHandle;
use crate::extensions::lifecycle::{LifecycleCoordinator, LifecycleError};
use crate::extensions::{
    Capabilities, CommandFuture, Extension, ExtensionKind, HookFuture, boxed_command, boxed_hook,
};

pub const CORE_EXTENSION_ID: &str = "core";

const SHRUG: &str = r"¯\_(ツ)_/¯";

/// (trigger, autocomplete description, hint)
const COMMANDS: &[(&str, &str, &str)] = &[
    ("away", "Set your status to away", ""),
    ("online", "Set your status to online", ""),
    ("echo", "Echo back text from your account", "[message]"),
    ("shrug", "Adds ¯\\_(ツ)_/¯ to your message", "[message]"),
];

pub struct CoreCommands;

impl Extension for CoreCommands {
    fn id(&self) -> &str {
        CORE_EXTENSION_ID
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::commands_only().with_on_activate()
    }

    fn on_activate(self: Arc<Self>, api: ExtensionApi) -> HookFuture {
        boxed_hook(async move {
            for (trigger, desc, hint) in COMMANDS {
                let mut command = Command::new("", *trigger)
                    .with_display_name(*trigger)
                    .with_autocomplete(*desc);
                command.metadata.auto_complete_hint = hint.to_string();
                api.register_command(command)?;
            }
            Ok(())
        })
    }

    fn execute_command(self: Arc<Self>, ctx: InvocationContext) -> CommandFuture {
        boxed_command(async move {
            debug!(trigger = %ctx.trigger, actor = %ctx.actor, "core command");
            match ctx.trigger.as_str() {
                "away" => Ok(CommandResponse::ephemeral("You are now away")),
                "online" => Ok(CommandResponse::ephemeral("You are now online")),
                "echo" if ctx.args.is_empty() => {
                    Err(HandlerError::with_status("A message must be provided with the /echo command.", 400))
                }
                "echo" => Ok(CommandResponse::in_channel(ctx.args)),
                "shrug" if ctx.args.is_empty() => Ok(CommandResponse::in_channel(SHRUG)),
                "shrug" => Ok(CommandResponse::in_channel(format!("{} {SHRUG}", ctx.args))),
                other => Err(HandlerError::with_status(format!("unknown core command /{other}"), 404)),
            }
        })
    }
}

/// Activate the core command set.
pub async fn register_all(
    coordinator: &LifecycleCoordinator,
) -> Result<Arc<ExtensionHandle>, LifecycleError> {
    coordinator
        .activate(ExtensionKind::Core, Arc::new(CoreCommands))
        .await
}
