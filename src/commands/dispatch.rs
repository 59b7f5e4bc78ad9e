//! Dispatcher — resolve one invocation and run it through the call boundary.
//!
//! The registry read lock is held only for [`CommandRegistry::resolve`]; the
//! handler runs afterwards on its own task under `dispatch.timeout_ms`. Faults
//! are mapped to typed errors and reported to the lifecycle worker, which
//! revokes the crashed extension's triggers asynchronously. The dispatcher
//! never waits for that cleanup.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, error, warn};

use super::model::{CommandResponse, InvocationContext, Namespace, Registration};
use super::registry::CommandRegistry;
use crate::extensions::handle::{CallError, ExtensionState};
use crate::extensions::lifecycle::LifecycleEvents;

/// Status applied to handler errors that did not set one.
pub const DEFAULT_ERROR_STATUS: u16 = 500;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("not a slash command: {0:?}")]
    InvalidCommand(String),

    #[error("command /{trigger} not found in {namespace}")]
    UnknownCommand { namespace: Namespace, trigger: String },

    #[error("/{trigger}: extension {id} is {state}")]
    ExtensionUnavailable {
        id: String,
        trigger: String,
        state: ExtensionState,
    },

    #[error("{message}")]
    Handler { message: String, status: u16 },

    #[error("/{trigger}: extension {id} crashed before executing the command: {reason}")]
    ExtensionCrashedBeforeExecution {
        id: String,
        trigger: String,
        reason: String,
    },

    #[error("/{trigger}: extension {id} crashed while executing the command: {reason}")]
    ExtensionCrashedDuringExecution {
        id: String,
        trigger: String,
        reason: String,
    },

    #[error("/{trigger}: extension {id} did not respond within {timeout:?}")]
    HandlerTimeout {
        id: String,
        trigger: String,
        timeout: Duration,
    },
}

impl DispatchError {
    pub fn status_code(&self) -> u16 {
        match self {
            DispatchError::InvalidCommand(_) => 400,
            DispatchError::UnknownCommand { .. } => 404,
            DispatchError::ExtensionUnavailable { .. } => 503,
            DispatchError::Handler { status, .. } => *status,
            DispatchError::ExtensionCrashedBeforeExecution { .. }
            | DispatchError::ExtensionCrashedDuringExecution { .. } => 500,
            DispatchError::HandlerTimeout { .. } => 504,
        }
    }

    /// Stable machine-readable error id.
    pub fn id(&self) -> &'static str {
        match self {
            DispatchError::InvalidCommand(_) => "command.invalid",
            DispatchError::UnknownCommand { .. } => "command.unknown_trigger",
            DispatchError::ExtensionUnavailable { .. } => "command.extension_unavailable",
            DispatchError::Handler { .. } => "command.handler_error",
            DispatchError::ExtensionCrashedBeforeExecution { .. } => "command.extension_error",
            DispatchError::ExtensionCrashedDuringExecution { .. } => "command.extension_crash",
            DispatchError::HandlerTimeout { .. } => "command.timeout",
        }
    }

    pub fn is_crash(&self) -> bool {
        matches!(
            self,
            DispatchError::ExtensionCrashedBeforeExecution { .. }
                | DispatchError::ExtensionCrashedDuringExecution { .. }
        )
    }
}

pub struct Dispatcher {
    registry: Arc<CommandRegistry>,
    timeout: Duration,
    events: LifecycleEvents,
}

impl Dispatcher {
    pub fn new(registry: Arc<CommandRegistry>, timeout: Duration, events: LifecycleEvents) -> Self {
        Self { registry, timeout, events }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Parse `line` and execute it.
    pub async fn execute_line(
        &self,
        team_id: &str,
        actor: &str,
        channel_id: &str,
        line: &str,
    ) -> Result<CommandResponse, DispatchError> {
        let ctx = InvocationContext::parse(team_id, actor, channel_id, line)
            .ok_or_else(|| DispatchError::InvalidCommand(line.trim().to_string()))?;
        self.execute(ctx).await
    }

    /// Resolve `ctx` to exactly one handler and run it.
    pub async fn execute(&self, ctx: InvocationContext) -> Result<CommandResponse, DispatchError> {
        let Some(reg) = self.registry.resolve(&ctx.namespace, &ctx.trigger) else {
            debug!(namespace = %ctx.namespace, trigger = %ctx.trigger, "unknown command");
            return Err(DispatchError::UnknownCommand {
                namespace: ctx.namespace,
                trigger: ctx.trigger,
            });
        };
        let handle = reg.owner().clone();
        let id = handle.id().to_string();
        let trigger = ctx.trigger.clone();

        match handle.state() {
            ExtensionState::Active => {}
            ExtensionState::Crashed => {
                // Resolved between the crash and its cleanup.
                self.events.crashed(handle.clone());
                return Err(DispatchError::ExtensionCrashedBeforeExecution {
                    id,
                    trigger,
                    reason: "extension crashed earlier and is being cleaned up".into(),
                });
            }
            state => return Err(DispatchError::ExtensionUnavailable { id, trigger, state }),
        }

        debug!(extension = %id, %trigger, source = %reg.source, actor = %ctx.actor, "dispatching command");

        let result = handle
            .invoke(self.timeout, move |ext| ext.execute_command(ctx))
            .await;

        match result {
            Ok(response) => Ok(response),
            Err(CallError::Handler(e)) => {
                let status = if e.status_code == 0 { DEFAULT_ERROR_STATUS } else { e.status_code };
                debug!(extension = %id, %trigger, status, "handler returned error");
                Err(DispatchError::Handler { message: e.message, status })
            }
            Err(CallError::TimedOut(timeout)) => {
                warn!(extension = %id, %trigger, ?timeout, "handler timed out");
                Err(DispatchError::HandlerTimeout { id, trigger, timeout })
            }
            Err(CallError::CrashedBeforeExecution(reason)) => {
                error!(extension = %id, %trigger, %reason, "extension crashed before execution");
                self.report_crash(&reg);
                Err(DispatchError::ExtensionCrashedBeforeExecution { id, trigger, reason })
            }
            Err(CallError::CrashedDuringExecution(reason)) => {
                error!(extension = %id, %trigger, %reason, "extension crashed during execution");
                self.report_crash(&reg);
                Err(DispatchError::ExtensionCrashedDuringExecution { id, trigger, reason })
            }
        }
    }

    /// Visible bindings in `namespace` that want autocompletion, one per trigger.
    pub fn autocomplete(&self, namespace: &Namespace) -> Vec<Registration> {
        self.registry
            .visible_for_namespace(namespace)
            .into_iter()
            .filter(|r| r.metadata.auto_complete)
            .collect()
    }

    fn report_crash(&self, reg: &Registration) {
        if reg.owner().mark_crashed() {
            self.events.crashed(reg.owner().clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::model::{CommandMetadata, HandlerError};
    use crate::extensions::handle::ExtensionHandle;
    use crate::extensions::lifecycle::LifecycleEvent;
    use crate::extensions::{CommandFuture, Extension, ExtensionKind, boxed_command};
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::mpsc;

    struct Fixed(&'static str, Result<&'static str, u16>);

    impl Extension for Fixed {
        fn id(&self) -> &str {
            self.0
        }

        fn execute_command(self: Arc<Self>, ctx: InvocationContext) -> CommandFuture {
            let outcome = self.1;
            boxed_command(async move {
                match outcome {
                    Ok(text) => Ok(CommandResponse::ephemeral(format!("{text}:{}", ctx.args))),
                    Err(status) => Err(HandlerError::with_status("failed", status)),
                }
            })
        }
    }

    struct Setup {
        registry: Arc<CommandRegistry>,
        dispatcher: Dispatcher,
        events_rx: mpsc::UnboundedReceiver<LifecycleEvent>,
    }

    fn setup() -> Setup {
        let registry = Arc::new(CommandRegistry::new());
        let (events, events_rx) = LifecycleEvents::channel();
        let dispatcher = Dispatcher::new(registry.clone(), Duration::from_secs(5), events);
        Setup { registry, dispatcher, events_rx }
    }

    fn install(
        registry: &CommandRegistry,
        kind: ExtensionKind,
        ext: Fixed,
        team: &str,
        trigger: &str,
        metadata: CommandMetadata,
    ) -> Arc<ExtensionHandle> {
        let h = ExtensionHandle::new(kind, Arc::new(ext));
        h.transition(ExtensionState::Active).unwrap();
        registry
            .register(&h, Namespace::from_team_id(team), trigger, metadata)
            .unwrap();
        h
    }

    #[tokio::test]
    async fn plugin_response_forwarded_verbatim() {
        let s = setup();
        install(&s.registry, ExtensionKind::Plugin, Fixed("p", Ok("text")), "t1", "code", CommandMetadata::default());
        let resp = s.dispatcher.execute_line("t1", "u1", "c1", "/code a b").await.unwrap();
        assert_eq!(resp.text, "text:a b");
    }

    #[tokio::test]
    async fn unset_status_normalised_to_500() {
        let s = setup();
        install(&s.registry, ExtensionKind::Plugin, Fixed("p", Err(0)), "t1", "fail", CommandMetadata::default());
        let err = s.dispatcher.execute_line("t1", "u1", "c1", "/fail").await.unwrap_err();
        assert_eq!(err.status_code(), 500);
        assert_eq!(err.id(), "command.handler_error");
    }

    #[tokio::test]
    async fn explicit_status_preserved() {
        let s = setup();
        install(&s.registry, ExtensionKind::Plugin, Fixed("p", Err(403)), "t1", "deny", CommandMetadata::default());
        let err = s.dispatcher.execute_line("t1", "u1", "c1", "/deny").await.unwrap_err();
        assert_eq!(err.status_code(), 403);
    }

    #[tokio::test]
    async fn unknown_and_invalid_commands() {
        let s = setup();
        let err = s.dispatcher.execute_line("t1", "u1", "c1", "/nothing").await.unwrap_err();
        assert_eq!(err.status_code(), 404);
        let err = s.dispatcher.execute_line("t1", "u1", "c1", "plain text").await.unwrap_err();
        assert_eq!(err, DispatchError::InvalidCommand("plain text".into()));
        assert_eq!(err.status_code(), 400);
    }

    #[tokio::test]
    async fn inactive_handle_is_unavailable() {
        let s = setup();
        let h = ExtensionHandle::new(ExtensionKind::Plugin, Arc::new(Fixed("p", Ok("x"))));
        s.registry
            .register(&h, Namespace::from_team_id("t1"), "early", CommandMetadata::default())
            .unwrap();
        let err = s.dispatcher.execute_line("t1", "u1", "c1", "/early").await.unwrap_err();
        assert!(matches!(
            err,
            DispatchError::ExtensionUnavailable { state: ExtensionState::Activating, .. }
        ));
    }

    #[tokio::test]
    async fn crashed_handle_requests_cleanup() {
        let mut s = setup();
        let h = install(&s.registry, ExtensionKind::Plugin, Fixed("p", Ok("x")), "t1", "gone", CommandMetadata::default());
        h.mark_crashed();
        let err = s.dispatcher.execute_line("t1", "u1", "c1", "/gone").await.unwrap_err();
        assert!(matches!(err, DispatchError::ExtensionCrashedBeforeExecution { .. }));
        match s.events_rx.try_recv().unwrap() {
            LifecycleEvent::Crashed(handle) => assert_eq!(handle.uid(), h.uid()),
            other => panic!("unexpected event {other:?}"),
        }
    }

    struct Sleeper(Arc<AtomicBool>);

    impl Extension for Sleeper {
        fn id(&self) -> &str {
            "sleeper"
        }

        fn execute_command(self: Arc<Self>, _ctx: InvocationContext) -> CommandFuture {
            boxed_command(async move {
                tokio::time::sleep(Duration::from_millis(500)).await;
                self.0.store(true, Ordering::SeqCst);
                Ok(CommandResponse::ephemeral("late"))
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_dispatch_stops_the_handler() {
        let registry = Arc::new(CommandRegistry::new());
        let (events, _events_rx) = LifecycleEvents::channel();
        let dispatcher = Dispatcher::new(registry.clone(), Duration::from_millis(100), events);

        let finished = Arc::new(AtomicBool::new(false));
        let h = ExtensionHandle::new(ExtensionKind::Plugin, Arc::new(Sleeper(finished.clone())));
        h.transition(ExtensionState::Active).unwrap();
        registry
            .register(&h, Namespace::from_team_id("t1"), "slow", CommandMetadata::default())
            .unwrap();

        let dispatch = dispatcher.execute_line("t1", "u1", "c1", "/slow");
        assert!(tokio::time::timeout(Duration::from_millis(20), dispatch).await.is_err());

        tokio::time::sleep(Duration::from_millis(700)).await;
        assert!(!finished.load(Ordering::SeqCst));
        assert_eq!(h.in_flight(), 0);
        assert_eq!(h.state(), ExtensionState::Active);
    }

    #[test]
    fn autocomplete_lists_flagged_winners_only() {
        let s = setup();
        let ac = CommandMetadata { auto_complete: true, ..CommandMetadata::default() };
        install(&s.registry, ExtensionKind::Core, Fixed("core", Ok("x")), "", "away", ac.clone());
        install(&s.registry, ExtensionKind::Core, Fixed("core2", Ok("x")), "", "quiet", CommandMetadata::default());
        install(&s.registry, ExtensionKind::Plugin, Fixed("p", Ok("x")), "t1", "code", ac);

        let triggers: Vec<String> = s
            .dispatcher
            .autocomplete(&Namespace::from_team_id("t1"))
            .into_iter()
            .map(|r| r.trigger)
            .collect();
        assert_eq!(triggers, ["away", "code"]);
    }
}
