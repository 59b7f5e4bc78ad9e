//! Extension handle — host-side proxy for one activated extension.
//!
//! A handle carries the extension's lifecycle state, its cached
//! [`Capabilities`], and the call boundary every invocation goes through.
//! Handles are owned by the lifecycle coordinator; registrations and
//! in-flight dispatches hold `Arc` clones.
//!
//! # Call boundary
//!
//! [`ExtensionHandle::invoke`] builds and runs an extension future on its own
//! Tokio task under a deadline:
//!
//! - a panic while the extension *builds* its future surfaces as
//!   [`CallError::CrashedBeforeExecution`];
//! - a panic while the future *runs* surfaces as
//!   [`CallError::CrashedDuringExecution`];
//! - an elapsed deadline aborts the task and surfaces as [`CallError::TimedOut`].
//!
//! The task is tied to the caller: dropping the `invoke` future aborts it, and
//! the in-flight count falls only once the task is gone.
//!
//! The boundary never changes state itself; callers decide what a fault means.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::task::AbortOnDropHandle;
use tracing::{trace, warn};

use super::{Capabilities, Extension, ExtensionKind};
use crate::commands::model::{CommandSource, HandlerError};

static HANDLE_COUNTER: AtomicU64 = AtomicU64::new(1);

// ── ExtensionState ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum ExtensionState {
    Activating = 0,
    Active = 1,
    Deactivating = 2,
    Crashed = 3,
    Removed = 4,
}

impl ExtensionState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ExtensionState::Activating,
            1 => ExtensionState::Active,
            2 => ExtensionState::Deactivating,
            3 => ExtensionState::Crashed,
            _ => ExtensionState::Removed,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExtensionState::Activating => "activating",
            ExtensionState::Active => "active",
            ExtensionState::Deactivating => "deactivating",
            ExtensionState::Crashed => "crashed",
            ExtensionState::Removed => "removed",
        }
    }

    /// States from which triggers may still be registered.
    pub fn accepts_registrations(&self) -> bool {
        matches!(self, ExtensionState::Activating | ExtensionState::Active)
    }

    fn can_become(&self, to: ExtensionState) -> bool {
        use ExtensionState::*;
        matches!(
            (self, to),
            (Activating, Active | Deactivating | Crashed | Removed)
                | (Active, Deactivating | Crashed | Removed)
                | (Deactivating, Crashed | Removed)
                | (Crashed, Removed)
        )
    }
}

impl fmt::Display for ExtensionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid state transition {from} -> {to}")]
pub struct InvalidTransition {
    pub from: ExtensionState,
    pub to: ExtensionState,
}

// ── CallError ─────────────────────────────────────────────────────────────────

/// How a call through the boundary failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallError {
    #[error("handler error: {0}")]
    Handler(HandlerError),

    #[error("extension crashed before execution: {0}")]
    CrashedBeforeExecution(String),

    #[error("extension crashed during execution: {0}")]
    CrashedDuringExecution(String),

    #[error("extension call timed out after {0:?}")]
    TimedOut(Duration),
}

impl CallError {
    pub fn is_crash(&self) -> bool {
        matches!(
            self,
            CallError::CrashedBeforeExecution(_) | CallError::CrashedDuringExecution(_)
        )
    }
}

// ── ExtensionHandle ───────────────────────────────────────────────────────────

pub struct ExtensionHandle {
    /// Process-unique handle number; a re-activated extension gets a new one.
    uid: u64,
    id: String,
    kind: ExtensionKind,
    capabilities: Capabilities,
    state: AtomicU8,
    in_flight: Arc<AtomicUsize>,
    extension: Arc<dyn Extension>,
}

impl ExtensionHandle {
    /// Wrap an extension in a fresh `Activating` handle, caching its capabilities.
    pub fn new(kind: ExtensionKind, extension: Arc<dyn Extension>) -> Arc<Self> {
        Arc::new(Self {
            uid: HANDLE_COUNTER.fetch_add(1, Ordering::Relaxed),
            id: extension.id().to_string(),
            kind,
            capabilities: extension.capabilities(),
            state: AtomicU8::new(ExtensionState::Activating as u8),
            in_flight: Arc::new(AtomicUsize::new(0)),
            extension,
        })
    }

    pub fn uid(&self) -> u64 {
        self.uid
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> ExtensionKind {
        self.kind
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    pub fn state(&self) -> ExtensionState {
        ExtensionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_active(&self) -> bool {
        self.state() == ExtensionState::Active
    }

    /// Calls currently running through this handle's boundary.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Source tag stamped on every trigger this handle registers.
    pub fn source(&self) -> CommandSource {
        match self.kind {
            ExtensionKind::Core => CommandSource::BuiltIn,
            ExtensionKind::Plugin => CommandSource::Plugin(self.id.clone()),
            ExtensionKind::Product => CommandSource::Product(self.id.clone()),
        }
    }

    /// Move to `to`, returning the previous state.
    ///
    /// Registry-visible transitions (revocation) are performed by the command
    /// registry under its write lock; this method only enforces the state graph.
    pub(crate) fn transition(&self, to: ExtensionState) -> Result<ExtensionState, InvalidTransition> {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            let from = ExtensionState::from_u8(current);
            if !from.can_become(to) {
                return Err(InvalidTransition { from, to });
            }
            match self.state.compare_exchange(
                current,
                to as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    trace!(extension = %self.id, %from, %to, "extension state changed");
                    return Ok(from);
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// Mark the handle crashed. Returns `true` only for the caller that
    /// performed the transition, so cleanup is requested once.
    pub(crate) fn mark_crashed(&self) -> bool {
        match self.transition(ExtensionState::Crashed) {
            Ok(from) => {
                warn!(extension = %self.id, %from, "extension marked crashed");
                true
            }
            Err(_) => false,
        }
    }

    /// Run one extension future through the call boundary.
    ///
    /// `make` receives the extension and builds the future. Both run on a
    /// dedicated task bounded by `limit`; whether `make` had returned when a
    /// panic hit decides between a setup fault and a runtime fault.
    pub(crate) async fn invoke<T, F>(&self, limit: Duration, make: F) -> Result<T, CallError>
    where
        T: Send + 'static,
        F: FnOnce(Arc<dyn Extension>) -> Pin<Box<dyn Future<Output = Result<T, HandlerError>> + Send>>
            + Send
            + 'static,
    {
        let guard = InFlightGuard::enter(self.in_flight.clone());
        let extension = self.extension.clone();
        let built = Arc::new(AtomicBool::new(false));
        let flag = built.clone();

        let mut task = AbortOnDropHandle::new(tokio::spawn(async move {
            let _guard = guard;
            let future = make(extension);
            flag.store(true, Ordering::Release);
            future.await
        }));

        match tokio::time::timeout(limit, &mut task).await {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(e))) => Err(CallError::Handler(e)),
            Ok(Err(join_err)) if join_err.is_panic() => {
                let reason = panic_message(&*join_err.into_panic());
                if built.load(Ordering::Acquire) {
                    Err(CallError::CrashedDuringExecution(reason))
                } else {
                    Err(CallError::CrashedBeforeExecution(reason))
                }
            }
            Ok(Err(join_err)) => Err(CallError::CrashedDuringExecution(format!(
                "extension task cancelled: {join_err}"
            ))),
            Err(_) => {
                task.abort();
                Err(CallError::TimedOut(limit))
            }
        }
    }
}

impl fmt::Debug for ExtensionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtensionHandle")
            .field("uid", &self.uid)
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("state", &self.state())
            .finish()
    }
}

/// Counts one call for as long as the task running it exists.
struct InFlightGuard(Arc<AtomicUsize>);

impl InFlightGuard {
    fn enter(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self(counter)
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Best-effort text of a panic payload.
fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::model::{CommandResponse, InvocationContext};
    use crate::extensions::{CommandFuture, boxed_command};

    struct Scripted {
        mode: &'static str,
    }

    impl Extension for Scripted {
        fn id(&self) -> &str {
            "scripted"
        }

        fn execute_command(self: Arc<Self>, _ctx: InvocationContext) -> CommandFuture {
            match self.mode {
                "setup-panic" => panic!("Uncaught Error"),
                "setup-block" => {
                    std::thread::sleep(Duration::from_millis(300));
                    boxed_command(async { Ok(CommandResponse::ephemeral("late")) })
                }
                "run-panic" => boxed_command(async { panic!("Uncaught Error") }),
                "hang" => boxed_command(async {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(CommandResponse::ephemeral("late"))
                }),
                "error" => boxed_command(async { Err(HandlerError::new("nope")) }),
                _ => boxed_command(async { Ok(CommandResponse::ephemeral("text")) }),
            }
        }
    }

    fn handle(mode: &'static str) -> Arc<ExtensionHandle> {
        ExtensionHandle::new(ExtensionKind::Plugin, Arc::new(Scripted { mode }))
    }

    fn ctx() -> InvocationContext {
        InvocationContext::parse("t1", "u1", "c1", "/code").unwrap()
    }

    async fn call(h: &ExtensionHandle, limit: Duration) -> Result<CommandResponse, CallError> {
        let ctx = ctx();
        h.invoke(limit, move |ext| ext.execute_command(ctx)).await
    }

    #[test]
    fn state_graph_rejects_resurrection() {
        let h = handle("ok");
        assert_eq!(h.state(), ExtensionState::Activating);
        h.transition(ExtensionState::Active).unwrap();
        h.transition(ExtensionState::Removed).unwrap();
        let err = h.transition(ExtensionState::Active).unwrap_err();
        assert_eq!(err.from, ExtensionState::Removed);
        assert_eq!(err.to, ExtensionState::Active);
    }

    #[test]
    fn mark_crashed_only_once() {
        let h = handle("ok");
        h.transition(ExtensionState::Active).unwrap();
        assert!(h.mark_crashed());
        assert!(!h.mark_crashed());
        assert_eq!(h.state(), ExtensionState::Crashed);
    }

    #[test]
    fn source_follows_kind() {
        let h = ExtensionHandle::new(ExtensionKind::Product, Arc::new(Scripted { mode: "ok" }));
        assert_eq!(h.source(), CommandSource::Product("scripted".into()));
        let core = ExtensionHandle::new(ExtensionKind::Core, Arc::new(Scripted { mode: "ok" }));
        assert_eq!(core.source(), CommandSource::BuiltIn);
    }

    #[tokio::test]
    async fn success_passes_through() {
        let h = handle("ok");
        let resp = call(&h, Duration::from_secs(1)).await.unwrap();
        assert_eq!(resp.text, "text");
        assert_eq!(h.in_flight(), 0);
    }

    #[tokio::test]
    async fn setup_panic_is_before_execution() {
        let h = handle("setup-panic");
        let err = call(&h, Duration::from_secs(1)).await.unwrap_err();
        assert_eq!(err, CallError::CrashedBeforeExecution("Uncaught Error".into()));
        assert!(err.is_crash());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn blocking_setup_counts_against_deadline() {
        let h = handle("setup-block");
        let err = call(&h, Duration::from_millis(50)).await.unwrap_err();
        assert_eq!(err, CallError::TimedOut(Duration::from_millis(50)));
    }

    #[tokio::test]
    async fn running_panic_is_during_execution() {
        let h = handle("run-panic");
        let err = call(&h, Duration::from_secs(1)).await.unwrap_err();
        assert_eq!(err, CallError::CrashedDuringExecution("Uncaught Error".into()));
    }

    #[tokio::test]
    async fn handler_error_is_not_a_crash() {
        let h = handle("error");
        let err = call(&h, Duration::from_secs(1)).await.unwrap_err();
        assert!(!err.is_crash());
        assert!(matches!(err, CallError::Handler(e) if e.message == "nope"));
    }

    struct Slow {
        finished: Arc<AtomicBool>,
    }

    impl Extension for Slow {
        fn id(&self) -> &str {
            "slow"
        }

        fn execute_command(self: Arc<Self>, _ctx: InvocationContext) -> CommandFuture {
            boxed_command(async move {
                tokio::time::sleep(Duration::from_millis(500)).await;
                self.finished.store(true, Ordering::SeqCst);
                Ok(CommandResponse::ephemeral("done"))
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_caller_aborts_running_call() {
        let finished = Arc::new(AtomicBool::new(false));
        let h = ExtensionHandle::new(ExtensionKind::Plugin, Arc::new(Slow { finished: finished.clone() }));

        let abandoned = tokio::time::timeout(Duration::from_millis(20), call(&h, Duration::from_millis(100))).await;
        assert!(abandoned.is_err());

        tokio::time::sleep(Duration::from_millis(700)).await;
        assert!(!finished.load(Ordering::SeqCst), "handler kept running after its caller left");
        assert_eq!(h.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn in_flight_counts_running_call() {
        let finished = Arc::new(AtomicBool::new(false));
        let h = ExtensionHandle::new(ExtensionKind::Plugin, Arc::new(Slow { finished: finished.clone() }));

        let running = {
            let h = h.clone();
            tokio::spawn(async move { call(&h, Duration::from_secs(1)).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(h.in_flight(), 1);

        assert_eq!(running.await.unwrap().unwrap().text, "done");
        assert!(finished.load(Ordering::SeqCst));
        assert_eq!(h.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_handler_times_out() {
        let h = handle("hang");
        let err = call(&h, Duration::from_millis(50)).await.unwrap_err();
        assert_eq!(err, CallError::TimedOut(Duration::from_millis(50)));
        assert_eq!(h.in_flight(), 0);
    }
}
