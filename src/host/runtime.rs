//! Component runtime — shared scaffolding for the host's background tasks.
//!
//! A [`Component`] is any independently-runnable unit of the host: the
//! lifecycle worker, the control loop, the console channel. Components
//! capture their shared state at construction and are handed to
//! [`spawn_components`].
//!
//! A component that fails or panics cancels the shared [`CancellationToken`]
//! on its way out, so its siblings stop cooperatively.

use std::future::Future;
use std::pin::Pin;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::error::AppError;

/// A boxed, owned future returned by [`Component::run`].
pub type ComponentFuture = Pin<Box<dyn Future<Output = Result<(), AppError>> + Send + 'static>>;

pub trait Component: Send + 'static {
    /// Stable identifier used in log messages.
    fn id(&self) -> &str;

    /// Consume the component and return its run loop. The future should
    /// return once `shutdown` is cancelled.
    fn run(self: Box<Self>, shutdown: CancellationToken) -> ComponentFuture;
}

/// The running component set. Dropping it aborts every component.
pub struct ComponentsHandle {
    tasks: JoinSet<(String, Result<(), AppError>)>,
}

impl ComponentsHandle {
    /// Wait for every component to exit. The first failure is returned.
    pub async fn join(mut self) -> Result<(), AppError> {
        let mut outcome = Ok(());
        while let Some(joined) = self.tasks.join_next().await {
            let failure = match joined {
                Ok((id, Ok(()))) => {
                    debug!(component = %id, "component stopped");
                    continue;
                }
                Ok((id, Err(e))) => {
                    error!(component = %id, error = %e, "component failed");
                    e
                }
                Err(e) => {
                    error!(error = %e, "component panicked");
                    AppError::Component(format!("component panicked: {e}"))
                }
            };
            if outcome.is_ok() {
                outcome = Err(failure);
            }
        }
        outcome
    }
}

/// Spawn each component on its own task.
///
/// A component that returns an error or panics cancels `shutdown` as it
/// exits, without waiting for [`ComponentsHandle::join`].
pub fn spawn_components(
    components: Vec<Box<dyn Component>>,
    shutdown: CancellationToken,
) -> ComponentsHandle {
    let mut tasks = JoinSet::new();
    for component in components {
        let id = component.id().to_string();
        debug!(component = %id, "spawning component");
        let run = component.run(shutdown.clone());
        let cancel_on_failure = shutdown.clone().drop_guard();
        tasks.spawn(async move {
            let result = run.await;
            if result.is_ok() {
                cancel_on_failure.disarm();
            }
            (id, result)
        });
    }
    ComponentsHandle { tasks }
}
