//! Command host — slash-command registry, dispatcher and extension lifecycle.
//!
//! Extensions (plugins, products and the core command set) register triggers
//! in a shared [`commands::CommandRegistry`]. The [`commands::Dispatcher`]
//! resolves each invocation to one handler by tier and recency and runs it
//! behind a crash- and timeout-isolating call boundary. The
//! [`extensions::lifecycle::LifecycleCoordinator`] activates and removes
//! extensions, cleans up after crashes and fans out configuration changes.

pub mod commands;
pub mod config;
pub mod error;
pub mod extensions;
pub mod host;
pub mod logger;
pub mod platform;
pub mod product;

pub use commands::{
    Command, CommandRegistry, CommandResponse, DispatchError, Dispatcher, HandlerError,
    InvocationContext, Namespace,
};
pub use error::AppError;
pub use extensions::api::ExtensionApi;
pub use extensions::lifecycle::LifecycleCoordinator;
pub use extensions::{Capabilities, Extension, ExtensionKind};
pub use host::CommandHost;
