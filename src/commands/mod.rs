//! Slash commands — data model, registry, dispatcher and the core command set.

pub mod builtin;
pub mod dispatch;
pub mod model;
pub mod registry;

pub use dispatch::{DispatchError, Dispatcher};
pub use model::{
    Command, CommandResponse, CommandSource, HandlerError, InvocationContext, Namespace,
};
pub use registry::{CommandRegistry, RegistryError};
