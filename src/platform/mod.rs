//! Platform services shared by the command core and the extensions.

pub mod config;
