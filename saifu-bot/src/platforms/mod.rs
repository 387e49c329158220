//! Platform adapter implementations.
//!
//! Each submodule connects one chat platform to the command bus. Only the
//! CLI adapter is built in; network platforms plug in through the same
//! [`PlatformAdapter`](crate::platform::PlatformAdapter) trait.

pub mod cli;

pub use cli::{CliAdapter, CliAdapterConfig, run_interactive};
