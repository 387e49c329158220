//! Saifu Bot - a custodial wallet service with pluggable chat platforms.
//!
//! This crate wires the [`saifu`] wallet engine into a command-driven
//! service: platform adapters parse user input into wallet commands,
//! a handler executes them against the shared wallet, and deposit
//! activity from the chain flows back out as notifications.
//!
//! # Architecture
//!
//! - **Command Bus** ([`bus`]) - Async queue decoupling adapters from the handler
//! - **Platforms** ([`platforms`]) - Chat platform adapters (CLI built in)
//! - **Handler** ([`handler`]) - Command execution against the wallet engine
//! - **Store** ([`store`]) - Account, user and transfer record persistence
//! - **Gateway** ([`gateway`]) - Unified orchestration of all components
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use saifu_bot::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let gateway = GatewayBuilder::new()
//!         .bot_config(load_config().await?)
//!         .simulate(true)
//!         .build()
//!         .await?;
//!     gateway.run().await
//! }
//! ```

pub mod bus;
pub mod config;
pub mod error;
pub mod events;
pub mod gateway;
pub mod handler;
pub mod platform;
pub mod platforms;
pub mod store;
pub mod util;

/// Commonly used types, re-exported for convenience.
pub mod prelude {
    // Errors
    pub use crate::error::{
        BotError, BusError, CommandError, ConfigError, ErrorContext, PlatformError, Result,
        StorageError,
    };

    // Events and bus
    pub use crate::bus::{BusStats, CommandBus, CommandBusBuilder, CommandHandle, NotifyHandle};
    pub use crate::events::{Command, CommandRequest, Notification};

    // Platforms
    pub use crate::platform::{
        AdapterManager, AdapterState, AdapterStatus, Platform, PlatformAdapter,
    };
    pub use crate::platforms::{CliAdapter, CliAdapterConfig, run_interactive};

    // Configuration
    pub use crate::config::{BotConfig, config_path, init_config, load_config, save_config};

    // Storage
    pub use crate::store::{
        AccountRecord, DepositRecord, FileStore, GiveRecord, MemoryStore, StoreTransferLookup,
        UserRecord, WalletStore, WithdrawalRecord,
    };

    // Execution
    pub use crate::gateway::{Gateway, GatewayBuilder, GatewayStatus};
    pub use crate::handler::{CommandHandler, HandlerConfig, WalletRef, user_message};

    // Wallet engine
    pub use saifu::manager::{WalletEvent, WalletManager};
}
