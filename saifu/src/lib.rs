//! Saifu - a custodial, multi-tenant UTXO wallet engine.
//!
//! This crate keeps one deterministic key per user, tracks spendable outputs
//! in an in-memory ledger, and turns transfer requests into signed, broadcast
//! transactions through a pluggable node client.
//!
//! # Architecture
//!
//! The engine is organized around these core components:
//!
//! - **Keys** ([`keys`]) - Fixed-path BIP-32 derivation, one P2PKH key per user
//! - **Ledger** ([`ledger`]) - UTXO ownership with node-validated balances
//! - **Builder** ([`builder`]) - Coin selection, fee sizing, signing, verification
//! - **Node** ([`node`]) - Client trait, feed events, simulator and HTTP adapter
//! - **Manager** ([`manager`]) - Wallet state owner tying the above together
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use saifu::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let (feed_tx, _feed_rx) = saifu::node::feed_channel();
//!     let node = Arc::new(MemoryNode::new().with_events(feed_tx));
//!     let (mut wallet, _events) = WalletManager::builder()
//!         .with_node(node)
//!         .with_transfers(Arc::new(NoTransfers))
//!         .build()?;
//!     wallet.load_key("cli:alice", "acct-1", &[7u8; 32]).await?;
//!     Ok(())
//! }
//! ```

// Core modules
pub mod builder;
pub mod error;
pub mod keys;
pub mod ledger;
pub mod manager;
pub mod node;

/// Prelude module for convenient imports.
pub mod prelude {
    // Error types (centralized)
    pub use crate::error::{NodeError, NodeResult, Result, WalletError};

    // Keys
    pub use crate::keys::{DerivationParams, KeyDerivation, UserId, WalletKey};

    // Ledger
    pub use crate::ledger::{Utxo, UtxoLedger};

    // Builder
    pub use crate::builder::{BuiltTransfer, CandidateInput, TxBuilder};

    // Node
    pub use crate::node::http::HttpNodeClient;
    pub use crate::node::{
        FeedEvent, MemoryNode, NodeClient, RetryPolicy, UtxoState, UtxoStatus, feed_channel,
        with_read_retry,
    };

    // Manager
    pub use crate::manager::{
        AccountId, InitUser, NoTransfers, TransferDestination, TransferLookup, TransferOutcome,
        TransferRequest, TxOrigin, WalletEvent, WalletManager, WalletManagerBuilder,
    };
}
