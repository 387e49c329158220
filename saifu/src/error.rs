//! Error types for the wallet engine.
//!
//! Every fallible operation returns a typed error. [`WalletError`] is the
//! engine-wide taxonomy; [`NodeError`] belongs to node client implementations
//! and is mapped into [`WalletError`] at the call site, since the same
//! transport failure means different things on a read, a broadcast and at
//! startup.

use std::time::Duration;

use thiserror::Error;

/// Result alias for wallet engine operations.
pub type Result<T> = std::result::Result<T, WalletError>;

/// Result alias for node client operations.
pub type NodeResult<T> = std::result::Result<T, NodeError>;

/// Errors produced by wallet engine operations.
#[derive(Debug, Error)]
pub enum WalletError {
    /// A request failed validation before any state was touched.
    #[error("validation: {0}")]
    Validation(String),

    /// Spendable funds do not cover the requested amount plus fee.
    #[error("insufficient funds: {available} sat available, {required} sat required")]
    InsufficientFunds {
        /// Total spendable value of the candidate inputs.
        available: u64,
        /// Amount plus the estimated fee for the selected inputs.
        required: u64,
    },

    /// Transaction construction or post-sign verification failed.
    #[error("build: {0}")]
    Build(String),

    /// The node rejected a broadcast or it never reached the node.
    #[error("broadcast: {0}")]
    Broadcast(String),

    /// A node read failed or the feed diverged from local state.
    #[error("feed desync: {0}")]
    FeedDesync(String),

    /// Startup or key-loading failure that leaves the wallet unusable.
    #[error("fatal init: {0}")]
    FatalInit(String),
}

impl WalletError {
    /// Create a validation error.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a build error.
    pub fn build(msg: impl Into<String>) -> Self {
        Self::Build(msg.into())
    }

    /// Create a broadcast error.
    pub fn broadcast(msg: impl Into<String>) -> Self {
        Self::Broadcast(msg.into())
    }

    /// Create a feed desync error.
    pub fn feed_desync(msg: impl Into<String>) -> Self {
        Self::FeedDesync(msg.into())
    }

    /// Create a fatal initialization error.
    pub fn fatal_init(msg: impl Into<String>) -> Self {
        Self::FatalInit(msg.into())
    }

    /// Map a node error raised by a read operation.
    #[must_use]
    pub fn node_read(err: NodeError) -> Self {
        Self::FeedDesync(err.to_string())
    }

    /// Map a node error raised by a broadcast.
    #[must_use]
    pub fn node_broadcast(err: NodeError) -> Self {
        Self::Broadcast(err.to_string())
    }

    /// Whether the error describes a caller mistake rather than an engine
    /// or node fault.
    #[must_use]
    pub const fn is_user_error(&self) -> bool {
        matches!(self, Self::Validation(_) | Self::InsufficientFunds { .. })
    }
}

/// Errors surfaced by node client implementations.
#[derive(Debug, Error)]
pub enum NodeError {
    /// The node endpoint could not be reached.
    #[error("node unavailable: {0}")]
    Unavailable(String),

    /// A node request exceeded its deadline.
    #[error("node timeout after {0:?}")]
    Timeout(Duration),

    /// The node answered but refused the request.
    #[error("node rejected request: {0}")]
    Rejected(String),

    /// The node connection or its event feed is closed.
    #[error("node connection closed")]
    Closed,
}

impl NodeError {
    /// Create an unavailability error.
    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::Unavailable(msg.into())
    }

    /// Create a rejection error.
    pub fn rejected(msg: impl Into<String>) -> Self {
        Self::Rejected(msg.into())
    }

    /// Whether retrying the same request can reasonably succeed.
    ///
    /// Only transient transport failures qualify. Rejections are final and
    /// broadcasts are never retried regardless of this flag.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Timeout(_))
    }
}
