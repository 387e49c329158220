//! Node access: the client trait, feed events and the read-retry policy.
//!
//! The engine never talks to a chain directly; everything goes through
//! [`NodeClient`]. Implementations push [`FeedEvent`]s into a bounded channel
//! created with [`feed_channel`], and a single consumer task applies them to
//! the wallet, so ledger updates are serialized by construction.
//!
//! Reads may be retried with [`with_read_retry`]. Broadcasts are submitted
//! exactly once per transfer attempt: a timed-out broadcast has an unknown
//! outcome and blindly resubmitting it could double-spend.

pub mod http;
pub mod memory;

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use bitcoin::{OutPoint, ScriptBuf, Transaction, TxOut, Txid};
use tokio::sync::mpsc;
use tracing::warn;

use crate::error::{NodeError, NodeResult};

pub use http::HttpNodeClient;
pub use memory::MemoryNode;

/// Default capacity of the feed event channel.
pub const DEFAULT_FEED_CAPACITY: usize = 256;

/// Chain events pushed by the node feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedEvent {
    /// A transaction entered the mempool.
    AddedToMempool(Txid),
    /// A transaction was included in a block.
    Confirmed(Txid),
}

impl FeedEvent {
    /// The transaction the event refers to.
    #[must_use]
    pub const fn txid(&self) -> Txid {
        match self {
            Self::AddedToMempool(txid) | Self::Confirmed(txid) => *txid,
        }
    }
}

/// Existence and spend state of one outpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UtxoState {
    /// The node does not know the transaction.
    NoSuchTx,
    /// The transaction exists but has no output at that index.
    NoSuchOutput,
    /// The output exists and has been spent.
    Spent,
    /// The output exists and is spendable.
    Unspent,
}

/// Validation result for one outpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UtxoStatus {
    /// Existence and spend state.
    pub state: UtxoState,
    /// Whether the funding transaction is confirmed.
    pub confirmed: bool,
}

impl UtxoStatus {
    /// Whether the outpoint can fund a transfer.
    #[must_use]
    pub const fn is_spendable(&self) -> bool {
        matches!(self.state, UtxoState::Unspent)
    }
}

/// Access to a chain node or indexer.
///
/// One status is returned per requested outpoint, in request order. Script
/// subscriptions control which events the feed carries.
#[async_trait]
pub trait NodeClient: Send + Sync {
    /// Begin watching a script for mempool and confirmation events.
    async fn subscribe_script(&self, script: &ScriptBuf) -> NodeResult<()>;

    /// Stop watching a script.
    async fn unsubscribe_script(&self, script: &ScriptBuf) -> NodeResult<()>;

    /// Spendable outputs currently paying the script.
    async fn fetch_utxos(&self, script: &ScriptBuf) -> NodeResult<Vec<(OutPoint, u64)>>;

    /// Validate outpoints against current chain state.
    async fn validate_utxos(&self, outpoints: &[OutPoint]) -> NodeResult<Vec<UtxoStatus>>;

    /// Outputs of an arbitrary transaction, mempool or confirmed.
    async fn fetch_transaction(&self, txid: Txid) -> NodeResult<Vec<TxOut>>;

    /// Submit a signed transaction. Called at most once per transfer attempt.
    async fn broadcast(&self, tx: &Transaction) -> NodeResult<Txid>;
}

/// Create the bounded channel feed events are delivered through.
#[must_use]
pub fn feed_channel() -> (mpsc::Sender<FeedEvent>, mpsc::Receiver<FeedEvent>) {
    mpsc::channel(DEFAULT_FEED_CAPACITY)
}

/// Bounds on node read attempts. Broadcasts ignore this policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub attempts: u32,
    /// Deadline for each attempt.
    pub timeout: Duration,
    /// Delay before the first retry; doubles after each failure.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            timeout: Duration::from_secs(10),
            backoff: Duration::from_millis(500),
        }
    }
}

/// Run a node read under the retry policy.
///
/// Each attempt gets its own deadline. Retryable failures back off
/// exponentially; rejections return immediately.
///
/// # Errors
///
/// Returns the last error once attempts are exhausted.
pub async fn with_read_retry<T, F, Fut>(policy: RetryPolicy, mut op: F) -> NodeResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = NodeResult<T>>,
{
    let mut delay = policy.backoff;
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        let outcome = match tokio::time::timeout(policy.timeout, op()).await {
            Ok(result) => result,
            Err(_) => Err(NodeError::Timeout(policy.timeout)),
        };
        match outcome {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < policy.attempts => {
                warn!(attempt, error = %err, "node read failed, retrying");
                tokio::time::sleep(delay).await;
                delay = delay.saturating_mul(2);
            }
            Err(err) => return Err(err),
        }
    }
}
