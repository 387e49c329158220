//! In-process node simulator.
//!
//! Backs tests and `--simulate` runs: outputs are funded and confirmed
//! explicitly, broadcasts are applied to an in-memory chain state, and feed
//! events are emitted the same way a real node adapter would emit them.

use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use bitcoin::{OutPoint, ScriptBuf, Transaction, TxOut, Txid};
use tokio::sync::{Mutex, mpsc};
use tracing::debug;

use crate::error::{NodeError, NodeResult};
use crate::node::{FeedEvent, NodeClient, UtxoState, UtxoStatus};

#[derive(Debug, Clone)]
struct TrackedUtxo {
    script_pubkey: ScriptBuf,
    value: u64,
    spent: bool,
    confirmed: bool,
}

#[derive(Debug, Default)]
struct MemoryNodeInner {
    watched: HashSet<ScriptBuf>,
    transactions: HashMap<Txid, Vec<TxOut>>,
    // BTreeMap keeps fetch_utxos deterministic
    utxos: BTreeMap<OutPoint, TrackedUtxo>,
    fail_next_broadcast: Option<String>,
    broadcasts: u64,
}

/// A node that lives entirely in process.
#[derive(Debug, Default)]
pub struct MemoryNode {
    inner: Mutex<MemoryNodeInner>,
    events_tx: Option<mpsc::Sender<FeedEvent>>,
}

impl MemoryNode {
    /// Create a simulator with no feed attached.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach the feed channel events are emitted into.
    #[must_use]
    pub fn with_events(mut self, events_tx: mpsc::Sender<FeedEvent>) -> Self {
        self.events_tx = Some(events_tx);
        self
    }

    /// Register a transaction with the given outputs and emit its mempool
    /// event, as if it arrived from the network.
    pub async fn fund_transaction(&self, txid: Txid, outputs: &[(ScriptBuf, u64)]) {
        {
            let mut inner = self.inner.lock().await;
            let mut txouts = Vec::with_capacity(outputs.len());
            for (vout, (script, value)) in (0u32..).zip(outputs.iter()) {
                inner.utxos.insert(
                    OutPoint::new(txid, vout),
                    TrackedUtxo {
                        script_pubkey: script.clone(),
                        value: *value,
                        spent: false,
                        confirmed: false,
                    },
                );
                txouts.push(TxOut {
                    value: bitcoin::Amount::from_sat(*value),
                    script_pubkey: script.clone(),
                });
            }
            inner.transactions.insert(txid, txouts);
        }
        self.emit(FeedEvent::AddedToMempool(txid)).await;
    }

    /// Register a single-output transaction paying `script` and return its
    /// outpoint.
    pub async fn fund_script(&self, script: &ScriptBuf, txid: Txid, value: u64) -> OutPoint {
        self.fund_transaction(txid, &[(script.clone(), value)]).await;
        OutPoint::new(txid, 0)
    }

    /// Mark a transaction confirmed and emit its confirmation event.
    pub async fn confirm(&self, txid: Txid) {
        {
            let mut inner = self.inner.lock().await;
            let confirmed: Vec<OutPoint> = inner
                .utxos
                .keys()
                .filter(|outpoint| outpoint.txid == txid)
                .copied()
                .collect();
            for outpoint in confirmed {
                if let Some(utxo) = inner.utxos.get_mut(&outpoint) {
                    utxo.confirmed = true;
                }
            }
        }
        self.emit(FeedEvent::Confirmed(txid)).await;
    }

    /// Make the next broadcast fail with `reason`.
    pub async fn fail_next_broadcast(&self, reason: impl Into<String>) {
        self.inner.lock().await.fail_next_broadcast = Some(reason.into());
    }

    /// Number of broadcast attempts seen, including failed ones.
    pub async fn broadcast_count(&self) -> u64 {
        self.inner.lock().await.broadcasts
    }

    /// Whether a script is currently subscribed.
    pub async fn is_watched(&self, script: &ScriptBuf) -> bool {
        self.inner.lock().await.watched.contains(script)
    }

    async fn emit(&self, event: FeedEvent) {
        if let Some(events_tx) = &self.events_tx {
            if events_tx.send(event).await.is_err() {
                debug!("feed receiver dropped, event discarded");
            }
        }
    }
}

#[async_trait]
impl NodeClient for MemoryNode {
    async fn subscribe_script(&self, script: &ScriptBuf) -> NodeResult<()> {
        self.inner.lock().await.watched.insert(script.clone());
        Ok(())
    }

    async fn unsubscribe_script(&self, script: &ScriptBuf) -> NodeResult<()> {
        self.inner.lock().await.watched.remove(script);
        Ok(())
    }

    async fn fetch_utxos(&self, script: &ScriptBuf) -> NodeResult<Vec<(OutPoint, u64)>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .utxos
            .iter()
            .filter(|(_, utxo)| !utxo.spent && utxo.script_pubkey == *script)
            .map(|(outpoint, utxo)| (*outpoint, utxo.value))
            .collect())
    }

    async fn validate_utxos(&self, outpoints: &[OutPoint]) -> NodeResult<Vec<UtxoStatus>> {
        let inner = self.inner.lock().await;
        Ok(outpoints
            .iter()
            .map(|outpoint| match inner.transactions.get(&outpoint.txid) {
                None => UtxoStatus {
                    state: UtxoState::NoSuchTx,
                    confirmed: false,
                },
                Some(outputs) if outpoint.vout as usize >= outputs.len() => UtxoStatus {
                    state: UtxoState::NoSuchOutput,
                    confirmed: false,
                },
                Some(_) => {
                    let utxo = inner.utxos.get(outpoint);
                    let confirmed = utxo.is_some_and(|u| u.confirmed);
                    let spent = utxo.is_none_or(|u| u.spent);
                    UtxoStatus {
                        state: if spent { UtxoState::Spent } else { UtxoState::Unspent },
                        confirmed,
                    }
                }
            })
            .collect())
    }

    async fn fetch_transaction(&self, txid: Txid) -> NodeResult<Vec<TxOut>> {
        self.inner
            .lock()
            .await
            .transactions
            .get(&txid)
            .cloned()
            .ok_or_else(|| NodeError::rejected(format!("unknown transaction {txid}")))
    }

    async fn broadcast(&self, tx: &Transaction) -> NodeResult<Txid> {
        let txid = tx.compute_txid();
        {
            let mut inner = self.inner.lock().await;
            inner.broadcasts += 1;
            if let Some(reason) = inner.fail_next_broadcast.take() {
                return Err(NodeError::unavailable(reason));
            }
            for input in &tx.input {
                match inner.utxos.get(&input.previous_output) {
                    Some(utxo) if !utxo.spent => {}
                    _ => {
                        return Err(NodeError::rejected(format!(
                            "bad-txns-inputs-missingorspent: {}",
                            input.previous_output
                        )));
                    }
                }
            }
            for input in &tx.input {
                if let Some(utxo) = inner.utxos.get_mut(&input.previous_output) {
                    utxo.spent = true;
                }
            }
            for (vout, txout) in (0u32..).zip(tx.output.iter()) {
                inner.utxos.insert(
                    OutPoint::new(txid, vout),
                    TrackedUtxo {
                        script_pubkey: txout.script_pubkey.clone(),
                        value: txout.value.to_sat(),
                        spent: false,
                        confirmed: false,
                    },
                );
            }
            inner.transactions.insert(txid, tx.output.clone());
        }
        self.emit(FeedEvent::AddedToMempool(txid)).await;
        Ok(txid)
    }
}

#[cfg(test)]
mod tests {
    use bitcoin::absolute::LockTime;
    use bitcoin::hashes::Hash;
    use bitcoin::transaction::Version;
    use bitcoin::{Amount, Sequence, TxIn, Witness};

    use super::*;

    fn txid(byte: u8) -> Txid {
        Txid::from_byte_array([byte; 32])
    }

    fn script(byte: u8) -> ScriptBuf {
        ScriptBuf::from_bytes(vec![0x51, byte])
    }

    fn spend(outpoint: OutPoint, destination: &ScriptBuf, value: u64) -> Transaction {
        Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                previous_output: outpoint,
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            }],
            output: vec![TxOut {
                value: Amount::from_sat(value),
                script_pubkey: destination.clone(),
            }],
        }
    }

    #[tokio::test]
    async fn funded_outputs_are_fetchable() {
        let node = MemoryNode::new();
        let outpoint = node.fund_script(&script(1), txid(0xaa), 50_000).await;
        let utxos = node.fetch_utxos(&script(1)).await.unwrap();
        assert_eq!(utxos, vec![(outpoint, 50_000)]);
        assert!(node.fetch_utxos(&script(2)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn broadcast_spends_inputs_and_registers_outputs() {
        let (events_tx, mut events_rx) = crate::node::feed_channel();
        let node = MemoryNode::new().with_events(events_tx);
        let outpoint = node.fund_script(&script(1), txid(0xaa), 50_000).await;
        assert_eq!(
            events_rx.recv().await,
            Some(FeedEvent::AddedToMempool(txid(0xaa)))
        );

        let tx = spend(outpoint, &script(2), 49_000);
        let new_txid = node.broadcast(&tx).await.unwrap();
        assert_eq!(
            events_rx.recv().await,
            Some(FeedEvent::AddedToMempool(new_txid))
        );
        assert!(node.fetch_utxos(&script(1)).await.unwrap().is_empty());
        let utxos = node.fetch_utxos(&script(2)).await.unwrap();
        assert_eq!(utxos, vec![(OutPoint::new(new_txid, 0), 49_000)]);

        // the same input cannot be spent twice
        let err = node.broadcast(&tx).await.unwrap_err();
        assert!(matches!(err, NodeError::Rejected(_)));
        assert_eq!(node.broadcast_count().await, 2);
    }

    #[tokio::test]
    async fn scripted_broadcast_failure_fires_once() {
        let node = MemoryNode::new();
        let outpoint = node.fund_script(&script(1), txid(0xaa), 50_000).await;
        node.fail_next_broadcast("connection reset").await;

        let tx = spend(outpoint, &script(2), 49_000);
        let err = node.broadcast(&tx).await.unwrap_err();
        assert!(matches!(err, NodeError::Unavailable(_)));
        // the failed broadcast must not have spent anything
        assert_eq!(node.fetch_utxos(&script(1)).await.unwrap().len(), 1);

        node.broadcast(&tx).await.unwrap();
    }

    #[tokio::test]
    async fn validation_matrix() {
        let node = MemoryNode::new();
        let outpoint = node.fund_script(&script(1), txid(0xaa), 50_000).await;

        let statuses = node
            .validate_utxos(&[
                OutPoint::new(txid(0xbb), 0),
                OutPoint::new(txid(0xaa), 7),
                outpoint,
            ])
            .await
            .unwrap();
        assert_eq!(statuses[0].state, UtxoState::NoSuchTx);
        assert_eq!(statuses[1].state, UtxoState::NoSuchOutput);
        assert_eq!(statuses[2].state, UtxoState::Unspent);
        assert!(!statuses[2].confirmed);

        node.confirm(txid(0xaa)).await;
        let statuses = node.validate_utxos(&[outpoint]).await.unwrap();
        assert!(statuses[0].confirmed);

        node.broadcast(&spend(outpoint, &script(2), 49_000))
            .await
            .unwrap();
        let statuses = node.validate_utxos(&[outpoint]).await.unwrap();
        assert_eq!(statuses[0].state, UtxoState::Spent);
    }

    #[tokio::test]
    async fn subscriptions_are_tracked() {
        let node = MemoryNode::new();
        node.subscribe_script(&script(1)).await.unwrap();
        assert!(node.is_watched(&script(1)).await);
        node.unsubscribe_script(&script(1)).await.unwrap();
        assert!(!node.is_watched(&script(1)).await);
    }
}
