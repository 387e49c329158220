//! In-memory UTXO ledger.
//!
//! The ledger is the engine's balance source of truth. It only ever gains
//! entries from node feed events, never from transfers the engine builds
//! itself: a submitted transfer removes the outputs it consumed, and its own
//! outputs come back through the feed like anyone else's. Every outpoint is
//! tracked globally, so a replayed feed event credits a user exactly once.

use std::collections::{HashMap, HashSet};

use bitcoin::{OutPoint, Txid};
use tracing::{debug, warn};

use crate::error::{Result, WalletError};
use crate::keys::UserId;
use crate::node::NodeClient;

/// A single ledger entry: one unspent output credited to one user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Utxo {
    /// Location of the output on chain.
    pub outpoint: OutPoint,
    /// Output value in satoshis.
    pub value_sats: u64,
    /// User whose deposit script the output pays.
    pub owner: UserId,
}

/// Per-user spendable outputs with global outpoint dedupe.
#[derive(Debug, Default)]
pub struct UtxoLedger {
    utxos: HashMap<UserId, Vec<Utxo>>,
    outpoints: HashSet<OutPoint>,
}

impl UtxoLedger {
    /// Create an empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Credit an output to its owner.
    ///
    /// Returns `false` without changing anything when the outpoint is
    /// already tracked, for any user.
    pub fn apply(&mut self, utxo: Utxo) -> bool {
        if !self.outpoints.insert(utxo.outpoint) {
            return false;
        }
        debug!(
            user = %utxo.owner,
            outpoint = %utxo.outpoint,
            value_sats = utxo.value_sats,
            "ledger entry added"
        );
        self.utxos.entry(utxo.owner.clone()).or_default().push(utxo);
        true
    }

    /// Drop the given outpoints from every user's holdings.
    ///
    /// Unknown outpoints are ignored.
    pub fn remove_consumed(&mut self, consumed: &[OutPoint]) {
        let consumed: HashSet<OutPoint> = consumed.iter().copied().collect();
        for outpoint in &consumed {
            self.outpoints.remove(outpoint);
        }
        for utxos in self.utxos.values_mut() {
            utxos.retain(|utxo| !consumed.contains(&utxo.outpoint));
        }
        self.utxos.retain(|_, utxos| !utxos.is_empty());
    }

    /// Outputs currently credited to a user, in arrival order.
    #[must_use]
    pub fn user_utxos(&self, user_id: &str) -> &[Utxo] {
        self.utxos.get(user_id).map_or(&[], Vec::as_slice)
    }

    /// Sum of a user's tracked outputs in satoshis.
    #[must_use]
    pub fn user_total(&self, user_id: &str) -> u64 {
        self.user_utxos(user_id)
            .iter()
            .map(|utxo| utxo.value_sats)
            .sum()
    }

    /// Outpoints currently credited to a user, in arrival order.
    #[must_use]
    pub fn outpoints_for(&self, user_id: &str) -> Vec<OutPoint> {
        self.user_utxos(user_id)
            .iter()
            .map(|utxo| utxo.outpoint)
            .collect()
    }

    /// Whether any tracked output came from the given transaction.
    #[must_use]
    pub fn has_txid(&self, txid: Txid) -> bool {
        self.outpoints
            .iter()
            .any(|outpoint| outpoint.txid == txid)
    }

    /// Total number of tracked outputs across all users.
    #[must_use]
    pub fn len(&self) -> usize {
        self.outpoints.len()
    }

    /// Whether the ledger tracks no outputs at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.outpoints.is_empty()
    }

    /// Every tracked output across all users.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Utxo> {
        self.utxos.values().flatten().cloned().collect()
    }

    /// Re-check a user's holdings against the node and drop anything the
    /// node no longer reports as spendable.
    ///
    /// # Errors
    ///
    /// Returns [`WalletError::FeedDesync`] when the node cannot be read or
    /// answers with the wrong number of statuses.
    pub async fn reconcile(&mut self, user_id: &str, node: &dyn NodeClient) -> Result<()> {
        let outpoints = self.outpoints_for(user_id);
        if outpoints.is_empty() {
            return Ok(());
        }
        let statuses = node
            .validate_utxos(&outpoints)
            .await
            .map_err(WalletError::node_read)?;
        if statuses.len() != outpoints.len() {
            return Err(WalletError::feed_desync(format!(
                "node returned {} statuses for {} outpoints",
                statuses.len(),
                outpoints.len()
            )));
        }
        let stale: Vec<OutPoint> = outpoints
            .into_iter()
            .zip(&statuses)
            .filter(|(_, status)| !status.is_spendable())
            .map(|(outpoint, status)| {
                warn!(
                    user = user_id,
                    %outpoint,
                    state = ?status.state,
                    "dropping ledger entry the node no longer backs"
                );
                outpoint
            })
            .collect();
        if !stale.is_empty() {
            self.remove_consumed(&stale);
        }
        Ok(())
    }

    /// Reconcile a user against the node, then return the surviving total.
    ///
    /// # Errors
    ///
    /// Returns [`WalletError::FeedDesync`] when reconciliation fails.
    pub async fn validated_balance(&mut self, user_id: &str, node: &dyn NodeClient) -> Result<u64> {
        self.reconcile(user_id, node).await?;
        Ok(self.user_total(user_id))
    }
}

#[cfg(test)]
mod tests {
    use bitcoin::absolute::LockTime;
    use bitcoin::hashes::Hash;
    use bitcoin::transaction::Version;
    use bitcoin::{Amount, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Witness};

    use super::*;
    use crate::node::MemoryNode;

    fn txid(byte: u8) -> Txid {
        Txid::from_byte_array([byte; 32])
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

    fn utxo(txid_byte: u8, vout: u32, value_sats: u64, owner: &str) -> Utxo {
        Utxo {
            outpoint: OutPoint::new(txid(txid_byte), vout),
            value_sats,
            owner: owner.to_string(),
        }
    }

    #[test]
    fn duplicate_outpoints_credit_once() {
        let mut ledger = UtxoLedger::new();
        assert!(ledger.apply(utxo(0xaa, 0, 30_000, "alice")));
        assert!(!ledger.apply(utxo(0xaa, 0, 30_000, "alice")));
        // not even for a different claimed owner
        assert!(!ledger.apply(utxo(0xaa, 0, 30_000, "bob")));

        assert_eq!(ledger.user_total("alice"), 30_000);
        assert_eq!(ledger.user_total("bob"), 0);
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn consumed_outputs_leave_every_index() {
        let mut ledger = UtxoLedger::new();
        ledger.apply(utxo(0xaa, 0, 30_000, "alice"));
        ledger.apply(utxo(0xaa, 1, 20_000, "alice"));
        ledger.apply(utxo(0xbb, 0, 10_000, "bob"));

        ledger.remove_consumed(&[OutPoint::new(txid(0xaa), 0)]);
        assert_eq!(ledger.user_total("alice"), 20_000);
        assert!(ledger.has_txid(txid(0xaa)));

        ledger.remove_consumed(&[OutPoint::new(txid(0xaa), 1)]);
        assert!(!ledger.has_txid(txid(0xaa)));
        assert_eq!(ledger.user_utxos("alice"), &[]);
        assert_eq!(ledger.user_total("bob"), 10_000);
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn snapshot_covers_all_users() {
        let mut ledger = UtxoLedger::new();
        ledger.apply(utxo(0xaa, 0, 30_000, "alice"));
        ledger.apply(utxo(0xbb, 0, 10_000, "bob"));

        let mut owners: Vec<UserId> = ledger
            .snapshot()
            .into_iter()
            .map(|entry| entry.owner)
            .collect();
        owners.sort();
        assert_eq!(owners, vec!["alice".to_string(), "bob".to_string()]);
    }

    #[tokio::test]
    async fn reconcile_drops_what_the_node_disowns() {
        let node = MemoryNode::new();
        let script = ScriptBuf::from_bytes(vec![0x51, 0x01]);
        let kept = node.fund_script(&script, txid(0xaa), 30_000).await;
        let spent = node.fund_script(&script, txid(0xbb), 20_000).await;

        let mut ledger = UtxoLedger::new();
        ledger.apply(Utxo {
            outpoint: kept,
            value_sats: 30_000,
            owner: "alice".to_string(),
        });
        ledger.apply(Utxo {
            outpoint: spent,
            value_sats: 20_000,
            owner: "alice".to_string(),
        });
        // an entry the node never saw at all
        ledger.apply(utxo(0xcc, 0, 5_000, "alice"));

        let tx = spend(spent, &script, 19_000);
        node.broadcast(&tx).await.unwrap();

        let balance = ledger.validated_balance("alice", &node).await.unwrap();
        assert_eq!(balance, 30_000);
        assert_eq!(ledger.outpoints_for("alice"), vec![kept]);
    }
}
