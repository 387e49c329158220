//! Wallet orchestration: users, accounts, balances and transfers.
//!
//! The manager owns the key set, the account links and the UTXO ledger, and
//! is driven from two sides: commands (balances, transfers) and the node
//! feed. Ledger credits only ever come from feed events; a committed
//! transfer removes what it consumed and then waits for its own outputs to
//! arrive through the feed like any other transaction.
//!
//! Detected deposits are published on a bounded event channel after the
//! transfer lookup has classified the transaction: payouts of a recorded
//! internal transfer never produce a deposit event, and a withdrawal only
//! produces one for outputs landing on someone other than the withdrawing
//! user (its change stays silent).

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bitcoin::{Address, OutPoint, ScriptBuf, Txid};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::builder::{BuiltTransfer, CandidateInput, TxBuilder};
use crate::error::{Result, WalletError};
use crate::keys::{DerivationParams, KeyDerivation, UserId, WalletKey};
use crate::ledger::{Utxo, UtxoLedger};
use crate::node::{FeedEvent, NodeClient};

/// Groups users that share a balance.
pub type AccountId = String;

const DEFAULT_FEE_RATE: u64 = 2;
const DEFAULT_DUST_LIMIT: u64 = 546;
const DEFAULT_EVENT_CAPACITY: usize = 64;

/// Deposit notifications published by the manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalletEvent {
    /// A watched script gained an output from a transaction classified as a
    /// deposit for its owner.
    DepositDetected(Utxo),
    /// A transaction the ledger tracks outputs of was confirmed.
    DepositConfirmed(Txid),
}

/// How a transaction seen on the feed relates to this wallet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxOrigin {
    /// Not one of ours: every output on a watched script is a deposit.
    External,
    /// An internal transfer between users: no output is a deposit.
    Give,
    /// A withdrawal submitted by `source`: outputs are deposits for anyone
    /// but the withdrawing user.
    Withdrawal {
        /// User the withdrawal was built for.
        source: UserId,
    },
}

/// Classifies feed transactions against the service's transfer records.
#[async_trait]
pub trait TransferLookup: Send + Sync {
    /// Look up how `txid` originated.
    ///
    /// # Errors
    ///
    /// Returns the error of the backing record store.
    async fn classify(&self, txid: Txid) -> Result<TxOrigin>;
}

/// Lookup that classifies every transaction as external.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoTransfers;

#[async_trait]
impl TransferLookup for NoTransfers {
    async fn classify(&self, _txid: Txid) -> Result<TxOrigin> {
        Ok(TxOrigin::External)
    }
}

/// One user to register at startup.
#[derive(Clone)]
pub struct InitUser {
    /// Platform-scoped user id.
    pub user_id: UserId,
    /// Account the user belongs to.
    pub account_id: AccountId,
    /// Key seed, 16 to 64 bytes.
    pub seed: Vec<u8>,
}

impl fmt::Debug for InitUser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InitUser")
            .field("user_id", &self.user_id)
            .field("account_id", &self.account_id)
            .field("seed", &"<redacted>")
            .finish()
    }
}

/// Where a transfer pays to.
#[derive(Debug, Clone)]
pub enum TransferDestination {
    /// A registered user's deposit script.
    User(UserId),
    /// An arbitrary address, already checked for the right network.
    Address(Address),
}

/// A transfer order against one account's pooled balance.
#[derive(Debug, Clone)]
pub struct TransferRequest {
    /// Account whose members fund the transfer.
    pub source_account: AccountId,
    /// Payout target.
    pub destination: TransferDestination,
    /// Satoshis the destination should receive.
    pub amount_sats: u64,
}

/// Result of a broadcast transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferOutcome {
    /// Transaction id reported by the node.
    pub txid: Txid,
    /// Satoshis the destination received.
    pub sent_sats: u64,
    /// Satoshis paid as fee.
    pub fee_sats: u64,
}

/// Configures and creates a [`WalletManager`].
pub struct WalletManagerBuilder {
    params: DerivationParams,
    fee_rate: u64,
    dust_limit: u64,
    event_capacity: usize,
    node: Option<Arc<dyn NodeClient>>,
    transfers: Option<Arc<dyn TransferLookup>>,
}

impl Default for WalletManagerBuilder {
    fn default() -> Self {
        Self {
            params: DerivationParams::default(),
            fee_rate: DEFAULT_FEE_RATE,
            dust_limit: DEFAULT_DUST_LIMIT,
            event_capacity: DEFAULT_EVENT_CAPACITY,
            node: None,
            transfers: None,
        }
    }
}

impl fmt::Debug for WalletManagerBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WalletManagerBuilder")
            .field("params", &self.params)
            .field("fee_rate", &self.fee_rate)
            .field("dust_limit", &self.dust_limit)
            .field("event_capacity", &self.event_capacity)
            .finish_non_exhaustive()
    }
}

impl WalletManagerBuilder {
    /// Key derivation parameters, default mainnet BIP-44.
    #[must_use]
    pub const fn with_derivation(mut self, params: DerivationParams) -> Self {
        self.params = params;
        self
    }

    /// Fee rate in satoshis per byte.
    #[must_use]
    pub const fn with_fee_rate(mut self, sats_per_byte: u64) -> Self {
        self.fee_rate = sats_per_byte;
        self
    }

    /// Smallest output the transaction builder will create.
    #[must_use]
    pub const fn with_dust_limit(mut self, sats: u64) -> Self {
        self.dust_limit = sats;
        self
    }

    /// Capacity of the wallet event channel.
    #[must_use]
    pub const fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    /// Node client the manager reads from and broadcasts through.
    #[must_use]
    pub fn with_node(mut self, node: Arc<dyn NodeClient>) -> Self {
        self.node = Some(node);
        self
    }

    /// Transfer lookup used to classify feed transactions.
    #[must_use]
    pub fn with_transfers(mut self, transfers: Arc<dyn TransferLookup>) -> Self {
        self.transfers = Some(transfers);
        self
    }

    /// Create the manager and the receiving end of its event channel.
    ///
    /// # Errors
    ///
    /// Returns [`WalletError::FatalInit`] when the node client or transfer
    /// lookup is missing, or when the derivation parameters are invalid.
    pub fn build(self) -> Result<(WalletManager, mpsc::Receiver<WalletEvent>)> {
        let node = self
            .node
            .ok_or_else(|| WalletError::fatal_init("node client not configured"))?;
        let transfers = self
            .transfers
            .ok_or_else(|| WalletError::fatal_init("transfer lookup not configured"))?;
        let derivation = KeyDerivation::new(self.params)?;
        let (events_tx, events_rx) = mpsc::channel(self.event_capacity.max(1));
        let manager = WalletManager {
            derivation,
            builder: TxBuilder::new(self.fee_rate, self.dust_limit),
            node,
            transfers,
            keys: HashMap::new(),
            members: HashMap::new(),
            accounts: HashMap::new(),
            ledger: UtxoLedger::new(),
            events_tx,
            last_mempool: None,
            last_confirmed: None,
        };
        Ok((manager, events_rx))
    }
}

/// Custodial wallet over one node connection.
pub struct WalletManager {
    derivation: KeyDerivation,
    builder: TxBuilder,
    node: Arc<dyn NodeClient>,
    transfers: Arc<dyn TransferLookup>,
    keys: HashMap<UserId, WalletKey>,
    members: HashMap<AccountId, Vec<UserId>>,
    accounts: HashMap<UserId, AccountId>,
    ledger: UtxoLedger,
    events_tx: mpsc::Sender<WalletEvent>,
    last_mempool: Option<Txid>,
    last_confirmed: Option<Txid>,
}

impl fmt::Debug for WalletManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WalletManager")
            .field("users", &self.keys.len())
            .field("accounts", &self.members.len())
            .field("tracked_outputs", &self.ledger.len())
            .finish_non_exhaustive()
    }
}

impl WalletManager {
    /// Start configuring a manager.
    #[must_use]
    pub fn builder() -> WalletManagerBuilder {
        WalletManagerBuilder::default()
    }

    /// Register every user in `users`.
    ///
    /// # Errors
    ///
    /// Returns the first [`load_key`](Self::load_key) failure.
    pub async fn init(&mut self, users: Vec<InitUser>) -> Result<()> {
        let count = users.len();
        for user in users {
            self.load_key(&user.user_id, &user.account_id, &user.seed)
                .await?;
        }
        info!(users = count, "wallet users registered");
        Ok(())
    }

    /// Register a user: derive its key, watch its script and seed the
    /// ledger with outputs the node already knows about.
    ///
    /// Loading an already-known user only refreshes its account link.
    ///
    /// # Errors
    ///
    /// Returns [`WalletError::FatalInit`] when derivation fails and
    /// [`WalletError::FeedDesync`] when the node cannot be reached.
    pub async fn load_key(
        &mut self,
        user_id: &str,
        account_id: &str,
        seed: &[u8],
    ) -> Result<Address> {
        if let Some(key) = self.keys.get(user_id) {
            let address = key.address().clone();
            self.link(user_id, account_id);
            return Ok(address);
        }
        let key = self.derivation.derive(user_id, seed)?;
        self.node
            .subscribe_script(key.script_pubkey())
            .await
            .map_err(WalletError::node_read)?;
        let existing = self
            .node
            .fetch_utxos(key.script_pubkey())
            .await
            .map_err(WalletError::node_read)?;
        for (outpoint, value_sats) in existing {
            self.ledger.apply(Utxo {
                outpoint,
                value_sats,
                owner: user_id.to_string(),
            });
        }
        let address = key.address().clone();
        info!(user = %user_id, address = %address, "wallet key loaded");
        self.keys.insert(user_id.to_string(), key);
        self.link(user_id, account_id);
        Ok(address)
    }

    /// Move a user from one account to another.
    ///
    /// # Errors
    ///
    /// Returns [`WalletError::Validation`] when the user is unknown or not
    /// currently a member of `from_account`.
    pub fn update_link(
        &mut self,
        user_id: &str,
        from_account: &str,
        to_account: &str,
    ) -> Result<()> {
        if !self.keys.contains_key(user_id) {
            return Err(WalletError::validation(format!("unknown user {user_id}")));
        }
        match self.accounts.get(user_id) {
            Some(current) if current == from_account => {}
            Some(current) => {
                return Err(WalletError::validation(format!(
                    "user {user_id} belongs to {current}, not {from_account}"
                )));
            }
            None => {
                return Err(WalletError::validation(format!(
                    "user {user_id} has no account"
                )));
            }
        }
        self.link(user_id, to_account);
        info!(user = %user_id, from = %from_account, to = %to_account, "account link moved");
        Ok(())
    }

    /// The deposit address of a registered user.
    ///
    /// # Errors
    ///
    /// Returns [`WalletError::Validation`] for an unknown user.
    pub fn deposit_address(&self, user_id: &str) -> Result<&Address> {
        self.keys
            .get(user_id)
            .map(WalletKey::address)
            .ok_or_else(|| WalletError::validation(format!("unknown user {user_id}")))
    }

    /// Pooled balance of an account after validating every member's
    /// holdings against the node.
    ///
    /// # Errors
    ///
    /// Returns [`WalletError::FeedDesync`] when validation fails.
    pub async fn account_balance(&mut self, account_id: &str) -> Result<u64> {
        let members = self.members.get(account_id).cloned().unwrap_or_default();
        let mut total = 0u64;
        for member in &members {
            total += self
                .ledger
                .validated_balance(member, self.node.as_ref())
                .await?;
        }
        Ok(total)
    }

    /// Build and sign a transfer without broadcasting it.
    ///
    /// Members' holdings are re-validated first; candidates are offered to
    /// the builder in member order, each member's outputs in arrival order.
    ///
    /// # Errors
    ///
    /// Propagates validation, balance and build errors from the
    /// [`TxBuilder`], and [`WalletError::FeedDesync`] when re-validation
    /// fails.
    pub async fn prepare_transfer(&mut self, request: &TransferRequest) -> Result<BuiltTransfer> {
        let members = self
            .members
            .get(&request.source_account)
            .cloned()
            .unwrap_or_default();
        if members.is_empty() {
            return Err(WalletError::validation(format!(
                "account {} has no members",
                request.source_account
            )));
        }
        for member in &members {
            self.ledger.reconcile(member, self.node.as_ref()).await?;
        }
        let mut candidates = Vec::new();
        for member in &members {
            let Some(key) = self.keys.get(member) else {
                continue;
            };
            for utxo in self.ledger.user_utxos(member) {
                candidates.push(CandidateInput {
                    utxo: utxo.clone(),
                    key: key.clone(),
                });
            }
        }
        let destination = self.resolve_destination(&request.destination)?;
        self.builder
            .build(&candidates, destination, request.amount_sats)
    }

    /// Broadcast a prepared transfer and drop its consumed outputs from the
    /// ledger.
    ///
    /// Broadcast is attempted exactly once. On failure the ledger is left
    /// untouched.
    ///
    /// # Errors
    ///
    /// Returns [`WalletError::Broadcast`] when the node rejects or cannot
    /// take the transaction.
    pub async fn commit_transfer(&mut self, built: &BuiltTransfer) -> Result<TransferOutcome> {
        let txid = self.node.broadcast(&built.tx).await.map_err(|err| {
            error!(txid = %built.txid, error = %err, "broadcast failed");
            WalletError::node_broadcast(err)
        })?;
        if txid != built.txid {
            warn!(expected = %built.txid, actual = %txid, "node reported a different txid");
        }
        self.ledger.remove_consumed(&built.consumed);
        info!(
            txid = %txid,
            sent_sats = built.sent_sats,
            fee_sats = built.fee_sats,
            "transfer broadcast"
        );
        Ok(TransferOutcome {
            txid,
            sent_sats: built.sent_sats,
            fee_sats: built.fee_sats,
        })
    }

    /// Prepare and commit in one step.
    ///
    /// # Errors
    ///
    /// Propagates [`prepare_transfer`](Self::prepare_transfer) and
    /// [`commit_transfer`](Self::commit_transfer) failures.
    pub async fn process_transfer(&mut self, request: &TransferRequest) -> Result<TransferOutcome> {
        let built = self.prepare_transfer(request).await?;
        self.commit_transfer(&built).await
    }

    /// Apply one node feed event.
    ///
    /// Consecutive duplicate deliveries of the same event kind are dropped.
    /// Processing failures are logged and swallowed so one bad transaction
    /// cannot stall the feed.
    pub async fn handle_feed_event(&mut self, event: FeedEvent) {
        match event {
            FeedEvent::AddedToMempool(txid) => {
                if self.last_mempool == Some(txid) {
                    debug!(%txid, "duplicate mempool event ignored");
                    return;
                }
                self.last_mempool = Some(txid);
                if let Err(err) = self.on_mempool_tx(txid).await {
                    warn!(%txid, error = %err, "mempool event processing failed");
                }
            }
            FeedEvent::Confirmed(txid) => {
                if self.last_confirmed == Some(txid) {
                    debug!(%txid, "duplicate confirmation ignored");
                    return;
                }
                self.last_confirmed = Some(txid);
                if let Err(err) = self.on_confirmed_tx(txid).await {
                    warn!(%txid, error = %err, "confirmation processing failed");
                }
            }
        }
    }

    /// Whether the node reports an output as confirmed.
    ///
    /// # Errors
    ///
    /// Returns [`WalletError::FeedDesync`] when the node cannot be read.
    pub async fn is_confirmed(&self, outpoint: OutPoint) -> Result<bool> {
        let statuses = self
            .node
            .validate_utxos(&[outpoint])
            .await
            .map_err(WalletError::node_read)?;
        Ok(statuses.first().is_some_and(|status| status.confirmed))
    }

    /// Every tracked output across all users.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Utxo> {
        self.ledger.snapshot()
    }

    /// Number of tracked outputs.
    #[must_use]
    pub fn tracked_outputs(&self) -> usize {
        self.ledger.len()
    }

    async fn on_mempool_tx(&mut self, txid: Txid) -> Result<()> {
        let origin = self.transfers.classify(txid).await?;
        let outputs = self
            .node
            .fetch_transaction(txid)
            .await
            .map_err(WalletError::node_read)?;
        for (vout, txout) in (0u32..).zip(outputs.iter()) {
            let Some(owner) = Self::owner_of(&self.keys, &txout.script_pubkey) else {
                continue;
            };
            let utxo = Utxo {
                outpoint: OutPoint::new(txid, vout),
                value_sats: txout.value.to_sat(),
                owner: owner.clone(),
            };
            if !self.ledger.apply(utxo.clone()) {
                continue;
            }
            let is_deposit = match &origin {
                TxOrigin::External => true,
                TxOrigin::Give => false,
                TxOrigin::Withdrawal { source } => owner != *source,
            };
            if is_deposit {
                self.emit(WalletEvent::DepositDetected(utxo)).await;
            }
        }
        Ok(())
    }

    async fn on_confirmed_tx(&mut self, txid: Txid) -> Result<()> {
        if !self.ledger.has_txid(txid) {
            debug!(%txid, "confirmation for untracked transaction ignored");
            return Ok(());
        }
        self.emit(WalletEvent::DepositConfirmed(txid)).await;
        Ok(())
    }

    fn resolve_destination(&self, destination: &TransferDestination) -> Result<ScriptBuf> {
        match destination {
            TransferDestination::User(user_id) => self
                .keys
                .get(user_id)
                .map(|key| key.script_pubkey().clone())
                .ok_or_else(|| {
                    WalletError::validation(format!("unknown destination user {user_id}"))
                }),
            TransferDestination::Address(address) => Ok(address.script_pubkey()),
        }
    }

    fn link(&mut self, user_id: &str, account_id: &str) {
        if let Some(previous) = self.accounts.get(user_id) {
            if previous == account_id {
                return;
            }
            let previous = previous.clone();
            if let Some(list) = self.members.get_mut(&previous) {
                list.retain(|member| member != user_id);
                if list.is_empty() {
                    self.members.remove(&previous);
                }
            }
        }
        self.accounts
            .insert(user_id.to_string(), account_id.to_string());
        let list = self.members.entry(account_id.to_string()).or_default();
        if !list.iter().any(|member| member == user_id) {
            list.push(user_id.to_string());
        }
    }

    fn owner_of(keys: &HashMap<UserId, WalletKey>, script: &ScriptBuf) -> Option<UserId> {
        keys.values()
            .find(|key| key.script_pubkey() == script)
            .map(|key| key.user_id().to_string())
    }

    async fn emit(&self, event: WalletEvent) {
        if self.events_tx.send(event).await.is_err() {
            warn!("wallet event receiver dropped, event discarded");
        }
    }
}
