//! Command execution against the wallet engine.
//!
//! The handler drains the command bus, runs each wallet command and
//! replies with a notification. It also consumes the engine's wallet
//! events, turning detected deposits into records and user alerts.
//!
//! Spends are serialized per account: a balance check and the spend it
//! authorizes happen under one account mutex, so two concurrent commands
//! cannot both spend the same funds.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use bip39::Mnemonic;
use bitcoin::address::NetworkUnchecked;
use bitcoin::{Address, Network};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use saifu::error::WalletError;
use saifu::ledger::Utxo;
use saifu::manager::{TransferDestination, TransferRequest, WalletEvent, WalletManager};

use crate::bus::CommandBus;
use crate::error::{BotError, CommandError, Result};
use crate::events::{Command, CommandRequest, Notification};
use crate::platform::Platform;
use crate::store::{
    AccountRecord, DepositRecord, GiveRecord, UserRecord, WalletStore, WithdrawalRecord,
};
use crate::util::{generate_id, normalize_handle, timestamp_ms};

/// Shared handle to the wallet engine.
pub type WalletRef = Arc<RwLock<WalletManager>>;

/// Handler settings.
#[derive(Debug, Clone)]
pub struct HandlerConfig {
    /// Network user-supplied addresses are checked against.
    pub network: Network,
    /// Smallest amount a user may transfer.
    pub min_output_sats: u64,
    /// User id whose outputs are service funds, never customer deposits.
    pub bot_user: String,
    /// How long one bus poll waits before checking for shutdown.
    pub poll_interval: Duration,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            network: Network::Bitcoin,
            min_output_sats: 1000,
            bot_user: "cli:saifu".to_string(),
            poll_interval: Duration::from_secs(1),
        }
    }
}

/// Executes wallet commands and processes wallet events.
pub struct CommandHandler {
    wallet: WalletRef,
    store: Arc<dyn WalletStore>,
    bus: CommandBus,
    config: HandlerConfig,
    running: Arc<RwLock<bool>>,
    account_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl fmt::Debug for CommandHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandHandler").field("config", &self.config).finish_non_exhaustive()
    }
}

impl CommandHandler {
    /// Creates a handler over the given wallet, store and bus.
    #[must_use]
    pub fn new(
        wallet: WalletRef,
        store: Arc<dyn WalletStore>,
        bus: CommandBus,
        config: HandlerConfig,
    ) -> Self {
        Self {
            wallet,
            store,
            bus,
            config,
            running: Arc::new(RwLock::new(false)),
            account_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Drains the command bus until [`stop`](Self::stop) is called.
    ///
    /// A failing command is answered with a user-friendly error reply;
    /// the loop itself keeps running.
    ///
    /// # Errors
    ///
    /// Currently always returns `Ok`; the signature leaves room for
    /// fatal bus failures.
    pub async fn run(&self) -> Result<()> {
        *self.running.write().await = true;
        info!("command handler started");

        while *self.running.read().await {
            let Some(request) = self.bus.consume_command_timeout(self.config.poll_interval).await
            else {
                continue;
            };
            match self.handle_command(&request).await {
                Ok(reply) => {
                    if let Err(err) = self.bus.publish_notification(reply).await {
                        error!(error = %err, "failed to publish reply");
                    }
                }
                Err(err) => {
                    error!(error = %err, command = ?request.command, "command failed");
                    let reply = Notification::reply_to(&request, user_message(&err));
                    if let Err(err) = self.bus.publish_notification(reply).await {
                        error!(error = %err, "failed to publish error reply");
                    }
                }
            }
        }

        info!("command handler stopped");
        Ok(())
    }

    /// Asks the run loop to exit after its current command.
    pub async fn stop(&self) {
        *self.running.write().await = false;
    }

    /// Executes one command and builds the reply.
    ///
    /// The sender is registered with a fresh account and key on first
    /// contact, whatever the command.
    ///
    /// # Errors
    ///
    /// Returns the underlying wallet, storage or command error; callers
    /// render it for users via [`user_message`].
    pub async fn handle_command(&self, request: &CommandRequest) -> Result<Notification> {
        debug!(id = %request.id, user = %request.user_id(), command = ?request.command, "handling command");
        let user = self.ensure_identity(request.platform, &request.sender).await?;

        match &request.command {
            Command::Balance => {
                let sats = self.wallet.write().await.account_balance(&user.account_id).await?;
                Ok(Notification::reply_to(request, format!("Balance: {sats} sats")))
            }
            Command::DepositAddress => {
                let text = {
                    let wallet = self.wallet.read().await;
                    format!("Deposit address: {}", wallet.deposit_address(&user.user_id)?)
                };
                Ok(Notification::reply_to(request, text))
            }
            Command::Give { to, amount_sats } => self.give(request, &user, to, *amount_sats).await,
            Command::Withdraw { address, amount_sats } => {
                self.withdraw(request, &user, address, *amount_sats).await
            }
            Command::Link { secret } => self.link(request, &user, secret).await,
        }
    }

    /// Applies one wallet event: records it and alerts the affected users.
    ///
    /// Touches only the store and the bus, never the wallet itself, so it
    /// can run while the feed task holds the wallet lock.
    pub async fn handle_wallet_event(&self, event: WalletEvent) {
        match event {
            WalletEvent::DepositDetected(utxo) => {
                if let Err(err) = self.on_deposit(&utxo).await {
                    warn!(outpoint = %utxo.outpoint, error = %err, "deposit processing failed");
                }
            }
            WalletEvent::DepositConfirmed(txid) => {
                if let Err(err) = self.on_confirmed(&txid.to_string()).await {
                    warn!(%txid, error = %err, "confirmation processing failed");
                }
            }
        }
    }

    /// Records deposits that reached the ledger while nothing was
    /// listening, e.g. across a restart. Returns how many were recorded.
    ///
    /// Backfilled deposits are recorded silently; alerting users about
    /// old arrivals on every restart would be noise.
    ///
    /// # Errors
    ///
    /// Returns a storage error if a record cannot be written.
    pub async fn backfill_deposits(&self) -> Result<usize> {
        let snapshot = { self.wallet.read().await.snapshot() };
        let mut recorded = 0usize;
        for utxo in snapshot {
            if utxo.owner == self.config.bot_user {
                continue;
            }
            let txid = utxo.outpoint.txid.to_string();
            if self.store.give(&txid).await?.is_some() {
                continue;
            }
            if let Some(withdrawal) = self.store.withdrawal(&txid).await? {
                if withdrawal.user_id == utxo.owner {
                    // Change from the user's own withdrawal.
                    continue;
                }
            }
            if self.store.deposit(&txid, utxo.outpoint.vout).await?.is_some() {
                continue;
            }
            let confirmed = match self.wallet.read().await.is_confirmed(utxo.outpoint).await {
                Ok(confirmed) => confirmed,
                Err(err) => {
                    warn!(outpoint = %utxo.outpoint, error = %err, "confirmation check failed, assuming unconfirmed");
                    false
                }
            };
            self.store
                .save_deposit(&DepositRecord {
                    txid,
                    vout: utxo.outpoint.vout,
                    value_sats: utxo.value_sats,
                    user_id: utxo.owner.clone(),
                    confirmed,
                    created_at: timestamp_ms(),
                })
                .await?;
            recorded += 1;
        }
        if recorded > 0 {
            info!(deposits = recorded, "backfilled missed deposits");
        }
        Ok(recorded)
    }

    async fn on_deposit(&self, utxo: &Utxo) -> Result<()> {
        if utxo.owner == self.config.bot_user {
            return Ok(());
        }
        let txid = utxo.outpoint.txid.to_string();
        if self.store.deposit(&txid, utxo.outpoint.vout).await?.is_some() {
            return Ok(());
        }
        self.store
            .save_deposit(&DepositRecord {
                txid,
                vout: utxo.outpoint.vout,
                value_sats: utxo.value_sats,
                user_id: utxo.owner.clone(),
                confirmed: false,
                created_at: timestamp_ms(),
            })
            .await?;
        self.notify_user(
            &utxo.owner,
            format!("Deposit detected: {} sats (unconfirmed)", utxo.value_sats),
        )
        .await;
        Ok(())
    }

    async fn on_confirmed(&self, txid: &str) -> Result<()> {
        let confirmed = self.store.confirm_deposits(txid).await?;
        for record in confirmed {
            self.notify_user(
                &record.user_id,
                format!("Deposit confirmed: {} sats", record.value_sats),
            )
            .await;
        }
        Ok(())
    }

    async fn give(
        &self,
        request: &CommandRequest,
        user: &UserRecord,
        to: &str,
        amount_sats: u64,
    ) -> Result<Notification> {
        self.check_min(amount_sats)?;
        let recipient = self.ensure_identity(request.platform, to).await?;

        let lock = self.account_lock(&user.account_id).await;
        let _guard = lock.lock().await;

        let outcome = {
            let mut wallet = self.wallet.write().await;
            wallet
                .process_transfer(&TransferRequest {
                    source_account: user.account_id.clone(),
                    destination: TransferDestination::User(recipient.user_id.clone()),
                    amount_sats,
                })
                .await?
        };

        let record = GiveRecord {
            txid: outcome.txid.to_string(),
            from_user: user.user_id.clone(),
            to_user: recipient.user_id.clone(),
            value_sats: outcome.sent_sats,
            created_at: timestamp_ms(),
        };
        if let Err(err) = self.store.save_give(&record).await {
            // The coins already moved; a lost record only costs feed
            // classification for this txid.
            error!(txid = %outcome.txid, error = %err, "give record save failed after broadcast");
        }

        if recipient.user_id != user.user_id {
            self.notify_user(
                &recipient.user_id,
                format!("{} sent you {} sats", user.user_id, outcome.sent_sats),
            )
            .await;
        }
        info!(from = %user.user_id, to = %recipient.user_id, sats = outcome.sent_sats, txid = %outcome.txid, "give completed");
        Ok(Notification::reply_to(
            request,
            format!(
                "Sent {} sats to {} (fee {} sats)\ntxid: {}",
                outcome.sent_sats, to, outcome.fee_sats, outcome.txid
            ),
        ))
    }

    async fn withdraw(
        &self,
        request: &CommandRequest,
        user: &UserRecord,
        address: &str,
        amount_sats: u64,
    ) -> Result<Notification> {
        self.check_min(amount_sats)?;
        let address = Address::<NetworkUnchecked>::from_str(address)
            .map_err(|err| WalletError::validation(format!("invalid address: {err}")))?
            .require_network(self.config.network)
            .map_err(|_| {
                WalletError::validation(format!(
                    "address is not valid for {}",
                    self.config.network
                ))
            })?;
        {
            let wallet = self.wallet.read().await;
            if wallet.deposit_address(&user.user_id)? == &address {
                return Err(
                    WalletError::validation("cannot withdraw to your own deposit address").into()
                );
            }
        }

        let lock = self.account_lock(&user.account_id).await;
        let _guard = lock.lock().await;

        let outcome = {
            let mut wallet = self.wallet.write().await;
            let built = wallet
                .prepare_transfer(&TransferRequest {
                    source_account: user.account_id.clone(),
                    destination: TransferDestination::Address(address.clone()),
                    amount_sats,
                })
                .await?;

            // Recorded before broadcast so the feed echo already
            // classifies the transaction as ours.
            let stub = WithdrawalRecord {
                txid: built.txid.to_string(),
                user_id: user.user_id.clone(),
                destination: address.to_string(),
                value_sats: built.sent_sats,
                created_at: timestamp_ms(),
            };
            self.store.save_withdrawal(&stub).await?;

            match wallet.commit_transfer(&built).await {
                Ok(outcome) => outcome,
                Err(err) => {
                    if let Err(cleanup) = self.store.delete_withdrawal(&stub.txid).await {
                        error!(txid = %stub.txid, error = %cleanup, "failed to remove withdrawal record after aborted broadcast");
                    }
                    return Err(err.into());
                }
            }
        };

        info!(user = %user.user_id, sats = outcome.sent_sats, txid = %outcome.txid, "withdrawal completed");
        Ok(Notification::reply_to(
            request,
            format!(
                "Withdrew {} sats to {}\nfee: {} sats\ntxid: {}",
                outcome.sent_sats, address, outcome.fee_sats, outcome.txid
            ),
        ))
    }

    async fn link(
        &self,
        request: &CommandRequest,
        user: &UserRecord,
        secret: &str,
    ) -> Result<Notification> {
        let Some(target) = self.store.account_by_secret(secret).await? else {
            return Err(WalletError::validation("unknown link secret").into());
        };
        if target.account_id == user.account_id {
            return Ok(Notification::reply_to(request, "Already linked to this account."));
        }
        let members = self.store.account_users(&user.account_id).await?;
        if members.len() > 1 {
            return Err(WalletError::validation(
                "this identity already shares an account; unlinking is not supported",
            )
            .into());
        }

        self.store.reassign_user(&user.user_id, &target.account_id).await?;
        // The abandoned singleton account is now empty.
        self.store.delete_account(&user.account_id).await?;
        self.wallet.write().await.update_link(
            &user.user_id,
            &user.account_id,
            &target.account_id,
        )?;

        info!(user = %user.user_id, from = %user.account_id, to = %target.account_id, "identity linked");
        Ok(Notification::reply_to(request, "Linked. Balances on this account are now shared."))
    }

    /// Loads the user, creating an account, key and records on first
    /// contact.
    async fn ensure_identity(&self, platform: Platform, handle: &str) -> Result<UserRecord> {
        let handle = normalize_handle(handle);
        let user_id = format!("{platform}:{handle}");
        if let Some(record) = self.store.user(&user_id).await? {
            return Ok(record);
        }

        let mnemonic = Mnemonic::generate(12)
            .map_err(|err| BotError::internal(format!("mnemonic generation: {err}")))?;
        let account = AccountRecord {
            account_id: generate_id("acct"),
            link_secret: generate_id("secret"),
            created_at: timestamp_ms(),
        };
        let record = UserRecord {
            user_id: user_id.clone(),
            account_id: account.account_id.clone(),
            platform,
            mnemonic: mnemonic.to_string(),
            created_at: timestamp_ms(),
        };
        self.store.save_account(&account).await?;
        self.store.save_user(&record).await?;

        let seed = mnemonic.to_seed("");
        self.wallet.write().await.load_key(&user_id, &record.account_id, &seed).await?;

        info!(user = %user_id, account = %record.account_id, "user registered");
        Ok(record)
    }

    fn check_min(&self, amount_sats: u64) -> Result<()> {
        if amount_sats < self.config.min_output_sats {
            return Err(CommandError::InvalidAmount(format!(
                "minimum transfer is {} sats",
                self.config.min_output_sats
            ))
            .into());
        }
        Ok(())
    }

    async fn account_lock(&self, account_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.account_locks.lock().await;
        Arc::clone(locks.entry(account_id.to_string()).or_default())
    }

    async fn notify_user(&self, user_id: &str, text: String) {
        let Some((platform, _)) = user_id.split_once(':') else {
            warn!(user = user_id, "malformed user id, dropping notification");
            return;
        };
        let Ok(platform) = platform.parse::<Platform>() else {
            warn!(user = user_id, "unknown platform, dropping notification");
            return;
        };
        let note = Notification::new(platform, "direct", text);
        if let Err(err) = self.bus.publish_notification(note).await {
            debug!(user = user_id, error = %err, "notification dropped");
        }
    }
}

/// Renders an error as a message fit for end users.
#[must_use]
pub fn user_message(err: &BotError) -> String {
    match err {
        BotError::Wallet(WalletError::InsufficientFunds { available, required }) => format!(
            "Insufficient funds: you have {available} sats but this needs {required} sats."
        ),
        BotError::Wallet(WalletError::Validation(msg)) => format!("Cannot do that: {msg}"),
        BotError::Wallet(WalletError::Broadcast(_)) => {
            "The network rejected the transaction. Your funds are untouched; please try again."
                .to_string()
        }
        BotError::Command(err) => err.to_string(),
        _ => "Something went wrong; please try again.".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::Txid;
    use bitcoin::hashes::Hash;
    use saifu::keys::{DerivationParams, KeyDerivation};
    use saifu::node::{FeedEvent, MemoryNode, feed_channel};
    use tokio::sync::{broadcast, mpsc};

    use crate::store::{MemoryStore, StoreTransferLookup};

    struct Rig {
        handler: CommandHandler,
        wallet: WalletRef,
        store: Arc<MemoryStore>,
        node: Arc<MemoryNode>,
        feed_rx: mpsc::Receiver<FeedEvent>,
        events_rx: mpsc::Receiver<WalletEvent>,
        notifications: broadcast::Receiver<Notification>,
    }

    async fn rig() -> Rig {
        let (feed_tx, feed_rx) = feed_channel();
        let node = Arc::new(MemoryNode::new().with_events(feed_tx));
        let store = Arc::new(MemoryStore::new());
        let lookup = Arc::new(StoreTransferLookup::new(store.clone()));
        let (manager, events_rx) = WalletManager::builder()
            .with_node(node.clone())
            .with_transfers(lookup)
            .build()
            .unwrap();
        let wallet = Arc::new(RwLock::new(manager));
        let bus = CommandBus::new();
        let notifications = bus.subscribe_all();
        let handler = CommandHandler::new(
            Arc::clone(&wallet),
            store.clone(),
            bus,
            HandlerConfig::default(),
        );
        Rig { handler, wallet, store, node, feed_rx, events_rx, notifications }
    }

    impl Rig {
        /// Runs feed events through the wallet and wallet events through
        /// the handler until both queues are idle.
        async fn pump(&mut self) {
            loop {
                let mut progressed = false;
                while let Ok(event) = self.feed_rx.try_recv() {
                    self.wallet.write().await.handle_feed_event(event).await;
                    progressed = true;
                }
                while let Ok(event) = self.events_rx.try_recv() {
                    self.handler.handle_wallet_event(event).await;
                    progressed = true;
                }
                if !progressed {
                    break;
                }
            }
        }

        async fn command(&self, sender: &str, command: Command) -> Result<Notification> {
            self.handler
                .handle_command(&CommandRequest::new(Platform::Cli, sender, "direct", command))
                .await
        }

        /// Registers the user on first contact and returns their script.
        async fn deposit_script(&self, sender: &str) -> bitcoin::ScriptBuf {
            self.command(sender, Command::DepositAddress).await.unwrap();
            let wallet = self.wallet.read().await;
            wallet.deposit_address(&format!("cli:{sender}")).unwrap().script_pubkey()
        }

        async fn fund(&mut self, sender: &str, txid_byte: u8, sats: u64) -> Txid {
            let script = self.deposit_script(sender).await;
            let txid = Txid::from_byte_array([txid_byte; 32]);
            self.node.fund_script(&script, txid, sats).await;
            self.pump().await;
            txid
        }

        async fn balance(&self, sender: &str) -> u64 {
            let record =
                self.store.user(&format!("cli:{sender}")).await.unwrap().unwrap();
            self.wallet.write().await.account_balance(&record.account_id).await.unwrap()
        }

        fn drain_notifications(&mut self) -> Vec<Notification> {
            let mut out = Vec::new();
            while let Ok(note) = self.notifications.try_recv() {
                out.push(note);
            }
            out
        }
    }

    fn external_address() -> Address {
        let derivation = KeyDerivation::new(DerivationParams::default()).unwrap();
        derivation.derive("outside", &[0xEE; 32]).unwrap().address().clone()
    }

    #[tokio::test]
    async fn test_deposit_detected_recorded_and_confirmed() {
        let mut rig = rig().await;
        let txid = rig.fund("alice", 0x11, 50_000_000).await;

        let reply = rig.command("alice", Command::Balance).await.unwrap();
        assert_eq!(reply.text, "Balance: 50000000 sats");

        let record = rig.store.deposit(&txid.to_string(), 0).await.unwrap().unwrap();
        assert_eq!(record.user_id, "cli:alice");
        assert!(!record.confirmed);
        let notes = rig.drain_notifications();
        assert!(notes.iter().any(|note| note.text.contains("Deposit detected: 50000000 sats")));

        rig.node.confirm(txid).await;
        rig.pump().await;
        assert!(rig.store.deposit(&txid.to_string(), 0).await.unwrap().unwrap().confirmed);
        let notes = rig.drain_notifications();
        assert!(notes.iter().any(|note| note.text.contains("Deposit confirmed: 50000000 sats")));
    }

    #[tokio::test]
    async fn test_replayed_feed_event_credits_once() {
        let mut rig = rig().await;
        let txid = rig.fund("alice", 0x11, 50_000_000).await;
        rig.drain_notifications();

        // A flaky feed delivers the same event again.
        rig.wallet.write().await.handle_feed_event(FeedEvent::AddedToMempool(txid)).await;
        rig.pump().await;

        assert_eq!(rig.balance("alice").await, 50_000_000);
        assert!(rig.drain_notifications().is_empty());
    }

    #[tokio::test]
    async fn test_give_moves_funds_without_deposit_noise() {
        let mut rig = rig().await;
        rig.fund("alice", 0x11, 50_000_000).await;
        rig.drain_notifications();

        let reply = rig
            .command("alice", Command::Give { to: "bob".to_string(), amount_sats: 10_000_000 })
            .await
            .unwrap();
        assert!(reply.text.contains("Sent 10000000 sats to bob"));
        rig.pump().await;

        assert_eq!(rig.balance("bob").await, 10_000_000);
        assert_eq!(rig.balance("alice").await, 39_999_548);

        // The transfer outputs are ours: recorded as a give, not deposits.
        let transfer_txid = {
            let wallet = rig.wallet.read().await;
            wallet
                .snapshot()
                .into_iter()
                .find(|utxo| utxo.owner == "cli:bob")
                .unwrap()
                .outpoint
                .txid
        };
        assert!(rig.store.give(&transfer_txid.to_string()).await.unwrap().is_some());
        assert!(rig.store.deposit(&transfer_txid.to_string(), 0).await.unwrap().is_none());
        assert!(rig.store.deposit(&transfer_txid.to_string(), 1).await.unwrap().is_none());

        let notes = rig.drain_notifications();
        assert!(notes.iter().all(|note| !note.text.contains("Deposit detected")));
        assert!(notes.iter().any(|note| note.text.contains("cli:alice sent you 10000000 sats")));
    }

    #[tokio::test]
    async fn test_give_to_self_pays_only_the_fee() {
        let mut rig = rig().await;
        rig.fund("alice", 0x11, 50_000_000).await;
        rig.drain_notifications();

        rig.command("alice", Command::Give { to: "alice".to_string(), amount_sats: 10_000_000 })
            .await
            .unwrap();
        rig.pump().await;

        assert_eq!(rig.balance("alice").await, 49_999_548);
        // No "sent you" echo to yourself.
        assert!(rig.drain_notifications().iter().all(|note| !note.text.contains("sent you")));
    }

    #[tokio::test]
    async fn test_minimum_amount_enforced() {
        let mut rig = rig().await;
        rig.fund("alice", 0x11, 50_000_000).await;

        let err = rig
            .command("alice", Command::Give { to: "bob".to_string(), amount_sats: 999 })
            .await
            .unwrap_err();
        assert!(matches!(err, BotError::Command(CommandError::InvalidAmount(_))));
        assert_eq!(rig.balance("alice").await, 50_000_000);
    }

    #[tokio::test]
    async fn test_insufficient_funds_reports_numbers() {
        let mut rig = rig().await;
        rig.fund("alice", 0x11, 100_000).await;

        let err = rig
            .command("alice", Command::Give { to: "bob".to_string(), amount_sats: 200_000 })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            BotError::Wallet(WalletError::InsufficientFunds { available: 100_000, required: 200_452 })
        ));
        let text = user_message(&err);
        assert!(text.contains("100000"));
        assert!(text.contains("200452"));
    }

    #[tokio::test]
    async fn test_failed_broadcast_leaves_funds_spendable() {
        let mut rig = rig().await;
        rig.fund("alice", 0x11, 50_000_000).await;
        rig.node.fail_next_broadcast("mempool full").await;

        let err = rig
            .command("alice", Command::Give { to: "bob".to_string(), amount_sats: 10_000_000 })
            .await
            .unwrap_err();
        assert!(matches!(err, BotError::Wallet(WalletError::Broadcast(_))));
        rig.pump().await;

        assert_eq!(rig.balance("alice").await, 50_000_000);
        assert_eq!(rig.balance("bob").await, 0);

        // The retry spends the same funds.
        rig.command("alice", Command::Give { to: "bob".to_string(), amount_sats: 10_000_000 })
            .await
            .unwrap();
        rig.pump().await;
        assert_eq!(rig.balance("bob").await, 10_000_000);
    }

    #[tokio::test]
    async fn test_withdrawal_records_before_broadcast() {
        let mut rig = rig().await;
        rig.fund("alice", 0x11, 50_000_000).await;

        let destination = external_address();
        let reply = rig
            .command(
                "alice",
                Command::Withdraw { address: destination.to_string(), amount_sats: 10_000_000 },
            )
            .await
            .unwrap();
        assert!(reply.text.contains("Withdrew 10000000 sats"));
        rig.pump().await;

        assert_eq!(rig.balance("alice").await, 39_999_548);

        // The change output's txid is the withdrawal's txid.
        let change_txid = {
            let wallet = rig.wallet.read().await;
            wallet.snapshot().first().unwrap().outpoint.txid
        };
        let record = rig.store.withdrawal(&change_txid.to_string()).await.unwrap().unwrap();
        assert_eq!(record.user_id, "cli:alice");
        assert_eq!(record.value_sats, 10_000_000);
        // Change from our own withdrawal is not a deposit.
        assert!(rig.store.deposit(&change_txid.to_string(), 1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_withdrawal_failure_removes_the_record() {
        let mut rig = rig().await;
        rig.fund("alice", 0x11, 50_000_000).await;
        rig.node.fail_next_broadcast("rejected").await;

        let destination = external_address();
        let err = rig
            .command(
                "alice",
                Command::Withdraw { address: destination.to_string(), amount_sats: 10_000_000 },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BotError::Wallet(WalletError::Broadcast(_))));

        assert_eq!(rig.store.withdrawal_count().await, 0);
        assert_eq!(rig.balance("alice").await, 50_000_000);
    }

    #[tokio::test]
    async fn test_withdrawal_address_validation() {
        let mut rig = rig().await;
        rig.fund("alice", 0x11, 50_000_000).await;

        let err = rig
            .command(
                "alice",
                Command::Withdraw { address: "not-an-address".to_string(), amount_sats: 10_000 },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BotError::Wallet(WalletError::Validation(_))));

        let own = {
            let wallet = rig.wallet.read().await;
            wallet.deposit_address("cli:alice").unwrap().to_string()
        };
        let err = rig
            .command("alice", Command::Withdraw { address: own, amount_sats: 10_000 })
            .await
            .unwrap_err();
        assert!(matches!(err, BotError::Wallet(WalletError::Validation(_))));
    }

    #[tokio::test]
    async fn test_link_pools_balances() {
        let mut rig = rig().await;
        rig.fund("alice", 0x11, 30_000_000).await;
        rig.fund("bob", 0x22, 20_000_000).await;

        let alice = rig.store.user("cli:alice").await.unwrap().unwrap();
        let bob_before = rig.store.user("cli:bob").await.unwrap().unwrap();
        let secret =
            rig.store.account(&alice.account_id).await.unwrap().unwrap().link_secret;

        let reply =
            rig.command("bob", Command::Link { secret: secret.clone() }).await.unwrap();
        assert!(reply.text.contains("Linked"));

        assert_eq!(rig.balance("alice").await, 50_000_000);
        assert_eq!(rig.balance("bob").await, 50_000_000);
        assert_eq!(rig.store.account_users(&alice.account_id).await.unwrap().len(), 2);
        // Bob's abandoned singleton account is deleted.
        assert!(rig.store.account(&bob_before.account_id).await.unwrap().is_none());

        // Relinking to the same account is a friendly no-op.
        let reply = rig.command("bob", Command::Link { secret }).await.unwrap();
        assert!(reply.text.contains("Already linked"));

        // A pooled spend can use inputs from both identities.
        rig.command("alice", Command::Give { to: "carol".to_string(), amount_sats: 45_000_000 })
            .await
            .unwrap();
        rig.pump().await;
        assert_eq!(rig.balance("carol").await, 45_000_000);
        assert_eq!(rig.balance("alice").await, 50_000_000 - 45_000_000 - 748);
    }

    #[tokio::test]
    async fn test_link_rules() {
        let mut rig = rig().await;
        rig.fund("alice", 0x11, 30_000_000).await;
        rig.fund("bob", 0x22, 20_000_000).await;
        rig.fund("carol", 0x33, 10_000_000).await;

        let err = rig
            .command("bob", Command::Link { secret: "no-such-secret".to_string() })
            .await
            .unwrap_err();
        assert!(matches!(err, BotError::Wallet(WalletError::Validation(_))));

        let alice = rig.store.user("cli:alice").await.unwrap().unwrap();
        let alice_secret =
            rig.store.account(&alice.account_id).await.unwrap().unwrap().link_secret;
        rig.command("bob", Command::Link { secret: alice_secret }).await.unwrap();

        // Alice now shares an account and cannot link away from it.
        let carol = rig.store.user("cli:carol").await.unwrap().unwrap();
        let carol_secret =
            rig.store.account(&carol.account_id).await.unwrap().unwrap().link_secret;
        let err =
            rig.command("alice", Command::Link { secret: carol_secret }).await.unwrap_err();
        assert!(matches!(err, BotError::Wallet(WalletError::Validation(_))));
    }

    #[tokio::test]
    async fn test_backfill_records_missed_deposits() {
        let mut rig = rig().await;
        let script = rig.deposit_script("alice").await;
        let pending = Txid::from_byte_array([0x33; 32]);
        let confirmed = Txid::from_byte_array([0x44; 32]);
        rig.node.fund_script(&script, pending, 7_000_000).await;
        rig.node.fund_script(&script, confirmed, 3_000_000).await;
        rig.node.confirm(confirmed).await;

        // The wallet sees the feed, but nothing drains its events.
        while let Ok(event) = rig.feed_rx.try_recv() {
            rig.wallet.write().await.handle_feed_event(event).await;
        }
        while rig.events_rx.try_recv().is_ok() {}
        assert!(rig.store.deposit(&pending.to_string(), 0).await.unwrap().is_none());

        assert_eq!(rig.handler.backfill_deposits().await.unwrap(), 2);
        assert!(!rig.store.deposit(&pending.to_string(), 0).await.unwrap().unwrap().confirmed);
        assert!(rig.store.deposit(&confirmed.to_string(), 0).await.unwrap().unwrap().confirmed);

        // Running again records nothing new.
        assert_eq!(rig.handler.backfill_deposits().await.unwrap(), 0);
    }

    #[test]
    fn test_user_messages_are_friendly() {
        let err = BotError::Wallet(WalletError::InsufficientFunds {
            available: 100,
            required: 552,
        });
        assert_eq!(
            user_message(&err),
            "Insufficient funds: you have 100 sats but this needs 552 sats."
        );

        let err = BotError::Wallet(WalletError::validation("unknown link secret"));
        assert_eq!(user_message(&err), "Cannot do that: unknown link secret");

        let err = BotError::Wallet(WalletError::broadcast("node unavailable"));
        assert!(user_message(&err).contains("untouched"));

        let err = BotError::Command(CommandError::Usage("give <user> <amount-sats>".to_string()));
        assert_eq!(user_message(&err), "usage: give <user> <amount-sats>");

        let err = BotError::internal("boom");
        assert_eq!(user_message(&err), "Something went wrong; please try again.");
    }
}
