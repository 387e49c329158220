//! Persistent records: accounts, users and transfer history.
//!
//! The store is the service's source of truth for who exists and which
//! transactions the service itself created. Balances are deliberately NOT
//! stored here; those live in the wallet engine's ledger and are rebuilt
//! from the node on startup. The transfer records double as the feed
//! classifier: a txid found under gives or withdrawals is one of ours.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use bitcoin::Txid;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;

use saifu::error::WalletError;
use saifu::manager::{TransferLookup, TxOrigin};

use crate::error::{StorageError, StorageResult};
use crate::platform::Platform;

/// A balance shared by one or more platform identities.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountRecord {
    /// Unique account id.
    pub account_id: String,
    /// Secret another identity presents to join this account.
    pub link_secret: String,
    /// Milliseconds since the Unix epoch.
    pub created_at: u64,
}

/// One platform identity and its wallet key material.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    /// Platform-scoped id, e.g. `cli:alice`.
    pub user_id: String,
    /// Account this identity currently belongs to.
    pub account_id: String,
    /// Platform the identity lives on.
    pub platform: Platform,
    /// BIP-39 mnemonic backing the user's key.
    pub mnemonic: String,
    /// Milliseconds since the Unix epoch.
    pub created_at: u64,
}

/// An incoming output credited to a user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepositRecord {
    /// Funding transaction id.
    pub txid: String,
    /// Output index within the transaction.
    pub vout: u32,
    /// Amount in satoshis.
    pub value_sats: u64,
    /// User whose address received the output.
    pub user_id: String,
    /// Whether the funding transaction has confirmed.
    pub confirmed: bool,
    /// Milliseconds since the Unix epoch.
    pub created_at: u64,
}

/// A completed user-to-user transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GiveRecord {
    /// Transfer transaction id.
    pub txid: String,
    /// Sending user.
    pub from_user: String,
    /// Receiving user.
    pub to_user: String,
    /// Amount delivered, in satoshis.
    pub value_sats: u64,
    /// Milliseconds since the Unix epoch.
    pub created_at: u64,
}

/// A withdrawal to an external address.
///
/// Saved BEFORE broadcast so the feed already classifies the transaction
/// as ours when it echoes back; deleted again if the broadcast fails.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WithdrawalRecord {
    /// Withdrawal transaction id.
    pub txid: String,
    /// User who withdrew.
    pub user_id: String,
    /// Destination address string.
    pub destination: String,
    /// Amount delivered, in satoshis.
    pub value_sats: u64,
    /// Milliseconds since the Unix epoch.
    pub created_at: u64,
}

/// Persistence backend for service records.
#[async_trait]
pub trait WalletStore: Send + Sync {
    /// Loads an account by id.
    async fn account(&self, account_id: &str) -> StorageResult<Option<AccountRecord>>;

    /// Finds the account owning a link secret.
    async fn account_by_secret(&self, secret: &str) -> StorageResult<Option<AccountRecord>>;

    /// Saves an account, overwriting any previous version.
    async fn save_account(&self, record: &AccountRecord) -> StorageResult<()>;

    /// Deletes an account. Deleting a missing account is not an error.
    async fn delete_account(&self, account_id: &str) -> StorageResult<()>;

    /// Loads a user by platform-scoped id.
    async fn user(&self, user_id: &str) -> StorageResult<Option<UserRecord>>;

    /// Loads every user.
    async fn users(&self) -> StorageResult<Vec<UserRecord>>;

    /// Loads the users currently belonging to an account.
    async fn account_users(&self, account_id: &str) -> StorageResult<Vec<UserRecord>>;

    /// Saves a user, overwriting any previous version.
    async fn save_user(&self, record: &UserRecord) -> StorageResult<()>;

    /// Moves a user to another account.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::NotFound`] if the user does not exist.
    async fn reassign_user(&self, user_id: &str, account_id: &str) -> StorageResult<()>;

    /// Loads a deposit by funding outpoint.
    async fn deposit(&self, txid: &str, vout: u32) -> StorageResult<Option<DepositRecord>>;

    /// Saves a deposit, overwriting any previous version.
    async fn save_deposit(&self, record: &DepositRecord) -> StorageResult<()>;

    /// Marks every unconfirmed deposit of `txid` confirmed and returns the
    /// records it changed. Already confirmed deposits are not returned, so
    /// a replayed confirmation notifies nobody twice.
    async fn confirm_deposits(&self, txid: &str) -> StorageResult<Vec<DepositRecord>>;

    /// Loads a give by transaction id.
    async fn give(&self, txid: &str) -> StorageResult<Option<GiveRecord>>;

    /// Saves a give record.
    async fn save_give(&self, record: &GiveRecord) -> StorageResult<()>;

    /// Loads a withdrawal by transaction id.
    async fn withdrawal(&self, txid: &str) -> StorageResult<Option<WithdrawalRecord>>;

    /// Saves a withdrawal record.
    async fn save_withdrawal(&self, record: &WithdrawalRecord) -> StorageResult<()>;

    /// Deletes a withdrawal record. Deleting a missing record is not an
    /// error, so a failed broadcast can always be compensated.
    async fn delete_withdrawal(&self, txid: &str) -> StorageResult<()>;
}

fn deposit_key(txid: &str, vout: u32) -> String {
    format!("{txid}:{vout}")
}

/// In-memory store for tests and simulation runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    accounts: RwLock<HashMap<String, AccountRecord>>,
    users: RwLock<HashMap<String, UserRecord>>,
    deposits: RwLock<HashMap<String, DepositRecord>>,
    gives: RwLock<HashMap<String, GiveRecord>>,
    withdrawals: RwLock<HashMap<String, WithdrawalRecord>>,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored withdrawal records.
    pub async fn withdrawal_count(&self) -> usize {
        self.withdrawals.read().await.len()
    }
}

#[async_trait]
impl WalletStore for MemoryStore {
    async fn account(&self, account_id: &str) -> StorageResult<Option<AccountRecord>> {
        Ok(self.accounts.read().await.get(account_id).cloned())
    }

    async fn account_by_secret(&self, secret: &str) -> StorageResult<Option<AccountRecord>> {
        Ok(self
            .accounts
            .read()
            .await
            .values()
            .find(|record| record.link_secret == secret)
            .cloned())
    }

    async fn save_account(&self, record: &AccountRecord) -> StorageResult<()> {
        self.accounts.write().await.insert(record.account_id.clone(), record.clone());
        Ok(())
    }

    async fn delete_account(&self, account_id: &str) -> StorageResult<()> {
        self.accounts.write().await.remove(account_id);
        Ok(())
    }

    async fn user(&self, user_id: &str) -> StorageResult<Option<UserRecord>> {
        Ok(self.users.read().await.get(user_id).cloned())
    }

    async fn users(&self) -> StorageResult<Vec<UserRecord>> {
        Ok(self.users.read().await.values().cloned().collect())
    }

    async fn account_users(&self, account_id: &str) -> StorageResult<Vec<UserRecord>> {
        Ok(self
            .users
            .read()
            .await
            .values()
            .filter(|record| record.account_id == account_id)
            .cloned()
            .collect())
    }

    async fn save_user(&self, record: &UserRecord) -> StorageResult<()> {
        self.users.write().await.insert(record.user_id.clone(), record.clone());
        Ok(())
    }

    async fn reassign_user(&self, user_id: &str, account_id: &str) -> StorageResult<()> {
        let mut users = self.users.write().await;
        let record = users
            .get_mut(user_id)
            .ok_or_else(|| StorageError::not_found(format!("user {user_id}")))?;
        record.account_id = account_id.to_string();
        Ok(())
    }

    async fn deposit(&self, txid: &str, vout: u32) -> StorageResult<Option<DepositRecord>> {
        Ok(self.deposits.read().await.get(&deposit_key(txid, vout)).cloned())
    }

    async fn save_deposit(&self, record: &DepositRecord) -> StorageResult<()> {
        self.deposits
            .write()
            .await
            .insert(deposit_key(&record.txid, record.vout), record.clone());
        Ok(())
    }

    async fn confirm_deposits(&self, txid: &str) -> StorageResult<Vec<DepositRecord>> {
        let mut deposits = self.deposits.write().await;
        let mut changed = Vec::new();
        for record in deposits.values_mut() {
            if record.txid == txid && !record.confirmed {
                record.confirmed = true;
                changed.push(record.clone());
            }
        }
        Ok(changed)
    }

    async fn give(&self, txid: &str) -> StorageResult<Option<GiveRecord>> {
        Ok(self.gives.read().await.get(txid).cloned())
    }

    async fn save_give(&self, record: &GiveRecord) -> StorageResult<()> {
        self.gives.write().await.insert(record.txid.clone(), record.clone());
        Ok(())
    }

    async fn withdrawal(&self, txid: &str) -> StorageResult<Option<WithdrawalRecord>> {
        Ok(self.withdrawals.read().await.get(txid).cloned())
    }

    async fn save_withdrawal(&self, record: &WithdrawalRecord) -> StorageResult<()> {
        self.withdrawals.write().await.insert(record.txid.clone(), record.clone());
        Ok(())
    }

    async fn delete_withdrawal(&self, txid: &str) -> StorageResult<()> {
        self.withdrawals.write().await.remove(txid);
        Ok(())
    }
}

/// File-backed store keeping one pretty-printed JSON file per record.
///
/// Records live under per-kind subdirectories of the base path, e.g.
/// `users/cli_alice.json`. Plenty for a bot's traffic; swap in a real
/// database behind [`WalletStore`] when volume demands it.
#[derive(Debug, Clone)]
pub struct FileStore {
    base_path: PathBuf,
}

const KIND_ACCOUNTS: &str = "accounts";
const KIND_USERS: &str = "users";
const KIND_DEPOSITS: &str = "deposits";
const KIND_GIVES: &str = "gives";
const KIND_WITHDRAWALS: &str = "withdrawals";

impl FileStore {
    /// Creates a store rooted at `base_path`. Directories are created
    /// lazily on first write.
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self { base_path: base_path.into() }
    }

    fn record_path(&self, kind: &str, key: &str) -> PathBuf {
        // Keys contain `:` which is unfriendly to filesystems.
        let safe = key.replace([':', '/', '\\'], "_");
        self.base_path.join(kind).join(format!("{safe}.json"))
    }

    async fn read_record<T: DeserializeOwned>(
        &self,
        kind: &str,
        key: &str,
    ) -> StorageResult<Option<T>> {
        let path = self.record_path(kind, key);
        match tokio::fs::read_to_string(&path).await {
            Ok(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn write_record<T: Serialize>(
        &self,
        kind: &str,
        key: &str,
        record: &T,
    ) -> StorageResult<()> {
        tokio::fs::create_dir_all(self.base_path.join(kind)).await?;
        let raw = serde_json::to_string_pretty(record)?;
        tokio::fs::write(self.record_path(kind, key), raw).await?;
        debug!(kind, key, "record saved");
        Ok(())
    }

    async fn remove_record(&self, kind: &str, key: &str) -> StorageResult<()> {
        match tokio::fs::remove_file(self.record_path(kind, key)).await {
            Ok(()) => {
                debug!(kind, key, "record deleted");
                Ok(())
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn read_all<T: DeserializeOwned>(&self, kind: &str) -> StorageResult<Vec<T>> {
        let dir = self.base_path.join(kind);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let mut records = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                let raw = tokio::fs::read_to_string(&path).await?;
                records.push(serde_json::from_str(&raw)?);
            }
        }
        Ok(records)
    }
}

#[async_trait]
impl WalletStore for FileStore {
    async fn account(&self, account_id: &str) -> StorageResult<Option<AccountRecord>> {
        self.read_record(KIND_ACCOUNTS, account_id).await
    }

    async fn account_by_secret(&self, secret: &str) -> StorageResult<Option<AccountRecord>> {
        let accounts: Vec<AccountRecord> = self.read_all(KIND_ACCOUNTS).await?;
        Ok(accounts.into_iter().find(|record| record.link_secret == secret))
    }

    async fn save_account(&self, record: &AccountRecord) -> StorageResult<()> {
        self.write_record(KIND_ACCOUNTS, &record.account_id, record).await
    }

    async fn delete_account(&self, account_id: &str) -> StorageResult<()> {
        self.remove_record(KIND_ACCOUNTS, account_id).await
    }

    async fn user(&self, user_id: &str) -> StorageResult<Option<UserRecord>> {
        self.read_record(KIND_USERS, user_id).await
    }

    async fn users(&self) -> StorageResult<Vec<UserRecord>> {
        self.read_all(KIND_USERS).await
    }

    async fn account_users(&self, account_id: &str) -> StorageResult<Vec<UserRecord>> {
        let users: Vec<UserRecord> = self.read_all(KIND_USERS).await?;
        Ok(users.into_iter().filter(|record| record.account_id == account_id).collect())
    }

    async fn save_user(&self, record: &UserRecord) -> StorageResult<()> {
        self.write_record(KIND_USERS, &record.user_id, record).await
    }

    async fn reassign_user(&self, user_id: &str, account_id: &str) -> StorageResult<()> {
        let mut record: UserRecord = self
            .read_record(KIND_USERS, user_id)
            .await?
            .ok_or_else(|| StorageError::not_found(format!("user {user_id}")))?;
        record.account_id = account_id.to_string();
        self.write_record(KIND_USERS, user_id, &record).await
    }

    async fn deposit(&self, txid: &str, vout: u32) -> StorageResult<Option<DepositRecord>> {
        self.read_record(KIND_DEPOSITS, &deposit_key(txid, vout)).await
    }

    async fn save_deposit(&self, record: &DepositRecord) -> StorageResult<()> {
        self.write_record(KIND_DEPOSITS, &deposit_key(&record.txid, record.vout), record).await
    }

    async fn confirm_deposits(&self, txid: &str) -> StorageResult<Vec<DepositRecord>> {
        let deposits: Vec<DepositRecord> = self.read_all(KIND_DEPOSITS).await?;
        let mut changed = Vec::new();
        for mut record in deposits {
            if record.txid == txid && !record.confirmed {
                record.confirmed = true;
                self.write_record(KIND_DEPOSITS, &deposit_key(&record.txid, record.vout), &record)
                    .await?;
                changed.push(record);
            }
        }
        Ok(changed)
    }

    async fn give(&self, txid: &str) -> StorageResult<Option<GiveRecord>> {
        self.read_record(KIND_GIVES, txid).await
    }

    async fn save_give(&self, record: &GiveRecord) -> StorageResult<()> {
        self.write_record(KIND_GIVES, &record.txid, record).await
    }

    async fn withdrawal(&self, txid: &str) -> StorageResult<Option<WithdrawalRecord>> {
        self.read_record(KIND_WITHDRAWALS, txid).await
    }

    async fn save_withdrawal(&self, record: &WithdrawalRecord) -> StorageResult<()> {
        self.write_record(KIND_WITHDRAWALS, &record.txid, record).await
    }

    async fn delete_withdrawal(&self, txid: &str) -> StorageResult<()> {
        self.remove_record(KIND_WITHDRAWALS, txid).await
    }
}

/// Classifies feed transactions against the service's own transfer
/// records, so the wallet engine knows which incoming outputs are real
/// deposits.
pub struct StoreTransferLookup {
    store: Arc<dyn WalletStore>,
}

impl StoreTransferLookup {
    /// Creates a lookup over `store`.
    #[must_use]
    pub fn new(store: Arc<dyn WalletStore>) -> Self {
        Self { store }
    }
}

impl std::fmt::Debug for StoreTransferLookup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreTransferLookup").finish_non_exhaustive()
    }
}

#[async_trait]
impl TransferLookup for StoreTransferLookup {
    async fn classify(&self, txid: Txid) -> saifu::error::Result<TxOrigin> {
        let key = txid.to_string();
        if self.store.give(&key).await.map_err(lookup_failed)?.is_some() {
            return Ok(TxOrigin::Give);
        }
        if let Some(withdrawal) = self.store.withdrawal(&key).await.map_err(lookup_failed)? {
            return Ok(TxOrigin::Withdrawal { source: withdrawal.user_id });
        }
        Ok(TxOrigin::External)
    }
}

fn lookup_failed(err: StorageError) -> WalletError {
    WalletError::feed_desync(format!("transfer lookup: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::hashes::Hash;

    fn account(account_id: &str, secret: &str) -> AccountRecord {
        AccountRecord {
            account_id: account_id.to_string(),
            link_secret: secret.to_string(),
            created_at: 1,
        }
    }

    fn user(user_id: &str, account_id: &str) -> UserRecord {
        UserRecord {
            user_id: user_id.to_string(),
            account_id: account_id.to_string(),
            platform: Platform::Cli,
            mnemonic: "abandon abandon about".to_string(),
            created_at: 1,
        }
    }

    fn deposit(txid: &str, vout: u32, user_id: &str) -> DepositRecord {
        DepositRecord {
            txid: txid.to_string(),
            vout,
            value_sats: 5000,
            user_id: user_id.to_string(),
            confirmed: false,
            created_at: 1,
        }
    }

    #[tokio::test]
    async fn test_memory_accounts() {
        let store = MemoryStore::new();
        store.save_account(&account("acct-1", "s3cret")).await.unwrap();

        assert!(store.account("acct-1").await.unwrap().is_some());
        let found = store.account_by_secret("s3cret").await.unwrap().unwrap();
        assert_eq!(found.account_id, "acct-1");
        assert!(store.account_by_secret("wrong").await.unwrap().is_none());

        store.delete_account("acct-1").await.unwrap();
        assert!(store.account("acct-1").await.unwrap().is_none());
        // Deleting again is fine.
        store.delete_account("acct-1").await.unwrap();
    }

    #[tokio::test]
    async fn test_memory_reassign_moves_membership() {
        let store = MemoryStore::new();
        store.save_user(&user("cli:alice", "acct-1")).await.unwrap();
        store.save_user(&user("cli:bob", "acct-2")).await.unwrap();

        store.reassign_user("cli:bob", "acct-1").await.unwrap();

        let members = store.account_users("acct-1").await.unwrap();
        assert_eq!(members.len(), 2);
        assert!(store.account_users("acct-2").await.unwrap().is_empty());

        let err = store.reassign_user("cli:carol", "acct-1").await.unwrap_err();
        assert!(matches!(err, StorageError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_confirm_deposits_flips_each_record_once() {
        let store = MemoryStore::new();
        store.save_deposit(&deposit("aa11", 0, "cli:alice")).await.unwrap();
        store.save_deposit(&deposit("aa11", 1, "cli:bob")).await.unwrap();
        store.save_deposit(&deposit("bb22", 0, "cli:alice")).await.unwrap();

        let changed = store.confirm_deposits("aa11").await.unwrap();
        assert_eq!(changed.len(), 2);
        assert!(changed.iter().all(|record| record.confirmed));

        // A replayed confirmation changes nothing.
        assert!(store.confirm_deposits("aa11").await.unwrap().is_empty());
        assert!(!store.deposit("bb22", 0).await.unwrap().unwrap().confirmed);
    }

    #[tokio::test]
    async fn test_file_store_round_trip() {
        let dir = assert_fs::TempDir::new().unwrap();
        let store = FileStore::new(dir.path());

        store.save_account(&account("acct-1", "s3cret")).await.unwrap();
        store.save_user(&user("cli:alice", "acct-1")).await.unwrap();
        store.save_user(&user("cli:bob", "acct-1")).await.unwrap();

        assert_eq!(store.account_by_secret("s3cret").await.unwrap().unwrap().account_id, "acct-1");
        assert_eq!(store.users().await.unwrap().len(), 2);
        assert_eq!(store.account_users("acct-1").await.unwrap().len(), 2);
        // Keys with `:` land in sanitized file names and still load back.
        assert_eq!(store.user("cli:alice").await.unwrap().unwrap().user_id, "cli:alice");

        store.reassign_user("cli:bob", "acct-9").await.unwrap();
        assert_eq!(store.user("cli:bob").await.unwrap().unwrap().account_id, "acct-9");

        store.save_deposit(&deposit("aa11", 0, "cli:alice")).await.unwrap();
        assert_eq!(store.confirm_deposits("aa11").await.unwrap().len(), 1);
        assert!(store.deposit("aa11", 0).await.unwrap().unwrap().confirmed);

        let withdrawal = WithdrawalRecord {
            txid: "cc33".to_string(),
            user_id: "cli:alice".to_string(),
            destination: "1BvBMSEYstWetqTFn5Au4m4GFg7xJaNVN2".to_string(),
            value_sats: 9000,
            created_at: 1,
        };
        store.save_withdrawal(&withdrawal).await.unwrap();
        assert!(store.withdrawal("cc33").await.unwrap().is_some());
        store.delete_withdrawal("cc33").await.unwrap();
        assert!(store.withdrawal("cc33").await.unwrap().is_none());
        // Compensating a never-saved record is fine.
        store.delete_withdrawal("cc33").await.unwrap();
    }

    #[tokio::test]
    async fn test_file_store_empty_reads() {
        let dir = assert_fs::TempDir::new().unwrap();
        let store = FileStore::new(dir.path().join("never-written"));
        assert!(store.users().await.unwrap().is_empty());
        assert!(store.user("cli:alice").await.unwrap().is_none());
        assert!(store.confirm_deposits("aa11").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_transfer_lookup_classification() {
        let store = Arc::new(MemoryStore::new());
        let lookup = StoreTransferLookup::new(store.clone());

        let give_txid = Txid::from_byte_array([1u8; 32]);
        let withdrawal_txid = Txid::from_byte_array([2u8; 32]);
        let external_txid = Txid::from_byte_array([3u8; 32]);

        store
            .save_give(&GiveRecord {
                txid: give_txid.to_string(),
                from_user: "cli:alice".to_string(),
                to_user: "cli:bob".to_string(),
                value_sats: 5000,
                created_at: 1,
            })
            .await
            .unwrap();
        store
            .save_withdrawal(&WithdrawalRecord {
                txid: withdrawal_txid.to_string(),
                user_id: "cli:alice".to_string(),
                destination: "1BvBMSEYstWetqTFn5Au4m4GFg7xJaNVN2".to_string(),
                value_sats: 9000,
                created_at: 1,
            })
            .await
            .unwrap();

        assert_eq!(lookup.classify(give_txid).await.unwrap(), TxOrigin::Give);
        assert_eq!(
            lookup.classify(withdrawal_txid).await.unwrap(),
            TxOrigin::Withdrawal { source: "cli:alice".to_string() }
        );
        assert_eq!(lookup.classify(external_txid).await.unwrap(), TxOrigin::External);
    }
}
