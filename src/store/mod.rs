//! Per-worker partition store.
//!
//! Holds one durable, pipe-delimited snapshot file per assigned partition
//! and applies balance mutations atomically: every mutation runs under that
//! partition's async mutex (one logical writer at a time, independent
//! partitions in parallel) as a read-modify-write that swaps the whole file
//! with [`file::replace_atomic`]. Applied mutations are appended to the
//! node's operation log before the call returns.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use tokio::sync::Mutex;
use tracing::debug;

use crate::amount::Amount;
use crate::journal::Journal;
use crate::model::{
    Account, AccountId, PartitionId, PartitionKind, PartitionRecords, TransferId,
};

mod error;
pub(crate) mod file;

pub use error::StoreError;

const OPLOG_FILE: &str = "operations.log";

struct PartitionHandle {
    path: PathBuf,
    lock: Arc<Mutex<()>>,
}

pub struct PartitionStore {
    base_dir: PathBuf,
    oplog: Journal,
    partitions: RwLock<HashMap<PartitionId, Arc<PartitionHandle>>>,
}

impl PartitionStore {
    /// Opens a store rooted at `base_dir`, creating the directory and the
    /// operation log. Partitions become visible through [`assign`].
    ///
    /// [`assign`]: PartitionStore::assign
    pub fn open(base_dir: impl Into<PathBuf>) -> std::io::Result<Self> {
        let base_dir = base_dir.into();
        std::fs::create_dir_all(&base_dir)?;
        let oplog = Journal::open(base_dir.join(OPLOG_FILE))?;
        Ok(PartitionStore {
            base_dir,
            oplog,
            partitions: RwLock::new(HashMap::new()),
        })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Partitions currently assigned to this store, in sorted order.
    pub fn assigned(&self) -> Vec<PartitionId> {
        let mut ids: Vec<_> = self
            .partitions
            .read()
            .expect("partition map lock poisoned")
            .keys()
            .copied()
            .collect();
        ids.sort();
        ids
    }

    pub fn is_assigned(&self, partition: PartitionId) -> bool {
        self.partitions
            .read()
            .expect("partition map lock poisoned")
            .contains_key(&partition)
    }

    /// Persists a full partition snapshot and registers the partition.
    /// All-or-nothing: a reader never observes a half-written file. Used
    /// once per partition, during registration.
    pub fn assign(
        &self,
        partition: PartitionId,
        records: &PartitionRecords,
    ) -> Result<(), StoreError> {
        // An empty record set carries no kind of its own on the wire.
        let empty;
        let records = if records.kind() == partition.kind {
            records
        } else if records.is_empty() {
            empty = PartitionRecords::empty(partition.kind);
            &empty
        } else {
            return Err(StoreError::KindMismatch(partition));
        };
        let path = self.base_dir.join(partition.file_name());
        file::write_records(&path, records)?;
        debug!(%partition, records = records.len(), "partition snapshot persisted");

        let handle = Arc::new(PartitionHandle {
            path,
            lock: Arc::new(Mutex::new(())),
        });
        self.partitions
            .write()
            .expect("partition map lock poisoned")
            .insert(partition, handle);
        Ok(())
    }

    /// Loads the full record set of an assigned partition.
    pub fn load(&self, partition: PartitionId) -> Result<PartitionRecords, StoreError> {
        let handle = self.handle(partition)?;
        file::read_records(&handle.path, partition.kind)
    }

    pub async fn read_balance(
        &self,
        partition: PartitionId,
        account: AccountId,
    ) -> Result<Amount, StoreError> {
        let handle = self.account_handle(partition)?;
        let _guard = handle.lock.lock().await;
        let accounts = file::read_accounts(&handle.path)?;
        Ok(find(&accounts, account, partition)?.balance)
    }

    /// Debits `amount` from `account`, checking funds and decrementing
    /// under the partition lock. Returns the new balance.
    pub async fn apply_debit(
        &self,
        partition: PartitionId,
        account: AccountId,
        amount: Amount,
        tx: Option<TransferId>,
    ) -> Result<Amount, StoreError> {
        let handle = self.account_handle(partition)?;
        let _guard = handle.lock.lock().await;
        let mut accounts = file::read_accounts(&handle.path)?;

        let entry = find_mut(&mut accounts, account, partition)?;
        if entry.balance < amount {
            return Err(StoreError::InsufficientFunds {
                account,
                available: entry.balance,
                requested: amount,
            });
        }
        entry.balance -= amount;
        let balance = entry.balance;

        file::write_accounts(&handle.path, &accounts)?;
        self.log(tx, "DEBIT", partition, account, amount, balance)?;
        Ok(balance)
    }

    /// Credits `amount` to `account`. Returns the new balance.
    pub async fn apply_credit(
        &self,
        partition: PartitionId,
        account: AccountId,
        amount: Amount,
        tx: Option<TransferId>,
    ) -> Result<Amount, StoreError> {
        self.credit_inner(partition, account, amount, tx, "CREDIT").await
    }

    /// Re-credits a previously prepared debit. Issued at most once per
    /// failed transfer by the orchestrator's compensation path.
    pub async fn revert_debit(
        &self,
        partition: PartitionId,
        account: AccountId,
        amount: Amount,
        tx: Option<TransferId>,
    ) -> Result<Amount, StoreError> {
        self.credit_inner(partition, account, amount, tx, "REVERT").await
    }

    async fn credit_inner(
        &self,
        partition: PartitionId,
        account: AccountId,
        amount: Amount,
        tx: Option<TransferId>,
        op: &str,
    ) -> Result<Amount, StoreError> {
        let handle = self.account_handle(partition)?;
        let _guard = handle.lock.lock().await;
        let mut accounts = file::read_accounts(&handle.path)?;

        let entry = find_mut(&mut accounts, account, partition)?;
        entry.balance += amount;
        let balance = entry.balance;

        file::write_accounts(&handle.path, &accounts)?;
        self.log(tx, op, partition, account, amount, balance)?;
        Ok(balance)
    }

    /// Finalizes a prepared debit. The balance was already decremented at
    /// prepare time; this verifies the account and records the confirmation.
    pub async fn confirm_debit(
        &self,
        partition: PartitionId,
        account: AccountId,
        amount: Amount,
        tx: Option<TransferId>,
    ) -> Result<Amount, StoreError> {
        let handle = self.account_handle(partition)?;
        let _guard = handle.lock.lock().await;
        let accounts = file::read_accounts(&handle.path)?;
        let balance = find(&accounts, account, partition)?.balance;
        self.log(tx, "CONFIRM", partition, account, amount, balance)?;
        Ok(balance)
    }

    /// Same-partition transfer fast path: both balances are checked and
    /// updated in one locked read-modify-write, one file swap.
    pub async fn apply_transfer(
        &self,
        partition: PartitionId,
        origin: AccountId,
        destination: AccountId,
        amount: Amount,
        tx: Option<TransferId>,
    ) -> Result<(Amount, Amount), StoreError> {
        let handle = self.account_handle(partition)?;
        let _guard = handle.lock.lock().await;
        let mut accounts = file::read_accounts(&handle.path)?;

        let origin_balance = find(&accounts, origin, partition)?.balance;
        if origin_balance < amount {
            return Err(StoreError::InsufficientFunds {
                account: origin,
                available: origin_balance,
                requested: amount,
            });
        }
        // Destination is resolved before any mutation so a missing account
        // leaves the origin untouched.
        find(&accounts, destination, partition)?;

        let origin_after = {
            let entry = find_mut(&mut accounts, origin, partition)?;
            entry.balance -= amount;
            entry.balance
        };
        let destination_after = {
            let entry = find_mut(&mut accounts, destination, partition)?;
            entry.balance += amount;
            entry.balance
        };

        file::write_accounts(&handle.path, &accounts)?;
        self.log(tx, "DEBIT", partition, origin, amount, origin_after)?;
        self.log(tx, "CREDIT", partition, destination, amount, destination_after)?;
        Ok((origin_after, destination_after))
    }

    /// Overwrites an account balance with a replicated value.
    pub async fn set_balance(
        &self,
        partition: PartitionId,
        account: AccountId,
        new_balance: Amount,
        tx: Option<TransferId>,
    ) -> Result<Amount, StoreError> {
        let handle = self.account_handle(partition)?;
        let _guard = handle.lock.lock().await;
        let mut accounts = file::read_accounts(&handle.path)?;

        let entry = find_mut(&mut accounts, account, partition)?;
        entry.balance = new_balance;

        file::write_accounts(&handle.path, &accounts)?;
        self.log(tx, "REPLICA", partition, account, new_balance, new_balance)?;
        Ok(new_balance)
    }

    /// Sum of all balances in an account partition.
    pub async fn partition_total(&self, partition: PartitionId) -> Result<Amount, StoreError> {
        let handle = self.account_handle(partition)?;
        let _guard = handle.lock.lock().await;
        let accounts = file::read_accounts(&handle.path)?;
        Ok(accounts.iter().map(|a| a.balance).sum())
    }

    fn handle(&self, partition: PartitionId) -> Result<Arc<PartitionHandle>, StoreError> {
        self.partitions
            .read()
            .expect("partition map lock poisoned")
            .get(&partition)
            .cloned()
            .ok_or(StoreError::PartitionNotAssigned(partition))
    }

    fn account_handle(&self, partition: PartitionId) -> Result<Arc<PartitionHandle>, StoreError> {
        if partition.kind != PartitionKind::Account {
            return Err(StoreError::NotAccountPartition(partition));
        }
        self.handle(partition)
    }

    fn log(
        &self,
        tx: Option<TransferId>,
        op: &str,
        partition: PartitionId,
        account: AccountId,
        amount: Amount,
        balance_after: Amount,
    ) -> Result<(), StoreError> {
        self.oplog.append(&format!(
            "{}|{op}|{partition}|{account}|{amount}|{balance_after}",
            OptTx(tx)
        ))?;
        Ok(())
    }
}

struct OptTx(Option<TransferId>);

impl fmt::Display for OptTx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(tx) => write!(f, "{tx}"),
            None => f.write_str("-"),
        }
    }
}

fn find<'a>(
    accounts: &'a [Account],
    account: AccountId,
    partition: PartitionId,
) -> Result<&'a Account, StoreError> {
    accounts
        .iter()
        .find(|a| a.account_id == account)
        .ok_or(StoreError::AccountNotFound { account, partition })
}

fn find_mut<'a>(
    accounts: &'a mut [Account],
    account: AccountId,
    partition: PartitionId,
) -> Result<&'a mut Account, StoreError> {
    accounts
        .iter_mut()
        .find(|a| a.account_id == account)
        .ok_or(StoreError::AccountNotFound { account, partition })
}
