//! Error types for the partition store.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::amount::Amount;
use crate::model::{AccountId, PartitionId};

/// Error returned by [`PartitionStore`](super::PartitionStore) operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("partition {0} is not assigned to this worker")]
    PartitionNotAssigned(PartitionId),

    #[error("partition {0} does not hold account records")]
    NotAccountPartition(PartitionId),

    #[error("snapshot record kind does not match partition {0}")]
    KindMismatch(PartitionId),

    #[error("account {account} not found in partition {partition}")]
    AccountNotFound {
        account: AccountId,
        partition: PartitionId,
    },

    #[error(
        "insufficient funds in account {account}: available {available}, requested {requested}"
    )]
    InsufficientFunds {
        account: AccountId,
        available: Amount,
        requested: Amount,
    },

    #[error("failed to read partition file {path}: {source}")]
    Read {
        path: PathBuf,
        source: csv::Error,
    },

    #[error("corrupt record in partition file {path}: {detail}")]
    Corrupt { path: PathBuf, detail: String },

    #[error(transparent)]
    Io(#[from] io::Error),
}
