//! Core domain types for the partitioned ledger.

use std::fmt;
use std::str::FromStr;

use serde::de;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

use crate::Amount;

/// Account identifier.
pub type AccountId = u32;

/// Client identifier.
pub type ClientId = u32;

/// Coordinator-assigned identifier of one transfer orchestration.
pub type TransferId = u64;

/// Which record type a partition shards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PartitionKind {
    Account,
    Client,
}

impl PartitionKind {
    fn prefix(self) -> &'static str {
        match self {
            PartitionKind::Account => "ACCOUNT_P",
            PartitionKind::Client => "CLIENT_P",
        }
    }
}

/// Identifier of one disjoint shard of account or client records,
/// rendered `ACCOUNT_P<n>` or `CLIENT_P<n>` with `n >= 1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PartitionId {
    pub kind: PartitionKind,
    pub index: u16,
}

impl PartitionId {
    pub fn account(index: u16) -> Self {
        PartitionId {
            kind: PartitionKind::Account,
            index,
        }
    }

    pub fn client(index: u16) -> Self {
        PartitionId {
            kind: PartitionKind::Client,
            index,
        }
    }

    /// The partition owning an account: a deterministic bucket of the id.
    /// This function is the only mapping knowledge the coordinator holds.
    pub fn for_account(account: AccountId, buckets: u16) -> Self {
        Self::account((account % buckets as u32) as u16 + 1)
    }

    /// The partition owning a client record.
    pub fn for_client(client: ClientId, buckets: u16) -> Self {
        Self::client((client % buckets as u32) as u16 + 1)
    }

    /// File name of this partition's persisted snapshot.
    pub fn file_name(&self) -> String {
        format!("{self}.txt")
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.kind.prefix(), self.index)
    }
}

/// Error parsing a partition identifier.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid partition id '{0}'")]
pub struct ParsePartitionError(String);

impl FromStr for PartitionId {
    type Err = ParsePartitionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParsePartitionError(s.to_string());
        for kind in [PartitionKind::Account, PartitionKind::Client] {
            if let Some(rest) = s.strip_prefix(kind.prefix()) {
                let index: u16 = rest.parse().map_err(|_| err())?;
                if index == 0 {
                    return Err(err());
                }
                return Ok(PartitionId { kind, index });
            }
        }
        Err(err())
    }
}

// Serialized as its display string so partition ids can key JSON maps.
impl Serialize for PartitionId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for PartitionId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(de::Error::custom)
    }
}

/// Enumerated account type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccountKind {
    Savings,
    Checking,
}

impl fmt::Display for AccountKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AccountKind::Savings => "SAVINGS",
            AccountKind::Checking => "CHECKING",
        })
    }
}

/// Error parsing an account type tag.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown account type '{0}'")]
pub struct ParseAccountKindError(String);

impl FromStr for AccountKind {
    type Err = ParseAccountKindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SAVINGS" => Ok(AccountKind::Savings),
            "CHECKING" => Ok(AccountKind::Checking),
            other => Err(ParseAccountKindError(other.to_string())),
        }
    }
}

/// One account record. Belongs to exactly one account partition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    #[serde(rename = "idCuenta")]
    pub account_id: AccountId,
    #[serde(rename = "idCliente")]
    pub client_id: ClientId,
    #[serde(rename = "saldo")]
    pub balance: Amount,
    #[serde(rename = "tipoCuenta")]
    pub kind: AccountKind,
}

/// One client record. Belongs to exactly one client partition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientRecord {
    #[serde(rename = "idCliente")]
    pub client_id: ClientId,
    #[serde(rename = "nombre")]
    pub name: String,
    pub email: String,
    #[serde(rename = "telefono")]
    pub phone: String,
}

/// A partition's full record set, treated as a value: the worker holds the
/// authoritative copy, the coordinator ships it once at registration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PartitionRecords {
    Accounts(Vec<Account>),
    Clients(Vec<ClientRecord>),
}

impl PartitionRecords {
    pub fn empty(kind: PartitionKind) -> PartitionRecords {
        match kind {
            PartitionKind::Account => PartitionRecords::Accounts(Vec::new()),
            PartitionKind::Client => PartitionRecords::Clients(Vec::new()),
        }
    }

    pub fn kind(&self) -> PartitionKind {
        match self {
            PartitionRecords::Accounts(_) => PartitionKind::Account,
            PartitionRecords::Clients(_) => PartitionKind::Client,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            PartitionRecords::Accounts(rows) => rows.len(),
            PartitionRecords::Clients(rows) => rows.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
