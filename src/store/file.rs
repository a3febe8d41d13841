//! Pipe-delimited partition file codec and the atomic snapshot primitive.
//!
//! Account partitions persist as `ID_CUENTA|ID_CLIENTE|SALDO|TIPO_CUENTA`
//! rows, client partitions as `ID_CLIENTE|NOMBRE|EMAIL|TELEFONO`, each file
//! starting with a header line. Raw row structs are kept separate from the
//! domain types; balances are written as fixed two-decimal text.

use std::io::Write;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use super::error::StoreError;
use crate::model::{
    Account, AccountId, ClientId, ClientRecord, PartitionKind, PartitionRecords,
};

const ACCOUNT_HEADER: [&str; 4] = ["ID_CUENTA", "ID_CLIENTE", "SALDO", "TIPO_CUENTA"];
const CLIENT_HEADER: [&str; 4] = ["ID_CLIENTE", "NOMBRE", "EMAIL", "TELEFONO"];

#[derive(Debug, Serialize, Deserialize)]
struct AccountRow {
    #[serde(rename = "ID_CUENTA")]
    account_id: AccountId,
    #[serde(rename = "ID_CLIENTE")]
    client_id: ClientId,
    #[serde(rename = "SALDO")]
    balance: String,
    #[serde(rename = "TIPO_CUENTA")]
    kind: String,
}

impl From<&Account> for AccountRow {
    fn from(account: &Account) -> Self {
        AccountRow {
            account_id: account.account_id,
            client_id: account.client_id,
            balance: account.balance.to_string(),
            kind: account.kind.to_string(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct ClientRow {
    #[serde(rename = "ID_CLIENTE")]
    client_id: ClientId,
    #[serde(rename = "NOMBRE")]
    name: String,
    #[serde(rename = "EMAIL")]
    email: String,
    #[serde(rename = "TELEFONO")]
    phone: String,
}

/// Replaces `path` with `contents` all-or-nothing: the new content is
/// written to a side file in the same directory, synced, and renamed over
/// the visible path. A reader never observes a partially written file.
pub(crate) fn replace_atomic(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let dir = path.parent().filter(|p| !p.as_os_str().is_empty());
    let mut side = NamedTempFile::new_in(dir.unwrap_or(Path::new(".")))?;
    side.write_all(contents)?;
    side.as_file().sync_all()?;
    side.persist(path).map_err(|e| e.error)?;
    Ok(())
}

fn reader(path: &Path) -> Result<csv::Reader<std::fs::File>, StoreError> {
    csv::ReaderBuilder::new()
        .delimiter(b'|')
        .trim(csv::Trim::All)
        .from_path(path)
        .map_err(|source| StoreError::Read {
            path: path.to_path_buf(),
            source,
        })
}

pub(crate) fn read_accounts(path: &Path) -> Result<Vec<Account>, StoreError> {
    let read_err = |source| StoreError::Read {
        path: path.to_path_buf(),
        source,
    };
    let corrupt = |detail: String| StoreError::Corrupt {
        path: path.to_path_buf(),
        detail,
    };

    let mut accounts = Vec::new();
    for row in reader(path)?.deserialize::<AccountRow>() {
        let row = row.map_err(read_err)?;
        accounts.push(Account {
            account_id: row.account_id,
            client_id: row.client_id,
            balance: row.balance.parse().map_err(|e| corrupt(format!("{e}")))?,
            kind: row.kind.parse().map_err(|e| corrupt(format!("{e}")))?,
        });
    }
    Ok(accounts)
}

pub(crate) fn read_clients(path: &Path) -> Result<Vec<ClientRecord>, StoreError> {
    let read_err = |source| StoreError::Read {
        path: path.to_path_buf(),
        source,
    };

    let mut clients = Vec::new();
    for row in reader(path)?.deserialize::<ClientRow>() {
        let row = row.map_err(read_err)?;
        clients.push(ClientRecord {
            client_id: row.client_id,
            name: row.name,
            email: row.email,
            phone: row.phone,
        });
    }
    Ok(clients)
}

pub(crate) fn read_records(
    path: &Path,
    kind: PartitionKind,
) -> Result<PartitionRecords, StoreError> {
    match kind {
        PartitionKind::Account => read_accounts(path).map(PartitionRecords::Accounts),
        PartitionKind::Client => read_clients(path).map(PartitionRecords::Clients),
    }
}

fn encode<R: Serialize>(
    header: [&str; 4],
    rows: impl Iterator<Item = R>,
) -> Result<Vec<u8>, StoreError> {
    let mut writer = csv::WriterBuilder::new()
        .delimiter(b'|')
        .has_headers(false)
        .from_writer(Vec::new());
    writer.write_record(header).map_err(io_from_csv)?;
    for row in rows {
        writer.serialize(row).map_err(io_from_csv)?;
    }
    writer
        .into_inner()
        .map_err(|e| StoreError::Io(e.into_error()))
}

fn io_from_csv(source: csv::Error) -> StoreError {
    match source.into_kind() {
        csv::ErrorKind::Io(e) => StoreError::Io(e),
        other => StoreError::Io(std::io::Error::other(format!("csv encode: {other:?}"))),
    }
}

pub(crate) fn write_accounts(path: &Path, accounts: &[Account]) -> Result<(), StoreError> {
    let bytes = encode(ACCOUNT_HEADER, accounts.iter().map(AccountRow::from))?;
    replace_atomic(path, &bytes)?;
    Ok(())
}

fn write_clients(path: &Path, clients: &[ClientRecord]) -> Result<(), StoreError> {
    let rows = clients.iter().map(|c| ClientRow {
        client_id: c.client_id,
        name: c.name.clone(),
        email: c.email.clone(),
        phone: c.phone.clone(),
    });
    let bytes = encode(CLIENT_HEADER, rows)?;
    replace_atomic(path, &bytes)?;
    Ok(())
}

pub(crate) fn write_records(path: &Path, records: &PartitionRecords) -> Result<(), StoreError> {
    match records {
        PartitionRecords::Accounts(accounts) => write_accounts(path, accounts),
        PartitionRecords::Clients(clients) => write_clients(path, clients),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::amount::Amount;
    use crate::model::AccountKind;

    fn sample_accounts() -> Vec<Account> {
        vec![
            Account {
                account_id: 101,
                client_id: 1,
                balance: Amount::from_scaled(50_000),
                kind: AccountKind::Savings,
            },
            Account {
                account_id: 102,
                client_id: 2,
                balance: Amount::from_scaled(5_000),
                kind: AccountKind::Checking,
            },
        ]
    }

    #[test]
    fn account_file_layout() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ACCOUNT_P1.txt");
        write_accounts(&path, &sample_accounts()).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines[0], "ID_CUENTA|ID_CLIENTE|SALDO|TIPO_CUENTA");
        assert_eq!(lines[1], "101|1|500.00|SAVINGS");
        assert_eq!(lines[2], "102|2|50.00|CHECKING");
    }

    #[test]
    fn accounts_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ACCOUNT_P1.txt");
        let accounts = sample_accounts();
        write_accounts(&path, &accounts).unwrap();
        assert_eq!(read_accounts(&path).unwrap(), accounts);
    }

    #[test]
    fn clients_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("CLIENT_P1.txt");
        let clients = vec![ClientRecord {
            client_id: 1,
            name: "Ana Gomez".into(),
            email: "ana@example.com".into(),
            phone: "555-0101".into(),
        }];
        write_records(&path, &PartitionRecords::Clients(clients.clone())).unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.starts_with("ID_CLIENTE|NOMBRE|EMAIL|TELEFONO\n"));
        assert_eq!(read_clients(&path).unwrap(), clients);
    }

    #[test]
    fn empty_partition_keeps_header_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ACCOUNT_P2.txt");
        write_accounts(&path, &[]).unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "ID_CUENTA|ID_CLIENTE|SALDO|TIPO_CUENTA\n");
        assert!(read_accounts(&path).unwrap().is_empty());
    }

    #[test]
    fn replace_atomic_overwrites_whole_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("file.txt");
        replace_atomic(&path, b"first version, long contents\n").unwrap();
        replace_atomic(&path, b"second\n").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "second\n");
    }

    #[test]
    fn corrupt_balance_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ACCOUNT_P1.txt");
        std::fs::write(
            &path,
            "ID_CUENTA|ID_CLIENTE|SALDO|TIPO_CUENTA\n101|1|not-money|SAVINGS\n",
        )
        .unwrap();
        assert!(matches!(
            read_accounts(&path),
            Err(StoreError::Corrupt { .. })
        ));
    }
}
