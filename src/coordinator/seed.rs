//! Seed record loading and partitioning.
//!
//! At startup the coordinator loads the full account and client tables from
//! pipe-delimited files and buckets them into partitions with the
//! deterministic mapping from `model`. The coordinator keeps these record
//! sets only to ship them to workers at registration; it never serves reads
//! from them.

use std::collections::BTreeMap;

use thiserror::Error;
use tracing::info;

use crate::config::CoordinatorConfig;
use crate::model::{PartitionId, PartitionRecords};
use crate::store::StoreError;
use crate::store::file;

/// Error loading seed data.
#[derive(Debug, Error)]
#[error("failed to load seed records: {0}")]
pub struct SeedError(#[from] StoreError);

pub struct Seeds {
    partitions: BTreeMap<PartitionId, PartitionRecords>,
}

impl Seeds {
    pub fn load(cfg: &CoordinatorConfig) -> Result<Seeds, SeedError> {
        let accounts = file::read_accounts(&cfg.accounts_file())?;
        let clients = file::read_clients(&cfg.clients_file())?;
        info!(
            accounts = accounts.len(),
            clients = clients.len(),
            "seed records loaded"
        );

        let mut partitions = BTreeMap::new();
        for index in 1..=cfg.account_partitions {
            partitions.insert(
                PartitionId::account(index),
                PartitionRecords::Accounts(Vec::new()),
            );
        }
        for index in 1..=cfg.client_partitions {
            partitions.insert(
                PartitionId::client(index),
                PartitionRecords::Clients(Vec::new()),
            );
        }

        for account in accounts {
            let id = PartitionId::for_account(account.account_id, cfg.account_partitions);
            match partitions.get_mut(&id) {
                Some(PartitionRecords::Accounts(rows)) => rows.push(account),
                _ => unreachable!("account bucket always maps to an account partition"),
            }
        }
        for client in clients {
            let id = PartitionId::for_client(client.client_id, cfg.client_partitions);
            match partitions.get_mut(&id) {
                Some(PartitionRecords::Clients(rows)) => rows.push(client),
                _ => unreachable!("client bucket always maps to a client partition"),
            }
        }

        for (partition, records) in &partitions {
            info!(%partition, records = records.len(), "partition built");
        }
        Ok(Seeds { partitions })
    }

    pub fn partition_ids(&self) -> Vec<PartitionId> {
        self.partitions.keys().copied().collect()
    }

    pub fn records(&self, partition: PartitionId) -> Option<&PartitionRecords> {
        self.partitions.get(&partition)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_seed_files(dir: &std::path::Path) {
        std::fs::write(
            dir.join("cuentas.csv"),
            "ID_CUENTA|ID_CLIENTE|SALDO|TIPO_CUENTA\n\
             101|1|500.00|SAVINGS\n\
             102|2|50.00|CHECKING\n\
             205|3|75.50|SAVINGS\n",
        )
        .unwrap();
        std::fs::write(
            dir.join("clientes.csv"),
            "ID_CLIENTE|NOMBRE|EMAIL|TELEFONO\n\
             1|Ana Gomez|ana@example.com|555-0101\n\
             2|Luis Rojas|luis@example.com|555-0102\n",
        )
        .unwrap();
    }

    fn config(dir: &std::path::Path) -> CoordinatorConfig {
        CoordinatorConfig {
            data_dir: dir.to_path_buf(),
            account_partitions: 2,
            client_partitions: 2,
            ..CoordinatorConfig::default()
        }
    }

    #[test]
    fn every_partition_exists_even_when_empty() {
        let dir = tempfile::tempdir().unwrap();
        write_seed_files(dir.path());
        let seeds = Seeds::load(&config(dir.path())).unwrap();
        assert_eq!(
            seeds.partition_ids(),
            vec![
                PartitionId::account(1),
                PartitionId::account(2),
                PartitionId::client(1),
                PartitionId::client(2),
            ]
        );
    }

    #[test]
    fn records_land_in_their_deterministic_bucket() {
        let dir = tempfile::tempdir().unwrap();
        write_seed_files(dir.path());
        let seeds = Seeds::load(&config(dir.path())).unwrap();

        for (account, partition) in [(101u32, 2), (102, 1), (205, 2)] {
            let expected = PartitionId::account(partition);
            assert_eq!(PartitionId::for_account(account, 2), expected);
            match seeds.records(expected).unwrap() {
                PartitionRecords::Accounts(rows) => {
                    assert!(rows.iter().any(|a| a.account_id == account));
                }
                _ => panic!("expected account partition"),
            }
        }
    }

    #[test]
    fn missing_seed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Seeds::load(&config(dir.path())).is_err());
    }
}
