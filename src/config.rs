//! Process configuration for the coordinator and worker binaries.

use std::path::PathBuf;
use std::time::Duration;

/// Coordinator configuration. Defaults match the reference deployment; the
/// binary overrides ports and data directory from positional arguments.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Listen port for client connections.
    pub client_port: u16,
    /// Listen port for worker registrations.
    pub worker_port: u16,
    /// Directory holding seed record files and the transfer journal.
    pub data_dir: PathBuf,
    /// Number of account partitions the seed data is bucketed into.
    pub account_partitions: u16,
    /// Number of client partitions.
    pub client_partitions: u16,
    /// Total snapshot holders per partition (owner plus replicas).
    pub replica_factor: usize,
    /// Cap on how many unowned partitions one registering worker takes.
    pub max_owned_per_worker: usize,
    /// Bound on every coordinator-to-worker request.
    pub request_timeout: Duration,
    /// Bound on the registration handshake after the snapshot is shipped.
    pub registration_timeout: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        CoordinatorConfig {
            client_port: 12345,
            worker_port: 12346,
            data_dir: PathBuf::from("data"),
            account_partitions: 3,
            client_partitions: 3,
            replica_factor: 1,
            max_owned_per_worker: usize::MAX,
            request_timeout: Duration::from_secs(5),
            registration_timeout: Duration::from_secs(30),
        }
    }
}

impl CoordinatorConfig {
    pub fn accounts_file(&self) -> PathBuf {
        self.data_dir.join("cuentas.csv")
    }

    pub fn clients_file(&self) -> PathBuf {
        self.data_dir.join("clientes.csv")
    }

    pub fn journal_path(&self) -> PathBuf {
        self.data_dir.join("transfers.log")
    }
}

/// Worker configuration, built from the binary's positional arguments.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Unique worker identifier.
    pub worker_id: String,
    /// Coordinator registration endpoint.
    pub coordinator_host: String,
    pub coordinator_port: u16,
    /// Port the task service listens on. Port 0 binds an ephemeral port;
    /// the actual port is reported to the coordinator at registration.
    pub task_port: u16,
    /// Directory holding partition snapshots and the operation log.
    pub data_dir: PathBuf,
    /// Admission limit for concurrent task connections.
    pub max_task_connections: usize,
    /// Bound on the registration handshake.
    pub registration_timeout: Duration,
}

impl WorkerConfig {
    pub fn new(
        worker_id: impl Into<String>,
        coordinator_host: impl Into<String>,
        coordinator_port: u16,
        task_port: u16,
    ) -> Self {
        let worker_id = worker_id.into();
        let data_dir = PathBuf::from(format!("data_{worker_id}"));
        WorkerConfig {
            worker_id,
            coordinator_host: coordinator_host.into(),
            coordinator_port,
            task_port,
            data_dir,
            max_task_connections: 10,
            registration_timeout: Duration::from_secs(30),
        }
    }
}
