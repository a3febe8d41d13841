//! Worker node lifecycle: register against the coordinator, then serve
//! task connections against the local partition store.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::info;

use crate::config::WorkerConfig;
use crate::model::PartitionId;
use crate::store::PartitionStore;

mod registration;
mod service;

pub use registration::RegistrationError;
pub use service::TaskService;

/// Error preventing a worker from starting.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("registration failed: {0}")]
    Registration(#[from] RegistrationError),

    #[error(transparent)]
    Io(#[from] io::Error),
}

pub struct WorkerNode {
    cfg: WorkerConfig,
    store: Arc<PartitionStore>,
}

/// A running worker's task service.
pub struct WorkerHandle {
    pub task_addr: SocketAddr,
    pub partitions: Vec<PartitionId>,
    serve_task: JoinHandle<()>,
}

impl WorkerHandle {
    /// Runs until the task service stops (it normally never does).
    pub async fn wait(self) {
        let _ = self.serve_task.await;
    }

    /// Tears the task service down, dropping its listener and connections.
    pub fn abort(&self) {
        self.serve_task.abort();
    }
}

impl WorkerNode {
    pub fn new(cfg: WorkerConfig) -> io::Result<Self> {
        let store = Arc::new(PartitionStore::open(&cfg.data_dir)?);
        Ok(WorkerNode { cfg, store })
    }

    pub fn store(&self) -> Arc<PartitionStore> {
        self.store.clone()
    }

    /// Binds the task listener, registers against the coordinator (fatal on
    /// failure: the worker must not serve without durable partition data),
    /// and only then starts accepting task connections.
    pub async fn start(self) -> Result<WorkerHandle, WorkerError> {
        let listener = TcpListener::bind(("0.0.0.0", self.cfg.task_port)).await?;
        let task_addr = listener.local_addr()?;

        let partitions =
            registration::register(&self.cfg, task_addr.port(), &self.store).await?;
        info!(
            worker = %self.cfg.worker_id,
            port = task_addr.port(),
            ?partitions,
            "registration complete, task service starting"
        );

        let service = Arc::new(TaskService::new(
            self.cfg.worker_id.clone(),
            self.store.clone(),
            self.cfg.max_task_connections,
        ));
        let serve_task = tokio::spawn(service.serve(listener));

        Ok(WorkerHandle {
            task_addr,
            partitions,
            serve_task,
        })
    }
}
