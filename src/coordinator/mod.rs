//! Coordinator: partition registry, request routing and transfer
//! orchestration.
//!
//! Listens on two ports: one for clients, one for worker registrations.
//! Single-partition queries are routed to the owning worker; transfers go
//! through the orchestrator; audits fan out over every account partition.
//! The coordinator holds no record data, only the ownership mapping and the
//! seed snapshots it ships at registration.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::{SinkExt, StreamExt};
use serde_json::json;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::codec::Framed;
use tracing::{debug, warn};

use crate::amount::Amount;
use crate::config::CoordinatorConfig;
use crate::journal::Journal;
use crate::model::PartitionId;
use crate::protocol::{OperationType, Params, Request, Response, Status, encode, task_codec};

mod pool;
mod registration;
mod registry;
mod seed;
mod transfer;

pub use pool::{CallError, WorkerPool};
pub use registry::{Registry, WorkerDescriptor};
pub use seed::{SeedError, Seeds};
pub use transfer::TransferSpec;

use transfer::TransferOrchestrator;

/// Error preventing the coordinator from starting.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error(transparent)]
    Seed(#[from] SeedError),

    #[error(transparent)]
    Io(#[from] io::Error),
}

pub struct Coordinator {
    cfg: CoordinatorConfig,
    registry: Arc<Registry>,
    seeds: Arc<Seeds>,
    pool: Arc<WorkerPool>,
    orchestrator: TransferOrchestrator,
    next_transfer_id: AtomicU64,
}

/// A running coordinator's listeners.
pub struct CoordinatorHandle {
    pub client_addr: SocketAddr,
    pub worker_addr: SocketAddr,
    client_task: JoinHandle<()>,
    worker_task: JoinHandle<()>,
}

impl CoordinatorHandle {
    /// Runs until either listener stops (they normally never do).
    pub async fn wait(self) {
        let _ = futures::future::join(self.client_task, self.worker_task).await;
    }

    pub fn abort(&self) {
        self.client_task.abort();
        self.worker_task.abort();
    }
}

impl Coordinator {
    /// Loads seed data and builds the registry and journal. No sockets are
    /// bound yet; call [`start`](Coordinator::start).
    pub fn new(cfg: CoordinatorConfig) -> Result<Arc<Self>, CoordinatorError> {
        let seeds = Arc::new(Seeds::load(&cfg)?);
        let registry = Arc::new(Registry::new(
            seeds.partition_ids(),
            cfg.replica_factor,
            cfg.max_owned_per_worker,
        ));
        let pool = Arc::new(WorkerPool::new(cfg.request_timeout));
        let journal = Arc::new(Journal::open(cfg.journal_path())?);
        let orchestrator = TransferOrchestrator::new(
            registry.clone(),
            pool.clone(),
            journal,
            cfg.account_partitions,
        );
        Ok(Arc::new(Coordinator {
            cfg,
            registry,
            seeds,
            pool,
            orchestrator,
            next_transfer_id: AtomicU64::new(0),
        }))
    }

    /// Binds both listeners and spawns their accept loops.
    pub async fn start(self: Arc<Self>) -> io::Result<CoordinatorHandle> {
        let client_listener = TcpListener::bind(("0.0.0.0", self.cfg.client_port)).await?;
        let worker_listener = TcpListener::bind(("0.0.0.0", self.cfg.worker_port)).await?;
        let client_addr = client_listener.local_addr()?;
        let worker_addr = worker_listener.local_addr()?;

        let client_task = tokio::spawn(self.clone().serve_clients(client_listener));
        let worker_task = tokio::spawn(self.clone().serve_workers(worker_listener));

        Ok(CoordinatorHandle {
            client_addr,
            worker_addr,
            client_task,
            worker_task,
        })
    }

    async fn serve_workers(self: Arc<Self>, listener: TcpListener) {
        let mut incoming = TcpListenerStream::new(listener);
        while let Some(conn) = incoming.next().await {
            match conn {
                Ok(socket) => {
                    let peer = match socket.peer_addr() {
                        Ok(peer) => peer,
                        Err(_) => continue,
                    };
                    tokio::spawn(registration::handle_worker(
                        socket,
                        peer,
                        self.registry.clone(),
                        self.seeds.clone(),
                        self.cfg.registration_timeout,
                    ));
                }
                Err(e) => warn!(error = %e, "failed to accept worker connection"),
            }
        }
    }

    async fn serve_clients(self: Arc<Self>, listener: TcpListener) {
        let mut incoming = TcpListenerStream::new(listener);
        while let Some(conn) = incoming.next().await {
            match conn {
                Ok(socket) => {
                    let coordinator = self.clone();
                    tokio::spawn(coordinator.handle_client(socket));
                }
                Err(e) => warn!(error = %e, "failed to accept client connection"),
            }
        }
    }

    async fn handle_client(self: Arc<Self>, socket: TcpStream) {
        let mut framed = Framed::new(socket, task_codec());
        while let Some(line) = framed.next().await {
            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    debug!(error = %e, "client connection error");
                    return;
                }
            };
            let response = match serde_json::from_str::<Request>(&line) {
                Ok(request) => {
                    let id = request.id;
                    self.route(request).await.with_id(id)
                }
                Err(e) => Response::new(
                    Status::CommunicationError,
                    format!("unparseable request: {e}"),
                ),
            };
            if framed.send(encode(&response)).await.is_err() {
                return;
            }
        }
    }

    async fn route(&self, request: Request) -> Response {
        match request.operation {
            OperationType::QueryBalance => self.query_balance(request.parameters).await,
            OperationType::TransferFunds => self.transfer(request.parameters).await,
            OperationType::AuditAccounts => self.audit().await,
            other => Response::new(
                Status::GeneralServerError,
                format!("operation {other:?} not accepted from clients"),
            ),
        }
    }

    async fn query_balance(&self, params: Params) -> Response {
        let Some(account) = params.account else {
            return Response::new(Status::GeneralServerError, "ID_CUENTA is required");
        };
        let partition = PartitionId::for_account(account, self.cfg.account_partitions);
        let Some(worker) = self.registry.owner_of(partition) else {
            return Response::new(
                Status::GeneralServerError,
                format!("no active owner for partition {partition}"),
            );
        };

        let request = Request::new(
            OperationType::QueryBalance,
            Params {
                account: Some(account),
                partition: Some(partition),
                ..Params::default()
            },
        );
        match self.pool.call(worker.addr, request).await {
            Ok(response) => Response {
                id: None,
                estado: response.estado,
                mensaje: response.mensaje,
                datos: response.datos,
            },
            Err(e) => {
                warn!(worker = %worker.worker_id, error = %e, "balance query failed");
                self.registry.mark_unavailable(&worker.worker_id);
                Response::new(
                    Status::GeneralServerError,
                    format!("worker {} unreachable: {e}", worker.worker_id),
                )
            }
        }
    }

    async fn transfer(&self, params: Params) -> Response {
        let (Some(origin), Some(destination), Some(amount)) =
            (params.origin, params.destination, params.amount)
        else {
            return Response::new(
                Status::GeneralServerError,
                "ID_CUENTA_ORIGEN, ID_CUENTA_DESTINO and MONTO are required",
            );
        };
        let spec = TransferSpec {
            id: self.next_transfer_id.fetch_add(1, Ordering::Relaxed) + 1,
            origin,
            destination,
            amount,
        };
        self.orchestrator.execute(spec).await
    }

    /// Fans `PARTITION_BALANCE` out over every account partition owner and
    /// sums the results. Partitions that cannot be summed are reported but
    /// do not stop the audit.
    async fn audit(&self) -> Response {
        let mut total = Amount::ZERO;
        let mut summed = 0usize;
        let mut failures = Vec::new();

        for index in 1..=self.cfg.account_partitions {
            let partition = PartitionId::account(index);
            let Some(worker) = self.registry.owner_of(partition) else {
                failures.push(format!("{partition}: no active owner"));
                continue;
            };
            let request = Request::new(
                OperationType::PartitionBalance,
                Params {
                    partition: Some(partition),
                    ..Params::default()
                },
            );
            match self.pool.call(worker.addr, request).await {
                Ok(response) if response.estado == Status::Success => {
                    match response.datos.as_ref().and_then(|d| d.as_f64()) {
                        Some(sum) => {
                            total += Amount::from_f64(sum);
                            summed += 1;
                        }
                        None => failures.push(format!("{partition}: malformed total")),
                    }
                }
                Ok(response) => {
                    failures.push(format!("{partition}: {}", response.mensaje));
                }
                Err(e) => {
                    self.registry.mark_unavailable(&worker.worker_id);
                    failures.push(format!("{partition}: {e}"));
                }
            }
        }

        if failures.is_empty() {
            Response::new(
                Status::Success,
                format!("audit complete: {summed} partitions summed"),
            )
            .with_datos(json!(total.to_f64()))
        } else {
            Response::new(
                Status::GeneralServerError,
                format!(
                    "audit incomplete: {summed} partitions summed, failures: {}",
                    failures.join("; ")
                ),
            )
            .with_datos(json!(total.to_f64()))
        }
    }
}
