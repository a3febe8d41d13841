//! Worker task service: admission control and request dispatch.
//!
//! Connections carry a pipelined line protocol; each request is answered
//! with exactly one response. The active-connection count is state owned by
//! the service and is only touched through permit acquire/drop.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::{TcpListener, TcpStream};
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::codec::Framed;
use tracing::{debug, warn};

use crate::amount::Amount;
use crate::model::{AccountId, PartitionId, TransferId};
use crate::protocol::{OperationType, Request, Response, Status, encode, task_codec};
use crate::store::{PartitionStore, StoreError};

/// One task request parsed into a closed variant; every operation has an
/// explicit handler in [`TaskService::execute`].
#[derive(Debug, Clone, PartialEq)]
enum TaskOp {
    QueryBalance {
        partition: PartitionId,
        account: AccountId,
    },
    LocalTransfer {
        partition: PartitionId,
        origin: AccountId,
        destination: AccountId,
        amount: Amount,
        tx: Option<TransferId>,
    },
    PrepareDebit {
        partition: PartitionId,
        origin: AccountId,
        amount: Amount,
        tx: Option<TransferId>,
    },
    ApplyCredit {
        partition: PartitionId,
        destination: AccountId,
        amount: Amount,
        tx: Option<TransferId>,
    },
    ConfirmDebit {
        partition: PartitionId,
        origin: AccountId,
        amount: Amount,
        tx: Option<TransferId>,
    },
    RevertDebit {
        partition: PartitionId,
        origin: AccountId,
        amount: Amount,
        tx: Option<TransferId>,
    },
    UpdateReplica {
        partition: PartitionId,
        account: AccountId,
        new_balance: Amount,
        tx: Option<TransferId>,
    },
    PartitionBalance {
        partition: PartitionId,
    },
}

impl TaskOp {
    fn from_request(request: &Request) -> Result<TaskOp, String> {
        if request.operation == OperationType::AuditAccounts {
            return Err("AUDIT_ACCOUNTS is a coordinator operation".to_string());
        }
        let params = &request.parameters;
        let missing = |what: &str| format!("incomplete parameters for {:?}: {what}", request.operation);
        let partition = params
            .partition
            .ok_or_else(|| missing("ID_PARTICION"))?;
        let tx = params.transfer_id;

        match request.operation {
            OperationType::QueryBalance => Ok(TaskOp::QueryBalance {
                partition,
                account: params.account.ok_or_else(|| missing("ID_CUENTA"))?,
            }),
            OperationType::TransferFunds => Ok(TaskOp::LocalTransfer {
                partition,
                origin: params.origin.ok_or_else(|| missing("ID_CUENTA_ORIGEN"))?,
                destination: params
                    .destination
                    .ok_or_else(|| missing("ID_CUENTA_DESTINO"))?,
                amount: params.amount.ok_or_else(|| missing("MONTO"))?,
                tx,
            }),
            OperationType::PrepareDebit => Ok(TaskOp::PrepareDebit {
                partition,
                origin: params.origin.ok_or_else(|| missing("ID_CUENTA_ORIGEN"))?,
                amount: params.amount.ok_or_else(|| missing("MONTO"))?,
                tx,
            }),
            OperationType::ApplyCredit => Ok(TaskOp::ApplyCredit {
                partition,
                destination: params
                    .destination
                    .ok_or_else(|| missing("ID_CUENTA_DESTINO"))?,
                amount: params.amount.ok_or_else(|| missing("MONTO"))?,
                tx,
            }),
            OperationType::ConfirmDebit => Ok(TaskOp::ConfirmDebit {
                partition,
                origin: params.origin.ok_or_else(|| missing("ID_CUENTA_ORIGEN"))?,
                amount: params.amount.ok_or_else(|| missing("MONTO"))?,
                tx,
            }),
            OperationType::RevertDebit => Ok(TaskOp::RevertDebit {
                partition,
                origin: params.origin.ok_or_else(|| missing("ID_CUENTA_ORIGEN"))?,
                amount: params.amount.ok_or_else(|| missing("MONTO"))?,
                tx,
            }),
            OperationType::UpdateReplicaBalance => Ok(TaskOp::UpdateReplica {
                partition,
                account: params.account.ok_or_else(|| missing("ID_CUENTA"))?,
                new_balance: params.new_balance.ok_or_else(|| missing("NUEVO_SALDO"))?,
                tx,
            }),
            OperationType::PartitionBalance => Ok(TaskOp::PartitionBalance { partition }),
            OperationType::AuditAccounts => unreachable!("rejected above"),
        }
    }
}

/// Permit for one task connection. Dropping it releases the slot.
struct ConnectionPermit {
    active: Arc<AtomicUsize>,
}

impl ConnectionPermit {
    fn acquire(active: &Arc<AtomicUsize>, max: usize) -> Option<Self> {
        active
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < max).then_some(n + 1)
            })
            .ok()
            .map(|_| ConnectionPermit {
                active: active.clone(),
            })
    }
}

impl Drop for ConnectionPermit {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct TaskService {
    worker_id: String,
    store: Arc<PartitionStore>,
    active: Arc<AtomicUsize>,
    max_connections: usize,
}

impl TaskService {
    pub fn new(worker_id: String, store: Arc<PartitionStore>, max_connections: usize) -> Self {
        TaskService {
            worker_id,
            store,
            active: Arc::new(AtomicUsize::new(0)),
            max_connections,
        }
    }

    /// Accept loop. Admitted connections are served on their own task;
    /// connections beyond the limit get one busy response and are closed
    /// without touching the others.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) {
        let mut incoming = TcpListenerStream::new(listener);
        while let Some(conn) = incoming.next().await {
            let socket = match conn {
                Ok(socket) => socket,
                Err(e) => {
                    warn!(worker = %self.worker_id, error = %e, "failed to accept task connection");
                    continue;
                }
            };
            match ConnectionPermit::acquire(&self.active, self.max_connections) {
                Some(permit) => {
                    let service = self.clone();
                    tokio::spawn(async move {
                        service.handle_connection(socket, permit).await;
                    });
                }
                None => {
                    debug!(worker = %self.worker_id, "task connection limit reached, rejecting");
                    tokio::spawn(reject_busy(socket));
                }
            }
        }
    }

    async fn handle_connection(&self, socket: TcpStream, _permit: ConnectionPermit) {
        let mut framed = Framed::new(socket, task_codec());
        while let Some(line) = framed.next().await {
            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    debug!(worker = %self.worker_id, error = %e, "task connection error");
                    return;
                }
            };
            let response = match serde_json::from_str::<Request>(&line) {
                Ok(request) => self.dispatch(request).await,
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

    async fn dispatch(&self, request: Request) -> Response {
        let id = request.id;
        let response = match TaskOp::from_request(&request) {
            Ok(op) => self.execute(op).await,
            Err(message) => Response::new(Status::GeneralServerError, message),
        };
        response.with_id(id)
    }

    async fn execute(&self, op: TaskOp) -> Response {
        match op {
            TaskOp::QueryBalance { partition, account } => {
                match self.store.read_balance(partition, account).await {
                    Ok(balance) => Response::new(Status::Success, format!("Saldo: {balance}"))
                        .with_datos(json!(balance.to_f64())),
                    Err(e) => self.error_response(e, None, None),
                }
            }
            TaskOp::LocalTransfer {
                partition,
                origin,
                destination,
                amount,
                tx,
            } => {
                match self
                    .store
                    .apply_transfer(partition, origin, destination, amount, tx)
                    .await
                {
                    Ok((origin_after, destination_after)) => Response::new(
                        Status::Success,
                        format!("transfer applied in {partition} by {}", self.worker_id),
                    )
                    .with_datos(json!({
                        "nuevoSaldoOrigen": origin_after.to_f64(),
                        "nuevoSaldoDestino": destination_after.to_f64(),
                        "workerIdProcesador": self.worker_id,
                    })),
                    Err(e) => self.error_response(e, Some(origin), Some(destination)),
                }
            }
            TaskOp::PrepareDebit {
                partition,
                origin,
                amount,
                tx,
            } => match self.store.apply_debit(partition, origin, amount, tx).await {
                Ok(balance) => Response::new(
                    Status::DebitPreparedOk,
                    format!("debit prepared by {}", self.worker_id),
                )
                .with_datos(json!({
                    "nuevoSaldoOrigen": balance.to_f64(),
                    "workerIdProcesador": self.worker_id,
                })),
                Err(e) => self.error_response(e, Some(origin), None),
            },
            TaskOp::ApplyCredit {
                partition,
                destination,
                amount,
                tx,
            } => {
                match self
                    .store
                    .apply_credit(partition, destination, amount, tx)
                    .await
                {
                    Ok(balance) => Response::new(
                        Status::CreditAppliedOk,
                        format!("credit applied by {}", self.worker_id),
                    )
                    .with_datos(json!({
                        "nuevoSaldoDestino": balance.to_f64(),
                        "workerIdProcesador": self.worker_id,
                    })),
                    Err(e) => self.error_response(e, None, Some(destination)),
                }
            }
            TaskOp::ConfirmDebit {
                partition,
                origin,
                amount,
                tx,
            } => match self.store.confirm_debit(partition, origin, amount, tx).await {
                Ok(balance) => Response::new(
                    Status::DebitConfirmedOk,
                    format!("debit confirmed by {}", self.worker_id),
                )
                .with_datos(json!({
                    "nuevoSaldoOrigen": balance.to_f64(),
                    "workerIdProcesador": self.worker_id,
                })),
                Err(e) => self.error_response(e, Some(origin), None),
            },
            TaskOp::RevertDebit {
                partition,
                origin,
                amount,
                tx,
            } => match self.store.revert_debit(partition, origin, amount, tx).await {
                Ok(balance) => Response::new(
                    Status::DebitRevertedOk,
                    format!("debit reverted by {}", self.worker_id),
                )
                .with_datos(json!({
                    "nuevoSaldoOrigen": balance.to_f64(),
                    "workerIdProcesador": self.worker_id,
                })),
                Err(e) => self.error_response(e, Some(origin), None),
            },
            TaskOp::UpdateReplica {
                partition,
                account,
                new_balance,
                tx,
            } => {
                match self
                    .store
                    .set_balance(partition, account, new_balance, tx)
                    .await
                {
                    Ok(_) => Response::new(
                        Status::ReplicaUpdatedOk,
                        format!("replica updated by {}", self.worker_id),
                    ),
                    Err(e) => self.error_response(e, None, None),
                }
            }
            TaskOp::PartitionBalance { partition } => {
                match self.store.partition_total(partition).await {
                    Ok(total) => Response::new(
                        Status::Success,
                        format!("partition {partition} total: {total}"),
                    )
                    .with_datos(json!(total.to_f64())),
                    Err(e) => self.error_response(e, None, None),
                }
            }
        }
    }

    /// Translates store failures into the response taxonomy. Which
    /// not-found status applies depends on the role the account played.
    fn error_response(
        &self,
        error: StoreError,
        origin: Option<AccountId>,
        destination: Option<AccountId>,
    ) -> Response {
        match &error {
            StoreError::InsufficientFunds { available, .. } => {
                Response::new(Status::InsufficientFunds, error.to_string())
                    .with_datos(json!(available.to_f64()))
            }
            StoreError::AccountNotFound { account, .. } => {
                let status = if Some(*account) == origin {
                    Status::OriginNotFound
                } else if Some(*account) == destination {
                    Status::DestinationNotFound
                } else {
                    Status::AccountNotFound
                };
                Response::new(status, error.to_string())
            }
            StoreError::PartitionNotAssigned(partition) => Response::new(
                Status::GeneralServerError,
                format!("partition {partition} not owned here"),
            ),
            _ => {
                warn!(worker = %self.worker_id, error = %error, "task failed");
                Response::new(Status::GeneralServerError, error.to_string())
            }
        }
    }
}

async fn reject_busy(socket: TcpStream) {
    let mut framed = Framed::new(socket, task_codec());
    let response = Response::new(
        Status::GeneralServerError,
        "busy: task connection limit reached",
    );
    let _ = framed.send(encode(&response)).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Account, AccountKind, PartitionRecords};
    use crate::protocol::Params;

    fn service_with(accounts: Vec<Account>) -> (tempfile::TempDir, TaskService) {
        let dir = tempfile::tempdir().unwrap();
        let store = PartitionStore::open(dir.path().join("store")).unwrap();
        store
            .assign(
                PartitionId::account(1),
                &PartitionRecords::Accounts(accounts),
            )
            .unwrap();
        let service = TaskService::new("worker1".into(), Arc::new(store), 4);
        (dir, service)
    }

    fn account(id: AccountId, cents: i64) -> Account {
        Account {
            account_id: id,
            client_id: id,
            balance: Amount::from_scaled(cents),
            kind: AccountKind::Savings,
        }
    }

    fn request(operation: OperationType, parameters: Params) -> Request {
        Request {
            id: Some(5),
            operation,
            parameters,
        }
    }

    #[test]
    fn missing_parameters_are_reported_per_operation() {
        let req = Request::new(
            OperationType::PrepareDebit,
            Params {
                partition: Some(PartitionId::account(1)),
                amount: Some(Amount::from_scaled(100)),
                ..Params::default()
            },
        );
        let err = TaskOp::from_request(&req).unwrap_err();
        assert!(err.contains("ID_CUENTA_ORIGEN"), "{err}");

        let req = Request::new(OperationType::QueryBalance, Params::default());
        let err = TaskOp::from_request(&req).unwrap_err();
        assert!(err.contains("ID_PARTICION"), "{err}");
    }

    #[test]
    fn audit_is_not_a_worker_operation() {
        let req = Request::new(
            OperationType::AuditAccounts,
            Params {
                partition: Some(PartitionId::account(1)),
                ..Params::default()
            },
        );
        assert!(TaskOp::from_request(&req).is_err());
    }

    #[test]
    fn permits_bound_concurrency_and_release_on_drop() {
        let active = Arc::new(AtomicUsize::new(0));
        let first = ConnectionPermit::acquire(&active, 2).unwrap();
        let _second = ConnectionPermit::acquire(&active, 2).unwrap();
        assert!(ConnectionPermit::acquire(&active, 2).is_none());
        drop(first);
        assert!(ConnectionPermit::acquire(&active, 2).is_some());
    }

    #[tokio::test]
    async fn dispatch_echoes_request_id() {
        let (_dir, service) = service_with(vec![account(101, 50_000)]);
        let response = service
            .dispatch(request(
                OperationType::QueryBalance,
                Params {
                    partition: Some(PartitionId::account(1)),
                    account: Some(101),
                    ..Params::default()
                },
            ))
            .await;
        assert_eq!(response.id, Some(5));
        assert_eq!(response.estado, Status::Success);
        assert_eq!(response.datos, Some(json!(500.0)));
    }

    #[tokio::test]
    async fn prepare_debit_reports_origin_not_found() {
        let (_dir, service) = service_with(vec![account(101, 50_000)]);
        let response = service
            .dispatch(request(
                OperationType::PrepareDebit,
                Params {
                    partition: Some(PartitionId::account(1)),
                    origin: Some(999),
                    amount: Some(Amount::from_scaled(100)),
                    ..Params::default()
                },
            ))
            .await;
        assert_eq!(response.estado, Status::OriginNotFound);
    }

    #[tokio::test]
    async fn apply_credit_reports_destination_not_found() {
        let (_dir, service) = service_with(vec![account(101, 50_000)]);
        let response = service
            .dispatch(request(
                OperationType::ApplyCredit,
                Params {
                    partition: Some(PartitionId::account(1)),
                    destination: Some(999),
                    amount: Some(Amount::from_scaled(100)),
                    ..Params::default()
                },
            ))
            .await;
        assert_eq!(response.estado, Status::DestinationNotFound);
    }

    #[tokio::test]
    async fn unowned_partition_is_a_topology_error() {
        let (_dir, service) = service_with(vec![]);
        let response = service
            .dispatch(request(
                OperationType::QueryBalance,
                Params {
                    partition: Some(PartitionId::account(7)),
                    account: Some(1),
                    ..Params::default()
                },
            ))
            .await;
        assert_eq!(response.estado, Status::GeneralServerError);
        assert!(response.mensaje.contains("not owned here"));
    }

    #[tokio::test]
    async fn insufficient_funds_carries_available_balance() {
        let (_dir, service) = service_with(vec![account(101, 3_000)]);
        let response = service
            .dispatch(request(
                OperationType::PrepareDebit,
                Params {
                    partition: Some(PartitionId::account(1)),
                    origin: Some(101),
                    amount: Some(Amount::from_scaled(10_000)),
                    ..Params::default()
                },
            ))
            .await;
        assert_eq!(response.estado, Status::InsufficientFunds);
        assert_eq!(response.datos, Some(json!(30.0)));
    }
}
