//! Transfer orchestrator.
//!
//! Drives the compensating-action protocol for one transfer: prepare the
//! debit on the origin worker, apply the credit on the destination worker,
//! confirm the debit, and revert it when the credit cannot be applied.
//! Transfers inside one partition collapse to a single call executed under
//! that partition's serialization. Every terminal outcome is appended to
//! the coordinator's transfer journal; a confirm failure after the credit
//! was applied is surfaced as an explicit reconciliation case, never as
//! success or silent failure.

use std::sync::Arc;

use serde_json::json;
use tracing::{error, info, warn};

use super::pool::{CallError, WorkerPool};
use super::registry::{Registry, WorkerDescriptor};
use crate::amount::Amount;
use crate::journal::Journal;
use crate::model::{AccountId, PartitionId, TransferId};
use crate::protocol::{OperationType, Params, Request, Response, Status};

/// One transfer to orchestrate.
#[derive(Debug, Clone, Copy)]
pub struct TransferSpec {
    pub id: TransferId,
    pub origin: AccountId,
    pub destination: AccountId,
    pub amount: Amount,
}

/// Protocol state of a transfer. `Confirmed` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TransferState {
    Initiated,
    DebitPrepared,
    CreditApplied,
    Confirmed,
    DebitReverted,
    Failed,
}

impl TransferState {
    fn tag(self) -> &'static str {
        match self {
            TransferState::Initiated => "INITIATED",
            TransferState::DebitPrepared => "DEBIT_PREPARED",
            TransferState::CreditApplied => "CREDIT_APPLIED",
            TransferState::Confirmed => "CONFIRMED",
            TransferState::DebitReverted => "DEBIT_REVERTED",
            TransferState::Failed => "FAILED",
        }
    }
}

pub(super) struct TransferOrchestrator {
    registry: Arc<Registry>,
    pool: Arc<WorkerPool>,
    journal: Arc<Journal>,
    account_partitions: u16,
}

impl TransferOrchestrator {
    pub(super) fn new(
        registry: Arc<Registry>,
        pool: Arc<WorkerPool>,
        journal: Arc<Journal>,
        account_partitions: u16,
    ) -> Self {
        TransferOrchestrator {
            registry,
            pool,
            journal,
            account_partitions,
        }
    }

    pub(super) async fn execute(&self, spec: TransferSpec) -> Response {
        if !spec.amount.is_positive() {
            return self.fail(
                &spec,
                Status::GeneralServerError,
                "transfer amount must be positive",
            );
        }
        if spec.origin == spec.destination {
            return self.fail(
                &spec,
                Status::GeneralServerError,
                "origin and destination accounts must differ",
            );
        }

        self.journal(&spec, TransferState::Initiated, "transfer accepted");
        let origin_partition = PartitionId::for_account(spec.origin, self.account_partitions);
        let destination_partition =
            PartitionId::for_account(spec.destination, self.account_partitions);

        let Some(origin_worker) = self.registry.owner_of(origin_partition) else {
            return self.fail(
                &spec,
                Status::GeneralServerError,
                format!("no active owner for partition {origin_partition}"),
            );
        };

        if origin_partition == destination_partition {
            return self
                .execute_local(&spec, origin_partition, &origin_worker)
                .await;
        }

        let Some(destination_worker) = self.registry.owner_of(destination_partition) else {
            return self.fail(
                &spec,
                Status::GeneralServerError,
                format!("no active owner for partition {destination_partition}"),
            );
        };

        self.execute_cross_partition(
            &spec,
            origin_partition,
            &origin_worker,
            destination_partition,
            &destination_worker,
        )
        .await
    }

    /// Same-partition fast path: one call, the owning worker applies the
    /// debit and credit under its partition serialization.
    async fn execute_local(
        &self,
        spec: &TransferSpec,
        partition: PartitionId,
        worker: &WorkerDescriptor,
    ) -> Response {
        info!(tx = spec.id, %partition, "same-partition transfer");
        let request = Request::new(
            OperationType::TransferFunds,
            Params {
                origin: Some(spec.origin),
                destination: Some(spec.destination),
                amount: Some(spec.amount),
                partition: Some(partition),
                transfer_id: Some(spec.id),
                ..Params::default()
            },
        );
        match self.call(worker, request).await {
            Ok(response) if response.estado == Status::Success => {
                self.journal(spec, TransferState::Confirmed, "same-partition transfer");
                self.replicate(partition, spec.origin, response.balance_field("nuevoSaldoOrigen"), spec.id);
                self.replicate(
                    partition,
                    spec.destination,
                    response.balance_field("nuevoSaldoDestino"),
                    spec.id,
                );
                Response::new(Status::Success, format!("transfer {} completed", spec.id))
                    .with_datos(response.datos.unwrap_or(json!(null)))
            }
            Ok(response) => self.fail(spec, response.estado, response.mensaje),
            Err(e) => self.fail(
                spec,
                Status::GeneralServerError,
                format!("worker {} unreachable: {e}", worker.worker_id),
            ),
        }
    }

    async fn execute_cross_partition(
        &self,
        spec: &TransferSpec,
        origin_partition: PartitionId,
        origin_worker: &WorkerDescriptor,
        destination_partition: PartitionId,
        destination_worker: &WorkerDescriptor,
    ) -> Response {
        info!(
            tx = spec.id,
            origin = %origin_partition,
            destination = %destination_partition,
            "cross-partition transfer"
        );

        // INITIATED -> DEBIT_PREPARED
        let prepare = self.phase_request(OperationType::PrepareDebit, spec, origin_partition);
        let prepared = match self.call(origin_worker, prepare).await {
            Ok(response) if response.estado == Status::DebitPreparedOk => response,
            Ok(response) => {
                // Insufficient funds or missing origin: no side effect yet.
                return self.fail(spec, response.estado, response.mensaje);
            }
            Err(e) => {
                return self.fail(
                    spec,
                    Status::GeneralServerError,
                    format!("origin worker {} unreachable: {e}", origin_worker.worker_id),
                );
            }
        };

        // DEBIT_PREPARED -> CREDIT_APPLIED, or revert.
        let credit = self.phase_request(OperationType::ApplyCredit, spec, destination_partition);
        let credited = match self.call(destination_worker, credit).await {
            Ok(response) if response.estado == Status::CreditAppliedOk => response,
            Ok(response) => {
                let failure = Response::new(response.estado, response.mensaje);
                return self
                    .revert_and_fail(spec, origin_partition, origin_worker, failure)
                    .await;
            }
            Err(e) => {
                let failure = Response::new(
                    Status::GeneralServerError,
                    format!(
                        "destination worker {} unreachable: {e}",
                        destination_worker.worker_id
                    ),
                );
                return self
                    .revert_and_fail(spec, origin_partition, origin_worker, failure)
                    .await;
            }
        };

        // CREDIT_APPLIED -> CONFIRMED, or the ambiguous reconciliation case.
        let confirm = self.phase_request(OperationType::ConfirmDebit, spec, origin_partition);
        match self.call(origin_worker, confirm).await {
            Ok(response) if response.estado == Status::DebitConfirmedOk => {
                self.journal(spec, TransferState::Confirmed, "cross-partition transfer");
                let origin_after = response
                    .balance_field("nuevoSaldoOrigen")
                    .or_else(|| prepared.balance_field("nuevoSaldoOrigen"));
                let destination_after = credited.balance_field("nuevoSaldoDestino");
                self.replicate(origin_partition, spec.origin, origin_after, spec.id);
                self.replicate(
                    destination_partition,
                    spec.destination,
                    destination_after,
                    spec.id,
                );
                let mut datos = serde_json::Map::new();
                if let Some(balance) = origin_after {
                    datos.insert("nuevoSaldoOrigen".into(), json!(balance.to_f64()));
                }
                if let Some(balance) = destination_after {
                    datos.insert("nuevoSaldoDestino".into(), json!(balance.to_f64()));
                }
                Response::new(Status::Success, format!("transfer {} completed", spec.id))
                    .with_datos(json!(datos))
            }
            other => {
                // Credit applied but debit unconfirmed: neither success nor
                // failure. Surface it distinctly and leave it to manual
                // reconciliation.
                let detail = match other {
                    Ok(response) => format!("{:?}: {}", response.estado, response.mensaje),
                    Err(e) => e.to_string(),
                };
                error!(tx = spec.id, %detail, "confirm failed after credit applied");
                self.journal(
                    spec,
                    TransferState::CreditApplied,
                    &format!("AMBIGUOUS: confirm failed ({detail}); manual reconciliation required"),
                );
                Response::new(
                    Status::GeneralServerError,
                    format!(
                        "transfer {} in ambiguous state: credit applied but debit not confirmed; \
                         manual reconciliation required",
                        spec.id
                    ),
                )
                .with_datos(json!({
                    "idTransaccion": spec.id,
                    "requiereReconciliacion": true,
                }))
            }
        }
    }

    /// Compensation path: re-credit the prepared debit, then report the
    /// credit failure to the client.
    async fn revert_and_fail(
        &self,
        spec: &TransferSpec,
        origin_partition: PartitionId,
        origin_worker: &WorkerDescriptor,
        credit_failure: Response,
    ) -> Response {
        let revert = self.phase_request(OperationType::RevertDebit, spec, origin_partition);
        match self.call(origin_worker, revert).await {
            Ok(response) if response.estado == Status::DebitRevertedOk => {
                self.journal(
                    spec,
                    TransferState::DebitReverted,
                    &format!("credit failed ({}); debit reverted", credit_failure.mensaje),
                );
                self.journal(spec, TransferState::Failed, "net effect zero");
                Response::new(
                    credit_failure.estado,
                    format!("{}; debit reverted", credit_failure.mensaje),
                )
            }
            other => {
                let detail = match other {
                    Ok(response) => format!("{:?}: {}", response.estado, response.mensaje),
                    Err(e) => e.to_string(),
                };
                error!(tx = spec.id, %detail, "revert failed after credit failure");
                self.journal(
                    spec,
                    TransferState::DebitPrepared,
                    &format!("CRITICAL: credit failed and revert failed ({detail}); manual reconciliation required"),
                );
                Response::new(
                    Status::GeneralServerError,
                    format!(
                        "transfer {}: credit failed and debit revert failed; \
                         manual reconciliation required",
                        spec.id
                    ),
                )
                .with_datos(json!({
                    "idTransaccion": spec.id,
                    "requiereReconciliacion": true,
                }))
            }
        }
    }

    fn phase_request(
        &self,
        operation: OperationType,
        spec: &TransferSpec,
        partition: PartitionId,
    ) -> Request {
        let mut params = Params {
            amount: Some(spec.amount),
            partition: Some(partition),
            transfer_id: Some(spec.id),
            ..Params::default()
        };
        match operation {
            OperationType::ApplyCredit => params.destination = Some(spec.destination),
            _ => params.origin = Some(spec.origin),
        }
        Request::new(operation, params)
    }

    async fn call(
        &self,
        worker: &WorkerDescriptor,
        request: Request,
    ) -> Result<Response, CallError> {
        let result = self.pool.call(worker.addr, request).await;
        if let Err(e) = &result {
            warn!(worker = %worker.worker_id, error = %e, "worker call failed");
            self.registry.mark_unavailable(&worker.worker_id);
        }
        result
    }

    fn fail(
        &self,
        spec: &TransferSpec,
        estado: Status,
        mensaje: impl Into<String>,
    ) -> Response {
        let mensaje = mensaje.into();
        self.journal(spec, TransferState::Failed, &mensaje);
        Response::new(estado, mensaje)
    }

    fn journal(&self, spec: &TransferSpec, state: TransferState, detail: &str) {
        let line = format!(
            "{}|{}|{}|{}|{}|{detail}",
            spec.id,
            spec.origin,
            spec.destination,
            spec.amount,
            state.tag()
        );
        if let Err(e) = self.journal.append(&line) {
            error!(tx = spec.id, error = %e, "failed to append transfer journal");
        }
    }

    /// Best-effort propagation of a confirmed balance to replica holders.
    /// Runs in the background and never gates the client-visible result.
    fn replicate(
        &self,
        partition: PartitionId,
        account: AccountId,
        balance: Option<Amount>,
        tx: TransferId,
    ) {
        let Some(balance) = balance else { return };
        let holders = self.registry.replica_holders(partition);
        if holders.is_empty() {
            return;
        }
        let pool = self.pool.clone();
        tokio::spawn(async move {
            for holder in holders {
                let request = Request::new(
                    OperationType::UpdateReplicaBalance,
                    Params {
                        account: Some(account),
                        new_balance: Some(balance),
                        partition: Some(partition),
                        transfer_id: Some(tx),
                        ..Params::default()
                    },
                );
                match pool.call(holder.addr, request).await {
                    Ok(response) if response.estado == Status::ReplicaUpdatedOk => {}
                    Ok(response) => warn!(
                        tx,
                        worker = %holder.worker_id,
                        estado = ?response.estado,
                        "replica update rejected"
                    ),
                    Err(e) => warn!(tx, worker = %holder.worker_id, error = %e, "replica update failed"),
                }
            }
        });
    }
}
