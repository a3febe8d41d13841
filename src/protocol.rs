//! Wire protocol: newline-delimited, self-describing JSON messages.
//!
//! Every connection in the system (client to coordinator, coordinator to
//! worker, worker registration) carries one JSON object per UTF-8 line.
//! Requests and responses may carry an `id` used to correlate pipelined
//! exchanges; a responder echoes the id of the request it answers.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::codec::LinesCodec;

use crate::amount::Amount;
use crate::model::{AccountId, PartitionId, PartitionRecords, TransferId};

/// Upper bound for one task or client protocol line.
pub const MAX_LINE_LEN: usize = 64 * 1024;

/// Upper bound for one registration line; assignment messages carry whole
/// partition snapshots.
pub const MAX_REGISTRATION_LINE_LEN: usize = 16 * 1024 * 1024;

pub fn task_codec() -> LinesCodec {
    LinesCodec::new_with_max_length(MAX_LINE_LEN)
}

pub fn registration_codec() -> LinesCodec {
    LinesCodec::new_with_max_length(MAX_REGISTRATION_LINE_LEN)
}

/// Operation tag of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationType {
    QueryBalance,
    TransferFunds,
    PrepareDebit,
    ApplyCredit,
    ConfirmDebit,
    RevertDebit,
    UpdateReplicaBalance,
    AuditAccounts,
    PartitionBalance,
}

/// Status tag of a response: business results, topology errors and the
/// phase acknowledgements of the transfer protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Success,
    InsufficientFunds,
    AccountNotFound,
    OriginNotFound,
    DestinationNotFound,
    CommunicationError,
    GeneralServerError,
    DebitPreparedOk,
    CreditAppliedOk,
    DebitConfirmedOk,
    DebitRevertedOk,
    ReplicaUpdatedOk,
}

/// Open parameter map of a request. Absent keys are omitted on the wire.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Params {
    #[serde(rename = "ID_CUENTA", default, skip_serializing_if = "Option::is_none")]
    pub account: Option<AccountId>,
    #[serde(
        rename = "ID_CUENTA_ORIGEN",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub origin: Option<AccountId>,
    #[serde(
        rename = "ID_CUENTA_DESTINO",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub destination: Option<AccountId>,
    #[serde(rename = "MONTO", default, skip_serializing_if = "Option::is_none")]
    pub amount: Option<Amount>,
    #[serde(
        rename = "NUEVO_SALDO",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub new_balance: Option<Amount>,
    #[serde(
        rename = "ID_PARTICION",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub partition: Option<PartitionId>,
    #[serde(
        rename = "ID_TRANSACCION_GLOBAL",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub transfer_id: Option<TransferId>,
}

/// One request line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    #[serde(rename = "operationType")]
    pub operation: OperationType,
    #[serde(default)]
    pub parameters: Params,
}

impl Request {
    pub fn new(operation: OperationType, parameters: Params) -> Self {
        Request {
            id: None,
            operation,
            parameters,
        }
    }
}

/// One response line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    pub estado: Status,
    pub mensaje: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datos: Option<Value>,
}

impl Response {
    pub fn new(estado: Status, mensaje: impl Into<String>) -> Self {
        Response {
            id: None,
            estado,
            mensaje: mensaje.into(),
            datos: None,
        }
    }

    pub fn with_datos(mut self, datos: Value) -> Self {
        self.datos = Some(datos);
        self
    }

    pub fn with_id(mut self, id: Option<u64>) -> Self {
        self.id = id;
        self
    }

    /// Reads a named balance out of the response payload.
    pub fn balance_field(&self, key: &str) -> Option<Amount> {
        self.datos
            .as_ref()?
            .get(key)?
            .as_f64()
            .map(Amount::from_f64)
    }
}

/// Messages of the worker registration handshake, tagged by `tipo`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "tipo")]
pub enum RegistrationMessage {
    #[serde(rename = "REGISTRO")]
    Register {
        #[serde(rename = "workerId")]
        worker_id: String,
        #[serde(rename = "puertoTareasWorker")]
        task_port: u16,
    },
    #[serde(rename = "ASIGNACION_PARTICIONES_Y_DATOS")]
    Assignment {
        #[serde(rename = "listaParticiones")]
        partitions: Vec<PartitionId>,
        #[serde(rename = "datosPorParticion")]
        data: BTreeMap<PartitionId, PartitionRecords>,
    },
    #[serde(rename = "DATOS_RECIBIDOS_POR_WORKER")]
    DataReceived {
        #[serde(rename = "workerId")]
        worker_id: String,
    },
    #[serde(rename = "CONFIRMACION_REGISTRO_COMPLETO")]
    RegistrationComplete,
    #[serde(rename = "ERROR")]
    Error {
        #[serde(rename = "mensajeTexto")]
        message: String,
    },
}

/// Serializes any protocol message to its wire line (without terminator;
/// the line codec appends it).
pub fn encode<T: Serialize>(message: &T) -> String {
    serde_json::to_string(message).expect("protocol messages always serialize")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_wire_shape() {
        let request = Request {
            id: Some(7),
            operation: OperationType::PrepareDebit,
            parameters: Params {
                origin: Some(101),
                amount: Some(Amount::from_scaled(10_000)),
                partition: Some(PartitionId::account(1)),
                transfer_id: Some(42),
                ..Params::default()
            },
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(
            value,
            json!({
                "id": 7,
                "operationType": "PREPARE_DEBIT",
                "parameters": {
                    "ID_CUENTA_ORIGEN": 101,
                    "MONTO": 100.0,
                    "ID_PARTICION": "ACCOUNT_P1",
                    "ID_TRANSACCION_GLOBAL": 42,
                },
            })
        );
        let back: Request = serde_json::from_value(value).unwrap();
        assert_eq!(back, request);
    }

    #[test]
    fn request_without_id_or_parameters() {
        let back: Request =
            serde_json::from_str(r#"{"operationType":"AUDIT_ACCOUNTS"}"#).unwrap();
        assert_eq!(back.id, None);
        assert_eq!(back.operation, OperationType::AuditAccounts);
        assert_eq!(back.parameters, Params::default());
    }

    #[test]
    fn response_wire_shape() {
        let response = Response::new(Status::Success, "Saldo: 500.00")
            .with_datos(json!(500.0))
            .with_id(Some(3));
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(
            value,
            json!({"id": 3, "estado": "SUCCESS", "mensaje": "Saldo: 500.00", "datos": 500.0})
        );
    }

    #[test]
    fn balance_field_reads_payload() {
        let response = Response::new(Status::DebitPreparedOk, "ok")
            .with_datos(json!({"nuevoSaldoOrigen": 400.0}));
        assert_eq!(
            response.balance_field("nuevoSaldoOrigen"),
            Some(Amount::from_scaled(40_000))
        );
        assert_eq!(response.balance_field("nuevoSaldoDestino"), None);
    }

    #[test]
    fn unknown_operation_is_rejected() {
        let result = serde_json::from_str::<Request>(r#"{"operationType":"DROP_TABLES"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn registration_messages_tagged_by_tipo() {
        let register = RegistrationMessage::Register {
            worker_id: "worker1".into(),
            task_port: 12350,
        };
        let value = serde_json::to_value(&register).unwrap();
        assert_eq!(
            value,
            json!({"tipo": "REGISTRO", "workerId": "worker1", "puertoTareasWorker": 12350})
        );

        let complete: RegistrationMessage =
            serde_json::from_str(r#"{"tipo":"CONFIRMACION_REGISTRO_COMPLETO"}"#).unwrap();
        assert_eq!(complete, RegistrationMessage::RegistrationComplete);

        let error: RegistrationMessage =
            serde_json::from_str(r#"{"tipo":"ERROR","mensajeTexto":"disk full"}"#).unwrap();
        assert_eq!(
            error,
            RegistrationMessage::Error {
                message: "disk full".into()
            }
        );
    }

    #[test]
    fn assignment_round_trips_with_snapshot_data() {
        use crate::model::{Account, AccountKind};

        let mut data = BTreeMap::new();
        data.insert(
            PartitionId::account(1),
            PartitionRecords::Accounts(vec![Account {
                account_id: 101,
                client_id: 1,
                balance: Amount::from_scaled(50_000),
                kind: AccountKind::Savings,
            }]),
        );
        let message = RegistrationMessage::Assignment {
            partitions: vec![PartitionId::account(1)],
            data,
        };
        let line = encode(&message);
        let back: RegistrationMessage = serde_json::from_str(&line).unwrap();
        assert_eq!(back, message);
    }
}
