//! Worker side of the registration handshake.
//!
//! The worker connects to the coordinator, announces itself and its task
//! port, persists every assigned partition snapshot, acknowledges, and only
//! treats itself as registered once the coordinator confirms completion.
//! Any failure before that point aborts the attempt; the caller must not
//! serve traffic.

use std::io;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::codec::{Framed, LinesCodecError};
use tracing::info;

use crate::config::WorkerConfig;
use crate::model::PartitionId;
use crate::protocol::{RegistrationMessage, encode, registration_codec};
use crate::store::{PartitionStore, StoreError};

/// Error aborting a registration attempt.
#[derive(Debug, Error)]
pub enum RegistrationError {
    #[error("failed to connect to coordinator at {addr}: {source}")]
    Connect { addr: String, source: io::Error },

    #[error("coordinator rejected registration: {0}")]
    Rejected(String),

    #[error("unexpected registration message: {0}")]
    Protocol(String),

    #[error("connection closed before registration completed")]
    ClosedEarly,

    #[error("registration timed out")]
    TimedOut,

    #[error("failed to persist partition snapshot: {0}")]
    Persist(#[from] StoreError),

    #[error(transparent)]
    Line(#[from] LinesCodecError),
}

type RegistrationFramed = Framed<TcpStream, tokio_util::codec::LinesCodec>;

/// Runs the full handshake and persists the assigned snapshots into
/// `store`. Returns the assigned partitions on success.
pub async fn register(
    cfg: &WorkerConfig,
    task_port: u16,
    store: &PartitionStore,
) -> Result<Vec<PartitionId>, RegistrationError> {
    let addr = format!("{}:{}", cfg.coordinator_host, cfg.coordinator_port);
    let stream = TcpStream::connect(&addr)
        .await
        .map_err(|source| RegistrationError::Connect {
            addr: addr.clone(),
            source,
        })?;
    let mut framed = Framed::new(stream, registration_codec());

    framed
        .send(encode(&RegistrationMessage::Register {
            worker_id: cfg.worker_id.clone(),
            task_port,
        }))
        .await?;

    let (partitions, data) = match recv(&mut framed, cfg.registration_timeout).await? {
        RegistrationMessage::Assignment { partitions, data } => (partitions, data),
        RegistrationMessage::Error { message } => return Err(RegistrationError::Rejected(message)),
        other => return Err(unexpected(&other)),
    };

    for partition in &partitions {
        let records = data.get(partition).ok_or_else(|| {
            RegistrationError::Protocol(format!("assignment missing data for {partition}"))
        })?;
        if let Err(e) = store.assign(*partition, records) {
            // Report the persistence failure before aborting so the
            // coordinator can release the tentative assignment.
            let _ = framed
                .send(encode(&RegistrationMessage::Error {
                    message: format!("failed to persist {partition}: {e}"),
                }))
                .await;
            return Err(e.into());
        }
        info!(worker = %cfg.worker_id, %partition, records = records.len(), "partition snapshot stored");
    }

    framed
        .send(encode(&RegistrationMessage::DataReceived {
            worker_id: cfg.worker_id.clone(),
        }))
        .await?;

    match recv(&mut framed, cfg.registration_timeout).await? {
        RegistrationMessage::RegistrationComplete => Ok(partitions),
        RegistrationMessage::Error { message } => Err(RegistrationError::Rejected(message)),
        other => Err(unexpected(&other)),
    }
}

async fn recv(
    framed: &mut RegistrationFramed,
    wait: Duration,
) -> Result<RegistrationMessage, RegistrationError> {
    match timeout(wait, framed.next()).await {
        Err(_) => Err(RegistrationError::TimedOut),
        Ok(None) => Err(RegistrationError::ClosedEarly),
        Ok(Some(Err(e))) => Err(e.into()),
        Ok(Some(Ok(line))) => serde_json::from_str(&line)
            .map_err(|e| RegistrationError::Protocol(format!("unparseable message: {e}"))),
    }
}

fn unexpected(message: &RegistrationMessage) -> RegistrationError {
    RegistrationError::Protocol(format!("{message:?}"))
}
