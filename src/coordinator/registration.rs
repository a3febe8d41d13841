//! Coordinator side of the registration handshake.
//!
//! Plans a tentative assignment, ships the partition snapshots, and only
//! makes the worker routable once it has acknowledged durable receipt and
//! the completion message has been sent. Any failure before that point
//! rolls the tentative claims back.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tracing::{info, warn};

use super::registry::{Registry, WorkerDescriptor};
use super::seed::Seeds;
use crate::model::PartitionRecords;
use crate::protocol::{RegistrationMessage, encode, registration_codec};

pub(super) async fn handle_worker(
    socket: TcpStream,
    peer: SocketAddr,
    registry: Arc<Registry>,
    seeds: Arc<Seeds>,
    wait: Duration,
) {
    let mut framed = Framed::new(socket, registration_codec());

    let (worker_id, task_port) = match recv(&mut framed, wait).await {
        Some(RegistrationMessage::Register {
            worker_id,
            task_port,
        }) => (worker_id, task_port),
        Some(other) => {
            warn!(%peer, message = ?other, "expected REGISTRO");
            let _ = framed
                .send(encode(&RegistrationMessage::Error {
                    message: "expected REGISTRO".to_string(),
                }))
                .await;
            return;
        }
        None => return,
    };
    info!(worker = %worker_id, %peer, task_port, "registration started");

    let partitions = registry.plan_assignment(&worker_id);
    let data: BTreeMap<_, _> = partitions
        .iter()
        .map(|p| {
            let records = seeds
                .records(*p)
                .cloned()
                .unwrap_or_else(|| PartitionRecords::empty(p.kind));
            (*p, records)
        })
        .collect();

    let assignment = RegistrationMessage::Assignment {
        partitions: partitions.clone(),
        data,
    };
    if framed.send(encode(&assignment)).await.is_err() {
        warn!(worker = %worker_id, "connection lost while shipping snapshots");
        registry.abort(&worker_id);
        return;
    }

    match recv(&mut framed, wait).await {
        Some(RegistrationMessage::DataReceived { worker_id: ack }) if ack == worker_id => {}
        Some(RegistrationMessage::Error { message }) => {
            warn!(worker = %worker_id, %message, "worker reported persistence failure");
            registry.abort(&worker_id);
            return;
        }
        other => {
            warn!(worker = %worker_id, ?other, "registration aborted before acknowledgement");
            registry.abort(&worker_id);
            return;
        }
    }

    if framed
        .send(encode(&RegistrationMessage::RegistrationComplete))
        .await
        .is_err()
    {
        warn!(worker = %worker_id, "connection lost before completion message");
        registry.abort(&worker_id);
        return;
    }

    // Routable only now: snapshots are durable on the worker and the
    // completion message is on the wire.
    registry.commit(WorkerDescriptor {
        worker_id,
        addr: SocketAddr::new(peer.ip(), task_port),
        available: true,
    });
}

async fn recv(
    framed: &mut Framed<TcpStream, tokio_util::codec::LinesCodec>,
    wait: Duration,
) -> Option<RegistrationMessage> {
    match timeout(wait, framed.next()).await {
        Err(_) | Ok(None) => None,
        Ok(Some(Err(_))) => None,
        Ok(Some(Ok(line))) => match serde_json::from_str(&line) {
            Ok(message) => Some(message),
            Err(e) => {
                warn!(error = %e, "unparseable registration message");
                None
            }
        },
    }
}
