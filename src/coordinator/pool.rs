//! Pipelined worker connections.
//!
//! The coordinator keeps one persistent connection per worker. Requests are
//! stamped with a connection-local id and resolved through a correlation
//! map, so multiple in-flight requests on one connection complete
//! independently of arrival order. Every call is bounded by the configured
//! request timeout; a timed-out or failed call never blocks the connection.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::time::timeout;
use tokio_util::codec::{Framed, LinesCodec};
use tracing::debug;

use crate::protocol::{Request, Response, encode, task_codec};

const CALL_QUEUE_CAPACITY: usize = 64;

/// Failure of one coordinator-to-worker call.
#[derive(Debug, Clone, Error)]
pub enum CallError {
    #[error("failed to connect to worker at {addr}: {detail}")]
    Connect { addr: SocketAddr, detail: String },

    #[error("request to worker timed out")]
    Timeout,

    #[error("worker connection closed")]
    ConnectionClosed,
}

struct Call {
    request: Request,
    reply: oneshot::Sender<Result<Response, CallError>>,
}

#[derive(Clone)]
struct WorkerClient {
    tx: mpsc::Sender<Call>,
}

pub struct WorkerPool {
    request_timeout: Duration,
    clients: Mutex<HashMap<SocketAddr, WorkerClient>>,
}

impl WorkerPool {
    pub fn new(request_timeout: Duration) -> Self {
        WorkerPool {
            request_timeout,
            clients: Mutex::new(HashMap::new()),
        }
    }

    /// Sends `request` to the worker at `addr` and awaits its response,
    /// bounded by the pool's request timeout. The request's correlation id
    /// is assigned by the connection; any caller-set id is replaced.
    pub async fn call(&self, addr: SocketAddr, request: Request) -> Result<Response, CallError> {
        // Two attempts: a dead connection task is detected on the first
        // send and respawned for the second.
        for _ in 0..2 {
            let client = self.client(addr).await;
            let (reply_tx, reply_rx) = oneshot::channel();
            let call = Call {
                request: request.clone(),
                reply: reply_tx,
            };
            if client.tx.send(call).await.is_err() {
                self.remove(addr).await;
                continue;
            }
            return match timeout(self.request_timeout, reply_rx).await {
                Err(_) => Err(CallError::Timeout),
                Ok(Err(_)) => {
                    self.remove(addr).await;
                    Err(CallError::ConnectionClosed)
                }
                Ok(Ok(result)) => {
                    if result.is_err() {
                        self.remove(addr).await;
                    }
                    result
                }
            };
        }
        Err(CallError::ConnectionClosed)
    }

    async fn client(&self, addr: SocketAddr) -> WorkerClient {
        let mut clients = self.clients.lock().await;
        if let Some(client) = clients.get(&addr) {
            return client.clone();
        }
        let (tx, rx) = mpsc::channel(CALL_QUEUE_CAPACITY);
        tokio::spawn(run_connection(addr, rx));
        let client = WorkerClient { tx };
        clients.insert(addr, client.clone());
        client
    }

    async fn remove(&self, addr: SocketAddr) {
        self.clients.lock().await.remove(&addr);
    }
}

async fn run_connection(addr: SocketAddr, mut rx: mpsc::Receiver<Call>) {
    let stream = match TcpStream::connect(addr).await {
        Ok(stream) => stream,
        Err(e) => {
            debug!(%addr, error = %e, "worker connection failed");
            let detail = e.to_string();
            while let Ok(call) = rx.try_recv() {
                let _ = call.reply.send(Err(CallError::Connect {
                    addr,
                    detail: detail.clone(),
                }));
            }
            return;
        }
    };

    let framed = Framed::new(stream, task_codec());
    let (mut sink, mut lines): (
        SplitSink<Framed<TcpStream, LinesCodec>, String>,
        SplitStream<Framed<TcpStream, LinesCodec>>,
    ) = framed.split();

    let mut pending: HashMap<u64, oneshot::Sender<Result<Response, CallError>>> = HashMap::new();
    let mut next_id: u64 = 1;

    loop {
        tokio::select! {
            call = rx.recv() => {
                let Some(mut call) = call else {
                    break;
                };
                let id = next_id;
                next_id += 1;
                call.request.id = Some(id);
                if sink.send(encode(&call.request)).await.is_err() {
                    let _ = call.reply.send(Err(CallError::ConnectionClosed));
                    break;
                }
                pending.insert(id, call.reply);
            }
            line = lines.next() => {
                match line {
                    None | Some(Err(_)) => break,
                    Some(Ok(text)) => match serde_json::from_str::<Response>(&text) {
                        Ok(response) => {
                            // A response whose id misses the table belongs
                            // to a call that already timed out.
                            if let Some(id) = response.id {
                                if let Some(reply) = pending.remove(&id) {
                                    let _ = reply.send(Ok(response));
                                }
                            }
                        }
                        Err(e) => debug!(%addr, error = %e, "unparseable worker response"),
                    },
                }
            }
        }
    }

    for (_, reply) in pending.drain() {
        let _ = reply.send(Err(CallError::ConnectionClosed));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{OperationType, Params, Status};
    use tokio::net::TcpListener;

    /// Fake worker answering every request, optionally out of order.
    async fn fake_worker(listener: TcpListener, reverse_batches: usize) {
        let (socket, _) = listener.accept().await.unwrap();
        let mut framed = Framed::new(socket, task_codec());
        loop {
            let mut batch = Vec::new();
            for _ in 0..reverse_batches.max(1) {
                match framed.next().await {
                    Some(Ok(line)) => batch.push(serde_json::from_str::<Request>(&line).unwrap()),
                    _ => return,
                }
            }
            batch.reverse();
            for request in batch {
                let response = Response::new(Status::Success, format!("{:?}", request.operation))
                    .with_datos(serde_json::json!(request.parameters.account))
                    .with_id(request.id);
                framed.send(encode(&response)).await.unwrap();
            }
        }
    }

    fn request(account: u32) -> Request {
        Request::new(
            OperationType::QueryBalance,
            Params {
                account: Some(account),
                ..Params::default()
            },
        )
    }

    #[tokio::test]
    async fn calls_resolve_through_correlation_even_out_of_order() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(fake_worker(listener, 2));

        let pool = std::sync::Arc::new(WorkerPool::new(Duration::from_secs(5)));
        let a = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.call(addr, request(1)).await.unwrap() })
        };
        let b = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.call(addr, request(2)).await.unwrap() })
        };

        let (a, b) = (a.await.unwrap(), b.await.unwrap());
        // Responses arrive reversed; correlation must still match each
        // caller with its own payload.
        assert_eq!(a.datos, Some(serde_json::json!(1)));
        assert_eq!(b.datos, Some(serde_json::json!(2)));
    }

    #[tokio::test]
    async fn unreachable_worker_reports_connect_error() {
        // Bind-then-drop reserves an address nothing listens on.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let pool = WorkerPool::new(Duration::from_millis(500));
        let result = pool.call(addr, request(1)).await;
        assert!(
            matches!(result, Err(CallError::Connect { .. }) | Err(CallError::ConnectionClosed)),
            "{result:?}"
        );
    }

    #[tokio::test]
    async fn silent_worker_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        // Accept and hold the connection without ever responding.
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            futures::future::pending::<()>().await;
            drop(socket);
        });

        let pool = WorkerPool::new(Duration::from_millis(200));
        let result = pool.call(addr, request(1)).await;
        assert!(matches!(result, Err(CallError::Timeout)), "{result:?}");
    }
}
