//! Partitioned ledger: account and client records sharded across worker
//! nodes, a coordinator routing operations by partition ownership, and
//! cross-shard transfers executed through a compensating-action protocol.

pub mod amount;
pub mod config;
pub mod coordinator;
pub mod journal;
pub mod model;
pub mod protocol;
pub mod store;
pub mod worker;

pub use amount::Amount;
pub use config::{CoordinatorConfig, WorkerConfig};
pub use coordinator::Coordinator;
pub use model::{AccountId, ClientId, PartitionId, TransferId};
pub use worker::WorkerNode;
