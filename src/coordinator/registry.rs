//! Authoritative partition registry.
//!
//! Maps each partition to its single owning worker plus any replica
//! holders. Mutated only by the registration workflow (tentative claim,
//! then commit or abort); read by routing, which vastly outnumbers writes,
//! hence the read/write lock.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::RwLock;

use tracing::info;

use crate::model::PartitionId;

/// A registered worker as seen by routing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerDescriptor {
    pub worker_id: String,
    pub addr: SocketAddr,
    pub available: bool,
}

#[derive(Debug)]
struct Claim {
    worker: String,
    confirmed: bool,
}

#[derive(Debug, Default)]
struct Slots {
    owner: Option<Claim>,
    replicas: Vec<Claim>,
}

impl Slots {
    fn holds(&self, worker: &str) -> bool {
        self.owner.as_ref().is_some_and(|c| c.worker == worker)
            || self.replicas.iter().any(|c| c.worker == worker)
    }

    fn holders(&self) -> usize {
        usize::from(self.owner.is_some()) + self.replicas.len()
    }
}

struct Inner {
    workers: HashMap<String, WorkerDescriptor>,
    partitions: BTreeMap<PartitionId, Slots>,
}

pub struct Registry {
    replica_factor: usize,
    max_owned_per_worker: usize,
    inner: RwLock<Inner>,
}

impl Registry {
    pub fn new(
        partitions: impl IntoIterator<Item = PartitionId>,
        replica_factor: usize,
        max_owned_per_worker: usize,
    ) -> Self {
        let partitions = partitions
            .into_iter()
            .map(|p| (p, Slots::default()))
            .collect();
        Registry {
            replica_factor: replica_factor.max(1),
            max_owned_per_worker,
            inner: RwLock::new(Inner {
                workers: HashMap::new(),
                partitions,
            }),
        }
    }

    /// Reserves a tentative assignment for a registering worker: unowned
    /// partitions first (in sorted order, up to the per-worker cap), then
    /// replica slots on already-owned partitions. The claims only become
    /// routable once [`commit`](Registry::commit) runs.
    pub fn plan_assignment(&self, worker_id: &str) -> Vec<PartitionId> {
        let mut inner = self.inner.write().expect("registry lock poisoned");
        let mut assigned = Vec::new();
        let mut owned = 0usize;

        for (partition, slots) in inner.partitions.iter_mut() {
            if slots.holds(worker_id) {
                continue;
            }
            if slots.owner.is_none() && owned < self.max_owned_per_worker {
                slots.owner = Some(Claim {
                    worker: worker_id.to_string(),
                    confirmed: false,
                });
                owned += 1;
                assigned.push(*partition);
            } else if slots.owner.is_some() && slots.holders() < self.replica_factor {
                slots.replicas.push(Claim {
                    worker: worker_id.to_string(),
                    confirmed: false,
                });
                assigned.push(*partition);
            }
        }
        assigned
    }

    /// Confirms a worker's tentative claims and makes it routable.
    pub fn commit(&self, descriptor: WorkerDescriptor) {
        let mut inner = self.inner.write().expect("registry lock poisoned");
        for slots in inner.partitions.values_mut() {
            if let Some(claim) = slots.owner.as_mut().filter(|c| c.worker == descriptor.worker_id) {
                claim.confirmed = true;
            }
            for claim in slots.replicas.iter_mut() {
                if claim.worker == descriptor.worker_id {
                    claim.confirmed = true;
                }
            }
        }
        info!(worker = %descriptor.worker_id, addr = %descriptor.addr, "worker registered");
        inner.workers.insert(descriptor.worker_id.clone(), descriptor);
    }

    /// Releases a worker's unconfirmed claims after a failed registration.
    pub fn abort(&self, worker_id: &str) {
        let mut inner = self.inner.write().expect("registry lock poisoned");
        for slots in inner.partitions.values_mut() {
            if slots
                .owner
                .as_ref()
                .is_some_and(|c| c.worker == worker_id && !c.confirmed)
            {
                slots.owner = None;
            }
            slots
                .replicas
                .retain(|c| c.worker != worker_id || c.confirmed);
        }
    }

    /// The confirmed, available owner of a partition.
    pub fn owner_of(&self, partition: PartitionId) -> Option<WorkerDescriptor> {
        let inner = self.inner.read().expect("registry lock poisoned");
        let claim = inner.partitions.get(&partition)?.owner.as_ref()?;
        if !claim.confirmed {
            return None;
        }
        inner
            .workers
            .get(&claim.worker)
            .filter(|w| w.available)
            .cloned()
    }

    /// Confirmed, available replica holders of a partition.
    pub fn replica_holders(&self, partition: PartitionId) -> Vec<WorkerDescriptor> {
        let inner = self.inner.read().expect("registry lock poisoned");
        let Some(slots) = inner.partitions.get(&partition) else {
            return Vec::new();
        };
        slots
            .replicas
            .iter()
            .filter(|c| c.confirmed)
            .filter_map(|c| inner.workers.get(&c.worker))
            .filter(|w| w.available)
            .cloned()
            .collect()
    }

    /// Marks a worker unreachable; its partitions stop routing until a
    /// fresh registration.
    pub fn mark_unavailable(&self, worker_id: &str) {
        let mut inner = self.inner.write().expect("registry lock poisoned");
        if let Some(worker) = inner.workers.get_mut(worker_id) {
            if worker.available {
                worker.available = false;
                info!(worker = %worker_id, "worker marked unavailable");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(worker_id: &str, port: u16) -> WorkerDescriptor {
        WorkerDescriptor {
            worker_id: worker_id.to_string(),
            addr: SocketAddr::from(([127, 0, 0, 1], port)),
            available: true,
        }
    }

    fn partitions(n: u16) -> Vec<PartitionId> {
        (1..=n).map(PartitionId::account).collect()
    }

    #[test]
    fn first_worker_takes_all_unowned_partitions() {
        let registry = Registry::new(partitions(3), 1, usize::MAX);
        let assigned = registry.plan_assignment("w1");
        assert_eq!(assigned, partitions(3));
        // Nothing routable before commit.
        assert_eq!(registry.owner_of(PartitionId::account(1)), None);

        registry.commit(descriptor("w1", 9001));
        let owner = registry.owner_of(PartitionId::account(1)).unwrap();
        assert_eq!(owner.worker_id, "w1");
    }

    #[test]
    fn ownership_cap_splits_partitions_across_workers() {
        let registry = Registry::new(partitions(2), 1, 1);
        assert_eq!(registry.plan_assignment("w1"), vec![PartitionId::account(1)]);
        registry.commit(descriptor("w1", 9001));
        assert_eq!(registry.plan_assignment("w2"), vec![PartitionId::account(2)]);
        registry.commit(descriptor("w2", 9002));

        assert_eq!(
            registry.owner_of(PartitionId::account(1)).unwrap().worker_id,
            "w1"
        );
        assert_eq!(
            registry.owner_of(PartitionId::account(2)).unwrap().worker_id,
            "w2"
        );
    }

    #[test]
    fn later_workers_become_replica_holders() {
        let registry = Registry::new(partitions(1), 2, usize::MAX);
        registry.plan_assignment("w1");
        registry.commit(descriptor("w1", 9001));

        let assigned = registry.plan_assignment("w2");
        assert_eq!(assigned, vec![PartitionId::account(1)]);
        registry.commit(descriptor("w2", 9002));

        let owner = registry.owner_of(PartitionId::account(1)).unwrap();
        assert_eq!(owner.worker_id, "w1");
        let replicas = registry.replica_holders(PartitionId::account(1));
        assert_eq!(replicas.len(), 1);
        assert_eq!(replicas[0].worker_id, "w2");
    }

    #[test]
    fn abort_releases_tentative_claims() {
        let registry = Registry::new(partitions(1), 1, usize::MAX);
        registry.plan_assignment("w1");
        registry.abort("w1");

        let assigned = registry.plan_assignment("w2");
        assert_eq!(assigned, vec![PartitionId::account(1)]);
        registry.commit(descriptor("w2", 9002));
        assert_eq!(
            registry.owner_of(PartitionId::account(1)).unwrap().worker_id,
            "w2"
        );
    }

    #[test]
    fn abort_keeps_confirmed_claims() {
        let registry = Registry::new(partitions(1), 1, usize::MAX);
        registry.plan_assignment("w1");
        registry.commit(descriptor("w1", 9001));
        registry.abort("w1");
        assert_eq!(
            registry.owner_of(PartitionId::account(1)).unwrap().worker_id,
            "w1"
        );
    }

    #[test]
    fn unavailable_workers_stop_routing() {
        let registry = Registry::new(partitions(1), 1, usize::MAX);
        registry.plan_assignment("w1");
        registry.commit(descriptor("w1", 9001));
        registry.mark_unavailable("w1");
        assert_eq!(registry.owner_of(PartitionId::account(1)), None);
    }

    #[test]
    fn replica_factor_bounds_holders() {
        let registry = Registry::new(partitions(1), 2, usize::MAX);
        registry.plan_assignment("w1");
        registry.commit(descriptor("w1", 9001));
        registry.plan_assignment("w2");
        registry.commit(descriptor("w2", 9002));
        // Partition already has owner + one replica; nothing left for w3.
        assert!(registry.plan_assignment("w3").is_empty());
    }
}
