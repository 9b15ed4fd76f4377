use super::{Candidate, StorageDesc, BAREMETAL_DISK_BACKEND};
use crate::pending_usage::PendingUsage;

/// Free/reserved/total resources of a candidate with its pending usage
/// subtracted.
#[derive(Debug, Clone, Copy)]
pub struct ResourceGetter<'a> {
    candidate: &'a Candidate,
    pending: Option<&'a PendingUsage>,
}

impl<'a> ResourceGetter<'a> {
    pub fn new(candidate: &'a Candidate, pending: Option<&'a PendingUsage>) -> Self {
        Self { candidate, pending }
    }

    fn pending_servers(&self) -> i64 {
        self.pending.map(|p| p.servers).unwrap_or(0)
    }

    /// A baremetal is free when nothing runs or is reserved on it.
    fn baremetal_free(&self, allocated: bool) -> bool {
        !allocated && self.pending_servers() == 0
    }

    pub fn total_cpu(&self) -> i64 {
        match self.candidate {
            Candidate::Host(h) => (h.cpu_count as f64 * h.cpu_cmtbound).floor() as i64,
            Candidate::Baremetal(b) => b.cpu_count,
        }
    }

    pub fn reserved_cpu(&self) -> i64 {
        match self.candidate {
            Candidate::Host(h) => h.reserved_cpu_count(),
            Candidate::Baremetal(_) => 0,
        }
    }

    pub fn free_cpu(&self) -> i64 {
        match self.candidate {
            Candidate::Host(h) => {
                let pending = self.pending.map(|p| p.cpu).unwrap_or(0);
                self.total_cpu() - self.reserved_cpu() - h.running_cpu - pending
            }
            Candidate::Baremetal(b) if self.baremetal_free(b.allocated) => b.cpu_count,
            Candidate::Baremetal(_) => 0,
        }
    }

    pub fn total_memory_mb(&self) -> i64 {
        match self.candidate {
            Candidate::Host(h) => (h.mem_size_mb as f64 * h.mem_cmtbound).floor() as i64,
            Candidate::Baremetal(b) => b.mem_size_mb,
        }
    }

    pub fn reserved_memory_mb(&self) -> i64 {
        match self.candidate {
            Candidate::Host(h) => h.mem_reserved_mb,
            Candidate::Baremetal(_) => 0,
        }
    }

    pub fn free_memory_mb(&self) -> i64 {
        match self.candidate {
            Candidate::Host(h) => {
                let pending = self.pending.map(|p| p.memory_mb).unwrap_or(0);
                self.total_memory_mb() - self.reserved_memory_mb() - h.running_mem_mb - pending
            }
            Candidate::Baremetal(b) if self.baremetal_free(b.allocated) => b.mem_size_mb,
            Candidate::Baremetal(_) => 0,
        }
    }

    /// Free size of every storage on a host, pending usage of the backend
    /// charged to the storages in order.
    pub fn storages_free(&self) -> Vec<(&'a StorageDesc, i64)> {
        let mut charged: std::collections::BTreeMap<&str, i64> = Default::default();
        let mut result = Vec::new();
        for storage in self.candidate.storages() {
            let pending_left = charged
                .entry(storage.backend.as_str())
                .or_insert_with(|| self.pending.map(|p| p.disk(&storage.backend)).unwrap_or(0));
            let raw = storage.free_mb();
            let charge = (*pending_left).min(raw.max(0));
            *pending_left -= charge;
            result.push((storage, raw - charge));
        }
        result
    }

    /// Total free size of a storage backend.
    pub fn free_storage_mb(&self, backend: &str) -> i64 {
        match self.candidate {
            Candidate::Host(_) => self
                .storages_free()
                .iter()
                .filter(|(s, _)| s.backend == backend)
                .map(|(_, free)| *free)
                .sum(),
            Candidate::Baremetal(b)
                if backend == BAREMETAL_DISK_BACKEND && self.baremetal_free(b.allocated) =>
            {
                b.storage_size_mb
            }
            Candidate::Baremetal(_) => 0,
        }
    }

    /// Free size across all backends.
    pub fn total_free_storage_mb(&self) -> i64 {
        match self.candidate {
            Candidate::Host(_) => self.storages_free().iter().map(|(_, free)| *free).sum(),
            Candidate::Baremetal(_) => self.free_storage_mb(BAREMETAL_DISK_BACKEND),
        }
    }

    /// Largest single storage of a backend, with its free size.
    pub fn best_storage(&self, backend: &str) -> Option<(&'a StorageDesc, i64)> {
        self.storages_free()
            .into_iter()
            .filter(|(s, _)| s.backend == backend)
            .fold(None, |best, (s, free)| match best {
                Some((_, best_free)) if best_free >= free => best,
                _ => Some((s, free)),
            })
    }

    /// Free addresses on a network after `net_pending` reservations.
    pub fn free_addresses(&self, network_id: &str, net_pending: i64) -> Option<i64> {
        self.candidate
            .networks()
            .iter()
            .find(|n| n.id == network_id)
            .map(|n| n.free_addresses - net_pending)
    }

    pub fn free_isolated_devices(&self) -> i64 {
        match self.candidate {
            Candidate::Host(h) => {
                h.isolated_devices_free - self.pending.map(|p| p.isolated_devices).unwrap_or(0)
            }
            Candidate::Baremetal(_) => 0,
        }
    }

    /// Guests of a group on the candidate including pending placements.
    pub fn instance_group_guests(&self, group_id: &str) -> i64 {
        self.candidate.instance_group_guests(group_id)
            + self.pending.map(|p| p.instance_group(group_id)).unwrap_or(0)
    }
}

impl Candidate {
    pub fn getter<'a>(&'a self, pending: Option<&'a PendingUsage>) -> ResourceGetter<'a> {
        ResourceGetter::new(self, pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candidate::testing::{baremetal, host};

    #[test]
    fn test_host_free_cpu_and_memory() {
        let mut h = host("h1", 16, 32768);
        h.reserved_cpus = "0-1".into();
        h.running_cpu = 4;
        h.cpu_cmtbound = 2.0;
        h.mem_reserved_mb = 1024;
        h.running_mem_mb = 8192;
        h.prepare().unwrap();
        let c = Candidate::from(h);

        let mut pending = PendingUsage::new("h1");
        pending.cpu = 6;
        pending.memory_mb = 2048;

        let g = c.getter(Some(&pending));
        assert_eq!(g.total_cpu(), 32);
        assert_eq!(g.free_cpu(), 32 - 2 - 4 - 6);
        assert_eq!(g.free_memory_mb(), 32768 - 1024 - 8192 - 2048);
    }

    #[test]
    fn test_storage_pending_charged_in_order() {
        let mut h = host("h1", 16, 32768);
        h.storages = vec![
            StorageDesc {
                id: "s1".into(),
                backend: "local".into(),
                capacity_mb: 100,
                used_mb: 0,
                cmtbound: 1.0,
            },
            StorageDesc {
                id: "s2".into(),
                backend: "local".into(),
                capacity_mb: 200,
                used_mb: 50,
                cmtbound: 1.0,
            },
        ];
        let c = Candidate::from(h);
        let mut pending = PendingUsage::new("h1");
        pending.disks.insert("local".into(), 120);

        let g = c.getter(Some(&pending));
        let free: Vec<i64> = g.storages_free().iter().map(|(_, f)| *f).collect();
        assert_eq!(free, vec![0, 130]);
        assert_eq!(g.free_storage_mb("local"), 130);
        assert_eq!(g.best_storage("local").unwrap().0.id, "s2");
        assert_eq!(g.free_storage_mb("rbd"), 0);
    }

    #[test]
    fn test_baremetal_taken_by_pending_server() {
        let c = Candidate::from(baremetal("b1"));
        assert_eq!(c.getter(None).free_cpu(), 32);

        let mut pending = PendingUsage::new("b1");
        pending.servers = 1;
        let g = c.getter(Some(&pending));
        assert_eq!(g.free_cpu(), 0);
        assert_eq!(g.free_storage_mb("local"), 0);
    }

    #[test]
    fn test_free_addresses() {
        let c = Candidate::from(host("h1", 4, 1024));
        let g = c.getter(None);
        assert_eq!(g.free_addresses("net1", 30), Some(70));
        assert_eq!(g.free_addresses("missing", 0), None);
    }
}
