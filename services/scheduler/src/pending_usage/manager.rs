//! Session- and host-scoped pending usage accounting.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use hostsched_api::{CandidateResource, ResType, ScheduleInput, SessionUsageView};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use super::PendingUsage;

/// Key of a session usage: (session id, host id).
type SessionKey = (String, String);

#[derive(Debug, Default)]
struct SessionUsageState {
    usage: PendingUsage,
    count: i64,
    cancelled: bool,
}

/// What one session contributed to one host's pending usage.
#[derive(Debug)]
pub struct SessionPendingUsage {
    pub session_id: String,
    pub host_id: String,
    pub res_type: ResType,
    pub created_at: DateTime<Utc>,
    state: Mutex<SessionUsageState>,
}

impl SessionPendingUsage {
    fn new(session_id: &str, host_id: &str, res_type: ResType) -> Self {
        Self {
            session_id: session_id.to_string(),
            host_id: host_id.to_string(),
            res_type,
            created_at: Utc::now(),
            state: Mutex::new(SessionUsageState {
                usage: PendingUsage::new(host_id),
                count: 0,
                cancelled: false,
            }),
        }
    }

    fn add(&self, usage: &PendingUsage) {
        let mut state = self.state.lock();
        state.usage.add(usage);
        state.count += 1;
    }

    /// Take the recorded usage out, leaving the session cancelled.
    ///
    /// Returns `None` if it was already cancelled.
    fn take(&self) -> Option<PendingUsage> {
        let mut state = self.state.lock();
        if state.cancelled {
            return None;
        }
        state.cancelled = true;
        state.count = 0;
        Some(std::mem::take(&mut state.usage))
    }

    /// Number of placement picks that landed on this host.
    pub fn count(&self) -> i64 {
        self.state.lock().count
    }

    pub fn usage(&self) -> PendingUsage {
        self.state.lock().usage.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.lock().cancelled
    }

    pub fn to_view(&self) -> SessionUsageView {
        let state = self.state.lock();
        SessionUsageView {
            session_id: self.session_id.clone(),
            count: state.count,
            created_at: self.created_at,
            usage: state.usage.to_view(),
        }
    }
}

/// The pending usage ledger.
///
/// Host aggregates live in a concurrent map; compound read-modify-write on
/// one host additionally takes that host's named lock so concurrent
/// placements on the same host serialize.
#[derive(Debug, Default)]
pub struct PendingUsageManager {
    store: DashMap<String, PendingUsage>,
    sessions: DashMap<SessionKey, Arc<SessionPendingUsage>>,
    host_locks: DashMap<String, Arc<Mutex<()>>>,
    reload_start: RwLock<Option<DateTime<Utc>>>,
    reload_all_start: RwLock<Option<DateTime<Utc>>>,
}

impl PendingUsageManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn host_lock(&self, host_id: &str) -> Arc<Mutex<()>> {
        self.host_locks
            .entry(host_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Reserve the footprint of `input` on every host picked in `resource`.
    pub fn add_pending_usage(&self, input: &ScheduleInput, resource: &CandidateResource) {
        for pick in resource.picks() {
            let footprint = PendingUsage::from_request(input, pick);
            let lock = self.host_lock(&pick.id);
            let _guard = lock.lock();

            let key = (resource.session_id.clone(), pick.id.clone());
            let session = {
                let mut entry = self.sessions.entry(key).or_insert_with(|| {
                    Arc::new(SessionPendingUsage::new(
                        &resource.session_id,
                        &pick.id,
                        pick.res_type,
                    ))
                });
                if entry.is_cancelled() {
                    *entry = Arc::new(SessionPendingUsage::new(
                        &resource.session_id,
                        &pick.id,
                        pick.res_type,
                    ));
                }
                entry.clone()
            };
            session.add(&footprint);

            self.store
                .entry(pick.id.clone())
                .or_insert_with(|| PendingUsage::new(pick.id.clone()))
                .add(&footprint);

            debug!(
                session_id = %resource.session_id,
                host_id = %pick.id,
                count = session.count(),
                "Added pending usage"
            );
        }
    }

    /// Give back what `session` reserved on `host_id`.
    ///
    /// A missing or already cancelled session is a no-op. Returns true if
    /// anything was subtracted.
    pub fn cancel_pending_usage(&self, host_id: &str, session: Option<&SessionPendingUsage>) -> bool {
        let Some(session) = session else {
            return false;
        };

        let lock = self.host_lock(host_id);
        let _guard = lock.lock();

        let Some(usage) = session.take() else {
            return false;
        };

        let now_empty = match self.store.get_mut(host_id) {
            Some(mut aggregate) => {
                aggregate.sub(&usage);
                aggregate.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.store.remove_if(host_id, |_, aggregate| aggregate.is_empty());
        }

        let key = (session.session_id.clone(), host_id.to_string());
        self.sessions
            .remove_if(&key, |_, current| std::ptr::eq(current.as_ref(), session));

        debug!(
            session_id = %session.session_id,
            host_id = %host_id,
            "Cancelled pending usage"
        );
        true
    }

    pub fn get_pending_usage(&self, host_id: &str) -> Option<PendingUsage> {
        self.store.get(host_id).map(|u| u.clone())
    }

    /// Addresses reserved on a network across all hosts.
    pub fn get_net_pending_usage(&self, network_id: &str) -> i64 {
        self.store.iter().map(|u| u.net(network_id)).sum()
    }

    pub fn get_session_usage(&self, session_id: &str, host_id: &str) -> Option<Arc<SessionPendingUsage>> {
        self.sessions
            .get(&(session_id.to_string(), host_id.to_string()))
            .map(|s| s.clone())
    }

    /// All live usages of one session.
    pub fn session_usages(&self, session_id: &str) -> Vec<Arc<SessionPendingUsage>> {
        let mut usages: Vec<_> = self
            .sessions
            .iter()
            .filter(|entry| entry.key().0 == session_id)
            .map(|entry| entry.value().clone())
            .collect();
        usages.sort_by(|a, b| a.host_id.cmp(&b.host_id));
        usages
    }

    /// All live session usages on one host.
    pub fn host_session_usages(&self, host_id: &str) -> Vec<Arc<SessionPendingUsage>> {
        let mut usages: Vec<_> = self
            .sessions
            .iter()
            .filter(|entry| entry.key().1 == host_id)
            .map(|entry| entry.value().clone())
            .collect();
        usages.sort_by_key(|s| s.created_at);
        usages
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Cancel every session usage older than `ttl`.
    pub fn gc_expired_session_usages(&self, ttl: Duration) -> usize {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        let now = Utc::now();
        let expired: Vec<_> = self
            .sessions
            .iter()
            .filter(|entry| now.signed_duration_since(entry.created_at) > ttl)
            .map(|entry| entry.value().clone())
            .collect();

        let cancelled = expired
            .iter()
            .filter(|s| self.cancel_pending_usage(&s.host_id, Some(s.as_ref())))
            .count();
        if cancelled > 0 {
            info!(cancelled, "Expired stale session usages");
        }
        cancelled
    }

    /// Cancel session usages created strictly before `cutoff`.
    ///
    /// `session_id` and `host_ids` narrow the sweep when given.
    pub fn clear_session_usages_before(
        &self,
        cutoff: DateTime<Utc>,
        session_id: Option<&str>,
        host_ids: Option<&[String]>,
    ) -> usize {
        let stale: Vec<_> = self
            .sessions
            .iter()
            .filter(|entry| entry.created_at < cutoff)
            .filter(|entry| session_id.is_none_or(|sid| entry.key().0 == sid))
            .filter(|entry| host_ids.is_none_or(|ids| ids.contains(&entry.key().1)))
            .map(|entry| entry.value().clone())
            .collect();

        stale
            .iter()
            .filter(|s| self.cancel_pending_usage(&s.host_id, Some(s.as_ref())))
            .count()
    }

    /// Drop host locks nobody holds for hosts with nothing reserved.
    pub fn prune_idle_host_locks(&self) -> usize {
        let busy: HashSet<String> = self
            .sessions
            .iter()
            .map(|entry| entry.key().1.clone())
            .collect();
        let before = self.host_locks.len();
        self.host_locks.retain(|host_id, lock| {
            Arc::strong_count(lock) > 1 || busy.contains(host_id) || self.store.contains_key(host_id)
        });
        let pruned = before.saturating_sub(self.host_locks.len());
        if pruned > 0 {
            debug!(pruned, "Pruned idle host locks");
        }
        pruned
    }

    pub fn host_lock_count(&self) -> usize {
        self.host_locks.len()
    }

    /// Record the instant a partial reload starts and return it.
    pub fn set_reload_start_time(&self) -> DateTime<Utc> {
        let now = Utc::now();
        *self.reload_start.write() = Some(now);
        now
    }

    pub fn get_reload_start_time(&self) -> Option<DateTime<Utc>> {
        *self.reload_start.read()
    }

    /// Record the instant a full reload starts and return it.
    pub fn set_reload_all_start_time(&self) -> DateTime<Utc> {
        let now = Utc::now();
        *self.reload_all_start.write() = Some(now);
        now
    }

    pub fn get_reload_all_start_time(&self) -> Option<DateTime<Utc>> {
        *self.reload_all_start.read()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hostsched_api::{DiskSpec, HostPick};
    use proptest::prelude::*;

    fn pick(id: &str) -> HostPick {
        HostPick {
            id: id.into(),
            name: id.into(),
            res_type: ResType::Host,
            zone_id: None,
            storage_ids: vec![],
            network_ids: vec!["net1".into()],
        }
    }

    fn resource(session: &str, host: &str, backup: Option<&str>) -> CandidateResource {
        CandidateResource {
            session_id: session.into(),
            host: pick(host),
            backup: backup.map(pick),
        }
    }

    fn input(cpu: i64, mem: i64) -> ScheduleInput {
        ScheduleInput {
            vcpu_count: cpu,
            memory_mb: mem,
            disks: vec![DiskSpec { backend: "local".into(), size_mb: 1024 }],
            ..Default::default()
        }
    }

    #[test]
    fn test_add_accumulates_per_session_and_host() {
        let ledger = PendingUsageManager::new();
        ledger.add_pending_usage(&input(2, 1024), &resource("s1", "h1", None));
        ledger.add_pending_usage(&input(2, 1024), &resource("s1", "h1", None));
        ledger.add_pending_usage(&input(1, 512), &resource("s2", "h1", None));

        let usage = ledger.get_pending_usage("h1").unwrap();
        assert_eq!(usage.cpu, 5);
        assert_eq!(usage.memory_mb, 2560);
        assert_eq!(usage.servers, 3);
        assert_eq!(ledger.get_session_usage("s1", "h1").unwrap().count(), 2);
        assert_eq!(ledger.get_net_pending_usage("net1"), 3);
    }

    #[test]
    fn test_backup_pick_is_recorded() {
        let ledger = PendingUsageManager::new();
        ledger.add_pending_usage(&input(2, 1024), &resource("s1", "h1", Some("h2")));
        assert_eq!(ledger.get_pending_usage("h1").unwrap().cpu, 2);
        assert_eq!(ledger.get_pending_usage("h2").unwrap().cpu, 2);
        assert_eq!(ledger.session_usages("s1").len(), 2);
    }

    #[test]
    fn test_cancel_restores_and_removes_empty() {
        let ledger = PendingUsageManager::new();
        ledger.add_pending_usage(&input(2, 1024), &resource("s1", "h1", None));
        let session = ledger.get_session_usage("s1", "h1").unwrap();

        assert!(ledger.cancel_pending_usage("h1", Some(session.as_ref())));
        assert!(ledger.get_pending_usage("h1").is_none());
        assert!(ledger.get_session_usage("s1", "h1").is_none());

        // Second cancel is a no-op.
        assert!(!ledger.cancel_pending_usage("h1", Some(session.as_ref())));
        assert!(!ledger.cancel_pending_usage("h1", None));
    }

    #[test]
    fn test_cancel_keeps_other_sessions() {
        let ledger = PendingUsageManager::new();
        ledger.add_pending_usage(&input(2, 1024), &resource("s1", "h1", None));
        ledger.add_pending_usage(&input(4, 2048), &resource("s2", "h1", None));
        let s1 = ledger.get_session_usage("s1", "h1").unwrap();
        ledger.cancel_pending_usage("h1", Some(s1.as_ref()));

        let usage = ledger.get_pending_usage("h1").unwrap();
        assert_eq!(usage.cpu, 4);
        assert_eq!(usage.memory_mb, 2048);
    }

    #[test]
    fn test_gc_expired_session_usages() {
        let ledger = PendingUsageManager::new();
        ledger.add_pending_usage(&input(2, 1024), &resource("s1", "h1", None));
        assert_eq!(ledger.gc_expired_session_usages(Duration::from_secs(3600)), 0);
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(ledger.gc_expired_session_usages(Duration::from_millis(1)), 1);
        assert!(ledger.get_pending_usage("h1").is_none());
        assert_eq!(ledger.session_count(), 0);
    }

    #[test]
    fn test_clear_before_cutoff_spares_newer_sessions() {
        let ledger = PendingUsageManager::new();
        ledger.add_pending_usage(&input(2, 1024), &resource("old", "h1", None));
        std::thread::sleep(Duration::from_millis(5));
        let cutoff = ledger.set_reload_start_time();
        std::thread::sleep(Duration::from_millis(5));
        ledger.add_pending_usage(&input(1, 512), &resource("new", "h1", None));

        let cleared = ledger.clear_session_usages_before(cutoff, None, Some(&["h1".to_string()]));
        assert_eq!(cleared, 1);
        assert_eq!(ledger.get_pending_usage("h1").unwrap().cpu, 1);
        assert_eq!(ledger.get_reload_start_time(), Some(cutoff));
    }

    #[test]
    fn test_idle_host_locks_are_pruned() {
        let ledger = PendingUsageManager::new();
        ledger.add_pending_usage(&input(2, 1024), &resource("s1", "h1", None));
        ledger.add_pending_usage(&input(2, 1024), &resource("s1", "gone", None));
        assert_eq!(ledger.host_lock_count(), 2);

        let session = ledger.get_session_usage("s1", "gone");
        assert!(ledger.cancel_pending_usage("gone", session.as_deref()));
        assert_eq!(ledger.prune_idle_host_locks(), 1);
        assert_eq!(ledger.host_lock_count(), 1);

        // h1 still has a reservation.
        assert_eq!(ledger.prune_idle_host_locks(), 0);
        let held = ledger.host_lock("h1");
        let session = ledger.get_session_usage("s1", "h1");
        assert!(ledger.cancel_pending_usage("h1", session.as_deref()));
        assert_eq!(ledger.prune_idle_host_locks(), 0);
        drop(held);
        assert_eq!(ledger.prune_idle_host_locks(), 1);
        assert_eq!(ledger.host_lock_count(), 0);
    }

    #[test]
    fn test_concurrent_adds_on_same_host() {
        let ledger = Arc::new(PendingUsageManager::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let ledger = ledger.clone();
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        ledger.add_pending_usage(
                            &input(1, 1),
                            &resource(&format!("s{i}"), "h1", None),
                        );
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(ledger.get_pending_usage("h1").unwrap().cpu, 400);
    }

    proptest! {
        #[test]
        fn add_then_cancel_is_conserving(
            shapes in proptest::collection::vec((0i64..16, 0i64..4096), 1..8),
        ) {
            let ledger = PendingUsageManager::new();
            ledger.add_pending_usage(&input(3, 300), &resource("base", "h1", None));
            let before = ledger.get_pending_usage("h1").unwrap();

            for (i, (cpu, mem)) in shapes.iter().enumerate() {
                ledger.add_pending_usage(&input(*cpu, *mem), &resource(&format!("s{i}"), "h1", None));
            }
            for i in 0..shapes.len() {
                let session = ledger.get_session_usage(&format!("s{i}"), "h1");
                ledger.cancel_pending_usage("h1", session.as_deref());
            }

            prop_assert_eq!(ledger.get_pending_usage("h1").unwrap(), before);
        }
    }
}
