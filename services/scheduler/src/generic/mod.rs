//! Predicate and priority phases over one candidate snapshot.
//!
//! The predicate phase fans out over a dedicated rayon pool; it is pure with
//! respect to the snapshot and the unit, so candidates are evaluated
//! independently and fanned back in order before ranking.

mod predicates;
mod priorities;
mod result;

use std::sync::Arc;

use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use tracing::{debug, warn};

use crate::candidate::Candidate;
use crate::error::SchedError;
use crate::unit::Unit;

pub use predicates::{default_predicates, FitPredicate, PredicateResult};
pub use priorities::{default_priorities, total_score, Priority};
pub use result::{SchedResultItem, SchedResultItemList, UNBOUNDED_CAPACITY};

pub struct GenericScheduler {
    predicates: Vec<Box<dyn FitPredicate>>,
    priorities: Vec<Box<dyn Priority>>,
    pool: ThreadPool,
}

impl GenericScheduler {
    pub fn new(parallelism: usize) -> Result<Self, SchedError> {
        Self::with_plugins(parallelism, default_predicates(), default_priorities())
    }

    pub fn with_plugins(
        parallelism: usize,
        predicates: Vec<Box<dyn FitPredicate>>,
        priorities: Vec<Box<dyn Priority>>,
    ) -> Result<Self, SchedError> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(parallelism.max(1))
            .thread_name(|i| format!("hostsched-predicate-{i}"))
            .build()
            .map_err(|e| SchedError::Internal(format!("build predicate pool: {e}")))?;
        Ok(Self {
            predicates,
            priorities,
            pool,
        })
    }

    /// Run both phases. Blocks the calling thread; call from `spawn_blocking`.
    pub fn schedule(&self, unit: Arc<Unit>, candidates: &[Arc<Candidate>]) -> SchedResultItemList {
        let active: Vec<&dyn FitPredicate> = self
            .predicates
            .iter()
            .map(|p| p.as_ref())
            .filter(|p| p.applies(&unit) && !unit.input.is_ignored(p.name()))
            .collect();

        let unit_ref = unit.as_ref();
        let mut items: Vec<SchedResultItem> = self.pool.install(|| {
            candidates
                .par_iter()
                .filter_map(|candidate| Self::fit(&active, unit_ref, candidate))
                .collect()
        });

        for item in &mut items {
            item.score = total_score(&self.priorities, unit_ref, &item.candidate);
        }

        debug!(
            task_id = %unit.task_id,
            candidates = candidates.len(),
            fitted = items.len(),
            "Generic scheduling pass complete"
        );
        SchedResultItemList::new(unit, items)
    }

    /// Evaluate every active predicate; the first failure drops the candidate.
    fn fit(
        predicates: &[&dyn FitPredicate],
        unit: &Unit,
        candidate: &Arc<Candidate>,
    ) -> Option<SchedResultItem> {
        let mut item = SchedResultItem::new(candidate.clone(), UNBOUNDED_CAPACITY);

        for predicate in predicates {
            let result = match predicate.check(unit, candidate) {
                Ok(result) => result,
                Err(e) => {
                    warn!(
                        task_id = %unit.task_id,
                        candidate = candidate.id(),
                        predicate = predicate.name(),
                        error = %e,
                        "Predicate failed"
                    );
                    unit.log.append(candidate.id(), predicate.name(), e.to_string());
                    return None;
                }
            };

            if !result.fits {
                for reason in &result.reasons {
                    debug!(
                        candidate = candidate.id(),
                        predicate = predicate.name(),
                        reason = %reason,
                        "Candidate filtered"
                    );
                    unit.log.append(candidate.id(), predicate.name(), reason.clone());
                }
                return None;
            }

            if let Some(capacity) = result.capacity {
                item.capacity = item.capacity.min(capacity);
                item.capacity_details
                    .insert(predicate.name().to_string(), capacity);
            }
            item.group_capacity.extend(result.group_capacity);
        }

        if let Candidate::Baremetal(_) = candidate.as_ref() {
            item.capacity = item.capacity.min(1);
        }

        if item.capacity <= 0 {
            unit.log.append(candidate.id(), "capacity", "no capacity left");
            return None;
        }
        Some(item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candidate::testing::{baremetal, host};
    use crate::pending_usage::PendingUsageManager;
    use hostsched_api::{Hypervisor, ScheduleInput};

    struct FailingPredicate;

    impl FitPredicate for FailingPredicate {
        fn name(&self) -> &'static str {
            "broken"
        }

        fn check(&self, _: &Unit, candidate: &Candidate) -> Result<PredicateResult, SchedError> {
            if candidate.id() == "h2" {
                return Err(SchedError::Internal("boom".into()));
            }
            Ok(PredicateResult::fit())
        }
    }

    fn candidates() -> Vec<Arc<Candidate>> {
        let mut busy = host("h3", 8, 8192);
        busy.running_cpu = 6;
        vec![
            Arc::new(host("h1", 8, 8192).into()),
            Arc::new(host("h2", 16, 16384).into()),
            Arc::new(busy.into()),
            Arc::new(host("h4", 1, 8192).into()),
        ]
    }

    fn unit(input: ScheduleInput, candidates: &[Arc<Candidate>]) -> Arc<Unit> {
        Arc::new(Unit::new("t1", Arc::new(input), &PendingUsageManager::new(), candidates, vec![]))
    }

    #[test]
    fn test_filters_and_ranks() {
        let scheduler = GenericScheduler::new(2).unwrap();
        let candidates = candidates();
        let unit = unit(
            ScheduleInput {
                vcpu_count: 2,
                memory_mb: 1024,
                ..Default::default()
            },
            &candidates,
        );

        let list = scheduler.schedule(unit.clone(), &candidates);
        let ids: Vec<_> = list.items.iter().map(|i| i.id()).collect();
        assert_eq!(ids, vec!["h2", "h1", "h3"]);
        assert_eq!(list.items[0].capacity, 8);
        assert_eq!(list.items[0].capacity_details["cpu"], 8);
        assert_eq!(list.items[2].capacity, 1);

        let filtered = unit.log.aggregate();
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].predicate, "cpu");
    }

    #[test]
    fn test_ignore_filters() {
        let scheduler = GenericScheduler::new(2).unwrap();
        let candidates = candidates();
        let unit = unit(
            ScheduleInput {
                vcpu_count: 2,
                ignore_filters: ["cpu".to_string()].into_iter().collect(),
                ..Default::default()
            },
            &candidates,
        );
        assert_eq!(scheduler.schedule(unit, &candidates).len(), 4);
    }

    #[test]
    fn test_predicate_error_excludes_candidate_only() {
        let scheduler =
            GenericScheduler::with_plugins(2, vec![Box::new(FailingPredicate)], default_priorities())
                .unwrap();
        let candidates = candidates();
        let unit = unit(ScheduleInput::default(), &candidates);
        let list = scheduler.schedule(unit.clone(), &candidates);
        assert_eq!(list.len(), 3);
        assert!(list.position("h2").is_none());
        assert_eq!(unit.log.drain()[0].reason, "internal error: boom");
    }

    #[test]
    fn test_baremetal_capacity_capped() {
        let scheduler = GenericScheduler::new(1).unwrap();
        let candidates: Vec<Arc<Candidate>> = vec![Arc::new(baremetal("b1").into())];
        let unit = unit(
            ScheduleInput {
                hypervisor: Hypervisor::Baremetal,
                ..Default::default()
            },
            &candidates,
        );
        let list = scheduler.schedule(unit, &candidates);
        assert_eq!(list.items[0].capacity, 1);
    }
}
