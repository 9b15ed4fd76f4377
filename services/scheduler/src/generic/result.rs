use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;

use hostsched_api::ForecastCandidate;

use crate::candidate::Candidate;
use crate::unit::Unit;

/// Capacity of a candidate no predicate put a bound on.
pub const UNBOUNDED_CAPACITY: i64 = i64::MAX;

/// One surviving candidate of a scheduling run.
///
/// `capacity` is fixed when the item is built; placement consumes it by
/// raising `count` (primary picks) and `backup_count` (backup picks).
#[derive(Debug, Clone)]
pub struct SchedResultItem {
    pub candidate: Arc<Candidate>,
    pub capacity: i64,
    pub count: i64,
    pub backup_count: i64,
    pub score: i64,
    /// Capacity each predicate allowed.
    pub capacity_details: BTreeMap<String, i64>,
    /// Guests each requested instance group may still add here.
    pub group_capacity: BTreeMap<String, i64>,
}

impl SchedResultItem {
    pub fn new(candidate: Arc<Candidate>, capacity: i64) -> Self {
        Self {
            candidate,
            capacity,
            count: 0,
            backup_count: 0,
            score: 0,
            capacity_details: BTreeMap::new(),
            group_capacity: BTreeMap::new(),
        }
    }

    pub fn id(&self) -> &str {
        self.candidate.id()
    }

    /// Slots not yet handed out in this placement pass.
    pub fn remaining(&self) -> i64 {
        self.capacity
            .saturating_sub(self.count)
            .saturating_sub(self.backup_count)
    }

    pub fn has_room(&self) -> bool {
        self.remaining() > 0
    }

    pub fn group_remaining(&self, group_id: &str) -> Option<i64> {
        self.group_capacity.get(group_id).copied()
    }

    pub(crate) fn consume_groups<'a>(&mut self, group_ids: impl IntoIterator<Item = &'a str>) {
        for id in group_ids {
            if let Some(left) = self.group_capacity.get_mut(id) {
                *left = (*left - 1).max(0);
            }
        }
    }

    pub(crate) fn release_groups<'a>(&mut self, group_ids: impl IntoIterator<Item = &'a str>) {
        for id in group_ids {
            if let Some(left) = self.group_capacity.get_mut(id) {
                *left += 1;
            }
        }
    }

    /// Rank order: score desc, capacity desc, id asc.
    pub fn rank_cmp(&self, other: &Self) -> Ordering {
        other
            .score
            .cmp(&self.score)
            .then_with(|| other.capacity.cmp(&self.capacity))
            .then_with(|| self.id().cmp(other.id()))
    }

    pub fn to_forecast(&self) -> ForecastCandidate {
        ForecastCandidate {
            id: self.id().to_string(),
            name: self.candidate.name().to_string(),
            capacity: self.capacity,
            score: self.score,
            capacity_details: self.capacity_details.clone(),
        }
    }
}

/// Ranked result of a scheduling run, tied to the unit it was computed for.
#[derive(Debug, Clone)]
pub struct SchedResultItemList {
    pub unit: Arc<Unit>,
    pub items: Vec<SchedResultItem>,
}

impl SchedResultItemList {
    pub fn new(unit: Arc<Unit>, mut items: Vec<SchedResultItem>) -> Self {
        items.sort_by(SchedResultItem::rank_cmp);
        Self { unit, items }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Fold another run of the same request into this one and re-rank.
    pub fn merge(&mut self, other: SchedResultItemList) {
        if !Arc::ptr_eq(&self.unit, &other.unit) {
            self.unit.log.extend(other.unit.log.drain());
        }
        self.items.extend(other.items);
        self.sort_by_rank();
    }

    pub fn sort_by_rank(&mut self) {
        self.items.sort_by(SchedResultItem::rank_cmp);
    }

    /// Total capacity, counting an unbounded candidate once.
    pub fn total_capacity(&self) -> i64 {
        self.items
            .iter()
            .fold(0i64, |acc, item| acc.saturating_add(item.capacity))
    }

    pub fn position(&self, id: &str) -> Option<usize> {
        self.items.iter().position(|item| item.id() == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candidate::testing::host;
    use crate::pending_usage::PendingUsageManager;
    use hostsched_api::ScheduleInput;

    fn unit() -> Arc<Unit> {
        Arc::new(Unit::new(
            "t1",
            Arc::new(ScheduleInput::default()),
            &PendingUsageManager::new(),
            &[],
            vec![],
        ))
    }

    fn item(id: &str, capacity: i64, score: i64) -> SchedResultItem {
        let mut item = SchedResultItem::new(Arc::new(Candidate::from(host(id, 8, 1024))), capacity);
        item.score = score;
        item
    }

    #[test]
    fn test_rank_order() {
        let list = SchedResultItemList::new(
            unit(),
            vec![item("c", 5, 10), item("b", 5, 10), item("a", 9, 10), item("d", 1, 50)],
        );
        let ids: Vec<_> = list.items.iter().map(|i| i.id()).collect();
        assert_eq!(ids, vec!["d", "a", "b", "c"]);
    }

    #[test]
    fn test_merge_reranks_and_moves_logs() {
        let first = unit();
        let second = unit();
        second.log.append("x", "cpu", "no enough cpu");

        let mut list = SchedResultItemList::new(first.clone(), vec![item("a", 1, 0)]);
        list.merge(SchedResultItemList::new(second, vec![item("b", 1, 5)]));
        assert_eq!(list.items[0].id(), "b");
        assert_eq!(first.log.len(), 1);
    }

    #[test]
    fn test_remaining_counts_primary_and_backup() {
        let mut a = item("a", 3, 0);
        a.count = 2;
        assert_eq!(a.remaining(), 1);
        a.backup_count = 1;
        assert_eq!(a.remaining(), 0);
        assert!(!a.has_room());
    }

    #[test]
    fn test_unbounded_capacity_saturates() {
        let list = SchedResultItemList::new(
            unit(),
            vec![item("a", UNBOUNDED_CAPACITY, 0), item("b", 4, 0)],
        );
        assert_eq!(list.total_capacity(), UNBOUNDED_CAPACITY);
    }
}
