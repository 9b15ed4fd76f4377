//! Soft ranking.

use hostsched_api::SchedtagStrategy;

use crate::candidate::Candidate;
use crate::unit::Unit;

pub trait Priority: Send + Sync {
    fn name(&self) -> &'static str;

    fn weight(&self) -> i64 {
        1
    }

    fn score(&self, unit: &Unit, candidate: &Candidate) -> i64;
}

pub fn default_priorities() -> Vec<Box<dyn Priority>> {
    vec![
        Box::new(LeastAllocatedPriority),
        Box::new(SchedtagPriority),
        Box::new(InstanceGroupPriority),
        Box::new(PreferHostPriority),
    ]
}

/// Weighted sum of every priority.
pub fn total_score(priorities: &[Box<dyn Priority>], unit: &Unit, candidate: &Candidate) -> i64 {
    priorities
        .iter()
        .map(|p| p.weight().saturating_mul(p.score(unit, candidate)))
        .fold(0i64, i64::saturating_add)
}

/// Prefers candidates left with the most free CPU and memory, 0..=100.
pub struct LeastAllocatedPriority;

impl LeastAllocatedPriority {
    fn ratio(free: i64, request: i64, total: i64) -> i64 {
        if total <= 0 {
            return 0;
        }
        ((free - request).max(0) * 100 / total).clamp(0, 100)
    }
}

impl Priority for LeastAllocatedPriority {
    fn name(&self) -> &'static str {
        "least_allocated"
    }

    fn score(&self, unit: &Unit, candidate: &Candidate) -> i64 {
        let getter = unit.getter(candidate);
        let cpu = Self::ratio(getter.free_cpu(), unit.input.vcpu_count, getter.total_cpu());
        let mem = Self::ratio(
            getter.free_memory_mb(),
            unit.input.memory_mb,
            getter.total_memory_mb(),
        );
        (cpu + mem) / 2
    }
}

pub struct SchedtagPriority;

impl Priority for SchedtagPriority {
    fn name(&self) -> &'static str {
        "schedtag"
    }

    fn score(&self, unit: &Unit, candidate: &Candidate) -> i64 {
        unit.input
            .schedtags
            .iter()
            .filter(|tag| candidate.has_schedtag(&tag.id))
            .map(|tag| match tag.strategy {
                SchedtagStrategy::Prefer => 100,
                SchedtagStrategy::Avoid => -100,
                SchedtagStrategy::Require | SchedtagStrategy::Exclude => 0,
            })
            .sum()
    }
}

/// Spreads group members: every guest already in a requested group costs 10.
pub struct InstanceGroupPriority;

impl Priority for InstanceGroupPriority {
    fn name(&self) -> &'static str {
        "instance_group"
    }

    fn score(&self, unit: &Unit, candidate: &Candidate) -> i64 {
        let getter = unit.getter(candidate);
        -unit
            .input
            .instance_group_ids
            .iter()
            .map(|id| getter.instance_group_guests(id) * 10)
            .sum::<i64>()
    }
}

pub struct PreferHostPriority;

impl Priority for PreferHostPriority {
    fn name(&self) -> &'static str {
        "prefer_host"
    }

    fn score(&self, unit: &Unit, candidate: &Candidate) -> i64 {
        match unit.input.prefer_host.as_deref() {
            Some(prefer) if prefer == candidate.id() || prefer == candidate.name() => 1000,
            _ => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candidate::testing::host;
    use crate::pending_usage::PendingUsageManager;
    use hostsched_api::ScheduleInput;
    use std::sync::Arc;

    fn unit(input: ScheduleInput) -> Unit {
        Unit::new("t1", Arc::new(input), &PendingUsageManager::new(), &[], vec![])
    }

    #[test]
    fn test_least_allocated_prefers_emptier_hosts() {
        let unit = unit(ScheduleInput {
            vcpu_count: 2,
            memory_mb: 1024,
            ..Default::default()
        });
        let empty: Candidate = host("h1", 16, 16384).into();
        let mut busy = host("h2", 16, 16384);
        busy.running_cpu = 12;
        busy.running_mem_mb = 12288;
        let busy: Candidate = busy.into();

        let a = LeastAllocatedPriority.score(&unit, &empty);
        let b = LeastAllocatedPriority.score(&unit, &busy);
        assert!(a > b);
        assert!((0..=100).contains(&a));
    }

    #[test]
    fn test_schedtag_prefer_and_avoid() {
        let unit = unit(ScheduleInput {
            schedtags: vec!["ssd:prefer".parse().unwrap(), "old:avoid".parse().unwrap()],
            ..Default::default()
        });
        let mut h = host("h1", 4, 1024);
        h.schedtags = vec!["ssd".into(), "old".into()];
        assert_eq!(SchedtagPriority.score(&unit, &h.clone().into()), 0);
        h.schedtags = vec!["ssd".into()];
        assert_eq!(SchedtagPriority.score(&unit, &h.into()), 100);
    }

    #[test]
    fn test_prefer_host_by_id_or_name() {
        let unit = unit(ScheduleInput {
            prefer_host: Some("h2-name".into()),
            ..Default::default()
        });
        assert_eq!(PreferHostPriority.score(&unit, &host("h2", 4, 1024).into()), 1000);
        assert_eq!(PreferHostPriority.score(&unit, &host("h1", 4, 1024).into()), 0);

        let total = total_score(&default_priorities(), &unit, &host("h2", 4, 1024).into());
        assert!(total >= 1000);
    }
}
