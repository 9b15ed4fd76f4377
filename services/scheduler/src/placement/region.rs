use hostsched_api::ScheduleResultEntry;

use super::{resource, ERR_OUT_OF_RESOURCE};
use crate::generic::SchedResultItemList;

/// Fill servers onto candidates in rank order.
///
/// Always returns exactly `count` entries; servers that do not fit become
/// "Out of resource" errors.
pub fn trans_to_region_sched_result(
    list: &mut SchedResultItemList,
    count: i64,
    session_id: &str,
) -> Vec<ScheduleResultEntry> {
    let wanted = usize::try_from(count).unwrap_or(0);
    let mut entries = Vec::with_capacity(wanted);
    let unit = list.unit.clone();

    for item in list.items.iter_mut() {
        while entries.len() < wanted && item.has_room() {
            item.count += 1;
            entries.push(resource(&unit, session_id, item, None));
        }
        if entries.len() == wanted {
            break;
        }
    }

    while entries.len() < wanted {
        entries.push(ScheduleResultEntry::error(ERR_OUT_OF_RESOURCE));
    }
    entries
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candidate::testing::host;
    use crate::placement::testing::list;
    use hostsched_api::ScheduleInput;
    use proptest::prelude::*;
    use rstest::rstest;

    #[test]
    fn test_three_servers_on_two_hosts_of_two() {
        let mut list = list(
            ScheduleInput::default(),
            vec![(host("a", 8, 8192), 2), (host("b", 8, 8192), 2)],
            vec![],
        );
        let entries = trans_to_region_sched_result(&mut list, 3, "s1");
        assert_eq!(entries.len(), 3);
        assert!(entries.iter().all(|e| !e.is_error()));

        let ids: Vec<_> = entries
            .iter()
            .filter_map(|e| e.candidate())
            .map(|c| c.host.id.as_str())
            .collect();
        assert_eq!(ids, vec!["a", "a", "b"]);
        assert_eq!(list.items[0].count, 2);
        assert_eq!(list.items[1].count, 1);
    }

    #[rstest]
    #[case(0, 0)]
    #[case(4, 0)]
    #[case(6, 2)]
    fn test_out_of_resource_padding(#[case] count: i64, #[case] errors: usize) {
        let mut list = list(
            ScheduleInput::default(),
            vec![(host("a", 8, 8192), 3), (host("b", 8, 8192), 1)],
            vec![],
        );
        let entries = trans_to_region_sched_result(&mut list, count, "s1");
        assert_eq!(entries.len(), count as usize);
        assert_eq!(entries.iter().filter(|e| e.is_error()).count(), errors);
    }

    proptest! {
        #[test]
        fn result_is_complete_and_within_capacity(
            capacities in proptest::collection::vec(1i64..5, 0..6),
            count in 0i64..20,
        ) {
            let hosts = capacities
                .iter()
                .enumerate()
                .map(|(i, c)| (host(&format!("h{i}"), 8, 8192), *c))
                .collect();
            let mut list = list(ScheduleInput::default(), hosts, vec![]);
            let entries = trans_to_region_sched_result(&mut list, count, "s1");

            prop_assert_eq!(entries.len(), count as usize);
            for item in &list.items {
                prop_assert!(item.count <= item.capacity);
            }
            let total: i64 = capacities.iter().sum();
            let ok = entries.iter().filter(|e| !e.is_error()).count() as i64;
            prop_assert_eq!(ok, count.min(total));
        }
    }
}
