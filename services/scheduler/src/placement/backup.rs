//! Master/backup pairing for HA servers.
//!
//! Master and backup must be reachable over a common wire. Pairs are chosen
//! greedily: each server takes the best wire group available at its turn and
//! commits before the next server is placed.

use hostsched_api::ScheduleResultEntry;

use super::{is_named, resource, ERR_NO_BACKUP, ERR_NO_MASTER};
use crate::generic::{SchedResultItem, SchedResultItemList};

/// Candidate indexes grouped by wire, wires in first-seen order.
fn wire_groups(items: &[SchedResultItem]) -> Vec<(String, Vec<usize>)> {
    let mut groups: Vec<(String, Vec<usize>)> = Vec::new();
    for (idx, item) in items.iter().enumerate() {
        for wire in item.candidate.wire_ids() {
            match groups.iter_mut().find(|(w, _)| w == wire) {
                Some((_, members)) => members.push(idx),
                None => groups.push((wire.to_string(), vec![idx])),
            }
        }
    }
    groups
}

fn pick_in_group(
    items: &[SchedResultItem],
    members: &[usize],
    prefer: Option<&str>,
    avoid: Option<usize>,
) -> Option<usize> {
    let usable = |idx: &&usize| items[**idx].has_room() && Some(**idx) != avoid;
    match prefer {
        Some(name) => members
            .iter()
            .filter(usable)
            .find(|idx| is_named(&items[**idx], name))
            .copied(),
        None => members.iter().find(usable).copied(),
    }
}

/// Choose (master, backup) indexes for one HA server.
///
/// Within each wire group the master is the preferred master host, or else
/// the first candidate with room that is not the preferred backup host; the
/// backup is the preferred backup host, or else the first other candidate
/// with room. The group whose pair has the largest remaining room wins; the
/// earliest wire wins ties.
pub fn select_hosts(
    items: &[SchedResultItem],
    prefer_master: Option<&str>,
    prefer_backup: Option<&str>,
) -> Result<(usize, usize), &'static str> {
    let mut found_master = false;
    let mut best: Option<(usize, usize, i64)> = None;

    for (_, members) in wire_groups(items) {
        let master = match prefer_master {
            Some(_) => pick_in_group(items, &members, prefer_master, None),
            None => members
                .iter()
                .find(|idx| {
                    items[**idx].has_room()
                        && !prefer_backup.is_some_and(|b| is_named(&items[**idx], b))
                })
                .copied(),
        };
        let Some(master) = master else {
            continue;
        };
        found_master = true;

        let Some(backup) = pick_in_group(items, &members, prefer_backup, Some(master)) else {
            continue;
        };

        let room = items[master].remaining().saturating_add(items[backup].remaining());
        if best.is_none_or(|(_, _, best_room)| room > best_room) {
            best = Some((master, backup, room));
        }
    }

    match best {
        Some((master, backup, _)) => Ok((master, backup)),
        None if found_master => Err(ERR_NO_BACKUP),
        None => Err(ERR_NO_MASTER),
    }
}

/// Place `count` HA servers, one master/backup pair each.
pub fn get_sched_backup_result(
    list: &mut SchedResultItemList,
    count: i64,
    session_id: &str,
) -> Vec<ScheduleResultEntry> {
    let unit = list.unit.clone();
    let prefer_master = unit.input.prefer_host.as_deref();
    let prefer_backup = unit.input.prefer_backup_host.as_deref();

    (0..count.max(0))
        .map(|_| match select_hosts(&list.items, prefer_master, prefer_backup) {
            Ok((master, backup)) => {
                list.items[master].count += 1;
                list.items[backup].backup_count += 1;
                resource(
                    &unit,
                    session_id,
                    &list.items[master],
                    Some(&list.items[backup]),
                )
            }
            Err(reason) => ScheduleResultEntry::error(reason),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candidate::testing::host_on_wire;
    use crate::placement::testing::list;
    use hostsched_api::ScheduleInput;
    use proptest::prelude::*;

    fn ha_input() -> ScheduleInput {
        ScheduleInput {
            backup: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_pair_from_only_viable_wire() {
        let mut list = list(
            ha_input(),
            vec![
                (host_on_wire("a", 8, 8192, "w1"), 2),
                (host_on_wire("b", 8, 8192, "w2"), 2),
                (host_on_wire("c", 8, 8192, "w2"), 2),
            ],
            vec![],
        );
        let entries = get_sched_backup_result(&mut list, 1, "s1");
        let pair = entries[0].candidate().unwrap();
        assert_eq!(pair.host.id, "b");
        assert_eq!(pair.backup.as_ref().unwrap().id, "c");
    }

    #[test]
    fn test_no_pair_errors() {
        let single = list(ha_input(), vec![(host_on_wire("a", 8, 8192, "w1"), 2)], vec![]);
        assert_eq!(select_hosts(&single.items, None, None), Err(ERR_NO_BACKUP));

        let full = list(
            ha_input(),
            vec![
                (host_on_wire("a", 8, 8192, "w1"), 0),
                (host_on_wire("b", 8, 8192, "w1"), 0),
            ],
            vec![],
        );
        assert_eq!(select_hosts(&full.items, None, None), Err(ERR_NO_MASTER));
    }

    #[test]
    fn test_prefer_hosts_respected() {
        let items = list(
            ha_input(),
            vec![
                (host_on_wire("a", 8, 8192, "w1"), 2),
                (host_on_wire("b", 8, 8192, "w1"), 2),
                (host_on_wire("c", 8, 8192, "w1"), 2),
            ],
            vec![],
        )
        .items;
        assert_eq!(select_hosts(&items, None, Some("a")), Ok((1, 0)));
        assert_eq!(select_hosts(&items, Some("c"), None), Ok((2, 0)));
        assert_eq!(select_hosts(&items, Some("c"), Some("b")), Ok((2, 1)));
        assert_eq!(select_hosts(&items, Some("zzz"), None), Err(ERR_NO_MASTER));
    }

    #[test]
    fn test_largest_room_wins() {
        let items = list(
            ha_input(),
            vec![
                (host_on_wire("a", 8, 8192, "w1"), 1),
                (host_on_wire("b", 8, 8192, "w1"), 1),
                (host_on_wire("c", 8, 8192, "w2"), 5),
                (host_on_wire("d", 8, 8192, "w2"), 5),
            ],
            vec![],
        )
        .items;
        assert_eq!(select_hosts(&items, None, None), Ok((2, 3)));
    }

    #[test]
    fn test_pairs_consume_capacity() {
        let mut list = list(
            ha_input(),
            vec![
                (host_on_wire("a", 8, 8192, "w1"), 1),
                (host_on_wire("b", 8, 8192, "w1"), 1),
            ],
            vec![],
        );
        let entries = get_sched_backup_result(&mut list, 2, "s1");
        assert!(!entries[0].is_error());
        assert_eq!(entries[1], ScheduleResultEntry::error(ERR_NO_MASTER));
    }

    proptest! {
        #[test]
        fn master_and_backup_differ(
            caps in proptest::collection::vec((0i64..3, 0usize..3), 1..8),
            count in 1i64..6,
        ) {
            let hosts = caps
                .iter()
                .enumerate()
                .map(|(i, (cap, wire))| (host_on_wire(&format!("h{i}"), 8, 8192, &format!("w{wire}")), *cap))
                .collect();
            let mut list = list(ha_input(), hosts, vec![]);
            let entries = get_sched_backup_result(&mut list, count, "s1");
            prop_assert_eq!(entries.len(), count as usize);
            for entry in entries.iter().filter_map(|e| e.candidate()) {
                let backup = entry.backup.as_ref().unwrap();
                prop_assert_ne!(&entry.host.id, &backup.id);
            }
            for item in &list.items {
                prop_assert!(item.count + item.backup_count <= item.capacity);
            }
        }
    }
}
