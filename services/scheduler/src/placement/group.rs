//! Instance-group aware placement.
//!
//! Each result item tracks how many more guests of every requested group it
//! may take. Hosts are tried least-used first so group members spread before
//! any host is packed. A backup guest adds an implicit forced group of
//! granularity one with its master, so the pair never shares a host.

use hostsched_api::ScheduleResultEntry;

use super::{is_named, resource, ERR_NO_BACKUP, ERR_NO_MASTER, ERR_OUT_OF_RESOURCE};
use crate::candidate::InstanceGroup;
use crate::generic::{SchedResultItem, SchedResultItemList};

/// Constraints for one host pick.
struct Selection<'a> {
    groups: &'a [InstanceGroup],
    /// Treat every group as force-dispersion.
    forced: bool,
    prefer: Option<&'a str>,
    exclude: Option<usize>,
    /// The pick must share a wire with this item.
    same_wire_as: Option<usize>,
}

/// Item indexes sorted by primary or backup count ascending, then room
/// descending, then rank.
fn order(items: &[SchedResultItem], backup: bool) -> Vec<usize> {
    let mut idx: Vec<usize> = (0..items.len()).collect();
    idx.sort_by(|a, b| {
        let (ia, ib) = (&items[*a], &items[*b]);
        let (ca, cb) = if backup {
            (ia.backup_count, ib.backup_count)
        } else {
            (ia.count, ib.count)
        };
        ca.cmp(&cb)
            .then_with(|| ib.remaining().cmp(&ia.remaining()))
            .then_with(|| ia.rank_cmp(ib))
    });
    idx
}

fn eligible(items: &[SchedResultItem], idx: usize, sel: &Selection<'_>) -> bool {
    let item = &items[idx];
    if !item.has_room() || sel.exclude == Some(idx) {
        return false;
    }
    if let Some(master) = sel.same_wire_as {
        let wires = items[master].candidate.wire_ids();
        if !wires.iter().any(|w| item.candidate.on_wire(w)) {
            return false;
        }
    }
    sel.groups.iter().all(|group| {
        let exhausted = item.group_remaining(&group.id).is_some_and(|left| left <= 0);
        !(exhausted && (sel.forced || group.force_dispersion))
    })
}

fn select_host(items: &[SchedResultItem], sorted: &[usize], sel: &Selection<'_>) -> Option<usize> {
    if let Some(prefer) = sel.prefer {
        if let Some(idx) = sorted
            .iter()
            .copied()
            .find(|idx| is_named(&items[*idx], prefer) && eligible(items, *idx, sel))
        {
            return Some(idx);
        }
    }
    sorted.iter().copied().find(|idx| eligible(items, *idx, sel))
}

fn group_ids(groups: &[InstanceGroup]) -> impl Iterator<Item = &str> {
    groups.iter().map(|g| g.id.as_str())
}

/// Place `count` servers honoring the requested instance groups, with a
/// backup pick per server when the request asks for HA.
pub fn get_group_sched_result(
    list: &mut SchedResultItemList,
    count: i64,
    session_id: &str,
) -> Vec<ScheduleResultEntry> {
    let unit = list.unit.clone();
    let groups: Vec<InstanceGroup> = unit
        .input
        .instance_group_ids
        .iter()
        .filter_map(|id| unit.instance_group(id).cloned())
        .collect();
    let backup = unit.input.backup;
    let items = &mut list.items;
    let mut entries = Vec::new();

    for _ in 0..count.max(0) {
        let master = select_host(
            items,
            &order(items, false),
            &Selection {
                groups: &groups,
                forced: false,
                prefer: unit.input.prefer_host.as_deref(),
                exclude: None,
                same_wire_as: None,
            },
        );
        let Some(master) = master else {
            entries.push(ScheduleResultEntry::error(if backup {
                ERR_NO_MASTER
            } else {
                ERR_OUT_OF_RESOURCE
            }));
            continue;
        };
        items[master].count += 1;
        items[master].consume_groups(group_ids(&groups));

        if !backup {
            entries.push(resource(&unit, session_id, &items[master], None));
            continue;
        }

        let picked = select_host(
            items,
            &order(items, true),
            &Selection {
                groups: &groups,
                forced: true,
                prefer: unit.input.prefer_backup_host.as_deref(),
                exclude: Some(master),
                same_wire_as: Some(master),
            },
        );
        match picked {
            Some(backup_idx) => {
                items[backup_idx].backup_count += 1;
                items[backup_idx].consume_groups(group_ids(&groups));
                entries.push(resource(
                    &unit,
                    session_id,
                    &items[master],
                    Some(&items[backup_idx]),
                ));
            }
            None => {
                items[master].count -= 1;
                items[master].release_groups(group_ids(&groups));
                entries.push(ScheduleResultEntry::error(ERR_NO_BACKUP));
            }
        }
    }

    entries
}
