//! Turns a ranked result list into concrete per-server assignments.
//!
//! Placement of one request is single threaded. Every pick bumps the chosen
//! item's `count` (or `backup_count`) before the next server is placed, so
//! later servers see the reduced room.

mod backup;
mod group;
mod region;

use hostsched_api::{CandidateResource, HostPick, ScheduleResultEntry};

use crate::generic::{SchedResultItem, SchedResultItemList};
use crate::unit::Unit;

pub use backup::{get_sched_backup_result, select_hosts};
pub use group::get_group_sched_result;
pub use region::trans_to_region_sched_result;

pub const ERR_OUT_OF_RESOURCE: &str = "Out of resource";
pub const ERR_NO_MASTER: &str = "Can't find master host";
pub const ERR_NO_BACKUP: &str = "Can't find backup host";

/// Pick the algorithm the request needs and place `count` servers.
pub fn place(list: &mut SchedResultItemList, count: i64, session_id: &str) -> Vec<ScheduleResultEntry> {
    let input = list.unit.input.clone();
    match (input.backup, input.instance_group_ids.is_empty()) {
        (false, true) => trans_to_region_sched_result(list, count, session_id),
        (true, true) => get_sched_backup_result(list, count, session_id),
        (_, false) => get_group_sched_result(list, count, session_id),
    }
}

/// Build the pick for one server landing on `item`.
///
/// Each disk goes to the backend storage with the most free space, each NIC
/// to the requested network or the freest one on the requested wire.
pub(crate) fn host_pick(unit: &Unit, item: &SchedResultItem) -> HostPick {
    let candidate = item.candidate.as_ref();
    let getter = unit.getter(candidate);

    let storage_ids = unit
        .input
        .disks
        .iter()
        .filter_map(|disk| getter.best_storage(&disk.backend).map(|(s, _)| s.id.clone()))
        .collect();

    // Predicates already proved an assignment exists.
    let network_ids = unit.assign_networks(candidate).unwrap_or_default();

    HostPick {
        id: candidate.id().to_string(),
        name: candidate.name().to_string(),
        res_type: candidate.res_type(),
        zone_id: candidate.zone_id().map(str::to_string),
        storage_ids,
        network_ids,
    }
}

pub(crate) fn resource(
    unit: &Unit,
    session_id: &str,
    master: &SchedResultItem,
    backup: Option<&SchedResultItem>,
) -> ScheduleResultEntry {
    ScheduleResultEntry::Candidate(CandidateResource {
        session_id: session_id.to_string(),
        host: host_pick(unit, master),
        backup: backup.map(|b| host_pick(unit, b)),
    })
}

/// Whether `id_or_name` names the candidate behind `item`.
pub(crate) fn is_named(item: &SchedResultItem, id_or_name: &str) -> bool {
    item.id() == id_or_name || item.candidate.name() == id_or_name
}
