//! In-memory log of recent schedule calls.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use hostsched_api::{ScheduleInput, ScheduleOutput};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryItem {
    pub task_id: String,
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    pub elapsed_ms: u64,
    pub input: ScheduleInput,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<ScheduleOutput>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl HistoryItem {
    pub fn is_suggestion(&self) -> bool {
        self.input.suggestion
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryPage {
    pub total: usize,
    pub offset: usize,
    pub items: Vec<HistoryItem>,
}

#[derive(Default)]
struct Rings {
    all: VecDeque<HistoryItem>,
    normal: VecDeque<HistoryItem>,
}

/// Two bounded rings, newest first: every call, and calls that reserved
/// capacity (not suggestions).
pub struct HistoryManager {
    capacity: usize,
    rings: RwLock<Rings>,
}

impl HistoryManager {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            rings: RwLock::new(Rings::default()),
        }
    }

    pub fn record(&self, item: HistoryItem) {
        let mut rings = self.rings.write();
        if !item.is_suggestion() {
            push_bounded(&mut rings.normal, item.clone(), self.capacity);
        }
        push_bounded(&mut rings.all, item, self.capacity);
    }

    /// A page of history, newest first. `all` includes suggestions.
    pub fn list(&self, all: bool, offset: usize, limit: usize) -> HistoryPage {
        let rings = self.rings.read();
        let ring = if all { &rings.all } else { &rings.normal };
        HistoryPage {
            total: ring.len(),
            offset,
            items: ring.iter().skip(offset).take(limit).cloned().collect(),
        }
    }

    /// Suggestions can push a call out of `all` while `normal` still lists it.
    pub fn get(&self, task_id: &str) -> Option<HistoryItem> {
        let rings = self.rings.read();
        rings
            .all
            .iter()
            .chain(rings.normal.iter())
            .find(|item| item.task_id == task_id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.rings.read().all.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn push_bounded(ring: &mut VecDeque<HistoryItem>, item: HistoryItem, capacity: usize) {
    ring.push_front(item);
    ring.truncate(capacity);
}
