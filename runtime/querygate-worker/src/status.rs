//! Per-batch task status, shared between the scheduler and whoever renders it.

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::task::TaskStatus;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusSnapshot {
    pub index: usize,
    pub name: String,
    pub label: String,
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elapsed_ms: Option<u64>,
}

struct Entry {
    name: String,
    label: String,
    status: TaskStatus,
    started: Option<Instant>,
    finished: Option<Instant>,
}

/// One lock for the whole batch. Every accepted transition bumps a version
/// on a watch channel so observers can re-render.
pub struct StatusBoard {
    entries: Mutex<Vec<Entry>>,
    version: watch::Sender<u64>,
}

impl StatusBoard {
    pub fn new<I>(tasks: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let entries = tasks
            .into_iter()
            .map(|(name, label)| Entry {
                name,
                label,
                status: TaskStatus::Pending,
                started: None,
                finished: None,
            })
            .collect();
        let (version, _) = watch::channel(0);
        Self {
            entries: Mutex::new(entries),
            version,
        }
    }

    /// Applies `next` if it moves the task forward. Returns false (and changes
    /// nothing) for unknown indices and backward or repeated transitions.
    pub fn transition(&self, index: usize, next: TaskStatus) -> bool {
        let now = Instant::now();
        {
            let mut entries = self.entries.lock();
            let Some(entry) = entries.get_mut(index) else {
                return false;
            };
            if !entry.status.can_transition_to(next) {
                tracing::trace!(task = %entry.name, from = %entry.status, to = %next, "ignored transition");
                return false;
            }
            entry.status = next;
            match next {
                TaskStatus::Running => entry.started = Some(now),
                status if status.is_terminal() => entry.finished = Some(now),
                _ => {}
            }
        }
        self.version.send_modify(|version| *version += 1);
        true
    }

    pub fn status(&self, index: usize) -> Option<TaskStatus> {
        self.entries.lock().get(index).map(|entry| entry.status)
    }

    /// Current state of every task in submission order.
    pub fn snapshot(&self) -> Vec<StatusSnapshot> {
        let now = Instant::now();
        self.entries
            .lock()
            .iter()
            .enumerate()
            .map(|(index, entry)| StatusSnapshot {
                index,
                name: entry.name.clone(),
                label: entry.label.clone(),
                status: entry.status,
                elapsed_ms: entry.started.map(|started| {
                    let end = entry.finished.unwrap_or(now);
                    u64::try_from(end.duration_since(started).as_millis()).unwrap_or(u64::MAX)
                }),
            })
            .collect()
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.version.subscribe()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn all_terminal(&self) -> bool {
        self.entries.lock().iter().all(|entry| entry.status.is_terminal())
    }
}
