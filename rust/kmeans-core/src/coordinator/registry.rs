// rust/kmeans-core/src/coordinator/registry.rs

//! Worker membership and liveness.

use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::model::WorkerId;

/// Liveness of a registered worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    Active,
    /// Missed one liveness deadline. A second miss makes it dead.
    Slow,
    Dead,
}

#[derive(Debug, Clone)]
pub struct WorkerRecord {
    pub id: WorkerId,
    pub joined_at: DateTime<Utc>,
    pub last_seen: Instant,
    pub status: WorkerStatus,
}

/// Tracks every worker that has joined and not yet died.
///
/// Ids are assigned from a counter and never reused, even after a worker
/// is removed.
#[derive(Debug, Default)]
pub struct WorkerRegistry {
    workers: BTreeMap<WorkerId, WorkerRecord>,
    next_id: WorkerId,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new worker and return its id.
    pub fn join(&mut self, now: Instant) -> WorkerId {
        let id = self.next_id;
        self.next_id += 1;
        self.workers.insert(
            id,
            WorkerRecord {
                id,
                joined_at: Utc::now(),
                last_seen: now,
                status: WorkerStatus::Active,
            },
        );
        info!(worker_id = id, workers = self.workers.len(), "Worker joined");
        id
    }

    /// Record activity from `id`. A slow worker becomes active again.
    ///
    /// Returns false for unknown (or removed) workers.
    pub fn mark_seen(&mut self, id: WorkerId, now: Instant) -> bool {
        let Some(record) = self.workers.get_mut(&id) else {
            return false;
        };
        record.last_seen = now;
        if record.status == WorkerStatus::Slow {
            debug!(worker_id = id, "Worker recovered");
            record.status = WorkerStatus::Active;
        }
        true
    }

    /// Demote a worker one step: active to slow, slow to dead.
    ///
    /// Dead workers are removed. Returns the new status, or `None` for an
    /// unknown id.
    pub fn mark_timed_out(&mut self, id: WorkerId) -> Option<WorkerStatus> {
        let record = self.workers.get_mut(&id)?;
        match record.status {
            WorkerStatus::Active => {
                warn!(worker_id = id, "Worker is slow");
                record.status = WorkerStatus::Slow;
                Some(WorkerStatus::Slow)
            }
            WorkerStatus::Slow | WorkerStatus::Dead => {
                self.remove_dead(id);
                Some(WorkerStatus::Dead)
            }
        }
    }

    /// Remove a worker regardless of its current status.
    pub fn mark_dead(&mut self, id: WorkerId) -> bool {
        if self.workers.contains_key(&id) {
            self.remove_dead(id);
            true
        } else {
            false
        }
    }

    fn remove_dead(&mut self, id: WorkerId) {
        self.workers.remove(&id);
        warn!(worker_id = id, workers = self.workers.len(), "Worker is dead");
    }

    /// Time out every worker silent for longer than `timeout`.
    ///
    /// The silence timer restarts after each miss, so a worker needs two
    /// consecutive misses to be removed. Returns the ids that died.
    pub fn sweep(&mut self, now: Instant, timeout: Duration) -> Vec<WorkerId> {
        let overdue: Vec<WorkerId> = self
            .workers
            .values()
            .filter(|r| now.saturating_duration_since(r.last_seen) > timeout)
            .map(|r| r.id)
            .collect();

        let mut dead = Vec::new();
        for id in overdue {
            match self.mark_timed_out(id) {
                Some(WorkerStatus::Dead) => dead.push(id),
                Some(_) => {
                    if let Some(record) = self.workers.get_mut(&id) {
                        record.last_seen = now;
                    }
                }
                None => {}
            }
        }
        dead
    }

    /// Ids of workers currently marked active.
    pub fn active_workers(&self) -> BTreeSet<WorkerId> {
        self.workers
            .values()
            .filter(|r| r.status == WorkerStatus::Active)
            .map(|r| r.id)
            .collect()
    }

    pub fn status(&self, id: WorkerId) -> Option<WorkerStatus> {
        self.workers.get(&id).map(|r| r.status)
    }

    /// True for ids that were handed out and have since been removed.
    pub fn was_removed(&self, id: WorkerId) -> bool {
        id < self.next_id && !self.workers.contains_key(&id)
    }

    pub fn contains(&self, id: WorkerId) -> bool {
        self.workers.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_unique_and_never_reused() {
        let now = Instant::now();
        let mut registry = WorkerRegistry::new();
        let a = registry.join(now);
        let b = registry.join(now);
        assert_ne!(a, b);

        assert!(registry.mark_dead(a));
        let c = registry.join(now);
        assert_ne!(c, a);
        assert_ne!(c, b);
        assert_eq!(registry.len(), 2);

        assert!(registry.was_removed(a));
        assert!(!registry.was_removed(b));
        assert!(!registry.was_removed(c + 1));
    }

    #[test]
    fn test_timeout_transitions() {
        let now = Instant::now();
        let mut registry = WorkerRegistry::new();
        let id = registry.join(now);

        assert_eq!(registry.mark_timed_out(id), Some(WorkerStatus::Slow));
        assert!(registry.active_workers().is_empty());
        assert!(registry.contains(id));

        // Activity brings a slow worker back
        assert!(registry.mark_seen(id, now));
        assert_eq!(registry.status(id), Some(WorkerStatus::Active));

        assert_eq!(registry.mark_timed_out(id), Some(WorkerStatus::Slow));
        assert_eq!(registry.mark_timed_out(id), Some(WorkerStatus::Dead));
        assert!(!registry.contains(id));
        assert_eq!(registry.mark_timed_out(id), None);
        assert!(!registry.mark_seen(id, now));
    }

    #[test]
    fn test_sweep_needs_two_misses() {
        let start = Instant::now();
        let timeout = Duration::from_secs(10);
        let mut registry = WorkerRegistry::new();
        let quiet = registry.join(start);
        let chatty = registry.join(start);

        let t1 = start + Duration::from_secs(11);
        registry.mark_seen(chatty, t1);
        assert!(registry.sweep(t1, timeout).is_empty());
        assert_eq!(registry.status(quiet), Some(WorkerStatus::Slow));
        assert_eq!(registry.status(chatty), Some(WorkerStatus::Active));

        // Timer restarted at t1, so nothing happens before t1 + timeout
        let t2 = t1 + Duration::from_secs(5);
        registry.mark_seen(chatty, t2);
        assert!(registry.sweep(t2, timeout).is_empty());

        let t3 = t1 + Duration::from_secs(11);
        registry.mark_seen(chatty, t3);
        assert_eq!(registry.sweep(t3, timeout), vec![quiet]);
        assert_eq!(registry.active_workers(), BTreeSet::from([chatty]));
    }
}
