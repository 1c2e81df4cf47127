//! In-process registry of live runs and the resources they hold.

use std::collections::HashMap;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::allocator::Allocation;
use crate::error::{PilotError, Result};
use crate::run::{Run, RunStatus, RunStore};

/// Result of an atomic check-and-reserve.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reservation {
    Reserved,
    /// The run already holds this allocation.
    Existing(Allocation),
    /// Another live run holds an overlapping port or the same path.
    Conflict,
}

#[derive(Default)]
struct Inner {
    runs: HashMap<String, Run>,
    allocations: HashMap<String, Allocation>,
}

/// Both maps sit behind one lock so allocation checks and inserts are atomic.
#[derive(Default)]
pub struct RunRegistry {
    inner: Mutex<Inner>,
}

impl RunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, run: Run) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.runs.contains_key(&run.id) {
            return Err(PilotError::RunAlreadyExists(run.id));
        }
        inner.runs.insert(run.id.clone(), run);
        Ok(())
    }

    /// Insert or replace the snapshot of a run.
    pub fn upsert(&self, run: &Run) {
        self.inner.lock().runs.insert(run.id.clone(), run.clone());
    }

    pub fn update<F>(&self, run_id: &str, f: F) -> Result<Run>
    where
        F: FnOnce(&mut Run),
    {
        let mut inner = self.inner.lock();
        let run = inner
            .runs
            .get_mut(run_id)
            .ok_or_else(|| PilotError::RunNotFound(run_id.to_string()))?;
        f(run);
        Ok(run.clone())
    }

    pub fn get(&self, run_id: &str) -> Option<Run> {
        self.inner.lock().runs.get(run_id).cloned()
    }

    pub fn contains(&self, run_id: &str) -> bool {
        self.inner.lock().runs.contains_key(run_id)
    }

    /// Drop the run snapshot. Its allocation is released separately.
    pub fn remove(&self, run_id: &str) -> Option<Run> {
        self.inner.lock().runs.remove(run_id)
    }

    pub fn list(&self) -> Vec<Run> {
        let mut runs: Vec<Run> = self.inner.lock().runs.values().cloned().collect();
        runs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        runs
    }

    pub fn list_by_status(&self, status: RunStatus) -> Vec<Run> {
        self.list()
            .into_iter()
            .filter(|r| r.status == status)
            .collect()
    }

    pub fn active_ids(&self) -> Vec<String> {
        let inner = self.inner.lock();
        let mut ids: Vec<String> = inner
            .runs
            .keys()
            .chain(inner.allocations.keys())
            .cloned()
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }

    pub fn len(&self) -> usize {
        self.inner.lock().runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn try_reserve(&self, run_id: &str, candidate: &Allocation) -> Reservation {
        let mut inner = self.inner.lock();

        if let Some(existing) = inner.allocations.get(run_id) {
            return Reservation::Existing(existing.clone());
        }

        let conflict = inner
            .allocations
            .iter()
            .any(|(owner, held)| owner != run_id && held.conflicts_with(candidate));
        if conflict {
            return Reservation::Conflict;
        }

        inner
            .allocations
            .insert(run_id.to_string(), candidate.clone());
        Reservation::Reserved
    }

    pub fn release(&self, run_id: &str) -> Option<Allocation> {
        self.inner.lock().allocations.remove(run_id)
    }

    pub fn allocation(&self, run_id: &str) -> Option<Allocation> {
        self.inner.lock().allocations.get(run_id).cloned()
    }

    pub fn allocations(&self) -> Vec<(String, Allocation)> {
        let inner = self.inner.lock();
        let mut held: Vec<_> = inner
            .allocations
            .iter()
            .map(|(id, a)| (id.clone(), a.clone()))
            .collect();
        held.sort_by(|a, b| a.0.cmp(&b.0));
        held
    }

    /// Rebuild the live set from persisted runs. Allocations of resumable runs are
    /// re-reserved so new runs cannot be handed the same resources.
    pub async fn recover(&self, store: &RunStore) -> Result<Vec<Run>> {
        let runs = store.list_resumable().await?;
        let mut recovered = Vec::with_capacity(runs.len());

        for run in runs {
            if let Some(allocation) = run.allocation() {
                match self.try_reserve(&run.id, allocation) {
                    Reservation::Reserved | Reservation::Existing(_) => {}
                    Reservation::Conflict => {
                        warn!(run_id = %run.id, ports = %allocation.ports, "Persisted allocation conflicts with a live run");
                    }
                }
            }
            debug!(run_id = %run.id, phase = %run.phase, "Recovered run");
            self.upsert(&run);
            recovered.push(run);
        }

        Ok(recovered)
    }
}
