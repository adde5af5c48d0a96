//! In-process map of live crawl workers, keyed by job id.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::domain::TaskError;
use crate::orchestration::worker::{WorkerState, WorkerStats};

/// Stop handle and live counters of one registered worker.
#[derive(Debug, Clone)]
pub struct WorkerControl {
    token: CancellationToken,
    state: Arc<WorkerState>,
    /// Set when the stop follows a persisted state change
    state_changed: Arc<AtomicBool>,
    registered_at: DateTime<Utc>,
}

impl WorkerControl {
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn state(&self) -> Arc<WorkerState> {
        Arc::clone(&self.state)
    }

    pub fn stop(&self) {
        self.token.cancel();
    }

    /// Whether the stop came with a persisted state change, as opposed to a shutdown.
    pub fn stopped_for_state_change(&self) -> bool {
        self.state_changed.load(Ordering::Acquire)
    }

    /// A stop was requested but the worker may still be winding down.
    pub fn is_stopping(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn stats(&self) -> WorkerStats {
        self.state.snapshot()
    }

    pub const fn registered_at(&self) -> DateTime<Utc> {
        self.registered_at
    }
}

#[derive(Debug, Default)]
pub struct WorkerRegistry {
    workers: Mutex<HashMap<i64, WorkerControl>>,
}

impl WorkerRegistry {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Claims the slot for `job_id`. The slot is released when the returned
    /// registration is dropped.
    pub fn register(self: &Arc<Self>, job_id: i64) -> Result<WorkerRegistration, TaskError> {
        let mut workers = self.lock();
        if workers.contains_key(&job_id) {
            return Err(TaskError::precondition(format!(
                "a crawl worker is already registered for job {job_id}"
            )));
        }
        let control = WorkerControl {
            token: CancellationToken::new(),
            state: Arc::new(WorkerState::default()),
            state_changed: Arc::new(AtomicBool::new(false)),
            registered_at: Utc::now(),
        };
        workers.insert(job_id, control.clone());
        debug!(job_id, active = workers.len(), "Worker registered");
        Ok(WorkerRegistration {
            registry: Arc::clone(self),
            job_id,
            control,
        })
    }

    /// Signals the worker of `job_id` after its job row was moved out of
    /// `running`. Returns false when none is registered.
    pub fn request_stop(&self, job_id: i64) -> bool {
        match self.lock().get(&job_id) {
            Some(control) => {
                control.state_changed.store(true, Ordering::Release);
                control.stop();
                info!(job_id, "Stop requested for crawl worker");
                true
            }
            None => false,
        }
    }

    /// Cancels every worker without touching job state, as on shutdown.
    pub fn stop_all(&self) -> usize {
        let workers = self.lock();
        for control in workers.values() {
            control.stop();
        }
        if !workers.is_empty() {
            info!(count = workers.len(), "Stop requested for all crawl workers");
        }
        workers.len()
    }

    pub fn get(&self, job_id: i64) -> Option<WorkerControl> {
        self.lock().get(&job_id).cloned()
    }

    pub fn is_registered(&self, job_id: i64) -> bool {
        self.lock().contains_key(&job_id)
    }

    pub fn active_jobs(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.lock().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn deregister(&self, job_id: i64) {
        let mut workers = self.lock();
        if workers.remove(&job_id).is_some() {
            debug!(job_id, active = workers.len(), "Worker deregistered");
        }
    }

    // Held only for map edits, never across an await.
    fn lock(&self) -> MutexGuard<'_, HashMap<i64, WorkerControl>> {
        self.workers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Ownership of a registry slot.
#[derive(Debug)]
pub struct WorkerRegistration {
    registry: Arc<WorkerRegistry>,
    job_id: i64,
    control: WorkerControl,
}

impl WorkerRegistration {
    pub const fn job_id(&self) -> i64 {
        self.job_id
    }

    pub const fn control(&self) -> &WorkerControl {
        &self.control
    }
}

impl Drop for WorkerRegistration {
    fn drop(&mut self) {
        self.registry.deregister(self.job_id);
    }
}
