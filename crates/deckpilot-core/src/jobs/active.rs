//! The set of jobs a view is still waiting on.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio_util::sync::CancellationToken;

use super::poller::{PollHandle, TaskPoller};
use crate::models::{Job, JobRef, JobSnapshot};

struct ActiveEntry {
    job: Job,
    cancel: CancellationToken,
    generation: u64,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<String, ActiveEntry>,
    next_generation: u64,
}

/// Jobs with a running poller, keyed by job id.
///
/// Poll callbacks are synchronous, so the map sits behind a std mutex that
/// is never held across an await.
#[derive(Clone, Default)]
pub struct ActiveJobs {
    inner: Arc<Mutex<Inner>>,
}

impl ActiveJobs {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a job and start polling it under `scope`.
    ///
    /// The job leaves the set when its poller ends, whatever the outcome.
    pub fn start<F>(
        &self,
        poller: &TaskPoller,
        job: JobRef,
        scope: &CancellationToken,
        mut on_update: F,
    ) -> PollHandle
    where
        F: FnMut(&JobSnapshot) + Send + 'static,
    {
        let cancel = scope.child_token();
        let generation = {
            let mut inner = self.lock();
            inner.next_generation += 1;
            let generation = inner.next_generation;
            let entry = ActiveEntry {
                job: Job::submitted(&job),
                cancel: cancel.clone(),
                generation,
            };
            // Re-registering an id stops the older poller
            if let Some(previous) = inner.entries.insert(job.id.clone(), entry) {
                previous.cancel.cancel();
            }
            generation
        };

        let update_jobs = self.clone();
        let finish_jobs = self.clone();
        let update_id = job.id.clone();
        let finish_id = job.id.clone();

        poller.start_with_finish(
            job,
            cancel,
            move |snapshot| {
                update_jobs.apply(&update_id, snapshot);
                on_update(snapshot);
            },
            move |_| {
                let mut inner = finish_jobs.lock();
                if inner
                    .entries
                    .get(&finish_id)
                    .is_some_and(|e| e.generation == generation)
                {
                    inner.entries.remove(&finish_id);
                }
            },
        )
    }

    fn apply(&self, job_id: &str, snapshot: &JobSnapshot) {
        if let Some(entry) = self.lock().entries.get_mut(job_id) {
            entry.job.apply(snapshot);
        }
    }

    /// Stop polling a job and forget it. The server job keeps running.
    pub fn dismiss(&self, job_id: &str) -> bool {
        match self.lock().entries.remove(job_id) {
            Some(entry) => {
                entry.cancel.cancel();
                tracing::debug!(job_id = %job_id, "Job dismissed");
                true
            }
            None => false,
        }
    }

    /// Stop every poller in the set.
    pub fn dismiss_all(&self) {
        for (_, entry) in self.lock().entries.drain() {
            entry.cancel.cancel();
        }
    }

    pub fn get(&self, job_id: &str) -> Option<Job> {
        self.lock().entries.get(job_id).map(|e| e.job.clone())
    }

    pub fn contains(&self, job_id: &str) -> bool {
        self.lock().entries.contains_key(job_id)
    }

    /// Snapshot of the tracked jobs, oldest first.
    pub fn list(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self.lock().entries.values().map(|e| e.job.clone()).collect();
        jobs.sort_by_key(|j| j.created_at);
        jobs
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::api::memory::InMemoryApi;
    use crate::jobs::{PollConfig, PollOutcome};
    use crate::models::{JobKind, JobStatus};

    fn setup() -> (Arc<InMemoryApi>, TaskPoller, ActiveJobs) {
        let api = Arc::new(InMemoryApi::new());
        let poller = TaskPoller::new(api.clone(), PollConfig::default());
        (api, poller, ActiveJobs::new())
    }

    #[tokio::test(start_paused = true)]
    async fn test_job_leaves_set_on_terminal() {
        let (api, poller, active) = setup();
        api.script_job(
            "j-1",
            vec![JobStatus::Processing.into(), JobStatus::Completed.into()],
        );

        let scope = CancellationToken::new();
        let handle = active.start(
            &poller,
            JobRef::for_project("j-1", JobKind::ImageGenerate, "p"),
            &scope,
            |_| {},
        );
        assert!(active.contains("j-1"));
        assert_eq!(active.get("j-1").unwrap().status, JobStatus::Pending);

        assert!(handle.outcome().await.is_completed());
        assert!(active.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dismissed_job_is_not_polled_again() {
        let (api, poller, active) = setup();
        api.script_job("j-2", vec![JobStatus::Processing.into()]);

        let scope = CancellationToken::new();
        let handle = active.start(
            &poller,
            JobRef::for_project("j-2", JobKind::ExportEditablePptx, "p"),
            &scope,
            |_| {},
        );

        tokio::time::sleep(Duration::from_millis(4_100)).await;
        assert_eq!(active.get("j-2").unwrap().status, JobStatus::Processing);

        assert!(active.dismiss("j-2"));
        assert!(matches!(handle.outcome().await, PollOutcome::Cancelled));

        let calls = api.status_calls("j-2");
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(api.status_calls("j-2"), calls);
        assert!(!active.contains("j-2"));
    }
}
