//! Fixed-interval status polling for a single job.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::api::DeckApi;
use crate::config::Settings;
use crate::error::{normalize_error_message, ClientError};
use crate::models::{JobRef, JobSnapshot, JobStatus};

/// Shortest period a poller will tick at
pub const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// Polling cadence and deadline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollConfig {
    /// Time between status queries
    pub interval: Duration,
    /// Overall deadline measured from start
    pub timeout: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(2),
            timeout: Duration::from_secs(120),
        }
    }
}

impl PollConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            interval: settings.poll_interval(),
            timeout: settings.poll_timeout(),
        }
    }
}

/// How a poll ended
#[derive(Debug)]
pub enum PollOutcome {
    /// Server reported COMPLETED
    Completed(JobSnapshot),
    /// Server reported FAILED
    Failed { message: String, snapshot: JobSnapshot },
    /// Local deadline passed while the job was still running
    TimedOut { after: Duration },
    /// A status query itself failed; polling stopped without retry
    QueryFailed(ClientError),
    /// Stopped by the caller; the server job keeps running
    Cancelled,
}

impl PollOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, PollOutcome::Completed(_))
    }

    pub fn snapshot(&self) -> Option<&JobSnapshot> {
        match self {
            PollOutcome::Completed(snapshot) | PollOutcome::Failed { snapshot, .. } => {
                Some(snapshot)
            }
            _ => None,
        }
    }

    /// User-facing failure text; `None` for completion and cancellation.
    pub fn failure_message(&self) -> Option<String> {
        match self {
            PollOutcome::Completed(_) | PollOutcome::Cancelled => None,
            PollOutcome::Failed { message, .. } => Some(normalize_error_message(Some(message.as_str()))),
            PollOutcome::TimedOut { after } => {
                Some(ClientError::Timeout { after: *after }.user_message())
            }
            PollOutcome::QueryFailed(e) => Some(e.user_message()),
        }
    }
}

/// Handle to a spawned poller
pub struct PollHandle {
    job: JobRef,
    cancel: CancellationToken,
    task: JoinHandle<PollOutcome>,
}

impl PollHandle {
    pub fn job(&self) -> &JobRef {
        &self.job
    }

    /// Stop polling. Does not touch the job on the server.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the poller to end.
    pub async fn outcome(self) -> PollOutcome {
        match self.task.await {
            Ok(outcome) => outcome,
            Err(e) if e.is_cancelled() => PollOutcome::Cancelled,
            Err(e) => {
                tracing::error!(job_id = %self.job.id, error = %e, "Poller task panicked");
                let message = "Polling stopped unexpectedly".to_string();
                PollOutcome::Failed {
                    snapshot: JobSnapshot::failed(message.clone()),
                    message,
                }
            }
        }
    }
}

/// Queries job status at a fixed interval until terminal, timeout or cancel.
#[derive(Clone)]
pub struct TaskPoller {
    api: Arc<dyn DeckApi>,
    config: PollConfig,
}

impl TaskPoller {
    pub fn new(api: Arc<dyn DeckApi>, config: PollConfig) -> Self {
        Self { api, config }
    }

    pub fn config(&self) -> PollConfig {
        self.config
    }

    /// Spawn a poller with its own cancellation.
    pub fn start<F>(&self, job: JobRef, on_update: F) -> PollHandle
    where
        F: FnMut(&JobSnapshot) + Send + 'static,
    {
        self.spawn(job, CancellationToken::new(), on_update, |_| {})
    }

    /// Spawn a poller that also stops when `scope` is cancelled.
    pub fn start_scoped<F>(&self, job: JobRef, scope: &CancellationToken, on_update: F) -> PollHandle
    where
        F: FnMut(&JobSnapshot) + Send + 'static,
    {
        self.spawn(job, scope.child_token(), on_update, |_| {})
    }

    /// Spawn a poller stopped by `cancel`, with a hook that sees the outcome
    /// before it is handed to the awaiting caller.
    pub fn start_with_finish<F, G>(
        &self,
        job: JobRef,
        cancel: CancellationToken,
        on_update: F,
        on_finish: G,
    ) -> PollHandle
    where
        F: FnMut(&JobSnapshot) + Send + 'static,
        G: FnOnce(&PollOutcome) + Send + 'static,
    {
        self.spawn(job, cancel, on_update, on_finish)
    }

    fn spawn<F, G>(
        &self,
        job: JobRef,
        cancel: CancellationToken,
        on_update: F,
        on_finish: G,
    ) -> PollHandle
    where
        F: FnMut(&JobSnapshot) + Send + 'static,
        G: FnOnce(&PollOutcome) + Send + 'static,
    {
        let poller = self.clone();
        let task_job = job.clone();
        let task_cancel = cancel.clone();

        let task = tokio::spawn(async move {
            let outcome = poller.run(&task_job, &task_cancel, on_update).await;
            on_finish(&outcome);
            outcome
        });

        PollHandle { job, cancel, task }
    }

    /// Poll inline until the job ends.
    pub async fn run<F>(&self, job: &JobRef, cancel: &CancellationToken, mut on_update: F) -> PollOutcome
    where
        F: FnMut(&JobSnapshot),
    {
        let started = Instant::now();
        let deadline = tokio::time::sleep_until(started + self.config.timeout);
        tokio::pin!(deadline);

        let period = self.config.interval.max(MIN_INTERVAL);
        let mut ticker = tokio::time::interval_at(started + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::debug!(job_id = %job.id, kind = %job.kind, "Polling started");

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    tracing::debug!(job_id = %job.id, "Polling cancelled");
                    return PollOutcome::Cancelled;
                }

                _ = &mut deadline => {
                    tracing::warn!(
                        job_id = %job.id,
                        timeout_secs = self.config.timeout.as_secs(),
                        "Polling timed out"
                    );
                    return PollOutcome::TimedOut { after: self.config.timeout };
                }

                _ = ticker.tick() => {}
            }

            let result = tokio::select! {
                biased;

                _ = cancel.cancelled() => return PollOutcome::Cancelled,

                result = self.api.job_status(job) => result,
            };

            let snapshot = match result {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    tracing::warn!(job_id = %job.id, error = %e, "Status query failed");
                    return PollOutcome::QueryFailed(e);
                }
            };

            on_update(&snapshot);

            match snapshot.status {
                JobStatus::Completed => {
                    tracing::info!(job_id = %job.id, kind = %job.kind, "Task completed");
                    return PollOutcome::Completed(snapshot);
                }
                JobStatus::Failed => {
                    let message = snapshot
                        .error
                        .clone()
                        .or_else(|| snapshot.message.clone())
                        .unwrap_or_else(|| "Task failed".to_string());
                    tracing::info!(job_id = %job.id, kind = %job.kind, error = %message, "Task failed");
                    return PollOutcome::Failed { message, snapshot };
                }
                JobStatus::Pending | JobStatus::Processing => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use serde_json::json;

    use crate::api::memory::{InMemoryApi, Scripted};
    use crate::models::JobKind;

    fn export_job(id: &str) -> JobRef {
        JobRef::for_project(id, JobKind::ExportEditablePptx, "p-1")
    }

    fn poller(api: Arc<InMemoryApi>) -> TaskPoller {
        TaskPoller::new(api, PollConfig::default())
    }

    #[tokio::test(start_paused = true)]
    async fn test_stops_after_completed() {
        let api = Arc::new(InMemoryApi::new());
        api.script_job(
            "t-1",
            vec![
                JobStatus::Processing.into(),
                JobStatus::Processing.into(),
                JobSnapshot::completed(json!({ "download_url": "x" })).into(),
            ],
        );

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let handle = poller(api.clone()).start(export_job("t-1"), move |s| {
            seen_clone.lock().unwrap().push(s.status);
        });

        let outcome = handle.outcome().await;
        match &outcome {
            PollOutcome::Completed(snapshot) => {
                assert_eq!(snapshot.download_url().as_deref(), Some("x"))
            }
            other => panic!("unexpected outcome: {other:?}"),
        }

        assert_eq!(
            *seen.lock().unwrap(),
            vec![JobStatus::Processing, JobStatus::Processing, JobStatus::Completed]
        );
        assert_eq!(api.status_calls("t-1"), 3);

        // No further queries once terminal
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(api.status_calls("t-1"), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_statuses_are_monotonic() {
        let api = Arc::new(InMemoryApi::new());
        api.script_job(
            "t-2",
            vec![
                JobStatus::Pending.into(),
                JobStatus::Processing.into(),
                JobSnapshot::failed("boom").into(),
                JobStatus::Processing.into(),
            ],
        );

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let outcome = poller(api)
            .start(export_job("t-2"), move |s| seen_clone.lock().unwrap().push(s.status))
            .outcome()
            .await;

        let seen = seen.lock().unwrap().clone();
        let terminal_at = seen.iter().position(|s| s.is_terminal()).unwrap();
        assert_eq!(terminal_at, seen.len() - 1);
        assert!(matches!(outcome, PollOutcome::Failed { ref message, .. } if message == "boom"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_distinct_from_failure() {
        let api = Arc::new(InMemoryApi::new());
        api.script_job("t-3", vec![JobStatus::Processing.into()]);

        let outcome = poller(api.clone()).start(export_job("t-3"), |_| {}).outcome().await;

        match &outcome {
            PollOutcome::TimedOut { after } => assert_eq!(*after, Duration::from_secs(120)),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert!(outcome.failure_message().unwrap().contains("timed out"));
        let calls = api.status_calls("t-3");
        assert!(calls > 50 && calls <= 60, "calls = {calls}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_query_error_stops_without_retry() {
        let api = Arc::new(InMemoryApi::new());
        api.script_job(
            "t-4",
            vec![
                JobStatus::Processing.into(),
                Scripted::NetworkError("connection reset".into()),
                JobStatus::Completed.into(),
            ],
        );

        let outcome = poller(api.clone()).start(export_job("t-4"), |_| {}).outcome().await;

        assert!(matches!(outcome, PollOutcome::QueryFailed(ClientError::Transport(_))));
        assert_eq!(api.status_calls("t-4"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_locally() {
        let api = Arc::new(InMemoryApi::new());
        api.script_job("t-5", vec![JobStatus::Processing.into()]);

        let handle = poller(api.clone()).start(export_job("t-5"), |_| {});
        tokio::time::sleep(Duration::from_millis(4_500)).await;
        handle.stop();
        let outcome = handle.outcome().await;

        assert!(matches!(outcome, PollOutcome::Cancelled));
        let calls = api.status_calls("t-5");
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(api.status_calls("t-5"), calls);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scope_cancels_all_children() {
        let api = Arc::new(InMemoryApi::new());
        api.script_job("a", vec![JobStatus::Processing.into()]);
        api.script_job("b", vec![JobStatus::Processing.into()]);

        let scope = CancellationToken::new();
        let poller = poller(api);
        let a = poller.start_scoped(export_job("a"), &scope, |_| {});
        let b = poller.start_scoped(export_job("b"), &scope, |_| {});

        scope.cancel();
        assert!(matches!(a.outcome().await, PollOutcome::Cancelled));
        assert!(matches!(b.outcome().await, PollOutcome::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_interval_still_polls() {
        let api = Arc::new(InMemoryApi::new());
        api.script_job(
            "t-6",
            vec![JobStatus::Processing.into(), JobStatus::Completed.into()],
        );
        let config = PollConfig {
            interval: Duration::ZERO,
            ..PollConfig::default()
        };

        let outcome = TaskPoller::new(api.clone(), config)
            .start(export_job("t-6"), |_| {})
            .outcome()
            .await;

        assert!(outcome.is_completed());
        assert_eq!(api.status_calls("t-6"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicked_poller_reports_failure() {
        let api = Arc::new(InMemoryApi::new());
        api.script_job("t-7", vec![JobStatus::Completed.into()]);

        let outcome = poller(api)
            .start_with_finish(
                export_job("t-7"),
                CancellationToken::new(),
                |_| {},
                |_| panic!("finish hook blew up"),
            )
            .outcome()
            .await;

        assert!(matches!(outcome, PollOutcome::Failed { .. }));
        assert!(outcome.failure_message().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_independent_jobs_poll_independently() {
        let api = Arc::new(InMemoryApi::new());
        api.script_job("fast", vec![JobStatus::Completed.into()]);
        api.script_job(
            "slow",
            vec![
                JobStatus::Processing.into(),
                JobStatus::Processing.into(),
                JobStatus::Processing.into(),
                JobStatus::Completed.into(),
            ],
        );

        let poller = poller(api.clone());
        let fast = poller.start(export_job("fast"), |_| {});
        let slow = poller.start(export_job("slow"), |_| {});

        assert!(fast.outcome().await.is_completed());
        assert!(slow.outcome().await.is_completed());
        assert_eq!(api.status_calls("fast"), 1);
        assert_eq!(api.status_calls("slow"), 4);
    }
}
