//! Export task tracking.
//!
//! PPTX and PDF exports are synchronous: the backend answers with a download
//! URL. Editable PPTX is a server job that is polled until it produces one.
//! Either way a local record exists in PROCESSING before the request is sent,
//! and records are persisted so that running exports survive a restart.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::api::DeckApi;
use crate::jobs::{PollOutcome, TaskPoller};
use crate::models::{JobKind, JobRef, JobStatus, TaskProgress};
use crate::notify::{Notice, Notifier};

/// Error recorded on PROCESSING records that never got a server job id.
pub const ORPHANED_EXPORT_MESSAGE: &str =
    "Export was interrupted before the server accepted it, please export again";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExportKind {
    Pptx,
    Pdf,
    EditablePptx,
}

impl ExportKind {
    /// File extension of the produced download.
    pub fn extension(self) -> &'static str {
        match self {
            ExportKind::Pptx | ExportKind::EditablePptx => "pptx",
            ExportKind::Pdf => "pdf",
        }
    }

    /// Whether the export runs as a polled server job.
    pub fn is_async(self) -> bool {
        matches!(self, ExportKind::EditablePptx)
    }

    pub fn job_kind(self) -> JobKind {
        match self {
            ExportKind::Pptx => JobKind::ExportPptx,
            ExportKind::Pdf => JobKind::ExportPdf,
            ExportKind::EditablePptx => JobKind::ExportEditablePptx,
        }
    }
}

impl std::fmt::Display for ExportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExportKind::Pptx => write!(f, "pptx"),
            ExportKind::Pdf => write!(f, "pdf"),
            ExportKind::EditablePptx => write!(f, "editable-pptx"),
        }
    }
}

impl std::str::FromStr for ExportKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pptx" => Ok(ExportKind::Pptx),
            "pdf" => Ok(ExportKind::Pdf),
            "editable-pptx" => Ok(ExportKind::EditablePptx),
            other => Err(format!("unknown export kind: {}", other)),
        }
    }
}

/// Local record of one export.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportTask {
    /// Local id, `export-<millis>-<suffix>`
    pub id: String,
    /// Server job id, once known (editable PPTX only)
    #[serde(default)]
    pub task_id: Option<String>,
    pub project_id: String,
    pub kind: ExportKind,
    pub status: JobStatus,
    #[serde(default)]
    pub progress: Option<TaskProgress>,
    #[serde(default)]
    pub download_url: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
    /// Exported pages; `None` means the whole deck
    #[serde(default)]
    pub page_ids: Option<Vec<String>>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl ExportTask {
    fn processing(project_id: &str, kind: ExportKind, page_ids: Option<Vec<String>>) -> Self {
        let now = Utc::now();
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        Self {
            id: format!("export-{}-{}", now.timestamp_millis(), &suffix[..8]),
            task_id: None,
            project_id: project_id.to_string(),
            kind,
            status: JobStatus::Processing,
            progress: None,
            download_url: None,
            error_message: None,
            page_ids,
            created_at: now,
            completed_at: None,
        }
    }

    pub fn is_active(&self) -> bool {
        !self.status.is_terminal()
    }

    fn complete(&mut self, download_url: String) {
        self.status = JobStatus::Completed;
        self.download_url = Some(download_url);
        self.error_message = None;
        self.completed_at = Some(Utc::now());
    }

    fn fail(&mut self, message: String) {
        self.status = JobStatus::Failed;
        self.error_message = Some(message);
        self.completed_at = Some(Utc::now());
    }
}

/// Load persisted export records. A missing file is an empty list.
pub fn load_tasks(path: &Path) -> Result<Vec<ExportTask>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = std::fs::read_to_string(path).context("Failed to read export tasks file")?;
    let tasks = serde_json::from_str(&content).context("Failed to parse export tasks JSON")?;
    Ok(tasks)
}

/// Persist export records
pub fn save_tasks(path: &Path, tasks: &[ExportTask]) -> Result<()> {
    let content = serde_json::to_string_pretty(tasks).context("Failed to serialize export tasks")?;
    std::fs::write(path, content).context("Failed to write export tasks file")?;
    Ok(())
}

/// What `restore_active_tasks` did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreReport {
    /// Local ids whose polling resumed
    pub resumed: Vec<String>,
    /// Local ids marked FAILED for lack of a server job id
    pub orphaned: Vec<String>,
}

struct Worker {
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

/// Tracks export records and the pollers behind async exports.
#[derive(Clone)]
pub struct ExportTaskTracker {
    api: Arc<dyn DeckApi>,
    poller: TaskPoller,
    notifier: Arc<dyn Notifier>,
    store_path: Option<PathBuf>,
    tasks: Arc<RwLock<Vec<ExportTask>>>,
    workers: Arc<Mutex<HashMap<String, Worker>>>,
    scope: Arc<Mutex<CancellationToken>>,
}

impl ExportTaskTracker {
    /// Create a tracker. With a `store_path`, records are saved on every change.
    pub fn new(
        api: Arc<dyn DeckApi>,
        poller: TaskPoller,
        notifier: Arc<dyn Notifier>,
        store_path: Option<PathBuf>,
    ) -> Self {
        Self {
            api,
            poller,
            notifier,
            store_path,
            tasks: Arc::new(RwLock::new(Vec::new())),
            workers: Arc::new(Mutex::new(HashMap::new())),
            scope: Arc::new(Mutex::new(CancellationToken::new())),
        }
    }

    /// Start an export. Always yields a record: COMPLETED for synchronous
    /// exports, PROCESSING while an async export is polled, FAILED otherwise.
    pub async fn start_export(
        &self,
        project_id: &str,
        kind: ExportKind,
        page_ids: Option<Vec<String>>,
    ) -> ExportTask {
        let record = ExportTask::processing(project_id, kind, page_ids.clone());
        let local_id = record.id.clone();
        tracing::info!(task = %local_id, project_id = %project_id, kind = %kind, "Export started");
        self.insert(record.clone()).await;

        let page_ids = page_ids.as_deref();
        if kind.is_async() {
            match self.api.export_editable_pptx(project_id, page_ids).await {
                Ok(task_id) => {
                    self.update(&local_id, |t| t.task_id = Some(task_id.clone()))
                        .await;
                    self.notifier.notify(Notice::info(
                        "Export started, progress is shown in the export task list",
                    ));
                    let job = JobRef::for_project(task_id, kind.job_kind(), project_id);
                    self.spawn_poll(&local_id, job).await;
                }
                Err(e) => {
                    tracing::error!(task = %local_id, error = %e, "Export request failed");
                    self.fail(&local_id, e.user_message()).await;
                }
            }
        } else {
            match self.api.export_direct(project_id, kind, page_ids).await {
                Ok(url) => {
                    self.update(&local_id, |t| t.complete(url.clone())).await;
                    self.notifier.notify(Notice::success("Export ready"));
                }
                Err(e) => {
                    tracing::error!(task = %local_id, error = %e, "Export request failed");
                    self.fail(&local_id, e.user_message()).await;
                }
            }
        }

        self.get(&local_id).await.unwrap_or(record)
    }

    /// Reload persisted records and resume polling for running exports.
    pub async fn restore_active_tasks(&self) -> RestoreReport {
        let mut report = RestoreReport::default();

        if let Some(path) = &self.store_path {
            match load_tasks(path) {
                Ok(stored) => {
                    let mut tasks = self.tasks.write().await;
                    for task in stored {
                        if !tasks.iter().any(|t| t.id == task.id) {
                            tasks.push(task);
                        }
                    }
                }
                Err(e) => tracing::warn!(error = %e, "Failed to load export tasks"),
            }
        }

        let active: Vec<ExportTask> = self
            .tasks
            .read()
            .await
            .iter()
            .filter(|t| t.is_active())
            .cloned()
            .collect();

        for task in active {
            if self.workers.lock().await.contains_key(&task.id) {
                continue;
            }
            match &task.task_id {
                Some(task_id) => {
                    let job = JobRef::for_project(task_id.clone(), task.kind.job_kind(), &task.project_id);
                    self.spawn_poll(&task.id, job).await;
                    report.resumed.push(task.id.clone());
                }
                None => {
                    tracing::warn!(task = %task.id, "Orphaned export without a server job");
                    self.update(&task.id, |t| t.fail(ORPHANED_EXPORT_MESSAGE.to_string()))
                        .await;
                    report.orphaned.push(task.id.clone());
                }
            }
        }

        if !report.resumed.is_empty() || !report.orphaned.is_empty() {
            tracing::info!(
                resumed = report.resumed.len(),
                orphaned = report.orphaned.len(),
                "Export tasks restored"
            );
        }
        report
    }

    async fn spawn_poll(&self, local_id: &str, job: JobRef) {
        let cancel = self.scope.lock().await.child_token();
        let tracker = self.clone();
        let id = local_id.to_string();
        let worker_cancel = cancel.clone();

        let join = tokio::spawn(async move {
            let progress_tracker = tracker.clone();
            let progress_id = id.clone();
            let outcome = tracker
                .poller
                .run(&job, &cancel, move |snapshot| {
                    if let Some(progress) = snapshot.progress.clone() {
                        let t = progress_tracker.clone();
                        let id = progress_id.clone();
                        tokio::spawn(async move {
                            t.set_progress(&id, progress).await;
                        });
                    }
                })
                .await;
            tracker.finish(&id, outcome).await;
        });

        self.workers.lock().await.insert(
            local_id.to_string(),
            Worker {
                cancel: worker_cancel,
                join,
            },
        );
    }

    async fn set_progress(&self, local_id: &str, progress: TaskProgress) {
        let mut tasks = self.tasks.write().await;
        if let Some(task) = tasks.iter_mut().find(|t| t.id == local_id && t.is_active()) {
            task.progress = Some(progress);
        }
    }

    async fn finish(&self, local_id: &str, outcome: PollOutcome) {
        match outcome {
            PollOutcome::Completed(snapshot) => match snapshot.download_url() {
                Some(url) => {
                    self.update(local_id, |t| {
                        if snapshot.progress.is_some() {
                            t.progress = snapshot.progress.clone();
                        }
                        t.complete(url.clone());
                    })
                    .await;
                    self.notifier.notify(Notice::success("Export ready"));
                }
                None => {
                    self.fail(local_id, "Export finished without a download link".to_string())
                        .await;
                }
            },
            // Stopped locally; the record stays PROCESSING for a later restore
            PollOutcome::Cancelled => {}
            other => {
                let message = other
                    .failure_message()
                    .unwrap_or_else(|| "Export failed".to_string());
                self.fail(local_id, message).await;
            }
        }
    }

    async fn fail(&self, local_id: &str, message: String) {
        self.notifier.notify(Notice::error(message.clone()));
        self.update(local_id, |t| t.fail(message.clone())).await;
    }

    /// Wait for an export's poller to finish, then return the record.
    pub async fn wait(&self, local_id: &str) -> Option<ExportTask> {
        let worker = self.workers.lock().await.remove(local_id);
        if let Some(worker) = worker {
            if let Err(e) = worker.join.await {
                tracing::warn!(task = %local_id, error = %e, "Export poller ended abnormally");
            }
        }
        self.get(local_id).await
    }

    /// Stop every poller. Records stay as they are.
    pub async fn stop_all(&self) {
        {
            let mut scope = self.scope.lock().await;
            scope.cancel();
            *scope = CancellationToken::new();
        }
        let workers: Vec<Worker> = self.workers.lock().await.drain().map(|(_, w)| w).collect();
        for worker in workers {
            let _ = worker.join.await;
        }
    }

    /// Drop a record, stopping its poller if any.
    pub async fn remove_task(&self, local_id: &str) -> bool {
        if let Some(worker) = self.workers.lock().await.remove(local_id) {
            worker.cancel.cancel();
        }
        let removed = {
            let mut tasks = self.tasks.write().await;
            let before = tasks.len();
            tasks.retain(|t| t.id != local_id);
            tasks.len() != before
        };
        if removed {
            self.persist().await;
        }
        removed
    }

    /// Drop completed and failed records of a project.
    pub async fn clear_finished(&self, project_id: &str) -> usize {
        let removed = {
            let mut tasks = self.tasks.write().await;
            let before = tasks.len();
            tasks.retain(|t| t.project_id != project_id || t.is_active());
            before - tasks.len()
        };
        if removed > 0 {
            self.persist().await;
        }
        removed
    }

    pub async fn get(&self, local_id: &str) -> Option<ExportTask> {
        self.tasks
            .read()
            .await
            .iter()
            .find(|t| t.id == local_id)
            .cloned()
    }

    /// Records for a project, newest first
    pub async fn tasks_for_project(&self, project_id: &str) -> Vec<ExportTask> {
        let mut tasks: Vec<ExportTask> = self
            .tasks
            .read()
            .await
            .iter()
            .filter(|t| t.project_id == project_id)
            .cloned()
            .collect();
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        tasks
    }

    pub async fn list(&self) -> Vec<ExportTask> {
        self.tasks.read().await.clone()
    }

    pub async fn active_count(&self, project_id: &str) -> usize {
        self.tasks
            .read()
            .await
            .iter()
            .filter(|t| t.project_id == project_id && t.is_active())
            .count()
    }

    async fn insert(&self, task: ExportTask) {
        self.tasks.write().await.push(task);
        self.persist().await;
    }

    async fn update<F>(&self, local_id: &str, apply: F)
    where
        F: FnOnce(&mut ExportTask),
    {
        {
            let mut tasks = self.tasks.write().await;
            match tasks.iter_mut().find(|t| t.id == local_id) {
                Some(task) => apply(task),
                // Removed while the request was in flight
                None => return,
            }
        }
        self.persist().await;
    }

    async fn persist(&self) {
        let Some(path) = &self.store_path else {
            return;
        };
        let tasks = self.tasks.read().await;
        if let Err(e) = save_tasks(path, &tasks) {
            tracing::warn!(error = %e, "Failed to persist export tasks");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use serde_json::json;
    use tempfile::tempdir;

    use crate::api::memory::InMemoryApi;
    use crate::jobs::PollConfig;
    use crate::models::JobSnapshot;
    use crate::notify::CollectingNotifier;

    fn tracker(
        api: Arc<InMemoryApi>,
        notifier: Arc<CollectingNotifier>,
        store_path: Option<PathBuf>,
    ) -> ExportTaskTracker {
        let poller = TaskPoller::new(api.clone(), PollConfig::default());
        ExportTaskTracker::new(api, poller, notifier, store_path)
    }

    #[tokio::test(start_paused = true)]
    async fn test_async_export_completes_with_download_url() {
        let api = Arc::new(InMemoryApi::new());
        api.script_job(
            "export-task-1",
            vec![
                JobStatus::Processing.into(),
                JobStatus::Processing.into(),
                JobSnapshot::completed(json!({ "download_url": "x" })).into(),
            ],
        );
        let notifier = Arc::new(CollectingNotifier::new());
        let tracker = tracker(api.clone(), notifier.clone(), None);

        let started = tracker
            .start_export("p-1", ExportKind::EditablePptx, None)
            .await;
        assert_eq!(started.status, JobStatus::Processing);
        assert_eq!(started.task_id.as_deref(), Some("export-task-1"));
        assert_eq!(tracker.active_count("p-1").await, 1);

        let done = tracker.wait(&started.id).await.unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.download_url.as_deref(), Some("x"));
        assert_eq!(api.status_calls("export-task-1"), 3);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(api.status_calls("export-task-1"), 3);
        assert_eq!(tracker.active_count("p-1").await, 0);
        assert!(notifier.errors().is_empty());
    }

    #[tokio::test]
    async fn test_sync_export_completes_immediately() {
        let api = Arc::new(InMemoryApi::new());
        let tracker = tracker(api, Arc::new(CollectingNotifier::new()), None);

        let task = tracker.start_export("p-1", ExportKind::Pdf, None).await;

        assert_eq!(task.status, JobStatus::Completed);
        assert_eq!(task.download_url.as_deref(), Some("/files/p-1/export.pdf"));
        assert!(task.id.starts_with("export-"));
    }

    #[tokio::test]
    async fn test_request_failure_marks_failed() {
        let api = Arc::new(InMemoryApi::new());
        api.fail_operation("export_direct", "connection refused");
        let notifier = Arc::new(CollectingNotifier::new());
        let tracker = tracker(api, notifier.clone(), None);

        let task = tracker.start_export("p-1", ExportKind::Pptx, None).await;

        assert_eq!(task.status, JobStatus::Failed);
        assert_eq!(notifier.errors().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_and_server_failure_differ() {
        let api = Arc::new(InMemoryApi::new());
        api.script_job("export-task-1", vec![JobStatus::Processing.into()]);
        api.script_job("export-task-2", vec![JobSnapshot::failed("render crashed").into()]);
        let tracker = tracker(api, Arc::new(CollectingNotifier::new()), None);

        let slow = tracker.start_export("p", ExportKind::EditablePptx, None).await;
        let broken = tracker.start_export("p", ExportKind::EditablePptx, None).await;

        let slow = tracker.wait(&slow.id).await.unwrap();
        let broken = tracker.wait(&broken.id).await.unwrap();

        assert_eq!(slow.status, JobStatus::Failed);
        assert_eq!(broken.status, JobStatus::Failed);
        assert_eq!(broken.error_message.as_deref(), Some("render crashed"));
        assert_ne!(slow.error_message, broken.error_message);
        assert!(slow.error_message.unwrap().contains("timed out"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_restore_resumes_and_fails_orphans() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("export_tasks.json");

        let mut with_job = ExportTask::processing("p", ExportKind::EditablePptx, None);
        with_job.task_id = Some("server-9".into());
        let orphan = ExportTask::processing("p", ExportKind::EditablePptx, None);
        let mut done = ExportTask::processing("p", ExportKind::Pdf, None);
        done.complete("/files/p/export.pdf".into());
        save_tasks(&path, &[with_job.clone(), orphan.clone(), done.clone()]).unwrap();

        let api = Arc::new(InMemoryApi::new());
        api.script_job(
            "server-9",
            vec![JobSnapshot::completed(json!({ "download_url": "/d.pptx" })).into()],
        );
        let tracker = tracker(api, Arc::new(CollectingNotifier::new()), Some(path.clone()));

        let report = tracker.restore_active_tasks().await;
        assert_eq!(report.resumed, vec![with_job.id.clone()]);
        assert_eq!(report.orphaned, vec![orphan.id.clone()]);

        let resumed = tracker.wait(&with_job.id).await.unwrap();
        assert_eq!(resumed.download_url.as_deref(), Some("/d.pptx"));

        let orphan = tracker.get(&orphan.id).await.unwrap();
        assert_eq!(orphan.status, JobStatus::Failed);
        assert_eq!(orphan.error_message.as_deref(), Some(ORPHANED_EXPORT_MESSAGE));

        let persisted = load_tasks(&path).unwrap();
        assert!(persisted.iter().all(|t| t.status.is_terminal()));
    }

    #[tokio::test]
    async fn test_clear_finished_keeps_other_projects() {
        let api = Arc::new(InMemoryApi::new());
        let tracker = tracker(api, Arc::new(CollectingNotifier::new()), None);

        tracker.start_export("a", ExportKind::Pdf, None).await;
        tracker.start_export("b", ExportKind::Pptx, None).await;

        assert_eq!(tracker.clear_finished("a").await, 1);
        assert!(tracker.tasks_for_project("a").await.is_empty());
        assert_eq!(tracker.tasks_for_project("b").await.len(), 1);
    }
}
