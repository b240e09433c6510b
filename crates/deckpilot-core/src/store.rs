//! Optimistic project store.
//!
//! Holds the project being edited plus the async flags around it. Local
//! edits are merged immediately and before the matching request goes out;
//! the server snapshot replaces the local one on `sync`.
//!
//! The store is an explicit context object: create one per session, clone it
//! into tasks, and `reset` it to start over. Pollers started by the store run
//! under a view scope that `close_view` cancels, after which late results are
//! dropped instead of applied.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::api::DeckApi;
use crate::error::{normalize_error_message, ClientError, ClientResult};
use crate::jobs::{ActiveJobs, PollOutcome, TaskPoller};
use crate::models::{JobKind, JobRef, Page, PagePatch, Project, ProjectSettingsPatch, TaskProgress};
use crate::notify::{Notice, Notifier};

/// A free-text field the user can be typing into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EditableField {
    Outline,
    Description,
    ExtraRequirements,
    TemplateStyle,
}

/// Editing flag key; `page_id` is `None` for project-level fields.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EditingKey {
    pub page_id: Option<String>,
    pub field: EditableField,
}

impl EditingKey {
    pub fn page(page_id: impl Into<String>, field: EditableField) -> Self {
        Self {
            page_id: Some(page_id.into()),
            field,
        }
    }

    pub fn project(field: EditableField) -> Self {
        Self {
            page_id: None,
            field,
        }
    }
}

/// Everything the store holds
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoreState {
    pub current_project: Option<Project>,
    pub is_global_loading: bool,
    pub error: Option<String>,
    pub active_task_id: Option<String>,
    pub task_progress: Option<TaskProgress>,
    /// page id -> image generation job id
    pub page_generating_tasks: HashMap<String, String>,
    pub editing: HashSet<EditingKey>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    Synced,
    /// A field is being edited; nothing was fetched
    SkippedEditing,
}

#[derive(Clone)]
pub struct ProjectStore {
    api: Arc<dyn DeckApi>,
    poller: TaskPoller,
    notifier: Arc<dyn Notifier>,
    state: Arc<RwLock<StoreState>>,
    active: ActiveJobs,
    view: Arc<Mutex<CancellationToken>>,
    /// page id -> task reconciling that page's generation
    generation_workers: Arc<Mutex<HashMap<String, JoinHandle<()>>>>,
}

impl ProjectStore {
    pub fn new(api: Arc<dyn DeckApi>, poller: TaskPoller, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            api,
            poller,
            notifier,
            state: Arc::new(RwLock::new(StoreState::default())),
            active: ActiveJobs::new(),
            view: Arc::new(Mutex::new(CancellationToken::new())),
            generation_workers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub async fn snapshot(&self) -> StoreState {
        self.state.read().await.clone()
    }

    pub async fn project(&self) -> Option<Project> {
        self.state.read().await.current_project.clone()
    }

    /// Jobs this store is polling
    pub fn active_jobs(&self) -> &ActiveJobs {
        &self.active
    }

    pub async fn set_current_project(&self, project: Option<Project>) {
        self.state.write().await.current_project = project;
    }

    pub async fn set_global_loading(&self, loading: bool) {
        self.state.write().await.is_global_loading = loading;
    }

    pub async fn set_error(&self, error: Option<String>) {
        self.state.write().await.error = error;
    }

    /// Merge `patch` into the page locally. No network call.
    ///
    /// Returns false when there is no such page.
    pub async fn update_local(&self, page_id: &str, patch: &PagePatch) -> bool {
        let mut state = self.state.write().await;
        match state
            .current_project
            .as_mut()
            .and_then(|p| p.page_mut(page_id))
        {
            Some(page) => {
                page.merge(patch);
                true
            }
            None => {
                tracing::debug!(page_id = %page_id, "Local update for unknown page ignored");
                false
            }
        }
    }

    /// Replace the snapshot with the server's.
    ///
    /// On failure the previous snapshot is kept and the error is recorded
    /// and notified.
    pub async fn sync(&self, project_id: &str) -> ClientResult<Project> {
        match self.api.get_project(project_id).await {
            Ok(project) => {
                let mut state = self.state.write().await;
                state.current_project = Some(project.clone());
                state.error = None;
                tracing::debug!(project_id = %project_id, pages = project.pages.len(), "Project synced");
                Ok(project)
            }
            Err(e) => {
                tracing::warn!(project_id = %project_id, error = %e, "Project sync failed");
                self.report(&e).await;
                Err(e)
            }
        }
    }

    /// `sync`, unless a field is being edited.
    pub async fn sync_if_idle(&self, project_id: &str) -> ClientResult<SyncOutcome> {
        if self.is_editing().await {
            tracing::debug!(project_id = %project_id, "Sync skipped while editing");
            return Ok(SyncOutcome::SkippedEditing);
        }
        self.sync(project_id).await?;
        Ok(SyncOutcome::Synced)
    }

    pub async fn begin_editing(&self, key: EditingKey) {
        self.state.write().await.editing.insert(key);
    }

    pub async fn end_editing(&self, key: &EditingKey) {
        self.state.write().await.editing.remove(key);
    }

    pub async fn is_editing(&self) -> bool {
        !self.state.read().await.editing.is_empty()
    }

    /// Merge locally, then persist. A failed save keeps the local edit.
    pub async fn save_page(
        &self,
        project_id: &str,
        page_id: &str,
        patch: &PagePatch,
    ) -> ClientResult<Page> {
        self.update_local(page_id, patch).await;
        match self.api.update_page(project_id, page_id, patch).await {
            Ok(page) => Ok(page),
            Err(e) => {
                tracing::warn!(page_id = %page_id, error = %e, "Saving page failed");
                self.report(&e).await;
                Err(e)
            }
        }
    }

    /// Persist project-level settings after applying them locally.
    pub async fn save_project_settings(
        &self,
        project_id: &str,
        patch: &ProjectSettingsPatch,
    ) -> ClientResult<Project> {
        {
            let mut state = self.state.write().await;
            if let Some(project) = state.current_project.as_mut().filter(|p| p.id == project_id) {
                project.merge_settings(patch);
            }
        }
        match self.api.update_project(project_id, patch).await {
            Ok(project) => {
                self.notifier.notify(Notice::success("Project settings saved"));
                Ok(project)
            }
            Err(e) => {
                tracing::warn!(project_id = %project_id, error = %e, "Saving settings failed");
                self.report(&e).await;
                Err(e)
            }
        }
    }

    /// Submit image generation for one page and track it.
    ///
    /// Returns the job id once submitted; the outcome is reconciled in the
    /// background and can be awaited with [`wait_for_page`](Self::wait_for_page).
    pub async fn generate_page_image(&self, project_id: &str, page_id: &str) -> ClientResult<String> {
        {
            // Reserve the page before submitting; an empty id marks the reservation
            let mut state = self.state.write().await;
            if state.page_generating_tasks.contains_key(page_id) {
                return Err(ClientError::validation("This page is already being generated"));
            }
            state
                .page_generating_tasks
                .insert(page_id.to_string(), String::new());
        }

        let task_id = match self.api.generate_page_image(project_id, page_id).await {
            Ok(id) => id,
            Err(e) => {
                tracing::warn!(page_id = %page_id, error = %e, "Image generation request failed");
                {
                    let mut state = self.state.write().await;
                    if state.page_generating_tasks.get(page_id).is_some_and(String::is_empty) {
                        state.page_generating_tasks.remove(page_id);
                    }
                }
                self.report(&e).await;
                return Err(e);
            }
        };

        {
            let mut state = self.state.write().await;
            state
                .page_generating_tasks
                .insert(page_id.to_string(), task_id.clone());
            state.active_task_id = Some(task_id.clone());
            state.task_progress = None;
        }
        tracing::info!(page_id = %page_id, task_id = %task_id, "Image generation started");

        let scope = self.view.lock().await.clone();
        let job = JobRef::for_project(task_id.clone(), JobKind::ImageGenerate, project_id);
        let progress_store = self.clone();
        let progress_task = task_id.clone();
        let handle = self.active.start(&self.poller, job, &scope, move |snapshot| {
            if let Some(progress) = snapshot.progress.clone() {
                let store = progress_store.clone();
                let task_id = progress_task.clone();
                tokio::spawn(async move {
                    let mut state = store.state.write().await;
                    // Dropped once the generation is finished or the view closed
                    if state.page_generating_tasks.values().any(|t| *t == task_id) {
                        state.task_progress = Some(progress);
                    }
                });
            }
        });

        let store = self.clone();
        let project_id = project_id.to_string();
        let worker_page = page_id.to_string();
        let worker_task = task_id.clone();
        let worker = tokio::spawn(async move {
            let outcome = handle.outcome().await;
            if scope.is_cancelled() {
                // View closed; nobody is interested in this result
                return;
            }
            store
                .finish_generation(&project_id, &worker_page, &worker_task, outcome)
                .await;
        });
        self.generation_workers
            .lock()
            .await
            .insert(page_id.to_string(), worker);

        Ok(task_id)
    }

    async fn finish_generation(
        &self,
        project_id: &str,
        page_id: &str,
        task_id: &str,
        outcome: PollOutcome,
    ) {
        {
            let mut state = self.state.write().await;
            if state.page_generating_tasks.get(page_id).map(String::as_str) == Some(task_id) {
                state.page_generating_tasks.remove(page_id);
            }
            if state.active_task_id.as_deref() == Some(task_id) {
                state.active_task_id = None;
                state.task_progress = None;
            }
        }

        match outcome {
            PollOutcome::Completed(_) => {
                let applied = match self.sync_if_idle(project_id).await {
                    Ok(SyncOutcome::Synced) => true,
                    Ok(SyncOutcome::SkippedEditing) => {
                        self.apply_page_image(project_id, page_id).await.is_ok()
                    }
                    Err(_) => false,
                };
                if applied {
                    self.notifier.notify(Notice::success("Page image generated"));
                }
            }
            PollOutcome::Cancelled => {}
            other => {
                let message = other
                    .failure_message()
                    .unwrap_or_else(|| normalize_error_message(None));
                self.state.write().await.error = Some(message.clone());
                self.notifier.notify(Notice::error(message));
            }
        }
    }

    /// Take only the generated image of one page from the server, leaving
    /// every other local field alone.
    async fn apply_page_image(&self, project_id: &str, page_id: &str) -> ClientResult<()> {
        let server = match self.api.get_project(project_id).await {
            Ok(project) => project,
            Err(e) => {
                tracing::warn!(project_id = %project_id, error = %e, "Fetching generated image failed");
                self.report(&e).await;
                return Err(e);
            }
        };
        let Some(page) = server.pages.iter().find(|p| p.id == page_id) else {
            tracing::debug!(page_id = %page_id, "Generated page no longer on the server");
            return Ok(());
        };
        let patch = PagePatch {
            generated_image_path: page.generated_image_path.clone(),
            status: page.status,
            ..Default::default()
        };
        self.update_local(page_id, &patch).await;
        tracing::debug!(page_id = %page_id, "Generated image applied while editing");
        Ok(())
    }

    /// Wait until the page's generation has been reconciled.
    pub async fn wait_for_page(&self, page_id: &str) {
        let worker = self.generation_workers.lock().await.remove(page_id);
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                tracing::warn!(page_id = %page_id, error = %e, "Generation worker ended abnormally");
            }
        }
    }

    pub async fn is_generating(&self, page_id: &str) -> bool {
        self.state
            .read()
            .await
            .page_generating_tasks
            .contains_key(page_id)
    }

    /// Stop every poller started by this store. Server jobs keep running.
    pub async fn close_view(&self) {
        {
            let mut view = self.view.lock().await;
            view.cancel();
            *view = CancellationToken::new();
        }
        self.active.dismiss_all();
        self.generation_workers.lock().await.clear();
        let mut state = self.state.write().await;
        state.page_generating_tasks.clear();
        state.active_task_id = None;
        state.task_progress = None;
    }

    /// Back to the initial state.
    pub async fn reset(&self) {
        self.close_view().await;
        *self.state.write().await = StoreState::default();
    }

    async fn report(&self, error: &ClientError) {
        let message = error.user_message();
        self.state.write().await.error = Some(message.clone());
        self.notifier.notify(Notice::error(message));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::api::memory::InMemoryApi;
    use crate::jobs::PollConfig;
    use crate::models::{JobSnapshot, JobStatus, OutlineContent};
    use crate::notify::CollectingNotifier;

    fn project() -> Project {
        let mut project = Project::new("p-1");
        let mut page = Page::new("page-1");
        page.outline_content = Some(OutlineContent {
            title: "Intro".into(),
            points: vec!["a".into()],
        });
        project.pages = vec![page, Page::new("page-2")];
        project
    }

    fn setup() -> (Arc<InMemoryApi>, Arc<CollectingNotifier>, ProjectStore) {
        let api = Arc::new(InMemoryApi::new());
        api.insert_project(project());
        let notifier = Arc::new(CollectingNotifier::new());
        let poller = TaskPoller::new(api.clone(), PollConfig::default());
        let store = ProjectStore::new(api.clone(), poller, notifier.clone());
        (api, notifier, store)
    }

    #[tokio::test]
    async fn test_update_local_is_idempotent() {
        let (_api, _notifier, store) = setup();
        store.sync("p-1").await.unwrap();

        let patch = PagePatch::description("Body text");
        assert!(store.update_local("page-1", &patch).await);
        let once = store.snapshot().await;
        assert!(store.update_local("page-1", &patch).await);
        let twice = store.snapshot().await;

        assert_eq!(once, twice);
        let page = twice.current_project.unwrap().pages[0].clone();
        assert_eq!(page.outline_content.unwrap().title, "Intro");
        assert_eq!(page.description_content.unwrap().to_text(), "Body text");
    }

    #[tokio::test]
    async fn test_update_local_unknown_page_is_noop() {
        let (_api, _notifier, store) = setup();
        assert!(!store.update_local("page-1", &PagePatch::description("x")).await);

        store.sync("p-1").await.unwrap();
        let before = store.snapshot().await;
        assert!(!store.update_local("missing", &PagePatch::description("x")).await);
        assert_eq!(store.snapshot().await, before);
    }

    #[tokio::test]
    async fn test_sync_keeps_identity() {
        let (_api, _notifier, store) = setup();
        let first = store.sync("p-1").await.unwrap();
        let second = store.sync("p-1").await.unwrap();
        assert_eq!(first.id, second.id);
    }

    #[tokio::test]
    async fn test_failed_sync_preserves_snapshot() {
        let (api, notifier, store) = setup();
        store.sync("p-1").await.unwrap();
        store
            .update_local("page-2", &PagePatch::description("unsaved"))
            .await;
        let before = store.snapshot().await.current_project;

        api.fail_operation("get_project", "connection reset");
        let err = store.sync("p-1").await.unwrap_err();

        assert!(matches!(err, ClientError::Transport(_)));
        let after = store.snapshot().await;
        assert_eq!(after.current_project, before);
        assert!(after.error.is_some());
        assert_eq!(notifier.errors().len(), 1);
    }

    #[tokio::test]
    async fn test_sync_if_idle_skips_while_editing() {
        let (api, _notifier, store) = setup();
        store.sync("p-1").await.unwrap();
        store
            .update_local("page-1", &PagePatch::description("typing"))
            .await;

        let key = EditingKey::page("page-1", EditableField::Description);
        store.begin_editing(key.clone()).await;
        api.update_page("p-1", "page-1", &PagePatch::description("server"))
            .await
            .unwrap();

        assert_eq!(store.sync_if_idle("p-1").await.unwrap(), SyncOutcome::SkippedEditing);
        let page = store.project().await.unwrap().pages[0].clone();
        assert_eq!(page.description_content.unwrap().to_text(), "typing");

        store.end_editing(&key).await;
        assert_eq!(store.sync_if_idle("p-1").await.unwrap(), SyncOutcome::Synced);
        let page = store.project().await.unwrap().pages[0].clone();
        assert_eq!(page.description_content.unwrap().to_text(), "server");
    }

    #[tokio::test]
    async fn test_failed_save_keeps_local_edit() {
        let (api, notifier, store) = setup();
        store.sync("p-1").await.unwrap();
        api.fail_operation("update_page", "connection reset");

        let patch = PagePatch::outline("Renamed", vec![]);
        assert!(store.save_page("p-1", "page-1", &patch).await.is_err());

        let page = store.project().await.unwrap().pages[0].clone();
        assert_eq!(page.outline_content.unwrap().title, "Renamed");
        assert_eq!(notifier.errors().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_generate_page_image_reconciles() {
        let (api, notifier, store) = setup();
        api.set_default_job_script(vec![
            JobStatus::Processing.into(),
            JobStatus::Completed.into(),
        ]);
        store.sync("p-1").await.unwrap();

        let task_id = store.generate_page_image("p-1", "page-1").await.unwrap();
        assert!(store.is_generating("page-1").await);
        assert!(store.active_jobs().contains(&task_id));

        let err = store.generate_page_image("p-1", "page-1").await.unwrap_err();
        assert!(matches!(err, ClientError::Validation(_)));

        store.wait_for_page("page-1").await;

        let state = store.snapshot().await;
        assert!(state.page_generating_tasks.is_empty());
        assert!(state.active_task_id.is_none());
        let page = state.current_project.unwrap().pages[0].clone();
        assert_eq!(page.generated_image_path.as_deref(), Some("/files/p-1/page-1.png"));
        assert!(notifier.errors().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_generation_failure_is_normalized() {
        let (api, notifier, store) = setup();
        api.set_default_job_script(vec![JobSnapshot::failed("No template image found").into()]);
        store.sync("p-1").await.unwrap();

        store.generate_page_image("p-1", "page-2").await.unwrap();
        store.wait_for_page("page-2").await;

        let errors = notifier.errors();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("no template yet"));
        assert!(!store.is_generating("page-2").await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_view_drops_late_results() {
        let (api, notifier, store) = setup();
        api.set_default_job_script(vec![
            JobStatus::Processing.into(),
            JobStatus::Processing.into(),
            JobStatus::Completed.into(),
        ]);
        store.sync("p-1").await.unwrap();

        let task_id = store.generate_page_image("p-1", "page-1").await.unwrap();
        tokio::time::sleep(Duration::from_millis(2_500)).await;
        store.close_view().await;

        tokio::time::sleep(Duration::from_secs(30)).await;
        let calls = api.status_calls(&task_id);
        assert!(calls <= 2, "calls = {calls}");

        let state = store.snapshot().await;
        assert!(state.page_generating_tasks.is_empty());
        assert!(state.current_project.unwrap().pages[0]
            .generated_image_path
            .is_none());
        assert!(notifier.notices().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_generation_keeps_field_being_edited() {
        let (api, notifier, store) = setup();
        api.set_default_job_script(vec![
            JobStatus::Processing.into(),
            JobStatus::Completed.into(),
        ]);
        store.sync("p-1").await.unwrap();

        store.generate_page_image("p-1", "page-1").await.unwrap();
        let key = EditingKey::page("page-2", EditableField::Description);
        store.begin_editing(key.clone()).await;
        store
            .update_local("page-2", &PagePatch::description("unsaved typing"))
            .await;

        store.wait_for_page("page-1").await;

        let state = store.snapshot().await;
        assert!(state.editing.contains(&key));
        let project = state.current_project.unwrap();
        assert_eq!(
            project.pages[0].generated_image_path.as_deref(),
            Some("/files/p-1/page-1.png")
        );
        assert_eq!(
            project.pages[1].description_content.clone().unwrap().to_text(),
            "unsaved typing"
        );
        assert!(notifier.errors().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_generation_submits_once() {
        let (api, _notifier, store) = setup();
        api.set_default_job_script(vec![JobStatus::Processing.into()]);
        api.set_latency(Duration::from_millis(100));
        store.sync("p-1").await.unwrap();

        let (first, second) = tokio::join!(
            store.generate_page_image("p-1", "page-1"),
            store.generate_page_image("p-1", "page-1"),
        );

        let (ok, err) = match (first, second) {
            (Ok(id), Err(e)) | (Err(e), Ok(id)) => (id, e),
            other => panic!("expected one submission, got {:?}", other),
        };
        assert!(matches!(err, ClientError::Validation(_)));
        assert_eq!(api.image_job_count(), 1);
        assert_eq!(
            store.snapshot().await.page_generating_tasks.get("page-1"),
            Some(&ok)
        );
        store.close_view().await;
    }

    #[tokio::test]
    async fn test_failed_submit_releases_page() {
        let (api, _notifier, store) = setup();
        store.sync("p-1").await.unwrap();
        api.fail_operation("generate_page_image", "connection reset");

        assert!(store.generate_page_image("p-1", "page-1").await.is_err());
        assert!(!store.is_generating("page-1").await);

        api.clear_failure("generate_page_image");
        assert!(store.generate_page_image("p-1", "page-1").await.is_ok());
        store.close_view().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_progress_dropped_after_generation_ends() {
        let (api, _notifier, store) = setup();
        let progress = TaskProgress {
            total: 1,
            completed: 1,
            ..Default::default()
        };
        let mut running = JobSnapshot::with_status(JobStatus::Processing);
        running.progress = Some(progress.clone());
        let mut done = JobSnapshot::with_status(JobStatus::Completed);
        done.progress = Some(progress);
        api.set_default_job_script(vec![running.into(), done.into()]);
        store.sync("p-1").await.unwrap();

        store.generate_page_image("p-1", "page-1").await.unwrap();
        store.wait_for_page("page-1").await;
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        let state = store.snapshot().await;
        assert!(state.active_task_id.is_none());
        assert!(state.task_progress.is_none());
    }

    #[tokio::test]
    async fn test_reset_restores_initial_state() {
        let (_api, _notifier, store) = setup();
        store.sync("p-1").await.unwrap();
        store.set_global_loading(true).await;
        store
            .begin_editing(EditingKey::project(EditableField::TemplateStyle))
            .await;

        store.reset().await;
        assert_eq!(store.snapshot().await, StoreState::default());
    }

    #[tokio::test]
    async fn test_save_project_settings() {
        let (api, notifier, store) = setup();
        store.sync("p-1").await.unwrap();

        let patch = ProjectSettingsPatch {
            template_style: Some("minimal".into()),
            ..Default::default()
        };
        store.save_project_settings("p-1", &patch).await.unwrap();

        assert_eq!(
            store.project().await.unwrap().template_style.as_deref(),
            Some("minimal")
        );
        assert_eq!(
            api.project("p-1").unwrap().template_style.as_deref(),
            Some("minimal")
        );
        assert_eq!(notifier.notices().len(), 1);
    }
}
