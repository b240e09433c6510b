//! Scripted in-process backend.
//!
//! Holds projects and reference files in memory and answers status queries
//! from per-job scripts. Used for offline runs of the CLI and as the backend
//! double in tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use super::DeckApi;
use crate::error::{ClientError, ClientResult};
use crate::export::ExportKind;
use crate::models::{
    FileScope, FileUpload, JobKind, JobRef, JobSnapshot, JobStatus, Page, PagePatch, ParseStatus,
    Project, ProjectSettingsPatch, ReferenceFile,
};
use crate::services::{ServiceKind, ServiceSettings};

/// One scripted status-query answer.
#[derive(Debug, Clone)]
pub enum Scripted {
    Snapshot(JobSnapshot),
    /// Simulates a transport failure for that query
    NetworkError(String),
}

impl From<JobSnapshot> for Scripted {
    fn from(snapshot: JobSnapshot) -> Self {
        Scripted::Snapshot(snapshot)
    }
}

impl From<JobStatus> for Scripted {
    fn from(status: JobStatus) -> Self {
        Scripted::Snapshot(JobSnapshot::with_status(status))
    }
}

#[derive(Default)]
struct Backend {
    projects: HashMap<String, Project>,
    files: Vec<ReferenceFile>,
    job_scripts: HashMap<String, VecDeque<Scripted>>,
    default_job_script: Vec<Scripted>,
    file_scripts: HashMap<String, VecDeque<ParseStatus>>,
    image_jobs: HashMap<String, (String, String)>,
    status_calls: HashMap<String, usize>,
    failing_ops: HashMap<String, String>,
    failing_files: HashSet<String>,
    rejected_uploads: HashMap<String, String>,
    upload_status: Option<ParseStatus>,
    parse_triggers: Vec<String>,
    page_updates: Vec<(String, PagePatch)>,
    service_settings: Vec<(ServiceKind, ServiceSettings)>,
    next_id: u64,
}

impl Backend {
    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{}-{}", prefix, self.next_id)
    }

    fn check(&self, op: &str) -> ClientResult<()> {
        match self.failing_ops.get(op) {
            Some(message) => Err(ClientError::Transport(message.clone())),
            None => Ok(()),
        }
    }

    fn file_mut(&mut self, file_id: &str) -> Option<&mut ReferenceFile> {
        self.files.iter_mut().find(|f| f.id == file_id)
    }

    /// Pop the next scripted answer; the last entry repeats.
    fn next_scripted(&mut self, job_id: &str) -> Option<Scripted> {
        if !self.job_scripts.contains_key(job_id) && !self.default_job_script.is_empty() {
            let script = self.default_job_script.iter().cloned().collect();
            self.job_scripts.insert(job_id.to_string(), script);
        }
        let script = self.job_scripts.get_mut(job_id)?;
        if script.len() > 1 {
            script.pop_front()
        } else {
            script.front().cloned()
        }
    }

    fn advance_file(&mut self, file_id: &str) {
        let next = match self.file_scripts.get_mut(file_id) {
            Some(script) if script.len() > 1 => script.pop_front(),
            Some(script) => script.front().copied(),
            None => None,
        };
        if let (Some(status), Some(file)) = (next, self.file_mut(file_id)) {
            file.parse_status = status;
            if status == ParseStatus::Completed && file.markdown_content.is_none() {
                file.markdown_content = Some(format!("# {}\n", file.filename));
            }
        }
    }
}

/// In-memory [`DeckApi`] implementation
#[derive(Default)]
pub struct InMemoryApi {
    backend: Mutex<Backend>,
    latency: Mutex<Option<Duration>>,
}

impl InMemoryApi {
    pub fn new() -> Self {
        Self::default()
    }

    fn backend(&self) -> MutexGuard<'_, Backend> {
        self.backend
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn simulate_latency(&self) {
        let latency = *self
            .latency
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }

    /// Delay every call by this much
    pub fn set_latency(&self, latency: Duration) {
        *self
            .latency
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(latency);
    }

    pub fn insert_project(&self, project: Project) {
        self.backend().projects.insert(project.id.clone(), project);
    }

    pub fn project(&self, project_id: &str) -> Option<Project> {
        self.backend().projects.get(project_id).cloned()
    }

    pub fn insert_file(&self, file: ReferenceFile) {
        let mut backend = self.backend();
        backend.files.retain(|f| f.id != file.id);
        backend.files.push(file);
    }

    pub fn file(&self, file_id: &str) -> Option<ReferenceFile> {
        self.backend().files.iter().find(|f| f.id == file_id).cloned()
    }

    /// Script the answers for one job id
    pub fn script_job(&self, job_id: &str, script: Vec<Scripted>) {
        self.backend()
            .job_scripts
            .insert(job_id.to_string(), script.into());
    }

    /// Script used for jobs submitted without an explicit script
    pub fn set_default_job_script(&self, script: Vec<Scripted>) {
        self.backend().default_job_script = script;
    }

    /// Parse states a file walks through, one per lookup
    pub fn script_file(&self, file_id: &str, statuses: Vec<ParseStatus>) {
        self.backend()
            .file_scripts
            .insert(file_id.to_string(), statuses.into());
    }

    /// Make an operation fail with a transport error until cleared
    pub fn fail_operation(&self, op: &str, message: &str) {
        self.backend()
            .failing_ops
            .insert(op.to_string(), message.to_string());
    }

    pub fn clear_failure(&self, op: &str) {
        self.backend().failing_ops.remove(op);
    }

    /// Lookups of this file fail with a transport error
    pub fn fail_file_lookup(&self, file_id: &str) {
        self.backend().failing_files.insert(file_id.to_string());
    }

    /// Uploads with this filename are rejected by server-side validation
    pub fn reject_upload(&self, filename: &str, message: &str) {
        self.backend()
            .rejected_uploads
            .insert(filename.to_string(), message.to_string());
    }

    /// Parse status given to newly uploaded files (default: parsing)
    pub fn set_upload_status(&self, status: ParseStatus) {
        self.backend().upload_status = Some(status);
    }

    pub fn status_calls(&self, job_id: &str) -> usize {
        self.backend()
            .status_calls
            .get(job_id)
            .copied()
            .unwrap_or(0)
    }

    /// Image generation jobs submitted and not yet completed
    pub fn image_job_count(&self) -> usize {
        self.backend().image_jobs.len()
    }

    pub fn parse_triggers(&self) -> Vec<String> {
        self.backend().parse_triggers.clone()
    }

    pub fn page_updates(&self) -> Vec<(String, PagePatch)> {
        self.backend().page_updates.clone()
    }

    pub fn service_requests(&self) -> Vec<(ServiceKind, ServiceSettings)> {
        self.backend().service_settings.clone()
    }
}

#[async_trait]
impl DeckApi for InMemoryApi {
    async fn job_status(&self, job: &JobRef) -> ClientResult<JobSnapshot> {
        self.simulate_latency().await;
        if job.kind == JobKind::FileParse {
            *self
                .backend()
                .status_calls
                .entry(job.id.clone())
                .or_default() += 1;
            return Ok(self.get_reference_file(&job.id).await?.as_snapshot());
        }

        let mut backend = self.backend();
        backend.check("job_status")?;
        *backend.status_calls.entry(job.id.clone()).or_default() += 1;

        let scripted = backend
            .next_scripted(&job.id)
            .ok_or_else(|| ClientError::server(format!("Task {} not found", job.id)))?;

        match scripted {
            Scripted::NetworkError(message) => Err(ClientError::Transport(message)),
            Scripted::Snapshot(snapshot) => {
                if snapshot.status == JobStatus::Completed {
                    if let Some((project_id, page_id)) = backend.image_jobs.remove(&job.id) {
                        let image = format!("/files/{}/{}.png", project_id, page_id);
                        if let Some(page) = backend
                            .projects
                            .get_mut(&project_id)
                            .and_then(|p| p.page_mut(&page_id))
                        {
                            page.generated_image_path = Some(image);
                        }
                    }
                }
                Ok(snapshot)
            }
        }
    }

    async fn get_project(&self, project_id: &str) -> ClientResult<Project> {
        self.simulate_latency().await;
        let backend = self.backend();
        backend.check("get_project")?;
        backend
            .projects
            .get(project_id)
            .cloned()
            .ok_or_else(|| ClientError::Server {
                status: Some(404),
                message: format!("Project {} not found", project_id),
            })
    }

    async fn update_project(
        &self,
        project_id: &str,
        patch: &ProjectSettingsPatch,
    ) -> ClientResult<Project> {
        self.simulate_latency().await;
        let mut backend = self.backend();
        backend.check("update_project")?;
        let project = backend
            .projects
            .get_mut(project_id)
            .ok_or_else(|| ClientError::server(format!("Project {} not found", project_id)))?;
        project.merge_settings(patch);
        Ok(project.clone())
    }

    async fn update_page(
        &self,
        project_id: &str,
        page_id: &str,
        patch: &PagePatch,
    ) -> ClientResult<Page> {
        self.simulate_latency().await;
        let mut backend = self.backend();
        backend.check("update_page")?;
        backend
            .page_updates
            .push((page_id.to_string(), patch.clone()));
        let page = backend
            .projects
            .get_mut(project_id)
            .and_then(|p| p.page_mut(page_id))
            .ok_or_else(|| ClientError::server(format!("Page {} not found", page_id)))?;
        page.merge(patch);
        Ok(page.clone())
    }

    async fn generate_page_image(&self, project_id: &str, page_id: &str) -> ClientResult<String> {
        self.simulate_latency().await;
        let mut backend = self.backend();
        backend.check("generate_page_image")?;
        let task_id = backend.next_id("task");
        backend
            .image_jobs
            .insert(task_id.clone(), (project_id.to_string(), page_id.to_string()));
        Ok(task_id)
    }

    async fn list_reference_files(&self, scope: &FileScope) -> ClientResult<Vec<ReferenceFile>> {
        self.simulate_latency().await;
        let backend = self.backend();
        backend.check("list_reference_files")?;
        Ok(backend
            .files
            .iter()
            .filter(|f| match scope {
                FileScope::All => true,
                FileScope::Unscoped => f.project_id.is_none(),
                FileScope::Project(id) => f.project_id.as_deref() == Some(id.as_str()),
            })
            .cloned()
            .collect())
    }

    async fn get_reference_file(&self, file_id: &str) -> ClientResult<ReferenceFile> {
        self.simulate_latency().await;
        let mut backend = self.backend();
        if backend.failing_files.contains(file_id) {
            return Err(ClientError::Transport(format!(
                "connection reset while fetching {}",
                file_id
            )));
        }
        backend.advance_file(file_id);
        backend
            .files
            .iter()
            .find(|f| f.id == file_id)
            .cloned()
            .ok_or_else(|| ClientError::Server {
                status: Some(404),
                message: format!("File {} not found", file_id),
            })
    }

    async fn upload_reference_file(
        &self,
        upload: &FileUpload,
        project_id: Option<&str>,
    ) -> ClientResult<ReferenceFile> {
        self.simulate_latency().await;
        let mut backend = self.backend();
        backend.check("upload_reference_file")?;
        if let Some(message) = backend.rejected_uploads.get(&upload.filename) {
            return Err(ClientError::Server {
                status: Some(400),
                message: message.clone(),
            });
        }
        let file = ReferenceFile {
            id: backend.next_id("file"),
            filename: upload.filename.clone(),
            file_size: upload.bytes.len() as u64,
            parse_status: backend.upload_status.unwrap_or(ParseStatus::Parsing),
            markdown_content: None,
            error_message: None,
            image_caption_failed_count: None,
            project_id: project_id.map(str::to_string),
            created_at: Some(chrono::Utc::now().to_rfc3339()),
        };
        backend.files.push(file.clone());
        Ok(file)
    }

    async fn trigger_file_parse(&self, file_id: &str) -> ClientResult<()> {
        self.simulate_latency().await;
        let mut backend = self.backend();
        backend.check("trigger_file_parse")?;
        backend.parse_triggers.push(file_id.to_string());
        if let Some(file) = backend.file_mut(file_id) {
            if file.parse_status == ParseStatus::Pending {
                file.parse_status = ParseStatus::Parsing;
            }
        }
        Ok(())
    }

    async fn delete_reference_file(&self, file_id: &str) -> ClientResult<()> {
        self.simulate_latency().await;
        let mut backend = self.backend();
        backend.check("delete_reference_file")?;
        let before = backend.files.len();
        backend.files.retain(|f| f.id != file_id);
        if backend.files.len() == before {
            return Err(ClientError::server(format!("File {} not found", file_id)));
        }
        Ok(())
    }

    async fn export_direct(
        &self,
        project_id: &str,
        kind: ExportKind,
        _page_ids: Option<&[String]>,
    ) -> ClientResult<String> {
        self.simulate_latency().await;
        self.backend().check("export_direct")?;
        Ok(format!("/files/{}/export.{}", project_id, kind.extension()))
    }

    async fn export_editable_pptx(
        &self,
        _project_id: &str,
        _page_ids: Option<&[String]>,
    ) -> ClientResult<String> {
        self.simulate_latency().await;
        let mut backend = self.backend();
        backend.check("export_editable_pptx")?;
        Ok(backend.next_id("export-task"))
    }

    async fn start_service_test(
        &self,
        service: ServiceKind,
        settings: &ServiceSettings,
    ) -> ClientResult<String> {
        self.simulate_latency().await;
        let mut backend = self.backend();
        backend.check("start_service_test")?;
        backend.service_settings.push((service, settings.clone()));
        Ok(backend.next_id("test"))
    }
}
