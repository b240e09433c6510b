use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use deckpilot_core::export::{self, ExportKind, ExportTask, RestoreReport};
use deckpilot_core::models::{
    FileScope, FileUpload, Job, JobKind, JobRef, JobSnapshot, JobStatus, OutlineContent, Page,
    PageStatus, Project, ReferenceFile,
};
use deckpilot_core::project::{self, ProjectStage};
use deckpilot_core::region::{self, DisplaySize, SelectionRect};
use deckpilot_core::services::{ServiceKind, ServiceSettings, ServiceTestState};
use deckpilot_core::{ClientState, InMemoryApi, PollOutcome};

use crate::error::{CommandError, CommandResult, ResultExt};

/// Project overview
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectSummary {
    pub id: String,
    pub title: String,
    pub status: String,
    pub stage: ProjectStage,
    pub route: String,
    pub first_image: Option<String>,
    pub pages: Vec<PageSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageSummary {
    pub id: String,
    pub title: String,
    pub has_description: bool,
    pub image: Option<String>,
}

impl PageSummary {
    fn of(page: &Page, index: usize) -> Self {
        Self {
            id: page.id.clone(),
            title: page
                .outline_content
                .as_ref()
                .map(|o| o.title.clone())
                .filter(|t| !t.is_empty())
                .unwrap_or_else(|| format!("Page {}", index + 1)),
            has_description: page.description_content.is_some(),
            image: page.generated_image_path.clone(),
        }
    }
}

/// Reference file as listed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileInfo {
    pub id: String,
    pub filename: String,
    pub size: String,
    pub parse_status: String,
    pub project_id: Option<String>,
    pub created_at: Option<String>,
    pub error_message: Option<String>,
}

impl From<&ReferenceFile> for FileInfo {
    fn from(file: &ReferenceFile) -> Self {
        Self {
            id: file.id.clone(),
            filename: file.filename.clone(),
            size: project::format_file_size(file.file_size),
            parse_status: file.parse_status.to_string(),
            project_id: file.project_id.clone(),
            created_at: file.created_at.as_deref().map(project::format_date),
            error_message: file.error_message.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadSummary {
    pub uploaded: Vec<FileInfo>,
    pub failed: Vec<UploadError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadError {
    pub filename: String,
    pub error: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkdownDoc {
    Outline,
    Descriptions,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarkdownExport {
    pub filename: String,
    pub markdown: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResumeSummary {
    pub resumed: usize,
    pub orphaned: usize,
    pub tasks: Vec<ExportTask>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CropResult {
    pub path: PathBuf,
    pub width: u32,
    pub height: u32,
}

// ============================================================================
// Projects
// ============================================================================

/// Fetch a project and summarize it
pub async fn show_project(state: &ClientState, project_id: &str) -> CommandResult<ProjectSummary> {
    let project = state.store.sync(project_id).await?;
    Ok(summarize(&project))
}

fn summarize(project: &Project) -> ProjectSummary {
    ProjectSummary {
        id: project.id.clone(),
        title: project::project_title(project),
        status: project::status_text(project).to_string(),
        stage: ProjectStage::of(project),
        route: project::project_route(project),
        first_image: project::first_page_image(project),
        pages: project
            .pages
            .iter()
            .enumerate()
            .map(|(i, p)| PageSummary::of(p, i))
            .collect(),
    }
}

/// Render the outline or the descriptions of a project as Markdown
pub async fn project_markdown(
    state: &ClientState,
    project_id: &str,
    doc: MarkdownDoc,
) -> CommandResult<MarkdownExport> {
    let project = state.store.sync(project_id).await?;
    let now = Utc::now();
    Ok(match doc {
        MarkdownDoc::Outline => MarkdownExport {
            filename: project::outline_filename(&project),
            markdown: project::outline_markdown(&project, now),
        },
        MarkdownDoc::Descriptions => MarkdownExport {
            filename: project::descriptions_filename(&project),
            markdown: project::descriptions_markdown(&project, now),
        },
    })
}

/// Generate one page image and wait for the project to be reconciled
pub async fn generate_image(
    state: &ClientState,
    project_id: &str,
    page_id: &str,
) -> CommandResult<PageSummary> {
    state.store.sync(project_id).await?;
    state.store.set_error(None).await;

    let task_id = state.store.generate_page_image(project_id, page_id).await?;
    tracing::info!(task_id = %task_id, page_id = %page_id, "Waiting for page image");
    state.store.wait_for_page(page_id).await;

    if let Some(error) = state.store.snapshot().await.error {
        return Err(CommandError::task_failed(error));
    }
    let project = state
        .store
        .project()
        .await
        .ok_or_else(|| CommandError::not_found("Project", project_id))?;
    project
        .pages
        .iter()
        .enumerate()
        .find(|(_, p)| p.id == page_id)
        .map(|(i, p)| PageSummary::of(p, i))
        .ok_or_else(|| CommandError::not_found("Page", page_id))
}

// ============================================================================
// Reference files
// ============================================================================

pub async fn list_files(state: &ClientState, scope: FileScope) -> CommandResult<Vec<FileInfo>> {
    let tracker = state.file_tracker(state.selection_mode());
    tracker.load(scope).await?;
    Ok(tracker.files().await.iter().map(FileInfo::from).collect())
}

/// Upload local files. With `wait`, keep polling until every upload is parsed.
pub async fn upload_files(
    state: &ClientState,
    scope: FileScope,
    paths: &[PathBuf],
    wait: bool,
    cancel: &CancellationToken,
) -> CommandResult<UploadSummary> {
    if paths.is_empty() {
        return Err(CommandError::invalid_argument("No files given"));
    }

    let mut uploads = Vec::with_capacity(paths.len());
    for path in paths {
        let filename = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| CommandError::invalid_argument(format!("Invalid path: {:?}", path)))?;
        let bytes = tokio::fs::read(path).await.storage_err()?;
        uploads.push(FileUpload::new(filename, bytes));
    }

    let tracker = state.file_tracker(state.selection_mode());
    tracker.load(scope).await?;
    let report = tracker.upload(uploads).await;

    if wait {
        tracker.poll_until_idle(cancel).await;
    }

    let mut uploaded = Vec::with_capacity(report.uploaded.len());
    for file in &report.uploaded {
        let latest = tracker.file(&file.id).await;
        uploaded.push(FileInfo::from(latest.as_ref().unwrap_or(file)));
    }
    Ok(UploadSummary {
        uploaded,
        failed: report
            .failures
            .into_iter()
            .map(|f| UploadError {
                filename: f.filename,
                error: f.message,
            })
            .collect(),
    })
}

/// Select files, trigger parsing of pending ones and wait for them
pub async fn parse_files(
    state: &ClientState,
    scope: FileScope,
    file_ids: Vec<String>,
    cancel: &CancellationToken,
) -> CommandResult<Vec<FileInfo>> {
    let tracker = state.file_tracker(state.selection_mode());
    tracker.load(scope).await?;
    for id in &file_ids {
        if tracker.file(id).await.is_none() {
            return Err(CommandError::not_found("File", id));
        }
    }
    tracker.set_selection(file_ids.clone()).await;

    let selected = tracker.confirm_selection().await?;
    tracker.poll_until_idle(cancel).await;

    let mut files = Vec::with_capacity(selected.len());
    for file in &selected {
        let latest = tracker.file(&file.id).await;
        files.push(FileInfo::from(latest.as_ref().unwrap_or(file)));
    }
    Ok(files)
}

pub async fn preview_file(state: &ClientState, file_id: &str) -> CommandResult<String> {
    let tracker = state.file_tracker(state.selection_mode());
    Ok(tracker.preview(file_id).await?)
}

pub async fn delete_file(state: &ClientState, file_id: &str) -> CommandResult<()> {
    let tracker = state.file_tracker(state.selection_mode());
    Ok(tracker.delete(file_id).await?)
}

// ============================================================================
// Exports
// ============================================================================

/// Start an export. Without `wait` an async export is left running on the
/// server and can be picked up later with `tasks resume`.
pub async fn start_export(
    state: &ClientState,
    project_id: &str,
    kind: ExportKind,
    page_ids: Option<Vec<String>>,
    wait: bool,
) -> CommandResult<ExportTask> {
    // Merge what is on disk so saving does not drop older records
    state.exports.restore_active_tasks().await;
    let task = state.exports.start_export(project_id, kind, page_ids).await;

    let task = if wait && task.is_active() {
        state.exports.wait(&task.id).await.unwrap_or(task)
    } else {
        task
    };
    state.exports.stop_all().await;

    match task.status {
        JobStatus::Failed => Err(CommandError::task_failed(
            task.error_message
                .clone()
                .unwrap_or_else(|| "Export failed".to_string()),
        )),
        _ => Ok(task),
    }
}

/// Persisted export records, newest first
pub async fn list_tasks(
    state: &ClientState,
    project_id: Option<&str>,
) -> CommandResult<Vec<ExportTask>> {
    let mut tasks = export::load_tasks(&state.config.export_tasks_file)?;
    if let Some(project_id) = project_id {
        tasks.retain(|t| t.project_id == project_id);
    }
    tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    Ok(tasks)
}

/// Resume polling of exports left running and wait for them
pub async fn resume_tasks(state: &ClientState) -> CommandResult<ResumeSummary> {
    let RestoreReport { resumed, orphaned } = state.exports.restore_active_tasks().await;

    let mut tasks = Vec::with_capacity(resumed.len());
    for id in &resumed {
        if let Some(task) = state.exports.wait(id).await {
            tasks.push(task);
        }
    }
    Ok(ResumeSummary {
        resumed: resumed.len(),
        orphaned: orphaned.len(),
        tasks,
    })
}

// ============================================================================
// Jobs and services
// ============================================================================

/// Poll any job until it finishes
pub async fn wait_job(
    state: &ClientState,
    job: JobRef,
    cancel: &CancellationToken,
) -> CommandResult<Job> {
    let mut tracked = Job::submitted(&job);
    let outcome = state
        .poller
        .run(&job, cancel, |snapshot: &JobSnapshot| {
            if let Some(progress) = &snapshot.progress {
                tracing::info!(
                    job_id = %job.id,
                    completed = progress.completed,
                    total = progress.total,
                    "Progress"
                );
            }
        })
        .await;

    if let Some(snapshot) = outcome.snapshot() {
        tracked.apply(snapshot);
    }
    let message = outcome.failure_message();
    match outcome {
        PollOutcome::Completed(_) => Ok(tracked),
        PollOutcome::QueryFailed(e) => Err(e.into()),
        PollOutcome::Cancelled => Err(CommandError::internal("Cancelled")),
        PollOutcome::TimedOut { .. } => Err(CommandError::TaskTimedOut {
            message: message.unwrap_or_default(),
        }),
        PollOutcome::Failed { .. } => Err(CommandError::task_failed(
            message.unwrap_or_else(|| "Task failed".to_string()),
        )),
    }
}

pub async fn test_service(
    state: &ClientState,
    service: ServiceKind,
    settings: ServiceSettings,
) -> CommandResult<ServiceTestState> {
    match state.services.run(service, settings).await {
        ServiceTestState::Error { message } => Err(CommandError::task_failed(message)),
        other => Ok(other),
    }
}

// ============================================================================
// Region capture
// ============================================================================

/// Crop a region of a local image into `out_dir`
pub async fn crop_region(
    source: &Path,
    display: DisplaySize,
    rect: SelectionRect,
    min_px: f64,
    out_dir: &Path,
) -> CommandResult<Option<CropResult>> {
    let bytes = tokio::fs::read(source).await.storage_err()?;
    let Some(region) = region::capture_region(&bytes, display, &rect, min_px)? else {
        return Ok(None);
    };

    tokio::fs::create_dir_all(out_dir).await.storage_err()?;
    let path = out_dir.join(&region.filename);
    tokio::fs::write(&path, &region.png).await.storage_err()?;
    tracing::info!(path = %path.display(), "Region saved");

    Ok(Some(CropResult {
        path,
        width: region.width,
        height: region.height,
    }))
}

// ============================================================================
// Offline backend
// ============================================================================

/// In-memory backend with one sample project, for trying the CLI offline
pub fn demo_backend() -> Arc<InMemoryApi> {
    let api = Arc::new(InMemoryApi::new());

    let mut project = Project::new("demo");
    project.idea_prompt = Some("Product launch deck".to_string());
    for (i, (title, points)) in [
        ("Welcome", vec!["Who we are", "Why now"]),
        ("The product", vec!["Features", "Pricing"]),
    ]
    .into_iter()
    .enumerate()
    {
        let mut page = Page::new(format!("page-{}", i + 1));
        page.order_index = Some(i as i64);
        page.status = Some(PageStatus::Draft);
        page.outline_content = Some(OutlineContent {
            title: title.to_string(),
            points: points.into_iter().map(str::to_string).collect(),
        });
        project.pages.push(page);
    }
    api.insert_project(project);

    api.set_default_job_script(vec![
        JobStatus::Processing.into(),
        JobSnapshot::completed(serde_json::json!({
            "download_url": "/files/demo/export.pptx",
            "reply": "ok",
        }))
        .into(),
    ]);
    api
}

/// Parse a job kind argument
pub fn parse_job_kind(value: &str) -> CommandResult<JobKind> {
    value.parse().invalid_arg()
}
