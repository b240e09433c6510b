//! Entities shared between the client and the REST backend.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What a server-side job does. Also selects the status endpoint to poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobKind {
    FileParse,
    ImageGenerate,
    ExportPptx,
    ExportPdf,
    ExportEditablePptx,
    ServiceTest,
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobKind::FileParse => write!(f, "file-parse"),
            JobKind::ImageGenerate => write!(f, "image-generate"),
            JobKind::ExportPptx => write!(f, "export-pptx"),
            JobKind::ExportPdf => write!(f, "export-pdf"),
            JobKind::ExportEditablePptx => write!(f, "export-editable-pptx"),
            JobKind::ServiceTest => write!(f, "service-test"),
        }
    }
}

impl std::str::FromStr for JobKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "file-parse" => Ok(JobKind::FileParse),
            "image-generate" => Ok(JobKind::ImageGenerate),
            "export-pptx" => Ok(JobKind::ExportPptx),
            "export-pdf" => Ok(JobKind::ExportPdf),
            "export-editable-pptx" => Ok(JobKind::ExportEditablePptx),
            "service-test" => Ok(JobKind::ServiceTest),
            other => Err(format!("unknown job kind: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobStatus {
    Pending,
    #[serde(alias = "RUNNING")]
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    /// No transition happens after a terminal status.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "PENDING"),
            JobStatus::Processing => write!(f, "PROCESSING"),
            JobStatus::Completed => write!(f, "COMPLETED"),
            JobStatus::Failed => write!(f, "FAILED"),
        }
    }
}

/// Progress counters reported by long jobs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskProgress {
    #[serde(default)]
    pub total: usize,
    #[serde(default)]
    pub completed: usize,
    #[serde(default)]
    pub failed: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub percent: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step: Option<String>,
}

/// Everything needed to ask the server about one job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobRef {
    pub id: String,
    pub kind: JobKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
}

impl JobRef {
    pub fn new(id: impl Into<String>, kind: JobKind) -> Self {
        Self {
            id: id.into(),
            kind,
            project_id: None,
        }
    }

    pub fn for_project(id: impl Into<String>, kind: JobKind, project_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind,
            project_id: Some(project_id.into()),
        }
    }
}

/// One status-query response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub status: JobStatus,
    #[serde(default)]
    pub progress: Option<TaskProgress>,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default, alias = "error_message")]
    pub error: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

impl JobSnapshot {
    pub fn with_status(status: JobStatus) -> Self {
        Self {
            status,
            progress: None,
            result: None,
            error: None,
            message: None,
        }
    }

    pub fn completed(result: serde_json::Value) -> Self {
        Self {
            result: Some(result),
            ..Self::with_status(JobStatus::Completed)
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::with_status(JobStatus::Failed)
        }
    }

    /// `result.download_url`, when the job produced a file.
    pub fn download_url(&self) -> Option<String> {
        self.result
            .as_ref()
            .and_then(|r| r.get("download_url"))
            .and_then(|u| u.as_str())
            .map(str::to_string)
    }
}

/// A server-tracked asynchronous unit of work as the client sees it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub kind: JobKind,
    #[serde(default)]
    pub project_id: Option<String>,
    pub status: JobStatus,
    #[serde(default)]
    pub progress: Option<TaskProgress>,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Job {
    /// A freshly submitted job.
    pub fn submitted(job: &JobRef) -> Self {
        Self {
            id: job.id.clone(),
            kind: job.kind,
            project_id: job.project_id.clone(),
            status: JobStatus::Pending,
            progress: None,
            result: None,
            error: None,
            created_at: Utc::now(),
        }
    }

    pub fn job_ref(&self) -> JobRef {
        JobRef {
            id: self.id.clone(),
            kind: self.kind,
            project_id: self.project_id.clone(),
        }
    }

    /// Apply a poll response. Ignored once the job is terminal.
    pub fn apply(&mut self, snapshot: &JobSnapshot) {
        if self.status.is_terminal() {
            return;
        }
        self.status = snapshot.status;
        if snapshot.progress.is_some() {
            self.progress = snapshot.progress.clone();
        }
        if snapshot.result.is_some() {
            self.result = snapshot.result.clone();
        }
        if snapshot.error.is_some() {
            self.error = snapshot.error.clone();
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParseStatus {
    Pending,
    Parsing,
    Completed,
    Failed,
}

impl ParseStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, ParseStatus::Completed | ParseStatus::Failed)
    }
}

impl std::fmt::Display for ParseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParseStatus::Pending => write!(f, "pending"),
            ParseStatus::Parsing => write!(f, "parsing"),
            ParseStatus::Completed => write!(f, "completed"),
            ParseStatus::Failed => write!(f, "failed"),
        }
    }
}

/// A document uploaded as source material for generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceFile {
    pub id: String,
    pub filename: String,
    #[serde(default)]
    pub file_size: u64,
    pub parse_status: ParseStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub markdown_content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_caption_failed_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
}

impl ReferenceFile {
    /// Map a file's parse state onto the generic job status.
    pub fn as_snapshot(&self) -> JobSnapshot {
        let status = match self.parse_status {
            ParseStatus::Pending => JobStatus::Pending,
            ParseStatus::Parsing => JobStatus::Processing,
            ParseStatus::Completed => JobStatus::Completed,
            ParseStatus::Failed => JobStatus::Failed,
        };
        JobSnapshot {
            status,
            progress: None,
            result: serde_json::to_value(self).ok(),
            error: self.error_message.clone(),
            message: None,
        }
    }
}

/// Which reference files a listing covers.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FileScope {
    /// Global and project files alike.
    All,
    /// Files not attached to any project.
    Unscoped,
    Project(String),
}

impl FileScope {
    /// Path segment used by the listing endpoint.
    pub fn as_path_segment(&self) -> &str {
        match self {
            FileScope::All => "all",
            FileScope::Unscoped => "none",
            FileScope::Project(id) => id,
        }
    }

    /// Project new uploads are attached to. Only a concrete project scope
    /// attaches; everything else uploads unscoped.
    pub fn upload_target(&self) -> Option<&str> {
        match self {
            FileScope::Project(id) => Some(id.as_str()),
            FileScope::All | FileScope::Unscoped => None,
        }
    }
}

impl std::str::FromStr for FileScope {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "all" => FileScope::All,
            "none" => FileScope::Unscoped,
            other => FileScope::Project(other.to_string()),
        })
    }
}

/// Bytes to upload as a reference file.
#[derive(Debug, Clone)]
pub struct FileUpload {
    pub filename: String,
    pub bytes: bytes::Bytes,
}

impl FileUpload {
    pub fn new(filename: impl Into<String>, bytes: impl Into<bytes::Bytes>) -> Self {
        Self {
            filename: filename.into(),
            bytes: bytes.into(),
        }
    }

    pub fn extension(&self) -> Option<String> {
        self.filename
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_lowercase())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct OutlineContent {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub points: Vec<String>,
}

/// Page description, either free text or a list of paragraphs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DescriptionContent {
    Text { text: String },
    Paragraphs { text_content: Vec<String> },
}

impl DescriptionContent {
    pub fn to_text(&self) -> String {
        match self {
            DescriptionContent::Text { text } => text.clone(),
            DescriptionContent::Paragraphs { text_content } => text_content.join("\n"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PageStatus {
    Draft,
    DescriptionGenerated,
    Generating,
    Completed,
    Failed,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page {
    pub id: String,
    #[serde(default)]
    pub order_index: Option<i64>,
    #[serde(default)]
    pub outline_content: Option<OutlineContent>,
    #[serde(default)]
    pub description_content: Option<DescriptionContent>,
    #[serde(default)]
    pub generated_image_path: Option<String>,
    #[serde(default)]
    pub status: Option<PageStatus>,
    #[serde(default)]
    pub updated_at: Option<String>,
}

impl Page {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            order_index: None,
            outline_content: None,
            description_content: None,
            generated_image_path: None,
            status: None,
            updated_at: None,
        }
    }

    /// Field-wise merge; absent patch fields leave the page untouched.
    pub fn merge(&mut self, patch: &PagePatch) {
        if let Some(order_index) = patch.order_index {
            self.order_index = Some(order_index);
        }
        if let Some(outline) = &patch.outline_content {
            self.outline_content = Some(outline.clone());
        }
        if let Some(description) = &patch.description_content {
            self.description_content = Some(description.clone());
        }
        if let Some(path) = &patch.generated_image_path {
            self.generated_image_path = Some(path.clone());
        }
        if let Some(status) = patch.status {
            self.status = Some(status);
        }
    }
}

/// Partial page update. Serialises only the fields that are set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PagePatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_index: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outline_content: Option<OutlineContent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description_content: Option<DescriptionContent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generated_image_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<PageStatus>,
}

impl PagePatch {
    pub fn outline(title: impl Into<String>, points: Vec<String>) -> Self {
        Self {
            outline_content: Some(OutlineContent {
                title: title.into(),
                points,
            }),
            ..Default::default()
        }
    }

    pub fn description(text: impl Into<String>) -> Self {
        Self {
            description_content: Some(DescriptionContent::Text { text: text.into() }),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtractorMethod {
    Hybrid,
    Mineru,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InpaintMethod {
    Hybrid,
    Generative,
    Baidu,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    #[serde(default)]
    pub idea_prompt: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub pages: Vec<Page>,
    #[serde(default)]
    pub template_image_path: Option<String>,
    #[serde(default)]
    pub extra_requirements: Option<String>,
    #[serde(default)]
    pub template_style: Option<String>,
    #[serde(default)]
    pub export_extractor_method: Option<ExtractorMethod>,
    #[serde(default)]
    pub export_inpaint_method: Option<InpaintMethod>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
}

impl Project {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            idea_prompt: None,
            status: None,
            pages: Vec::new(),
            template_image_path: None,
            extra_requirements: None,
            template_style: None,
            export_extractor_method: None,
            export_inpaint_method: None,
            created_at: None,
            updated_at: None,
        }
    }

    pub fn page(&self, page_id: &str) -> Option<&Page> {
        self.pages.iter().find(|p| p.id == page_id)
    }

    pub fn page_mut(&mut self, page_id: &str) -> Option<&mut Page> {
        self.pages.iter_mut().find(|p| p.id == page_id)
    }

    /// Apply project-level settings locally.
    pub fn merge_settings(&mut self, patch: &ProjectSettingsPatch) {
        if let Some(v) = &patch.extra_requirements {
            self.extra_requirements = Some(v.clone());
        }
        if let Some(v) = &patch.template_style {
            self.template_style = Some(v.clone());
        }
        if let Some(v) = patch.export_extractor_method {
            self.export_extractor_method = Some(v);
        }
        if let Some(v) = patch.export_inpaint_method {
            self.export_inpaint_method = Some(v);
        }
    }
}

/// Project-level settings edited from the project settings dialog.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProjectSettingsPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra_requirements: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_style: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub export_extractor_method: Option<ExtractorMethod>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub export_inpaint_method: Option<InpaintMethod>,
}

/// Rewrite backend field names into the ones the client types use.
///
/// The backend sends `project_id`/`page_id` and `*_url` variants of image
/// paths; ids prefer the `*_id` field, paths prefer the URL.
pub fn normalize_project_value(mut value: serde_json::Value) -> serde_json::Value {
    if let Some(obj) = value.as_object_mut() {
        promote(obj, "project_id", "id");
        promote(obj, "template_image_url", "template_image_path");
        if let Some(pages) = obj.get_mut("pages").and_then(|p| p.as_array_mut()) {
            for page in pages.iter_mut() {
                normalize_page_in_place(page);
            }
        }
    }
    value
}

pub fn normalize_page_value(mut value: serde_json::Value) -> serde_json::Value {
    normalize_page_in_place(&mut value);
    value
}

fn normalize_page_in_place(value: &mut serde_json::Value) {
    if let Some(obj) = value.as_object_mut() {
        promote(obj, "page_id", "id");
        promote(obj, "generated_image_url", "generated_image_path");
    }
}

fn promote(obj: &mut serde_json::Map<String, serde_json::Value>, from: &str, to: &str) {
    if let Some(v) = obj.get(from).filter(|v| !v.is_null()).cloned() {
        obj.insert(to.to_string(), v);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_running_is_processing() {
        let status: JobStatus = serde_json::from_str("\"RUNNING\"").unwrap();
        assert_eq!(status, JobStatus::Processing);
        assert!(!status.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
    }

    #[test]
    fn test_job_ignores_updates_after_terminal() {
        let mut job = Job::submitted(&JobRef::new("t1", JobKind::ExportEditablePptx));
        job.apply(&JobSnapshot::with_status(JobStatus::Processing));
        job.apply(&JobSnapshot::completed(json!({ "download_url": "x" })));
        job.apply(&JobSnapshot::with_status(JobStatus::Processing));

        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.result, Some(json!({ "download_url": "x" })));
    }

    #[test]
    fn test_normalize_project_ids_and_urls() {
        let raw = json!({
            "project_id": "p-1",
            "template_image_url": "/files/t.png",
            "pages": [
                { "page_id": "pg-1", "generated_image_url": "/img/1.png", "generated_image_path": "old" },
                { "id": "pg-2" }
            ]
        });

        let project: Project = serde_json::from_value(normalize_project_value(raw)).unwrap();
        assert_eq!(project.id, "p-1");
        assert_eq!(project.template_image_path.as_deref(), Some("/files/t.png"));
        assert_eq!(project.pages[0].id, "pg-1");
        assert_eq!(project.pages[0].generated_image_path.as_deref(), Some("/img/1.png"));
        assert_eq!(project.pages[1].id, "pg-2");
    }

    #[test]
    fn test_description_content_shapes() {
        let text: DescriptionContent = serde_json::from_value(json!({ "text": "hello" })).unwrap();
        assert_eq!(text.to_text(), "hello");

        let paras: DescriptionContent =
            serde_json::from_value(json!({ "text_content": ["a", "b"] })).unwrap();
        assert_eq!(paras.to_text(), "a\nb");
    }

    #[test]
    fn test_page_merge_keeps_untouched_fields() {
        let mut page = Page::new("p");
        page.generated_image_path = Some("/img.png".into());
        page.merge(&PagePatch::outline("Title", vec!["one".into()]));

        assert_eq!(page.outline_content.as_ref().unwrap().title, "Title");
        assert_eq!(page.generated_image_path.as_deref(), Some("/img.png"));
    }

    #[test]
    fn test_file_scope_parsing() {
        assert_eq!("all".parse::<FileScope>().unwrap(), FileScope::All);
        assert_eq!("none".parse::<FileScope>().unwrap(), FileScope::Unscoped);
        let scope: FileScope = "proj-9".parse().unwrap();
        assert_eq!(scope.upload_target(), Some("proj-9"));
        assert_eq!(FileScope::All.upload_target(), None);
    }

    #[test]
    fn test_reference_file_snapshot() {
        let file = ReferenceFile {
            id: "f".into(),
            filename: "a.pdf".into(),
            file_size: 10,
            parse_status: ParseStatus::Failed,
            markdown_content: None,
            error_message: Some("bad pdf".into()),
            image_caption_failed_count: None,
            project_id: None,
            created_at: None,
        };
        let snapshot = file.as_snapshot();
        assert_eq!(snapshot.status, JobStatus::Failed);
        assert_eq!(snapshot.error.as_deref(), Some("bad pdf"));
    }
}
