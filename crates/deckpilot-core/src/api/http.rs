//! HTTP implementation of [`DeckApi`] using reqwest.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::debug;

use super::{DeckApi, DownloadTicket, TaskTicket};
use crate::config::Settings;
use crate::error::{ClientError, ClientResult};
use crate::export::ExportKind;
use crate::models::{
    normalize_page_value, normalize_project_value, FileScope, FileUpload, JobKind, JobRef,
    JobSnapshot, Page, PagePatch, Project, ProjectSettingsPatch, ReferenceFile,
};
use crate::services::{ServiceKind, ServiceSettings};

/// Response envelope used by every backend endpoint
#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    success: Option<bool>,
    #[serde(default)]
    data: Option<serde_json::Value>,
    #[serde(default)]
    error: Option<ErrorBody>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ErrorBody {
    Detailed { message: Option<String> },
    Plain(String),
}

impl ErrorBody {
    fn message(&self) -> Option<&str> {
        match self {
            ErrorBody::Detailed { message } => message.as_deref(),
            ErrorBody::Plain(message) => Some(message),
        }
    }
}

#[derive(Deserialize)]
struct FileList {
    files: Vec<ReferenceFile>,
}

#[derive(Deserialize)]
struct FileBody {
    file: ReferenceFile,
}

/// REST client for the slide-deck backend
pub struct HttpApi {
    client: Client,
    base_url: String,
}

impl HttpApi {
    /// Create a client for the given base URL
    pub fn new(base_url: &str, timeout: Duration) -> ClientResult<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn from_settings(settings: &Settings) -> ClientResult<Self> {
        Self::new(&settings.api_base_url, settings.request_timeout())
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Send a request and unwrap the envelope's `data`.
    async fn send(&self, request: RequestBuilder) -> ClientResult<serde_json::Value> {
        let response = request.send().await?;
        let status = response.status();
        let body = response.text().await?;
        debug!(status = status.as_u16(), bytes = body.len(), "Backend response");
        unwrap_envelope(status, &body)
    }

    async fn send_as<T: DeserializeOwned>(&self, request: RequestBuilder) -> ClientResult<T> {
        let data = self.send(request).await?;
        Ok(serde_json::from_value(data)?)
    }
}

/// Decode the envelope; non-2xx or an `error` member becomes a server error.
fn unwrap_envelope(status: StatusCode, body: &str) -> ClientResult<serde_json::Value> {
    let envelope: Envelope = match serde_json::from_str(body) {
        Ok(envelope) => envelope,
        Err(e) if status.is_success() => return Err(ClientError::Decode(e.to_string())),
        Err(_) => {
            return Err(ClientError::Server {
                status: Some(status.as_u16()),
                message: format!("Request failed with status {}", status),
            })
        }
    };

    let failed = !status.is_success() || envelope.error.is_some() || envelope.success == Some(false);
    if failed {
        let message = envelope
            .error
            .as_ref()
            .and_then(|e| e.message())
            .map(str::to_string)
            .or(envelope.message)
            .unwrap_or_else(|| format!("Request failed with status {}", status));
        return Err(ClientError::Server {
            status: Some(status.as_u16()),
            message,
        });
    }

    Ok(envelope.data.unwrap_or(serde_json::Value::Null))
}

fn page_ids_body(page_ids: Option<&[String]>) -> serde_json::Value {
    match page_ids {
        Some(ids) => serde_json::json!({ "page_ids": ids }),
        None => serde_json::json!({}),
    }
}

#[async_trait]
impl DeckApi for HttpApi {
    async fn job_status(&self, job: &JobRef) -> ClientResult<JobSnapshot> {
        match job.kind {
            JobKind::FileParse => Ok(self.get_reference_file(&job.id).await?.as_snapshot()),
            JobKind::ServiceTest => {
                let url = self.url(&format!("/api/settings/tests/{}/status", job.id));
                self.send_as(self.client.get(url)).await
            }
            JobKind::ImageGenerate
            | JobKind::ExportPptx
            | JobKind::ExportPdf
            | JobKind::ExportEditablePptx => {
                let project_id = job.project_id.as_deref().ok_or_else(|| {
                    ClientError::validation(format!("Task {} has no project", job.id))
                })?;
                let url = self.url(&format!("/api/projects/{}/tasks/{}", project_id, job.id));
                self.send_as(self.client.get(url)).await
            }
        }
    }

    async fn get_project(&self, project_id: &str) -> ClientResult<Project> {
        let url = self.url(&format!("/api/projects/{}", project_id));
        let data = self.send(self.client.get(url)).await?;
        Ok(serde_json::from_value(normalize_project_value(data))?)
    }

    async fn update_project(
        &self,
        project_id: &str,
        patch: &ProjectSettingsPatch,
    ) -> ClientResult<Project> {
        let url = self.url(&format!("/api/projects/{}", project_id));
        let data = self.send(self.client.put(url).json(patch)).await?;
        Ok(serde_json::from_value(normalize_project_value(data))?)
    }

    async fn update_page(
        &self,
        project_id: &str,
        page_id: &str,
        patch: &PagePatch,
    ) -> ClientResult<Page> {
        let url = self.url(&format!("/api/projects/{}/pages/{}", project_id, page_id));
        let data = self.send(self.client.put(url).json(patch)).await?;
        Ok(serde_json::from_value(normalize_page_value(data))?)
    }

    async fn generate_page_image(&self, project_id: &str, page_id: &str) -> ClientResult<String> {
        let url = self.url(&format!(
            "/api/projects/{}/pages/{}/generate/image",
            project_id, page_id
        ));
        let ticket: TaskTicket = self.send_as(self.client.post(url)).await?;
        Ok(ticket.task_id)
    }

    async fn list_reference_files(&self, scope: &FileScope) -> ClientResult<Vec<ReferenceFile>> {
        let url = self.url(&format!(
            "/api/reference-files/project/{}",
            scope.as_path_segment()
        ));
        let list: FileList = self.send_as(self.client.get(url)).await?;
        Ok(list.files)
    }

    async fn get_reference_file(&self, file_id: &str) -> ClientResult<ReferenceFile> {
        let url = self.url(&format!("/api/reference-files/{}", file_id));
        let body: FileBody = self.send_as(self.client.get(url)).await?;
        Ok(body.file)
    }

    async fn upload_reference_file(
        &self,
        upload: &FileUpload,
        project_id: Option<&str>,
    ) -> ClientResult<ReferenceFile> {
        let part = Part::bytes(upload.bytes.to_vec()).file_name(upload.filename.clone());
        let mut form = Form::new().part("file", part);
        if let Some(project_id) = project_id {
            form = form.text("project_id", project_id.to_string());
        }
        let url = self.url("/api/reference-files/upload");
        let body: FileBody = self.send_as(self.client.post(url).multipart(form)).await?;
        Ok(body.file)
    }

    async fn trigger_file_parse(&self, file_id: &str) -> ClientResult<()> {
        let url = self.url(&format!("/api/reference-files/{}/parse", file_id));
        self.send(self.client.post(url)).await?;
        Ok(())
    }

    async fn delete_reference_file(&self, file_id: &str) -> ClientResult<()> {
        let url = self.url(&format!("/api/reference-files/{}", file_id));
        self.send(self.client.delete(url)).await?;
        Ok(())
    }

    async fn export_direct(
        &self,
        project_id: &str,
        kind: ExportKind,
        page_ids: Option<&[String]>,
    ) -> ClientResult<String> {
        let segment = match kind {
            ExportKind::Pptx => "pptx",
            ExportKind::Pdf => "pdf",
            ExportKind::EditablePptx => {
                return Err(ClientError::validation(
                    "Editable PPTX export is asynchronous",
                ))
            }
        };
        let url = self.url(&format!("/api/projects/{}/export/{}", project_id, segment));
        let ticket: DownloadTicket = self
            .send_as(self.client.post(url).json(&page_ids_body(page_ids)))
            .await?;
        Ok(ticket.download_url)
    }

    async fn export_editable_pptx(
        &self,
        project_id: &str,
        page_ids: Option<&[String]>,
    ) -> ClientResult<String> {
        let url = self.url(&format!("/api/projects/{}/export/editable-pptx", project_id));
        let ticket: TaskTicket = self
            .send_as(self.client.post(url).json(&page_ids_body(page_ids)))
            .await?;
        Ok(ticket.task_id)
    }

    async fn start_service_test(
        &self,
        service: ServiceKind,
        settings: &ServiceSettings,
    ) -> ClientResult<String> {
        let url = self.url(&format!("/api/settings/tests/{}", service));
        let ticket: TaskTicket = self.send_as(self.client.post(url).json(settings)).await?;
        Ok(ticket.task_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_success() {
        let data = unwrap_envelope(
            StatusCode::OK,
            r#"{ "success": true, "data": { "task_id": "t-1" } }"#,
        )
        .unwrap();
        let ticket: TaskTicket = serde_json::from_value(data).unwrap();
        assert_eq!(ticket.task_id, "t-1");
    }

    #[test]
    fn test_envelope_error_message_is_kept() {
        let err = unwrap_envelope(
            StatusCode::BAD_REQUEST,
            r#"{ "success": false, "error": { "message": "No template image found" } }"#,
        )
        .unwrap_err();
        match err {
            ClientError::Server { status, message } => {
                assert_eq!(status, Some(400));
                assert_eq!(message, "No template image found");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_envelope_non_json_error() {
        let err = unwrap_envelope(StatusCode::BAD_GATEWAY, "<html>bad gateway</html>").unwrap_err();
        assert!(matches!(err, ClientError::Server { status: Some(502), .. }));

        let err = unwrap_envelope(StatusCode::OK, "<html>").unwrap_err();
        assert!(matches!(err, ClientError::Decode(_)));
    }

    #[test]
    fn test_trailing_slash_is_trimmed() {
        let api = HttpApi::new("http://localhost:5000/", Duration::from_secs(5)).unwrap();
        assert_eq!(api.url("/api/x"), "http://localhost:5000/api/x");
    }
}
