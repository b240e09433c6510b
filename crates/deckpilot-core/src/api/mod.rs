//! REST backend abstraction.
//!
//! This module provides a single interface over the slide-deck backend:
//! - `HttpApi` talks to the real service over HTTP (reqwest)
//! - `InMemoryApi` is a scripted in-process backend for offline use and tests
//!
//! Job execution, parsing, generation and export all happen server-side;
//! the client only submits work and reads status.

pub mod http;
pub mod memory;

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::ClientResult;
use crate::export::ExportKind;
use crate::models::{
    FileScope, FileUpload, JobRef, JobSnapshot, Page, PagePatch, Project, ProjectSettingsPatch,
    ReferenceFile,
};
use crate::services::{ServiceKind, ServiceSettings};

pub use http::HttpApi;
pub use memory::InMemoryApi;

/// `{ task_id }` returned by job-submitting endpoints
#[derive(Debug, Clone, Deserialize)]
pub struct TaskTicket {
    pub task_id: String,
}

/// `{ download_url }` returned by synchronous exports
#[derive(Debug, Clone, Deserialize)]
pub struct DownloadTicket {
    pub download_url: String,
}

/// Operations the client consumes from the backend.
#[async_trait]
pub trait DeckApi: Send + Sync {
    /// Current status of a submitted job
    async fn job_status(&self, job: &JobRef) -> ClientResult<JobSnapshot>;

    /// Authoritative project snapshot
    async fn get_project(&self, project_id: &str) -> ClientResult<Project>;

    /// Persist project-level settings
    async fn update_project(
        &self,
        project_id: &str,
        patch: &ProjectSettingsPatch,
    ) -> ClientResult<Project>;

    /// Persist a subset of page fields
    async fn update_page(
        &self,
        project_id: &str,
        page_id: &str,
        patch: &PagePatch,
    ) -> ClientResult<Page>;

    /// Submit image generation for one page, returns the job id
    async fn generate_page_image(&self, project_id: &str, page_id: &str) -> ClientResult<String>;

    async fn list_reference_files(&self, scope: &FileScope) -> ClientResult<Vec<ReferenceFile>>;

    async fn get_reference_file(&self, file_id: &str) -> ClientResult<ReferenceFile>;

    async fn upload_reference_file(
        &self,
        upload: &FileUpload,
        project_id: Option<&str>,
    ) -> ClientResult<ReferenceFile>;

    /// Ask the server to start parsing; only acknowledges
    async fn trigger_file_parse(&self, file_id: &str) -> ClientResult<()>;

    async fn delete_reference_file(&self, file_id: &str) -> ClientResult<()>;

    /// Synchronous export (pptx, pdf), returns a download URL
    async fn export_direct(
        &self,
        project_id: &str,
        kind: ExportKind,
        page_ids: Option<&[String]>,
    ) -> ClientResult<String>;

    /// Asynchronous export (editable pptx), returns the job id
    async fn export_editable_pptx(
        &self,
        project_id: &str,
        page_ids: Option<&[String]>,
    ) -> ClientResult<String>;

    /// Start a connectivity test for one external service, returns the job id
    async fn start_service_test(
        &self,
        service: ServiceKind,
        settings: &ServiceSettings,
    ) -> ClientResult<String>;
}
