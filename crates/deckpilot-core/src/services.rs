//! Connectivity tests for the external services the backend depends on.
//!
//! Each test is a server-side job: the client submits the (possibly unsaved)
//! settings to try, then polls the test's status like any other job.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;

use crate::api::DeckApi;
use crate::jobs::{PollOutcome, TaskPoller};
use crate::models::{JobKind, JobRef, JobSnapshot};
use crate::notify::{Notice, Notifier};

/// Message shown when a test outlives the polling deadline.
pub const TEST_TIMED_OUT_MESSAGE: &str = "test timed out";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServiceKind {
    BaiduOcr,
    TextModel,
    CaptionModel,
    BaiduInpaint,
    ImageModel,
    MineruPdf,
}

impl ServiceKind {
    pub const ALL: [ServiceKind; 6] = [
        ServiceKind::BaiduOcr,
        ServiceKind::TextModel,
        ServiceKind::CaptionModel,
        ServiceKind::BaiduInpaint,
        ServiceKind::ImageModel,
        ServiceKind::MineruPdf,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ServiceKind::BaiduOcr => "baidu-ocr",
            ServiceKind::TextModel => "text-model",
            ServiceKind::CaptionModel => "caption-model",
            ServiceKind::BaiduInpaint => "baidu-inpaint",
            ServiceKind::ImageModel => "image-model",
            ServiceKind::MineruPdf => "mineru-pdf",
        }
    }

    pub fn title(self) -> &'static str {
        match self {
            ServiceKind::BaiduOcr => "OCR service",
            ServiceKind::TextModel => "Text generation model",
            ServiceKind::CaptionModel => "Image caption model",
            ServiceKind::BaiduInpaint => "Image inpainting",
            ServiceKind::ImageModel => "Image generation model",
            ServiceKind::MineruPdf => "MinerU PDF parsing",
        }
    }

    /// Human-readable summary of a successful test's result payload.
    pub fn format_detail(self, result: &Value) -> String {
        let text = |key: &str| result.get(key).and_then(Value::as_str).map(str::to_string);
        let size = || {
            let dims = result.get("image_size")?.as_array()?;
            Some(format!("Output size: {}x{}", dims.first()?, dims.get(1)?))
        };

        let detail = match self {
            ServiceKind::BaiduOcr => text("recognized_text").map(|t| format!("Recognized: {}", t)),
            ServiceKind::TextModel => text("reply").map(|t| format!("Model reply: {}", t)),
            ServiceKind::CaptionModel => text("caption").map(|t| format!("Caption: {}", t)),
            ServiceKind::BaiduInpaint | ServiceKind::ImageModel => size(),
            ServiceKind::MineruPdf => text("content_preview")
                .map(|t| format!("Preview: {}", t))
                .or_else(|| text("message")),
        };
        detail.unwrap_or_default()
    }
}

impl std::fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ServiceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ServiceKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| format!("unknown service: {}", s))
    }
}

/// Settings overrides sent with a test. Only the fields that are set go out.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_base_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ai_provider_format: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text_model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_caption_model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mineru_api_base: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mineru_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub baidu_ocr_api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_resolution: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enable_text_reasoning: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text_thinking_budget: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enable_image_reasoning: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_thinking_budget: Option<u32>,
}

impl ServiceSettings {
    /// Drop empty strings so that blank form fields fall back to saved settings.
    pub fn without_blanks(mut self) -> Self {
        for field in [
            &mut self.api_key,
            &mut self.api_base_url,
            &mut self.ai_provider_format,
            &mut self.text_model,
            &mut self.image_model,
            &mut self.image_caption_model,
            &mut self.mineru_api_base,
            &mut self.mineru_token,
            &mut self.baidu_ocr_api_key,
            &mut self.image_resolution,
        ] {
            if field.as_deref().is_some_and(|v| v.trim().is_empty()) {
                *field = None;
            }
        }
        self
    }
}

/// State of one service's test
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum ServiceTestState {
    Idle,
    Loading,
    Success { message: String, detail: String },
    Error { message: String },
}

/// Runs service tests and remembers the latest state per service.
#[derive(Clone)]
pub struct ServiceTester {
    api: Arc<dyn DeckApi>,
    poller: TaskPoller,
    notifier: Arc<dyn Notifier>,
    states: Arc<RwLock<HashMap<ServiceKind, ServiceTestState>>>,
}

impl ServiceTester {
    pub fn new(api: Arc<dyn DeckApi>, poller: TaskPoller, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            api,
            poller,
            notifier,
            states: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn state(&self, service: ServiceKind) -> ServiceTestState {
        self.states
            .read()
            .await
            .get(&service)
            .cloned()
            .unwrap_or(ServiceTestState::Idle)
    }

    async fn set_state(&self, service: ServiceKind, state: ServiceTestState) {
        self.states.write().await.insert(service, state);
    }

    /// Submit a test and wait for its outcome. Errors end up in the state
    /// and as a notice, never as a return error.
    pub async fn run(&self, service: ServiceKind, settings: ServiceSettings) -> ServiceTestState {
        self.set_state(service, ServiceTestState::Loading).await;
        let settings = settings.without_blanks();

        let task_id = match self.api.start_service_test(service, &settings).await {
            Ok(id) => id,
            Err(e) => {
                tracing::warn!(service = %service, error = %e, "Failed to start service test");
                return self.finish_error(service, e.user_message()).await;
            }
        };
        tracing::info!(service = %service, task_id = %task_id, "Service test started");

        let job = JobRef::new(task_id, JobKind::ServiceTest);
        let cancel = tokio_util::sync::CancellationToken::new();
        let outcome = self.poller.run(&job, &cancel, |_| {}).await;

        let state = match outcome {
            PollOutcome::Completed(snapshot) => success_state(service, &snapshot),
            PollOutcome::Failed { message, .. } => {
                return self.finish_error(service, message).await;
            }
            PollOutcome::TimedOut { .. } => {
                return self.finish_error(service, TEST_TIMED_OUT_MESSAGE.to_string()).await;
            }
            PollOutcome::QueryFailed(e) => {
                return self.finish_error(service, e.user_message()).await;
            }
            PollOutcome::Cancelled => ServiceTestState::Idle,
        };

        if let ServiceTestState::Success { message, .. } = &state {
            self.notifier.notify(Notice::success(message.clone()));
        }
        self.set_state(service, state.clone()).await;
        state
    }

    async fn finish_error(&self, service: ServiceKind, message: String) -> ServiceTestState {
        self.notifier
            .notify(Notice::error(format!("Test failed: {}", message)));
        let state = ServiceTestState::Error { message };
        self.set_state(service, state.clone()).await;
        state
    }
}

fn success_state(service: ServiceKind, snapshot: &JobSnapshot) -> ServiceTestState {
    let detail = snapshot
        .result
        .as_ref()
        .map(|r| service.format_detail(r))
        .unwrap_or_default();
    let message = snapshot
        .message
        .clone()
        .unwrap_or_else(|| "Test passed".to_string());
    ServiceTestState::Success { message, detail }
}
