//! Reference file tracking: listing, upload, parse polling and selection.
//!
//! The visible list is merged by id, never replaced wholesale, so a file the
//! client knows is being parsed stays visible even when a listing from the
//! server has not caught up with it yet.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::api::DeckApi;
use crate::config::Settings;
use crate::error::{ClientError, ClientResult};
use crate::models::{FileScope, FileUpload, ParseStatus, ReferenceFile};
use crate::notify::{Notice, Notifier};

/// Reference files keyed by id, in first-seen order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FileList {
    order: Vec<String>,
    files: HashMap<String, ReferenceFile>,
}

impl FileList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace by id. A replaced file keeps its position.
    pub fn upsert(&mut self, file: ReferenceFile) {
        if !self.files.contains_key(&file.id) {
            self.order.push(file.id.clone());
        }
        self.files.insert(file.id.clone(), file);
    }

    pub fn merge_all(&mut self, files: impl IntoIterator<Item = ReferenceFile>) {
        for file in files {
            self.upsert(file);
        }
    }

    /// Take a server listing as authoritative, keeping in-flight files the
    /// listing does not contain yet.
    pub fn reconcile(&mut self, server: Vec<ReferenceFile>, in_flight: &HashSet<String>) {
        let mut next = FileList::new();
        next.merge_all(server);
        for id in &self.order {
            if in_flight.contains(id) && !next.contains(id) {
                if let Some(file) = self.files.get(id) {
                    next.upsert(file.clone());
                }
            }
        }
        *self = next;
    }

    pub fn remove(&mut self, file_id: &str) -> Option<ReferenceFile> {
        self.order.retain(|id| id != file_id);
        self.files.remove(file_id)
    }

    pub fn get(&self, file_id: &str) -> Option<&ReferenceFile> {
        self.files.get(file_id)
    }

    pub fn contains(&self, file_id: &str) -> bool {
        self.files.contains_key(file_id)
    }

    pub fn by_id(&self) -> &HashMap<String, ReferenceFile> {
        &self.files
    }

    pub fn iter(&self) -> impl Iterator<Item = &ReferenceFile> {
        self.order.iter().filter_map(|id| self.files.get(id))
    }

    pub fn to_vec(&self) -> Vec<ReferenceFile> {
        self.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionMode {
    Single,
    Multiple { max: Option<usize> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadFailure {
    pub filename: String,
    pub message: String,
}

/// Result of a batch upload
#[derive(Debug, Clone, Default)]
pub struct UploadReport {
    pub uploaded: Vec<ReferenceFile>,
    pub failures: Vec<UploadFailure>,
    /// A PowerPoint file was among the uploads
    pub suggested_pdf: bool,
}

impl UploadReport {
    pub fn succeeded(&self) -> usize {
        self.uploaded.len()
    }
}

/// Result of one polling round
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoundReport {
    /// Ids whose latest state was merged
    pub updated: Vec<String>,
    /// Ids that reached completed/failed and are no longer tracked
    pub finished: Vec<String>,
    /// Ids whose query failed; they stay tracked
    pub errors: Vec<String>,
    /// Ids tracked longer than the poll timeout; no longer tracked
    pub timed_out: Vec<String>,
}

#[derive(Debug, Default)]
struct TrackerState {
    scope: Option<FileScope>,
    files: FileList,
    parsing: HashSet<String>,
    tracked_since: HashMap<String, Instant>,
    selected: Vec<String>,
}

impl TrackerState {
    fn start_tracking(&mut self, file_id: &str) {
        if self.parsing.insert(file_id.to_string()) {
            self.tracked_since.insert(file_id.to_string(), Instant::now());
        }
    }

    fn stop_tracking(&mut self, file_id: &str) {
        self.parsing.remove(file_id);
        self.tracked_since.remove(file_id);
    }

    /// Stop tracking ids older than `timeout` and return them.
    fn expire(&mut self, timeout: Duration) -> Vec<String> {
        let mut expired: Vec<String> = self
            .tracked_since
            .iter()
            .filter(|(_, since)| since.elapsed() >= timeout)
            .map(|(id, _)| id.clone())
            .collect();
        expired.sort();
        for id in &expired {
            self.stop_tracking(id);
        }
        expired
    }
}

/// Tracks the reference file list of a picker view.
#[derive(Clone)]
pub struct FileParseTracker {
    api: Arc<dyn DeckApi>,
    notifier: Arc<dyn Notifier>,
    mode: SelectionMode,
    poll_interval: Duration,
    poll_timeout: Duration,
    reload_delay: Duration,
    state: Arc<RwLock<TrackerState>>,
}

impl FileParseTracker {
    pub fn new(
        api: Arc<dyn DeckApi>,
        notifier: Arc<dyn Notifier>,
        settings: &Settings,
        mode: SelectionMode,
    ) -> Self {
        Self {
            api,
            notifier,
            mode,
            poll_interval: settings.poll_interval(),
            poll_timeout: settings.poll_timeout(),
            reload_delay: settings.reload_delay(),
            state: Arc::new(RwLock::new(TrackerState::default())),
        }
    }

    pub async fn files(&self) -> Vec<ReferenceFile> {
        self.state.read().await.files.to_vec()
    }

    pub async fn file(&self, file_id: &str) -> Option<ReferenceFile> {
        self.state.read().await.files.get(file_id).cloned()
    }

    /// Ids currently tracked for parsing, sorted
    pub async fn tracked_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.state.read().await.parsing.iter().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn selected_ids(&self) -> Vec<String> {
        self.state.read().await.selected.clone()
    }

    pub async fn scope(&self) -> FileScope {
        self.state
            .read()
            .await
            .scope
            .clone()
            .unwrap_or(FileScope::All)
    }

    /// Restore a previous selection
    pub async fn set_selection(&self, ids: Vec<String>) {
        self.state.write().await.selected = ids;
    }

    /// Track an id for parse polling. The poll timeout counts from the
    /// first call.
    pub async fn track(&self, file_id: &str) {
        self.state.write().await.start_tracking(file_id);
    }

    /// List files for `scope` and reconcile them into the visible list.
    pub async fn load(&self, scope: FileScope) -> ClientResult<usize> {
        self.state.write().await.scope = Some(scope);
        self.reload().await
    }

    /// Re-list the current scope.
    pub async fn reload(&self) -> ClientResult<usize> {
        let scope = self.scope().await;
        match self.api.list_reference_files(&scope).await {
            Ok(server) => {
                let mut state = self.state.write().await;
                let TrackerState { files, parsing, .. } = &mut *state;
                files.reconcile(server, parsing);
                tracing::debug!(scope = %scope.as_path_segment(), files = files.len(), "Reference files loaded");
                Ok(files.len())
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to list reference files");
                self.notifier.notify(Notice::error(e.user_message()));
                Err(e)
            }
        }
    }

    /// Upload files concurrently. Each failure is reported on its own; the
    /// batch as a whole never fails.
    pub async fn upload(&self, uploads: Vec<FileUpload>) -> UploadReport {
        let mut report = UploadReport::default();
        if uploads.is_empty() {
            return report;
        }

        report.suggested_pdf = uploads
            .iter()
            .any(|u| matches!(u.extension().as_deref(), Some("ppt" | "pptx")));
        if report.suggested_pdf {
            self.notifier.notify(Notice::info(
                "Tip: converting PowerPoint files to PDF before uploading gives better parsing results",
            ));
        }

        let scope = self.scope().await;
        let target = scope.upload_target();
        let results = join_all(
            uploads
                .iter()
                .map(|upload| self.api.upload_reference_file(upload, target)),
        )
        .await;

        for (upload, result) in uploads.iter().zip(results) {
            match result {
                Ok(file) => report.uploaded.push(file),
                Err(e) => {
                    tracing::warn!(file = %upload.filename, error = %e, "Upload failed");
                    let message = e.user_message();
                    self.notifier
                        .notify(Notice::error(format!("{}: {}", upload.filename, message)));
                    report.failures.push(UploadFailure {
                        filename: upload.filename.clone(),
                        message,
                    });
                }
            }
        }

        if report.uploaded.is_empty() {
            return report;
        }

        {
            let mut state = self.state.write().await;
            for file in &report.uploaded {
                if file.parse_status == ParseStatus::Parsing {
                    state.start_tracking(&file.id);
                }
            }
            state.files.merge_all(report.uploaded.iter().cloned());
        }
        tracing::info!(uploaded = report.succeeded(), failed = report.failures.len(), "Upload finished");
        self.notifier.notify(Notice::success(format!(
            "Uploaded {} file(s)",
            report.succeeded()
        )));

        // The server listing may lag behind the upload responses
        let tracker = self.clone();
        let delay = self.reload_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tracker.reload().await;
        });

        report
    }

    /// Query every tracked id once, concurrently, and merge the results.
    ///
    /// Ids tracked for longer than the poll timeout are dropped first and
    /// reported as timed out.
    pub async fn poll_round(&self) -> RoundReport {
        let mut report = RoundReport::default();
        let expired: Vec<(String, String)> = {
            let mut state = self.state.write().await;
            state
                .expire(self.poll_timeout)
                .into_iter()
                .map(|id| {
                    let name = state
                        .files
                        .get(&id)
                        .map(|f| f.filename.clone())
                        .unwrap_or_else(|| id.clone());
                    (id, name)
                })
                .collect()
        };
        if !expired.is_empty() {
            let message = ClientError::Timeout {
                after: self.poll_timeout,
            }
            .user_message();
            for (id, name) in expired {
                tracing::warn!(file_id = %id, timeout_secs = self.poll_timeout.as_secs(), "File parse polling timed out");
                self.notifier
                    .notify(Notice::error(format!("{}: {}", name, message)));
                report.timed_out.push(id);
            }
        }

        let ids = self.tracked_ids().await;
        if ids.is_empty() {
            return report;
        }

        let results = join_all(ids.iter().map(|id| self.api.get_reference_file(id))).await;

        let mut state = self.state.write().await;
        for (id, result) in ids.into_iter().zip(results) {
            match result {
                Ok(file) => {
                    if file.parse_status.is_terminal() {
                        state.stop_tracking(&id);
                        tracing::info!(file_id = %id, status = %file.parse_status, "File parse finished");
                        report.finished.push(id.clone());
                    }
                    state.files.upsert(file);
                    report.updated.push(id);
                }
                Err(e) => {
                    tracing::warn!(file_id = %id, error = %e, "Failed to poll file");
                    report.errors.push(id);
                }
            }
        }
        report
    }

    /// Run polling rounds until nothing is tracked or `cancel` fires.
    pub async fn poll_until_idle(&self, cancel: &CancellationToken) {
        let mut ticker = tokio::time::interval_at(
            tokio::time::Instant::now() + self.poll_interval,
            self.poll_interval,
        );
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if self.state.read().await.parsing.is_empty() {
                return;
            }
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }
            self.poll_round().await;
        }
    }

    /// Spawn [`poll_until_idle`](Self::poll_until_idle) under a view scope.
    pub fn start_polling(&self, scope: &CancellationToken) -> JoinHandle<()> {
        let tracker = self.clone();
        let cancel = scope.child_token();
        tokio::spawn(async move { tracker.poll_until_idle(&cancel).await })
    }

    /// Toggle a file in the selection. Returns whether it is now selected.
    pub async fn toggle_selection(&self, file_id: &str) -> ClientResult<bool> {
        let mut state = self.state.write().await;
        match self.mode {
            SelectionMode::Single => {
                state.selected = vec![file_id.to_string()];
                Ok(true)
            }
            SelectionMode::Multiple { max } => {
                if let Some(pos) = state.selected.iter().position(|id| id == file_id) {
                    state.selected.remove(pos);
                    return Ok(false);
                }
                if let Some(max) = max.filter(|max| state.selected.len() >= *max) {
                    let message = format!("You can select at most {} files", max);
                    self.notifier.notify(Notice::info(message.clone()));
                    return Err(ClientError::validation(message));
                }
                state.selected.push(file_id.to_string());
                Ok(true)
            }
        }
    }

    pub async fn clear_selection(&self) {
        self.state.write().await.selected.clear();
    }

    /// Resolve the selection into files.
    ///
    /// Pending files get a background parse trigger and the whole selection
    /// comes back right away, pending files included. Otherwise only
    /// completed and parsing files are returned.
    pub async fn confirm_selection(&self) -> ClientResult<Vec<ReferenceFile>> {
        let selected: Vec<ReferenceFile> = {
            let state = self.state.read().await;
            state
                .files
                .iter()
                .filter(|f| state.selected.contains(&f.id))
                .cloned()
                .collect()
        };

        if selected.is_empty() {
            return Err(self.reject("Select at least one file"));
        }

        let pending: Vec<&ReferenceFile> = selected
            .iter()
            .filter(|f| f.parse_status == ParseStatus::Pending)
            .collect();

        if pending.is_empty() {
            let valid: Vec<ReferenceFile> = selected
                .into_iter()
                .filter(|f| matches!(f.parse_status, ParseStatus::Completed | ParseStatus::Parsing))
                .collect();
            if valid.is_empty() {
                return Err(self.reject("Select a valid file"));
            }
            return Ok(valid);
        }

        {
            let mut state = self.state.write().await;
            for file in &pending {
                state.start_tracking(&file.id);
            }
        }
        for file in &pending {
            let tracker = self.clone();
            let file_id = file.id.clone();
            let filename = file.filename.clone();
            tokio::spawn(async move {
                if let Err(e) = tracker.api.trigger_file_parse(&file_id).await {
                    tracing::warn!(file_id = %file_id, file = %filename, error = %e, "Failed to trigger parse");
                    // The file stays pending, so polling it would never end
                    tracker.state.write().await.stop_tracking(&file_id);
                    tracker
                        .notifier
                        .notify(Notice::error(format!("{}: {}", filename, e.user_message())));
                }
            });
        }
        self.notifier.notify(Notice::success(format!(
            "Parsing {} file(s) in the background",
            pending.len()
        )));

        Ok(selected)
    }

    fn reject(&self, message: &str) -> ClientError {
        self.notifier.notify(Notice::info(message));
        ClientError::validation(message)
    }

    /// Delete on the server, then forget the file locally.
    pub async fn delete(&self, file_id: &str) -> ClientResult<()> {
        if let Err(e) = self.api.delete_reference_file(file_id).await {
            tracing::warn!(file_id = %file_id, error = %e, "Failed to delete file");
            self.notifier.notify(Notice::error(e.user_message()));
            return Err(e);
        }

        {
            let mut state = self.state.write().await;
            state.files.remove(file_id);
            state.stop_tracking(file_id);
            state.selected.retain(|id| id != file_id);
        }
        self.notifier.notify(Notice::success("File deleted"));
        Ok(())
    }

    /// Parsed Markdown of a file.
    pub async fn preview(&self, file_id: &str) -> ClientResult<String> {
        let file = match self.api.get_reference_file(file_id).await {
            Ok(file) => file,
            Err(e) => {
                self.notifier.notify(Notice::error(e.user_message()));
                return Err(e);
            }
        };
        self.state.write().await.files.upsert(file.clone());

        match (file.parse_status, file.markdown_content) {
            (ParseStatus::Completed, Some(markdown)) => Ok(markdown),
            (ParseStatus::Failed, _) => Err(self.reject(
                file.error_message
                    .as_deref()
                    .unwrap_or("Parsing failed for this file"),
            )),
            _ => Err(self.reject("This file has not been parsed yet")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::memory::InMemoryApi;
    use crate::error::NETWORK_ERROR_MESSAGE;
    use crate::notify::{CollectingNotifier, NoticeLevel};

    fn file(id: &str, status: ParseStatus) -> ReferenceFile {
        ReferenceFile {
            id: id.to_string(),
            filename: format!("{}.pdf", id),
            file_size: 100,
            parse_status: status,
            markdown_content: None,
            error_message: None,
            image_caption_failed_count: None,
            project_id: None,
            created_at: None,
        }
    }

    fn tracker(api: Arc<InMemoryApi>, notifier: Arc<CollectingNotifier>) -> FileParseTracker {
        FileParseTracker::new(
            api,
            notifier,
            &Settings::default(),
            SelectionMode::Multiple { max: Some(2) },
        )
    }

    #[test]
    fn test_merge_is_commutative() {
        let mut base = FileList::new();
        base.merge_all([file("a", ParseStatus::Parsing), file("b", ParseStatus::Parsing)]);

        let a = file("a", ParseStatus::Completed);
        let b = file("b", ParseStatus::Failed);

        let mut ab = base.clone();
        ab.upsert(a.clone());
        ab.upsert(b.clone());

        let mut ba = base.clone();
        ba.upsert(b);
        ba.upsert(a);

        assert_eq!(ab, ba);

        let mut fresh_ab = FileList::new();
        fresh_ab.merge_all([file("x", ParseStatus::Pending), file("y", ParseStatus::Pending)]);
        let mut fresh_ba = FileList::new();
        fresh_ba.merge_all([file("y", ParseStatus::Pending), file("x", ParseStatus::Pending)]);
        assert_eq!(fresh_ab.by_id(), fresh_ba.by_id());
    }

    #[test]
    fn test_reconcile_keeps_in_flight_files() {
        let mut list = FileList::new();
        list.merge_all([file("old", ParseStatus::Completed), file("new", ParseStatus::Parsing)]);

        let in_flight: HashSet<String> = ["new".to_string()].into_iter().collect();
        list.reconcile(vec![file("other", ParseStatus::Pending)], &in_flight);

        let ids: Vec<&str> = list.iter().map(|f| f.id.as_str()).collect();
        assert_eq!(ids, vec!["other", "new"]);
    }

    #[tokio::test]
    async fn test_upload_reports_each_failure() {
        let api = Arc::new(InMemoryApi::new());
        api.reject_upload("bad.exe", "Unsupported file type");
        let notifier = Arc::new(CollectingNotifier::new());
        let tracker = tracker(api.clone(), notifier.clone());

        let report = tracker
            .upload(vec![
                FileUpload::new("one.pdf", b"1".to_vec()),
                FileUpload::new("bad.exe", b"2".to_vec()),
                FileUpload::new("two.docx", b"3".to_vec()),
            ])
            .await;

        assert_eq!(report.succeeded(), 2);
        assert_eq!(
            report.failures,
            vec![UploadFailure {
                filename: "bad.exe".into(),
                message: "Unsupported file type".into(),
            }]
        );
        assert!(!report.suggested_pdf);
        assert_eq!(tracker.tracked_ids().await.len(), 2);
        assert_eq!(tracker.files().await.len(), 2);
        assert_eq!(notifier.errors().len(), 1);
    }

    #[tokio::test]
    async fn test_upload_suggests_pdf_for_slides() {
        let api = Arc::new(InMemoryApi::new());
        let notifier = Arc::new(CollectingNotifier::new());
        let tracker = tracker(api, notifier.clone());

        let report = tracker
            .upload(vec![FileUpload::new("deck.PPTX", b"x".to_vec())])
            .await;

        assert!(report.suggested_pdf);
        assert_eq!(notifier.notices()[0].level, NoticeLevel::Info);
    }

    #[tokio::test]
    async fn test_upload_attaches_to_project_scope() {
        let api = Arc::new(InMemoryApi::new());
        let tracker = tracker(api.clone(), Arc::new(CollectingNotifier::new()));
        tracker.load(FileScope::Project("p-1".into())).await.unwrap();

        let report = tracker
            .upload(vec![FileUpload::new("notes.md", b"# hi".to_vec())])
            .await;

        assert_eq!(report.uploaded[0].project_id.as_deref(), Some("p-1"));
    }

    #[tokio::test]
    async fn test_round_partial_failure_keeps_others() {
        let api = Arc::new(InMemoryApi::new());
        api.insert_file(file("a", ParseStatus::Parsing));
        api.insert_file(file("b", ParseStatus::Parsing));
        api.script_file("a", vec![ParseStatus::Completed]);
        api.fail_file_lookup("b");
        let tracker = tracker(api, Arc::new(CollectingNotifier::new()));
        tracker.track("a").await;
        tracker.track("b").await;

        let report = tracker.poll_round().await;

        assert_eq!(report.finished, vec!["a".to_string()]);
        assert_eq!(report.errors, vec!["b".to_string()]);
        assert_eq!(tracker.tracked_ids().await, vec!["b".to_string()]);
        assert_eq!(
            tracker.file("a").await.unwrap().parse_status,
            ParseStatus::Completed
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_polling_stops_when_idle() {
        let api = Arc::new(InMemoryApi::new());
        api.insert_file(file("a", ParseStatus::Parsing));
        api.script_file(
            "a",
            vec![ParseStatus::Parsing, ParseStatus::Parsing, ParseStatus::Completed],
        );
        let tracker = tracker(api, Arc::new(CollectingNotifier::new()));
        tracker.track("a").await;

        let scope = CancellationToken::new();
        tracker.start_polling(&scope).await.unwrap();

        assert!(tracker.tracked_ids().await.is_empty());
        let parsed = tracker.file("a").await.unwrap();
        assert_eq!(parsed.parse_status, ParseStatus::Completed);
        assert!(parsed.markdown_content.is_some());
    }

    #[tokio::test]
    async fn test_load_keeps_tracked_files_missing_from_listing() {
        let api = Arc::new(InMemoryApi::new());
        api.insert_file(file("z", ParseStatus::Completed));
        let tracker = tracker(api.clone(), Arc::new(CollectingNotifier::new()));
        tracker.load(FileScope::All).await.unwrap();

        let report = tracker
            .upload(vec![FileUpload::new("a.pdf", b"1".to_vec())])
            .await;
        let uploaded = report.uploaded[0].id.clone();

        // Neither file is attached to this project; only the parsing one stays
        tracker.load(FileScope::Project("elsewhere".into())).await.unwrap();
        let ids: Vec<String> = tracker.files().await.into_iter().map(|f| f.id).collect();
        assert_eq!(ids, vec![uploaded]);
    }

    #[tokio::test]
    async fn test_failed_listing_keeps_list() {
        let api = Arc::new(InMemoryApi::new());
        api.insert_file(file("z", ParseStatus::Completed));
        let notifier = Arc::new(CollectingNotifier::new());
        let tracker = tracker(api.clone(), notifier.clone());
        tracker.load(FileScope::All).await.unwrap();

        api.fail_operation("list_reference_files", "boom");
        assert!(tracker.reload().await.is_err());
        assert_eq!(tracker.files().await.len(), 1);
        assert_eq!(notifier.errors(), vec![NETWORK_ERROR_MESSAGE.to_string()]);
    }

    #[tokio::test]
    async fn test_selection_limit() {
        let api = Arc::new(InMemoryApi::new());
        let notifier = Arc::new(CollectingNotifier::new());
        let tracker = tracker(api, notifier.clone());

        assert!(tracker.toggle_selection("a").await.unwrap());
        assert!(tracker.toggle_selection("b").await.unwrap());
        let err = tracker.toggle_selection("c").await.unwrap_err();
        assert!(matches!(err, ClientError::Validation(_)));
        assert!(!tracker.toggle_selection("a").await.unwrap());
        assert_eq!(tracker.selected_ids().await, vec!["b".to_string()]);
    }

    #[tokio::test]
    async fn test_single_mode_replaces_selection() {
        let api = Arc::new(InMemoryApi::new());
        let tracker = FileParseTracker::new(
            api,
            Arc::new(CollectingNotifier::new()),
            &Settings::default(),
            SelectionMode::Single,
        );
        tracker.toggle_selection("a").await.unwrap();
        tracker.toggle_selection("b").await.unwrap();
        assert_eq!(tracker.selected_ids().await, vec!["b".to_string()]);
    }

    #[tokio::test]
    async fn test_confirm_triggers_pending_without_waiting() {
        let api = Arc::new(InMemoryApi::new());
        api.insert_file(file("p", ParseStatus::Pending));
        api.insert_file(file("c", ParseStatus::Completed));
        let notifier = Arc::new(CollectingNotifier::new());
        let tracker = tracker(api.clone(), notifier.clone());
        tracker.load(FileScope::All).await.unwrap();
        tracker.set_selection(vec!["p".into(), "c".into()]).await;

        let files = tracker.confirm_selection().await.unwrap();

        assert_eq!(files.len(), 2);
        assert_eq!(files[0].parse_status, ParseStatus::Pending);
        assert_eq!(tracker.tracked_ids().await, vec!["p".to_string()]);

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(api.parse_triggers(), vec!["p".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_trigger_stops_tracking() {
        let api = Arc::new(InMemoryApi::new());
        api.insert_file(file("p", ParseStatus::Pending));
        api.fail_operation("trigger_file_parse", "connection reset");
        let notifier = Arc::new(CollectingNotifier::new());
        let tracker = tracker(api.clone(), notifier.clone());
        tracker.load(FileScope::All).await.unwrap();
        tracker.set_selection(vec!["p".into()]).await;

        tracker.confirm_selection().await.unwrap();
        let started = Instant::now();
        tracker.poll_until_idle(&CancellationToken::new()).await;

        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(tracker.tracked_ids().await.is_empty());
        assert_eq!(api.file("p").unwrap().parse_status, ParseStatus::Pending);
        assert_eq!(notifier.errors().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_parse_times_out() {
        let api = Arc::new(InMemoryApi::new());
        api.insert_file(file("a", ParseStatus::Parsing));
        api.insert_file(file("b", ParseStatus::Parsing));
        api.script_file("a", vec![ParseStatus::Parsing]);
        api.script_file(
            "b",
            vec![ParseStatus::Parsing, ParseStatus::Parsing, ParseStatus::Completed],
        );
        let notifier = Arc::new(CollectingNotifier::new());
        let tracker = tracker(api.clone(), notifier.clone());
        tracker.load(FileScope::All).await.unwrap();
        tracker.track("a").await;
        tracker.track("b").await;

        let started = Instant::now();
        tracker.poll_until_idle(&CancellationToken::new()).await;
        let elapsed = started.elapsed();

        assert!(elapsed >= Duration::from_secs(120), "elapsed = {elapsed:?}");
        assert!(elapsed <= Duration::from_secs(124), "elapsed = {elapsed:?}");
        assert!(tracker.tracked_ids().await.is_empty());
        assert_eq!(
            tracker.file("b").await.unwrap().parse_status,
            ParseStatus::Completed
        );

        let errors = notifier.errors();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].starts_with("a.pdf"));
        assert!(errors[0].contains("timed out"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_round_reports_timed_out_ids() {
        let api = Arc::new(InMemoryApi::new());
        api.insert_file(file("a", ParseStatus::Parsing));
        let tracker = tracker(api.clone(), Arc::new(CollectingNotifier::new()));
        tracker.track("a").await;

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(tracker.poll_round().await.timed_out.is_empty());

        tokio::time::sleep(Duration::from_secs(60)).await;
        let report = tracker.poll_round().await;
        assert_eq!(report.timed_out, vec!["a".to_string()]);
        assert!(report.updated.is_empty());
    }

    #[tokio::test]
    async fn test_confirm_rejects_empty_and_failed() {
        let api = Arc::new(InMemoryApi::new());
        api.insert_file(file("f", ParseStatus::Failed));
        let tracker = tracker(api.clone(), Arc::new(CollectingNotifier::new()));
        tracker.load(FileScope::All).await.unwrap();

        assert!(matches!(
            tracker.confirm_selection().await,
            Err(ClientError::Validation(_))
        ));

        tracker.set_selection(vec!["f".into()]).await;
        assert!(matches!(
            tracker.confirm_selection().await,
            Err(ClientError::Validation(_))
        ));
        assert!(api.parse_triggers().is_empty());
    }

    #[tokio::test]
    async fn test_delete_forgets_file() {
        let api = Arc::new(InMemoryApi::new());
        api.insert_file(file("a", ParseStatus::Parsing));
        let tracker = tracker(api.clone(), Arc::new(CollectingNotifier::new()));
        tracker.load(FileScope::All).await.unwrap();
        tracker.track("a").await;
        tracker.set_selection(vec!["a".into()]).await;

        tracker.delete("a").await.unwrap();

        assert!(tracker.files().await.is_empty());
        assert!(tracker.tracked_ids().await.is_empty());
        assert!(tracker.selected_ids().await.is_empty());
        assert!(api.file("a").is_none());
    }

    #[tokio::test]
    async fn test_preview_requires_parsed_file() {
        let api = Arc::new(InMemoryApi::new());
        api.insert_file(file("a", ParseStatus::Parsing));
        let mut done = file("b", ParseStatus::Completed);
        done.markdown_content = Some("# B".into());
        api.insert_file(done);
        let tracker = tracker(api, Arc::new(CollectingNotifier::new()));

        assert!(matches!(
            tracker.preview("a").await,
            Err(ClientError::Validation(_))
        ));
        assert_eq!(tracker.preview("b").await.unwrap(), "# B");
    }
}
