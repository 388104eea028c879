//! Upload façade.
//!
//! [`UploadManager`] admits upload requests, validates them, picks the direct
//! or chunked path and reports every lifecycle step to the event sink. Each
//! upload runs on its own Tokio task; the manager only holds the registry of
//! handles, which is the single piece of process-wide mutable state.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use chunkwise_protocol::{FileIdentity, UploadContext, UploadEvent, UploadProgress, UploadStatus};
use chunkwise_transfer::sync::lock;
use chunkwise_transfer::{
    ChunkInfo, Clock, MemorySessionStore, ProgressSnapshot, ProgressTracker, SessionStore,
    SystemClock, UploadSession, UploadSource,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::coordinator::{SessionPlan, UploadCoordinator, UploadObserver};
use crate::error::{ConfigError, UploadError};
use crate::finalizer::Finalizer;
use crate::handle::{UploadFile, UploadHandle, UploadOptions};
use crate::quota::QuotaService;
use crate::retry::RetryPolicy;
use crate::sink::{EventSink, NullSink};
use crate::storage::{InitiateRequest, ProgressFn, StorageAdapter};
use crate::validator::{IssueKind, ValidationIssue, ValidationRules, Validator};

/// Builds an [`UploadManager`] from its collaborators.
pub struct UploadManagerBuilder {
    config: EngineConfig,
    storage: Arc<dyn StorageAdapter>,
    store: Option<Arc<dyn SessionStore>>,
    quota: Option<Arc<dyn QuotaService>>,
    sink: Option<Arc<dyn EventSink>>,
    clock: Option<Arc<dyn Clock>>,
}

impl UploadManagerBuilder {
    /// Session persistence. Defaults to an in-memory store.
    pub fn session_store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Quota lookups. Without one, quota is not checked.
    pub fn quota_service(mut self, quota: Arc<dyn QuotaService>) -> Self {
        self.quota = Some(quota);
        self
    }

    /// Event consumer. Defaults to discarding events.
    pub fn event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn build(self) -> Result<UploadManager, ConfigError> {
        self.config.validate()?;
        let config = self.config;
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let store = self.store.unwrap_or_else(|| {
            Arc::new(MemorySessionStore::new(
                config.max_sessions,
                Arc::clone(&clock),
            ))
        });
        let storage = self.storage;

        let inner = Inner {
            validator: Validator::new(self.quota, config.quota_timeout()),
            coordinator: UploadCoordinator::new(
                &config,
                Arc::clone(&storage),
                Arc::clone(&store),
                Arc::clone(&clock),
            ),
            finalizer: Finalizer::new(Arc::clone(&storage), config.chunk_timeout()),
            retry: config.retry_policy(),
            sink: self.sink.unwrap_or_else(|| Arc::new(NullSink)),
            progress: ProgressTracker::new(),
            registry: Mutex::new(Registry::default()),
            storage,
            store,
            clock,
            config,
        };
        Ok(UploadManager {
            inner: Arc::new(inner),
        })
    }
}

/// Entry point of the engine.
///
/// `upload` returns as soon as the request is admitted; results arrive as
/// [`UploadEvent`]s on the configured sink. At most
/// `max_concurrent_uploads` uploads are active at once, and a request beyond
/// that is rejected immediately rather than queued. Methods that start an
/// upload must be called from within a Tokio runtime.
#[derive(Clone)]
pub struct UploadManager {
    inner: Arc<Inner>,
}

impl UploadManager {
    pub fn builder(config: EngineConfig, storage: Arc<dyn StorageAdapter>) -> UploadManagerBuilder {
        UploadManagerBuilder {
            config,
            storage,
            store: None,
            quota: None,
            sink: None,
            clock: None,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Starts uploading `file` to `context` and returns the upload id.
    ///
    /// Fails synchronously only with
    /// [`UploadError::ConcurrencyLimitExceeded`]; every other outcome is
    /// reported through events.
    pub fn upload(
        &self,
        file: UploadFile,
        context: UploadContext,
        options: UploadOptions,
    ) -> Result<String, UploadError> {
        let id = uuid::Uuid::new_v4().to_string();
        let handle = Arc::new(UploadHandle::new(
            id.clone(),
            file,
            context,
            options,
            self.inner.clock.now(),
        ));
        self.inner.admit(&handle)?;
        self.spawn(handle, Start::Fresh);
        Ok(id)
    }

    /// Resumes a persisted session from the source path it recorded.
    ///
    /// Returns the id of the new upload.
    pub async fn resume_session(&self, session_id: &str) -> Result<String, UploadError> {
        let session = self.inner.coordinator.load_session(session_id)?;
        let Some(path) = session.source_path.clone() else {
            return Err(UploadError::SourceUnavailable(session_id.to_string()));
        };
        let file = UploadFile {
            name: session.file.name.clone(),
            content_type: Some(session.file.content_type.clone()),
            source: UploadSource::File(path.into()),
        };
        self.resume(session, file).await
    }

    /// Resumes a persisted session with the caller supplying the bytes again.
    ///
    /// `file` must match the recorded name and size.
    pub async fn resume_session_with(
        &self,
        session_id: &str,
        file: UploadFile,
    ) -> Result<String, UploadError> {
        let session = self.inner.coordinator.load_session(session_id)?;
        self.resume(session, file).await
    }

    async fn resume(
        &self,
        session: UploadSession,
        file: UploadFile,
    ) -> Result<String, UploadError> {
        let identity = file.identity().await?;
        if identity.name != session.file.name || identity.size != session.file.size {
            return Err(UploadError::Validation(vec![ValidationIssue::new(
                IssueKind::IdentityMismatch,
                format!(
                    "session {} is for {} ({} bytes), got {} ({} bytes)",
                    session.session_id,
                    session.file.name,
                    session.file.size,
                    identity.name,
                    identity.size
                ),
            )]));
        }

        let id = uuid::Uuid::new_v4().to_string();
        let handle = Arc::new(UploadHandle::new(
            id.clone(),
            file,
            session.context.clone(),
            UploadOptions::default(),
            self.inner.clock.now(),
        ));
        handle.set_session_id(&session.session_id);
        self.inner.admit(&handle)?;
        info!(upload_id = %id, session_id = %session.session_id, "session resume admitted");
        self.spawn(handle, Start::Resume(session.session_id));
        Ok(id)
    }

    /// Re-runs a failed upload under the same id.
    ///
    /// Continues from its persisted session when one is still live,
    /// otherwise starts over. Goes through admission like a new upload.
    pub fn retry(&self, upload_id: &str) -> Result<(), UploadError> {
        let handle = self.inner.handle(upload_id)?;
        let status = handle.status();
        if status != UploadStatus::Failed {
            return Err(UploadError::InvalidState {
                upload_id: upload_id.to_string(),
                action: "retry",
                status,
            });
        }

        let start = match handle.session_id() {
            Some(session_id) => match self.inner.store.load(&session_id) {
                Ok(Some(_)) => Start::Resume(session_id),
                Ok(None) => Start::Fresh,
                Err(e) => {
                    warn!(upload_id, error = %e, "session lookup failed, restarting upload");
                    Start::Fresh
                }
            },
            None => Start::Fresh,
        };

        self.inner.readmit(&handle)?;
        info!(upload_id, resume = matches!(start, Start::Resume(_)), "retrying upload");
        self.spawn(handle, start);
        Ok(())
    }

    /// Requests cancellation of an active upload.
    ///
    /// The `UploadCancelled` event follows once in-flight transfers settle.
    pub fn cancel(&self, upload_id: &str) -> Result<(), UploadError> {
        let handle = self.inner.handle(upload_id)?;
        if !handle.cancel() {
            return Err(UploadError::InvalidState {
                upload_id: upload_id.to_string(),
                action: "cancel",
                status: handle.status(),
            });
        }
        info!(upload_id, "cancellation requested");
        Ok(())
    }

    /// Cancels every active upload and returns how many were signalled.
    pub fn cancel_all(&self) -> usize {
        let handles: Vec<_> = lock(&self.inner.registry).active.values().cloned().collect();
        handles.iter().filter(|h| h.cancel()).count()
    }

    /// Waits until the upload reaches a terminal status.
    pub async fn wait(&self, upload_id: &str) -> Result<UploadStatus, UploadError> {
        let handle = self.inner.handle(upload_id)?;
        let mut rx = handle.subscribe();
        let status = *rx
            .wait_for(|s| s.is_terminal())
            .await
            .map_err(|_| UploadError::UploadNotFound(upload_id.to_string()))?;
        Ok(status)
    }

    /// Percentage (0-100) of an active or recently finished upload.
    pub fn get_progress(&self, upload_id: &str) -> Option<f64> {
        self.inner.find(upload_id).map(|h| h.progress())
    }

    pub fn get_status(&self, upload_id: &str) -> Option<UploadStatus> {
        self.inner.find(upload_id).map(|h| h.status())
    }

    /// The handle of an active or recently finished upload.
    pub fn handle(&self, upload_id: &str) -> Option<Arc<UploadHandle>> {
        self.inner.find(upload_id)
    }

    /// Speed and ETA of an active upload.
    pub fn progress_snapshot(&self, upload_id: &str) -> Option<ProgressSnapshot> {
        self.inner.progress.snapshot(upload_id)
    }

    pub fn active_uploads(&self) -> Vec<UploadProgress> {
        let registry = lock(&self.inner.registry);
        let mut active: Vec<_> = registry.active.values().map(|h| h.to_progress()).collect();
        active.sort_by(|a, b| a.upload_id.cmp(&b.upload_id));
        active
    }

    /// Overall progress of several uploads, weighted by file size.
    ///
    /// Uploads whose size is not known yet, and unknown ids, are ignored.
    pub fn batch_progress<S: AsRef<str>>(&self, upload_ids: &[S]) -> f64 {
        let (weighted, total) = upload_ids
            .iter()
            .filter_map(|id| self.inner.find(id.as_ref()))
            .filter_map(|h| h.identity().map(|f| (h.progress(), f.size)))
            .fold((0.0f64, 0u64), |(weighted, total), (progress, size)| {
                (weighted + progress * size as f64, total + size)
            });
        if total == 0 {
            return 0.0;
        }
        weighted / total as f64
    }

    /// Live persisted sessions, most recently active first.
    pub fn resumable_sessions(&self) -> Result<Vec<UploadSession>, UploadError> {
        let mut sessions = Vec::new();
        for id in self.inner.store.list_resumable()? {
            if let Some(session) = self.inner.store.load(&id)? {
                sessions.push(session);
            }
        }
        Ok(sessions)
    }

    /// Deletes expired sessions and returns how many were removed.
    pub fn purge_expired_sessions(&self) -> Result<usize, UploadError> {
        let purged = self.inner.store.purge_expired()?;
        if purged > 0 {
            info!(purged, "expired upload sessions removed");
        }
        Ok(purged)
    }

    fn spawn(&self, handle: Arc<UploadHandle>, start: Start) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move { inner.run(handle, start).await });
    }
}

#[derive(Debug)]
enum Start {
    Fresh,
    Resume(String),
}

#[derive(Default)]
struct Registry {
    active: HashMap<String, Arc<UploadHandle>>,
    /// Terminal handles, oldest first.
    finished: VecDeque<Arc<UploadHandle>>,
}

impl Registry {
    fn find(&self, upload_id: &str) -> Option<Arc<UploadHandle>> {
        self.active
            .get(upload_id)
            .or_else(|| self.finished.iter().find(|h| h.id() == upload_id))
            .cloned()
    }

    fn session_owner(&self, session_id: &str) -> Option<&str> {
        self.active
            .values()
            .find(|h| h.session_id().as_deref() == Some(session_id))
            .map(|h| h.id())
    }
}

struct Inner {
    config: EngineConfig,
    storage: Arc<dyn StorageAdapter>,
    store: Arc<dyn SessionStore>,
    clock: Arc<dyn Clock>,
    sink: Arc<dyn EventSink>,
    validator: Validator,
    coordinator: UploadCoordinator,
    finalizer: Finalizer,
    retry: RetryPolicy,
    progress: ProgressTracker,
    registry: Mutex<Registry>,
}

impl Inner {
    fn find(&self, upload_id: &str) -> Option<Arc<UploadHandle>> {
        lock(&self.registry).find(upload_id)
    }

    fn handle(&self, upload_id: &str) -> Result<Arc<UploadHandle>, UploadError> {
        self.find(upload_id)
            .ok_or_else(|| UploadError::UploadNotFound(upload_id.to_string()))
    }

    /// Registers a new handle as active, enforcing the ceiling and session
    /// exclusivity.
    fn admit(&self, handle: &Arc<UploadHandle>) -> Result<(), UploadError> {
        let mut registry = lock(&self.registry);
        self.check_admission(&registry, handle)?;
        registry
            .active
            .insert(handle.id().to_string(), Arc::clone(handle));
        debug!(upload_id = %handle.id(), active = registry.active.len(), "upload admitted");
        Ok(())
    }

    /// Moves a failed handle from the history back to the active set.
    fn readmit(&self, handle: &Arc<UploadHandle>) -> Result<(), UploadError> {
        let mut registry = lock(&self.registry);
        self.check_admission(&registry, handle)?;
        if !handle.reset_for_retry(self.clock.now()) {
            return Err(UploadError::InvalidState {
                upload_id: handle.id().to_string(),
                action: "retry",
                status: handle.status(),
            });
        }
        registry.finished.retain(|h| h.id() != handle.id());
        registry
            .active
            .insert(handle.id().to_string(), Arc::clone(handle));
        Ok(())
    }

    fn check_admission(
        &self,
        registry: &Registry,
        handle: &UploadHandle,
    ) -> Result<(), UploadError> {
        let limit = self.config.max_concurrent_uploads;
        if registry.active.len() >= limit {
            warn!(upload_id = %handle.id(), limit, "upload rejected, concurrency limit reached");
            return Err(UploadError::ConcurrencyLimitExceeded { limit });
        }
        if let Some(session_id) = handle.session_id()
            && let Some(owner) = registry.session_owner(&session_id)
        {
            debug!(session_id = %session_id, owner, "session already being uploaded");
            return Err(UploadError::SessionBusy(session_id));
        }
        Ok(())
    }

    async fn run(self: Arc<Self>, handle: Arc<UploadHandle>, start: Start) {
        self.sink.emit(UploadEvent::UploadStarted {
            upload_id: handle.id().to_string(),
            file_name: handle.file_name().to_string(),
        });
        let cancel = handle.cancel_token();
        let result = self.execute(&handle, start, &cancel).await;
        if matches!(result, Err(UploadError::Cancelled))
            && let Some(session_id) = handle.session_id()
        {
            self.coordinator.discard(&session_id).await;
        }
        self.complete(&handle, result);
    }

    async fn execute(
        self: &Arc<Self>,
        handle: &Arc<UploadHandle>,
        start: Start,
        cancel: &CancellationToken,
    ) -> Result<String, UploadError> {
        handle.set_status(UploadStatus::Planning);
        let identity = handle.file().identity().await?;
        handle.set_identity(identity.clone());
        self.progress.start(handle.id(), identity.size);

        let rules = self.rules_for(handle.options());
        let validation = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(UploadError::Cancelled),
            result = self.validator.validate(&identity, handle.context(), &rules) => result,
        };
        for warning in &validation.warnings {
            warn!(upload_id = %handle.id(), kind = ?warning.kind, "{}", warning.message);
        }
        validation.into_result()?;
        if cancel.is_cancelled() {
            return Err(UploadError::Cancelled);
        }

        let chunked = identity.size > self.config.chunk_threshold;
        info!(
            upload_id = %handle.id(),
            file = %identity.name,
            size = identity.size,
            chunked = chunked || matches!(start, Start::Resume(_)),
            "upload started"
        );

        match start {
            Start::Resume(session_id) => {
                self.run_chunked(handle, SessionPlan::Resume { session_id }, cancel)
                    .await
            }
            Start::Fresh if chunked => {
                let plan = SessionPlan::Fresh {
                    upload_id: handle.id().to_string(),
                    object_path: object_path(handle),
                    file: identity,
                    context: handle.context().clone(),
                    source_path: handle
                        .file()
                        .source
                        .path()
                        .map(|p| p.to_string_lossy().into_owned()),
                };
                self.run_chunked(handle, plan, cancel).await
            }
            Start::Fresh => self.run_direct(handle, &identity, cancel).await,
        }
    }

    async fn run_chunked(
        self: &Arc<Self>,
        handle: &Arc<UploadHandle>,
        plan: SessionPlan,
        cancel: &CancellationToken,
    ) -> Result<String, UploadError> {
        let observer: Arc<dyn UploadObserver> = Arc::new(HandleObserver {
            inner: Arc::clone(self),
            handle: Arc::clone(handle),
        });
        let outcome = self
            .coordinator
            .run(plan, &handle.file().source, cancel, &observer)
            .await?;
        debug!(
            upload_id = %handle.id(),
            chunks_sent = outcome.chunks_sent,
            "chunked upload finished"
        );
        Ok(outcome.url)
    }

    /// Single-request path for files at or below the chunk threshold.
    async fn run_direct(
        self: &Arc<Self>,
        handle: &Arc<UploadHandle>,
        identity: &FileIdentity,
        cancel: &CancellationToken,
    ) -> Result<String, UploadError> {
        handle.set_status(UploadStatus::Uploading);
        let data = handle.file().source.read_all().await?;
        let request = InitiateRequest {
            object_path: object_path(handle),
            file_name: identity.name.clone(),
            size: identity.size,
            content_type: identity.content_type.clone(),
        };

        let total = identity.size;
        let on_progress: ProgressFn = {
            let inner = Arc::clone(self);
            let handle = Arc::clone(handle);
            Arc::new(move |sent: u64| inner.report_progress(&handle, sent, total))
        };
        let storage = &self.storage;
        let request_ref = &request;
        let data = &data;
        let timeout = self.config.chunk_timeout();
        let url = self
            .retry
            .run(
                "put_object",
                cancel,
                |_, _| handle.note_retry(),
                move || {
                    let on_progress = Arc::clone(&on_progress);
                    async move {
                        tokio::time::timeout(
                            timeout,
                            storage.put_object(request_ref, data.clone(), on_progress),
                        )
                        .await
                        .map_err(|_| UploadError::Timeout)?
                        .map_err(UploadError::from)
                    }
                },
            )
            .await?;

        handle.set_status(UploadStatus::Finalizing);
        self.finalizer.verify(&request.object_path).await?;
        Ok(url)
    }

    fn rules_for(&self, options: &UploadOptions) -> ValidationRules {
        let mut rules = ValidationRules::from_config(&self.config);
        if let Some(max) = options.max_file_size {
            rules.max_file_size = max;
        }
        if let Some(allowed) = &options.allowed_mime_types {
            rules.allowed_mime_types = Some(allowed.clone());
        }
        rules
    }

    /// Feeds the tracker and emits a progress event when the whole
    /// percentage advanced.
    fn report_progress(&self, handle: &UploadHandle, loaded: u64, total: u64) {
        if !self.progress.update(handle.id(), loaded, total) {
            return;
        }
        let percent = self.progress.get(handle.id()).unwrap_or_default();
        handle.report_progress(percent, |progress| {
            self.sink.emit(UploadEvent::UploadProgress {
                upload_id: handle.id().to_string(),
                file_name: handle.file_name().to_string(),
                progress,
            })
        });
    }

    /// Frees the concurrency slot, then records the terminal state and emits
    /// its single event.
    fn complete(&self, handle: &Arc<UploadHandle>, result: Result<String, UploadError>) {
        self.release(handle);

        let upload_id = handle.id().to_string();
        let file_name = handle.file_name().to_string();
        let (status, error) = match &result {
            Ok(_) => (UploadStatus::Completed, None),
            Err(UploadError::Cancelled) => (UploadStatus::Cancelled, None),
            Err(e) => (UploadStatus::Failed, Some((e.code(), e.to_string()))),
        };
        let event = match &result {
            Ok(url) => UploadEvent::UploadSuccess {
                upload_id: upload_id.clone(),
                file_name,
                url: url.clone(),
            },
            Err(UploadError::Cancelled) => UploadEvent::UploadCancelled {
                upload_id: upload_id.clone(),
                file_name,
            },
            Err(e) => UploadEvent::UploadError {
                upload_id: upload_id.clone(),
                file_name,
                code: e.code(),
                error: e.to_string(),
            },
        };
        handle.finish(status, error, self.clock.now(), || self.sink.emit(event));

        match result {
            Ok(url) => {
                if let Some(metrics) = self.progress.record_completion(&upload_id) {
                    info!(
                        upload_id = %upload_id,
                        url = %url,
                        bytes = metrics.bytes,
                        duration_ms = metrics.duration.as_millis() as u64,
                        bytes_per_sec = metrics.average_bytes_per_second as u64,
                        "upload completed"
                    );
                }
            }
            Err(UploadError::Cancelled) => {
                self.progress.remove(&upload_id);
                info!(upload_id = %upload_id, "upload cancelled");
            }
            Err(e) => {
                self.progress.remove(&upload_id);
                error!(upload_id = %upload_id, code = %e.code(), error = %e, "upload failed");
            }
        }
    }

    fn release(&self, handle: &Arc<UploadHandle>) {
        let mut registry = lock(&self.registry);
        registry.active.remove(handle.id());
        registry.finished.retain(|h| h.id() != handle.id());
        registry.finished.push_back(Arc::clone(handle));
        while registry.finished.len() > self.config.finished_history {
            registry.finished.pop_front();
        }
    }
}

fn object_path(handle: &UploadHandle) -> String {
    format!(
        "{}/{}/{}",
        handle.context().destination_prefix(),
        handle.id(),
        handle.file_name()
    )
}

/// Relays coordinator callbacks to the handle and the event sink.
struct HandleObserver {
    inner: Arc<Inner>,
    handle: Arc<UploadHandle>,
}

impl UploadObserver for HandleObserver {
    fn on_state(&self, status: UploadStatus) {
        self.handle.set_status(status);
    }

    fn on_session(&self, session: &UploadSession) {
        self.handle.set_session_id(&session.session_id);
    }

    fn on_progress(&self, loaded: u64, total: u64) {
        self.inner.report_progress(&self.handle, loaded, total);
    }

    fn on_chunk_retry(&self, _chunk: &ChunkInfo, _error: &UploadError) {
        self.handle.note_retry();
    }
}
