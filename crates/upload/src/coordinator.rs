//! Chunked upload state machine.
//!
//! `Planning -> Uploading -> Finalizing -> Completed`, leaving `Uploading`
//! for `Failed` when a chunk exhausts its retries and for `Cancelled` when
//! the cancellation token fires. Chunks go out in batches of
//! `parallel_chunks`; a batch only ends once each of its chunks has
//! succeeded or given up. The session record is saved after every chunk, so
//! a crash loses at most the chunks that were in flight.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chunkwise_protocol::{FileIdentity, UploadContext, UploadStatus};
use chunkwise_transfer::sync::lock;
use chunkwise_transfer::{
    ChunkInfo, ChunkStatus, Clock, NewSession, SessionLookup, SessionStore, UploadSession,
    UploadSource,
};
use futures_util::future::join_all;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::error::UploadError;
use crate::finalizer::Finalizer;
use crate::retry::{RetryPolicy, sleep_or_cancel};
use crate::storage::{InitiateRequest, ProgressFn, StorageAdapter};
use crate::uploader::{ChunkUploader, SharedSession};

/// Where a coordinator run starts from.
#[derive(Debug, Clone)]
pub enum SessionPlan {
    /// Opens a new backend session.
    Fresh {
        upload_id: String,
        file: FileIdentity,
        context: UploadContext,
        object_path: String,
        /// Recorded so the session can be resumed after a restart.
        source_path: Option<String>,
    },
    /// Continues a persisted session, skipping its completed chunks.
    Resume { session_id: String },
}

/// Receives state changes of a coordinator run.
///
/// Progress calls come from inside chunk transfers and may arrive out of
/// order.
pub trait UploadObserver: Send + Sync {
    fn on_state(&self, _status: UploadStatus) {}
    fn on_session(&self, _session: &UploadSession) {}
    fn on_progress(&self, _loaded: u64, _total: u64) {}
    fn on_chunk_retry(&self, _chunk: &ChunkInfo, _error: &UploadError) {}
}

/// Observer that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl UploadObserver for NoopObserver {}

/// Result of a completed chunked upload.
#[derive(Debug, Clone, PartialEq)]
pub struct CoordinatorOutcome {
    pub url: String,
    pub session_id: String,
    pub uploaded_bytes: u64,
    /// Chunks sent by this run; resumed chunks are not counted.
    pub chunks_sent: usize,
}

/// Byte accounting across the chunks of one run.
///
/// In-flight bytes per chunk only grow, and a chunk stops counting as in
/// flight once it is committed.
#[derive(Default)]
struct ByteCounter {
    inner: std::sync::Mutex<Counts>,
}

#[derive(Default)]
struct Counts {
    committed: u64,
    in_flight: HashMap<u32, u64>,
    done: HashSet<u32>,
}

impl Counts {
    fn loaded(&self) -> u64 {
        self.committed + self.in_flight.values().sum::<u64>()
    }
}

impl ByteCounter {
    fn starting_at(committed: u64) -> Self {
        Self {
            inner: std::sync::Mutex::new(Counts {
                committed,
                ..Counts::default()
            }),
        }
    }

    fn sent(&self, index: u32, bytes: u64) -> u64 {
        let mut counts = lock(&self.inner);
        if !counts.done.contains(&index) {
            let entry = counts.in_flight.entry(index).or_insert(0);
            *entry = (*entry).max(bytes);
        }
        counts.loaded()
    }

    fn commit(&self, index: u32, size: u64) -> u64 {
        let mut counts = lock(&self.inner);
        counts.in_flight.remove(&index);
        if counts.done.insert(index) {
            counts.committed += size;
        }
        counts.loaded()
    }

    fn reset(&self, index: u32) {
        lock(&self.inner).in_flight.remove(&index);
    }
}

/// Drives one chunked upload through its states.
pub struct UploadCoordinator {
    storage: Arc<dyn StorageAdapter>,
    store: Arc<dyn SessionStore>,
    clock: Arc<dyn Clock>,
    uploader: ChunkUploader,
    finalizer: Finalizer,
    chunk_size: u64,
    parallelism: usize,
    retry: RetryPolicy,
    finalize_retry: RetryPolicy,
    request_timeout: Duration,
    session_ttl: chrono::Duration,
}

impl UploadCoordinator {
    pub fn new(
        config: &EngineConfig,
        storage: Arc<dyn StorageAdapter>,
        store: Arc<dyn SessionStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let retry = config.retry_policy();
        Self {
            uploader: ChunkUploader::new(
                Arc::clone(&storage),
                Arc::clone(&clock),
                config.chunk_timeout(),
                config.session_ttl(),
            ),
            finalizer: Finalizer::new(Arc::clone(&storage), config.chunk_timeout()),
            storage,
            store,
            clock,
            chunk_size: config.chunk_size,
            parallelism: config.parallel_chunks.max(1),
            finalize_retry: retry.with_max_retries(1),
            retry,
            request_timeout: config.chunk_timeout(),
            session_ttl: config.session_ttl(),
        }
    }

    /// Runs the state machine to a terminal outcome.
    ///
    /// On success the session record is deleted. On cancellation the backend
    /// session is aborted and the record deleted. On failure the record is
    /// kept so a retry can skip the chunks already stored.
    pub async fn run(
        &self,
        plan: SessionPlan,
        source: &UploadSource,
        cancel: &CancellationToken,
        observer: &Arc<dyn UploadObserver>,
    ) -> Result<CoordinatorOutcome, UploadError> {
        observer.on_state(UploadStatus::Planning);
        let session = self.prepare(plan, cancel).await?;
        observer.on_session(&session);

        let session_id = session.session_id.clone();
        let storage_ref = session.storage_ref.clone();
        let shared: SharedSession = Arc::new(Mutex::new(session));

        let result = self.drive(&shared, source, cancel, observer).await;
        match &result {
            Ok(_) => self.discard_session(&session_id).await,
            Err(UploadError::Cancelled) => {
                if let Err(e) = self.storage.abort(&storage_ref).await {
                    warn!(session_id = %session_id, error = %e, "backend abort failed");
                }
                self.discard_session(&session_id).await;
                info!(session_id = %session_id, "chunked upload cancelled");
            }
            Err(e) => {
                warn!(
                    session_id = %session_id,
                    error = %e,
                    "chunked upload failed, session kept for retry"
                );
            }
        }
        result
    }

    /// Loads a session that has not expired.
    ///
    /// Expired records are deleted and reported as [`UploadError::SessionExpired`].
    pub fn load_session(&self, session_id: &str) -> Result<UploadSession, UploadError> {
        match self.store.lookup(session_id)? {
            SessionLookup::Found(session) => Ok(session),
            SessionLookup::Expired(_) => {
                self.store.remove(session_id)?;
                Err(UploadError::SessionExpired(session_id.to_string()))
            }
            SessionLookup::Missing => Err(UploadError::SessionNotFound(session_id.to_string())),
        }
    }

    async fn prepare(
        &self,
        plan: SessionPlan,
        cancel: &CancellationToken,
    ) -> Result<UploadSession, UploadError> {
        match plan {
            SessionPlan::Fresh {
                upload_id,
                file,
                context,
                object_path,
                source_path,
            } => {
                let request = InitiateRequest {
                    object_path: object_path.clone(),
                    file_name: file.name.clone(),
                    size: file.size,
                    content_type: file.content_type.clone(),
                };
                let request = &request;
                let storage = &self.storage;
                let timeout = self.request_timeout;
                let target = self
                    .retry
                    .run("initiate", cancel, |_, _| {}, move || async move {
                        tokio::time::timeout(timeout, storage.initiate_resumable(request))
                            .await
                            .map_err(|_| UploadError::Timeout)?
                            .map_err(UploadError::from)
                    })
                    .await?;

                let chunk_size = target
                    .chunk_size_hint
                    .filter(|&hint| hint > 0)
                    .unwrap_or(self.chunk_size);
                let session = UploadSession::create(
                    NewSession {
                        session_id: uuid::Uuid::new_v4().to_string(),
                        upload_id,
                        storage_ref: target.session_ref,
                        object_path,
                        file,
                        context,
                        source_path,
                        chunk_size,
                    },
                    self.clock.now(),
                    self.session_ttl,
                );
                self.persist(session.clone()).await?;
                info!(
                    upload_id = %session.upload_id,
                    session_id = %session.session_id,
                    chunks = session.total_chunks,
                    chunk_size,
                    "chunked upload planned"
                );
                Ok(session)
            }
            SessionPlan::Resume { session_id } => {
                let mut session = self.load_session(&session_id)?;
                session.verify()?;
                session.touch(self.clock.now(), self.session_ttl);
                self.persist(session.clone()).await?;
                info!(
                    upload_id = %session.upload_id,
                    session_id = %session.session_id,
                    done = session.completed_chunks.len(),
                    chunks = session.total_chunks,
                    "resuming chunked upload"
                );
                Ok(session)
            }
        }
    }

    async fn drive(
        &self,
        shared: &SharedSession,
        source: &UploadSource,
        cancel: &CancellationToken,
        observer: &Arc<dyn UploadObserver>,
    ) -> Result<CoordinatorOutcome, UploadError> {
        observer.on_state(UploadStatus::Uploading);
        let (pending, total, committed) = {
            let session = shared.lock().await;
            (
                session.pending_chunks(),
                session.file.size,
                session.uploaded_bytes,
            )
        };
        let bytes = Arc::new(ByteCounter::starting_at(committed));
        observer.on_progress(committed, total);
        debug!(pending = pending.len(), parallelism = self.parallelism, "sending chunks");

        let mut chunks_sent = 0;
        for batch in pending.chunks(self.parallelism) {
            if cancel.is_cancelled() {
                return Err(UploadError::Cancelled);
            }
            let sends = batch.iter().cloned().map(|chunk| {
                self.send_with_retry(chunk, shared, source, cancel, observer, &bytes, total)
            });

            let mut failure = None;
            for result in join_all(sends).await {
                match result {
                    Ok(()) => chunks_sent += 1,
                    Err(UploadError::Cancelled) => failure = Some(UploadError::Cancelled),
                    Err(e) => {
                        failure.get_or_insert(e);
                    }
                }
            }
            if let Some(e) = failure {
                return Err(e);
            }
        }

        let snapshot = {
            let session = shared.lock().await;
            if !session.is_complete() {
                return Err(UploadError::Storage(format!(
                    "session {} has {} of {} chunks after upload",
                    session.session_id,
                    session.completed_chunks.len(),
                    session.total_chunks
                )));
            }
            session.clone()
        };

        observer.on_state(UploadStatus::Finalizing);
        let finalizer = &self.finalizer;
        let session = &snapshot;
        let url = self
            .finalize_retry
            .run("finalize", cancel, |_, _| {}, move || finalizer.finalize(session))
            .await?;

        Ok(CoordinatorOutcome {
            url,
            session_id: snapshot.session_id,
            uploaded_bytes: snapshot.uploaded_bytes,
            chunks_sent,
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn send_with_retry(
        &self,
        mut chunk: ChunkInfo,
        shared: &SharedSession,
        source: &UploadSource,
        cancel: &CancellationToken,
        observer: &Arc<dyn UploadObserver>,
        bytes: &Arc<ByteCounter>,
        total: u64,
    ) -> Result<(), UploadError> {
        let mut attempt = 0;
        loop {
            chunk.status = ChunkStatus::Uploading;
            let on_progress: ProgressFn = {
                let bytes = Arc::clone(bytes);
                let observer = Arc::clone(observer);
                let index = chunk.index;
                Arc::new(move |sent: u64| observer.on_progress(bytes.sent(index, sent), total))
            };

            match self
                .uploader
                .upload_chunk(&chunk, source, shared, on_progress, cancel)
                .await
            {
                Ok(()) => {
                    chunk.status = ChunkStatus::Completed;
                    observer.on_progress(bytes.commit(chunk.index, chunk.size()), total);
                    self.save(shared).await;
                    debug!(chunk = chunk.index, retries = chunk.retry_count, "chunk stored");
                    return Ok(());
                }
                Err(UploadError::Cancelled) => {
                    bytes.reset(chunk.index);
                    return Err(UploadError::Cancelled);
                }
                Err(e) => {
                    bytes.reset(chunk.index);
                    if self.retry.should_retry(attempt, &e) {
                        let delay = self.retry.next_delay(attempt);
                        chunk.retry_count += 1;
                        warn!(
                            chunk = chunk.index,
                            attempt = attempt + 1,
                            delay_ms = delay.as_millis() as u64,
                            error = %e,
                            "chunk failed, retrying"
                        );
                        observer.on_chunk_retry(&chunk, &e);
                        sleep_or_cancel(delay, cancel).await?;
                        attempt += 1;
                        continue;
                    }
                    chunk.status = ChunkStatus::Failed;
                    error!(
                        chunk = chunk.index,
                        retries = chunk.retry_count,
                        error = %e,
                        "chunk failed"
                    );
                    return Err(e);
                }
            }
        }
    }

    /// Persists the session. Holding the session lock serializes the writes.
    async fn save(&self, shared: &SharedSession) {
        let session = shared.lock().await;
        if let Err(e) = self.persist(session.clone()).await {
            warn!(session_id = %session.session_id, error = %e, "failed to persist session");
        }
    }

    /// Store calls may do synchronous file I/O, so they run on the blocking
    /// pool.
    async fn persist(&self, session: UploadSession) -> Result<(), UploadError> {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || store.save(&session))
            .await
            .map_err(|e| UploadError::Storage(format!("session save task failed: {e}")))??;
        Ok(())
    }

    /// Aborts the backend session and deletes the record, if one is stored.
    ///
    /// Used when an upload is cancelled before the state machine ran.
    pub async fn discard(&self, session_id: &str) {
        let storage_ref = match self.store.lookup(session_id) {
            Ok(SessionLookup::Found(session) | SessionLookup::Expired(session)) => {
                session.storage_ref
            }
            Ok(SessionLookup::Missing) => return,
            Err(e) => {
                warn!(session_id, error = %e, "failed to look up session to discard");
                return;
            }
        };
        if let Err(e) = self.storage.abort(&storage_ref).await {
            warn!(session_id, error = %e, "backend abort failed");
        }
        self.discard_session(session_id).await;
        debug!(session_id, "session discarded");
    }

    async fn discard_session(&self, session_id: &str) {
        let store = Arc::clone(&self.store);
        let id = session_id.to_string();
        let removed = tokio::task::spawn_blocking(move || store.remove(&id)).await;
        match removed {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(session_id, error = %e, "failed to remove session"),
            Err(e) => warn!(session_id, error = %e, "session remove task failed"),
        }
    }
}
