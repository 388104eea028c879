//! Hand-written fakes shared by the engine tests.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chunkwise_protocol::{UploadContext, UploadEvent};
use chunkwise_transfer::{ByteRange, checksum_bytes};

use crate::error::StorageError;
use crate::sink::EventSink;
use crate::storage::{BoxFuture, InitiateRequest, ProgressFn, ResumableTarget, StorageAdapter};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Fail {
    Network,
    Unavailable,
    BadRequest,
    /// Never answers; only a timeout or cancellation ends the call.
    Hang,
}

impl Fail {
    fn error(self) -> StorageError {
        match self {
            Self::Network => StorageError::Network("connection reset".into()),
            Self::Unavailable => StorageError::from_status(503, "service unavailable"),
            Self::BadRequest => StorageError::from_status(400, "bad request"),
            Self::Hang => StorageError::Timeout,
        }
    }
}

struct Staged {
    object_path: String,
    size: u64,
    parts: BTreeMap<u64, Vec<u8>>,
}

impl Staged {
    fn assembled(&self) -> Option<Vec<u8>> {
        let mut out = Vec::with_capacity(self.size as usize);
        for (&start, data) in &self.parts {
            if start != out.len() as u64 {
                return None;
            }
            out.extend_from_slice(data);
        }
        (out.len() as u64 == self.size).then_some(out)
    }
}

#[derive(Default)]
struct MockState {
    next_session: u32,
    sessions: HashMap<String, Staged>,
    objects: HashMap<String, Vec<u8>>,
    chunk_failures: HashMap<u64, VecDeque<Fail>>,
    object_failures: VecDeque<Fail>,
    finalize_failures: u32,
    initiate_calls: u32,
    put_calls: Vec<ByteRange>,
    finalize_calls: u32,
    put_object_calls: u32,
    abort_calls: Vec<String>,
    in_flight: HashSet<(String, u64)>,
    max_in_flight: usize,
    duplicate_in_flight: bool,
}

/// In-memory backend with failure injection and call accounting.
pub(crate) struct MockStorage {
    state: Mutex<MockState>,
    put_delay: Duration,
    chunk_size_hint: Option<u64>,
    assembles: bool,
}

impl MockStorage {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(MockState::default()),
            put_delay: Duration::ZERO,
            chunk_size_hint: None,
            assembles: true,
        }
    }

    /// Every chunk and object transfer takes `delay` (virtual time in tests).
    pub(crate) fn with_put_delay(mut self, delay: Duration) -> Self {
        self.put_delay = delay;
        self
    }

    pub(crate) fn with_chunk_size_hint(mut self, hint: u64) -> Self {
        self.chunk_size_hint = Some(hint);
        self
    }

    /// Chunks land directly in the object; there is no assemble step.
    pub(crate) fn without_assembly(mut self) -> Self {
        self.assembles = false;
        self
    }

    /// The next `times` sends of the chunk starting at `start` fail.
    pub(crate) fn fail_chunk(self, start: u64, times: usize, fail: Fail) -> Self {
        self.state
            .lock()
            .unwrap()
            .chunk_failures
            .entry(start)
            .or_default()
            .extend(std::iter::repeat_n(fail, times));
        self
    }

    pub(crate) fn fail_put_object(self, times: usize, fail: Fail) -> Self {
        self.state
            .lock()
            .unwrap()
            .object_failures
            .extend(std::iter::repeat_n(fail, times));
        self
    }

    pub(crate) fn fail_finalize(self, times: u32) -> Self {
        self.state.lock().unwrap().finalize_failures = times;
        self
    }

    pub(crate) fn initiate_calls(&self) -> u32 {
        self.state.lock().unwrap().initiate_calls
    }

    pub(crate) fn put_calls(&self) -> Vec<ByteRange> {
        self.state.lock().unwrap().put_calls.clone()
    }

    pub(crate) fn finalize_calls(&self) -> u32 {
        self.state.lock().unwrap().finalize_calls
    }

    pub(crate) fn put_object_calls(&self) -> u32 {
        self.state.lock().unwrap().put_object_calls
    }

    pub(crate) fn abort_calls(&self) -> Vec<String> {
        self.state.lock().unwrap().abort_calls.clone()
    }

    pub(crate) fn network_calls(&self) -> usize {
        let s = self.state.lock().unwrap();
        s.initiate_calls as usize + s.put_calls.len() + s.put_object_calls as usize
    }

    pub(crate) fn object(&self, path: &str) -> Option<Vec<u8>> {
        self.state.lock().unwrap().objects.get(path).cloned()
    }

    pub(crate) fn staged_sessions(&self) -> usize {
        self.state.lock().unwrap().sessions.len()
    }

    pub(crate) fn max_in_flight(&self) -> usize {
        self.state.lock().unwrap().max_in_flight
    }

    pub(crate) fn saw_duplicate_in_flight(&self) -> bool {
        self.state.lock().unwrap().duplicate_in_flight
    }

    /// Opens a session directly, as if a previous process had done it.
    pub(crate) fn open_session(&self, object_path: &str, size: u64) -> String {
        let mut s = self.state.lock().unwrap();
        s.next_session += 1;
        let session_ref = format!("mock-session-{}", s.next_session);
        s.sessions.insert(
            session_ref.clone(),
            Staged {
                object_path: object_path.into(),
                size,
                parts: BTreeMap::new(),
            },
        );
        session_ref
    }

    /// Stores a part directly, as if a previous process had sent it.
    pub(crate) fn seed_part(&self, session_ref: &str, start: u64, data: &[u8]) {
        let mut s = self.state.lock().unwrap();
        if let Some(staged) = s.sessions.get_mut(session_ref) {
            staged.parts.insert(start, data.to_vec());
        }
    }

    fn take_chunk_failure(&self, start: u64) -> Option<Fail> {
        self.state
            .lock()
            .unwrap()
            .chunk_failures
            .get_mut(&start)
            .and_then(VecDeque::pop_front)
    }
}

struct InFlight<'a> {
    storage: &'a MockStorage,
    key: (String, u64),
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.storage.state.lock().unwrap().in_flight.remove(&self.key);
    }
}

impl StorageAdapter for MockStorage {
    fn initiate_resumable<'a>(
        &'a self,
        request: &'a InitiateRequest,
    ) -> BoxFuture<'a, Result<ResumableTarget, StorageError>> {
        Box::pin(async move {
            self.state.lock().unwrap().initiate_calls += 1;
            let session_ref = self.open_session(&request.object_path, request.size);
            Ok(ResumableTarget {
                session_ref,
                chunk_size_hint: self.chunk_size_hint,
            })
        })
    }

    fn put_chunk<'a>(
        &'a self,
        session_ref: &'a str,
        range: ByteRange,
        data: Vec<u8>,
        checksum: &'a str,
        on_progress: ProgressFn,
    ) -> BoxFuture<'a, Result<(), StorageError>> {
        Box::pin(async move {
            let key = (session_ref.to_string(), range.start);
            {
                let mut s = self.state.lock().unwrap();
                s.put_calls.push(range);
                if !s.in_flight.insert(key.clone()) {
                    s.duplicate_in_flight = true;
                }
                s.max_in_flight = s.max_in_flight.max(s.in_flight.len());
            }
            let _in_flight = InFlight { storage: self, key };

            on_progress(data.len() as u64 / 2);
            if !self.put_delay.is_zero() {
                tokio::time::sleep(self.put_delay).await;
            }
            match self.take_chunk_failure(range.start) {
                Some(Fail::Hang) => std::future::pending::<()>().await,
                Some(fail) => return Err(fail.error()),
                None => {}
            }
            if checksum != checksum_bytes(&data) {
                return Err(StorageError::ChecksumMismatch {
                    start: range.start,
                    end: range.end,
                });
            }
            on_progress(data.len() as u64);

            let mut s = self.state.lock().unwrap();
            let staged = s
                .sessions
                .get_mut(session_ref)
                .ok_or_else(|| StorageError::NotFound(session_ref.to_string()))?;
            staged.parts.insert(range.start, data);
            Ok(())
        })
    }

    fn finalize<'a>(&'a self, session_ref: &'a str) -> BoxFuture<'a, Result<String, StorageError>> {
        Box::pin(async move {
            let mut s = self.state.lock().unwrap();
            s.finalize_calls += 1;
            if s.finalize_failures > 0 {
                s.finalize_failures -= 1;
                return Err(StorageError::from_status(503, "assembly backlog"));
            }
            let staged = s
                .sessions
                .remove(session_ref)
                .ok_or_else(|| StorageError::NotFound(session_ref.to_string()))?;
            let Some(bytes) = staged.assembled() else {
                return Err(StorageError::from_status(409, "missing parts"));
            };
            let url = format!("mock://{}", staged.object_path);
            s.objects.insert(staged.object_path, bytes);
            Ok(url)
        })
    }

    fn exists<'a>(&'a self, object_path: &'a str) -> BoxFuture<'a, Result<bool, StorageError>> {
        Box::pin(async move {
            let s = self.state.lock().unwrap();
            let direct = s.objects.contains_key(object_path);
            let in_place = !self.assembles
                && s.sessions
                    .values()
                    .any(|st| st.object_path == object_path && st.assembled().is_some());
            Ok(direct || in_place)
        })
    }

    fn put_object<'a>(
        &'a self,
        request: &'a InitiateRequest,
        data: Vec<u8>,
        on_progress: ProgressFn,
    ) -> BoxFuture<'a, Result<String, StorageError>> {
        Box::pin(async move {
            let failure = {
                let mut s = self.state.lock().unwrap();
                s.put_object_calls += 1;
                s.object_failures.pop_front()
            };
            if !self.put_delay.is_zero() {
                tokio::time::sleep(self.put_delay).await;
            }
            match failure {
                Some(Fail::Hang) => std::future::pending::<()>().await,
                Some(fail) => return Err(fail.error()),
                None => {}
            }
            on_progress(data.len() as u64);
            self.state
                .lock()
                .unwrap()
                .objects
                .insert(request.object_path.clone(), data);
            Ok(format!("mock://{}", request.object_path))
        })
    }

    fn abort<'a>(&'a self, session_ref: &'a str) -> BoxFuture<'a, Result<(), StorageError>> {
        Box::pin(async move {
            let mut s = self.state.lock().unwrap();
            s.abort_calls.push(session_ref.to_string());
            s.sessions.remove(session_ref);
            Ok(())
        })
    }

    fn assembles_chunks(&self) -> bool {
        self.assembles
    }

    fn object_url(&self, object_path: &str) -> String {
        format!("mock://{object_path}")
    }
}

/// Sink that keeps every event.
#[derive(Clone, Default)]
pub(crate) struct RecordingSink {
    events: Arc<Mutex<Vec<UploadEvent>>>,
}

impl RecordingSink {
    pub(crate) fn events(&self) -> Vec<UploadEvent> {
        self.events.lock().unwrap().clone()
    }

    pub(crate) fn for_upload(&self, upload_id: &str) -> Vec<UploadEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.upload_id() == upload_id)
            .collect()
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: UploadEvent) {
        self.events.lock().unwrap().push(event);
    }
}

pub(crate) fn workspace() -> UploadContext {
    UploadContext::Workspace {
        workspace_id: "ws-1".into(),
        folder_id: Some("folder-9".into()),
        user_id: "user-1".into(),
    }
}

/// Deterministic, non-repeating-looking test payload.
pub(crate) fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}
