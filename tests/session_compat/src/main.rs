fn main() {
    println!("Run `cargo test -p session-compat` to execute session compatibility tests.");
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::{Path, PathBuf};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    use chrono::{DateTime, Utc};
    use chunkwise_protocol::{ErrorCode, UploadContext, UploadEvent, UploadProgress, UploadStatus};
    use chunkwise_transfer::{
        ByteRange, FileSessionStore, ManualClock, SessionStore, SystemClock, UploadSession,
    };
    use chunkwise_upload::{
        BoxFuture, ChannelSink, EngineConfig, InitiateRequest, LocalStorage, ProgressFn,
        ResumableTarget, StorageAdapter, StorageError, UploadFile, UploadManager, UploadOptions,
    };
    use tokio::sync::mpsc::UnboundedReceiver;
    use tracing_subscriber::EnvFilter;

    const KIB: u64 = 1024;

    /// Returns the path to the fixtures directory.
    fn fixtures_dir() -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("fixtures")
    }

    /// Loads a fixture JSON file and returns it as a `serde_json::Value`.
    fn load_fixture(name: &str) -> serde_json::Value {
        let path = fixtures_dir().join(name);
        let data = fs::read_to_string(&path)
            .unwrap_or_else(|e| panic!("failed to read fixture {}: {e}", path.display()));
        serde_json::from_str(&data)
            .unwrap_or_else(|e| panic!("failed to parse fixture {}: {e}", path.display()))
    }

    /// Normalizes JSON numbers so that `42` and `42.0` compare as equal.
    fn normalize_value(v: &serde_json::Value) -> serde_json::Value {
        match v {
            serde_json::Value::Number(n) => match n.as_f64() {
                Some(f) => serde_json::json!(f),
                None => v.clone(),
            },
            serde_json::Value::Object(map) => serde_json::Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), normalize_value(v)))
                    .collect(),
            ),
            serde_json::Value::Array(arr) => {
                serde_json::Value::Array(arr.iter().map(normalize_value).collect())
            }
            _ => v.clone(),
        }
    }

    /// Deserializes a fixture, re-serializes it and compares the JSON values.
    fn roundtrip_test<T>(name: &str) -> T
    where
        T: serde::de::DeserializeOwned + serde::Serialize,
    {
        let fixture = load_fixture(name);
        let parsed: T = serde_json::from_value(fixture.clone())
            .unwrap_or_else(|e| panic!("failed to deserialize {name}: {e}"));
        let reserialized = serde_json::to_value(&parsed)
            .unwrap_or_else(|e| panic!("failed to re-serialize {name}: {e}"));
        assert_eq!(
            normalize_value(&fixture),
            normalize_value(&reserialized),
            "roundtrip mismatch for {name}:\n  fixture: {fixture}\n  rust:    {reserialized}"
        );
        parsed
    }

    fn at(rfc3339: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(rfc3339)
            .unwrap()
            .with_timezone(&Utc)
    }

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    }

    // --- Persisted formats ---

    #[test]
    fn fixture_session_record() {
        let session: UploadSession = roundtrip_test("session_record.json");
        session.verify().unwrap();
        assert_eq!(session.total_chunks, 3);
        assert_eq!(
            session.pending_chunks().iter().map(|c| c.index).collect::<Vec<_>>(),
            vec![2]
        );
        assert_eq!(
            session.pending_chunks()[0].range,
            ByteRange {
                start: 8388608,
                end: 10485760
            }
        );
        assert!((session.percentage() - 80.0).abs() < 1e-9);
        assert!(!session.is_expired(at("2026-03-02T12:04:59Z")));
        assert!(session.is_expired(at("2026-03-02T12:05:01Z")));
    }

    #[test]
    fn fixture_session_shared_link() {
        let session: UploadSession = roundtrip_test("session_shared_link.json");
        session.verify().unwrap();
        assert!(session.source_path.is_none());
        assert_eq!(session.context.owner_id(), "lnk-3");
        assert_eq!(session.context.destination_prefix(), "links/lnk-3/inbox");
        assert_eq!(session.pending_chunks().len(), 3);
    }

    #[test]
    fn fixture_upload_events() {
        let events: Vec<UploadEvent> = roundtrip_test("upload_events.json");
        assert_eq!(events.len(), 6);
        assert!(!events[0].is_terminal());
        assert!(!events[1].is_terminal());
        assert!(events[2..].iter().all(UploadEvent::is_terminal));
        assert!(matches!(
            events[4],
            UploadEvent::UploadError {
                code: ErrorCode::ConcurrencyLimitExceeded,
                ..
            }
        ));
    }

    #[test]
    fn fixture_upload_progress() {
        let progress: UploadProgress = roundtrip_test("upload_progress.json");
        assert_eq!(progress.status, UploadStatus::Uploading);
        assert!((progress.percentage() - 40.0).abs() < 1e-9);
    }

    #[test]
    fn fixture_partial_engine_config() {
        let config = EngineConfig::load(&fixtures_dir().join("engine_config.json")).unwrap();
        assert_eq!(config.chunk_threshold, 16 * 1024 * 1024);
        assert_eq!(config.parallel_chunks, 4);
        assert_eq!(config.retry_delays_ms, vec![500, 1000]);
        assert_eq!(config.retry_policy().delays.len(), 2);
        // Everything else keeps its default.
        let defaults = EngineConfig::default();
        assert_eq!(config.chunk_size, defaults.chunk_size);
        assert_eq!(config.max_retries, defaults.max_retries);
        assert_eq!(config.blocked_extensions, defaults.blocked_extensions);
    }

    #[test]
    fn fixture_session_store_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions.json");
        fs::copy(fixtures_dir().join("session_store.json"), &path).unwrap();

        let clock = Arc::new(ManualClock::new(at("2026-03-01T18:00:00Z")));
        let store = FileSessionStore::open(path.clone(), 64, clock).unwrap();
        assert_eq!(store.list_resumable().unwrap(), vec!["sess-live".to_string()]);

        let live = store.load("sess-live").unwrap().unwrap();
        assert_eq!(live.uploaded_bytes, 12);
        assert_eq!(
            live.pending_chunks().iter().map(|c| c.index).collect::<Vec<_>>(),
            vec![1, 3]
        );

        assert_eq!(store.purge_expired().unwrap(), 1);
        let on_disk: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        let keys: Vec<&String> = on_disk.as_object().unwrap().keys().collect();
        assert_eq!(keys, vec!["sess-live"]);
    }

    // --- End to end against the filesystem backend ---

    fn config() -> EngineConfig {
        EngineConfig {
            chunk_threshold: 64 * KIB,
            chunk_size: 16 * KIB,
            parallel_chunks: 2,
            retry_delays_ms: vec![10, 20],
            ..EngineConfig::default()
        }
    }

    fn context() -> UploadContext {
        UploadContext::Workspace {
            workspace_id: "ws-1".into(),
            folder_id: None,
            user_id: "user-1".into(),
        }
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 % 253) as u8).collect()
    }

    fn write_source(dir: &Path, name: &str, len: usize) -> (PathBuf, Vec<u8>) {
        let data = pattern(len);
        let path = dir.join(name);
        fs::write(&path, &data).unwrap();
        (path, data)
    }

    fn drain(rx: &mut UnboundedReceiver<UploadEvent>) -> Vec<UploadEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn file_store(path: &Path) -> Arc<FileSessionStore> {
        Arc::new(FileSessionStore::open(path.to_path_buf(), 64, Arc::new(SystemClock)).unwrap())
    }

    #[tokio::test]
    async fn small_and_large_files_end_to_end() {
        init_tracing();
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("bucket");
        let store_path = dir.path().join("sessions.json");
        let (small_path, small) = write_source(dir.path(), "notes.txt", 3000);
        let (large_path, large) = write_source(dir.path(), "footage.bin", 150 * KIB as usize);

        let (sink, mut rx) = ChannelSink::new();
        let manager = UploadManager::builder(config(), Arc::new(LocalStorage::new(&root)))
            .session_store(file_store(&store_path))
            .event_sink(Arc::new(sink))
            .build()
            .unwrap();

        let a = manager
            .upload(UploadFile::from_path(&small_path), context(), UploadOptions::default())
            .unwrap();
        let b = manager
            .upload(UploadFile::from_path(&large_path), context(), UploadOptions::default())
            .unwrap();
        assert_eq!(manager.wait(&a).await.unwrap(), UploadStatus::Completed);
        assert_eq!(manager.wait(&b).await.unwrap(), UploadStatus::Completed);

        let stored = |id: &str, name: &str| {
            fs::read(root.join(format!("workspaces/ws-1/root/{id}/{name}"))).unwrap()
        };
        assert_eq!(stored(&a, "notes.txt"), small);
        assert_eq!(stored(&b, "footage.bin"), large);
        assert!(manager.resumable_sessions().unwrap().is_empty());
        assert!(
            fs::read_dir(root.join(".staging"))
                .map(|entries| entries.count() == 0)
                .unwrap_or(true)
        );

        let events = drain(&mut rx);
        for id in [&a, &b] {
            let mine: Vec<_> = events.iter().filter(|e| e.upload_id() == id.as_str()).collect();
            assert!(matches!(mine.first(), Some(UploadEvent::UploadStarted { .. })));
            assert!(matches!(mine.last(), Some(UploadEvent::UploadSuccess { .. })));
            assert_eq!(mine.iter().filter(|e| e.is_terminal()).count(), 1);
        }
        let Some(UploadEvent::UploadSuccess { url, .. }) =
            events.iter().find(|e| e.upload_id() == b && e.is_terminal())
        else {
            panic!("missing success event for {b}");
        };
        assert!(url.starts_with("file://"));
        assert!(url.ends_with(&format!("{b}/footage.bin")));
    }

    /// Filesystem backend whose chunk at `fail_at` is rejected while armed.
    struct FlakyStorage {
        inner: LocalStorage,
        fail_at: u64,
        armed: AtomicBool,
    }

    impl StorageAdapter for FlakyStorage {
        fn initiate_resumable<'a>(
            &'a self,
            request: &'a InitiateRequest,
        ) -> BoxFuture<'a, Result<ResumableTarget, StorageError>> {
            self.inner.initiate_resumable(request)
        }

        fn put_chunk<'a>(
            &'a self,
            session_ref: &'a str,
            range: ByteRange,
            data: Vec<u8>,
            checksum: &'a str,
            on_progress: ProgressFn,
        ) -> BoxFuture<'a, Result<(), StorageError>> {
            if range.start == self.fail_at && self.armed.load(Ordering::SeqCst) {
                return Box::pin(async { Err(StorageError::from_status(400, "rejected range")) });
            }
            self.inner
                .put_chunk(session_ref, range, data, checksum, on_progress)
        }

        fn finalize<'a>(
            &'a self,
            session_ref: &'a str,
        ) -> BoxFuture<'a, Result<String, StorageError>> {
            self.inner.finalize(session_ref)
        }

        fn exists<'a>(&'a self, object_path: &'a str) -> BoxFuture<'a, Result<bool, StorageError>> {
            self.inner.exists(object_path)
        }

        fn put_object<'a>(
            &'a self,
            request: &'a InitiateRequest,
            data: Vec<u8>,
            on_progress: ProgressFn,
        ) -> BoxFuture<'a, Result<String, StorageError>> {
            self.inner.put_object(request, data, on_progress)
        }

        fn abort<'a>(&'a self, session_ref: &'a str) -> BoxFuture<'a, Result<(), StorageError>> {
            self.inner.abort(session_ref)
        }

        fn object_url(&self, object_path: &str) -> String {
            self.inner.object_url(object_path)
        }
    }

    #[tokio::test]
    async fn resume_after_restart_from_session_file() {
        init_tracing();
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("bucket");
        let store_path = dir.path().join("sessions.json");
        let (source_path, data) = write_source(dir.path(), "footage.bin", 100 * KIB as usize);

        // First process: chunk 2 is rejected, so the upload fails after
        // chunks 0, 1 and 3 are stored.
        let session_id = {
            let storage = Arc::new(FlakyStorage {
                inner: LocalStorage::new(&root),
                fail_at: 32 * KIB,
                armed: AtomicBool::new(true),
            });
            let manager = UploadManager::builder(config(), storage)
                .session_store(file_store(&store_path))
                .build()
                .unwrap();
            let id = manager
                .upload(UploadFile::from_path(&source_path), context(), UploadOptions::default())
                .unwrap();
            assert_eq!(manager.wait(&id).await.unwrap(), UploadStatus::Failed);
            let (code, _) = manager.handle(&id).unwrap().last_error().unwrap();
            assert_eq!(code, ErrorCode::Client);
            manager.handle(&id).unwrap().session_id().unwrap()
        };

        // Second process: only the session file and the staging area survive.
        let store = file_store(&store_path);
        let persisted = store.load(&session_id).unwrap().unwrap();
        assert_eq!(
            persisted.completed_chunks.iter().copied().collect::<Vec<_>>(),
            vec![0, 1, 3]
        );
        assert_eq!(persisted.uploaded_bytes, 48 * KIB);
        assert_eq!(
            persisted.source_path.as_deref(),
            Some(source_path.to_string_lossy().as_ref())
        );

        let (sink, mut rx) = ChannelSink::new();
        let manager = UploadManager::builder(config(), Arc::new(LocalStorage::new(&root)))
            .session_store(store.clone())
            .event_sink(Arc::new(sink))
            .build()
            .unwrap();
        let id = manager.resume_session(&session_id).await.unwrap();
        assert_eq!(manager.wait(&id).await.unwrap(), UploadStatus::Completed);

        assert_eq!(fs::read(root.join(&persisted.object_path)).unwrap(), data);
        assert!(store.list_resumable().unwrap().is_empty());
        let on_disk: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&store_path).unwrap()).unwrap();
        assert!(on_disk.as_object().unwrap().is_empty());

        // Progress picks up from the persisted bytes rather than zero.
        let progress: Vec<f64> = drain(&mut rx)
            .into_iter()
            .filter_map(|e| match e {
                UploadEvent::UploadProgress { progress, .. } => Some(progress),
                _ => None,
            })
            .collect();
        assert!(progress.first().is_some_and(|p| *p >= 48.0), "{progress:?}");
    }

    #[tokio::test]
    async fn expired_session_cannot_be_resumed() {
        init_tracing();
        let dir = tempfile::tempdir().unwrap();
        let store_path = dir.path().join("sessions.json");
        fs::copy(fixtures_dir().join("session_store.json"), &store_path).unwrap();

        let clock = Arc::new(ManualClock::new(at("2026-03-01T18:00:00Z")));
        let store =
            Arc::new(FileSessionStore::open(store_path.clone(), 64, clock.clone()).unwrap());
        let manager = UploadManager::builder(config(), Arc::new(LocalStorage::new(dir.path())))
            .session_store(store.clone())
            .clock(clock)
            .build()
            .unwrap();

        let err = manager.resume_session("sess-stale").await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::SessionExpired);
        assert!(store.load("sess-stale").unwrap().is_none());

        // The live fixture session has no source path to reopen.
        let err = manager.resume_session("sess-live").await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::Validation);
        assert_eq!(manager.resumable_sessions().unwrap().len(), 1);
    }
}
