//! Engine configuration.
//!
//! Stored as JSON. Every field has a default, so a partial file (or no file)
//! is a valid configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::retry::RetryPolicy;

const MIB: u64 = 1024 * 1024;
const GIB: u64 = 1024 * MIB;

/// Upper bound for `session_expiry_secs` (ten years).
const MAX_SESSION_EXPIRY_SECS: u64 = 10 * 365 * 24 * 60 * 60;

/// Tunables for the upload engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Files strictly larger than this go through the chunked path.
    pub chunk_threshold: u64,
    /// Chunk size used unless the backend suggests one.
    pub chunk_size: u64,
    /// Chunks sent concurrently within one upload.
    pub parallel_chunks: usize,
    /// Uploads admitted at once across the whole manager.
    pub max_concurrent_uploads: usize,
    /// Retries per chunk (or per single-shot upload) after the first attempt.
    pub max_retries: u32,
    /// Backoff schedule, indexed by attempt and clamped to the last entry.
    pub retry_delays_ms: Vec<u64>,
    /// Idle lifetime of a resumable session.
    pub session_expiry_secs: u64,
    pub max_file_size: u64,
    /// Per-transfer timeout for a single chunk or single-shot upload.
    pub chunk_timeout_secs: u64,
    pub quota_timeout_secs: u64,
    /// Persisted sessions kept before the least recently active is evicted.
    pub max_sessions: usize,
    /// Terminal uploads remembered for status queries and `retry`.
    pub finished_history: usize,
    /// Lowercase extensions (without dot) that are never accepted.
    pub blocked_extensions: Vec<String>,
    /// MIME allow-list; `None` accepts every type. Entries may end in `/*`.
    pub allowed_mime_types: Option<Vec<String>>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            chunk_threshold: 8 * MIB,
            chunk_size: chunkwise_transfer::DEFAULT_CHUNK_SIZE,
            parallel_chunks: 3,
            max_concurrent_uploads: 3,
            max_retries: 3,
            retry_delays_ms: vec![1000, 2000, 5000],
            session_expiry_secs: 24 * 60 * 60,
            max_file_size: 5 * GIB,
            chunk_timeout_secs: 120,
            quota_timeout_secs: 10,
            max_sessions: chunkwise_transfer::store::DEFAULT_SESSION_CAPACITY,
            finished_history: 128,
            blocked_extensions: default_blocked_extensions(),
            allowed_mime_types: None,
        }
    }
}

fn default_blocked_extensions() -> Vec<String> {
    [
        "exe", "bat", "cmd", "com", "scr", "msi", "dll", "ps1", "vbs", "sh", "jar", "app",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

impl EngineConfig {
    /// Loads a configuration file, falling back to defaults if it is missing.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Writes the configuration as pretty JSON.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Rejects values the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.into()));
        if self.chunk_size == 0 {
            return invalid("chunk_size must be positive");
        }
        if self.parallel_chunks == 0 {
            return invalid("parallel_chunks must be positive");
        }
        if self.max_concurrent_uploads == 0 {
            return invalid("max_concurrent_uploads must be positive");
        }
        if self.retry_delays_ms.is_empty() {
            return invalid("retry_delays_ms must not be empty");
        }
        if self.chunk_timeout_secs == 0 {
            return invalid("chunk_timeout_secs must be positive");
        }
        if self.session_expiry_secs == 0 || self.session_expiry_secs > MAX_SESSION_EXPIRY_SECS {
            return invalid("session_expiry_secs must be between 1 second and 10 years");
        }
        if self.max_sessions == 0 {
            return invalid("max_sessions must be positive");
        }
        Ok(())
    }

    /// Retry policy for chunks and single-shot uploads.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_retries,
            self.retry_delays_ms
                .iter()
                .copied()
                .map(Duration::from_millis)
                .collect(),
        )
    }

    pub fn session_ttl(&self) -> chrono::Duration {
        let secs = self.session_expiry_secs.min(MAX_SESSION_EXPIRY_SECS);
        chrono::Duration::seconds(secs as i64)
    }

    pub fn chunk_timeout(&self) -> Duration {
        Duration::from_secs(self.chunk_timeout_secs)
    }

    pub fn quota_timeout(&self) -> Duration {
        Duration::from_secs(self.quota_timeout_secs)
    }
}
