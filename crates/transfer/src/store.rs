//! Persistence of resumable upload sessions.
//!
//! Only [`UploadSession`] records are stored; chunk payloads never are.
//! Both stores hold at most `capacity` sessions: when a new session would
//! exceed it, expired sessions are purged first, then the least recently
//! active one is evicted.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::TransferError;
use crate::clock::Clock;
use crate::session::UploadSession;
use crate::sync::{read, write};

/// Default maximum number of persisted sessions.
pub const DEFAULT_SESSION_CAPACITY: usize = 64;

/// Result of looking a session up without expiry filtering.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionLookup {
    Found(UploadSession),
    Expired(UploadSession),
    Missing,
}

/// Key-value persistence for [`UploadSession`] records, keyed by session id.
pub trait SessionStore: Send + Sync {
    /// Inserts or replaces a session.
    fn save(&self, session: &UploadSession) -> Result<(), TransferError>;

    /// Looks a session up, reporting expired records instead of hiding them.
    fn lookup(&self, session_id: &str) -> Result<SessionLookup, TransferError>;

    /// Deletes a session. Deleting an unknown id is not an error.
    fn remove(&self, session_id: &str) -> Result<(), TransferError>;

    /// Returns ids of all unexpired sessions, most recently active first.
    fn list_resumable(&self) -> Result<Vec<String>, TransferError>;

    /// Deletes every expired session and returns how many were removed.
    fn purge_expired(&self) -> Result<usize, TransferError>;

    /// Returns an unexpired session. Expired records are deleted and
    /// reported as not found.
    fn load(&self, session_id: &str) -> Result<Option<UploadSession>, TransferError> {
        match self.lookup(session_id)? {
            SessionLookup::Found(session) => Ok(Some(session)),
            SessionLookup::Expired(_) => {
                debug!(session_id, "dropping expired session");
                self.remove(session_id)?;
                Ok(None)
            }
            SessionLookup::Missing => Ok(None),
        }
    }
}

// ---------------------------------------------------------------------------
// Shared bookkeeping
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct SessionMap {
    sessions: BTreeMap<String, UploadSession>,
    capacity: usize,
}

impl SessionMap {
    fn new(sessions: BTreeMap<String, UploadSession>, capacity: usize) -> Self {
        Self {
            sessions,
            capacity: capacity.max(1),
        }
    }

    fn insert(&mut self, session: &UploadSession, now: DateTime<Utc>) {
        if !self.sessions.contains_key(&session.session_id) {
            if self.sessions.len() >= self.capacity {
                self.purge_expired(now);
            }
            while self.sessions.len() >= self.capacity {
                let Some(oldest) = self
                    .sessions
                    .values()
                    .min_by_key(|s| s.last_activity)
                    .map(|s| s.session_id.clone())
                else {
                    break;
                };
                warn!(
                    session_id = %oldest,
                    capacity = self.capacity,
                    "session store full, evicting least recently active session"
                );
                self.sessions.remove(&oldest);
            }
        }
        self.sessions
            .insert(session.session_id.clone(), session.clone());
    }

    fn lookup(&self, session_id: &str, now: DateTime<Utc>) -> SessionLookup {
        match self.sessions.get(session_id) {
            Some(s) if s.is_expired(now) => SessionLookup::Expired(s.clone()),
            Some(s) => SessionLookup::Found(s.clone()),
            None => SessionLookup::Missing,
        }
    }

    fn remove(&mut self, session_id: &str) -> bool {
        self.sessions.remove(session_id).is_some()
    }

    fn resumable(&self, now: DateTime<Utc>) -> Vec<String> {
        let mut live: Vec<&UploadSession> = self
            .sessions
            .values()
            .filter(|s| !s.is_expired(now))
            .collect();
        live.sort_by(|a, b| b.last_activity.cmp(&a.last_activity));
        live.into_iter().map(|s| s.session_id.clone()).collect()
    }

    fn purge_expired(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.sessions.len();
        self.sessions.retain(|_, s| !s.is_expired(now));
        before - self.sessions.len()
    }
}

// ---------------------------------------------------------------------------
// MemorySessionStore
// ---------------------------------------------------------------------------

/// In-process session store. Sessions do not survive a restart.
pub struct MemorySessionStore {
    inner: RwLock<SessionMap>,
    clock: Arc<dyn Clock>,
}

impl MemorySessionStore {
    pub fn new(capacity: usize, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: RwLock::new(SessionMap::new(BTreeMap::new(), capacity)),
            clock,
        }
    }

    /// Number of stored sessions, expired ones included.
    pub fn len(&self) -> usize {
        read(&self.inner).sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SessionStore for MemorySessionStore {
    fn save(&self, session: &UploadSession) -> Result<(), TransferError> {
        write(&self.inner).insert(session, self.clock.now());
        Ok(())
    }

    fn lookup(&self, session_id: &str) -> Result<SessionLookup, TransferError> {
        Ok(read(&self.inner).lookup(session_id, self.clock.now()))
    }

    fn remove(&self, session_id: &str) -> Result<(), TransferError> {
        write(&self.inner).remove(session_id);
        Ok(())
    }

    fn list_resumable(&self) -> Result<Vec<String>, TransferError> {
        Ok(read(&self.inner).resumable(self.clock.now()))
    }

    fn purge_expired(&self) -> Result<usize, TransferError> {
        Ok(write(&self.inner).purge_expired(self.clock.now()))
    }
}

// ---------------------------------------------------------------------------
// FileSessionStore
// ---------------------------------------------------------------------------

/// Session store persisted to a JSON file.
///
/// Sessions are cached in memory and the whole file is rewritten after every
/// mutation, under the store's write lock, so concurrent saves never
/// interleave on disk. Writes are blocking `std::fs` calls; async callers
/// run them on the blocking pool.
pub struct FileSessionStore {
    path: PathBuf,
    inner: RwLock<SessionMap>,
    clock: Arc<dyn Clock>,
}

impl FileSessionStore {
    /// Opens the store, loading existing sessions from `path` if present.
    pub fn open(
        path: PathBuf,
        capacity: usize,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, TransferError> {
        let sessions = load_sessions(&path)?;
        Ok(Self {
            path,
            inner: RwLock::new(SessionMap::new(sessions, capacity)),
            clock,
        })
    }

    /// Returns the backing file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes the current sessions to disk via a temp file + rename.
    fn persist(&self, map: &SessionMap) -> Result<(), TransferError> {
        let json = serde_json::to_string_pretty(&map.sessions)?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.path)?;
        debug!("persisted {} session(s) to {:?}", map.sessions.len(), self.path);
        Ok(())
    }
}

impl SessionStore for FileSessionStore {
    fn save(&self, session: &UploadSession) -> Result<(), TransferError> {
        let mut map = write(&self.inner);
        map.insert(session, self.clock.now());
        self.persist(&map)
    }

    fn lookup(&self, session_id: &str) -> Result<SessionLookup, TransferError> {
        Ok(read(&self.inner).lookup(session_id, self.clock.now()))
    }

    fn remove(&self, session_id: &str) -> Result<(), TransferError> {
        let mut map = write(&self.inner);
        if map.remove(session_id) {
            self.persist(&map)?;
        }
        Ok(())
    }

    fn list_resumable(&self) -> Result<Vec<String>, TransferError> {
        Ok(read(&self.inner).resumable(self.clock.now()))
    }

    fn purge_expired(&self) -> Result<usize, TransferError> {
        let mut map = write(&self.inner);
        let purged = map.purge_expired(self.clock.now());
        if purged > 0 {
            self.persist(&map)?;
        }
        Ok(purged)
    }
}

/// Loads sessions from a JSON file on disk.
fn load_sessions(path: &Path) -> Result<BTreeMap<String, UploadSession>, TransferError> {
    if !path.exists() {
        return Ok(BTreeMap::new());
    }
    let data = std::fs::read_to_string(path)?;
    let sessions: BTreeMap<String, UploadSession> = serde_json::from_str(&data)?;
    debug!("loaded {} session(s) from {:?}", sessions.len(), path);
    Ok(sessions)
}
