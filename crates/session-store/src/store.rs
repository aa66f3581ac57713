use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use imgup_hasher::ContentHash;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::backend::{FileBackend, StorageBackend};
use crate::{FORMAT_VERSION, SESSION_TTL, STORAGE_KEY, StoreError, UploadSession};

type SessionMap = BTreeMap<String, UploadSession>;

#[derive(Serialize)]
struct SessionFileRef<'a> {
    version: u64,
    sessions: &'a SessionMap,
}

#[derive(Deserialize)]
struct SessionFile {
    #[serde(default)]
    sessions: SessionMap,
}

/// Decodes the stored document, accepting the unversioned legacy layout
/// (a bare `id -> session` map).
fn decode(raw: &str) -> Result<SessionMap, StoreError> {
    let value: serde_json::Value = serde_json::from_str(raw)?;
    let version = value.get("version").map(serde_json::Value::as_u64);
    match version {
        None => Ok(serde_json::from_value(value)?),
        Some(Some(FORMAT_VERSION)) => Ok(serde_json::from_value::<SessionFile>(value)?.sessions),
        Some(Some(other)) => Err(StoreError::UnsupportedVersion(other)),
        Some(None) => Err(StoreError::Unavailable("session format version is not a number".into())),
    }
}

/// Persistent registry of resumable upload sessions.
///
/// Public operations never fail: persistence errors are logged and the
/// call degrades to a no-op or an empty result.
pub struct SessionStore {
    backend: Arc<dyn StorageBackend>,
    ttl: chrono::Duration,
    lock: Mutex<()>,
}

impl SessionStore {
    /// Creates a store over `backend` with the default [`SESSION_TTL`].
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self {
            backend,
            ttl: to_chrono(SESSION_TTL),
            lock: Mutex::new(()),
        }
    }

    /// Creates a store persisting to JSON files under `dir`.
    pub fn open(dir: impl Into<PathBuf>) -> Self {
        Self::new(Arc::new(FileBackend::new(dir)))
    }

    /// Overrides the session time-to-live.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = to_chrono(ttl);
        self
    }

    /// Session time-to-live.
    pub fn ttl(&self) -> Duration {
        self.ttl.to_std().unwrap_or(Duration::ZERO)
    }

    // -----------------------------------------------------------------------
    // Operations
    // -----------------------------------------------------------------------

    /// Inserts or replaces `session`, stamping `last_activity` with now.
    ///
    /// Returns the stored record. If a session with the same id exists with a
    /// different chunk plan, its acknowledgments are discarded.
    pub fn save(&self, session: &UploadSession) -> Option<UploadSession> {
        self.run("save", |map, now| {
            let mut session = session.clone();
            if let Some(existing) = map.get(&session.id)
                && (existing.chunk_size != session.chunk_size
                    || existing.total_chunks != session.total_chunks)
            {
                warn!(
                    id = %session.id,
                    old_chunk_size = existing.chunk_size,
                    new_chunk_size = session.chunk_size,
                    "chunk plan changed, discarding acknowledged chunks"
                );
                session.uploaded_chunks.clear();
            }
            let dropped = session.retain_valid_chunks();
            if dropped > 0 {
                warn!(id = %session.id, dropped, "ignoring out-of-range chunk indices");
            }
            touch(&mut session, now);
            map.insert(session.id.clone(), session.clone());
            (Some(session), true)
        })
    }

    /// Returns the session, or `None` if it is absent or expired.
    ///
    /// Sweeps every expired session as a side effect.
    pub fn get(&self, id: &str) -> Option<UploadSession> {
        self.run("get", |map, now| {
            let swept = sweep(map, now, self.ttl);
            (map.get(id).cloned(), swept > 0)
        })
    }

    /// Merges `chunks` into the acknowledged set.
    ///
    /// Indices outside the chunk plan are ignored. Returns the updated session.
    pub fn update_progress(&self, id: &str, chunks: &[u64]) -> Option<UploadSession> {
        self.run("update_progress", |map, now| {
            let expired = remove_if_expired(map, id, now, self.ttl);
            let Some(session) = map.get_mut(id) else {
                return (None, expired);
            };
            let total = session.total_chunks;
            let (valid, invalid): (Vec<u64>, Vec<u64>) = chunks.iter().partition(|&&i| i < total);
            if !invalid.is_empty() {
                warn!(id, ?invalid, total, "ignoring out-of-range chunk indices");
            }
            session.uploaded_chunks.extend(valid);
            touch(session, now);
            (Some(session.clone()), true)
        })
    }

    /// Records one acknowledged chunk. Adding a known index changes nothing
    /// but the activity timestamp.
    pub fn add_chunk(&self, id: &str, index: u64) -> Option<UploadSession> {
        self.run("add_chunk", |map, now| {
            let expired = remove_if_expired(map, id, now, self.ttl);
            let Some(session) = map.get_mut(id) else {
                return (None, expired);
            };
            if index >= session.total_chunks {
                warn!(id, index, total = session.total_chunks, "chunk index out of range");
                return (Some(session.clone()), false);
            }
            session.uploaded_chunks.insert(index);
            touch(session, now);
            (Some(session.clone()), true)
        })
    }

    /// Deletes a session after completion or cancellation.
    pub fn remove(&self, id: &str) -> bool {
        self.run("remove", |map, _| {
            let removed = map.remove(id).is_some();
            (removed, removed)
        })
    }

    /// Finds a live session for the same content: equal digest and size.
    ///
    /// When several match, the most recently active one wins.
    pub fn find_by_content(&self, digest: &ContentHash, size: u64) -> Option<UploadSession> {
        self.run("find_by_content", |map, now| {
            let found = map
                .values()
                .filter(|s| !s.is_expired(now, self.ttl) && s.matches_content(digest, size))
                .max_by_key(|s| s.last_activity)
                .cloned();
            (found, false)
        })
    }

    /// Live sessions with chunks left to upload, most recently active first.
    pub fn list_resumable(&self) -> Vec<UploadSession> {
        self.run("list_resumable", |map, now| {
            let swept = sweep(map, now, self.ttl);
            let mut sessions: Vec<UploadSession> =
                map.values().filter(|s| !s.is_complete()).cloned().collect();
            sessions.sort_by(|a, b| b.last_activity.cmp(&a.last_activity));
            (sessions, swept > 0)
        })
    }

    /// Every live session, most recently active first.
    pub fn list_all(&self) -> Vec<UploadSession> {
        self.run("list_all", |map, now| {
            let mut sessions: Vec<UploadSession> = map
                .values()
                .filter(|s| !s.is_expired(now, self.ttl))
                .cloned()
                .collect();
            sessions.sort_by(|a, b| b.last_activity.cmp(&a.last_activity));
            (sessions, false)
        })
    }

    /// Deletes every expired session. Returns how many were removed.
    pub fn sweep_expired(&self) -> usize {
        self.run("sweep_expired", |map, now| {
            let swept = sweep(map, now, self.ttl);
            (swept, swept > 0)
        })
    }

    /// Deletes all sessions unconditionally.
    pub fn clear_all(&self) {
        let _guard = self.guard();
        if let Err(e) = self.backend.remove(STORAGE_KEY) {
            warn!(error = %e, "failed to clear upload sessions");
            return;
        }
        debug!("all upload sessions cleared");
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn guard(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs one read-modify-write. `op` returns its value and whether the map
    /// changed; failures are logged and yield `T::default()`.
    fn run<T: Default>(
        &self,
        name: &'static str,
        op: impl FnOnce(&mut SessionMap, DateTime<Utc>) -> (T, bool),
    ) -> T {
        let _guard = self.guard();
        match self.modify(op) {
            Ok(value) => value,
            Err(e) => {
                warn!(op = name, error = %e, "session store operation failed");
                T::default()
            }
        }
    }

    fn modify<T>(
        &self,
        op: impl FnOnce(&mut SessionMap, DateTime<Utc>) -> (T, bool),
    ) -> Result<T, StoreError> {
        let mut map = self.load()?;
        let (value, changed) = op(&mut map, Utc::now());
        if changed {
            self.persist(&map)?;
        }
        Ok(value)
    }

    /// Reads the session map. Undecodable JSON is treated as empty so the
    /// next write replaces it; an unknown format version is an error.
    fn load(&self) -> Result<SessionMap, StoreError> {
        let Some(raw) = self.backend.read(STORAGE_KEY)? else {
            return Ok(SessionMap::new());
        };
        match decode(&raw) {
            Ok(map) => Ok(map),
            Err(StoreError::Json(e)) => {
                warn!(error = %e, "stored upload sessions are corrupt, starting fresh");
                Ok(SessionMap::new())
            }
            Err(e) => Err(e),
        }
    }

    fn persist(&self, map: &SessionMap) -> Result<(), StoreError> {
        if map.is_empty() {
            return self.backend.remove(STORAGE_KEY);
        }
        let doc = SessionFileRef {
            version: FORMAT_VERSION,
            sessions: map,
        };
        let json = serde_json::to_string(&doc)?;
        self.backend.write(STORAGE_KEY, &json)
    }
}

/// Deletes session `id` if it has expired. Returns whether it was deleted.
fn remove_if_expired(
    map: &mut SessionMap,
    id: &str,
    now: DateTime<Utc>,
    ttl: chrono::Duration,
) -> bool {
    let expired = map.get(id).is_some_and(|s| s.is_expired(now, ttl));
    if expired {
        debug!(id, "session expired on access");
        map.remove(id);
    }
    expired
}

fn sweep(map: &mut SessionMap, now: DateTime<Utc>, ttl: chrono::Duration) -> usize {
    let before = map.len();
    map.retain(|_, s| !s.is_expired(now, ttl));
    let swept = before - map.len();
    if swept > 0 {
        debug!(swept, "expired upload sessions removed");
    }
    swept
}

/// Refreshes `last_activity`, keeping it at or after `created_at`.
fn touch(session: &mut UploadSession, now: DateTime<Utc>) {
    session.last_activity = now.max(session.created_at);
}

fn to_chrono(ttl: Duration) -> chrono::Duration {
    chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryBackend;
    use crate::session::tests::sample_session;
    use imgup_hasher::digest_bytes;

    const MIB: u64 = 1024 * 1024;

    fn memory_store() -> (Arc<MemoryBackend>, SessionStore) {
        let backend = Arc::new(MemoryBackend::new());
        let store = SessionStore::new(backend.clone());
        (backend, store)
    }

    fn expired(mut session: UploadSession) -> UploadSession {
        session.created_at = Utc::now() - chrono::Duration::hours(25);
        session.last_activity = session.created_at;
        session
    }

    /// Backend whose every call fails, like a disabled or full storage area.
    struct BrokenBackend;

    impl StorageBackend for BrokenBackend {
        fn read(&self, _key: &str) -> Result<Option<String>, StoreError> {
            Err(StoreError::Unavailable("storage disabled".into()))
        }
        fn write(&self, _key: &str, _value: &str) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("quota exceeded".into()))
        }
        fn remove(&self, _key: &str) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("storage disabled".into()))
        }
    }

    #[test]
    fn save_and_get() {
        let (_backend, store) = memory_store();
        let session = sample_session(b"cat", 10 * MIB, 4 * MIB);
        let saved = store.save(&session).unwrap();
        assert!(saved.last_activity >= session.last_activity);

        let loaded = store.get(&session.id).unwrap();
        assert_eq!(loaded.id, session.id);
        assert_eq!(loaded.total_chunks, 3);
        assert!(loaded.last_activity >= loaded.created_at);
    }

    #[test]
    fn get_missing_returns_none() {
        let (_backend, store) = memory_store();
        assert!(store.get("nope").is_none());
    }

    #[test]
    fn save_is_last_writer_wins() {
        let (_backend, store) = memory_store();
        let mut session = sample_session(b"cat", 10, 4);
        store.save(&session);
        session.file_name = "dog.png".into();
        store.save(&session);

        assert_eq!(store.list_all().len(), 1);
        assert_eq!(store.get(&session.id).unwrap().file_name, "dog.png");
    }

    #[test]
    fn save_with_changed_chunk_plan_resets_acknowledgments() {
        let (_backend, store) = memory_store();
        let mut session = sample_session(b"cat", 10, 4);
        store.save(&session);
        store.add_chunk(&session.id, 0);

        session.uploaded_chunks.insert(0);
        session.chunk_size = 2;
        session.total_chunks = 5;
        let saved = store.save(&session).unwrap();
        assert!(saved.uploaded_chunks.is_empty());
    }

    #[test]
    fn add_chunk_is_idempotent_and_sorted() {
        let (_backend, store) = memory_store();
        let session = sample_session(b"cat", 10, 2);
        store.save(&session);

        store.add_chunk(&session.id, 3);
        store.add_chunk(&session.id, 1);
        let once = store.add_chunk(&session.id, 3).unwrap();
        let chunks: Vec<u64> = once.uploaded_chunks.iter().copied().collect();
        assert_eq!(chunks, vec![1, 3]);

        let again = store.add_chunk(&session.id, 3).unwrap();
        assert_eq!(again.uploaded_chunks, once.uploaded_chunks);
    }

    #[test]
    fn add_chunk_rejects_out_of_range() {
        let (_backend, store) = memory_store();
        let session = sample_session(b"cat", 10, 4);
        store.save(&session);

        let after = store.add_chunk(&session.id, 3).unwrap();
        assert!(after.uploaded_chunks.is_empty());
        assert!(store.add_chunk("missing", 0).is_none());
    }

    #[test]
    fn update_progress_merges_valid_indices() {
        let (_backend, store) = memory_store();
        let session = sample_session(b"cat", 10, 2);
        store.save(&session);

        store.update_progress(&session.id, &[0, 2]);
        let updated = store.update_progress(&session.id, &[4, 2, 9]).unwrap();
        let chunks: Vec<u64> = updated.uploaded_chunks.iter().copied().collect();
        assert_eq!(chunks, vec![0, 2, 4]);
    }

    #[test]
    fn expired_session_is_unreachable_and_deleted() {
        let (backend, store) = memory_store();
        let session = expired(sample_session(b"old", 10, 4));
        store.save(&session);
        assert!(backend.read(STORAGE_KEY).unwrap().is_some());

        assert!(store.get(&session.id).is_none());
        assert!(store.list_resumable().is_empty());
        assert!(backend.read(STORAGE_KEY).unwrap().is_none());
    }

    fn persisted_ids(backend: &MemoryBackend) -> Vec<String> {
        let Some(raw) = backend.read(STORAGE_KEY).unwrap() else {
            return Vec::new();
        };
        decode(&raw).unwrap().into_keys().collect()
    }

    #[test]
    fn get_sweeps_other_expired_sessions() {
        let (backend, store) = memory_store();
        let fresh = sample_session(b"new", 10, 4);
        let stale = expired(sample_session(b"old", 10, 4));
        store.save(&fresh);
        store.save(&stale);
        assert_eq!(persisted_ids(&backend).len(), 2);

        assert!(store.get(&fresh.id).is_some());
        assert_eq!(persisted_ids(&backend), vec![fresh.id.clone()]);
    }

    #[test]
    fn add_chunk_on_expired_session_persists_deletion() {
        let (backend, store) = memory_store();
        let fresh = sample_session(b"new", 10, 4);
        let stale = expired(sample_session(b"old", 10, 4));
        store.save(&fresh);
        store.save(&stale);

        assert!(store.add_chunk(&stale.id, 0).is_none());
        assert_eq!(persisted_ids(&backend), vec![fresh.id.clone()]);
    }

    #[test]
    fn update_progress_on_expired_session_persists_deletion() {
        let (backend, store) = memory_store();
        let fresh = sample_session(b"new", 10, 4);
        let stale = expired(sample_session(b"old", 10, 4));
        store.save(&fresh);
        store.save(&stale);

        assert!(store.update_progress(&stale.id, &[0, 1]).is_none());
        assert_eq!(persisted_ids(&backend), vec![fresh.id.clone()]);
    }

    #[test]
    fn expiry_follows_creation_not_activity() {
        let (_backend, store) = memory_store();
        let session = expired(sample_session(b"old", 10, 4));
        // Saving refreshes last_activity but the session is still too old.
        store.save(&session);
        assert!(store.add_chunk(&session.id, 0).is_none());
    }

    #[test]
    fn custom_ttl_applies() {
        let backend = Arc::new(MemoryBackend::new());
        let store = SessionStore::new(backend).with_ttl(Duration::from_secs(60));
        assert_eq!(store.ttl(), Duration::from_secs(60));

        let mut session = sample_session(b"cat", 10, 4);
        session.created_at = Utc::now() - chrono::Duration::minutes(2);
        store.save(&session);
        assert!(store.get(&session.id).is_none());
    }

    #[test]
    fn sweep_expired_removes_only_stale_sessions() {
        let (_backend, store) = memory_store();
        let fresh = sample_session(b"new", 10, 4);
        store.save(&fresh);
        store.save(&expired(sample_session(b"old-1", 10, 4)));
        store.save(&expired(sample_session(b"old-2", 10, 4)));

        assert_eq!(store.sweep_expired(), 2);
        assert_eq!(store.sweep_expired(), 0);
        assert_eq!(store.list_all().len(), 1);
        assert!(store.get(&fresh.id).is_some());
    }

    #[test]
    fn find_by_content_matches_digest_and_size() {
        let (_backend, store) = memory_store();
        let session = sample_session(b"cat", 10, 4);
        store.save(&session);

        let found = store.find_by_content(&digest_bytes(b"cat"), 10).unwrap();
        assert_eq!(found.id, session.id);
        assert!(store.find_by_content(&digest_bytes(b"dog"), 10).is_none());
        assert!(store.find_by_content(&digest_bytes(b"cat"), 11).is_none());
    }

    #[test]
    fn find_by_content_skips_expired() {
        let (_backend, store) = memory_store();
        store.save(&expired(sample_session(b"cat", 10, 4)));
        assert!(store.find_by_content(&digest_bytes(b"cat"), 10).is_none());
    }

    #[test]
    fn list_resumable_excludes_complete_and_orders_by_activity() {
        let (_backend, store) = memory_store();
        let first = sample_session(b"a", 10, 4);
        let second = sample_session(b"b", 10, 4);
        let done = sample_session(b"c", 4, 4);
        store.save(&first);
        store.save(&second);
        store.save(&done);
        store.add_chunk(&done.id, 0);
        std::thread::sleep(std::time::Duration::from_millis(5));
        store.add_chunk(&first.id, 1);

        let ids: Vec<String> = store.list_resumable().into_iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![first.id.clone(), second.id.clone()]);
    }

    #[test]
    fn remove_and_clear_all() {
        let (backend, store) = memory_store();
        let a = sample_session(b"a", 10, 4);
        let b = sample_session(b"b", 10, 4);
        store.save(&a);
        store.save(&b);

        assert!(store.remove(&a.id));
        assert!(!store.remove(&a.id));
        assert!(store.get(&b.id).is_some());

        store.clear_all();
        assert!(store.list_all().is_empty());
        assert!(backend.read(STORAGE_KEY).unwrap().is_none());
    }

    #[test]
    fn persisted_document_is_versioned() {
        let (backend, store) = memory_store();
        let session = sample_session(b"cat", 10, 4);
        store.save(&session);

        let raw = backend.read(STORAGE_KEY).unwrap().unwrap();
        let doc: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(doc["version"], FORMAT_VERSION);
        assert_eq!(doc["sessions"][&session.id]["fileSize"], 10);
    }

    #[test]
    fn legacy_unversioned_map_is_read_and_upgraded() {
        let (backend, store) = memory_store();
        let session = sample_session(b"cat", 10, 4);
        let mut legacy = SessionMap::new();
        legacy.insert(session.id.clone(), session.clone());
        backend
            .write(STORAGE_KEY, &serde_json::to_string(&legacy).unwrap())
            .unwrap();

        assert_eq!(store.get(&session.id).unwrap().id, session.id);

        store.add_chunk(&session.id, 0);
        let raw = backend.read(STORAGE_KEY).unwrap().unwrap();
        let doc: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(doc["version"], FORMAT_VERSION);
    }

    #[test]
    fn unknown_version_is_left_untouched() {
        let (backend, store) = memory_store();
        let future = r#"{"version":99,"sessions":{}}"#;
        backend.write(STORAGE_KEY, future).unwrap();

        assert!(store.list_all().is_empty());
        assert!(store.save(&sample_session(b"cat", 10, 4)).is_none());
        assert_eq!(backend.read(STORAGE_KEY).unwrap().unwrap(), future);
    }

    #[test]
    fn corrupt_json_is_replaced_on_next_write() {
        let (backend, store) = memory_store();
        backend.write(STORAGE_KEY, "{not json").unwrap();

        assert!(store.list_resumable().is_empty());
        let session = sample_session(b"cat", 10, 4);
        assert!(store.save(&session).is_some());
        assert!(store.get(&session.id).is_some());
    }

    #[test]
    fn broken_backend_degrades_to_no_ops() {
        let store = SessionStore::new(Arc::new(BrokenBackend));
        let session = sample_session(b"cat", 10, 4);

        assert!(store.save(&session).is_none());
        assert!(store.get(&session.id).is_none());
        assert!(store.add_chunk(&session.id, 0).is_none());
        assert!(store.update_progress(&session.id, &[0]).is_none());
        assert!(store.find_by_content(&session.file_digest, 10).is_none());
        assert!(store.list_resumable().is_empty());
        assert_eq!(store.sweep_expired(), 0);
        assert!(!store.remove(&session.id));
        store.clear_all();
    }

    #[test]
    fn file_store_persists_across_instances() {
        let tmp = tempfile::tempdir().unwrap();
        let session = sample_session(b"cat", 10, 4);
        {
            let store = SessionStore::open(tmp.path());
            store.save(&session);
            store.add_chunk(&session.id, 1);
        }

        let reopened = SessionStore::open(tmp.path());
        let loaded = reopened.get(&session.id).unwrap();
        assert!(loaded.uploaded_chunks.contains(&1));
        assert_eq!(
            reopened.find_by_content(&digest_bytes(b"cat"), 10).unwrap().id,
            session.id
        );
    }
}
