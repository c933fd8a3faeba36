//! Session and lock registry.
//!
//! Tracks every live session, enforces library exclusion (one client per
//! library) and file exclusion (one uploader per path), and carries
//! per-upload transfer state so interrupted transfers can resume.
//!
//! All state sits behind a single guard; methods are short critical
//! sections with no I/O inside. When a method touches both lock tables it
//! always orders them library lock first, file locks second.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::Notify;

use harbor_core::REAPER_INTERVAL_SECS;
use harbor_core::error::{Error, Result};

/// State of one in-flight upload
#[derive(Debug, Clone)]
pub struct TransferState {
    /// Absolute target path
    pub path: PathBuf,
    /// Total bytes the client advertised
    pub expected_size: u64,
    /// Whole-file digest the client advertised
    pub expected_checksum: String,
    /// Bytes acknowledged so far; never exceeds `expected_size`
    pub bytes_received: u64,
    /// Chunk size the client is sending
    pub chunk_size: u64,
    /// Last chunk activity
    pub last_activity: Instant,
}

struct Session {
    client_id: String,
    library_id: String,
    #[allow(dead_code)]
    connected_at: Instant,
    last_activity: Instant,
    transfers: HashMap<PathBuf, TransferState>,
    held_locks: HashSet<PathBuf>,
    shutdown: Arc<Notify>,
}

/// Handle returned to a connection when its session is created
#[derive(Clone, Debug)]
pub struct SessionHandle {
    /// Session identifier, also the wire-visible session id
    pub session_id: String,
    /// Notified when the reaper or a server shutdown closes the session
    pub shutdown: Arc<Notify>,
}

struct Inner {
    sessions: HashMap<String, Session>,
    library_locks: HashMap<String, String>,
    file_locks: HashMap<PathBuf, String>,
}

/// Shared session, lock, and transfer bookkeeping
pub struct Registry {
    inner: Mutex<Inner>,
    idle_timeouts: HashMap<String, u64>,
}

impl Registry {
    /// Create a registry.
    ///
    /// `idle_timeouts` maps library id to its idle timeout in seconds;
    /// the reaper consults it on every scan.
    #[must_use]
    pub fn new(idle_timeouts: HashMap<String, u64>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                sessions: HashMap::new(),
                library_locks: HashMap::new(),
                file_locks: HashMap::new(),
            }),
            idle_timeouts,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("registry guard poisoned")
    }

    /// Create a session for `client_id` on `library_id`.
    ///
    /// Installs the library lock; a library held by a *different* client
    /// rejects the handshake.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LibraryInUse`] when another client holds the
    /// library.
    pub fn create_session(&self, client_id: &str, library_id: &str) -> Result<SessionHandle> {
        let session_id = hex::encode(rand::random::<[u8; 16]>());
        let shutdown = Arc::new(Notify::new());

        let mut inner = self.lock();
        if let Some(holder) = inner.library_locks.get(library_id) {
            if holder != client_id {
                return Err(Error::LibraryInUse(library_id.to_string()));
            }
        }

        inner
            .library_locks
            .insert(library_id.to_string(), client_id.to_string());
        inner.sessions.insert(
            session_id.clone(),
            Session {
                client_id: client_id.to_string(),
                library_id: library_id.to_string(),
                connected_at: Instant::now(),
                last_activity: Instant::now(),
                transfers: HashMap::new(),
                held_locks: HashSet::new(),
                shutdown: Arc::clone(&shutdown),
            },
        );

        Ok(SessionHandle {
            session_id,
            shutdown,
        })
    }

    /// Refresh a session's activity timestamp.
    ///
    /// Returns false when the session no longer exists, which a handler
    /// must treat as terminal: the reaper got there first.
    pub fn touch(&self, session_id: &str) -> bool {
        match self.lock().sessions.get_mut(session_id) {
            Some(session) => {
                session.last_activity = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Close a session, releasing its library lock and every file lock.
    ///
    /// Transfer state evaporates with the session; shadow files stay on
    /// disk so the next `PUT_START` with `resume` can pick them up.
    pub fn close_session(&self, session_id: &str) {
        let notify = {
            let mut inner = self.lock();
            let Some(session) = inner.sessions.remove(session_id) else {
                return;
            };

            // Library lock first, then file locks. The lock outlives this
            // session only while a sibling session of the same client
            // still uses the library.
            let sibling_remains = inner.sessions.values().any(|other| {
                other.library_id == session.library_id && other.client_id == session.client_id
            });
            if !sibling_remains
                && inner
                    .library_locks
                    .get(&session.library_id)
                    .is_some_and(|holder| *holder == session.client_id)
            {
                inner.library_locks.remove(&session.library_id);
            }
            for path in &session.held_locks {
                if inner
                    .file_locks
                    .get(path)
                    .is_some_and(|owner| owner == session_id)
                {
                    inner.file_locks.remove(path);
                }
            }
            session.shutdown
        };
        notify.notify_waiters();
    }

    /// Acquire the upload lock for `path`.
    ///
    /// Re-acquisition by the owning session is a no-op success.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Locked`] when another session holds the path.
    pub fn lock_file(&self, session_id: &str, path: &Path) -> Result<()> {
        let mut inner = self.lock();
        if let Some(owner) = inner.file_locks.get(path) {
            if owner == session_id {
                return Ok(());
            }
            return Err(Error::Locked(path.display().to_string()));
        }

        inner
            .file_locks
            .insert(path.to_path_buf(), session_id.to_string());
        if let Some(session) = inner.sessions.get_mut(session_id) {
            session.held_locks.insert(path.to_path_buf());
        }
        Ok(())
    }

    /// Release the upload lock for `path` if this session holds it
    pub fn unlock_file(&self, session_id: &str, path: &Path) {
        let mut inner = self.lock();
        if inner
            .file_locks
            .get(path)
            .is_some_and(|owner| owner == session_id)
        {
            inner.file_locks.remove(path);
        }
        if let Some(session) = inner.sessions.get_mut(session_id) {
            session.held_locks.remove(path);
        }
    }

    /// Session currently holding the upload lock for `path`, if any
    #[must_use]
    pub fn file_lock_owner(&self, path: &Path) -> Option<String> {
        self.lock().file_locks.get(path).cloned()
    }

    /// Client currently holding the library lock, if any
    #[must_use]
    pub fn library_lock_holder(&self, library_id: &str) -> Option<String> {
        self.lock().library_locks.get(library_id).cloned()
    }

    /// Record a fresh or resumed upload
    pub fn start_transfer(
        &self,
        session_id: &str,
        path: &Path,
        expected_size: u64,
        expected_checksum: &str,
        chunk_size: u64,
        resume_offset: u64,
    ) {
        if let Some(session) = self.lock().sessions.get_mut(session_id) {
            session.transfers.insert(
                path.to_path_buf(),
                TransferState {
                    path: path.to_path_buf(),
                    expected_size,
                    expected_checksum: expected_checksum.to_string(),
                    bytes_received: resume_offset.min(expected_size),
                    chunk_size,
                    last_activity: Instant::now(),
                },
            );
            session.last_activity = Instant::now();
        }
    }

    /// Account one acknowledged chunk against a transfer
    pub fn record_progress(&self, session_id: &str, path: &Path, bytes: u64) {
        if let Some(session) = self.lock().sessions.get_mut(session_id) {
            if let Some(transfer) = session.transfers.get_mut(path) {
                transfer.bytes_received =
                    (transfer.bytes_received + bytes).min(transfer.expected_size);
                transfer.last_activity = Instant::now();
            }
            session.last_activity = Instant::now();
        }
    }

    /// Snapshot of the transfer state for `path`, if one is active
    #[must_use]
    pub fn transfer(&self, session_id: &str, path: &Path) -> Option<TransferState> {
        self.lock()
            .sessions
            .get(session_id)
            .and_then(|session| session.transfers.get(path).cloned())
    }

    /// Drop the transfer state for `path`
    pub fn complete_transfer(&self, session_id: &str, path: &Path) {
        if let Some(session) = self.lock().sessions.get_mut(session_id) {
            session.transfers.remove(path);
        }
    }

    /// Number of live sessions
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.lock().sessions.len()
    }

    /// Close every session whose idle age exceeds its library's timeout.
    ///
    /// Returns the closed session ids.
    pub fn reap_idle(&self) -> Vec<String> {
        let idle: Vec<String> = {
            let inner = self.lock();
            inner
                .sessions
                .iter()
                .filter(|(_, session)| {
                    let timeout = self
                        .idle_timeouts
                        .get(&session.library_id)
                        .copied()
                        .unwrap_or(harbor_core::DEFAULT_IDLE_TIMEOUT_SECS);
                    session.last_activity.elapsed() > Duration::from_secs(timeout)
                })
                .map(|(id, _)| id.clone())
                .collect()
        };

        for session_id in &idle {
            tracing::info!(session_id = %session_id, "reaping idle session");
            self.close_session(session_id);
        }
        idle
    }

    /// Notify every session that the server is shutting down
    pub fn shutdown_all(&self) {
        let handles: Vec<Arc<Notify>> = self
            .lock()
            .sessions
            .values()
            .map(|session| Arc::clone(&session.shutdown))
            .collect();
        for handle in handles {
            handle.notify_waiters();
        }
    }

    /// Background task scanning for idle sessions every
    /// [`REAPER_INTERVAL_SECS`]
    pub fn spawn_reaper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick =
                tokio::time::interval(Duration::from_secs(REAPER_INTERVAL_SECS));
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            tick.tick().await; // immediate first tick carries no information
            loop {
                tick.tick().await;
                let reaped = registry.reap_idle();
                if !reaped.is_empty() {
                    tracing::info!(count = reaped.len(), "idle sessions closed");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry_with(library_id: &str, idle_timeout_s: u64) -> Registry {
        Registry::new(HashMap::from([(library_id.to_string(), idle_timeout_s)]))
    }

    #[test]
    fn test_library_exclusion() {
        let registry = registry_with("lib-1", 300);

        let a = registry.create_session("client-a", "lib-1").unwrap();
        assert_eq!(
            registry.library_lock_holder("lib-1").as_deref(),
            Some("client-a")
        );

        // A different client is shut out.
        let err = registry.create_session("client-b", "lib-1").unwrap_err();
        assert!(matches!(err, Error::LibraryInUse(_)));

        // The same client may open another session.
        let a2 = registry.create_session("client-a", "lib-1").unwrap();

        // The lock survives until the client's last session closes.
        registry.close_session(&a.session_id);
        assert_eq!(
            registry.library_lock_holder("lib-1").as_deref(),
            Some("client-a")
        );
        registry.close_session(&a2.session_id);
        assert!(registry.library_lock_holder("lib-1").is_none());

        assert!(registry.create_session("client-b", "lib-1").is_ok());
    }

    #[test]
    fn test_file_lock_exclusion_and_reacquisition() {
        let registry = registry_with("lib-1", 300);
        let a = registry.create_session("client-a", "lib-1").unwrap();
        let path = PathBuf::from("/srv/lib/data.bin");

        registry.lock_file(&a.session_id, &path).unwrap();
        // Same session: idempotent.
        registry.lock_file(&a.session_id, &path).unwrap();

        let err = registry.lock_file("other-session", &path).unwrap_err();
        assert!(matches!(err, Error::Locked(_)));

        registry.unlock_file(&a.session_id, &path);
        assert!(registry.file_lock_owner(&path).is_none());
        assert!(registry.lock_file("other-session", &path).is_ok());
    }

    #[test]
    fn test_unlock_by_non_owner_is_a_noop() {
        let registry = registry_with("lib-1", 300);
        let a = registry.create_session("client-a", "lib-1").unwrap();
        let path = PathBuf::from("/srv/lib/keep.bin");

        registry.lock_file(&a.session_id, &path).unwrap();
        registry.unlock_file("stranger", &path);
        assert_eq!(registry.file_lock_owner(&path), Some(a.session_id.clone()));
    }

    #[test]
    fn test_close_session_releases_everything() {
        let registry = registry_with("lib-1", 300);
        let a = registry.create_session("client-a", "lib-1").unwrap();
        let p1 = PathBuf::from("/srv/lib/one.bin");
        let p2 = PathBuf::from("/srv/lib/two.bin");

        registry.lock_file(&a.session_id, &p1).unwrap();
        registry.lock_file(&a.session_id, &p2).unwrap();
        registry.start_transfer(&a.session_id, &p1, 100, "00", 10, 0);

        registry.close_session(&a.session_id);

        assert_eq!(registry.session_count(), 0);
        assert!(registry.file_lock_owner(&p1).is_none());
        assert!(registry.file_lock_owner(&p2).is_none());
        assert!(registry.library_lock_holder("lib-1").is_none());
    }

    #[test]
    fn test_transfer_progress_clamps_to_expected_size() {
        let registry = registry_with("lib-1", 300);
        let a = registry.create_session("client-a", "lib-1").unwrap();
        let path = PathBuf::from("/srv/lib/clamp.bin");

        registry.start_transfer(&a.session_id, &path, 1000, "aa", 400, 0);
        registry.record_progress(&a.session_id, &path, 400);
        registry.record_progress(&a.session_id, &path, 400);
        registry.record_progress(&a.session_id, &path, 400);

        let state = registry.transfer(&a.session_id, &path).unwrap();
        assert_eq!(state.bytes_received, 1000);

        registry.complete_transfer(&a.session_id, &path);
        assert!(registry.transfer(&a.session_id, &path).is_none());
    }

    #[test]
    fn test_resume_offset_seeds_progress() {
        let registry = registry_with("lib-1", 300);
        let a = registry.create_session("client-a", "lib-1").unwrap();
        let path = PathBuf::from("/srv/lib/resume.bin");

        registry.start_transfer(&a.session_id, &path, 8_000_000, "bb", 2_000_000, 4_000_000);
        let state = registry.transfer(&a.session_id, &path).unwrap();
        assert_eq!(state.bytes_received, 4_000_000);
    }

    #[test]
    fn test_reap_idle_respects_per_library_timeout() {
        // Timeout of zero: anything not touched "now" is idle.
        let registry = registry_with("lib-1", 0);
        let a = registry.create_session("client-a", "lib-1").unwrap();

        std::thread::sleep(Duration::from_millis(20));
        let reaped = registry.reap_idle();
        assert_eq!(reaped, vec![a.session_id.clone()]);
        assert_eq!(registry.session_count(), 0);
        assert!(registry.library_lock_holder("lib-1").is_none());
    }

    #[test]
    fn test_touch_defers_reaping() {
        let registry = registry_with("lib-1", 1);
        let a = registry.create_session("client-a", "lib-1").unwrap();

        std::thread::sleep(Duration::from_millis(50));
        assert!(registry.touch(&a.session_id));
        assert!(registry.reap_idle().is_empty());
    }

    #[test]
    fn test_touch_after_close_reports_dead_session() {
        let registry = registry_with("lib-1", 300);
        let a = registry.create_session("client-a", "lib-1").unwrap();

        registry.close_session(&a.session_id);
        assert!(!registry.touch(&a.session_id));
    }

    #[tokio::test]
    async fn test_close_session_fires_shutdown_notice() {
        let registry = registry_with("lib-1", 300);
        let a = registry.create_session("client-a", "lib-1").unwrap();

        let shutdown = Arc::clone(&a.shutdown);
        let waiter = tokio::spawn(async move { shutdown.notified().await });

        // Give the waiter a beat to register.
        tokio::time::sleep(Duration::from_millis(20)).await;
        registry.close_session(&a.session_id);

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("shutdown notification never arrived")
            .unwrap();
    }

    #[test]
    fn test_session_ids_are_unique() {
        let registry = registry_with("lib-1", 300);
        let a = registry.create_session("client-a", "lib-1").unwrap();
        let b = registry.create_session("client-a", "lib-1").unwrap();
        assert_ne!(a.session_id, b.session_id);
        assert_eq!(a.session_id.len(), 32);
    }
}
