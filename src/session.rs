use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::pty::PtyProcess;

/// What a console connection runs inside its PTY.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnMode {
    /// An interactive login shell.
    Shell,
    /// The embedded terminal UI.
    Tui,
}

impl SpawnMode {
    /// Map the `mode` query parameter. Only `shell` selects the shell.
    pub fn from_param(mode: Option<&str>) -> Self {
        match mode {
            Some("shell") => SpawnMode::Shell,
            _ => SpawnMode::Tui,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SpawnMode::Shell => "shell",
            SpawnMode::Tui => "tui",
        }
    }
}

static SESSION_SEQ: AtomicU64 = AtomicU64::new(0);

/// Build a session id from the peer address and the wall clock.
///
/// A process-wide sequence number is appended because two connections from
/// the same peer can land on the same clock reading.
pub fn next_session_id(peer: SocketAddr) -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    let seq = SESSION_SEQ.fetch_add(1, Ordering::Relaxed);
    format!("{peer}-{nanos}-{seq}")
}

/// A registered console session.
///
/// Cloning is cheap; clones share the PTY and the cancellation token. The
/// registry owns the canonical entry; a bridge keeps a clone for the lifetime
/// of its connection.
#[derive(Clone)]
pub struct Session {
    pub id: String,
    pub mode: SpawnMode,
    pub pty: Arc<PtyProcess>,
    pub created_at: Instant,
    /// Fires when the session leaves the registry, for whatever reason.
    /// Bridges select on it to notice reaper removals immediately.
    pub cancelled: CancellationToken,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("mode", &self.mode)
            .field("pid", &self.pty.pid())
            .finish_non_exhaustive()
    }
}

/// Why the reaper removed a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReapReason {
    /// The process had already exited and been reaped.
    Exited,
    /// No input arrived within the idle timeout.
    Idle,
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("maximum number of sessions reached")]
    MaxSessionsReached,
    #[error("session id already exists: {0}")]
    IdExists(String),
}

struct Entry {
    session: Session,
    last_activity: Instant,
}

struct RegistryInner {
    sessions: HashMap<String, Entry>,
}

/// Bounded map of live console sessions.
///
/// All mutation goes through one mutex. [`add`](Self::add) is the only place
/// the capacity limit is enforced: its check and insert happen under the same
/// lock acquisition.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<Mutex<RegistryInner>>,
    max_sessions: usize,
    idle_timeout: Duration,
}

impl SessionRegistry {
    /// Default reaper period.
    pub const DEFAULT_REAP_INTERVAL: Duration = Duration::from_secs(30);

    /// Create an empty registry. An `idle_timeout` of zero disables idle
    /// reaping.
    pub fn new(max_sessions: usize, idle_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(RegistryInner {
                sessions: HashMap::new(),
            })),
            max_sessions,
            idle_timeout,
        }
    }

    pub fn max_sessions(&self) -> usize {
        self.max_sessions
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    /// **Advisory** capacity check.
    ///
    /// Lets the acceptor refuse a connection before paying for a fork/exec.
    /// Two connections can both pass it; [`add`](Self::add) settles the race
    /// and the loser kills its freshly spawned process.
    pub fn can_accept(&self) -> bool {
        self.inner.lock().sessions.len() < self.max_sessions
    }

    /// Register a spawned PTY under `id`.
    ///
    /// Fails without touching the map if the registry is full or the id is in
    /// use. The caller still owns the process on failure and must close it.
    pub fn add(
        &self,
        id: String,
        pty: Arc<PtyProcess>,
        mode: SpawnMode,
    ) -> Result<Session, RegistryError> {
        let mut inner = self.inner.lock();
        if inner.sessions.len() >= self.max_sessions {
            return Err(RegistryError::MaxSessionsReached);
        }
        if inner.sessions.contains_key(&id) {
            return Err(RegistryError::IdExists(id));
        }

        let now = Instant::now();
        let session = Session {
            id: id.clone(),
            mode,
            pty,
            created_at: now,
            cancelled: CancellationToken::new(),
        };
        inner.sessions.insert(
            id,
            Entry {
                session: session.clone(),
                last_activity: now,
            },
        );
        Ok(session)
    }

    /// Record input activity. Absent ids are ignored since a touch can
    /// race with removal.
    pub fn touch(&self, id: &str) {
        if let Some(entry) = self.inner.lock().sessions.get_mut(id) {
            entry.last_activity = Instant::now();
        }
    }

    /// Remove a session and close its PTY. Idempotent.
    pub fn remove(&self, id: &str) -> Option<Session> {
        let removed = self.inner.lock().sessions.remove(id);
        let entry = removed?;
        let session = entry.session;
        session.cancelled.cancel();
        session.pty.close();
        Some(session)
    }

    pub fn get(&self, id: &str) -> Option<Session> {
        self.inner.lock().sessions.get(id).map(|e| e.session.clone())
    }

    pub fn list(&self) -> Vec<String> {
        self.inner.lock().sessions.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// One reaper pass over every session, holding the registry lock.
    ///
    /// Sessions whose process already finished are dropped as-is; sessions
    /// idle for longer than the timeout are force-closed first.
    pub fn sweep(&self, now: Instant) -> Vec<(String, ReapReason)> {
        let mut inner = self.inner.lock();
        let mut reaped = Vec::new();
        for (id, entry) in inner.sessions.iter() {
            if entry.session.pty.is_done() {
                reaped.push((id.clone(), ReapReason::Exited));
                continue;
            }
            let idle = now.saturating_duration_since(entry.last_activity);
            if !self.idle_timeout.is_zero() && idle > self.idle_timeout {
                reaped.push((id.clone(), ReapReason::Idle));
            }
        }

        for (id, reason) in &reaped {
            let Some(entry) = inner.sessions.remove(id) else {
                continue;
            };
            match reason {
                ReapReason::Exited => {
                    tracing::info!(session = %id, "reaping dead session");
                }
                ReapReason::Idle => {
                    let idle = now.saturating_duration_since(entry.last_activity);
                    tracing::info!(session = %id, idle_ms = idle.as_millis() as u64, "reaping idle session");
                }
            }
            entry.session.pty.close();
            entry.session.cancelled.cancel();
        }
        reaped
    }

    /// Run [`sweep`](Self::sweep) every `interval` until `shutdown` fires.
    pub fn spawn_reaper(
        &self,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let reaped = registry.sweep(Instant::now());
                        if !reaped.is_empty() {
                            tracing::debug!(count = reaped.len(), remaining = registry.len(), "reaper pass");
                        }
                    }
                    _ = shutdown.cancelled() => {
                        tracing::debug!("reaper stopping");
                        break;
                    }
                }
            }
        })
    }

    /// Remove and close every session. Used on server shutdown.
    pub fn drain(&self) -> usize {
        let drained: Vec<(String, Entry)> = self.inner.lock().sessions.drain().collect();
        let count = drained.len();
        for (_, entry) in drained {
            entry.session.cancelled.cancel();
            entry.session.pty.close();
        }
        count
    }

}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::pty::SpawnCommand;

    fn spawn_sleeper() -> Arc<PtyProcess> {
        Arc::new(
            PtyProcess::spawn(&SpawnCommand::new("/bin/sh", ["-c", "sleep 30"]))
                .expect("failed to spawn PTY for test"),
        )
    }

    fn peer() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    #[test]
    fn spawn_mode_from_param() {
        assert_eq!(SpawnMode::from_param(Some("shell")), SpawnMode::Shell);
        assert_eq!(SpawnMode::from_param(Some("tui")), SpawnMode::Tui);
        assert_eq!(SpawnMode::from_param(Some("SHELL")), SpawnMode::Tui);
        assert_eq!(SpawnMode::from_param(None), SpawnMode::Tui);
    }

    #[test]
    fn session_ids_are_unique_for_one_peer() {
        let ids: std::collections::HashSet<String> =
            (0..10_000).map(|_| next_session_id(peer())).collect();
        assert_eq!(ids.len(), 10_000);
        assert!(ids.iter().all(|id| id.starts_with("127.0.0.1:40000-")));
    }

    #[tokio::test]
    async fn registry_add_and_get() {
        let registry = SessionRegistry::new(4, Duration::ZERO);
        let session = registry.add("a".into(), spawn_sleeper(), SpawnMode::Shell).unwrap();
        assert_eq!(session.id, "a");
        assert_eq!(registry.len(), 1);

        let fetched = registry.get("a").expect("session should exist");
        assert!(Arc::ptr_eq(&fetched.pty, &session.pty));
        assert_eq!(fetched.mode, SpawnMode::Shell);
        assert!(registry.get("b").is_none());
        registry.drain();
    }

    #[tokio::test]
    async fn registry_add_rejects_when_full() {
        let registry = SessionRegistry::new(2, Duration::ZERO);
        registry.add("a".into(), spawn_sleeper(), SpawnMode::Shell).unwrap();
        registry.add("b".into(), spawn_sleeper(), SpawnMode::Shell).unwrap();
        assert!(!registry.can_accept());

        let late = spawn_sleeper();
        let err = registry.add("c".into(), late.clone(), SpawnMode::Shell).unwrap_err();
        assert!(matches!(err, RegistryError::MaxSessionsReached), "got: {err:?}");
        assert_eq!(registry.len(), 2);
        assert!(registry.get("c").is_none());
        late.close();
        registry.drain();
    }

    #[tokio::test]
    async fn registry_add_rejects_duplicate_id() {
        let registry = SessionRegistry::new(4, Duration::ZERO);
        let first = registry.add("dup".into(), spawn_sleeper(), SpawnMode::Tui).unwrap();
        let err = registry.add("dup".into(), spawn_sleeper(), SpawnMode::Tui).unwrap_err();
        assert!(matches!(err, RegistryError::IdExists(ref id) if id == "dup"), "got: {err:?}");
        let current = registry.get("dup").unwrap();
        assert!(Arc::ptr_eq(&current.pty, &first.pty));
        registry.drain();
    }

    #[tokio::test]
    async fn registry_concurrent_adds_respect_capacity() {
        let registry = SessionRegistry::new(3, Duration::ZERO);
        let ptys: Vec<Arc<PtyProcess>> = (0..8).map(|_| spawn_sleeper()).collect();

        let mut handles = Vec::new();
        for (i, pty) in ptys.into_iter().enumerate() {
            let registry = registry.clone();
            handles.push(tokio::task::spawn_blocking(move || {
                let ok = registry.add(format!("s{i}"), pty.clone(), SpawnMode::Shell).is_ok();
                if !ok {
                    pty.close();
                }
                ok
            }));
        }
        let mut accepted = 0;
        for h in handles {
            if h.await.unwrap() {
                accepted += 1;
            }
        }
        assert_eq!(accepted, 3);
        assert_eq!(registry.len(), 3);
        registry.drain();
    }

    #[tokio::test]
    async fn registry_remove_closes_and_is_idempotent() {
        let registry = SessionRegistry::new(4, Duration::ZERO);
        let session = registry.add("a".into(), spawn_sleeper(), SpawnMode::Shell).unwrap();

        let removed = registry.remove("a").expect("first remove returns the session");
        assert!(removed.pty.is_closed());
        assert!(session.cancelled.is_cancelled());
        assert!(registry.remove("a").is_none());
        assert!(registry.is_empty());

        tokio::time::timeout(Duration::from_secs(5), session.pty.done())
            .await
            .expect("process should be reaped after remove");
    }

    #[tokio::test]
    async fn registry_touch_defers_idle_reap_and_ignores_missing() {
        let registry = SessionRegistry::new(4, Duration::from_millis(100));
        registry.add("a".into(), spawn_sleeper(), SpawnMode::Shell).unwrap();
        let added = Instant::now();
        tokio::time::sleep(Duration::from_millis(60)).await;
        registry.touch("a");

        // Idle since `added`, but not since the touch.
        let check = added + Duration::from_millis(130);
        assert!(registry.sweep(check).is_empty());
        assert_eq!(registry.len(), 1);

        registry.touch("ghost");
        assert!(registry.get("ghost").is_none());
        registry.drain();
    }

    #[tokio::test]
    async fn sweep_reaps_idle_sessions() {
        let registry = SessionRegistry::new(4, Duration::from_millis(100));
        let idle = registry.add("idle".into(), spawn_sleeper(), SpawnMode::Shell).unwrap();
        registry.add("busy".into(), spawn_sleeper(), SpawnMode::Shell).unwrap();

        tokio::time::sleep(Duration::from_millis(150)).await;
        registry.touch("busy");

        let reaped = registry.sweep(Instant::now());
        assert_eq!(reaped, vec![("idle".to_string(), ReapReason::Idle)]);
        assert!(idle.pty.is_closed());
        assert!(idle.cancelled.is_cancelled());
        assert!(registry.get("busy").is_some());
        registry.drain();
    }

    #[tokio::test]
    async fn sweep_without_idle_timeout_keeps_quiet_sessions() {
        let registry = SessionRegistry::new(4, Duration::ZERO);
        registry.add("a".into(), spawn_sleeper(), SpawnMode::Shell).unwrap();
        let far_future = Instant::now() + Duration::from_secs(3600);
        assert!(registry.sweep(far_future).is_empty());
        assert_eq!(registry.len(), 1);
        registry.drain();
    }

    #[tokio::test]
    async fn sweep_reaps_exited_sessions() {
        let registry = SessionRegistry::new(4, Duration::ZERO);
        let pty = Arc::new(PtyProcess::spawn(&SpawnCommand::new("/bin/sh", ["-c", "exit 0"])).unwrap());
        let session = registry.add("gone".into(), pty, SpawnMode::Shell).unwrap();

        tokio::time::timeout(Duration::from_secs(5), session.pty.done())
            .await
            .expect("short-lived process should exit");

        let reaped = registry.sweep(Instant::now());
        assert_eq!(reaped, vec![("gone".to_string(), ReapReason::Exited)]);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn reaper_task_runs_on_interval_and_stops() {
        let registry = SessionRegistry::new(4, Duration::from_millis(50));
        let session = registry.add("a".into(), spawn_sleeper(), SpawnMode::Shell).unwrap();
        let shutdown = CancellationToken::new();
        let handle = registry.spawn_reaper(Duration::from_millis(25), shutdown.clone());

        tokio::time::timeout(Duration::from_secs(2), session.cancelled.cancelled())
            .await
            .expect("reaper should remove the idle session");
        assert!(registry.is_empty());

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("reaper should stop on shutdown")
            .unwrap();
    }

    #[tokio::test]
    async fn drain_closes_everything() {
        let registry = SessionRegistry::new(4, Duration::ZERO);
        let a = registry.add("a".into(), spawn_sleeper(), SpawnMode::Shell).unwrap();
        let b = registry.add("b".into(), spawn_sleeper(), SpawnMode::Tui).unwrap();
        assert_eq!(registry.drain(), 2);
        assert!(registry.is_empty());
        assert!(a.pty.is_closed() && b.pty.is_closed());
        assert!(a.cancelled.is_cancelled() && b.cancelled.is_cancelled());
    }
}
