//! Session registry: which processes each session owns, and their teardown.
//!
//! Every connection opens a [`Session`]. Its processes are kept per session, each with
//! its output pumps when it was started with streamed output. Probe processes are
//! registered by pid only.
//!
//! A session's evict-then-spawn step runs under the session's gate, so two requests for
//! one session can never both end up owning a live process, and a request that loses
//! the race against a disconnect never spawns.

use super::pump::StreamPump;
use super::tree;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard, RwLock};
use tokio_util::sync::CancellationToken;

/// A spawned process with its stdout/stderr pumps.
pub struct ProcessRunner {
    pub pid: u32,
    pub stdout: StreamPump,
    pub stderr: StreamPump,
}

impl ProcessRunner {
    /// Signal both pumps to stop if they are still running.
    fn cancel_pumps(&self) {
        for pump in [&self.stdout, &self.stderr] {
            if pump.is_active() {
                pump.cancel();
            }
        }
    }
}

/// One connected client.
pub struct Session {
    id: String,
    /// Fired on disconnect or shutdown.
    closed: CancellationToken,
    /// Token of the run that currently owns the session's processes. The lock is the
    /// session's gate.
    current: Mutex<CancellationToken>,
}

impl Session {
    fn new(id: &str) -> Self {
        let closed = CancellationToken::new();
        let current = Mutex::new(closed.child_token());
        Self {
            id: id.to_string(),
            closed,
            current,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

/// A process registered under a session.
struct Owned {
    ticket: u64,
    pid: u32,
    runner: Option<ProcessRunner>,
    /// Set once the process has been reaped. Its pid may belong to another process by now.
    exited: bool,
}

/// Owns every tracked process. Shared across connections.
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<String, Arc<Session>>>>,
    owned: Arc<RwLock<HashMap<String, Vec<Owned>>>>,
    next_ticket: AtomicU64,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            owned: Arc::new(RwLock::new(HashMap::new())),
            next_ticket: AtomicU64::new(1),
        }
    }

    /// The session for `session_id`, created on first use.
    pub async fn open(&self, session_id: &str) -> Arc<Session> {
        self.sessions
            .write()
            .await
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Session::new(session_id)))
            .clone()
    }

    pub async fn is_open(&self, session_id: &str) -> bool {
        self.sessions.read().await.contains_key(session_id)
    }

    /// Forget the session and kill everything it owns. Requests still in flight for it
    /// will not spawn anything afterwards.
    pub async fn close(&self, session_id: &str) {
        let session = self.sessions.write().await.remove(session_id);
        match session {
            Some(session) => {
                session.closed.cancel();
                let _gate = session.current.lock().await;
                self.evict_all(session_id).await;
            }
            None => self.evict_all(session_id).await,
        }
    }

    /// Stop the session's current run and kill its processes. The session stays open.
    pub async fn halt(&self, session: &Session) {
        let current = session.current.lock().await;
        current.cancel();
        self.evict_all(session.id()).await;
    }

    /// Start a new run for the session: stop the previous run, kill what it owned, and
    /// return the gate holding the new run's token. Keep the gate until the new process
    /// is registered. `None` once the session is closed.
    pub async fn take_over<'a>(&self, session: &'a Session) -> Option<MutexGuard<'a, CancellationToken>> {
        let mut current = session.current.lock().await;
        if session.is_closed() {
            return None;
        }
        current.cancel();
        self.evict_all(session.id()).await;
        *current = session.closed.child_token();
        Some(current)
    }

    /// The session's gate, if `run` still owns the session.
    pub async fn enter<'a>(
        &self,
        session: &'a Session,
        run: &CancellationToken,
    ) -> Option<MutexGuard<'a, CancellationToken>> {
        let current = session.current.lock().await;
        if run.is_cancelled() {
            return None;
        }
        Some(current)
    }

    /// Record `pid` as the session's process and return its ticket. Replaces the previous
    /// mapping without killing it; callers evict first.
    pub async fn register(&self, session_id: &str, pid: u32) -> u64 {
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        self.owned.write().await.insert(
            session_id.to_string(),
            vec![Owned {
                ticket,
                pid,
                runner: None,
                exited: false,
            }],
        );
        ticket
    }

    /// Attach pumps to a registered process so eviction can stop them.
    pub async fn track(&self, session_id: &str, ticket: u64, runner: ProcessRunner) {
        let mut owned = self.owned.write().await;
        let entry = owned
            .get_mut(session_id)
            .and_then(|entries| entries.iter_mut().find(|o| o.ticket == ticket));
        match entry {
            Some(entry) => entry.runner = Some(runner),
            None => {
                log::debug!("process {} was evicted before its pumps were tracked", runner.pid);
                runner.cancel_pumps();
            }
        }
    }

    /// Note that a registered process has been reaped. The entry stays until the session's
    /// next run, halt, or disconnect, but its pid is no longer signalled.
    pub async fn mark_exited(&self, session_id: &str, ticket: u64) {
        if let Some(entry) = self
            .owned
            .write()
            .await
            .get_mut(session_id)
            .and_then(|entries| entries.iter_mut().find(|o| o.ticket == ticket))
        {
            entry.exited = true;
        }
    }

    /// Pids currently registered for the session.
    pub async fn session_pids(&self, session_id: &str) -> Vec<u32> {
        self.owned
            .read()
            .await
            .get(session_id)
            .map(|entries| entries.iter().map(|o| o.pid).collect())
            .unwrap_or_default()
    }

    /// Whether `pid` is registered with output pumps.
    pub async fn is_tracked(&self, pid: u32) -> bool {
        self.owned
            .read()
            .await
            .values()
            .flatten()
            .any(|o| o.pid == pid && o.runner.is_some())
    }

    /// Kill everything the session owns and drop its process entries. No-op for unknown sessions.
    pub async fn evict_all(&self, session_id: &str) {
        let entries = self.owned.write().await.remove(session_id);
        for entry in entries.unwrap_or_default() {
            teardown(entry).await;
        }
    }

    /// Stop a process's pumps (if tracked), then kill its tree. A pid the registry does not
    /// know is killed directly. Idempotent and never fails.
    pub async fn evict(&self, pid: u32) {
        let mut removed = Vec::new();
        {
            let mut owned = self.owned.write().await;
            for entries in owned.values_mut() {
                let (gone, kept): (Vec<Owned>, Vec<Owned>) =
                    entries.drain(..).partition(|o| o.pid == pid);
                *entries = kept;
                removed.extend(gone);
            }
            owned.retain(|_, entries| !entries.is_empty());
        }
        if removed.is_empty() {
            kill(pid).await;
        }
        for entry in removed {
            teardown(entry).await;
        }
    }

    /// Close every session and evict anything left. Used at shutdown.
    pub async fn clear(&self) {
        let sessions: Vec<String> = self.sessions.read().await.keys().cloned().collect();
        for session_id in sessions {
            self.close(&session_id).await;
        }
        let leftover: Vec<String> = self.owned.read().await.keys().cloned().collect();
        for session_id in leftover {
            self.evict_all(&session_id).await;
        }
    }
}

async fn teardown(entry: Owned) {
    if let Some(runner) = entry.runner {
        runner.cancel_pumps();
    }
    if entry.exited {
        log::debug!("process {} already exited; not signalling its pid", entry.pid);
        return;
    }
    kill(entry.pid).await;
}

async fn kill(pid: u32) {
    log::info!("destroying process id: {}", pid);
    match tokio::task::spawn_blocking(move || tree::kill_tree(pid)).await {
        Ok(true) => {}
        Ok(false) => log::debug!("process {} had already exited", pid),
        Err(e) => log::debug!("kill of process {} did not complete: {}", pid, e),
    }
}
