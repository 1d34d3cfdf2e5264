//! Async browser IPC multiplexer.
//!
//! Owns the browser child process and correlates concurrent request/reply
//! pairs by id. Many tasks submit commands; a single reactor task owns the
//! child's stdio: it drains the outbound queue to stdin in order, extracts
//! reply lines from stdout, completes the matching pending entry, and runs
//! the timeout sweep. A dedicated task watches stderr for the readiness
//! sentinel and license errors.
//!
//! Every pending entry is completed exactly once — by reply, timeout sweep,
//! cancellation, or crash drain.

pub mod codec;
#[cfg(unix)]
pub mod pool;

use crate::error::IpcError;
use crate::stats::LatencyStat;
use anyhow::{Context, Result};
use codec::{IpcCommand, StderrEvent};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Outbound command queue depth. Submission past this bound fails fast with
/// `QueueFull` instead of blocking the caller.
const OUTBOUND_QUEUE_DEPTH: usize = 1024;
/// Stdout line buffer — screenshots come back on one line.
const STDOUT_BUFFER_CAPACITY: usize = 8 * 1024 * 1024;
/// Timeout sweep cadence inside the reactor.
const TIMEOUT_SWEEP_INTERVAL: Duration = Duration::from_millis(50);
/// How long `stop` waits for the browser to exit after stdin closes.
const STOP_GRACE: Duration = Duration::from_secs(5);
#[cfg(unix)]
const SOCKET_POOL_SIZE: usize = 16;

// ─── State machine ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrowserState {
    Stopped,
    Starting,
    Ready,
    Error,
    LicenseError,
}

impl BrowserState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BrowserState::Stopped => "stopped",
            BrowserState::Starting => "starting",
            BrowserState::Ready => "ready",
            BrowserState::Error => "error",
            BrowserState::LicenseError => "license_error",
        }
    }
}

#[derive(Debug, Clone)]
pub struct LicenseStatus {
    pub status: String,
    pub message: String,
    pub fingerprint: String,
}

// ─── Pending table ───────────────────────────────────────────────────────────

struct Pending {
    submit_time: Instant,
    deadline: Instant,
    tx: oneshot::Sender<Result<Value, IpcError>>,
}

#[derive(Debug, Default)]
struct Counters {
    sent: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
    cancelled: AtomicU64,
    unmatched_replies: AtomicU64,
    dropped_lines: AtomicU64,
    max_pending: AtomicU64,
    latency: LatencyStat,
}

struct Inner {
    pending: Mutex<HashMap<u64, Pending>>,
    next_id: AtomicU64,
    state_tx: watch::Sender<BrowserState>,
    license: Mutex<Option<LicenseStatus>>,
    /// Present while a reactor is running; cleared on stop/crash so new
    /// submissions fail fast.
    outbound: Mutex<Option<mpsc::Sender<String>>>,
    counters: Counters,
    default_timeout: Duration,
    #[cfg(unix)]
    socket_pool: Mutex<Option<Arc<pool::IpcSocketPool>>>,
}

impl Inner {
    fn set_state(&self, s: BrowserState) {
        self.state_tx.send_replace(s);
    }

    fn license_error(&self) -> IpcError {
        let lic = self.license.lock().expect("license lock poisoned");
        match &*lic {
            Some(l) => IpcError::License {
                status: l.status.clone(),
                message: l.message.clone(),
                fingerprint: l.fingerprint.clone(),
            },
            None => IpcError::NotReady("license_error".into()),
        }
    }
}

struct RunHandles {
    shutdown_tx: watch::Sender<bool>,
    reactor: JoinHandle<()>,
    stderr_task: Option<JoinHandle<()>>,
    instance_id: String,
}

// ─── Reply handle ────────────────────────────────────────────────────────────

/// Handle to an in-flight command. Await `wait` for the outcome, or keep the
/// id around for `BrowserIpc::cancel`. Dropping the handle leaves the
/// command in flight; its eventual reply is discarded.
pub struct ReplyHandle {
    pub id: u64,
    rx: oneshot::Receiver<Result<Value, IpcError>>,
}

impl ReplyHandle {
    pub async fn wait(self) -> Result<Value, IpcError> {
        match self.rx.await {
            Ok(outcome) => outcome,
            // The multiplexer was torn down without completing the entry —
            // only reachable if the whole Inner dropped mid-flight.
            Err(_) => Err(IpcError::Stopped),
        }
    }
}

// ─── Multiplexer ─────────────────────────────────────────────────────────────

pub struct BrowserIpc {
    inner: Arc<Inner>,
    browser_path: Option<PathBuf>,
    run: Mutex<Option<RunHandles>>,
}

impl BrowserIpc {
    pub fn new(browser_path: Option<PathBuf>, default_timeout: Duration) -> Self {
        let (state_tx, _) = watch::channel(BrowserState::Stopped);
        Self {
            inner: Arc::new(Inner {
                pending: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                state_tx,
                license: Mutex::new(None),
                outbound: Mutex::new(None),
                counters: Counters::default(),
                default_timeout,
                #[cfg(unix)]
                socket_pool: Mutex::new(None),
            }),
            browser_path,
            run: Mutex::new(None),
        }
    }

    /// Attach to an already-connected transport instead of spawning a child.
    /// The multiplexer is immediately `Ready`. Used by tests and by socket
    /// transports; crash/drain semantics are identical (EOF on `reader`
    /// counts as a browser exit).
    pub fn attach<R, W>(reader: R, writer: W, default_timeout: Duration) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let ipc = Self::new(None, default_timeout);
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_DEPTH);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        *ipc.inner.outbound.lock().expect("outbound lock poisoned") = Some(outbound_tx);
        ipc.inner.set_state(BrowserState::Ready);
        let reactor = tokio::spawn(reactor(
            ipc.inner.clone(),
            reader,
            writer,
            outbound_rx,
            shutdown_rx,
            None,
        ));
        *ipc.run.lock().expect("run lock poisoned") = Some(RunHandles {
            shutdown_tx,
            reactor,
            stderr_task: None,
            instance_id: String::new(),
        });
        ipc
    }

    pub fn state(&self) -> BrowserState {
        *self.inner.state_tx.borrow()
    }

    pub fn license_status(&self) -> Option<LicenseStatus> {
        self.inner
            .license
            .lock()
            .expect("license lock poisoned")
            .clone()
    }

    pub fn pending_count(&self) -> usize {
        self.inner
            .pending
            .lock()
            .expect("pending lock poisoned")
            .len()
    }

    pub fn instance_id(&self) -> Option<String> {
        self.run
            .lock()
            .expect("run lock poisoned")
            .as_ref()
            .map(|h| h.instance_id.clone())
    }

    /// Spawn the browser process and bring the multiplexer to `Starting`.
    /// Readiness is reported asynchronously by the stderr watcher.
    pub async fn start(&self) -> Result<()> {
        {
            let run = self.run.lock().expect("run lock poisoned");
            if run.is_some() {
                return Ok(());
            }
        }
        let path = self
            .browser_path
            .clone()
            .context("no browser binary configured")?;

        let instance_id = uuid::Uuid::new_v4().to_string();
        let mut child = Command::new(&path)
            .args(["--automation", "--instance-id", &instance_id])
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to spawn browser at {}", path.display()))?;

        let stdin = child.stdin.take().context("browser stdin not piped")?;
        let stdout = child.stdout.take().context("browser stdout not piped")?;
        let stderr = child.stderr.take().context("browser stderr not piped")?;

        info!(
            pid = child.id().unwrap_or(0),
            instance_id = %instance_id,
            browser = %path.display(),
            "browser process spawned"
        );

        self.inner
            .license
            .lock()
            .expect("license lock poisoned")
            .take();
        self.inner.set_state(BrowserState::Starting);

        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_DEPTH);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        *self.inner.outbound.lock().expect("outbound lock poisoned") = Some(outbound_tx);

        let stderr_task = tokio::spawn(stderr_watcher(self.inner.clone(), stderr));
        let reactor = tokio::spawn(reactor(
            self.inner.clone(),
            stdout,
            stdin,
            outbound_rx,
            shutdown_rx,
            Some(child),
        ));

        *self.run.lock().expect("run lock poisoned") = Some(RunHandles {
            shutdown_tx,
            reactor,
            stderr_task: Some(stderr_task),
            instance_id,
        });
        Ok(())
    }

    /// Stop the browser: close stdin, wait up to a grace period, terminate.
    /// Every pending request drains with `BrowserCrashed`.
    pub async fn stop(&self) {
        let handles = self.run.lock().expect("run lock poisoned").take();
        let Some(h) = handles else { return };

        self.inner
            .outbound
            .lock()
            .expect("outbound lock poisoned")
            .take();
        #[cfg(unix)]
        self.inner
            .socket_pool
            .lock()
            .expect("pool lock poisoned")
            .take();

        let _ = h.shutdown_tx.send(true);
        let _ = h.reactor.await;
        if let Some(t) = h.stderr_task {
            let _ = t.await;
        }
        self.inner.set_state(BrowserState::Stopped);
        info!("browser IPC stopped");
    }

    /// Stop then start. The supervisor calls this after a crash.
    pub async fn restart(&self) -> Result<()> {
        self.stop().await;
        self.start().await
    }

    /// Block until the browser reports readiness (or fails to).
    pub async fn wait_ready(&self, limit: Duration) -> Result<(), IpcError> {
        let mut rx = self.inner.state_tx.subscribe();
        let wait = async {
            loop {
                let state = *rx.borrow_and_update();
                match state {
                    BrowserState::Ready => return Ok(()),
                    BrowserState::LicenseError => return Err(self.inner.license_error()),
                    BrowserState::Error => return Err(IpcError::BrowserCrashed),
                    BrowserState::Stopped => return Err(IpcError::Stopped),
                    BrowserState::Starting => {}
                }
                if rx.changed().await.is_err() {
                    return Err(IpcError::Stopped);
                }
            }
        };
        match tokio::time::timeout(limit, wait).await {
            Ok(r) => r,
            Err(_) => Err(IpcError::NotReady("ready wait timed out".into())),
        }
    }

    /// Submit a command. Returns a handle whose `wait` resolves with the
    /// correlated reply, a timeout, a cancellation, or a crash drain —
    /// exactly one of them, exactly once. May be called from any task.
    pub fn send(
        &self,
        method: &str,
        params: Value,
        timeout: Option<Duration>,
    ) -> Result<ReplyHandle, IpcError> {
        match self.state() {
            BrowserState::Ready => {}
            BrowserState::Starting => return Err(IpcError::NotReady("starting".into())),
            BrowserState::Stopped => return Err(IpcError::Stopped),
            BrowserState::Error => return Err(IpcError::BrowserCrashed),
            BrowserState::LicenseError => return Err(self.inner.license_error()),
        }
        let outbound = self
            .inner
            .outbound
            .lock()
            .expect("outbound lock poisoned")
            .clone()
            .ok_or(IpcError::Stopped)?;

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        debug_assert!(id < u64::MAX, "request id counter wrapped");

        let now = Instant::now();
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.inner.pending.lock().expect("pending lock poisoned");
            pending.insert(
                id,
                Pending {
                    submit_time: now,
                    deadline: now + timeout.unwrap_or(self.inner.default_timeout),
                    tx,
                },
            );
            let depth = pending.len() as u64;
            self.inner
                .counters
                .max_pending
                .fetch_max(depth, Ordering::Relaxed);
        }

        let line = IpcCommand {
            id,
            method: method.to_string(),
            params,
        }
        .encode();

        if let Err(e) = outbound.try_send(line) {
            // Roll the entry back — nothing was written.
            self.inner
                .pending
                .lock()
                .expect("pending lock poisoned")
                .remove(&id);
            return Err(match e {
                mpsc::error::TrySendError::Full(_) => IpcError::QueueFull,
                mpsc::error::TrySendError::Closed(_) => IpcError::Stopped,
            });
        }
        self.inner.counters.sent.fetch_add(1, Ordering::Relaxed);
        Ok(ReplyHandle { id, rx })
    }

    /// Submit and await. Waits out `Starting` first, and routes through the
    /// multi-socket pool when the browser advertises one.
    pub async fn call(
        &self,
        method: &str,
        params: Value,
        timeout: Option<Duration>,
    ) -> Result<Value, IpcError> {
        let limit = timeout.unwrap_or(self.inner.default_timeout);
        if self.state() == BrowserState::Starting {
            self.wait_ready(limit).await?;
        }

        #[cfg(unix)]
        {
            let pool = self
                .inner
                .socket_pool
                .lock()
                .expect("pool lock poisoned")
                .clone();
            if let Some(pool) = pool {
                if self.state() == BrowserState::Ready {
                    return self.call_pooled(&pool, method, params, limit).await;
                }
            }
        }

        self.send(method, params, Some(limit))?.wait().await
    }

    #[cfg(unix)]
    async fn call_pooled(
        &self,
        pool: &pool::IpcSocketPool,
        method: &str,
        params: Value,
        limit: Duration,
    ) -> Result<Value, IpcError> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let cmd = IpcCommand {
            id,
            method: method.to_string(),
            params,
        };
        self.inner.counters.sent.fetch_add(1, Ordering::Relaxed);
        let start = Instant::now();
        let result = pool.call(&cmd, limit).await;
        match &result {
            Ok(_) => {
                self.inner
                    .counters
                    .latency
                    .record(start.elapsed().as_millis() as u64);
                self.inner.counters.completed.fetch_add(1, Ordering::Relaxed);
            }
            Err(IpcError::Timeout) => {
                self.inner.counters.timed_out.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                self.inner.counters.failed.fetch_add(1, Ordering::Relaxed);
            }
        }
        result
    }

    /// Cancel a pending command. Returns `true` if the entry existed; its
    /// handle fires exactly once with `Cancelled`. A reply that arrives
    /// after cancellation is dropped as unmatched.
    pub fn cancel(&self, id: u64) -> bool {
        let entry = self
            .inner
            .pending
            .lock()
            .expect("pending lock poisoned")
            .remove(&id);
        match entry {
            Some(p) => {
                self.inner.counters.cancelled.fetch_add(1, Ordering::Relaxed);
                let _ = p.tx.send(Err(IpcError::Cancelled));
                true
            }
            None => false,
        }
    }

    /// Whether the multi-socket pool is active.
    pub fn is_multi_socket(&self) -> bool {
        #[cfg(unix)]
        {
            self.inner
                .socket_pool
                .lock()
                .expect("pool lock poisoned")
                .is_some()
        }
        #[cfg(not(unix))]
        {
            false
        }
    }

    pub fn stats(&self) -> Value {
        let c = &self.inner.counters;
        json!({
            "state": self.state().as_str(),
            "pending": self.pending_count(),
            "max_pending": c.max_pending.load(Ordering::Relaxed),
            "commands_sent": c.sent.load(Ordering::Relaxed),
            "commands_completed": c.completed.load(Ordering::Relaxed),
            "commands_failed": c.failed.load(Ordering::Relaxed),
            "commands_timeout": c.timed_out.load(Ordering::Relaxed),
            "commands_cancelled": c.cancelled.load(Ordering::Relaxed),
            "unmatched_replies": c.unmatched_replies.load(Ordering::Relaxed),
            "dropped_lines": c.dropped_lines.load(Ordering::Relaxed),
            "multi_socket": self.is_multi_socket(),
            "latency": c.latency.snapshot(),
        })
    }
}

// ─── Reactor ─────────────────────────────────────────────────────────────────

async fn reactor<R, W>(
    inner: Arc<Inner>,
    reader: R,
    writer: W,
    mut outbound_rx: mpsc::Receiver<String>,
    mut shutdown_rx: watch::Receiver<bool>,
    mut child: Option<Child>,
) where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let mut writer = writer;
    let mut lines = BufReader::with_capacity(STDOUT_BUFFER_CAPACITY, reader).lines();
    let mut sweep = tokio::time::interval(TIMEOUT_SWEEP_INTERVAL);
    sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    let mut crashed = false;
    loop {
        tokio::select! {
            biased;

            _ = shutdown_rx.changed() => break,

            Some(line) = outbound_rx.recv() => {
                if writer.write_all(line.as_bytes()).await.is_err() {
                    crashed = true;
                    break;
                }
                let _ = writer.flush().await;
            }

            line = lines.next_line() => {
                match line {
                    Ok(Some(l)) => handle_reply_line(&inner, &l),
                    Ok(None) => {
                        debug!("browser stdout closed");
                        crashed = true;
                        break;
                    }
                    Err(e) => {
                        warn!(err = %e, "browser stdout read error");
                        crashed = true;
                        break;
                    }
                }
            }

            _ = sweep.tick() => sweep_timeouts(&inner),
        }
    }

    inner
        .outbound
        .lock()
        .expect("outbound lock poisoned")
        .take();
    #[cfg(unix)]
    inner
        .socket_pool
        .lock()
        .expect("pool lock poisoned")
        .take();

    if crashed {
        warn!("browser process exited — draining pending commands");
        inner.set_state(BrowserState::Error);
        if let Some(mut c) = child.take() {
            let _ = c.start_kill();
            let _ = c.wait().await;
        }
        drain_pending(&inner, IpcError::BrowserCrashed);
    } else {
        // Graceful stop: flush what was already queued, close stdin, give
        // the browser its grace period, then terminate.
        while let Ok(line) = outbound_rx.try_recv() {
            if writer.write_all(line.as_bytes()).await.is_err() {
                break;
            }
        }
        let _ = writer.shutdown().await;
        drop(writer);
        if let Some(mut c) = child.take() {
            if tokio::time::timeout(STOP_GRACE, c.wait()).await.is_err() {
                warn!("browser did not exit within grace period — killing");
                let _ = c.start_kill();
                let _ = c.wait().await;
            }
        }
        drain_pending(&inner, IpcError::BrowserCrashed);
    }
}

fn handle_reply_line(inner: &Inner, line: &str) {
    let reply = match codec::parse_reply(line) {
        Ok(r) => r,
        Err(_) => {
            inner.counters.dropped_lines.fetch_add(1, Ordering::Relaxed);
            debug!(len = line.len(), "dropped unparseable browser line");
            return;
        }
    };
    let entry = inner
        .pending
        .lock()
        .expect("pending lock poisoned")
        .remove(&reply.id);
    match entry {
        Some(p) => {
            inner
                .counters
                .latency
                .record(p.submit_time.elapsed().as_millis() as u64);
            let outcome = match (reply.result, reply.error) {
                (_, Some(err)) => {
                    inner.counters.failed.fetch_add(1, Ordering::Relaxed);
                    Err(IpcError::Browser {
                        code: err.code,
                        message: err.message,
                    })
                }
                (Some(v), None) => {
                    inner.counters.completed.fetch_add(1, Ordering::Relaxed);
                    Ok(v)
                }
                (None, None) => {
                    inner.counters.completed.fetch_add(1, Ordering::Relaxed);
                    Ok(Value::Null)
                }
            };
            let _ = p.tx.send(outcome);
        }
        None => {
            // Cancelled, timed out, or never ours.
            inner
                .counters
                .unmatched_replies
                .fetch_add(1, Ordering::Relaxed);
        }
    }
}

fn sweep_timeouts(inner: &Inner) {
    let now = Instant::now();
    let expired: Vec<Pending> = {
        let mut pending = inner.pending.lock().expect("pending lock poisoned");
        let ids: Vec<u64> = pending
            .iter()
            .filter(|(_, e)| e.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        ids.into_iter()
            .filter_map(|id| pending.remove(&id))
            .collect()
    };
    for entry in expired {
        inner.counters.timed_out.fetch_add(1, Ordering::Relaxed);
        let _ = entry.tx.send(Err(IpcError::Timeout));
    }
}

fn drain_pending(inner: &Inner, err: IpcError) {
    let drained: Vec<Pending> = {
        let mut pending = inner.pending.lock().expect("pending lock poisoned");
        pending.drain().map(|(_, p)| p).collect()
    };
    for entry in drained {
        inner.counters.failed.fetch_add(1, Ordering::Relaxed);
        let _ = entry.tx.send(Err(err.clone()));
    }
}

// ─── Stderr watcher ──────────────────────────────────────────────────────────

async fn stderr_watcher(inner: Arc<Inner>, stderr: tokio::process::ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        match codec::parse_stderr_line(&line) {
            StderrEvent::Ready { socket_path } => {
                if *inner.state_tx.borrow() == BrowserState::Starting {
                    #[cfg(unix)]
                    if let Some(path) = socket_path {
                        info!(socket = %path, "browser advertises multi-socket IPC");
                        *inner.socket_pool.lock().expect("pool lock poisoned") =
                            Some(Arc::new(pool::IpcSocketPool::new(
                                path.into(),
                                SOCKET_POOL_SIZE,
                            )));
                    }
                    #[cfg(not(unix))]
                    let _ = socket_path;
                    inner.set_state(BrowserState::Ready);
                    info!("browser ready");
                }
            }
            StderrEvent::LicenseError {
                status,
                message,
                fingerprint,
            } => {
                warn!(status = %status, "browser reported a license error");
                *inner.license.lock().expect("license lock poisoned") = Some(LicenseStatus {
                    status,
                    message,
                    fingerprint,
                });
                inner.set_state(BrowserState::LicenseError);
            }
            StderrEvent::Other => {
                debug!(target: "browser_stderr", "{}", line);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_on_stopped_fails_fast() {
        let ipc = BrowserIpc::new(None, Duration::from_secs(1));
        assert_eq!(ipc.state(), BrowserState::Stopped);
        assert!(matches!(
            ipc.send("navigate", json!({}), None),
            Err(IpcError::Stopped)
        ));
    }

    #[test]
    fn cancel_unknown_id_is_noop() {
        let ipc = BrowserIpc::new(None, Duration::from_secs(1));
        assert!(!ipc.cancel(42));
    }

    #[test]
    fn state_strings_are_stable() {
        // /health exposes these verbatim.
        assert_eq!(BrowserState::Ready.as_str(), "ready");
        assert_eq!(BrowserState::LicenseError.as_str(), "license_error");
    }
}
