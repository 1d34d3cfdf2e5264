//! Live video streaming of browser viewports.
//!
//! Three consumption paths over the same shared-memory frame ring:
//! single JPEG snapshots (`GET /video/frame/{ctx}`), MJPEG streams
//! (`GET /video/stream/{ctx}`), and WebSocket binary fanout
//! (`subscribeVideo`). Lifecycle is driven over IPC with
//! `startVideo`/`stopVideo`; a stopped context flags lingering streaming
//! tasks, and the last task out removes the context entry.

pub mod mjpeg;
pub mod shm;

use crate::config::VideoConfig;
use crate::error::{ApiError, IpcError};
use crate::ipc::BrowserIpc;
use crate::stats::GatewayStats;
use bytes::Bytes;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Buffered MJPEG parts per client; the sender blocks when the client
/// socket stalls, which is the stream's backpressure.
const MJPEG_CHANNEL_DEPTH: usize = 4;
/// Per-subscriber WS frame queue; `try_send` drops frames past this
/// high-water mark so one slow subscriber never blocks the publisher.
const SUBSCRIBER_QUEUE_DEPTH: usize = 8;
/// How long the publisher retries opening a freshly-started ring.
const PUBLISHER_OPEN_RETRY: Duration = Duration::from_millis(100);
const PUBLISHER_OPEN_LIMIT: Duration = Duration::from_secs(5);

struct Subscriber {
    conn_id: u64,
    tx: mpsc::Sender<Bytes>,
}

pub struct StreamContext {
    context_id: String,
    should_stop: AtomicBool,
    streaming_tasks: AtomicUsize,
    subscribers: Mutex<Vec<Subscriber>>,
    publisher_running: AtomicBool,
    frames_published: AtomicU64,
}

impl StreamContext {
    fn new(context_id: String) -> Arc<Self> {
        Arc::new(Self {
            context_id,
            should_stop: AtomicBool::new(false),
            streaming_tasks: AtomicUsize::new(0),
            subscribers: Mutex::new(Vec::new()),
            publisher_running: AtomicBool::new(false),
            frames_published: AtomicU64::new(0),
        })
    }

    fn stopping(&self) -> bool {
        self.should_stop.load(Ordering::Acquire)
    }

    fn subscriber_count(&self) -> usize {
        self.subscribers.lock().expect("subscribers poisoned").len()
    }
}

struct VideoInner {
    cfg: VideoConfig,
    stats: Arc<GatewayStats>,
    contexts: Mutex<HashMap<String, Arc<StreamContext>>>,
}

/// Registry of active stream contexts.
#[derive(Clone)]
pub struct VideoStreams {
    inner: Arc<VideoInner>,
}

impl VideoStreams {
    pub fn new(cfg: VideoConfig, stats: Arc<GatewayStats>) -> Self {
        Self {
            inner: Arc::new(VideoInner {
                cfg,
                stats,
                contexts: Mutex::new(HashMap::new()),
            }),
        }
    }

    fn context(&self, context_id: &str, create: bool) -> Option<Arc<StreamContext>> {
        let mut map = self.inner.contexts.lock().expect("contexts poisoned");
        if let Some(ctx) = map.get(context_id) {
            return Some(ctx.clone());
        }
        if create {
            let ctx = StreamContext::new(context_id.to_string());
            map.insert(context_id.to_string(), ctx.clone());
            return Some(ctx);
        }
        None
    }

    /// Start streaming a context: IPC first, then local bookkeeping.
    pub async fn start(
        &self,
        ipc: &BrowserIpc,
        context_id: &str,
        fps: u32,
        quality: u32,
    ) -> Result<Value, IpcError> {
        let result = ipc
            .call(
                "startVideo",
                json!({"context_id": context_id, "fps": fps, "quality": quality}),
                None,
            )
            .await?;
        let ctx = self
            .context(context_id, true)
            .expect("context created above");
        ctx.should_stop.store(false, Ordering::Release);
        info!(context = %context_id, fps, quality, "video stream started");
        Ok(result)
    }

    /// Stop streaming: IPC, then flag lingering tasks to exit on their next
    /// poll. The last task out removes the entry.
    pub async fn stop(&self, ipc: &BrowserIpc, context_id: &str) -> Result<Value, IpcError> {
        let result = ipc
            .call("stopVideo", json!({"context_id": context_id}), None)
            .await?;
        if let Some(ctx) = self.context(context_id, false) {
            ctx.should_stop.store(true, Ordering::Release);
            ctx.subscribers
                .lock()
                .expect("subscribers poisoned")
                .clear();
            if ctx.streaming_tasks.load(Ordering::Acquire) == 0 {
                self.inner
                    .contexts
                    .lock()
                    .expect("contexts poisoned")
                    .remove(context_id);
            }
        }
        info!(context = %context_id, "video stream stopped");
        Ok(result)
    }

    /// Fetch the latest frame for a context, waiting up to the configured
    /// frame timeout for the first one.
    pub async fn single_frame(&self, context_id: &str) -> Result<shm::Frame, ApiError> {
        let name = shm::shm_name_for_context(context_id);
        let mut reader = open_reader(&name)?;
        if !reader.has_new()
            && !reader
                .wait(Duration::from_millis(self.inner.cfg.frame_timeout_ms))
                .await
        {
            return Err(ApiError::UpstreamTimeout);
        }
        reader.read().ok_or(ApiError::UpstreamTimeout)
    }

    /// Open an MJPEG part stream for a context. The returned receiver feeds
    /// the HTTP response body; the producer task ends on client disconnect,
    /// `stopVideo`, writer inactivity, or frame timeout.
    pub fn mjpeg_stream(
        &self,
        context_id: &str,
    ) -> Result<mpsc::Receiver<Result<Bytes, io::Error>>, ApiError> {
        let name = shm::shm_name_for_context(context_id);
        let reader = open_reader(&name)?;
        let ctx = self
            .context(context_id, true)
            .expect("context created above");
        let (tx, rx) = mpsc::channel(MJPEG_CHANNEL_DEPTH);
        tokio::spawn(mjpeg_task(self.inner.clone(), ctx, reader, tx));
        Ok(rx)
    }

    /// Attach a WebSocket subscriber to a context's binary frame fanout.
    /// One connection uses a single bounded channel for all its
    /// subscriptions; `conn_id` keys detachment.
    pub fn subscribe(&self, context_id: &str, conn_id: u64, tx: mpsc::Sender<Bytes>) {
        let ctx = self
            .context(context_id, true)
            .expect("context created above");
        ctx.subscribers
            .lock()
            .expect("subscribers poisoned")
            .push(Subscriber { conn_id, tx });
        if !ctx.publisher_running.swap(true, Ordering::AcqRel) {
            tokio::spawn(publisher_task(self.inner.clone(), ctx));
        }
    }

    /// Queue depth used for subscriber channels.
    pub fn subscriber_queue_depth() -> usize {
        SUBSCRIBER_QUEUE_DEPTH
    }

    /// Detach a connection from every context (connection closed or
    /// `unsubscribeVideo`).
    pub fn unsubscribe(&self, conn_id: u64) {
        let map = self.inner.contexts.lock().expect("contexts poisoned");
        for ctx in map.values() {
            ctx.subscribers
                .lock()
                .expect("subscribers poisoned")
                .retain(|s| s.conn_id != conn_id);
        }
    }

    /// Active streams document for `GET /video/streams`.
    pub fn list(&self) -> Value {
        let map = self.inner.contexts.lock().expect("contexts poisoned");
        let streams: Vec<Value> = map
            .values()
            .map(|ctx| {
                json!({
                    "context_id": ctx.context_id,
                    "stopping": ctx.stopping(),
                    "streaming_tasks": ctx.streaming_tasks.load(Ordering::Relaxed),
                    "subscribers": ctx.subscriber_count(),
                    "frames_published": ctx.frames_published.load(Ordering::Relaxed),
                })
            })
            .collect();
        json!({ "streams": streams, "count": map.len() })
    }
}

fn open_reader(name: &str) -> Result<shm::ShmFrameReader, ApiError> {
    shm::ShmFrameReader::open(name).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => ApiError::NotFound,
        io::ErrorKind::Unsupported => ApiError::BadRequest(
            "video streaming is not supported on this platform".into(),
        ),
        _ => {
            warn!(shm = %name, err = %e, "failed to open frame ring");
            ApiError::Internal
        }
    })
}

/// RAII guard for a context's streaming-task counter. The last task out of
/// a stopping context removes it from the registry.
struct StreamTaskGuard {
    inner: Arc<VideoInner>,
    ctx: Arc<StreamContext>,
}

impl StreamTaskGuard {
    fn enter(inner: Arc<VideoInner>, ctx: Arc<StreamContext>) -> Self {
        ctx.streaming_tasks.fetch_add(1, Ordering::AcqRel);
        Self { inner, ctx }
    }
}

impl Drop for StreamTaskGuard {
    fn drop(&mut self) {
        let remaining = self.ctx.streaming_tasks.fetch_sub(1, Ordering::AcqRel) - 1;
        if remaining == 0 && self.ctx.stopping() {
            self.inner
                .contexts
                .lock()
                .expect("contexts poisoned")
                .remove(&self.ctx.context_id);
            debug!(context = %self.ctx.context_id, "last streaming task out — context removed");
        }
    }
}

/// Drive one MJPEG client. Each client owns its reader so slow consumers
/// pace themselves without stealing frames from others.
async fn mjpeg_task(
    inner: Arc<VideoInner>,
    ctx: Arc<StreamContext>,
    mut reader: shm::ShmFrameReader,
    tx: mpsc::Sender<Result<Bytes, io::Error>>,
) {
    let _guard = StreamTaskGuard::enter(inner.clone(), ctx.clone());
    let frame_timeout = Duration::from_millis(inner.cfg.frame_timeout_ms);
    let poll = Duration::from_millis(inner.cfg.poll_interval_ms);

    loop {
        if ctx.stopping() {
            break;
        }
        if !reader.wait_with(frame_timeout, poll).await {
            // Timeout or writer inactive — either way this stream is done.
            break;
        }
        let Some(frame) = reader.read() else { continue };
        let part = mjpeg::encode_part(&frame.data);
        inner.stats.video_frames_sent.fetch_add(1, Ordering::Relaxed);
        inner
            .stats
            .video_bytes_sent
            .fetch_add(part.len() as u64, Ordering::Relaxed);
        if tx.send(Ok(part)).await.is_err() {
            // Client disconnected.
            break;
        }
    }
    let (read, missed) = reader.stats();
    debug!(context = %ctx.context_id, frames = read, missed, "mjpeg stream ended");
}

/// Copy every new frame to every WebSocket subscriber. A subscriber whose
/// queue is full loses that frame; nobody blocks the publisher.
async fn publisher_task(inner: Arc<VideoInner>, ctx: Arc<StreamContext>) {
    let _guard = StreamTaskGuard::enter(inner.clone(), ctx.clone());
    let frame_timeout = Duration::from_millis(inner.cfg.frame_timeout_ms);
    let poll = Duration::from_millis(inner.cfg.poll_interval_ms);
    let name = shm::shm_name_for_context(&ctx.context_id);

    // The ring may not exist yet right after startVideo — retry briefly.
    let mut reader = None;
    let open_deadline = tokio::time::Instant::now() + PUBLISHER_OPEN_LIMIT;
    while reader.is_none() {
        match shm::ShmFrameReader::open(&name) {
            Ok(r) => reader = Some(r),
            Err(_) if tokio::time::Instant::now() < open_deadline && !ctx.stopping() => {
                tokio::time::sleep(PUBLISHER_OPEN_RETRY).await;
            }
            Err(e) => {
                warn!(context = %ctx.context_id, err = %e, "publisher could not open frame ring");
                ctx.publisher_running.store(false, Ordering::Release);
                return;
            }
        }
    }
    let mut reader = reader.expect("reader opened");

    loop {
        if ctx.stopping() || ctx.subscriber_count() == 0 {
            break;
        }
        if !reader.wait_with(frame_timeout, poll).await {
            if !reader.is_active() {
                break;
            }
            continue;
        }
        let Some(frame) = reader.read() else { continue };
        let payload = Bytes::from(frame.data);
        ctx.frames_published.fetch_add(1, Ordering::Relaxed);

        let mut subs = ctx.subscribers.lock().expect("subscribers poisoned");
        fanout_frame(&mut subs, &payload, &inner.stats);
    }

    ctx.publisher_running.store(false, Ordering::Release);
    debug!(context = %ctx.context_id, "video publisher exited");
}

/// Deliver one frame to each subscriber without blocking: full queues drop
/// the frame for that subscriber, closed queues drop the subscriber.
fn fanout_frame(subs: &mut Vec<Subscriber>, payload: &Bytes, stats: &GatewayStats) -> usize {
    let mut delivered = 0;
    subs.retain(|sub| match sub.tx.try_send(payload.clone()) {
        Ok(()) => {
            delivered += 1;
            stats.video_frames_sent.fetch_add(1, Ordering::Relaxed);
            stats
                .video_bytes_sent
                .fetch_add(payload.len() as u64, Ordering::Relaxed);
            true
        }
        Err(mpsc::error::TrySendError::Full(_)) => {
            stats.video_frames_dropped.fetch_add(1, Ordering::Relaxed);
            true
        }
        Err(mpsc::error::TrySendError::Closed(_)) => false,
    });
    delivered
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VideoConfig;

    fn test_streams() -> VideoStreams {
        VideoStreams::new(
            VideoConfig {
                frame_timeout_ms: 100,
                poll_interval_ms: 5,
            },
            Arc::new(GatewayStats::new()),
        )
    }

    #[tokio::test]
    async fn fanout_drops_for_slow_subscriber_only() {
        let stats = GatewayStats::new();
        let (fast_tx, mut fast_rx) = mpsc::channel::<Bytes>(8);
        let (slow_tx, mut slow_rx) = mpsc::channel::<Bytes>(1);
        let mut subs = vec![
            Subscriber {
                conn_id: 1,
                tx: fast_tx,
            },
            Subscriber {
                conn_id: 2,
                tx: slow_tx,
            },
        ];

        let frame = Bytes::from_static(b"frame");
        // First frame reaches both; the slow queue is now full.
        assert_eq!(fanout_frame(&mut subs, &frame, &stats), 2);
        // Next three frames only reach the fast subscriber.
        for _ in 0..3 {
            assert_eq!(fanout_frame(&mut subs, &frame, &stats), 1);
        }
        assert_eq!(subs.len(), 2, "slow subscriber stays attached");
        assert_eq!(stats.video_frames_dropped.load(Ordering::Relaxed), 3);

        let mut fast_count = 0;
        while fast_rx.try_recv().is_ok() {
            fast_count += 1;
        }
        let mut slow_count = 0;
        while slow_rx.try_recv().is_ok() {
            slow_count += 1;
        }
        assert_eq!(fast_count, 4);
        assert_eq!(slow_count, 1);
    }

    #[tokio::test]
    async fn fanout_detaches_closed_subscribers() {
        let stats = GatewayStats::new();
        let (tx, rx) = mpsc::channel::<Bytes>(1);
        drop(rx);
        let mut subs = vec![Subscriber { conn_id: 9, tx }];
        fanout_frame(&mut subs, &Bytes::from_static(b"x"), &stats);
        assert!(subs.is_empty());
    }

    #[tokio::test]
    async fn unsubscribe_removes_connection_everywhere() {
        let streams = test_streams();
        let (tx, _rx) = mpsc::channel(8);
        streams.subscribe("ctx-a", 7, tx.clone());
        streams.subscribe("ctx-b", 7, tx);
        let ctx_a = streams.context("ctx-a", false).unwrap();
        let ctx_b = streams.context("ctx-b", false).unwrap();
        assert_eq!(ctx_a.subscriber_count(), 1);
        assert_eq!(ctx_b.subscriber_count(), 1);

        streams.unsubscribe(7);
        assert_eq!(ctx_a.subscriber_count(), 0);
        assert_eq!(ctx_b.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn list_reports_contexts() {
        let streams = test_streams();
        let (tx, _rx) = mpsc::channel(8);
        streams.subscribe("ctx-list", 1, tx);
        let doc = streams.list();
        assert_eq!(doc["count"], 1);
        assert_eq!(doc["streams"][0]["context_id"], "ctx-list");
    }
}
