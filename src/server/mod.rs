//! Listener, supervisor, and the HTTP request pipeline.
//!
//! The accept loop owns admission at the connection level (connection cap,
//! accept-rate limiting per IP) and hands each socket to a task that serves
//! it through the axum router via hyper's auto builder, with upgrades
//! enabled so `/ws` and MJPEG streaming share the port. Request-level
//! admission (IP allow-list → rate limit → auth) runs as middleware in the
//! order the pipeline specifies.

pub mod routes;

use crate::error::ApiError;
use crate::AppContext;
use anyhow::{Context, Result};
use axum::extract::{DefaultBodyLimit, Request, State};
use axum::http::{header, HeaderValue, Method};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, Semaphore};
use tower::ServiceExt;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::{debug, error, info, warn};

/// Maximum request body (16 MiB), matching the wire-codec contract.
const MAX_BODY_SIZE: usize = 16 * 1024 * 1024;
/// Max new connections per IP per minute at the accept loop.
const MAX_ACCEPTS_PER_MIN: usize = 600;
/// How long a crashed browser must stay down before the supervisor
/// restarts it again.
const RESTART_BACKOFF: Duration = Duration::from_secs(30);

/// Client address recorded by the accept loop, read by the admission
/// middleware. A request without one (router driven directly in tests)
/// counts as loopback.
#[derive(Debug, Clone, Copy)]
pub struct PeerIp(pub IpAddr);

// ─── Router assembly ─────────────────────────────────────────────────────────

pub fn build_router(ctx: Arc<AppContext>) -> Router {
    let mut router = Router::new()
        .route("/health", get(routes::health::health))
        .route("/stats", get(routes::stats::stats))
        .route("/tools", get(routes::tools::list_tools))
        .route("/tools/{name}", get(routes::tools::get_tool))
        .route("/execute/{tool}", post(routes::tools::execute))
        .route("/command", post(routes::command::command))
        .route("/video/frame/{ctx}", get(routes::video::frame))
        .route("/video/stream/{ctx}", get(routes::video::stream))
        .route("/video/streams", get(routes::video::list))
        .route("/video/start/{ctx}", post(routes::video::start))
        .route("/video/stop/{ctx}", post(routes::video::stop))
        .route("/ws", get(crate::ws::ws_handler))
        .fallback(fallback_not_found)
        .layer(middleware::from_fn_with_state(ctx.clone(), admission))
        .layer(DefaultBodyLimit::max(MAX_BODY_SIZE));

    if ctx.config.cors.enabled {
        router = router.layer(cors_layer(&ctx.config.cors));
    }
    router.with_state(ctx)
}

async fn fallback_not_found() -> ApiError {
    ApiError::NotFound
}

fn cors_layer(cfg: &crate::config::CorsConfig) -> CorsLayer {
    let mut layer = CorsLayer::new()
        .max_age(Duration::from_secs(cfg.max_age_seconds));

    layer = if cfg.origins.trim() == "*" {
        layer.allow_origin(Any)
    } else {
        let origins: Vec<HeaderValue> = cfg
            .origins
            .split(',')
            .filter_map(|o| o.trim().parse().ok())
            .collect();
        layer.allow_origin(AllowOrigin::list(origins))
    };

    let methods: Vec<Method> = cfg
        .methods
        .split(',')
        .filter_map(|m| m.trim().parse().ok())
        .collect();
    layer = layer.allow_methods(methods);

    let headers: Vec<axum::http::HeaderName> = cfg
        .headers
        .split(',')
        .filter_map(|h| h.trim().parse().ok())
        .collect();
    layer.allow_headers(headers)
}

// ─── Admission middleware ────────────────────────────────────────────────────

fn is_public_path(path: &str) -> bool {
    path == "/health"
}

/// IP allow-list → rate limit → auth, in that order, then the handler.
/// Also the stats tap: every response is counted with its latency.
async fn admission(
    State(ctx): State<Arc<AppContext>>,
    mut req: Request,
    next: Next,
) -> Response {
    let started = Instant::now();
    if let Some(n) = content_length(req.headers()) {
        ctx.stats.bytes_in.fetch_add(n, Ordering::Relaxed);
    }

    let response = match admission_check(&ctx, &mut req) {
        Ok(()) => next.run(req).await,
        Err(e) => e.into_response(),
    };

    if let Some(n) = content_length(response.headers()) {
        ctx.stats.bytes_out.fetch_add(n, Ordering::Relaxed);
    }
    ctx.stats.record_response(
        response.status().as_u16(),
        started.elapsed().as_millis() as u64,
    );
    response
}

fn content_length(headers: &axum::http::HeaderMap) -> Option<u64> {
    headers
        .get(header::CONTENT_LENGTH)?
        .to_str()
        .ok()?
        .parse()
        .ok()
}

fn admission_check(ctx: &AppContext, req: &mut Request) -> Result<(), ApiError> {
    // Preflight never carries credentials; the CORS layer answers it.
    if req.method() == Method::OPTIONS {
        return Ok(());
    }

    let peer = req
        .extensions()
        .get::<PeerIp>()
        .map(|p| p.0)
        .unwrap_or(IpAddr::V4(std::net::Ipv4Addr::LOCALHOST));

    if !ctx.allow_list.check(peer) {
        ctx.stats.ip_denied.fetch_add(1, Ordering::Relaxed);
        return Err(ApiError::Forbidden("IP address not allowed".into()));
    }

    if ctx.rate_limiter.is_enabled() {
        let verdict = ctx.rate_limiter.check(peer);
        if !verdict.allowed {
            ctx.stats.rate_limited.fetch_add(1, Ordering::Relaxed);
            return Err(ApiError::RateLimited {
                retry_after: verdict.retry_after,
                limit: verdict.limit,
                reset_at: verdict.reset_at,
            });
        }
    }

    if !is_public_path(req.uri().path()) {
        let authorization = req
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok());
        let cookie = req
            .headers()
            .get(header::COOKIE)
            .and_then(|v| v.to_str().ok());
        let identity = ctx.auth.validate(authorization, cookie).map_err(|e| {
            ctx.stats.auth_failures.fetch_add(1, Ordering::Relaxed);
            e
        })?;
        req.extensions_mut().insert(identity);
    }
    Ok(())
}

// ─── Accept loop & supervisor ────────────────────────────────────────────────

/// Bind and serve until SIGINT/SIGTERM.
pub async fn run(ctx: Arc<AppContext>) -> Result<()> {
    let addr = format!("{}:{}", ctx.config.host, ctx.config.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(addr = %addr, "gateway listening");
    serve(ctx, listener).await
}

/// Serve on an already-bound listener (tests bind port 0 themselves).
pub async fn serve(ctx: Arc<AppContext>, listener: TcpListener) -> Result<()> {
    let router = build_router(ctx.clone());
    let permits = Arc::new(Semaphore::new(ctx.config.max_connections));
    let accept_limiter = Arc::new(Mutex::new(AcceptRateLimiter::new()));

    spawn_maintenance(ctx.clone());
    spawn_browser_supervisor(ctx.clone());

    let shutdown = make_shutdown_future();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            biased;

            _ = &mut shutdown => {
                info!("shutdown signal received — stopping listener");
                break;
            }

            conn = listener.accept() => {
                let (stream, peer) = match conn {
                    Ok(c) => c,
                    Err(e) => {
                        error!(err = %e, "accept error");
                        continue;
                    }
                };

                {
                    let mut limiter = accept_limiter.lock().await;
                    if !limiter.check_and_record(peer.ip()) {
                        ctx.stats.connections_rejected.fetch_add(1, Ordering::Relaxed);
                        warn!(peer = %peer, "accept rate exceeded — dropping connection");
                        drop(stream);
                        continue;
                    }
                }

                // Connection cap: the bounded-queue-full signal of the
                // pipeline. Rejected sockets get a minimal 503.
                let permit = match permits.clone().try_acquire_owned() {
                    Ok(p) => p,
                    Err(_) => {
                        ctx.stats.connections_rejected.fetch_add(1, Ordering::Relaxed);
                        tokio::spawn(reject_overloaded(stream));
                        continue;
                    }
                };

                ctx.stats.connections_total.fetch_add(1, Ordering::Relaxed);
                let router = router.clone();
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    let _permit = permit;
                    serve_connection(stream, peer.ip(), router, ctx).await;
                });
            }
        }
    }

    drop(listener);

    if ctx.config.graceful_shutdown {
        let deadline = Instant::now() + Duration::from_secs(ctx.config.shutdown_timeout_sec);
        while ctx.stats.active_connections.load(Ordering::Acquire) > 0
            && Instant::now() < deadline
        {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        let remaining = ctx.stats.active_connections.load(Ordering::Acquire);
        if remaining > 0 {
            warn!(remaining, "shutdown timeout — abandoning open connections");
        }
    }

    ctx.ipc.stop().await;
    info!("gateway stopped");
    Ok(())
}

async fn serve_connection(
    stream: TcpStream,
    peer: IpAddr,
    router: Router,
    ctx: Arc<AppContext>,
) {
    ctx.stats.active_connections.fetch_add(1, Ordering::AcqRel);

    let service = hyper::service::service_fn(move |request: hyper::Request<hyper::body::Incoming>| {
        let router = router.clone();
        async move {
            let mut request = request.map(axum::body::Body::new);
            request.extensions_mut().insert(PeerIp(peer));
            router.oneshot(request).await
        }
    });

    let mut builder = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new());
    builder
        .http1()
        .timer(TokioTimer::new())
        .header_read_timeout(Duration::from_millis(ctx.config.request_timeout_ms));

    if let Err(e) = builder
        .serve_connection_with_upgrades(TokioIo::new(stream), service)
        .await
    {
        debug!(peer = %peer, err = %e, "connection ended with error");
    }

    ctx.stats.active_connections.fetch_sub(1, Ordering::AcqRel);
}

/// Minimal raw 503 for sockets past the connection cap; never touches the
/// router.
async fn reject_overloaded(mut stream: TcpStream) {
    let body = r#"{"success":false,"status":503,"error":"connection capacity reached"}"#;
    let response = format!(
        "HTTP/1.1 503 Service Unavailable\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    );
    let _ = stream.write_all(response.as_bytes()).await;
}

/// Returns a future that resolves when a shutdown signal is received.
///
/// On Unix we listen for SIGTERM *and* Ctrl-C; elsewhere Ctrl-C only.
async fn make_shutdown_future() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.ok();
    }
}

/// Periodic housekeeping: rate-limit bucket eviction.
fn spawn_maintenance(ctx: Arc<AppContext>) {
    let period = Duration::from_secs(ctx.config.rate_limit.window_seconds.clamp(5, 300));
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(period);
        tick.tick().await;
        loop {
            tick.tick().await;
            ctx.rate_limiter.sweep();
        }
    });
}

/// Restart a crashed browser, at most once per backoff window. Explicit
/// stops leave the state at `Stopped` and are never overridden here.
fn spawn_browser_supervisor(ctx: Arc<AppContext>) {
    if ctx.config.browser_path.is_none() {
        return;
    }
    tokio::spawn(async move {
        let mut last_restart: Option<Instant> = None;
        loop {
            tokio::time::sleep(Duration::from_secs(1)).await;
            if ctx.ipc.state() != crate::ipc::BrowserState::Error {
                continue;
            }
            let recently = last_restart
                .map(|t| t.elapsed() < RESTART_BACKOFF)
                .unwrap_or(false);
            if recently {
                continue;
            }
            warn!("browser is down — supervisor restarting it");
            last_restart = Some(Instant::now());
            if let Err(e) = ctx.ipc.restart().await {
                error!(err = %e, "browser restart failed");
            }
        }
    });
}

/// Per-IP accept-rate tracker (sliding one-minute window).
struct AcceptRateLimiter {
    accepts: HashMap<IpAddr, Vec<Instant>>,
}

impl AcceptRateLimiter {
    fn new() -> Self {
        Self {
            accepts: HashMap::new(),
        }
    }

    fn check_and_record(&mut self, ip: IpAddr) -> bool {
        let now = Instant::now();
        let one_min_ago = now - Duration::from_secs(60);
        let timestamps = self.accepts.entry(ip).or_default();
        timestamps.retain(|t| *t > one_min_ago);
        if timestamps.len() >= MAX_ACCEPTS_PER_MIN {
            return false;
        }
        timestamps.push(now);
        true
    }
}
