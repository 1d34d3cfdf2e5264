pub mod admission;
pub mod auth;
pub mod config;
pub mod error;
pub mod ipc;
pub mod server;
pub mod stats;
pub mod tools;
pub mod video;
pub mod ws;

use admission::ip_filter::IpAllowList;
use admission::rate_limit::RateLimiter;
use anyhow::Result;
use auth::Authenticator;
use config::GatewayConfig;
use ipc::BrowserIpc;
use stats::GatewayStats;
use std::sync::Arc;
use std::time::{Duration, Instant};
use video::VideoStreams;
use ws::WsHub;

/// Shared gateway state passed to every handler and background task.
/// Built once at startup; tests instantiate it fresh with their own IPC
/// transport.
pub struct AppContext {
    pub config: Arc<GatewayConfig>,
    pub stats: Arc<GatewayStats>,
    pub auth: Authenticator,
    pub allow_list: IpAllowList,
    pub rate_limiter: RateLimiter,
    pub ipc: BrowserIpc,
    pub video: VideoStreams,
    pub ws_hub: WsHub,
    pub started_at: Instant,
}

impl AppContext {
    pub fn new(config: GatewayConfig) -> Result<Arc<Self>> {
        let ipc = BrowserIpc::new(
            config.browser_path.clone(),
            Duration::from_millis(config.browser_timeout_ms),
        );
        Self::with_ipc(config, ipc)
    }

    /// Build around an existing multiplexer (tests attach one over
    /// in-memory pipes).
    pub fn with_ipc(config: GatewayConfig, ipc: BrowserIpc) -> Result<Arc<Self>> {
        let stats = Arc::new(GatewayStats::new());
        let auth = Authenticator::from_config(&config)?;
        let allow_list =
            IpAllowList::from_config(&config.ip_whitelist).map_err(anyhow::Error::msg)?;
        let rate_limiter = RateLimiter::new(config.rate_limit.clone());
        let video = VideoStreams::new(config.video.clone(), stats.clone());

        Ok(Arc::new(Self {
            config: Arc::new(config),
            stats,
            auth,
            allow_list,
            rate_limiter,
            ipc,
            video,
            ws_hub: WsHub::new(),
            started_at: Instant::now(),
        }))
    }
}
