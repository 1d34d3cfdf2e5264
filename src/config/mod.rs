use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::error;

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 8080;
const DEFAULT_MAX_CONNECTIONS: usize = 100;
const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_BROWSER_TIMEOUT_MS: u64 = 60_000;
const DEFAULT_SHUTDOWN_TIMEOUT_SEC: u64 = 30;

const DEFAULT_RATE_LIMIT_REQUESTS: u64 = 100;
const DEFAULT_RATE_LIMIT_WINDOW_SEC: u64 = 60;
const DEFAULT_RATE_LIMIT_BURST: u64 = 20;

const DEFAULT_CORS_ORIGINS: &str = "*";
const DEFAULT_CORS_METHODS: &str = "GET,POST,PUT,DELETE,OPTIONS";
const DEFAULT_CORS_HEADERS: &str = "Content-Type,Authorization";
const DEFAULT_CORS_MAX_AGE_SEC: u64 = 86_400;

const DEFAULT_JWT_CLOCK_SKEW_SEC: u64 = 60;

const DEFAULT_WS_MAX_CONNECTIONS: usize = 50;
const DEFAULT_WS_MAX_MESSAGE: usize = 16 * 1024 * 1024;
const DEFAULT_WS_PING_INTERVAL_SEC: u64 = 30;
const DEFAULT_WS_PONG_TIMEOUT_SEC: u64 = 10;

const DEFAULT_VIDEO_FRAME_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_VIDEO_POLL_INTERVAL_MS: u64 = 50;

// ─── Authentication mode ──────────────────────────────────────────────────────

/// The two mutually-exclusive authentication modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    /// Static bearer token compared in constant time.
    Token,
    /// RS256/RS384/RS512 JWT verified against a configured public key.
    Jwt,
}

// ─── Config sections ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct JwtSection {
    /// Path to the RSA public key (.pem) used for verification.
    pub public_key: Option<PathBuf>,
    /// Path to the RSA private key (.pem); only needed for token minting.
    pub private_key: Option<PathBuf>,
    /// RS256, RS384, or RS512.
    pub algorithm: Option<String>,
    /// Expected `iss` claim (exact match when set).
    pub issuer: Option<String>,
    /// Expected `aud` claim (exact match when set).
    pub audience: Option<String>,
    /// Allowed clock skew for `exp`/`nbf` in seconds.
    pub clock_skew: Option<u64>,
    /// Require the `exp` claim to be present.
    pub require_exp: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct RateLimitSection {
    pub enabled: Option<bool>,
    pub requests_per_window: Option<u64>,
    pub window_seconds: Option<u64>,
    pub burst: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct IpWhitelistSection {
    pub enabled: Option<bool>,
    /// Single addresses or CIDR ranges; IPv4 and IPv6 both accepted.
    pub entries: Option<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct CorsSection {
    pub enabled: Option<bool>,
    /// Comma-separated origins, or "*".
    pub origins: Option<String>,
    pub methods: Option<String>,
    pub headers: Option<String>,
    pub max_age: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct WebSocketSection {
    pub enabled: Option<bool>,
    pub max_connections: Option<usize>,
    pub max_message: Option<usize>,
    pub ping_interval: Option<u64>,
    pub pong_timeout: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct VideoSection {
    pub frame_timeout_ms: Option<u64>,
    pub poll_interval_ms: Option<u64>,
}

/// `owld.toml` — every field is an optional override.
/// Priority: CLI / env var  >  TOML  >  built-in default.
#[derive(Deserialize, Default)]
#[serde(default)]
struct TomlConfig {
    host: Option<String>,
    port: Option<u16>,
    browser_path: Option<PathBuf>,
    auth_mode: Option<AuthMode>,
    auth_token: Option<String>,
    max_connections: Option<usize>,
    request_timeout_ms: Option<u64>,
    browser_timeout_ms: Option<u64>,
    graceful_shutdown: Option<bool>,
    shutdown_timeout_sec: Option<u64>,
    log: Option<String>,
    jwt: JwtSection,
    rate_limit: RateLimitSection,
    ip_whitelist: IpWhitelistSection,
    cors: CorsSection,
    websocket: WebSocketSection,
    video: VideoSection,
}

fn load_toml(path: &Path) -> Option<TomlConfig> {
    let contents = std::fs::read_to_string(path).ok()?;
    match toml::from_str::<TomlConfig>(&contents) {
        Ok(cfg) => Some(cfg),
        Err(e) => {
            error!(path = %path.display(), err = %e, "failed to parse config file — using defaults");
            None
        }
    }
}

// ─── Resolved configuration ───────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct JwtConfig {
    pub public_key: Option<PathBuf>,
    pub private_key: Option<PathBuf>,
    pub algorithm: String,
    pub issuer: Option<String>,
    pub audience: Option<String>,
    pub clock_skew_seconds: u64,
    pub require_exp: bool,
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub requests_per_window: u64,
    pub window_seconds: u64,
    pub burst: u64,
}

#[derive(Debug, Clone)]
pub struct IpWhitelistConfig {
    pub enabled: bool,
    pub entries: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct CorsConfig {
    pub enabled: bool,
    pub origins: String,
    pub methods: String,
    pub headers: String,
    pub max_age_seconds: u64,
}

#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    pub enabled: bool,
    pub max_connections: usize,
    pub max_message: usize,
    pub ping_interval_sec: u64,
    pub pong_timeout_sec: u64,
}

#[derive(Debug, Clone)]
pub struct VideoConfig {
    pub frame_timeout_ms: u64,
    pub poll_interval_ms: u64,
}

/// Fully-resolved gateway configuration, shared read-only after startup.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    /// Path to the browser binary. Empty means "run without a browser"
    /// (health endpoint still works; browser routes return 503).
    pub browser_path: Option<PathBuf>,
    pub auth_mode: AuthMode,
    pub auth_token: String,
    pub max_connections: usize,
    pub request_timeout_ms: u64,
    pub browser_timeout_ms: u64,
    pub graceful_shutdown: bool,
    pub shutdown_timeout_sec: u64,
    pub log: String,
    pub jwt: JwtConfig,
    pub rate_limit: RateLimitConfig,
    pub ip_whitelist: IpWhitelistConfig,
    pub cors: CorsConfig,
    pub websocket: WebSocketConfig,
    pub video: VideoConfig,
}

/// CLI / env overrides passed in from clap. Each `Some` wins over TOML.
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub auth_token: Option<String>,
    pub browser_path: Option<PathBuf>,
    pub log: Option<String>,
}

impl GatewayConfig {
    /// Build config from CLI/env overrides + optional TOML file.
    pub fn new(config_file: Option<&Path>, ov: Overrides) -> Self {
        let toml = config_file
            .and_then(load_toml)
            .unwrap_or_default();

        let host = ov
            .host
            .or(toml.host)
            .unwrap_or_else(|| DEFAULT_HOST.to_string());
        let port = ov.port.or(toml.port).unwrap_or(DEFAULT_PORT);
        let browser_path = ov.browser_path.or(toml.browser_path);
        let auth_mode = toml.auth_mode.unwrap_or(AuthMode::Token);
        let auth_token = ov.auth_token.or(toml.auth_token).unwrap_or_default();
        let log = ov.log.or(toml.log).unwrap_or_else(|| "info".to_string());

        Self {
            host,
            port,
            browser_path,
            auth_mode,
            auth_token,
            max_connections: toml.max_connections.unwrap_or(DEFAULT_MAX_CONNECTIONS),
            request_timeout_ms: toml
                .request_timeout_ms
                .unwrap_or(DEFAULT_REQUEST_TIMEOUT_MS),
            browser_timeout_ms: toml
                .browser_timeout_ms
                .unwrap_or(DEFAULT_BROWSER_TIMEOUT_MS),
            graceful_shutdown: toml.graceful_shutdown.unwrap_or(true),
            shutdown_timeout_sec: toml
                .shutdown_timeout_sec
                .unwrap_or(DEFAULT_SHUTDOWN_TIMEOUT_SEC),
            log,
            jwt: JwtConfig {
                public_key: toml.jwt.public_key,
                private_key: toml.jwt.private_key,
                algorithm: toml.jwt.algorithm.unwrap_or_else(|| "RS256".to_string()),
                issuer: toml.jwt.issuer,
                audience: toml.jwt.audience,
                clock_skew_seconds: toml.jwt.clock_skew.unwrap_or(DEFAULT_JWT_CLOCK_SKEW_SEC),
                require_exp: toml.jwt.require_exp.unwrap_or(true),
            },
            rate_limit: RateLimitConfig {
                enabled: toml.rate_limit.enabled.unwrap_or(false),
                requests_per_window: toml
                    .rate_limit
                    .requests_per_window
                    .unwrap_or(DEFAULT_RATE_LIMIT_REQUESTS),
                window_seconds: toml
                    .rate_limit
                    .window_seconds
                    .unwrap_or(DEFAULT_RATE_LIMIT_WINDOW_SEC),
                burst: toml.rate_limit.burst.unwrap_or(DEFAULT_RATE_LIMIT_BURST),
            },
            ip_whitelist: IpWhitelistConfig {
                enabled: toml.ip_whitelist.enabled.unwrap_or(false),
                entries: toml.ip_whitelist.entries.unwrap_or_default(),
            },
            cors: CorsConfig {
                enabled: toml.cors.enabled.unwrap_or(true),
                origins: toml
                    .cors
                    .origins
                    .unwrap_or_else(|| DEFAULT_CORS_ORIGINS.to_string()),
                methods: toml
                    .cors
                    .methods
                    .unwrap_or_else(|| DEFAULT_CORS_METHODS.to_string()),
                headers: toml
                    .cors
                    .headers
                    .unwrap_or_else(|| DEFAULT_CORS_HEADERS.to_string()),
                max_age_seconds: toml.cors.max_age.unwrap_or(DEFAULT_CORS_MAX_AGE_SEC),
            },
            websocket: WebSocketConfig {
                enabled: toml.websocket.enabled.unwrap_or(true),
                max_connections: toml
                    .websocket
                    .max_connections
                    .unwrap_or(DEFAULT_WS_MAX_CONNECTIONS),
                max_message: toml.websocket.max_message.unwrap_or(DEFAULT_WS_MAX_MESSAGE),
                ping_interval_sec: toml
                    .websocket
                    .ping_interval
                    .unwrap_or(DEFAULT_WS_PING_INTERVAL_SEC),
                pong_timeout_sec: toml
                    .websocket
                    .pong_timeout
                    .unwrap_or(DEFAULT_WS_PONG_TIMEOUT_SEC),
            },
            video: VideoConfig {
                frame_timeout_ms: toml
                    .video
                    .frame_timeout_ms
                    .unwrap_or(DEFAULT_VIDEO_FRAME_TIMEOUT_MS),
                poll_interval_ms: toml
                    .video
                    .poll_interval_ms
                    .unwrap_or(DEFAULT_VIDEO_POLL_INTERVAL_MS),
            },
        }
    }

    /// Startup validation. Returns every problem at once so an operator can
    /// fix a config file in one pass.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut problems = Vec::new();

        if self.auth_mode == AuthMode::Jwt && self.jwt.public_key.is_none() {
            problems.push("auth_mode = \"jwt\" requires jwt.public_key".to_string());
        }
        if !matches!(self.jwt.algorithm.as_str(), "RS256" | "RS384" | "RS512") {
            problems.push(format!(
                "jwt.algorithm must be RS256, RS384, or RS512 (got {})",
                self.jwt.algorithm
            ));
        }
        if self.rate_limit.enabled && self.rate_limit.window_seconds == 0 {
            problems.push("rate_limit.window_seconds must be > 0".to_string());
        }
        if self.ip_whitelist.enabled {
            for entry in &self.ip_whitelist.entries {
                if crate::admission::ip_filter::parse_entry(entry).is_none() {
                    problems.push(format!("ip_whitelist entry is not an IP or CIDR: {entry}"));
                }
            }
        }
        if self.max_connections == 0 {
            problems.push("max_connections must be > 0".to_string());
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(problems)
        }
    }
}

/// Example config emitted by `owld generate-config`.
pub fn example_toml() -> &'static str {
    r#"# owld — Owl Browser Gateway configuration

host = "127.0.0.1"
port = 8080
browser_path = "/opt/owl/owl_browser"
auth_mode = "token"          # "token" or "jwt"
auth_token = "change-me"
max_connections = 100
request_timeout_ms = 30000
browser_timeout_ms = 60000
graceful_shutdown = true
shutdown_timeout_sec = 30
log = "info"

[jwt]
# public_key = "/etc/owld/jwt_pub.pem"
# algorithm = "RS256"
# issuer = "https://auth.example.org"
# audience = "owl-gateway"
clock_skew = 60
require_exp = true

[rate_limit]
enabled = false
requests_per_window = 100
window_seconds = 60
burst = 20

[ip_whitelist]
enabled = false
entries = ["127.0.0.1", "10.0.0.0/8", "::1"]

[cors]
enabled = true
origins = "*"
methods = "GET,POST,PUT,DELETE,OPTIONS"
headers = "Content-Type,Authorization"
max_age = 86400

[websocket]
enabled = true
max_connections = 50
max_message = 16777216
ping_interval = 30
pong_timeout = 10

[video]
frame_timeout_ms = 5000
poll_interval_ms = 50
"#
}
