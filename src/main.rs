use anyhow::Result;
use clap::{Parser, Subcommand};
use owld::config::{self, GatewayConfig, Overrides};
use owld::{server, AppContext};
use std::path::PathBuf;
use tracing::{info, warn};

#[derive(Parser)]
#[command(
    name = "owld",
    about = "Owl Browser Gateway — HTTP/WebSocket automation daemon",
    version
)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Path to a TOML config file
    #[arg(short = 'c', long, env = "OWL_HTTP_CONFIG")]
    config: Option<PathBuf>,

    /// Bind address
    #[arg(long, env = "OWL_HTTP_HOST")]
    host: Option<String>,

    /// Bind port
    #[arg(long, env = "OWL_HTTP_PORT")]
    port: Option<u16>,

    /// Bearer token for API authentication
    #[arg(long, env = "OWL_HTTP_TOKEN")]
    token: Option<String>,

    /// Path to the browser binary
    #[arg(long, env = "OWL_BROWSER_PATH")]
    browser: Option<PathBuf>,

    /// Log level filter (trace, debug, info, warn, error)
    #[arg(long, env = "OWL_HTTP_LOG")]
    log: Option<String>,

    /// Write logs to this file path (rotated daily). Optional.
    #[arg(long, env = "OWL_HTTP_LOG_FILE")]
    log_file: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Start the gateway server (default when no subcommand given).
    Serve,
    /// Write an example config file and exit.
    ///
    /// Examples:
    ///   owld generate-config /etc/owld/owld.toml
    GenerateConfig {
        /// Destination path for the example file
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Init once — must happen before any tracing calls.
    let log_level = args.log.clone().unwrap_or_else(|| "info".to_string());
    let _file_guard = init_tracing(&log_level, args.log_file.as_deref());

    match args.command {
        Some(Command::GenerateConfig { path }) => {
            std::fs::write(&path, config::example_toml())?;
            println!("wrote example config to {}", path.display());
            Ok(())
        }
        None | Some(Command::Serve) => run_server(args).await,
    }
}

async fn run_server(args: Args) -> Result<()> {
    info!(version = env!("CARGO_PKG_VERSION"), "owld starting");

    let overrides = Overrides {
        host: args.host,
        port: args.port,
        auth_token: args.token,
        browser_path: args.browser,
        log: args.log,
    };
    let config = GatewayConfig::new(args.config.as_deref(), overrides);

    if let Err(problems) = config.validate() {
        for p in &problems {
            eprintln!("config error: {p}");
        }
        std::process::exit(1);
    }

    info!(
        host = %config.host,
        port = config.port,
        auth_mode = ?config.auth_mode,
        rate_limit = config.rate_limit.enabled,
        ip_whitelist = config.ip_whitelist.enabled,
        "config loaded"
    );
    if config.auth_mode == config::AuthMode::Token && config.auth_token.is_empty() {
        warn!("no auth token configured — the API is open to anyone who can reach it");
    }

    let ctx = AppContext::new(config)?;

    match &ctx.config.browser_path {
        Some(path) => {
            if !path.exists() {
                warn!(browser = %path.display(), "browser binary not found — starting anyway");
            }
            if let Err(e) = ctx.ipc.start().await {
                warn!(err = %e, "browser failed to start — health endpoint stays up, browser routes return 503");
            }
        }
        None => {
            warn!("no browser binary configured — browser routes will return 503");
        }
    }

    server::run(ctx).await
}

/// Install the global tracing subscriber: a compact console layer, plus a
/// daily-rolling file layer when a log file is configured.
///
/// The file layer is best-effort. If its directory cannot be created the
/// gateway keeps running with console logging only, since losing the file
/// sink is not a reason to refuse to serve. The returned guard owns the
/// background file writer; hold it until exit or buffered lines are lost.
fn init_tracing(
    filter: &str,
    log_file: Option<&std::path::Path>,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    let (file_layer, guard) = match log_file.map(rolling_file_writer) {
        Some(Ok((writer, guard))) => {
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        Some(Err(e)) => {
            eprintln!("owld: log file unavailable ({e}); continuing with console logging only");
            (None, None)
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(filter))
        .with(tracing_subscriber::fmt::layer().compact())
        .with(file_layer)
        .init();

    guard
}

/// Open a non-blocking daily-rolling writer for `path`, creating parent
/// directories as needed.
fn rolling_file_writer(
    path: &std::path::Path,
) -> std::io::Result<(
    tracing_appender::non_blocking::NonBlocking,
    tracing_appender::non_blocking::WorkerGuard,
)> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => std::path::Path::new("."),
    };
    std::fs::create_dir_all(dir)?;
    let file_name = path
        .file_name()
        .map(std::ffi::OsStr::to_os_string)
        .unwrap_or_else(|| "owld.log".into());
    let appender = tracing_appender::rolling::daily(dir, file_name);
    Ok(tracing_appender::non_blocking(appender))
}
