use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use colln_core::{DeviceType, ListFormat, Source};
use colln_storage::ensure_writable_dir;
use colln_sync::{shutdown_signal, CollectConfig, Collection, PortalRegistry, Scheduler};
use colln_web::{app, serve, AppState, APP_NAME};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "colln")]
#[command(about = "Collects portal news lists and article bodies on a schedule")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Collect news periodically.
    Coll(CollArgs),
    /// Serve the status page and summary API over a collect directory.
    Api(ApiArgs),
    /// Print the version.
    Version,
}

#[derive(Debug, Args)]
struct CollArgs {
    /// Collect news type (pc, mobile).
    #[arg(short = 't', long = "collect-type")]
    collect_type: DeviceType,

    /// News source (daum, naver).
    #[arg(short = 's', long = "collect-news-source")]
    source: Source,

    /// Save path for collected data.
    #[arg(short = 'd', long = "save-directory-path")]
    save_dir: PathBuf,

    /// Period between every news collection.
    #[arg(short = 'p', long = "collect-period", default_value = "10m", value_parser = humantime::parse_duration)]
    period: Duration,

    /// List output format of collected news (t, m, b).
    #[arg(short = 'f', long = "list-output-format", default_value = "b")]
    list_format: ListFormat,

    /// Collect news in non-headless mode.
    #[arg(short = 'n', long = "no-headless")]
    no_headless: bool,

    /// Continue collecting news ends when one fails.
    #[arg(short = 'e', long = "end-get-ignore-error")]
    ignore_body_errors: bool,

    /// Retry count while getting a news list.
    #[arg(short = 'l', long = "list-get-retry-count", default_value_t = 0)]
    list_retries: u32,

    /// Browserless endpoint, overrides COLLN_BROWSERLESS_URL.
    #[arg(long)]
    browserless_url: Option<String>,

    /// Browserless token, overrides COLLN_BROWSERLESS_TOKEN.
    #[arg(long)]
    browserless_token: Option<String>,

    /// Run chrome with --enable-logging.
    #[arg(long)]
    enable_chrome_logging: bool,

    /// Chrome --v verbosity when logging is enabled.
    #[arg(long, default_value_t = 1)]
    chrome_logging_verbosity: u8,

    /// Port of the metrics listener, overrides COLLN_METRICS_PORT.
    #[arg(long)]
    metrics_port: Option<u16>,

    /// YAML file overriding portal entry URLs, overrides COLLN_PORTALS_FILE.
    #[arg(long)]
    portals_file: Option<PathBuf>,
}

impl CollArgs {
    fn into_config(self) -> CollectConfig {
        let mut config = CollectConfig::from_env(self.source, self.collect_type, self.save_dir);
        config.period = self.period;
        config.list_format = self.list_format;
        config.ignore_body_errors = self.ignore_body_errors;
        config.list_retries = self.list_retries;
        config.browser.headless = !self.no_headless;
        config.browser.chrome_logging = self.enable_chrome_logging;
        config.browser.chrome_log_verbosity = self.chrome_logging_verbosity;
        if let Some(url) = self.browserless_url {
            config.browser.base_url = url;
        }
        if let Some(token) = self.browserless_token {
            config.browser.token = Some(token);
        }
        if let Some(port) = self.metrics_port {
            config.metrics_port = port;
        }
        if let Some(path) = self.portals_file {
            config.portals_file = Some(path);
        }
        config
    }
}

#[derive(Debug, Args)]
struct ApiArgs {
    /// Collect directory path for collected data.
    #[arg(short = 'd', long = "collect-directory", default_value = "coll_dir")]
    collect_dir: PathBuf,

    /// Port to listen on.
    #[arg(long, default_value_t = 8080)]
    port: u16,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();

    match cli.command {
        Commands::Coll(args) => coll(args.into_config()).await,
        Commands::Api(args) => api(args).await,
        Commands::Version => {
            println!("{APP_NAME}\nVersion: {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn coll(config: CollectConfig) -> Result<()> {
    ensure_writable_dir(&config.save_dir)
        .with_context(|| format!("save directory {} is not usable", config.save_dir.display()))?;

    let endpoints = match &config.portals_file {
        Some(path) => {
            let registry = PortalRegistry::load(path).await?;
            let endpoints = registry.endpoints_for(config.source, config.device);
            if endpoints.is_none() {
                warn!(path = %path.display(), source = %config.source, device = %config.device, "no portal override, using built-in entry URLs");
            }
            endpoints
        }
        None => None,
    };

    let mut collection = Collection::new(config)?;
    if let Some(endpoints) = endpoints {
        collection = collection.with_endpoints(endpoints);
    }
    let collection = Arc::new(collection);
    let config = collection.config().clone();

    let metrics_addr = SocketAddr::from(([0, 0, 0, 0], config.metrics_port));
    let router = app(AppState::new(&config.save_dir).with_metrics(collection.metrics()));
    tokio::spawn(async move {
        if let Err(err) = serve(metrics_addr, router, std::future::pending()).await {
            error!(error = %format!("{err:#}"), "metrics listener stopped");
        }
    });

    info!(
        source = %config.source,
        device = %config.device,
        period = %humantime::format_duration(config.period),
        save = %config.save_dir.display(),
        "starting news collection"
    );
    let summary = Scheduler::new(Arc::clone(&collection), config.period, config.drain_timeout)
        .run(shutdown_signal())
        .await?;
    info!(
        started = summary.runs_started,
        completed = summary.runs_completed,
        "news collection stopped"
    );
    Ok(())
}

async fn api(args: ApiArgs) -> Result<()> {
    let meta = tokio::fs::metadata(&args.collect_dir)
        .await
        .with_context(|| format!("collect-directory {} is not readable", args.collect_dir.display()))?;
    if !meta.is_dir() {
        bail!("collect-directory {} is not a directory", args.collect_dir.display());
    }

    let addr = SocketAddr::from(([0, 0, 0, 0], args.port));
    serve(addr, app(AppState::new(&args.collect_dir)), shutdown_signal()).await
}
