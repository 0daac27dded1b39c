use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tlsgate::cache::ResponseCache;
use tlsgate::compression::CompressionHandler;
use tlsgate::config::Config;
use tlsgate::config_reload::ConfigManager;
use tlsgate::logging::{self, LogFormat, ERRORS, REFRESH};
use tlsgate::metrics::MetricsCollector;
use tlsgate::proxy::{ProxyHandler, Transports};
use tlsgate::routing::Router;
use tlsgate::security::RateLimiterRegistry;
use tlsgate::server::{CertificateStore, HttpServer, RequestHandler, StatusServer};
use tlsgate::ssl_cert_gen::CertificateGenerator;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "tlsgate")]
#[command(about = "TLS-terminating reverse proxy with host based routing")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Args {
    /// Directory the config file and certificate directory are relative to
    #[arg(long, env = "TLSGATE_BASE_DIR")]
    base_dir: Option<PathBuf>,

    #[arg(short, long, env = "TLSGATE_CONFIG", default_value = "config.yaml")]
    config: PathBuf,

    /// Extra SAN for a generated certificate; `localhost` is always included
    #[arg(long = "cert-domain", default_value = "*.example.com")]
    cert_domains: Vec<String>,

    /// Seconds between config and certificate file checks
    #[arg(long, default_value_t = 5)]
    watch_interval: u64,

    #[arg(long, default_value = "127.0.0.1:61147")]
    status_listen: SocketAddr,

    #[arg(long)]
    no_status_page: bool,

    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[arg(short = 't', long)]
    test_config: bool,

    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    logging::init_logging(args.verbose, args.log_format)?;

    let base_dir = match args.base_dir {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to determine working directory")?,
    };
    let config_path = base_dir.join(&args.config);

    if args.test_config {
        let config = Config::load(&config_path)?;
        config.validate()?;
        println!("Configuration {} is valid", config_path.display());
        return Ok(());
    }

    let (config, created) = Config::load_or_create(&config_path)
        .with_context(|| format!("Failed to load configuration {}", config_path.display()))?;
    if created {
        info!(target: REFRESH, "Wrote default configuration to {}", config_path.display());
    }
    config.validate().context("Invalid configuration")?;

    let http_addr = config.http_listen_addr()?;
    let https_addr = config.https_listen_addr()?;

    let cert_paths = config.certificate_paths(&base_dir);
    CertificateGenerator::ensure_certificates_exist(&cert_paths, &args.cert_domains)
        .await
        .context("Failed to create a TLS certificate")?;
    let certificates = Arc::new(
        CertificateStore::load_from(cert_paths)
            .await
            .context("Failed to load the TLS certificate")?,
    );

    let manager = Arc::new(ConfigManager::new(
        config,
        config_path,
        base_dir,
        certificates.clone(),
    ));

    let period = Duration::from_secs(args.watch_interval.max(1));
    manager.clone().watch_file_changes(period);
    certificates.clone().watch(period);
    if let Err(e) = manager.clone().start_reload_watcher() {
        error!(target: ERRORS, "Failed to install SIGHUP handler: {}", e);
    }

    let metrics = Arc::new(MetricsCollector::new());
    let proxy = ProxyHandler::new(
        Transports::default(),
        Arc::new(ResponseCache::new()),
        CompressionHandler::default(),
        metrics.clone(),
    );
    let handler = Arc::new(RequestHandler::new(
        Router::new(manager.get_config()),
        proxy,
        RateLimiterRegistry::default(),
        https_addr.port(),
    ));

    if !args.no_status_page {
        let listener = StatusServer::bind(args.status_listen).await?;
        tokio::spawn(Arc::new(StatusServer::new(metrics)).serve(listener));
    }

    HttpServer::new(handler, certificates)
        .run(http_addr, https_addr)
        .await
}
