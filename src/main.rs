use clap::Parser;
use log::{error, info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use tamis::analysis::summarizer;
use tamis::configuration::config::Config;
use tamis::configuration::HostKeyPolicy;
use tamis::controller::ProxyServer;
use tamis::upstream::UpstreamConnector;

#[derive(Parser, Debug)]
#[command(name = "tamis")]
#[command(version)]
#[command(about = "Recording SSH proxy")]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, env = "TAMIS_CONFIG", default_value = "configs/config.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .format_target(false)
        .init();

    let args = Args::parse();

    info!("Importing configuration from {}", args.config.display());
    let config = match Config::from_file(&args.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Unable to import configuration: {}", e);
            std::process::exit(1);
        }
    };
    log_summary(&config);

    let dialer = match UpstreamConnector::new(config.upstream.clone()) {
        Ok(dialer) => dialer,
        Err(e) => {
            error!("Unable to prepare the upstream connector: {}", e);
            std::process::exit(1);
        }
    };
    let summarizer = summarizer::from_config(&config.summary);
    if summarizer.enabled() {
        info!("Session summaries enabled ({})", config.summary.model);
    }

    let server = ProxyServer::new(config, Arc::new(dialer), summarizer);
    if let Err(e) = server.start().await {
        error!("Unable to start the proxy: {}", e);
        std::process::exit(1);
    }

    wait_for_signal().await;
    server.shutdown().await;
}

/// Logs the effective configuration without any credential.
fn log_summary(config: &Config) {
    info!(
        "Listening on {}:{}, host key {}",
        config.server.listen_address,
        config.server.port,
        config.server.host_key_path.display()
    );
    info!(
        "Upstream {}@{}:{} ({} auth)",
        config.upstream.username,
        config.upstream.host,
        config.upstream.port,
        config.upstream.auth.kind
    );
    match &config.upstream.host_key {
        HostKeyPolicy::KnownHosts { path: Some(path) } => {
            info!("Upstream host key checked against {}", path.display())
        }
        HostKeyPolicy::KnownHosts { path: None } => {
            info!("Upstream host key checked against ~/.ssh/known_hosts")
        }
        HostKeyPolicy::Fingerprint { sha256 } => info!("Upstream host key pinned to {}", sha256),
        HostKeyPolicy::AcceptAny => warn!("Upstream host key verification is disabled"),
    }
    info!(
        "{} user(s) configured, transcripts in {}",
        config.users.len(),
        config.logging.directory.display()
    );
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(terminate) => terminate,
        Err(e) => {
            warn!("Unable to listen for SIGTERM: {}", e);
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Unable to listen for Ctrl-C: {}", e);
            }
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Received Ctrl-C"),
        _ = terminate.recv() => info!("Received SIGTERM"),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Unable to listen for Ctrl-C: {}", e);
    }
}
