//! Top-level orchestration of the proxy.
//!
//! [`ProxyServer`] ties the host identity, the listening socket, the inbound credential check
//! and the session engine together, and owns the start/stop lifecycle.
//!
//! ```no_run
//! use std::path::Path;
//! use std::sync::Arc;
//! use tamis::analysis::summarizer;
//! use tamis::configuration::config::Config;
//! use tamis::controller::ProxyServer;
//! use tamis::upstream::UpstreamConnector;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::from_file(Path::new("configs/config.toml"))?;
//! let dialer = UpstreamConnector::new(config.upstream.clone())?;
//! let summarizer = summarizer::from_config(&config.summary);
//! let server = ProxyServer::new(config, Arc::new(dialer), summarizer);
//! server.start().await?;
//! server.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod proxy_server;

pub use proxy_server::{ProxyServer, ServerState};
