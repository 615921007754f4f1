//! Outbound side of the proxy: one authenticated SSH transport to the fixed upstream host per
//! session, and the bridge between its session channel and the engine.

use std::future::Future;
use std::pin::Pin;

use uuid::Uuid;

use crate::error_handling::types::UpstreamError;
use crate::session_management::endpoint::UpstreamChannel;

pub mod connector;
pub mod host_key_policy;
pub mod upstream_channel;

pub use connector::{UpstreamConnection, UpstreamConnector};

/// Everything a session needs from the upstream host: a bridged session channel and the
/// transport it lives on, which the session closes at teardown.
pub struct UpstreamLink {
    pub channel: UpstreamChannel,
    pub transport: UpstreamConnection,
}

pub type DialFuture<'a> =
    Pin<Box<dyn Future<Output = Result<UpstreamLink, UpstreamError>> + Send + 'a>>;

/// Produces a fresh upstream link for every session. Never pooled.
pub trait UpstreamDialer: Send + Sync {
    fn dial(&self, session_id: Uuid) -> DialFuture<'_>;
}
