/// Submodule for the inbound credential check.
pub mod authenticator;
/// Submodule bridging accepted client channels to the session engine.
pub mod channel_bridge;
/// Submodule for the accept loop and the per-connection SSH handler.
pub mod network_listener;
