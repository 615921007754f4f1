/// Submodule for the persistent server host key.
pub mod host_key;

pub use host_key::load_or_generate;
