pub mod analysis;
pub mod configuration;
pub mod controller;
pub mod data_capture;
pub mod error_handling;
pub mod identity;
pub mod network;
pub mod session_management;
pub mod upstream;
