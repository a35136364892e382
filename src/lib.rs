//! Library crate for iot-watch: continuous LAN device discovery with
//! open-port vulnerability hints.
pub mod config;
pub mod logging;
pub mod netdetect;
pub mod ports;
pub mod registry;
pub mod scanner;
pub mod scheduler;
pub mod server;
pub mod summary;
pub mod types;
pub mod vulns;
