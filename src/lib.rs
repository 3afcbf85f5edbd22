pub mod cli;
pub mod configuration;
pub mod errors;
pub mod leap;
pub mod manager;
pub mod manager_client;
pub mod ports;
pub mod provider;
pub mod proxy;
pub mod telemetry;
pub mod tls;
pub mod users;
pub mod utils;
pub mod watchdog;
