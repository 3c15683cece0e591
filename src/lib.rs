pub mod config;
pub mod convert;
pub mod http;
pub mod session;
pub mod telemetry;
