pub mod backoff;
pub mod config;
pub mod database;
pub mod handlers;
pub mod lifecycle;
pub mod metrics;
pub mod pool_monitor;
pub mod readiness;
pub mod server;

// Shared with the integration tests under tests/, so it is compiled into the library.
pub mod test_utils;
