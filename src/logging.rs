//! Tracing setup for when the plugin runs outside a host that already
//! installed a subscriber.

use tracing_subscriber::EnvFilter;

pub const DEFAULT_LOG_FILTER: &str = "info";
/// ORT is chatty at info level during session construction.
pub const DEFAULT_NOISE_FILTER: &str = "ort=error";

/// Resolve the effective filter string with 3-tier priority:
/// 1. explicit override (host / CLI)
/// 2. `RUST_LOG`
/// 3. default filter plus the noise filter
pub fn effective_filter(explicit: Option<&str>, rust_log_env: Option<&str>) -> String {
    if let Some(filter) = explicit {
        return filter.to_string();
    }
    if let Some(env) = rust_log_env {
        if !env.trim().is_empty() {
            return env.to_string();
        }
    }
    format!("{DEFAULT_LOG_FILTER},{DEFAULT_NOISE_FILTER}")
}

/// Install a global subscriber. A no-op when the host already installed one.
pub fn init_logging(explicit: Option<&str>) {
    let filter = effective_filter(explicit, std::env::var("RUST_LOG").ok().as_deref());
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .try_init();
}
