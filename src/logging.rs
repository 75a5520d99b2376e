//! # Tracing Module
//!
//! Environment-aware console logging using the tracing ecosystem.
//! Output goes to stdout; set `BROKER_LOG_FORMAT=json` for one JSON object
//! per line in containerized deployments.

use std::io::IsTerminal;
use std::sync::OnceLock;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

static TRACING_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Initialize tracing once per process
///
/// Safe to call from tests and from applications that already installed a
/// global subscriber: a second installation is logged at debug and ignored.
pub fn init_tracing() {
    TRACING_INITIALIZED.get_or_init(|| {
        let environment = get_environment();
        let log_level = get_log_level(&environment);
        let json = use_json_format();

        let console_layer = if json {
            fmt::layer()
                .json()
                .with_target(true)
                .with_current_span(true)
                .with_filter(EnvFilter::new(&log_level))
                .boxed()
        } else {
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_level(true)
                .with_ansi(IsTerminal::is_terminal(&std::io::stdout()))
                .with_filter(EnvFilter::new(&log_level))
                .boxed()
        };

        if tracing_subscriber::registry()
            .with(console_layer)
            .try_init()
            .is_err()
        {
            tracing::debug!(
                "Global tracing subscriber already initialized - continuing with existing subscriber"
            );
        } else {
            tracing::info!(
                environment = %environment,
                level = %log_level,
                json,
                "Broker logging initialized"
            );
        }
    });
}

fn process_env(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

/// Get current environment from environment variables
fn get_environment() -> String {
    resolve_environment(process_env)
}

/// Get log level based on environment variables or environment defaults
fn get_log_level(environment: &str) -> String {
    resolve_log_level(environment, process_env)
}

fn use_json_format() -> bool {
    resolve_json_format(process_env)
}

fn resolve_environment(lookup: impl Fn(&str) -> Option<String>) -> String {
    lookup("BROKER_ENV")
        .or_else(|| lookup("APP_ENV"))
        .unwrap_or_else(|| "development".to_string())
}

fn resolve_log_level(environment: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    if let Some(level) = lookup("LOG_LEVEL").or_else(|| lookup("RUST_LOG")) {
        return level.to_lowercase();
    }

    match environment {
        "production" => "info".to_string(),
        _ => "debug".to_string(),
    }
}

fn resolve_json_format(lookup: impl Fn(&str) -> Option<String>) -> bool {
    lookup("BROKER_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false)
}
