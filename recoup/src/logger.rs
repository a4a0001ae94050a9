//! Global `tracing` logger configuration.
//!
//! Dev runs get a human-readable compact format; staging/prod get
//! single-line JSON records (`level`, `time`, `source`/target, `msg` as the
//! flattened event message) for log shipping. Filtering follows `RUST_LOG`,
//! defaulting to INFO.
//!
//! Secrets never reach this layer: config secrets are [`secrecy`]-wrapped
//! and log call sites reference ids rather than credentials.
//!
//! [`secrecy`]: https://docs.rs/secrecy

use recoup_common::env::DeployEnv;
use tracing_subscriber::{
    filter::EnvFilter,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

/// Initialize the global logger. Panics if one is already set.
pub fn init(deploy_env: DeployEnv) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));

    if deploy_env.is_staging_or_prod() {
        let json_log = tracing_subscriber::fmt::layer()
            .json()
            .flatten_event(true)
            .with_target(true)
            .with_filter(filter);
        tracing_subscriber::registry().with(json_log).init();
    } else {
        let stdout_log = tracing_subscriber::fmt::layer()
            .compact()
            .with_level(true)
            .with_target(true)
            .with_ansi(true)
            .with_filter(filter);
        tracing_subscriber::registry().with(stdout_log).init();
    }
}

/// Use this to initialize the global logger in tests. Does nothing unless
/// `RUST_LOG` is set; never panics if a logger already exists.
pub fn init_for_testing() {
    if std::env::var_os("RUST_LOG").is_none() {
        return;
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let stdout_log = tracing_subscriber::fmt::layer()
        .compact()
        .with_test_writer()
        .with_filter(filter);
    let _ = tracing_subscriber::registry().with(stdout_log).try_init();
}
