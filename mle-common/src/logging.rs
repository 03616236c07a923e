//! Logging setup for MLE tools.
//!
//! Provides human-readable or structured JSON output through
//! `tracing-subscriber`.
//!
//! # Noise Filtering
//!
//! HTTP and TLS crates pulled in by the embedding and memory clients
//! (hyper, reqwest, h2, rustls) are set to `warn` so that store operations
//! stay readable at `debug`.

use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Default noisy modules that should be filtered to warn level.
pub const NOISY_MODULES: &[&str] = &[
    "hyper",
    "hyper_util",
    "reqwest",
    "h2",
    "rustls",
    "ort",
    "hf_hub",
];

/// Output format for [`init_logging`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

impl LogFormat {
    /// Parse a format name; anything other than `json` is pretty.
    pub fn from_name(name: &str) -> Self {
        if name.eq_ignore_ascii_case("json") {
            Self::Json
        } else {
            Self::Pretty
        }
    }
}

/// Filter directives for a base level with noise suppression applied.
pub fn filter_directives(log_level: &str) -> String {
    let mut directives = String::from(log_level);
    for module in NOISY_MODULES {
        directives.push_str(&format!(",{module}=warn"));
    }
    directives
}

fn build_filter(log_level: &str) -> EnvFilter {
    // RUST_LOG wins when set
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }
    EnvFilter::new(filter_directives(log_level))
}

/// Initialize logging.
///
/// # Arguments
///
/// * `log_level` - Base log level (trace, debug, info, warn, error)
/// * `log_format` - "json" for structured JSON, anything else for pretty output
///
/// Calling this more than once is harmless; later calls leave the first
/// subscriber in place.
pub fn init_logging(log_level: &str, log_format: &str) {
    let filter = build_filter(log_level);
    let subscriber = tracing_subscriber::registry().with(filter);
    let format = LogFormat::from_name(log_format);

    match format {
        LogFormat::Json => {
            let fmt_layer = tracing_subscriber::fmt::layer()
                .json()
                .with_span_events(FmtSpan::CLOSE)
                .with_current_span(true)
                .with_target(true)
                .with_file(true)
                .with_line_number(true);
            let _ = subscriber.with(fmt_layer).try_init();
        }
        LogFormat::Pretty => {
            let fmt_layer = tracing_subscriber::fmt::layer()
                .with_ansi(true)
                .with_target(true)
                .with_file(false)
                .with_line_number(false);
            let _ = subscriber.with(fmt_layer).try_init();
        }
    }

    tracing::debug!(
        log_level = %log_level,
        log_format = ?format,
        noise_filtered = NOISY_MODULES.len(),
        "Logging initialized"
    );
}
