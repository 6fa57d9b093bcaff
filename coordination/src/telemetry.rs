//! Tracing setup
//!
//! Logs go to stderr through a `tracing-subscriber` fmt layer. The filter
//! comes from `RUST_LOG` when set; otherwise the library and the coordinator
//! binary both log at `info`. `json` switches to one JSON object per line
//! for log shippers.

use tracing::Span;
use tracing_subscriber::filter::Directive;
use tracing_subscriber::EnvFilter;

/// Default filter directives for the library and the coordinator binary
pub const DEFAULT_DIRECTIVES: &[&str] = &["hive_coordination=info", "hive_coordinator=info"];

/// Error installing the global subscriber
#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("Invalid log filter directive: {0}")]
    Directive(String),

    #[error("Failed to install tracing subscriber: {0}")]
    Install(String),
}

/// Build the filter from `RUST_LOG`, or the crate defaults when it is unset
pub fn env_filter() -> Result<EnvFilter, TelemetryError> {
    let rust_log = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    filter_from(rust_log.as_deref())
}

fn filter_from(rust_log: Option<&str>) -> Result<EnvFilter, TelemetryError> {
    if let Some(spec) = rust_log.filter(|s| !s.trim().is_empty()) {
        return EnvFilter::try_new(spec)
            .map_err(|e| TelemetryError::Directive(format!("{spec}: {e}")));
    }
    let mut filter = EnvFilter::default();
    for raw in DEFAULT_DIRECTIVES {
        let directive = raw
            .parse::<Directive>()
            .map_err(|e| TelemetryError::Directive(format!("{raw}: {e}")))?;
        filter = filter.add_directive(directive);
    }
    Ok(filter)
}

/// Install the global subscriber. Fails if one is already installed.
pub fn init_tracing(json: bool) -> Result<(), TelemetryError> {
    let filter = env_filter()?;
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true);

    let result = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    result.map_err(|e| TelemetryError::Install(e.to_string()))
}

/// Span wrapping one maintenance pass of the coordinator
pub fn maintenance_span(instance_id: &str, tick: u64) -> Span {
    tracing::info_span!("maintenance", instance_id, tick)
}
