//! Diagnostic logging to stderr.
//!
//! Command output (ids, tables) goes to stdout; everything here is for the
//! operator. Filter with `EVOLVER_LOG` (falls back to `RUST_LOG`, then
//! `info`), and set `EVOLVER_LOG_FORMAT=json` for one JSON object per line.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

const FILTER_ENV: &str = "EVOLVER_LOG";
const FORMAT_ENV: &str = "EVOLVER_LOG_FORMAT";
const DEFAULT_FILTER: &str = "info";

fn filter() -> EnvFilter {
    EnvFilter::try_from_env(FILTER_ENV)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

fn json_requested(value: Option<&str>) -> bool {
    value.is_some_and(|v| v.trim().eq_ignore_ascii_case("json"))
}

/// Install the global subscriber. Safe to call more than once; later calls
/// are no-ops.
pub fn init() {
    let json = json_requested(std::env::var(FORMAT_ENV).ok().as_deref());
    let registry = tracing_subscriber::registry().with(filter());
    let result = if json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init()
    } else {
        registry
            .with(fmt::layer().with_writer(std::io::stderr).compact())
            .try_init()
    };
    if let Err(e) = result {
        tracing::debug!("tracing already initialized: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_format_is_opt_in() {
        assert!(json_requested(Some("json")));
        assert!(json_requested(Some(" JSON ")));
        assert!(!json_requested(Some("compact")));
        assert!(!json_requested(None));
    }
}
