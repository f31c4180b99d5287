//! Logging setup for the `lbx` binary.
//!
//! Logs go to stderr so stdout carries only command output. `RUST_LOG`
//! takes precedence over `--log-level`:
//!
//! ```bash
//! RUST_LOG=letterbox_core=debug lbx query "what's new in AI?"
//! lbx --log-level warn stats
//! ```

use std::sync::Once;
use tracing_subscriber::fmt::time::FormatTime;
use tracing_subscriber::EnvFilter;

static INIT: Once = Once::new();

/// `HH:MM:SS.mmm`
struct CompactTime;

impl FormatTime for CompactTime {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> std::fmt::Result {
        write!(w, "{}", chrono::Local::now().format("%H:%M:%S%.3f"))
    }
}

/// Filter from `RUST_LOG`, else from `level`. An unparsable level falls
/// back to `info`.
pub fn filter_for(level: &str) -> EnvFilter {
    if std::env::var("RUST_LOG").is_ok() {
        return EnvFilter::from_default_env();
    }
    EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the global subscriber. Only the first call has an effect.
pub fn init(level: &str) {
    INIT.call_once(|| {
        let installed = tracing_subscriber::fmt()
            .with_env_filter(filter_for(level))
            .with_writer(std::io::stderr)
            .with_timer(CompactTime)
            .with_target(false)
            .try_init();
        if let Err(e) = installed {
            eprintln!("Failed to initialise logging: {}", e);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_accepts_directives() {
        if std::env::var("RUST_LOG").is_ok() {
            return;
        }
        assert_eq!(filter_for("warn").to_string(), "warn");
    }

    #[test]
    fn test_init_is_idempotent() {
        init("warn");
        init("debug");
    }
}
