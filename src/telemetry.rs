//! Tracing subscriber setup shared by the binding layer and the tests.

use std::env;

use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

/// How the fmt subscriber is installed.
#[derive(Clone, Debug)]
pub struct TracingConfig {
    /// Filter directives (e.g. `xgrid_core=debug`). Falls back to `RUST_LOG`,
    /// then to `default_directive`.
    pub directives: Option<String>,
    pub default_directive: String,
    pub include_targets: bool,
    pub ansi: bool,
    /// Emit span close events with their busy time.
    pub span_timing: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            directives: None,
            default_directive: "info".to_string(),
            include_targets: true,
            ansi: true,
            span_timing: false,
        }
    }
}

impl TracingConfig {
    fn filter(&self) -> EnvFilter {
        let from_directives = self
            .directives
            .as_deref()
            .and_then(|d| EnvFilter::try_new(d).ok());
        let from_env = || {
            env::var("RUST_LOG")
                .ok()
                .and_then(|d| EnvFilter::try_new(d).ok())
        };
        from_directives
            .or_else(from_env)
            .unwrap_or_else(|| EnvFilter::new(&self.default_directive))
    }
}

/// Install a global fmt subscriber. Returns `false` when one was already set.
pub fn init_tracing(config: &TracingConfig) -> bool {
    let span_events = if config.span_timing {
        FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };
    tracing_subscriber::fmt()
        .with_env_filter(config.filter())
        .with_target(config.include_targets)
        .with_ansi(config.ansi)
        .with_span_events(span_events)
        .try_init()
        .is_ok()
}

/// Test-friendly subscriber: captured by the test harness, warnings only
/// unless `RUST_LOG` says otherwise.
pub fn init_for_tests() {
    let filter = env::var("RUST_LOG")
        .ok()
        .and_then(|d| EnvFilter::try_new(d).ok())
        .unwrap_or_else(|| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}
