//! Shared tracing setup for the devmodel workspace.
//!
//! The runtime, the driver crate, integration tests and benches all install
//! their subscriber through this crate so the log surface (filter syntax,
//! output format, performance spans) is the same everywhere.
//!
//! ```text
//! TracingConfig::from_env()
//!   ├── Profile      (DEVMODEL_TRACING_PROFILE: local | ci | quiet)
//!   ├── EnvFilter    (DEVMODEL_TRACING_DIRECTIVES → RUST_LOG → profile default)
//!   ├── fmt layer    (DEVMODEL_TRACING_FORMAT: pretty | compact | json)
//!   └── perf spans   (DEVMODEL_PERF_TRACING, DEVMODEL_PERF_THRESHOLD_US)
//! ```

pub mod performance;

#[macro_use]
pub mod macros;

use std::env;

pub use tracing::{debug, error, info, trace, warn};

#[doc(hidden)]
pub use tracing as __tracing;

use thiserror::Error;
use tracing::Subscriber;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt as tracing_fmt, EnvFilter, Registry};

const PROFILE_VAR: &str = "DEVMODEL_TRACING_PROFILE";
const DIRECTIVES_VAR: &str = "DEVMODEL_TRACING_DIRECTIVES";
const FORMAT_VAR: &str = "DEVMODEL_TRACING_FORMAT";
const PERF_VAR: &str = "DEVMODEL_PERF_TRACING";
const PERF_THRESHOLD_VAR: &str = "DEVMODEL_PERF_THRESHOLD_US";

/// Preset bundles of subscriber settings.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Profile {
    /// Pretty, coloured, runtime at `info`.
    Local,
    /// JSON, no colour; what log collectors ingest.
    Ci,
    /// Warnings only. Used by benches so logging stays out of the timings.
    Quiet,
}

impl Profile {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "local" | "dev" => Some(Self::Local),
            "ci" => Some(Self::Ci),
            "quiet" | "bench" => Some(Self::Quiet),
            _ => None,
        }
    }

    fn default_directive(self) -> &'static str {
        match self {
            Self::Local => "devmodel_runtime=info,devmodel_driver=info,warn",
            Self::Ci => "info",
            Self::Quiet => "warn",
        }
    }
}

/// Output format of the formatter layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TracingOutput {
    Compact,
    Pretty,
    Json,
}

impl TracingOutput {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Some(Self::Compact),
            "pretty" => Some(Self::Pretty),
            "json" => Some(Self::Json),
            _ => None,
        }
    }
}

/// How the shared subscriber should behave.
#[derive(Clone, Debug)]
pub struct TracingConfig {
    pub profile: Profile,
    /// Explicit filter directives, e.g. `devmodel_runtime::refresh=debug`.
    /// When absent, `RUST_LOG` and then the profile default apply.
    pub directives: Option<String>,
    pub output: TracingOutput,
    pub ansi: bool,
    pub include_targets: bool,
    /// Span lifecycle events to emit; `FmtSpan::CLOSE` shows `#[instrument]` timings.
    pub span_events: FmtSpan,
    /// When false, [`performance::PerformanceSpan`] guards are silent.
    pub enable_performance_tracing: bool,
    /// Minimum span duration (µs) worth logging. `None` logs every span.
    pub performance_threshold_us: Option<u64>,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self::for_profile(Profile::Local)
    }
}

impl TracingConfig {
    pub fn for_profile(profile: Profile) -> Self {
        let output = match profile {
            Profile::Local => TracingOutput::Pretty,
            Profile::Ci => TracingOutput::Json,
            Profile::Quiet => TracingOutput::Compact,
        };
        Self {
            profile,
            directives: None,
            output,
            ansi: profile == Profile::Local,
            include_targets: true,
            span_events: FmtSpan::NONE,
            enable_performance_tracing: profile == Profile::Local && cfg!(debug_assertions),
            performance_threshold_us: None,
        }
    }

    pub fn for_local() -> Self {
        Self::for_profile(Profile::Local)
    }

    pub fn for_ci() -> Self {
        Self::for_profile(Profile::Ci)
    }

    /// Replace the filter directives.
    pub fn with_directives(mut self, directives: impl Into<String>) -> Self {
        self.directives = Some(directives.into());
        self
    }

    /// Build a configuration from the `DEVMODEL_*` environment variables.
    ///
    /// Unparseable values are ignored and the profile default is kept.
    pub fn from_env() -> Self {
        let profile = env::var(PROFILE_VAR)
            .ok()
            .and_then(|v| Profile::parse(&v))
            .unwrap_or(Profile::Local);
        let mut config = Self::for_profile(profile);

        if let Some(directives) = env::var(DIRECTIVES_VAR).ok().filter(|d| !d.trim().is_empty()) {
            config.directives = Some(directives);
        }
        if let Some(output) = env::var(FORMAT_VAR).ok().and_then(|v| TracingOutput::parse(&v)) {
            config.output = output;
        }
        if config.output == TracingOutput::Json {
            config.ansi = false;
        }
        if let Ok(flag) = env::var(PERF_VAR) {
            config.enable_performance_tracing = parse_flag(&flag);
        }
        if let Some(threshold) = env::var(PERF_THRESHOLD_VAR).ok().and_then(|v| v.trim().parse().ok()) {
            config.performance_threshold_us = Some(threshold);
        }
        config
    }

    fn filter(&self) -> Result<EnvFilter, TracingSetupError> {
        match &self.directives {
            Some(directives) => EnvFilter::try_new(directives).map_err(|err| TracingSetupError::InvalidFilter {
                directives: directives.clone(),
                reason: err.to_string(),
            }),
            None => Ok(EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(self.profile.default_directive()))),
        }
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(value.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

/// Failure to configure the shared subscriber.
#[derive(Debug, Error)]
pub enum TracingSetupError {
    #[error("invalid tracing directives `{directives}`: {reason}")]
    InvalidFilter { directives: String, reason: String },

    #[error("failed to install global tracing subscriber: {0}")]
    SubscriberInit(#[from] tracing_subscriber::util::TryInitError),
}

/// Build a subscriber for the given configuration without installing it.
pub fn build_subscriber(config: &TracingConfig) -> Result<impl Subscriber + Send + Sync, TracingSetupError> {
    let filter = config.filter()?;
    Ok(Registry::default().with(fmt_layer(config)).with(filter))
}

fn fmt_layer(config: &TracingConfig) -> Box<dyn Layer<Registry> + Send + Sync> {
    let base = tracing_fmt::layer()
        .with_target(config.include_targets)
        .with_span_events(config.span_events.clone());
    match config.output {
        TracingOutput::Compact => Box::new(base.compact().with_ansi(config.ansi)),
        TracingOutput::Pretty => Box::new(base.pretty().with_ansi(config.ansi)),
        TracingOutput::Json => Box::new(base.json().with_ansi(false)),
    }
}

/// Install the configured subscriber as the process-wide default and apply
/// the performance-span settings.
pub fn init_global_tracing(config: &TracingConfig) -> Result<(), TracingSetupError> {
    performance::set_enabled(config.enable_performance_tracing, config.performance_threshold_us);
    build_subscriber(config)?.try_init()?;
    Ok(())
}

/// Installation for tests: compact, uncoloured, and tolerant of a subscriber
/// another test already installed.
pub fn init_test_tracing() {
    let mut config = TracingConfig::from_env();
    config.output = TracingOutput::Compact;
    config.ansi = false;
    let _ = init_global_tracing(&config);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn clear_env() {
        for key in [PROFILE_VAR, DIRECTIVES_VAR, FORMAT_VAR, PERF_VAR, PERF_THRESHOLD_VAR, "RUST_LOG"] {
            env::remove_var(key);
        }
    }

    #[test]
    #[serial]
    fn bad_directives_are_reported_with_the_input() {
        clear_env();
        let config = TracingConfig::default().with_directives("=::invalid");
        match build_subscriber(&config) {
            Err(TracingSetupError::InvalidFilter { directives, .. }) => assert_eq!(directives, "=::invalid"),
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("directives should not parse"),
        }
    }

    #[test]
    #[serial]
    fn every_profile_builds() {
        clear_env();
        for profile in [Profile::Local, Profile::Ci, Profile::Quiet] {
            assert!(build_subscriber(&TracingConfig::for_profile(profile)).is_ok(), "{profile:?}");
        }
    }

    #[test]
    #[serial]
    fn ci_profile_with_compact_override() {
        clear_env();
        env::set_var(PROFILE_VAR, "ci");
        env::set_var(FORMAT_VAR, "compact");
        env::set_var(DIRECTIVES_VAR, "devmodel_runtime=debug");

        let config = TracingConfig::from_env();
        assert_eq!(config.profile, Profile::Ci);
        assert_eq!(config.directives.as_deref(), Some("devmodel_runtime=debug"));
        assert_eq!(config.output, TracingOutput::Compact);
        assert!(!config.ansi);
        clear_env();
    }

    #[test]
    #[serial]
    fn unknown_profile_falls_back_to_local() {
        clear_env();
        env::set_var(PROFILE_VAR, "staging");
        env::set_var(FORMAT_VAR, "xml");
        let config = TracingConfig::from_env();
        assert_eq!(config.profile, Profile::Local);
        assert_eq!(config.output, TracingOutput::Pretty);
        clear_env();
    }

    #[test]
    #[serial]
    fn performance_settings_come_from_env() {
        clear_env();
        env::set_var(PERF_VAR, "on");
        env::set_var(PERF_THRESHOLD_VAR, " 250 ");
        let config = TracingConfig::from_env();
        assert!(config.enable_performance_tracing);
        assert_eq!(config.performance_threshold_us, Some(250));

        env::set_var(PERF_VAR, "0");
        assert!(!TracingConfig::from_env().enable_performance_tracing);
        clear_env();
    }

    #[test]
    #[serial]
    fn json_output_never_colours() {
        clear_env();
        env::set_var(FORMAT_VAR, "json");
        let config = TracingConfig::from_env();
        assert_eq!(config.output, TracingOutput::Json);
        assert!(!config.ansi);
        clear_env();
    }
}
