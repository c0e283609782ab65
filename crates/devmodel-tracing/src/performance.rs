//! Performance instrumentation: timed spans and standard runtime events.
//!
//! ```rust
//! use devmodel_tracing::performance::{record_transfer, PerformanceSpan};
//!
//! let span = PerformanceSpan::new("refresh", Some(50));
//! // ... work ...
//! drop(span); // logs only when the work took at least 50µs
//!
//! record_transfer(4096, "H2D", 12);
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;
use tracing::Level;

static ENABLED: AtomicBool = AtomicBool::new(true);
// u64::MAX encodes "no global threshold".
static GLOBAL_THRESHOLD_US: AtomicU64 = AtomicU64::new(u64::MAX);

/// Toggle performance span logging process-wide.
pub fn set_enabled(enabled: bool, threshold_us: Option<u64>) {
    ENABLED.store(enabled, Ordering::Relaxed);
    GLOBAL_THRESHOLD_US.store(threshold_us.unwrap_or(u64::MAX), Ordering::Relaxed);
}

/// Whether performance spans currently log.
pub fn is_enabled() -> bool {
    ENABLED.load(Ordering::Relaxed)
}

/// RAII guard timing a region of work; logs on drop when the duration
/// clears both the per-span and the global threshold.
pub struct PerformanceSpan {
    name: String,
    threshold_us: Option<u64>,
    start_time: Instant,
    span: tracing::Span,
}

impl PerformanceSpan {
    /// Start a debug-level span. `threshold_us = None` always logs.
    pub fn new(name: impl Into<String>, threshold_us: Option<u64>) -> Self {
        Self::with_level(Level::DEBUG, name, threshold_us)
    }

    /// Start a span at an explicit level.
    pub fn with_level(level: Level, name: impl Into<String>, threshold_us: Option<u64>) -> Self {
        let name = name.into();
        let span = match level {
            Level::TRACE => tracing::trace_span!("perf", name = %name),
            Level::DEBUG => tracing::debug_span!("perf", name = %name),
            Level::INFO => tracing::info_span!("perf", name = %name),
            Level::WARN => tracing::warn_span!("perf", name = %name),
            Level::ERROR => tracing::error_span!("perf", name = %name),
        };
        Self {
            name,
            threshold_us,
            start_time: Instant::now(),
            span,
        }
    }

    /// Time work under a span the caller built, so its fields reach the
    /// completion event.
    pub fn from_span(name: impl Into<String>, span: tracing::Span) -> Self {
        Self {
            name: name.into(),
            threshold_us: None,
            start_time: Instant::now(),
            span,
        }
    }

    /// Name given at construction.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Microseconds since the span started.
    pub fn elapsed_us(&self) -> u64 {
        self.start_time.elapsed().as_micros() as u64
    }

    /// Enter the span's context.
    pub fn enter(&self) -> tracing::span::Entered<'_> {
        self.span.enter()
    }
}

impl Drop for PerformanceSpan {
    fn drop(&mut self) {
        if !is_enabled() {
            return;
        }
        let elapsed_us = self.elapsed_us();
        let global = GLOBAL_THRESHOLD_US.load(Ordering::Relaxed);
        let local_ok = self.threshold_us.map_or(true, |t| elapsed_us >= t);
        let global_ok = global == u64::MAX || elapsed_us >= global;
        if local_ok && global_ok {
            let _entered = self.span.enter();
            tracing::debug!(
                duration_us = elapsed_us,
                duration_ms = elapsed_us as f64 / 1000.0,
                "performance_span_complete"
            );
        }
    }
}

/// Record a host/device copy with bandwidth.
///
/// `direction` is one of `H2D`, `D2H`, `D2D`, `H2H`.
pub fn record_transfer(bytes: usize, direction: &str, duration_us: u64) {
    let bandwidth_mbps = if duration_us > 0 {
        (bytes as f64 / duration_us as f64) * 1_000_000.0 / (1024.0 * 1024.0)
    } else {
        0.0
    };

    tracing::debug!(
        event = "transfer",
        bytes,
        direction,
        duration_us,
        bandwidth_mbps,
        "data_transfer"
    );
}

/// Record the outcome of one argument refresh pass.
pub fn record_refresh(model: &str, policy: &str, slots_written: usize, duration_us: u64) {
    tracing::debug!(
        event = "refresh",
        model,
        policy,
        slots_written,
        duration_us,
        "args_refresh"
    );
}

/// Record aggregate timing of one task type during distribution.
pub fn record_distribution(task_type: &str, count: usize, duration_us: u64) {
    let avg_us = if count > 0 { duration_us as f64 / count as f64 } else { 0.0 };
    tracing::debug!(
        event = "distribution",
        task_type,
        count,
        duration_us,
        avg_us,
        "task_distribution"
    );
}
