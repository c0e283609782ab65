//! Convenience macros for performance tracing.

/// Create a [`crate::performance::PerformanceSpan`] that logs on drop.
///
/// ```rust
/// use devmodel_tracing::perf_span;
///
/// {
///     let _span = perf_span!("copy_inputs", count = 2);
///     // ... work ...
/// }
/// ```
#[macro_export]
macro_rules! perf_span {
    ($name:expr) => {{
        $crate::performance::PerformanceSpan::new($name, None)
    }};
    ($name:expr, $($field:tt = $value:expr),+ $(,)?) => {{
        $crate::performance::PerformanceSpan::from_span(
            $name,
            $crate::__tracing::debug_span!("perf", name = $name, $($field = $value),+),
        )
    }};
}

/// Run a block and return `(result, duration_us)`, logging the duration.
///
/// ```rust
/// use devmodel_tracing::timed_block;
///
/// let (sum, _us) = timed_block!("sum", { (1..=10).sum::<i32>() });
/// assert_eq!(sum, 55);
/// ```
#[macro_export]
macro_rules! timed_block {
    ($name:expr, $block:block) => {{
        let start = std::time::Instant::now();
        let result = $block;
        let duration_us = start.elapsed().as_micros() as u64;
        $crate::__tracing::debug!(operation = $name, duration_us = duration_us, "timed_block_complete");
        (result, duration_us)
    }};
}
