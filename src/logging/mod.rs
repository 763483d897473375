//! Logging infrastructure - structured tracing for the allocator
//!
//! Design: Uses `tracing` for structured, contextual logging with:
//! - Configurable log levels via environment
//! - Zero-cost when disabled
//! - Only `trace!` on the allocation fast path
//! - Console output, optional JSON and file output

use once_cell::sync::OnceCell;
use std::io;
use std::path::Path;
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

use crate::addr::Address;
use crate::error::InvariantViolation;
use crate::sizeclass::SpanClass;

pub use tracing::{debug, error, info, trace, warn};

/// Global logging state
static LOGGER_INITIALIZED: OnceCell<()> = OnceCell::new();

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Default log level
    pub level: Level,
    /// Enable file logging
    pub file_output: bool,
    /// Log file path (if file_output enabled)
    pub log_path: Option<String>,
    /// Enable JSON format (vs human-readable)
    pub json_format: bool,
    /// Show span events (enter/exit)
    pub show_spans: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            file_output: false,
            log_path: None,
            json_format: false,
            show_spans: false,
        }
    }
}

impl LogConfig {
    /// Create config from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();

        // SPANCACHE_LOG_LEVEL: trace, debug, info, warn, error
        if let Ok(level_str) = std::env::var("SPANCACHE_LOG_LEVEL") {
            config.level = parse_level(&level_str);
        }

        // SPANCACHE_LOG_FILE: path to log file
        if let Ok(path) = std::env::var("SPANCACHE_LOG_FILE") {
            config.file_output = true;
            config.log_path = Some(path);
        }

        config.json_format = std::env::var("SPANCACHE_LOG_JSON").is_ok();
        config.show_spans = std::env::var("SPANCACHE_LOG_SPANS").is_ok();

        config
    }

    /// Errors only
    pub fn quiet() -> Self {
        Self {
            level: Level::ERROR,
            ..Self::default()
        }
    }

    /// Everything, including fast-path events
    pub fn verbose() -> Self {
        Self {
            level: Level::TRACE,
            show_spans: true,
            ..Self::default()
        }
    }
}

fn parse_level(s: &str) -> Level {
    match s.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

/// Initialize logging with configuration from the environment
pub fn init() {
    init_with_config(LogConfig::from_env());
}

/// Initialize logging with custom configuration
///
/// Only the first call installs a subscriber. If the host process already
/// installed one, ours is dropped silently.
pub fn init_with_config(config: LogConfig) {
    LOGGER_INITIALIZED.get_or_init(|| {
        let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!("spancache={}", config.level.as_str().to_lowercase()))
        });

        let span_events = if config.show_spans {
            FmtSpan::ENTER | FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        };

        let console = (!config.json_format).then(|| {
            fmt::layer()
                .with_writer(io::stderr)
                .with_span_events(span_events.clone())
                .with_target(true)
                .with_thread_ids(cfg!(debug_assertions))
                .with_line_number(cfg!(debug_assertions))
        });

        let console_json = config.json_format.then(|| {
            fmt::layer()
                .json()
                .with_writer(io::stderr)
                .with_span_events(span_events.clone())
        });

        let file = config
            .log_path
            .as_deref()
            .filter(|_| config.file_output)
            .map(|path| {
                let path = Path::new(path);
                let dir = path.parent().unwrap_or_else(|| Path::new("."));
                let name = path
                    .file_name()
                    .map(|n| n.to_owned())
                    .unwrap_or_else(|| "spancache.log".into());
                fmt::layer()
                    .with_writer(tracing_appender::rolling::never(dir, name))
                    .with_ansi(false)
                    .with_span_events(span_events)
            });

        let _ = tracing_subscriber::registry()
            .with(env_filter)
            .with(console)
            .with(console_json)
            .with(file)
            .try_init();
    });
}

/// Check if logging is initialized
pub fn is_initialized() -> bool {
    LOGGER_INITIALIZED.get().is_some()
}

// ============================================================================
// Allocator events
// ============================================================================

/// Log cache creation
pub fn log_cache_create(cache_id: u32, next_sample: i32) {
    debug!(
        event = "cache_create",
        cache_id,
        next_sample,
        "Allocator cache created"
    );
}

/// Log cache destruction
pub fn log_cache_destroy(cache_id: u32) {
    debug!(event = "cache_destroy", cache_id, "Allocator cache destroyed");
}

/// Log span refill
#[inline]
pub fn log_refill(cache_id: u32, span_class: SpanClass, base: Address, nelems: usize, free: usize) {
    trace!(
        event = "refill",
        cache_id,
        span_class = span_class.index(),
        span_base = %base,
        nelems,
        free,
        "Donor span replaced"
    );
}

/// Log release of every cached span
pub fn log_release_all(cache_id: u32, released: usize) {
    debug!(
        event = "release_all",
        cache_id,
        spans_released = released,
        "Cache released all spans"
    );
}

/// Log a local statistics flush
pub fn log_stats_flush(cache_id: u32, small_allocs: u64, small_frees: u64, scan_bytes: u64) {
    trace!(
        event = "stats_flush",
        cache_id,
        small_allocs,
        small_frees,
        scan_bytes,
        "Local statistics flushed"
    );
}

/// Log a heap-profile sample
#[inline]
pub fn log_heap_sample(cache_id: u32, addr: Address, size: usize, next_sample: i32) {
    trace!(
        event = "heap_sample",
        cache_id,
        address = %addr,
        size_bytes = size,
        next_sample,
        "Allocation sampled"
    );
}

/// Log span creation by the page heap
pub fn log_span_alloc(span_class: SpanClass, base: Address, npages: usize) {
    debug!(
        event = "span_alloc",
        span_class = span_class.index(),
        span_base = %base,
        npages,
        "Span carved from heap"
    );
}

/// Log span return to the page heap
pub fn log_span_free(span_class: SpanClass, base: Address, npages: usize) {
    debug!(
        event = "span_free",
        span_class = span_class.index(),
        span_base = %base,
        npages,
        "Span returned to heap"
    );
}

/// Log arena growth
pub fn log_arena_grow(bytes: usize, total: usize) {
    info!(
        event = "arena_grow",
        arena_bytes = bytes,
        heap_sys_bytes = total,
        "Heap arena added"
    );
}

/// Log mark-termination cache flush
pub fn log_mark_termination(duration_us: u64, caches: usize, spans_released: usize) {
    info!(
        event = "mark_termination",
        caches,
        spans_released,
        duration_us,
        "All caches flushed for mark termination"
    );
}

/// Log a fatal allocator error
pub fn log_fatal(violation: &InvariantViolation) {
    error!(
        event = "fatal",
        error = %violation,
        "Allocator invariant violated"
    );
}

/// Performance tracking utilities
pub mod perf {
    use std::time::Instant;
    use tracing::debug;

    /// Track operation duration (returns guard that logs on drop)
    #[must_use]
    pub fn track(operation: &'static str) -> PerformanceGuard {
        PerformanceGuard {
            operation,
            start: Instant::now(),
        }
    }

    pub struct PerformanceGuard {
        operation: &'static str,
        start: Instant,
    }

    impl PerformanceGuard {
        pub fn elapsed_us(&self) -> u64 {
            self.start.elapsed().as_micros() as u64
        }
    }

    impl Drop for PerformanceGuard {
        fn drop(&mut self) {
            debug!(
                operation = self.operation,
                duration_us = self.elapsed_us(),
                "operation completed"
            );
        }
    }
}
