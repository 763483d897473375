//! Error types
//!
//! Design: The allocation path has no recoverable errors. Bookkeeping checks
//! return `Result<(), InvariantViolation>` so they can be tested in isolation,
//! and the allocator funnels every `Err` into [`throw`], which never returns.
//! Configuration loading is the only fallible, caller-visible surface.

use crate::addr::Address;
use crate::logging::log_fatal;
use crate::sizeclass::SpanClass;
use std::io::Write;
use thiserror::Error;

/// Allocator-internal corruption or exhaustion. Always fatal.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvariantViolation {
    #[error("refill of span with free space remaining (span class {}: {alloc_count}/{nelems} allocated)", .span_class.index())]
    RefillNotExhausted {
        span_class: SpanClass,
        alloc_count: usize,
        nelems: usize,
    },

    #[error("span has no free space (span class {}: {nelems} objects, all allocated)", .span_class.index())]
    CachedSpanFull { span_class: SpanClass, nelems: usize },

    #[error("out of memory allocating {pages} pages")]
    OutOfMemory { pages: usize },

    #[error("double free of object {addr}")]
    DoubleFree { addr: Address },

    #[error("free of {addr}: address is not in any span")]
    WildFree { addr: Address },
}

/// Report a fatal allocator error and abort.
///
/// Unwinding is not an option here: shared allocator state may be half
/// updated and any destructor that allocates would run on top of it.
#[cold]
#[inline(never)]
pub fn throw(violation: InvariantViolation) -> ! {
    log_fatal(&violation);
    let mut stderr = std::io::stderr().lock();
    let _ = writeln!(stderr, "fatal error: {}", violation);
    let _ = stderr.flush();
    std::process::abort()
}

/// Unwrap a bookkeeping check, aborting on violation.
#[inline]
pub(crate) fn check(result: Result<(), InvariantViolation>) {
    if let Err(violation) = result {
        throw(violation);
    }
}

/// Configuration loading failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config syntax: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}
