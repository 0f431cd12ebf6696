//! Tracing and logging setup shared by leaseq binaries.

/// Initialize process-wide tracing with [`tracing::DEFAULT_DIRECTIVES`] and the
/// format named by `LEASEQ_LOG_FORMAT`.
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init(tracing::DEFAULT_DIRECTIVES, tracing::LogFormat::from_env());
}

/// Tracing configuration (filters, formats).
pub mod tracing;
