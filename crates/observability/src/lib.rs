//! Tracing and logging (shared setup).

/// Initialize process-wide tracing with settings from the environment.
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    subscriber::init(&subscriber::LogConfig::from_env());
}

/// Subscriber configuration (filters, output format).
pub mod subscriber;
