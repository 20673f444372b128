//! Limits for one sandbox call and sizing for the dispatcher pool.

use std::time::Duration;

/// Default wall-clock budget per call.
pub const DEFAULT_TIMEOUT_MS: u64 = 5_000;

/// Upper bound accepted for a per-request timeout override.
pub const MAX_TIMEOUT_MS: u64 = 60_000;

/// Default statement ceiling per call.
pub const DEFAULT_MAX_STATEMENTS: u64 = 10_000;

/// Default interpreter allocator limit.
pub const DEFAULT_MAX_MEMORY_MB: usize = 64;

/// Default number of concurrent sandbox calls.
pub const DEFAULT_MAX_WORKERS: usize = 8;

/// Default number of calls allowed to wait for a worker.
pub const DEFAULT_MAX_QUEUE_DEPTH: usize = 64;

/// Per-call limits enforced inside the interpreter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxLimits {
    /// Statement ceiling. The authoritative termination guarantee.
    pub max_statements: u64,
    /// Interpreter allocator limit in MiB. Advisory.
    pub max_memory_mb: usize,
    /// Reserved. Network access is always denied.
    pub allow_network: bool,
    /// Reserved. Filesystem access is always denied.
    pub allow_file_access: bool,
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            max_statements: DEFAULT_MAX_STATEMENTS,
            max_memory_mb: DEFAULT_MAX_MEMORY_MB,
            allow_network: false,
            allow_file_access: false,
        }
    }
}

impl SandboxLimits {
    pub fn max_memory_bytes(&self) -> usize {
        self.max_memory_mb.saturating_mul(1024 * 1024)
    }
}

/// Configuration for [`ExecutionDispatcher`](super::dispatcher::ExecutionDispatcher).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatcherConfig {
    pub limits: SandboxLimits,
    /// Deadline used when a request does not override it.
    pub default_timeout: Duration,
    pub max_workers: usize,
    pub max_queue_depth: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            limits: SandboxLimits::default(),
            default_timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            max_workers: DEFAULT_MAX_WORKERS,
            max_queue_depth: DEFAULT_MAX_QUEUE_DEPTH,
        }
    }
}

/// Clamp a caller-supplied timeout override to `1..=MAX_TIMEOUT_MS`.
pub fn clamp_timeout_ms(timeout_ms: u64) -> Duration {
    Duration::from_millis(timeout_ms.clamp(1, MAX_TIMEOUT_MS))
}
