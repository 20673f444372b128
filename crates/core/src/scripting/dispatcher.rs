//! Bounded worker pool for sandbox calls with a caller-side deadline.
//!
//! [`ExecutionDispatcher`] is an explicitly constructed component: build it
//! with [`ExecutionDispatcher::start`], share it by `Arc`, and stop it with
//! [`ExecutionDispatcher::shutdown`]. Each call runs [`run_script`] on a
//! blocking worker thread. The deadline covers queue wait plus execution;
//! when it elapses the caller gets a timed-out result at once while the
//! worker is interrupted in the background. The statement ceiling inside the
//! sandbox is what finally ends a run that ignores its interrupt.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{Semaphore, TryAcquireError};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::value::{Map, Value};

use super::config::{DispatcherConfig, SandboxLimits};
use super::sandbox::{run_script, SandboxOutcome, SandboxRun};

/// Error text for a run that hit its wall-clock deadline.
pub const TIMED_OUT_MESSAGE: &str = "Script execution timed out";

/// Error text for a run that hit its statement ceiling.
pub const STATEMENT_LIMIT_MESSAGE: &str = "Script exceeded its statement limit";

/// Error text for a run interrupted by shutdown.
pub const INTERRUPTED_MESSAGE: &str = "Script execution interrupted";

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Dispatch-level failures. These are never script errors.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// The wait queue is full.
    #[error("worker queue is full ({queue_depth} calls waiting)")]
    Rejected { queue_depth: usize },

    /// The dispatcher no longer accepts work.
    #[error("dispatcher is shut down")]
    ShutDown,

    /// The worker thread panicked or was aborted.
    #[error("worker failed: {0}")]
    Internal(String),
}

/// Result of one dispatched call.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub success: bool,
    pub value: Option<Value>,
    pub error: Option<String>,
    pub duration_ms: u64,
    /// Deadline elapsed or statement ceiling breached.
    pub timed_out: bool,
    /// The run was interrupted by dispatcher shutdown.
    #[serde(skip)]
    pub interrupted: bool,
    pub logs: Vec<String>,
    #[serde(skip)]
    pub statements: u64,
}

impl ExecutionResult {
    fn from_run(run: SandboxRun, duration_ms: u64) -> Self {
        let base = Self {
            success: false,
            value: None,
            error: None,
            duration_ms,
            timed_out: false,
            interrupted: false,
            logs: run.logs,
            statements: run.statements,
        };
        match run.outcome {
            SandboxOutcome::Success(value) => Self {
                success: true,
                value: Some(value),
                ..base
            },
            SandboxOutcome::RuntimeFailure(message) => Self {
                error: Some(message),
                ..base
            },
            SandboxOutcome::ResourceExhausted => Self {
                error: Some(STATEMENT_LIMIT_MESSAGE.to_string()),
                timed_out: true,
                ..base
            },
            SandboxOutcome::Interrupted => Self {
                error: Some(INTERRUPTED_MESSAGE.to_string()),
                interrupted: true,
                ..base
            },
        }
    }

    fn deadline_elapsed(duration_ms: u64) -> Self {
        Self {
            success: false,
            value: None,
            error: Some(TIMED_OUT_MESSAGE.to_string()),
            duration_ms,
            timed_out: true,
            interrupted: false,
            logs: Vec::new(),
            statements: 0,
        }
    }
}

/// The sandbox entry point a worker calls.
type SandboxRunner = fn(&str, &Map, &SandboxLimits, &CancellationToken) -> SandboxRun;

/// Runs script sources for the orchestrator.
#[async_trait]
pub trait ScriptDispatcher: Send + Sync {
    async fn dispatch(
        &self,
        source: &str,
        context: &Map,
        timeout: Option<Duration>,
    ) -> Result<ExecutionResult, DispatchError>;
}

/// Decrements the waiting-call counter when a queued call leaves the queue.
struct QueueSlot(Arc<AtomicUsize>);

impl Drop for QueueSlot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

pub struct ExecutionDispatcher {
    config: DispatcherConfig,
    runner: SandboxRunner,
    permits: Arc<Semaphore>,
    queued: Arc<AtomicUsize>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
}

impl ExecutionDispatcher {
    /// Build the pool. Must be called inside a Tokio runtime.
    pub fn start(config: DispatcherConfig) -> Self {
        if config.limits.allow_network || config.limits.allow_file_access {
            tracing::warn!(
                allow_network = config.limits.allow_network,
                allow_file_access = config.limits.allow_file_access,
                "Network and file access flags are reserved; scripts never get either capability",
            );
        }
        let max_workers = config.max_workers.max(1);
        tracing::info!(
            max_workers,
            max_queue_depth = config.max_queue_depth,
            default_timeout_ms = config.default_timeout.as_millis() as u64,
            max_statements = config.limits.max_statements,
            "Execution dispatcher started",
        );
        Self {
            runner: run_script,
            permits: Arc::new(Semaphore::new(max_workers)),
            queued: Arc::new(AtomicUsize::new(0)),
            tracker: TaskTracker::new(),
            shutdown: CancellationToken::new(),
            config: DispatcherConfig {
                max_workers,
                ..config
            },
        }
    }

    #[cfg(test)]
    fn with_runner(mut self, runner: SandboxRunner) -> Self {
        self.runner = runner;
        self
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Number of sandbox calls currently holding a worker.
    pub fn in_flight(&self) -> usize {
        self.config.max_workers - self.permits.available_permits()
    }

    /// Number of calls waiting for a worker.
    pub fn queued(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Run `source` against `context` on the pool.
    ///
    /// `timeout` overrides the configured default deadline. Returns within
    /// the deadline plus scheduling slack; never waits for a worker that
    /// ignores its interrupt.
    pub async fn dispatch(
        &self,
        source: &str,
        context: &Map,
        timeout: Option<Duration>,
    ) -> Result<ExecutionResult, DispatchError> {
        if self.shutdown.is_cancelled() {
            return Err(DispatchError::ShutDown);
        }
        let deadline = timeout.unwrap_or(self.config.default_timeout);
        let started = Instant::now();
        let elapsed_ms = || started.elapsed().as_millis() as u64;

        let permit = match Arc::clone(&self.permits).try_acquire_owned() {
            Ok(permit) => permit,
            Err(TryAcquireError::Closed) => return Err(DispatchError::ShutDown),
            Err(TryAcquireError::NoPermits) => {
                let waiting = self.queued.fetch_add(1, Ordering::SeqCst);
                let _slot = QueueSlot(Arc::clone(&self.queued));
                if waiting >= self.config.max_queue_depth {
                    tracing::warn!(
                        queue_depth = waiting,
                        "Dispatch rejected: worker queue is full"
                    );
                    return Err(DispatchError::Rejected {
                        queue_depth: waiting,
                    });
                }
                let acquire = Arc::clone(&self.permits).acquire_owned();
                match tokio::time::timeout(deadline, acquire).await {
                    Ok(Ok(permit)) => permit,
                    Ok(Err(_closed)) => return Err(DispatchError::ShutDown),
                    Err(_elapsed) => {
                        tracing::warn!(
                            timeout_ms = deadline.as_millis() as u64,
                            "Deadline elapsed while waiting for a worker"
                        );
                        return Ok(ExecutionResult::deadline_elapsed(elapsed_ms()));
                    }
                }
            }
        };

        let call_token = self.shutdown.child_token();
        // Abandoning this future (caller dropped) interrupts the worker too.
        let _interrupt_on_drop = call_token.clone().drop_guard();

        let source = source.to_owned();
        let context = context.clone();
        let limits = self.config.limits.clone();
        let worker_token = call_token.clone();
        let runner = self.runner;
        let handle = self.tracker.spawn_blocking(move || {
            // Held until the sandbox has actually returned.
            let _permit = permit;
            runner(&source, &context, &limits, &worker_token)
        });

        let remaining = deadline.saturating_sub(started.elapsed());
        match tokio::time::timeout(remaining, handle).await {
            Ok(Ok(run)) => Ok(ExecutionResult::from_run(run, elapsed_ms())),
            Ok(Err(join_error)) => {
                tracing::error!(error = %join_error, "Sandbox worker failed");
                Err(DispatchError::Internal(join_error.to_string()))
            }
            Err(_elapsed) => {
                call_token.cancel();
                tracing::warn!(
                    timeout_ms = deadline.as_millis() as u64,
                    "Script deadline elapsed; worker interrupted"
                );
                Ok(ExecutionResult::deadline_elapsed(elapsed_ms()))
            }
        }
    }

    /// Stop accepting work, interrupt in-flight runs, and wait up to `grace`
    /// for workers to finish. Returns `true` if every worker drained.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        tracing::info!(
            in_flight = self.in_flight(),
            queued = self.queued(),
            "Execution dispatcher shutting down"
        );
        self.shutdown.cancel();
        self.permits.close();
        self.tracker.close();

        let drained = tokio::time::timeout(grace, self.tracker.wait())
            .await
            .is_ok();
        if drained {
            tracing::info!("Execution dispatcher drained");
        } else {
            tracing::warn!(
                grace_ms = grace.as_millis() as u64,
                "Execution dispatcher did not drain within grace period"
            );
        }
        drained
    }
}

#[async_trait]
impl ScriptDispatcher for ExecutionDispatcher {
    async fn dispatch(
        &self,
        source: &str,
        context: &Map,
        timeout: Option<Duration>,
    ) -> Result<ExecutionResult, DispatchError> {
        ExecutionDispatcher::dispatch(self, source, context, timeout).await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
