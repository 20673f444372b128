//! Central script orchestrator service.
//!
//! Coordinates script lookup, execution record lifecycle, dispatcher calls,
//! and result recording. Held in [`AppState`](crate::state::AppState) as an
//! `Arc<ScriptOrchestrator>`.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use scriptbox_core::error::CoreError;
use scriptbox_core::script_types::{validate_trigger_entity, ScriptDefinition, TriggerEvent};
use scriptbox_core::scripting::dispatcher::{DispatchError, ExecutionResult, ScriptDispatcher};
use scriptbox_core::scripting::status::{ExecutionRecord, ExecutionRequest, ExecutionStatus};
use scriptbox_core::scripting::store::{ExecutionStats, HistoryStore, ScriptRegistry, StoreError};
use scriptbox_core::types::EntityId;
use scriptbox_core::value::{Map, Value};

/// Default page size for execution history.
pub const DEFAULT_HISTORY_LIMIT: i64 = 25;

/// Largest page size for execution history.
pub const MAX_HISTORY_LIMIT: i64 = 100;

/// Attempts made to persist a terminal record.
const TERMINAL_SAVE_ATTEMPTS: u32 = 3;

/// Base delay between terminal save attempts; grows linearly.
const TERMINAL_SAVE_BACKOFF: Duration = Duration::from_millis(50);

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Failures that prevent a run from producing a recorded outcome.
///
/// Script failures are never reported here; they end up in the record.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("script registry failed: {0}")]
    Registry(StoreError),

    #[error("execution history failed: {0}")]
    History(StoreError),

    /// The lifecycle task died before producing an outcome.
    #[error("execution task aborted: {0}")]
    Aborted(String),
}

/// A batch of scripts fired by a domain event.
#[derive(Debug, Clone)]
pub struct TriggerRequest {
    pub tenant_id: EntityId,
    pub event: TriggerEvent,
    pub entity_name: String,
    pub data: Map,
    pub invoker_id: Option<EntityId>,
}

/// Terminal record plus the dispatcher result it was built from.
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub record: ExecutionRecord,
    pub result: ExecutionResult,
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// Orchestrates sandboxed script runs and their history.
///
/// Manages the full lifecycle:
/// 1. Resolve the script through the registry.
/// 2. Persist an execution record in `RUNNING`.
/// 3. Dispatch the source to a sandbox worker.
/// 4. Map the outcome to `SUCCESS`, `FAILED` or `TIMEOUT`.
/// 5. Persist the terminal record and hand it back.
///
/// Steps 2 through 5 run on their own task, so a caller that stops waiting
/// (client disconnect, request timeout) cannot strand a `RUNNING` record.
#[derive(Clone)]
pub struct ScriptOrchestrator {
    registry: Arc<dyn ScriptRegistry>,
    history: Arc<dyn HistoryStore>,
    dispatcher: Arc<dyn ScriptDispatcher>,
}

impl ScriptOrchestrator {
    pub fn new(
        registry: Arc<dyn ScriptRegistry>,
        history: Arc<dyn HistoryStore>,
        dispatcher: Arc<dyn ScriptDispatcher>,
    ) -> Self {
        Self {
            registry,
            history,
            dispatcher,
        }
    }

    /// Run one script by id.
    ///
    /// Unknown scripts, and scripts owned by another tenant, are `NotFound`
    /// and leave no record behind. Inactive scripts still run.
    pub async fn execute(
        &self,
        request: ExecutionRequest,
    ) -> Result<ExecutionOutcome, OrchestratorError> {
        let script = self
            .registry
            .find_script_by_id(request.script_id)
            .await
            .map_err(OrchestratorError::Registry)?
            .filter(|script| script.tenant_id == request.tenant_id)
            .ok_or(CoreError::NotFound {
                entity: "Script",
                id: request.script_id,
            })?;

        self.spawn_run(script, request).await
    }

    /// Run every active script matching the trigger, one after another.
    ///
    /// A failed or timed-out script never stops the batch. Outcomes come
    /// back in matcher order, one per matched script.
    pub async fn execute_trigger(
        &self,
        trigger: TriggerRequest,
    ) -> Result<Vec<ExecutionOutcome>, OrchestratorError> {
        validate_trigger_entity(&trigger.entity_name)?;

        let scripts = self
            .registry
            .find_active_scripts(trigger.tenant_id, trigger.event, &trigger.entity_name)
            .await
            .map_err(OrchestratorError::Registry)?;

        tracing::info!(
            tenant_id = %trigger.tenant_id,
            event = %trigger.event,
            entity = %trigger.entity_name,
            matched = scripts.len(),
            "Trigger batch started",
        );

        let mut outcomes = Vec::with_capacity(scripts.len());
        for script in scripts {
            let request = ExecutionRequest {
                script_id: script.id,
                tenant_id: trigger.tenant_id,
                invoker_id: trigger.invoker_id,
                input_context: trigger.data.clone(),
                timeout: None,
            };
            let outcome = match self.spawn_run(script.clone(), request.clone()).await {
                Ok(outcome) => outcome,
                Err(err) => unrecorded_failure(&script, &request, &err),
            };
            outcomes.push(outcome);
        }

        Ok(outcomes)
    }

    /// Execution records for one script, newest first.
    ///
    /// `limit` defaults to 25 and is capped at 100.
    pub async fn history(
        &self,
        script_id: EntityId,
        limit: Option<i64>,
        offset: Option<i64>,
    ) -> Result<Vec<ExecutionRecord>, OrchestratorError> {
        self.require_script(script_id).await?;
        let limit = limit
            .unwrap_or(DEFAULT_HISTORY_LIMIT)
            .clamp(1, MAX_HISTORY_LIMIT);
        let offset = offset.unwrap_or(0).max(0);
        self.history
            .list_for_script(script_id, limit, offset)
            .await
            .map_err(OrchestratorError::History)
    }

    /// Outcome counts and mean successful duration for one script.
    pub async fn stats(&self, script_id: EntityId) -> Result<ExecutionStats, OrchestratorError> {
        self.require_script(script_id).await?;
        self.history
            .stats_for_script(script_id)
            .await
            .map_err(OrchestratorError::History)
    }

    async fn require_script(&self, script_id: EntityId) -> Result<(), OrchestratorError> {
        self.registry
            .find_script_by_id(script_id)
            .await
            .map_err(OrchestratorError::Registry)?
            .map(|_| ())
            .ok_or_else(|| {
                OrchestratorError::Core(CoreError::NotFound {
                    entity: "Script",
                    id: script_id,
                })
            })
    }

    async fn spawn_run(
        &self,
        script: ScriptDefinition,
        request: ExecutionRequest,
    ) -> Result<ExecutionOutcome, OrchestratorError> {
        let this = self.clone();
        tokio::spawn(async move { this.run(script, request).await })
            .await
            .map_err(|err| OrchestratorError::Aborted(err.to_string()))?
    }

    async fn run(
        &self,
        script: ScriptDefinition,
        request: ExecutionRequest,
    ) -> Result<ExecutionOutcome, OrchestratorError> {
        let mut record = ExecutionRecord::start(&request, script.version);
        if let Err(err) = self.history.save(&record).await {
            tracing::error!(
                script_id = %script.id,
                execution_id = %record.id,
                error = %err,
                "Failed to record execution start; script not run",
            );
            return Err(OrchestratorError::History(err));
        }

        tracing::info!(
            script_id = %script.id,
            execution_id = %record.id,
            tenant_id = %request.tenant_id,
            version = script.version,
            "Script execution started",
        );

        let started = Instant::now();
        let dispatched = AssertUnwindSafe(self.dispatcher.dispatch(
            &script.source,
            &request.input_context,
            request.timeout,
        ))
        .catch_unwind()
        .await;
        let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        let result = match dispatched {
            Ok(Ok(result)) if result.interrupted => ExecutionResult {
                error: result.error.map(|e| format!("interrupted: {e}")),
                ..result
            },
            Ok(Ok(result)) => result,
            Ok(Err(err @ DispatchError::Rejected { .. })) => {
                failure(format!("dispatch_rejected: {err}"), elapsed_ms)
            }
            Ok(Err(err)) => failure(format!("interrupted: {err}"), elapsed_ms),
            Err(panic) => {
                tracing::error!(
                    execution_id = %record.id,
                    panic = %panic_message(panic.as_ref()),
                    "Dispatcher panicked",
                );
                failure("interrupted: dispatcher panicked".to_string(), elapsed_ms)
            }
        };

        let status = terminal_status(&result);
        let output = if result.success {
            result.value.clone()
        } else {
            None
        };
        close_record(&mut record, status, output, result.error.clone(), result.duration_ms);
        self.save_terminal(&record).await;

        tracing::info!(
            script_id = %script.id,
            execution_id = %record.id,
            status = %record.status,
            duration_ms = result.duration_ms,
            "Script execution finished",
        );

        Ok(ExecutionOutcome { record, result })
    }

    /// Persist a terminal record, retrying transient failures.
    ///
    /// A record that still cannot be saved is logged; the caller gets its
    /// outcome regardless.
    async fn save_terminal(&self, record: &ExecutionRecord) {
        for attempt in 1..=TERMINAL_SAVE_ATTEMPTS {
            match self.history.save(record).await {
                Ok(()) => return,
                Err(err) if attempt < TERMINAL_SAVE_ATTEMPTS => {
                    tracing::warn!(
                        execution_id = %record.id,
                        attempt,
                        error = %err,
                        "Terminal save failed, retrying",
                    );
                    tokio::time::sleep(TERMINAL_SAVE_BACKOFF * attempt).await;
                }
                Err(err) => {
                    tracing::error!(
                        execution_id = %record.id,
                        status = %record.status,
                        error = %err,
                        "Terminal save failed; record left unsaved",
                    );
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn terminal_status(result: &ExecutionResult) -> ExecutionStatus {
    if result.success {
        ExecutionStatus::Success
    } else if result.timed_out {
        ExecutionStatus::Timeout
    } else {
        ExecutionStatus::Failed
    }
}

/// Move a record to its terminal state. A refused transition still closes
/// the record, as `FAILED`, so it is never saved back as `RUNNING`.
fn close_record(
    record: &mut ExecutionRecord,
    status: ExecutionStatus,
    output: Option<Value>,
    error: Option<String>,
    duration_ms: u64,
) {
    if let Err(err) = record.finish(status, output, error, duration_ms) {
        tracing::error!(
            execution_id = %record.id,
            error = %err,
            "Terminal transition refused; closing record as FAILED",
        );
        record.status = ExecutionStatus::Failed;
        record.output_payload = None;
        record.error_message = Some(format!("interrupted: {err}"));
        record.duration_ms = Some(i64::try_from(duration_ms).unwrap_or(i64::MAX));
        record.completed_at = Some(chrono::Utc::now());
    }
}

fn failure(error: String, duration_ms: u64) -> ExecutionResult {
    ExecutionResult {
        success: false,
        value: None,
        error: Some(error),
        duration_ms,
        timed_out: false,
        interrupted: false,
        logs: Vec::new(),
        statements: 0,
    }
}

/// Batch entry for a script whose run could not be recorded at all.
fn unrecorded_failure(
    script: &ScriptDefinition,
    request: &ExecutionRequest,
    err: &OrchestratorError,
) -> ExecutionOutcome {
    tracing::error!(script_id = %script.id, error = %err, "Batch entry failed before dispatch");
    let result = failure(format!("interrupted: {err}"), 0);
    let mut record = ExecutionRecord::start(request, script.version);
    record.status = ExecutionStatus::Failed;
    record.error_message = result.error.clone();
    record.duration_ms = Some(0);
    record.completed_at = Some(chrono::Utc::now());
    ExecutionOutcome { record, result }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use chrono::Utc;
    use scriptbox_core::script_types::ScriptCategory;
    use scriptbox_core::scripting::config::{DispatcherConfig, SandboxLimits};
    use scriptbox_core::scripting::dispatcher::ExecutionDispatcher;
    use scriptbox_core::scripting::memory::{InMemoryHistoryStore, InMemoryScriptRegistry};
    use uuid::Uuid;

    use super::*;

    struct Harness {
        orchestrator: ScriptOrchestrator,
        registry: Arc<InMemoryScriptRegistry>,
        history: Arc<InMemoryHistoryStore>,
        dispatcher: Arc<ExecutionDispatcher>,
        tenant: EntityId,
    }

    fn dispatcher_config(max_workers: usize, max_queue_depth: usize) -> DispatcherConfig {
        DispatcherConfig {
            limits: SandboxLimits {
                max_statements: 1_000,
                ..SandboxLimits::default()
            },
            default_timeout: Duration::from_secs(10),
            max_workers,
            max_queue_depth,
        }
    }

    fn harness_with(config: DispatcherConfig) -> Harness {
        let registry = Arc::new(InMemoryScriptRegistry::new());
        let history = Arc::new(InMemoryHistoryStore::new());
        let dispatcher = Arc::new(ExecutionDispatcher::start(config));
        let orchestrator =
            ScriptOrchestrator::new(registry.clone(), history.clone(), dispatcher.clone());
        Harness {
            orchestrator,
            registry,
            history,
            dispatcher,
            tenant: Uuid::new_v4(),
        }
    }

    fn harness() -> Harness {
        harness_with(dispatcher_config(4, 16))
    }

    fn script(tenant_id: EntityId, source: &str) -> ScriptDefinition {
        ScriptDefinition {
            id: Uuid::new_v4(),
            tenant_id,
            name: "hook".to_string(),
            description: None,
            source: source.to_string(),
            category: ScriptCategory::Automation,
            trigger_event: TriggerEvent::AfterCreate,
            trigger_entity: Some("order".to_string()),
            is_active: true,
            version: 3,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    impl Harness {
        fn add(&self, source: &str) -> ScriptDefinition {
            let script = script(self.tenant, source);
            self.registry.insert(script.clone()).unwrap();
            script
        }

        fn request(&self, script_id: EntityId) -> ExecutionRequest {
            ExecutionRequest {
                script_id,
                tenant_id: self.tenant,
                invoker_id: None,
                input_context: Map::new(),
                timeout: None,
            }
        }

        fn trigger(&self) -> TriggerRequest {
            TriggerRequest {
                tenant_id: self.tenant,
                event: TriggerEvent::AfterCreate,
                entity_name: "order".to_string(),
                data: Map::new(),
                invoker_id: None,
            }
        }
    }

    /// History store whose saves fail on the listed call numbers (1-based).
    struct FlakyHistory {
        inner: InMemoryHistoryStore,
        calls: AtomicUsize,
        failing: Vec<usize>,
    }

    impl FlakyHistory {
        fn failing_on(failing: Vec<usize>) -> Self {
            Self {
                inner: InMemoryHistoryStore::new(),
                calls: AtomicUsize::new(0),
                failing,
            }
        }
    }

    #[async_trait]
    impl HistoryStore for FlakyHistory {
        async fn save(&self, record: &ExecutionRecord) -> Result<(), StoreError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.failing.contains(&call) {
                return Err(StoreError::Unavailable("connection reset".to_string()));
            }
            self.inner.save(record).await
        }

        async fn list_for_script(
            &self,
            script_id: EntityId,
            limit: i64,
            offset: i64,
        ) -> Result<Vec<ExecutionRecord>, StoreError> {
            self.inner.list_for_script(script_id, limit, offset).await
        }

        async fn stats_for_script(
            &self,
            script_id: EntityId,
        ) -> Result<ExecutionStats, StoreError> {
            self.inner.stats_for_script(script_id).await
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn success_is_recorded_with_output() {
        let h = harness();
        let script = h.add("return ERP.sum({1, 2, 3})");

        let outcome = h.orchestrator.execute(h.request(script.id)).await.unwrap();

        assert_eq!(outcome.record.status, ExecutionStatus::Success);
        assert_eq!(outcome.record.script_version, 3);
        assert_eq!(outcome.result.value, Some(Value::Int(6)));
        let stored = h.history.get(outcome.record.id).unwrap();
        assert_eq!(stored.status, ExecutionStatus::Success);
        assert_eq!(stored.output_payload, Some(Value::Int(6)));
        assert!(stored.completed_at.is_some());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn runtime_error_is_failed_with_null_output() {
        let h = harness();
        let script = h.add("local order = nil\nreturn order.total");

        let outcome = h.orchestrator.execute(h.request(script.id)).await.unwrap();

        assert_eq!(outcome.record.status, ExecutionStatus::Failed);
        assert!(outcome.record.output_payload.is_none());
        let error = outcome.record.error_message.unwrap();
        assert!(!error.is_empty());
        assert!(!error.contains("[string"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unbounded_loop_is_timeout() {
        let h = harness();
        let script = h.add("while true do end");
        let mut request = h.request(script.id);
        request.timeout = Some(Duration::from_secs(60));

        let started = Instant::now();
        let outcome = h.orchestrator.execute(request).await.unwrap();

        assert_eq!(outcome.record.status, ExecutionStatus::Timeout);
        assert!(outcome.result.timed_out);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unknown_script_is_not_found_and_unrecorded() {
        let h = harness();

        let err = h
            .orchestrator
            .execute(h.request(Uuid::new_v4()))
            .await
            .unwrap_err();

        assert_matches!(err, OrchestratorError::Core(CoreError::NotFound { .. }));
        assert!(h.history.all().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn other_tenants_script_is_not_found() {
        let h = harness();
        let foreign = script(Uuid::new_v4(), "return 1");
        h.registry.insert(foreign.clone()).unwrap();

        let err = h
            .orchestrator
            .execute(h.request(foreign.id))
            .await
            .unwrap_err();

        assert_matches!(err, OrchestratorError::Core(CoreError::NotFound { .. }));
        assert!(h.history.all().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn inactive_script_runs_manually() {
        let h = harness();
        let mut inactive = script(h.tenant, "return 'ran'");
        inactive.is_active = false;
        h.registry.insert(inactive.clone()).unwrap();

        let outcome = h.orchestrator.execute(h.request(inactive.id)).await.unwrap();

        assert_eq!(outcome.record.status, ExecutionStatus::Success);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn batch_keeps_order_and_survives_failures() {
        let h = harness();
        let first = h.add("return 'first'");
        let second = h.add("error('second broke')");
        let third = h.add("while true do end");
        let fourth = h.add("return 'fourth'");

        let outcomes = h.orchestrator.execute_trigger(h.trigger()).await.unwrap();

        let summary: Vec<(EntityId, ExecutionStatus)> = outcomes
            .iter()
            .map(|o| (o.record.script_id, o.record.status))
            .collect();
        assert_eq!(
            summary,
            vec![
                (first.id, ExecutionStatus::Success),
                (second.id, ExecutionStatus::Failed),
                (third.id, ExecutionStatus::Timeout),
                (fourth.id, ExecutionStatus::Success),
            ]
        );
        assert_eq!(
            outcomes[0].result.value,
            Some(Value::String("first".to_string()))
        );
        assert_eq!(
            outcomes[3].result.value,
            Some(Value::String("fourth".to_string()))
        );
        assert_eq!(h.history.all().len(), 4);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn batch_passes_data_to_every_script() {
        let h = harness();
        h.add("return total * 2");
        h.add("return total + 1");
        let mut trigger = h.trigger();
        trigger.data.insert("total".to_string(), Value::Int(10));

        let outcomes = h.orchestrator.execute_trigger(trigger).await.unwrap();

        let values: Vec<Option<Value>> = outcomes.into_iter().map(|o| o.result.value).collect();
        assert_eq!(values, vec![Some(Value::Int(20)), Some(Value::Int(11))]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn batch_with_no_matches_is_empty() {
        let h = harness();
        h.add("return 1");
        let mut trigger = h.trigger();
        trigger.entity_name = "invoice".to_string();

        let outcomes = h.orchestrator.execute_trigger(trigger).await.unwrap();

        assert!(outcomes.is_empty());
        assert!(h.history.all().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn batch_rejects_blank_entity() {
        let h = harness();
        let mut trigger = h.trigger();
        trigger.entity_name = "  ".to_string();

        let err = h.orchestrator.execute_trigger(trigger).await.unwrap_err();

        assert_matches!(err, OrchestratorError::Core(CoreError::Validation(_)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn full_queue_is_failed_dispatch_rejected() {
        // Only the deadline can end the blocker, so it holds the one worker.
        let mut config = dispatcher_config(1, 0);
        config.limits.max_statements = u64::MAX;
        let h = harness_with(config);
        let script = h.add("return 1");

        let busy_dispatcher = h.dispatcher.clone();
        let blocker = tokio::spawn(async move {
            busy_dispatcher
                .dispatch("while true do end", &Map::new(), Some(Duration::from_secs(2)))
                .await
        });
        for _ in 0..200 {
            if h.dispatcher.in_flight() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(h.dispatcher.in_flight(), 1);

        let outcome = h.orchestrator.execute(h.request(script.id)).await.unwrap();

        assert_eq!(outcome.record.status, ExecutionStatus::Failed);
        let error = outcome.record.error_message.unwrap();
        assert!(error.starts_with("dispatch_rejected:"), "{error}");
        blocker.await.unwrap().unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn shut_down_dispatcher_is_failed_interrupted() {
        let h = harness();
        let script = h.add("return 1");
        h.dispatcher.shutdown(Duration::from_secs(1)).await;

        let outcome = h.orchestrator.execute(h.request(script.id)).await.unwrap();

        assert_eq!(outcome.record.status, ExecutionStatus::Failed);
        let error = outcome.record.error_message.unwrap();
        assert!(error.starts_with("interrupted:"), "{error}");
        assert_eq!(
            h.history.get(outcome.record.id).unwrap().status,
            ExecutionStatus::Failed
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failed_start_save_skips_dispatch() {
        let registry = Arc::new(InMemoryScriptRegistry::new());
        let history = Arc::new(FlakyHistory::failing_on(vec![1]));
        let dispatcher = Arc::new(ExecutionDispatcher::start(dispatcher_config(2, 4)));
        let orchestrator = ScriptOrchestrator::new(registry.clone(), history.clone(), dispatcher);
        let tenant = Uuid::new_v4();
        let script = script(tenant, "return 1");
        registry.insert(script.clone()).unwrap();

        let err = orchestrator
            .execute(ExecutionRequest {
                script_id: script.id,
                tenant_id: tenant,
                invoker_id: None,
                input_context: Map::new(),
                timeout: None,
            })
            .await
            .unwrap_err();

        assert_matches!(err, OrchestratorError::History(StoreError::Unavailable(_)));
        assert_eq!(history.calls.load(Ordering::SeqCst), 1);
        assert!(history.inner.all().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn terminal_save_is_retried() {
        let registry = Arc::new(InMemoryScriptRegistry::new());
        let history = Arc::new(FlakyHistory::failing_on(vec![2, 3]));
        let dispatcher = Arc::new(ExecutionDispatcher::start(dispatcher_config(2, 4)));
        let orchestrator = ScriptOrchestrator::new(registry.clone(), history.clone(), dispatcher);
        let tenant = Uuid::new_v4();
        let script = script(tenant, "return 'saved'");
        registry.insert(script.clone()).unwrap();

        let outcome = orchestrator
            .execute(ExecutionRequest {
                script_id: script.id,
                tenant_id: tenant,
                invoker_id: None,
                input_context: Map::new(),
                timeout: None,
            })
            .await
            .unwrap();

        assert_eq!(history.calls.load(Ordering::SeqCst), 4);
        let stored = history.inner.get(outcome.record.id).unwrap();
        assert_eq!(stored.status, ExecutionStatus::Success);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn batch_entry_with_unrecordable_start_still_reports() {
        let registry = Arc::new(InMemoryScriptRegistry::new());
        // Call 1 is the first script's start; call 3 the second's start.
        let history = Arc::new(FlakyHistory::failing_on(vec![3]));
        let dispatcher = Arc::new(ExecutionDispatcher::start(dispatcher_config(2, 4)));
        let orchestrator = ScriptOrchestrator::new(registry.clone(), history.clone(), dispatcher);
        let tenant = Uuid::new_v4();
        let first = script(tenant, "return 1");
        let second = script(tenant, "return 2");
        let third = script(tenant, "return 3");
        for s in [&first, &second, &third] {
            registry.insert(s.clone()).unwrap();
        }

        let outcomes = orchestrator
            .execute_trigger(TriggerRequest {
                tenant_id: tenant,
                event: TriggerEvent::AfterCreate,
                entity_name: "order".to_string(),
                data: Map::new(),
                invoker_id: None,
            })
            .await
            .unwrap();

        let statuses: Vec<ExecutionStatus> = outcomes.iter().map(|o| o.record.status).collect();
        assert_eq!(
            statuses,
            vec![
                ExecutionStatus::Success,
                ExecutionStatus::Failed,
                ExecutionStatus::Success,
            ]
        );
        assert_eq!(outcomes[1].record.script_id, second.id);
        assert!(outcomes[1]
            .record
            .error_message
            .as_deref()
            .unwrap()
            .starts_with("interrupted:"));
        assert_eq!(history.inner.all().len(), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn no_record_is_left_running() {
        let h = harness();
        h.add("return 1");
        h.add("error('x')");
        h.add("while true do end");

        h.orchestrator.execute_trigger(h.trigger()).await.unwrap();

        assert!(h
            .history
            .all()
            .iter()
            .all(|record| record.status.is_terminal()));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn history_and_stats_follow_runs() {
        let h = harness();
        let script = h.add("return 1");
        for _ in 0..3 {
            h.orchestrator.execute(h.request(script.id)).await.unwrap();
        }

        let page = h
            .orchestrator
            .history(script.id, Some(2), None)
            .await
            .unwrap();
        assert_eq!(page.len(), 2);

        let stats = h.orchestrator.stats(script.id).await.unwrap();
        assert_eq!(stats.success_count, 3);
        assert_eq!(stats.failed_count, 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn history_for_unknown_script_is_not_found() {
        let h = harness();
        let err = h
            .orchestrator
            .history(Uuid::new_v4(), None, None)
            .await
            .unwrap_err();
        assert_matches!(err, OrchestratorError::Core(CoreError::NotFound { .. }));
    }

    #[test]
    fn status_mapping() {
        let mut result = failure("boom".to_string(), 1);
        assert_eq!(terminal_status(&result), ExecutionStatus::Failed);
        result.timed_out = true;
        assert_eq!(terminal_status(&result), ExecutionStatus::Timeout);
        result.success = true;
        assert_eq!(terminal_status(&result), ExecutionStatus::Success);
    }

    #[test]
    fn panic_payloads_are_described() {
        let boxed: Box<dyn Any + Send> = Box::new("static message");
        assert_eq!(panic_message(boxed.as_ref()), "static message");
        let boxed: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(boxed.as_ref()), "owned");
        let boxed: Box<dyn Any + Send> = Box::new(7_u8);
        assert_eq!(panic_message(boxed.as_ref()), "unknown panic");
    }

    /// Dispatcher stand-in for a broken worker pool.
    enum BrokenDispatcher {
        /// The dispatch future itself panics.
        Panics,
        /// The worker thread died; the pool reports it.
        WorkerDied,
    }

    #[async_trait]
    impl ScriptDispatcher for BrokenDispatcher {
        async fn dispatch(
            &self,
            _source: &str,
            _context: &Map,
            _timeout: Option<Duration>,
        ) -> Result<ExecutionResult, DispatchError> {
            match self {
                Self::Panics => panic!("dispatcher state corrupted"),
                Self::WorkerDied => Err(DispatchError::Internal("task panicked".to_string())),
            }
        }
    }

    async fn run_with_broken(
        dispatcher: BrokenDispatcher,
    ) -> (ExecutionOutcome, Vec<ExecutionRecord>) {
        let registry = Arc::new(InMemoryScriptRegistry::new());
        let history = Arc::new(InMemoryHistoryStore::new());
        let orchestrator =
            ScriptOrchestrator::new(registry.clone(), history.clone(), Arc::new(dispatcher));
        let tenant = Uuid::new_v4();
        let script = script(tenant, "return 1");
        registry.insert(script.clone()).unwrap();

        let outcome = orchestrator
            .execute(ExecutionRequest {
                script_id: script.id,
                tenant_id: tenant,
                invoker_id: None,
                input_context: Map::new(),
                timeout: None,
            })
            .await
            .unwrap();
        (outcome, history.all())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn dispatcher_panic_is_recorded_as_interrupted_failure() {
        let (outcome, stored) = run_with_broken(BrokenDispatcher::Panics).await;

        assert_eq!(outcome.record.status, ExecutionStatus::Failed);
        assert_eq!(
            outcome.record.error_message.as_deref(),
            Some("interrupted: dispatcher panicked")
        );
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].status, ExecutionStatus::Failed);
        assert_eq!(stored[0].error_message, outcome.record.error_message);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn worker_failure_is_recorded_as_interrupted_failure() {
        let (outcome, stored) = run_with_broken(BrokenDispatcher::WorkerDied).await;

        assert_eq!(outcome.record.status, ExecutionStatus::Failed);
        let message = outcome.record.error_message.as_deref().unwrap();
        assert!(message.starts_with("interrupted: worker failed"), "{message}");
        assert_eq!(stored.len(), 1);
        assert!(stored.iter().all(|record| record.status.is_terminal()));
    }

    #[test]
    fn refused_transition_still_closes_the_record() {
        let request = ExecutionRequest {
            script_id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            invoker_id: None,
            input_context: Map::new(),
            timeout: None,
        };
        let mut record = ExecutionRecord::start(&request, 1);

        close_record(
            &mut record,
            ExecutionStatus::Running,
            Some(Value::Int(1)),
            None,
            7,
        );

        assert_eq!(record.status, ExecutionStatus::Failed);
        assert_eq!(record.output_payload, None);
        assert_eq!(record.duration_ms, Some(7));
        assert!(record.completed_at.is_some());
        assert!(record
            .error_message
            .as_deref()
            .unwrap()
            .starts_with("interrupted:"));
    }
}
