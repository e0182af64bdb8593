//! Saga orchestrator: definition registry, step executor, compensation engine.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use chrono::Utc;
use serde::Serialize;
use serde_json::{Value, json};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;

use common::CorrelationId;
use event_bus::EventBus;
use stream_broker::StreamBroker;

use crate::definition::{SagaDefinition, StepDefinition};
use crate::error::{Result, SagaError};
use crate::events;
use crate::instance::{Saga, SagaId};
use crate::status::SagaStatus;

/// Aggregate statistics over all saga instances in this process.
#[derive(Debug, Clone, Serialize)]
pub struct SagaStats {
    /// Total instances ever started (including finished ones).
    pub total_sagas: usize,

    /// Instance counts keyed by status name.
    pub by_status: HashMap<String, usize>,

    /// Mean wall-clock milliseconds from start to `completed`, if any
    /// saga has completed.
    pub avg_completion_ms: Option<f64>,

    /// Fraction of finished sagas that ended via compensation.
    pub compensation_rate: f64,
}

/// One live saga instance plus its cancellation flag.
///
/// The instance is mutated only by its own execution task; `cancelled` is
/// the one signal outside callers may raise, observed cooperatively between
/// steps and retry sleeps.
#[derive(Clone)]
struct SagaHandle {
    saga: Arc<RwLock<Saga>>,
    cancelled: Arc<AtomicBool>,
}

/// Coordinates multi-step distributed transactions.
///
/// Definitions are registered once and are immutable afterwards. Each
/// started saga runs on its own task, executing steps strictly in order
/// and compensating completed steps in reverse order on failure. Every
/// lifecycle transition is published through the event bus.
pub struct SagaOrchestrator<B: StreamBroker> {
    bus: Arc<EventBus<B>>,
    definitions: RwLock<HashMap<String, Arc<SagaDefinition>>>,
    instances: RwLock<HashMap<SagaId, SagaHandle>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<B: StreamBroker + 'static> SagaOrchestrator<B> {
    /// Creates an orchestrator publishing lifecycle events on the given bus.
    pub fn new(bus: Arc<EventBus<B>>) -> Self {
        Self {
            bus,
            definitions: RwLock::new(HashMap::new()),
            instances: RwLock::new(HashMap::new()),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Registers a saga definition.
    ///
    /// Fails fast on an empty name, an empty step list, or a name that is
    /// already registered. Definitions cannot be replaced within a running
    /// process.
    pub async fn register_definition(&self, definition: SagaDefinition) -> Result<()> {
        if definition.name.trim().is_empty() {
            return Err(SagaError::InvalidDefinition("name must not be empty".into()));
        }
        if definition.steps.is_empty() {
            return Err(SagaError::InvalidDefinition(format!(
                "definition '{}' has no steps",
                definition.name
            )));
        }

        let mut definitions = self.definitions.write().await;
        if definitions.contains_key(&definition.name) {
            return Err(SagaError::DuplicateDefinition(definition.name));
        }
        tracing::info!(
            saga_name = %definition.name,
            steps = definition.steps.len(),
            "saga definition registered"
        );
        definitions.insert(definition.name.clone(), Arc::new(definition));
        Ok(())
    }

    /// Starts a new saga instance and returns its ID immediately.
    ///
    /// Execution continues asynchronously on a dedicated task; failures are
    /// tracked against the returned ID and observable via [`get_saga`]
    /// (fire-and-continue, not fire-and-forget). Only an unknown definition
    /// name fails synchronously.
    ///
    /// [`get_saga`]: SagaOrchestrator::get_saga
    #[tracing::instrument(skip(self, initial_data))]
    pub async fn start_saga(
        self: &Arc<Self>,
        name: &str,
        initial_data: Value,
        correlation_id: Option<CorrelationId>,
    ) -> Result<SagaId> {
        let definition = self
            .definitions
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| SagaError::DefinitionNotFound(name.to_string()))?;

        let saga = Saga::new(
            name,
            correlation_id.unwrap_or_default(),
            definition.step_names(),
            initial_data,
        );
        let saga_id = saga.id;
        let handle = SagaHandle {
            saga: Arc::new(RwLock::new(saga)),
            cancelled: Arc::new(AtomicBool::new(false)),
        };
        self.instances.write().await.insert(saga_id, handle.clone());

        metrics::counter!("saga_executions_total").increment(1);
        tracing::info!(%saga_id, saga_name = %name, "saga started");

        let this = Arc::clone(self);
        let task = tokio::spawn(async move {
            this.run_saga(definition, handle).await;
        });
        self.tasks.lock().await.push(task);

        Ok(saga_id)
    }

    /// Retries a failed saga from step 0.
    ///
    /// Only valid from `failed`. The instance is reset to `pending` with a
    /// cleared error and compensation record, then re-executed from scratch;
    /// steps must therefore be safe to re-run from the start.
    #[tracing::instrument(skip(self))]
    pub async fn retry_saga(self: &Arc<Self>, saga_id: SagaId) -> Result<()> {
        let handle = self.handle_for(saga_id).await?;
        let definition = {
            let saga = handle.saga.read().await;
            if saga.status != SagaStatus::Failed {
                return Err(SagaError::InvalidStatus {
                    saga_id,
                    expected: "failed",
                    actual: saga.status,
                });
            }
            self.definitions
                .read()
                .await
                .get(&saga.name)
                .cloned()
                .ok_or_else(|| SagaError::DefinitionNotFound(saga.name.clone()))?
        };

        handle.saga.write().await.reset_for_retry()?;
        handle.cancelled.store(false, Ordering::SeqCst);
        metrics::counter!("saga_retries_total").increment(1);
        tracing::info!(%saga_id, "saga retry started");

        let this = Arc::clone(self);
        let task_handle = handle.clone();
        let task = tokio::spawn(async move {
            this.run_saga(definition, task_handle).await;
        });
        self.tasks.lock().await.push(task);
        Ok(())
    }

    /// Cancels a saga that has not yet finished.
    ///
    /// A pending or running saga observes the cancellation at its next step
    /// boundary, fails with a "cancelled" error, and compensates. A saga
    /// already in `failed` is compensated immediately. Terminal sagas
    /// reject cancellation; a compensating saga is already tearing down, so
    /// the call is a no-op.
    #[tracing::instrument(skip(self))]
    pub async fn cancel_saga(self: &Arc<Self>, saga_id: SagaId) -> Result<()> {
        let handle = self.handle_for(saga_id).await?;
        let (status, name) = {
            let saga = handle.saga.read().await;
            (saga.status, saga.name.clone())
        };

        match status {
            SagaStatus::Completed | SagaStatus::Compensated => Err(SagaError::InvalidStatus {
                saga_id,
                expected: "an unfinished status",
                actual: status,
            }),
            SagaStatus::Pending | SagaStatus::Running => {
                handle.cancelled.store(true, Ordering::SeqCst);
                tracing::info!(%saga_id, "saga cancellation requested");
                Ok(())
            }
            SagaStatus::Compensating => Ok(()),
            SagaStatus::Failed => {
                // No execution task is alive for a failed saga, so run the
                // compensation pass from here.
                let definition = self
                    .definitions
                    .read()
                    .await
                    .get(&name)
                    .cloned()
                    .ok_or(SagaError::DefinitionNotFound(name))?;
                {
                    let mut saga = handle.saga.write().await;
                    saga.error = Some("cancelled".into());
                    saga.updated_at = Utc::now();
                }
                self.publish_lifecycle(&handle, events::SAGA_CANCELLED, json!({}))
                    .await;
                tracing::info!(%saga_id, "failed saga cancelled, compensating");

                let this = Arc::clone(self);
                let task = tokio::spawn(async move {
                    this.compensate(&definition, &handle).await;
                });
                self.tasks.lock().await.push(task);
                Ok(())
            }
        }
    }

    /// Returns a snapshot of the saga, if it exists.
    pub async fn get_saga(&self, saga_id: SagaId) -> Option<Saga> {
        let handle = self.instances.read().await.get(&saga_id).cloned()?;
        Some(handle.saga.read().await.clone())
    }

    /// Returns snapshots of all sagas sharing the given correlation ID.
    pub async fn get_sagas_by_correlation(&self, correlation_id: CorrelationId) -> Vec<Saga> {
        self.snapshot_matching(|s| s.correlation_id == correlation_id)
            .await
    }

    /// Returns snapshots of all sagas currently in the given status.
    pub async fn get_sagas_by_status(&self, status: SagaStatus) -> Vec<Saga> {
        self.snapshot_matching(|s| s.status == status).await
    }

    /// Returns aggregate statistics over all instances.
    pub async fn get_stats(&self) -> SagaStats {
        let sagas = self.snapshot_matching(|_| true).await;
        let total_sagas = sagas.len();

        let mut by_status: HashMap<String, usize> = HashMap::new();
        let mut completion_ms: Vec<f64> = Vec::new();
        let mut finished = 0usize;
        let mut compensated = 0usize;
        for saga in &sagas {
            *by_status.entry(saga.status.as_str().to_string()).or_default() += 1;
            match saga.status {
                SagaStatus::Completed => {
                    finished += 1;
                    if let Some(elapsed) = saga.completion_time() {
                        completion_ms.push(elapsed.num_milliseconds() as f64);
                    }
                }
                SagaStatus::Compensated => {
                    finished += 1;
                    compensated += 1;
                }
                SagaStatus::Failed => finished += 1,
                _ => {}
            }
        }

        let avg_completion_ms = if completion_ms.is_empty() {
            None
        } else {
            Some(completion_ms.iter().sum::<f64>() / completion_ms.len() as f64)
        };
        let compensation_rate = if finished == 0 {
            0.0
        } else {
            compensated as f64 / finished as f64
        };

        SagaStats {
            total_sagas,
            by_status,
            avg_completion_ms,
            compensation_rate,
        }
    }

    /// Waits for every spawned saga task to finish.
    pub async fn shutdown(&self) {
        let tasks: Vec<_> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        tracing::info!("saga orchestrator shut down");
    }

    async fn handle_for(&self, saga_id: SagaId) -> Result<SagaHandle> {
        self.instances
            .read()
            .await
            .get(&saga_id)
            .cloned()
            .ok_or(SagaError::SagaNotFound(saga_id))
    }

    async fn snapshot_matching(&self, predicate: impl Fn(&Saga) -> bool) -> Vec<Saga> {
        let handles: Vec<SagaHandle> = self.instances.read().await.values().cloned().collect();
        let mut out = Vec::new();
        for handle in handles {
            let saga = handle.saga.read().await;
            if predicate(&saga) {
                out.push(saga.clone());
            }
        }
        out
    }

    /// Drives one saga's forward execution to a terminal outcome.
    async fn run_saga(self: Arc<Self>, definition: Arc<SagaDefinition>, handle: SagaHandle) {
        let started = Instant::now();

        {
            let mut saga = handle.saga.write().await;
            if let Err(e) = saga.transition(SagaStatus::Running) {
                tracing::warn!(saga_id = %saga.id, error = %e, "saga could not start");
                return;
            }
        }
        self.publish_lifecycle(&handle, events::SAGA_STARTED, json!({}))
            .await;

        for (index, step) in definition.steps.iter().enumerate() {
            {
                let mut saga = handle.saga.write().await;
                saga.current_step = index;
                saga.updated_at = Utc::now();
            }
            // Cancellation is observed here and between retry sleeps, never
            // mid-action. `current_step` already points at this step, so
            // compensation covers exactly the steps before it.
            if handle.cancelled.load(Ordering::SeqCst) {
                self.fail_and_compensate(&definition, &handle, &step.name, "cancelled".into())
                    .await;
                return;
            }
            let data = handle.saga.read().await.data.clone();

            match self.execute_step(&definition, step, data, &handle).await {
                Ok(new_data) => {
                    {
                        let mut saga = handle.saga.write().await;
                        saga.data = new_data;
                        saga.updated_at = Utc::now();
                    }
                    tracing::info!(step = %step.name, step_index = index, "saga step completed");
                    self.publish_lifecycle(
                        &handle,
                        events::SAGA_STEP_COMPLETED,
                        json!({"step": step.name, "step_index": index}),
                    )
                    .await;
                }
                Err(error) => {
                    self.fail_and_compensate(&definition, &handle, &step.name, error)
                        .await;
                    metrics::histogram!("saga_duration_seconds")
                        .record(started.elapsed().as_secs_f64());
                    return;
                }
            }
        }

        {
            let mut saga = handle.saga.write().await;
            saga.current_step = definition.steps.len();
            if let Err(e) = saga.transition(SagaStatus::Completed) {
                tracing::warn!(saga_id = %saga.id, error = %e, "saga could not complete");
                return;
            }
        }
        self.publish_lifecycle(&handle, events::SAGA_COMPLETED, json!({}))
            .await;
        metrics::counter!("saga_completed_total").increment(1);
        metrics::histogram!("saga_duration_seconds").record(started.elapsed().as_secs_f64());
    }

    /// Runs one forward action under its timeout and retry policy.
    ///
    /// Returns the step's output data, or the last error once the retry
    /// budget is exhausted. Step errors never escape further than this:
    /// the caller converts them into a compensation decision.
    async fn execute_step(
        &self,
        definition: &SagaDefinition,
        step: &StepDefinition,
        data: Value,
        handle: &SagaHandle,
    ) -> std::result::Result<Value, String> {
        let timeout = step.effective_timeout(definition.default_step_timeout);
        let mut last_error = String::new();

        for attempt in 1..=step.retry.max_attempts.max(1) {
            match tokio::time::timeout(timeout, step.action.run(&data)).await {
                Ok(Ok(output)) => return Ok(output),
                Ok(Err(e)) => last_error = e.to_string(),
                Err(_) => last_error = format!("step '{}' timed out after {timeout:?}", step.name),
            }
            metrics::counter!("saga_step_failures_total").increment(1);
            tracing::warn!(
                step = %step.name,
                attempt,
                max_attempts = step.retry.max_attempts,
                error = %last_error,
                "saga step attempt failed"
            );
            if attempt < step.retry.max_attempts {
                tokio::time::sleep(step.retry.delay_after(attempt)).await;
                if handle.cancelled.load(Ordering::SeqCst) {
                    return Err("cancelled".into());
                }
            }
        }
        Err(last_error)
    }

    /// Marks the saga failed and runs the compensation pass.
    async fn fail_and_compensate(
        &self,
        definition: &SagaDefinition,
        handle: &SagaHandle,
        step_name: &str,
        error: String,
    ) {
        let cancelled = handle.cancelled.load(Ordering::SeqCst);
        let error = if cancelled { "cancelled".to_string() } else { error };

        {
            let mut saga = handle.saga.write().await;
            saga.error = Some(error.clone());
            if let Err(e) = saga.transition(SagaStatus::Failed) {
                tracing::warn!(saga_id = %saga.id, error = %e, "saga could not fail");
                return;
            }
        }

        if cancelled {
            self.publish_lifecycle(handle, events::SAGA_CANCELLED, json!({"step": step_name}))
                .await;
        } else {
            self.publish_lifecycle(
                handle,
                events::SAGA_STEP_FAILED,
                json!({"step": step_name, "error": error}),
            )
            .await;
        }
        self.publish_lifecycle(handle, events::SAGA_FAILED, json!({"error": error}))
            .await;
        metrics::counter!("saga_failed_total").increment(1);

        self.compensate(definition, handle).await;
    }

    /// Compensates completed steps in reverse order.
    ///
    /// Walks from the step before the failure down to step 0, invoking each
    /// defined compensating action that has not already run. A failing
    /// compensator stops the pass immediately and leaves the saga `failed`;
    /// partially-compensated sagas are reported, never silently retried.
    /// With nothing to undo the saga simply stays `failed`, which keeps it
    /// eligible for [`retry_saga`].
    ///
    /// [`retry_saga`]: SagaOrchestrator::retry_saga
    async fn compensate(&self, definition: &SagaDefinition, handle: &SagaHandle) {
        let (upper, already_compensated) = {
            let saga = handle.saga.read().await;
            (saga.current_step, saga.compensated_steps.clone())
        };

        let pending: Vec<usize> = (0..upper.min(definition.steps.len()))
            .rev()
            .filter(|&i| {
                definition.steps[i].compensation.is_some()
                    && !already_compensated.contains(&definition.steps[i].name)
            })
            .collect();
        if pending.is_empty() {
            return;
        }

        {
            let mut saga = handle.saga.write().await;
            if let Err(e) = saga.transition(SagaStatus::Compensating) {
                tracing::warn!(saga_id = %saga.id, error = %e, "saga could not compensate");
                return;
            }
        }
        self.publish_lifecycle(
            handle,
            events::SAGA_COMPENSATION_STARTED,
            json!({"steps": pending.len()}),
        )
        .await;

        for index in pending {
            let step = &definition.steps[index];
            let Some(compensation) = step.compensation.as_ref() else {
                continue;
            };
            let timeout = step.effective_timeout(definition.default_step_timeout);
            let data = handle.saga.read().await.data.clone();

            let outcome = match tokio::time::timeout(timeout, compensation.run(&data)).await {
                Ok(Ok(_)) => Ok(()),
                Ok(Err(e)) => Err(e.to_string()),
                Err(_) => Err(format!(
                    "compensation for '{}' timed out after {timeout:?}",
                    step.name
                )),
            };

            match outcome {
                Ok(()) => {
                    {
                        let mut saga = handle.saga.write().await;
                        saga.compensated_steps.push(step.name.clone());
                        saga.updated_at = Utc::now();
                    }
                    tracing::info!(step = %step.name, "saga step compensated");
                    self.publish_lifecycle(
                        handle,
                        events::SAGA_STEP_COMPENSATED,
                        json!({"step": step.name, "step_index": index}),
                    )
                    .await;
                }
                Err(error) => {
                    let message = format!("compensation failed at step '{}': {error}", step.name);
                    {
                        let mut saga = handle.saga.write().await;
                        saga.error = Some(message.clone());
                        if let Err(e) = saga.transition(SagaStatus::Failed) {
                            tracing::warn!(saga_id = %saga.id, error = %e, "saga stuck in compensation");
                            return;
                        }
                    }
                    tracing::error!(step = %step.name, error = %error, "saga compensation failed");
                    self.publish_lifecycle(
                        handle,
                        events::SAGA_COMPENSATION_FAILED,
                        json!({"step": step.name, "error": message}),
                    )
                    .await;
                    metrics::counter!("saga_compensation_failures_total").increment(1);
                    return;
                }
            }
        }

        {
            let mut saga = handle.saga.write().await;
            if let Err(e) = saga.transition(SagaStatus::Compensated) {
                tracing::warn!(saga_id = %saga.id, error = %e, "saga could not finish compensation");
                return;
            }
        }
        self.publish_lifecycle(handle, events::SAGA_COMPENSATED, json!({}))
            .await;
        metrics::counter!("saga_compensated_total").increment(1);
    }

    /// Publishes a lifecycle event from a current snapshot of the saga.
    ///
    /// Publish failures are logged, never propagated: lifecycle events are
    /// observability, and saga execution must not stall on the bus.
    async fn publish_lifecycle(&self, handle: &SagaHandle, event_type: &str, detail: Value) {
        let snapshot = handle.saga.read().await.clone();
        let event = events::lifecycle_event(&snapshot, event_type, detail);
        if let Err(e) = self.bus.publish(event).await {
            tracing::warn!(
                saga_id = %snapshot.id,
                event_type,
                error = %e,
                "failed to publish saga lifecycle event"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{FnAction, StepDefinition};
    use message_queue::MessageQueue;
    use stream_broker::InMemoryBroker;

    fn orchestrator() -> Arc<SagaOrchestrator<InMemoryBroker>> {
        let queue = Arc::new(MessageQueue::new(InMemoryBroker::new()));
        Arc::new(SagaOrchestrator::new(Arc::new(EventBus::new(queue))))
    }

    fn noop_step(name: &str) -> StepDefinition {
        StepDefinition::new(
            name,
            Arc::new(FnAction(|data: Value| async move { Ok(data) })),
        )
    }

    #[tokio::test]
    async fn test_duplicate_definition_is_rejected() {
        let orchestrator = orchestrator();
        orchestrator
            .register_definition(SagaDefinition::new("fulfillment", vec![noop_step("a")]))
            .await
            .unwrap();
        let err = orchestrator
            .register_definition(SagaDefinition::new("fulfillment", vec![noop_step("a")]))
            .await
            .unwrap_err();
        assert!(matches!(err, SagaError::DuplicateDefinition(_)));
    }

    #[tokio::test]
    async fn test_empty_definition_is_rejected() {
        let orchestrator = orchestrator();
        let err = orchestrator
            .register_definition(SagaDefinition::new("empty", Vec::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, SagaError::InvalidDefinition(_)));
    }

    #[tokio::test]
    async fn test_start_saga_with_unknown_name_fails_synchronously() {
        let orchestrator = orchestrator();
        let err = orchestrator
            .start_saga("missing", json!({}), None)
            .await
            .unwrap_err();
        assert!(matches!(err, SagaError::DefinitionNotFound(_)));
    }

    #[tokio::test]
    async fn test_unknown_saga_queries_return_empty() {
        let orchestrator = orchestrator();
        assert!(orchestrator.get_saga(SagaId::new()).await.is_none());
        assert!(
            orchestrator
                .get_sagas_by_status(SagaStatus::Running)
                .await
                .is_empty()
        );
        let stats = orchestrator.get_stats().await;
        assert_eq!(stats.total_sagas, 0);
        assert_eq!(stats.compensation_rate, 0.0);
    }
}
