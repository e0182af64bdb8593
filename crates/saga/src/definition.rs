//! Saga definitions: named, ordered step lists with retry and compensation.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

/// Default timeout applied to a step or compensating action that does not
/// set its own.
pub const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(30);

/// Error type a step action may fail with.
pub type StepError = Box<dyn std::error::Error + Send + Sync>;

/// Result type for step action invocations.
pub type StepResult = std::result::Result<Value, StepError>;

/// A forward or compensating action of a saga step.
///
/// Actions receive a snapshot of the saga's accumulated data. A forward
/// action returns the new saga data, which the next step sees; a
/// compensating action's returned value is discarded. Actions run under the
/// step's timeout and must tolerate being abandoned mid-flight once that
/// timeout elapses.
#[async_trait]
pub trait StepAction: Send + Sync {
    /// Runs the action against the current saga data.
    async fn run(&self, data: &Value) -> StepResult;
}

/// Adapter turning an async closure into a [`StepAction`].
pub struct FnAction<F>(pub F);

#[async_trait]
impl<F, Fut> StepAction for FnAction<F>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = StepResult> + Send,
{
    async fn run(&self, data: &Value) -> StepResult {
        (self.0)(data.clone()).await
    }
}

/// Retry policy for one step's forward action.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first. `1` means no retry.
    pub max_attempts: u32,

    /// Delay before the first retry.
    pub delay: Duration,

    /// Multiplier applied to the delay for each subsequent retry.
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            delay: Duration::from_secs(1),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Returns the delay to sleep after `failed_attempt` (1-based) before
    /// the next attempt: `delay * backoff_multiplier^(failed_attempt - 1)`.
    pub fn delay_after(&self, failed_attempt: u32) -> Duration {
        let exponent = failed_attempt.saturating_sub(1) as i32;
        let secs = self.delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        Duration::from_secs_f64(secs)
    }
}

/// One step of a saga: a forward action plus optional compensation.
#[derive(Clone)]
pub struct StepDefinition {
    /// Step name, unique within its saga definition.
    pub name: String,

    /// The forward action.
    pub action: Arc<dyn StepAction>,

    /// Undo action invoked during compensation, newest-completed first.
    pub compensation: Option<Arc<dyn StepAction>>,

    /// Retry policy for the forward action.
    pub retry: RetryPolicy,

    /// Per-step timeout; falls back to the definition default when unset.
    pub timeout: Option<Duration>,
}

impl StepDefinition {
    /// Creates a step with the given forward action and default policy.
    pub fn new(name: impl Into<String>, action: Arc<dyn StepAction>) -> Self {
        Self {
            name: name.into(),
            action,
            compensation: None,
            retry: RetryPolicy::default(),
            timeout: None,
        }
    }

    /// Attaches a compensating action.
    pub fn with_compensation(mut self, compensation: Arc<dyn StepAction>) -> Self {
        self.compensation = Some(compensation);
        self
    }

    /// Overrides the retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Overrides the step timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Returns the effective timeout for this step's actions.
    pub fn effective_timeout(&self, default: Duration) -> Duration {
        self.timeout.unwrap_or(default)
    }
}

impl std::fmt::Debug for StepDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepDefinition")
            .field("name", &self.name)
            .field("has_compensation", &self.compensation.is_some())
            .field("retry", &self.retry)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// A named, immutable saga blueprint.
///
/// Definitions are registered once per process; `start_saga` clones the
/// step list into the new instance, so a running saga never observes the
/// registry.
#[derive(Clone)]
pub struct SagaDefinition {
    /// Definition name, unique within the orchestrator.
    pub name: String,

    /// Ordered forward steps.
    pub steps: Vec<StepDefinition>,

    /// Timeout applied to steps that do not set their own.
    pub default_step_timeout: Duration,
}

impl SagaDefinition {
    /// Creates a definition with the default step timeout.
    pub fn new(name: impl Into<String>, steps: Vec<StepDefinition>) -> Self {
        Self {
            name: name.into(),
            steps,
            default_step_timeout: DEFAULT_STEP_TIMEOUT,
        }
    }

    /// Overrides the default step timeout.
    pub fn with_default_step_timeout(mut self, timeout: Duration) -> Self {
        self.default_step_timeout = timeout;
        self
    }

    /// Returns the step names in execution order.
    pub fn step_names(&self) -> Vec<String> {
        self.steps.iter().map(|s| s.name.clone()).collect()
    }
}

impl std::fmt::Debug for SagaDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SagaDefinition")
            .field("name", &self.name)
            .field("steps", &self.steps)
            .field("default_step_timeout", &self.default_step_timeout)
            .finish()
    }
}
