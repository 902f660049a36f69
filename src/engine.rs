//! Execution engine: drives a plan step by step, publishes lifecycle
//! events, and self-heals recoverable failures through bounded replanning.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{PlannerError, StepError, TaskError};
use crate::executor::ActionExecutor;
use crate::monitor::{ExecutionEvent, ExecutionStatus, RunState, RuntimeMonitor};
use crate::planner::{Planner, ReplanScope};
use crate::policy::SafetyPolicy;

const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(10);

/// Engine tunables.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Bound on a single executor call.
    pub step_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            step_timeout: DEFAULT_STEP_TIMEOUT,
        }
    }
}

/// Pure gate over the global replan budget: given how many corrective plans
/// were already requested and what just failed, may the engine ask for
/// another one?
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self { max_retries }
    }

    pub fn should_replan(&self, attempts_used: u32, failure: &StepError) -> bool {
        failure.is_recoverable() && attempts_used < self.max_retries
    }
}

/// Terminal result of one task run. The monitor travels with it so callers
/// can inspect or persist the full event log.
pub struct FinishedTask {
    pub outcome: Result<(), TaskError>,
    pub monitor: RuntimeMonitor,
}

impl FinishedTask {
    pub fn succeeded(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn status(&self) -> ExecutionStatus {
        self.monitor.status()
    }
}

/// Drives one task run: `Pending → Running → {Completed, Failed}`.
/// Terminal states are absorbing; `run` consumes the engine.
pub struct ExecutionEngine<P, X> {
    planner: P,
    executor: X,
    monitor: RuntimeMonitor,
    policy: SafetyPolicy,
    config: EngineConfig,
    cancel: CancellationToken,
}

impl<P, X> ExecutionEngine<P, X>
where
    P: Planner,
    X: ActionExecutor,
{
    pub fn new(planner: P, executor: X) -> Self {
        Self {
            planner,
            executor,
            monitor: RuntimeMonitor::new(),
            policy: SafetyPolicy::default(),
            config: EngineConfig::default(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_policy(mut self, policy: SafetyPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Token that stops the run between steps, without self-healing.
    pub fn with_cancel_token(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Register an observer on this run's monitor.
    pub fn subscribe<F>(&mut self, observer: F)
    where
        F: FnMut(&ExecutionEvent) + Send + 'static,
    {
        self.monitor.subscribe(observer);
    }

    pub fn monitor(&self) -> &RuntimeMonitor {
        &self.monitor
    }

    /// Run the task to a terminal state. `max_retries` bounds the number of
    /// corrective plans requested across the whole run.
    pub async fn run(mut self, prompt: &str, max_retries: u32) -> FinishedTask {
        let retry = RetryPolicy::new(max_retries);
        let outcome = self.drive(prompt, retry).await;
        match &outcome {
            Ok(()) => {
                self.monitor.transition(RunState::Completed);
                tracing::info!(steps = self.monitor.status().completed, "task completed");
            }
            Err(error) => {
                self.monitor.transition(RunState::Failed);
                tracing::warn!(%error, "task failed");
            }
        }
        FinishedTask {
            outcome,
            monitor: self.monitor,
        }
    }

    async fn drive(&mut self, prompt: &str, retry: RetryPolicy) -> Result<(), TaskError> {
        tracing::info!(prompt, "requesting plan");
        let mut plan = self
            .planner
            .plan(prompt)
            .await
            .map_err(|e| TaskError::from_planner(e, 0))?;

        let execution_id = Uuid::new_v4();
        self.monitor.plan_activated(plan.len());
        self.monitor.transition(RunState::Running);
        tracing::info!(%execution_id, steps = plan.len(), "executing plan");

        let mut step_index: usize = 0;
        let mut attempts_used: u32 = 0;

        while step_index < plan.len() {
            // cancellation is honored between steps, never mid-action
            if self.cancel.is_cancelled() {
                return Err(TaskError::Cancelled { step: step_index });
            }

            let Some(action) = plan.get(step_index).cloned() else {
                break;
            };
            self.monitor
                .publish(ExecutionEvent::started(execution_id, step_index, &action));

            if let Err(detail) = self.policy.check(&action) {
                self.monitor.publish(ExecutionEvent::failed(
                    execution_id,
                    step_index,
                    &action,
                    format!("policy violation: {detail}"),
                ));
                return Err(TaskError::PolicyViolation {
                    step: step_index,
                    detail,
                });
            }

            match self
                .executor
                .execute(&action, self.config.step_timeout)
                .await
            {
                Ok(report) => {
                    let event = ExecutionEvent::success(execution_id, step_index, &action)
                        .with_url(report.url)
                        .with_screenshot(report.screenshot.map(|p| p.display().to_string()));
                    self.monitor.publish(event);
                    step_index += 1;
                }
                Err(error) => {
                    let screenshot = self.executor.failure_screenshot(step_index).await;
                    self.monitor.publish(
                        ExecutionEvent::failed(
                            execution_id,
                            step_index,
                            &action,
                            error.to_string(),
                        )
                        .with_screenshot(screenshot.map(|p| p.display().to_string())),
                    );

                    if !retry.should_replan(attempts_used, &StepError::Executor(error.clone())) {
                        return Err(TaskError::RetriesExhausted {
                            step: step_index,
                            attempts: attempts_used,
                            last: error,
                        });
                    }

                    let snapshot = self.executor.snapshot().await;
                    tracing::info!(
                        step = step_index,
                        attempt = attempts_used + 1,
                        "requesting corrective plan"
                    );
                    let refinement = self
                        .planner
                        .refine(&plan, step_index, &error.to_string(), &snapshot)
                        .await
                        .map_err(|e| TaskError::from_planner(e, step_index))?;
                    if refinement.plan.is_empty() {
                        return Err(TaskError::from_planner(
                            PlannerError::EmptyRefinement,
                            step_index,
                        ));
                    }

                    attempts_used += 1;
                    match refinement.scope {
                        ReplanScope::FullPlan => {
                            plan = refinement.plan;
                            step_index = 0;
                        }
                        ReplanScope::ReplaceFailedStep => {
                            // resume at the failed index, now holding the
                            // replacement's first action
                            plan = plan.splice(step_index, &refinement.plan);
                        }
                    }
                    self.monitor.plan_activated(plan.len());
                }
            }
        }

        Ok(())
    }
}
