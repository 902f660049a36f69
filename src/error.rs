//! Error taxonomy for planning and execution.

use std::time::Duration;

use thiserror::Error;

/// Planner-side failures. All are fatal to the run; a plan that names an
/// action outside the whitelist is classified as a policy violation by the
/// engine rather than a planning error.
#[derive(Debug, Error)]
pub enum PlannerError {
    #[error("planner request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("planner API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("planner returned no usable content")]
    EmptyResponse,

    #[error("planner returned a malformed plan: {0}")]
    Malformed(String),

    #[error("plan uses unsupported action '{0}'")]
    UnsupportedAction(String),

    #[error("refined plan contains no steps")]
    EmptyRefinement,
}

/// How a single executor call failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ExecutorErrorKind {
    #[error("timeout")]
    Timeout,
    #[error("element not found")]
    ElementNotFound,
    #[error("navigation failed")]
    Navigation,
    #[error("browser error")]
    Browser,
}

/// A runtime fault reported by the action executor. Always eligible for
/// self-healing, subject to the retry budget.
#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct ExecutorError {
    pub kind: ExecutorErrorKind,
    pub message: String,
}

impl ExecutorError {
    pub fn new(kind: ExecutorErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn timeout(limit: Duration) -> Self {
        Self::new(
            ExecutorErrorKind::Timeout,
            format!("exceeded step timeout of {}s", limit.as_secs_f64()),
        )
    }

    pub fn is_timeout(&self) -> bool {
        self.kind == ExecutorErrorKind::Timeout
    }
}

/// A step-level failure as seen by the retry gate.
#[derive(Debug, Clone, Error)]
pub enum StepError {
    #[error("policy violation: {0}")]
    Policy(String),

    #[error(transparent)]
    Executor(ExecutorError),
}

impl StepError {
    /// Only executor faults may feed the self-healing loop; a plan that is
    /// illegal stays illegal no matter how often it is replanned from.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, StepError::Executor(_))
    }
}

/// Terminal classification of a task run. Recoverable step failures never
/// surface here directly; after the retry budget is spent they arrive
/// wrapped in `RetriesExhausted`.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("planning failed: {source}")]
    Planning {
        #[source]
        source: PlannerError,
    },

    #[error("policy violation at step {step}: {detail}")]
    PolicyViolation { step: usize, detail: String },

    #[error("retries exhausted after {attempts} replan attempt(s); step {step} last failed with: {last}")]
    RetriesExhausted {
        step: usize,
        attempts: u32,
        last: ExecutorError,
    },

    #[error("task cancelled before step {step}")]
    Cancelled { step: usize },
}

impl TaskError {
    /// Classify a planner failure: a well-formed response naming an action
    /// outside the whitelist is a policy problem, everything else a
    /// planning problem.
    pub fn from_planner(err: PlannerError, step: usize) -> Self {
        match err {
            PlannerError::UnsupportedAction(tag) => TaskError::PolicyViolation {
                step,
                detail: format!("action '{tag}' is not whitelisted"),
            },
            other => TaskError::Planning { source: other },
        }
    }
}
