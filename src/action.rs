use serde::{Deserialize, Serialize};

/// A single whitelisted browser operation the planner may emit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum Action {
    Open { url: String },
    Type { selector: String, value: String },
    Click { selector: String },
    Wait { seconds: f64 },
    Screenshot,
}

impl Action {
    /// The lowercase tag recorded in execution events.
    pub fn name(&self) -> &'static str {
        match self {
            Action::Open { .. } => "open",
            Action::Type { .. } => "type",
            Action::Click { .. } => "click",
            Action::Wait { .. } => "wait",
            Action::Screenshot => "screenshot",
        }
    }

    pub fn selector(&self) -> Option<&str> {
        match self {
            Action::Type { selector, .. } | Action::Click { selector } => Some(selector),
            _ => None,
        }
    }

    pub fn url(&self) -> Option<&str> {
        match self {
            Action::Open { url } => Some(url),
            _ => None,
        }
    }

    pub fn value(&self) -> Option<&str> {
        match self {
            Action::Type { value, .. } => Some(value),
            _ => None,
        }
    }
}

/// An ordered, immutable sequence of actions for one task attempt.
///
/// Refinements never mutate an existing plan; they build a new one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    steps: Vec<Action>,
}

impl Plan {
    pub fn new(steps: Vec<Action>) -> Self {
        Self { steps }
    }

    pub fn empty() -> Self {
        Self { steps: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Action> {
        self.steps.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Action> {
        self.steps.iter()
    }

    pub fn actions(&self) -> &[Action] {
        &self.steps
    }

    /// New plan with the step at `index` replaced by `replacement`'s actions.
    /// Used when a refinement is scoped to the failed step only.
    pub fn splice(&self, index: usize, replacement: &Plan) -> Plan {
        let mut steps = Vec::with_capacity(self.steps.len() + replacement.len());
        steps.extend_from_slice(&self.steps[..index.min(self.steps.len())]);
        steps.extend_from_slice(&replacement.steps);
        if index + 1 < self.steps.len() {
            steps.extend_from_slice(&self.steps[index + 1..]);
        }
        Plan { steps }
    }
}
