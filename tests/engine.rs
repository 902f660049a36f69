//! Engine behavior against a mock planner and a scripted executor.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use webpilot::action::{Action, Plan};
use webpilot::engine::ExecutionEngine;
use webpilot::error::{ExecutorError, ExecutorErrorKind, PlannerError, TaskError};
use webpilot::executor::{ActionExecutor, StepReport};
use webpilot::monitor::{RunState, StepStatus};
use webpilot::planner::{Planner, Refinement, ReplanScope};

fn open(url: &str) -> Action {
    Action::Open { url: url.into() }
}

fn click(selector: &str) -> Action {
    Action::Click {
        selector: selector.into(),
    }
}

fn not_found(selector: &str) -> ExecutorError {
    ExecutorError::new(
        ExecutorErrorKind::ElementNotFound,
        format!("no element matches {selector}"),
    )
}

fn ok_report(url: Option<&str>) -> Result<StepReport, ExecutorError> {
    Ok(StepReport {
        url: url.map(String::from),
        screenshot: None,
    })
}

#[derive(Default)]
struct MockPlanner {
    plan: Mutex<Option<Result<Plan, PlannerError>>>,
    refinements: Mutex<VecDeque<Result<Refinement, PlannerError>>>,
    refine_calls: AtomicUsize,
    last_refine: Mutex<Option<(usize, String, String)>>,
}

impl MockPlanner {
    fn with_plan(plan: Result<Plan, PlannerError>) -> Self {
        let mock = Self::default();
        *mock.plan.lock().unwrap() = Some(plan);
        mock
    }

    fn queue_refinement(&self, refinement: Result<Refinement, PlannerError>) {
        self.refinements.lock().unwrap().push_back(refinement);
    }

    fn refine_calls(&self) -> usize {
        self.refine_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Planner for MockPlanner {
    async fn plan(&self, _prompt: &str) -> Result<Plan, PlannerError> {
        self.plan
            .lock()
            .unwrap()
            .take()
            .unwrap_or_else(|| Err(PlannerError::Malformed("no plan scripted".into())))
    }

    async fn refine(
        &self,
        _active: &Plan,
        failed_index: usize,
        error: &str,
        snapshot: &str,
    ) -> Result<Refinement, PlannerError> {
        self.refine_calls.fetch_add(1, Ordering::SeqCst);
        *self.last_refine.lock().unwrap() =
            Some((failed_index, error.to_string(), snapshot.to_string()));
        self.refinements
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(PlannerError::Malformed("no refinement scripted".into())))
    }
}

#[derive(Default)]
struct ScriptedExecutor {
    outcomes: Mutex<VecDeque<Result<StepReport, ExecutorError>>>,
    executed: Mutex<Vec<Action>>,
    snapshot_calls: AtomicUsize,
}

impl ScriptedExecutor {
    fn with_outcomes(
        outcomes: impl IntoIterator<Item = Result<StepReport, ExecutorError>>,
    ) -> Self {
        Self {
            outcomes: Mutex::new(outcomes.into_iter().collect()),
            ..Self::default()
        }
    }

    fn executed(&self) -> Vec<Action> {
        self.executed.lock().unwrap().clone()
    }
}

#[async_trait]
impl ActionExecutor for ScriptedExecutor {
    async fn execute(
        &mut self,
        action: &Action,
        _timeout: Duration,
    ) -> Result<StepReport, ExecutorError> {
        self.executed.lock().unwrap().push(action.clone());
        self.outcomes
            .lock()
            .unwrap()
            .pop_front()
            .expect("scripted outcomes exhausted")
    }

    async fn snapshot(&mut self) -> String {
        self.snapshot_calls.fetch_add(1, Ordering::SeqCst);
        "URL: https://example.com\n<form id=search>".to_string()
    }

    async fn failure_screenshot(&mut self, step_index: usize) -> Option<PathBuf> {
        Some(PathBuf::from(format!("shots/error_step_{step_index}.png")))
    }
}

#[tokio::test]
async fn completes_a_single_open_task() {
    let planner = MockPlanner::with_plan(Ok(Plan::new(vec![open("https://example.com")])));
    let mut executor =
        ScriptedExecutor::with_outcomes([ok_report(Some("https://example.com"))]);

    let engine = ExecutionEngine::new(&planner, &mut executor);
    let finished = engine.run("open example.com", 0).await;

    assert!(finished.succeeded());
    let status = finished.status();
    assert_eq!(status.state, RunState::Completed);
    assert_eq!((status.completed, status.failed), (1, 0));
    assert_eq!(status.urls_visited, vec!["https://example.com".to_string()]);
    assert_eq!(status.completed + status.failed, status.total_steps);

    let statuses: Vec<StepStatus> = finished.monitor.log().iter().map(|e| e.status).collect();
    assert_eq!(statuses, vec![StepStatus::Started, StepStatus::Success]);
    assert_eq!(executor.executed(), vec![open("https://example.com")]);
}

#[tokio::test]
async fn self_heals_a_failed_click_with_one_refinement() {
    let planner = MockPlanner::with_plan(Ok(Plan::new(vec![click("#missing")])));
    planner.queue_refinement(Ok(Refinement {
        plan: Plan::new(vec![Action::Wait { seconds: 2.0 }, click("#missing")]),
        scope: ReplanScope::FullPlan,
    }));
    let mut executor = ScriptedExecutor::with_outcomes([
        Err(not_found("#missing")),
        ok_report(None),
        ok_report(None),
    ]);

    let engine = ExecutionEngine::new(&planner, &mut executor);
    let finished = engine.run("click the missing button", 1).await;

    assert!(finished.succeeded());
    assert_eq!(planner.refine_calls(), 1);
    assert_eq!(executor.snapshot_calls.load(Ordering::SeqCst), 1);

    let (failed_index, error, snapshot) = planner.last_refine.lock().unwrap().clone().unwrap();
    assert_eq!(failed_index, 0);
    assert!(error.contains("element not found"));
    assert!(snapshot.contains("form"));

    let status = finished.status();
    assert_eq!(status.state, RunState::Completed);
    assert_eq!((status.completed, status.failed), (2, 0));
    assert_eq!(status.completed + status.failed, status.total_steps);
    assert_eq!(status.errors.len(), 1);

    // the logical step fails once, then succeeds on the replanned pass
    let transitions: Vec<(usize, StepStatus)> = finished
        .monitor
        .log()
        .iter()
        .map(|e| (e.step_index, e.status))
        .collect();
    assert_eq!(
        transitions,
        vec![
            (0, StepStatus::Started),
            (0, StepStatus::Failed),
            (0, StepStatus::Started),
            (0, StepStatus::Success),
            (1, StepStatus::Started),
            (1, StepStatus::Success),
        ]
    );
}

#[tokio::test]
async fn zero_budget_fails_without_a_planner_call() {
    let planner = MockPlanner::with_plan(Ok(Plan::new(vec![click("#missing")])));
    let mut executor = ScriptedExecutor::with_outcomes([Err(not_found("#missing"))]);

    let engine = ExecutionEngine::new(&planner, &mut executor);
    let finished = engine.run("click it", 0).await;

    match &finished.outcome {
        Err(TaskError::RetriesExhausted { step, attempts, .. }) => {
            assert_eq!((*step, *attempts), (0, 0));
        }
        other => panic!("expected RetriesExhausted, got {other:?}"),
    }
    assert_eq!(planner.refine_calls(), 0);
    let status = finished.status();
    assert_eq!(status.state, RunState::Failed);
    assert_eq!((status.completed, status.failed), (0, 1));
    assert!(status.completed + status.failed <= status.total_steps);
}

#[tokio::test]
async fn budget_is_global_across_replans() {
    let planner = MockPlanner::with_plan(Ok(Plan::new(vec![click("#a")])));
    planner.queue_refinement(Ok(Refinement {
        plan: Plan::new(vec![click("#a")]),
        scope: ReplanScope::FullPlan,
    }));
    let mut executor =
        ScriptedExecutor::with_outcomes([Err(not_found("#a")), Err(not_found("#a"))]);

    let engine = ExecutionEngine::new(&planner, &mut executor);
    let finished = engine.run("click", 1).await;

    match &finished.outcome {
        Err(TaskError::RetriesExhausted { attempts, .. }) => assert_eq!(*attempts, 1),
        other => panic!("expected RetriesExhausted, got {other:?}"),
    }
    // the second recoverable failure must not trigger another refine
    assert_eq!(planner.refine_calls(), 1);
}

#[tokio::test]
async fn timeout_is_recoverable() {
    let planner = MockPlanner::with_plan(Ok(Plan::new(vec![open("https://slow.example")])));
    planner.queue_refinement(Ok(Refinement {
        plan: Plan::new(vec![open("https://slow.example")]),
        scope: ReplanScope::FullPlan,
    }));
    let mut executor = ScriptedExecutor::with_outcomes([
        Err(ExecutorError::timeout(Duration::from_secs(10))),
        ok_report(Some("https://slow.example")),
    ]);

    let engine = ExecutionEngine::new(&planner, &mut executor);
    let finished = engine.run("open the slow site", 1).await;

    assert!(finished.succeeded());
    assert_eq!(planner.refine_calls(), 1);
}

#[tokio::test]
async fn planning_failure_is_fatal_before_any_execution() {
    let planner = MockPlanner::with_plan(Err(PlannerError::Malformed("not json".into())));
    let mut executor = ScriptedExecutor::default();

    let engine = ExecutionEngine::new(&planner, &mut executor);
    let finished = engine.run("do something", 3).await;

    assert!(matches!(finished.outcome, Err(TaskError::Planning { .. })));
    assert!(executor.executed().is_empty());
    assert!(finished.monitor.log().is_empty());
    assert_eq!(finished.status().state, RunState::Failed);
}

#[tokio::test]
async fn unwhitelisted_action_is_a_policy_violation() {
    let planner =
        MockPlanner::with_plan(Err(PlannerError::UnsupportedAction("execute_js".into())));
    let mut executor = ScriptedExecutor::default();

    let engine = ExecutionEngine::new(&planner, &mut executor);
    let finished = engine.run("inject a script", 3).await;

    assert!(matches!(
        finished.outcome,
        Err(TaskError::PolicyViolation { .. })
    ));
    assert!(executor.executed().is_empty());
}

#[tokio::test]
async fn denylisted_parameter_is_fatal_and_never_replanned() {
    let planner = MockPlanner::with_plan(Ok(Plan::new(vec![open("javascript:alert(1)")])));
    let mut executor = ScriptedExecutor::default();

    let engine = ExecutionEngine::new(&planner, &mut executor);
    let finished = engine.run("open the bad url", 3).await;

    match &finished.outcome {
        Err(TaskError::PolicyViolation { step, detail }) => {
            assert_eq!(*step, 0);
            assert!(detail.contains("javascript:"));
        }
        other => panic!("expected PolicyViolation, got {other:?}"),
    }
    assert!(executor.executed().is_empty());
    assert_eq!(planner.refine_calls(), 0);

    let log = finished.monitor.log();
    assert_eq!(log.len(), 2);
    assert_eq!(log[1].status, StepStatus::Failed);
    assert!(log[1].error.as_deref().unwrap().contains("policy violation"));
}

#[tokio::test]
async fn panicking_observer_does_not_change_the_outcome() {
    let run = |subscribe_panicker: bool| async move {
        let planner = MockPlanner::with_plan(Ok(Plan::new(vec![open("https://example.com")])));
        let mut executor =
            ScriptedExecutor::with_outcomes([ok_report(Some("https://example.com"))]);
        let mut engine = ExecutionEngine::new(&planner, &mut executor);
        if subscribe_panicker {
            engine.subscribe(|_event| panic!("observer bug"));
        }
        engine.run("open example.com", 1).await.status()
    };

    let with_panicker = run(true).await;
    let without = run(false).await;
    assert_eq!(with_panicker, without);
    assert_eq!(with_panicker.state, RunState::Completed);
}

#[tokio::test]
async fn cancellation_stops_the_run_without_healing() {
    let planner = MockPlanner::with_plan(Ok(Plan::new(vec![open("https://example.com")])));
    let mut executor = ScriptedExecutor::default();
    let cancel = CancellationToken::new();
    cancel.cancel();

    let engine =
        ExecutionEngine::new(&planner, &mut executor).with_cancel_token(cancel);
    let finished = engine.run("open example.com", 3).await;

    assert!(matches!(
        finished.outcome,
        Err(TaskError::Cancelled { step: 0 })
    ));
    assert!(executor.executed().is_empty());
    assert_eq!(planner.refine_calls(), 0);
    assert_eq!(finished.status().state, RunState::Failed);
}

#[tokio::test]
async fn empty_plan_is_a_noop_completion() {
    let planner = MockPlanner::with_plan(Ok(Plan::empty()));
    let mut executor = ScriptedExecutor::default();

    let engine = ExecutionEngine::new(&planner, &mut executor);
    let finished = engine.run("do nothing", 0).await;

    assert!(finished.succeeded());
    let status = finished.status();
    assert_eq!(status.state, RunState::Completed);
    assert_eq!(status.total_steps, 0);
    assert!(finished.monitor.log().is_empty());
}

#[tokio::test]
async fn empty_refinement_is_rejected() {
    let planner = MockPlanner::with_plan(Ok(Plan::new(vec![click("#a")])));
    planner.queue_refinement(Ok(Refinement {
        plan: Plan::empty(),
        scope: ReplanScope::FullPlan,
    }));
    let mut executor = ScriptedExecutor::with_outcomes([Err(not_found("#a"))]);

    let engine = ExecutionEngine::new(&planner, &mut executor);
    let finished = engine.run("click", 2).await;

    assert!(matches!(finished.outcome, Err(TaskError::Planning { .. })));
}

#[tokio::test]
async fn single_step_refinement_resumes_at_the_failed_index() {
    let planner = MockPlanner::with_plan(Ok(Plan::new(vec![
        open("https://example.com"),
        click("#submit"),
    ])));
    planner.queue_refinement(Ok(Refinement {
        plan: Plan::new(vec![Action::Wait { seconds: 1.0 }, click("#submit")]),
        scope: ReplanScope::ReplaceFailedStep,
    }));
    let mut executor = ScriptedExecutor::with_outcomes([
        ok_report(Some("https://example.com")),
        Err(not_found("#submit")),
        ok_report(None),
        ok_report(None),
    ]);

    let engine = ExecutionEngine::new(&planner, &mut executor);
    let finished = engine.run("open and submit", 1).await;

    assert!(finished.succeeded());
    // the completed open step is not re-executed
    assert_eq!(
        executor.executed(),
        vec![
            open("https://example.com"),
            click("#submit"),
            Action::Wait { seconds: 1.0 },
            click("#submit"),
        ]
    );
    let status = finished.status();
    assert_eq!(status.total_steps, 3);
    assert_eq!((status.completed, status.failed), (3, 0));

    let indexes: Vec<usize> = finished
        .monitor
        .log()
        .iter()
        .map(|e| e.step_index)
        .collect();
    assert_eq!(indexes, vec![0, 0, 1, 1, 1, 1, 2, 2]);
}

#[tokio::test]
async fn no_attempt_gets_two_terminal_events() {
    let planner = MockPlanner::with_plan(Ok(Plan::new(vec![click("#a"), click("#b")])));
    planner.queue_refinement(Ok(Refinement {
        plan: Plan::new(vec![click("#a"), click("#b")]),
        scope: ReplanScope::FullPlan,
    }));
    let mut executor = ScriptedExecutor::with_outcomes([
        Err(not_found("#a")),
        ok_report(None),
        ok_report(None),
    ]);

    let engine = ExecutionEngine::new(&planner, &mut executor);
    let finished = engine.run("click both", 1).await;
    assert!(finished.succeeded());

    // per step index, events must strictly alternate started -> terminal
    use std::collections::HashMap;
    let mut awaiting_terminal: HashMap<usize, bool> = HashMap::new();
    for event in finished.monitor.log() {
        let open_attempt = awaiting_terminal.entry(event.step_index).or_insert(false);
        match event.status {
            StepStatus::Started => {
                assert!(!*open_attempt, "started twice without a terminal event");
                *open_attempt = true;
            }
            StepStatus::Success | StepStatus::Failed => {
                assert!(*open_attempt, "terminal event without a started event");
                *open_attempt = false;
            }
        }
    }
}
