use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{debug, warn};

use navgraph_core::traits::{DeviceController, VerificationProvider};
use navgraph_core::tree::{Action, ActionKind, Direction, NavigationEdge, NavigationNode};
use navgraph_core::types::{ActionOutcome, ActionPhase, ActionRecord, StepResult, StepTarget};

use crate::request::ActionBatch;

/// The action lists one step runs through.
struct Sequence<'a> {
    main: &'a [Action],
    retry: &'a [Action],
    failure: &'a [Action],
}

/// Runs one edge traversal, one action batch or one node's verifications
/// against the device.
///
/// On the first failing action the retry sequence runs once; if it is absent
/// or fails too, the failure sequence runs and the step is marked failed.
/// Collaborator errors are recorded as failed actions, never propagated.
pub struct StepExecutor {
    device: Arc<dyn DeviceController>,
    verifier: Arc<dyn VerificationProvider>,
}

impl StepExecutor {
    pub fn new(device: Arc<dyn DeviceController>, verifier: Arc<dyn VerificationProvider>) -> Self {
        Self { device, verifier }
    }

    /// Walk `edge` in `direction` using its primary action set.
    pub async fn run_edge(
        &self,
        tree_id: &str,
        edge: &NavigationEdge,
        direction: Direction,
    ) -> StepResult {
        let target = StepTarget::Edge {
            tree_id: tree_id.to_string(),
            edge_id: edge.id.clone(),
            from: edge.origin(direction).to_string(),
            to: edge.destination(direction).to_string(),
            direction,
        };

        let Some(set) = edge.primary_action_set() else {
            return rejected(target, format!("edge '{}' has no usable action set", edge.id));
        };
        if direction == Direction::Reverse && !set.is_reversible() {
            return rejected(target, format!("edge '{}' is not reversible", edge.id));
        }

        debug!(
            device = self.device.name(),
            edge_id = %edge.id,
            action_set = %set.name,
            %direction,
            "Running edge"
        );
        self.run_sequence(
            target,
            Sequence {
                main: set.actions(direction),
                retry: &set.retry_actions,
                failure: &set.failure_actions,
            },
        )
        .await
    }

    /// Run a standalone batch with the same retry/failure semantics as an edge.
    pub async fn run_actions(&self, batch: &ActionBatch) -> StepResult {
        let target = StepTarget::Batch {
            label: batch.label.clone(),
        };
        self.run_sequence(
            target,
            Sequence {
                main: &batch.actions,
                retry: &batch.retry_actions,
                failure: &batch.failure_actions,
            },
        )
        .await
    }

    /// Run every verification of `node`. A node without verifications passes.
    pub async fn run_verifications(&self, tree_id: &str, node: &NavigationNode) -> StepResult {
        let target = StepTarget::Node {
            tree_id: tree_id.to_string(),
            node_id: node.id.clone(),
        };
        let started_at = Utc::now();
        let start = Instant::now();
        let mut records = Vec::with_capacity(node.verifications.len());

        for verification in &node.verifications {
            let call_start = Instant::now();
            let outcome = self
                .verifier
                .run(verification)
                .await
                .unwrap_or_else(|e| ActionOutcome::failure(e.to_string()));
            records.push(ActionRecord {
                phase: ActionPhase::Verification,
                kind: None,
                command: verification.command.clone(),
                success: outcome.success,
                message: outcome.message,
                evidence_ref: outcome.evidence_ref,
                elapsed_ms: call_start.elapsed().as_millis() as u64,
            });
        }

        let failing = records.iter().position(|r| !r.success);
        finish(target, records, failing, false, started_at, start)
    }

    async fn run_sequence(&self, target: StepTarget, seq: Sequence<'_>) -> StepResult {
        let started_at = Utc::now();
        let start = Instant::now();
        let mut records = Vec::new();

        let Some(failing) = self
            .run_phase(ActionPhase::Main, seq.main, &mut records, true)
            .await
        else {
            return finish(target, records, None, false, started_at, start);
        };

        let mut failing = failing;
        if !seq.retry.is_empty() {
            debug!(step = %target, "Main sequence failed, running retry actions");
            match self
                .run_phase(ActionPhase::Retry, seq.retry, &mut records, true)
                .await
            {
                None => return finish(target, records, None, true, started_at, start),
                // report what the device did last
                Some(retry_failure) => failing = retry_failure,
            }
        }

        if !seq.failure.is_empty() {
            warn!(step = %target, "Step failed, running failure actions");
            self.run_phase(ActionPhase::Failure, seq.failure, &mut records, false)
                .await;
        }
        finish(target, records, Some(failing), false, started_at, start)
    }

    /// Run `actions` in order, appending a record each. Returns the record
    /// index of the first failure.
    async fn run_phase(
        &self,
        phase: ActionPhase,
        actions: &[Action],
        records: &mut Vec<ActionRecord>,
        stop_on_failure: bool,
    ) -> Option<usize> {
        let mut first_failure = None;
        for action in actions {
            let record = self.run_action(phase, action).await;
            let failed = !record.success;
            records.push(record);
            if failed {
                first_failure.get_or_insert(records.len() - 1);
                if stop_on_failure {
                    break;
                }
            }
        }
        first_failure
    }

    async fn run_action(&self, phase: ActionPhase, action: &Action) -> ActionRecord {
        let start = Instant::now();
        let outcome = if action.kind == ActionKind::Wait {
            tokio::time::sleep(Duration::from_millis(action.wait_ms)).await;
            ActionOutcome::success(format!("waited {}ms", action.wait_ms))
        } else {
            let outcome = match self.device.execute(action).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!(command = %action.command, error = %e, "Device error");
                    ActionOutcome::failure(e.to_string())
                }
            };
            if outcome.success && action.wait_ms > 0 {
                tokio::time::sleep(Duration::from_millis(action.wait_ms)).await;
            }
            outcome
        };

        ActionRecord {
            phase,
            kind: Some(action.kind),
            command: action.command.clone(),
            success: outcome.success,
            message: outcome.message,
            evidence_ref: outcome.evidence_ref,
            elapsed_ms: start.elapsed().as_millis() as u64,
        }
    }
}

fn finish(
    target: StepTarget,
    actions: Vec<ActionRecord>,
    failing: Option<usize>,
    recovered: bool,
    started_at: chrono::DateTime<Utc>,
    start: Instant,
) -> StepResult {
    let last_evidence = || actions.iter().rev().find_map(|r| r.evidence_ref.clone());
    let (evidence_ref, error) = match failing.and_then(|i| actions.get(i)) {
        Some(record) => (
            record.evidence_ref.clone().or_else(last_evidence),
            Some(format!("{} failed: {}", record.command, record.message)),
        ),
        None => (last_evidence(), None),
    };

    StepResult {
        target,
        success: failing.is_none(),
        recovered,
        actions,
        started_at,
        elapsed_ms: start.elapsed().as_millis() as u64,
        evidence_ref,
        error,
    }
}

fn rejected(target: StepTarget, message: String) -> StepResult {
    StepResult {
        target,
        success: false,
        recovered: false,
        actions: vec![],
        started_at: Utc::now(),
        elapsed_ms: 0,
        evidence_ref: None,
        error: Some(message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use navgraph_core::tree::{ActionSet, Verification, VerificationKind};
    use navgraph_test_utils::{
        forward_command, one_way_edge, reverse_command, two_way_edge, ScriptedController,
        StaticVerifier,
    };

    fn executor(device: Arc<ScriptedController>) -> StepExecutor {
        StepExecutor::new(device, Arc::new(StaticVerifier::new()))
    }

    fn edge_with_recovery() -> NavigationEdge {
        NavigationEdge::new("e1", "home", "search").with_action_set(
            ActionSet::new("default")
                .with_forward(vec![Action::remote("up"), Action::remote("ok")])
                .with_retry(vec![Action::remote("ok_again")])
                .with_failure(vec![Action::remote("back"), Action::remote("home")]),
        )
    }

    #[tokio::test]
    async fn test_run_edge_forward_success() {
        let device = Arc::new(ScriptedController::new());
        let edge = two_way_edge("e1", "home", "search");
        let result = executor(device.clone())
            .run_edge("tv", &edge, Direction::Forward)
            .await;

        assert!(result.success);
        assert!(!result.recovered);
        assert!(result.error.is_none());
        assert_eq!(device.calls(), vec![forward_command("e1")]);
        assert_eq!(result.actions[0].phase, ActionPhase::Main);
    }

    #[tokio::test]
    async fn test_run_edge_reverse_uses_reverse_actions() {
        let device = Arc::new(ScriptedController::new());
        let edge = two_way_edge("e1", "home", "search");
        let result = executor(device.clone())
            .run_edge("tv", &edge, Direction::Reverse)
            .await;

        assert!(result.success);
        assert_eq!(device.calls(), vec![reverse_command("e1")]);
        match result.target {
            StepTarget::Edge { from, to, .. } => {
                assert_eq!(from, "search");
                assert_eq!(to, "home");
            }
            other => panic!("unexpected target {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_reverse_of_directional_edge_rejected() {
        let device = Arc::new(ScriptedController::new());
        let edge = one_way_edge("e1", "home", "search");
        let result = executor(device.clone())
            .run_edge("tv", &edge, Direction::Reverse)
            .await;

        assert!(!result.success);
        assert!(result.error.unwrap().contains("not reversible"));
        assert!(device.calls().is_empty());
    }

    #[tokio::test]
    async fn test_retry_recovers_step() {
        let device = Arc::new(ScriptedController::new());
        device.script("ok", vec![ActionOutcome::failure("no focus")]);
        let result = executor(device.clone())
            .run_edge("tv", &edge_with_recovery(), Direction::Forward)
            .await;

        assert!(result.success);
        assert!(result.recovered);
        assert_eq!(device.calls(), vec!["up", "ok", "ok_again"]);
        assert_eq!(device.call_count("back"), 0);
    }

    #[tokio::test]
    async fn test_failed_retry_runs_failure_actions_once() {
        let device = Arc::new(ScriptedController::new());
        device.fail_always("ok");
        device.fail_always("ok_again");
        let result = executor(device.clone())
            .run_edge("tv", &edge_with_recovery(), Direction::Forward)
            .await;

        assert!(!result.success);
        assert_eq!(device.calls(), vec!["up", "ok", "ok_again", "back", "home"]);
        assert_eq!(device.call_count("back"), 1);
        assert_eq!(device.call_count("home"), 1);
        assert!(result.error.as_deref().unwrap().starts_with("ok_again failed"));
        assert_eq!(result.evidence_ref.as_deref(), Some("/captures/ok_again.png"));

        let phases: Vec<_> = result.actions.iter().map(|r| r.phase).collect();
        assert_eq!(
            phases,
            vec![
                ActionPhase::Main,
                ActionPhase::Main,
                ActionPhase::Retry,
                ActionPhase::Failure,
                ActionPhase::Failure,
            ]
        );
    }

    #[tokio::test]
    async fn test_failure_actions_all_run_even_if_one_fails() {
        let device = Arc::new(ScriptedController::new());
        device.fail_always("up");
        device.fail_always("back");
        let edge = NavigationEdge::new("e1", "a", "b").with_action_set(
            ActionSet::new("default")
                .with_forward(vec![Action::remote("up")])
                .with_failure(vec![Action::remote("back"), Action::remote("home")]),
        );
        let result = executor(device.clone())
            .run_edge("tv", &edge, Direction::Forward)
            .await;

        assert!(!result.success);
        assert_eq!(device.calls(), vec!["up", "back", "home"]);
    }

    #[tokio::test]
    async fn test_device_error_treated_as_failed_action() {
        let device = Arc::new(ScriptedController::new());
        device.script_error("ok", "adb offline");
        let result = executor(device.clone())
            .run_edge("tv", &edge_with_recovery(), Direction::Forward)
            .await;

        // the retry succeeds, so the device error is recovered from
        assert!(result.success);
        assert!(result.recovered);
        assert!(result.actions[1].message.contains("adb offline"));
        assert!(!result.actions[1].success);
    }

    #[tokio::test]
    async fn test_evidence_falls_back_to_last_captured() {
        let device = Arc::new(ScriptedController::new());
        device.script(
            "up",
            vec![ActionOutcome::success("moved").with_evidence("/captures/up.png")],
        );
        device.script("ok", vec![ActionOutcome::failure("stuck")]);
        let edge = NavigationEdge::new("e1", "a", "b").with_action_set(
            ActionSet::new("default").with_forward(vec![Action::remote("up"), Action::remote("ok")]),
        );
        let result = executor(device)
            .run_edge("tv", &edge, Direction::Forward)
            .await;

        assert!(!result.success);
        assert_eq!(result.evidence_ref.as_deref(), Some("/captures/up.png"));
    }

    #[tokio::test]
    async fn test_wait_action_skips_device() {
        let device = Arc::new(ScriptedController::new());
        let batch = ActionBatch::new(
            "settle",
            vec![
                Action::new(ActionKind::Wait, "sleep").with_wait_ms(5),
                Action::remote("ok"),
            ],
        );
        let result = executor(device.clone()).run_actions(&batch).await;

        assert!(result.success);
        assert_eq!(device.calls(), vec!["ok"]);
        assert_eq!(result.actions.len(), 2);
        assert_eq!(
            result.target,
            StepTarget::Batch {
                label: "settle".into()
            }
        );
    }

    #[tokio::test]
    async fn test_verifications_run_all() {
        let verifier = Arc::new(StaticVerifier::new());
        verifier.fail("banner");
        let executor = StepExecutor::new(Arc::new(ScriptedController::new()), verifier.clone());
        let node = NavigationNode::new("home", "Home")
            .with_verification(Verification::new(VerificationKind::Image, "logo"))
            .with_verification(Verification::new(VerificationKind::Text, "banner"))
            .with_verification(Verification::new(VerificationKind::Text, "clock"));

        let result = executor.run_verifications("tv", &node).await;

        assert!(!result.success);
        assert_eq!(verifier.calls(), vec!["logo", "banner", "clock"]);
        assert_eq!(
            result.evidence_ref.as_deref(),
            Some("/captures/verify_banner.png")
        );
        assert!(result.actions.iter().all(|r| r.phase == ActionPhase::Verification));
    }

    #[tokio::test]
    async fn test_no_verifications_passes() {
        let executor = executor(Arc::new(ScriptedController::new()));
        let result = executor
            .run_verifications("tv", &NavigationNode::new("home", "Home"))
            .await;
        assert!(result.success);
        assert!(result.actions.is_empty());
    }
}
