use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use navgraph_core::config::OrchestratorConfig;
use navgraph_core::error::{NavError, Result};
use navgraph_core::event::EventBus;
use navgraph_core::types::{
    EngineEvent, ExecutionId, ExecutionKind, ExecutionStatus, StepResult, StepTarget,
};

use crate::executor::StepExecutor;
use crate::graph::{GraphStore, Pathfinder, TreeHandle};
use crate::metrics::MetricsAggregator;
use crate::request::{ActionBatch, BlockStep, ExecutionRequest, NavigateRequest, VerifyRequest};

/// How far an execution has got.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Progress {
    pub completed_steps: usize,
    /// Known once the work is planned; `None` for blocks.
    pub total_steps: Option<usize>,
    /// Step currently running.
    pub current: Option<String>,
}

/// Result payload of a completed execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionSummary {
    /// Node the device was left on, for executions that navigate.
    pub final_node: Option<String>,
    pub hops: usize,
    pub elapsed_ms: u64,
}

/// Why an execution ended in `error`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionFailure {
    /// Error family, see `NavError::kind`.
    pub kind: String,
    pub message: String,
    /// The step that failed, when a step failed.
    pub failing_step: Option<StepTarget>,
    pub evidence_ref: Option<String>,
}

/// Tracked state of one submitted execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: ExecutionId,
    pub kind: ExecutionKind,
    pub status: ExecutionStatus,
    pub submitted_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub progress: Progress,
    pub steps: Vec<StepResult>,
    pub result: Option<ExecutionSummary>,
    pub error: Option<ExecutionFailure>,
}

impl ExecutionRecord {
    fn new(id: ExecutionId, kind: ExecutionKind) -> Self {
        Self {
            id,
            kind,
            status: ExecutionStatus::Running,
            submitted_at: Utc::now(),
            finished_at: None,
            progress: Progress::default(),
            steps: vec![],
            result: None,
            error: None,
        }
    }

    /// The failing step's result, if the execution failed on a step.
    pub fn failing_step(&self) -> Option<&StepResult> {
        self.steps.iter().rev().find(|s| !s.success)
    }
}

/// Where a worker stopped.
#[derive(Debug, Default)]
struct Completion {
    final_node: Option<String>,
    hops: usize,
}

#[derive(Debug)]
struct RunFailure {
    error: NavError,
    failing_step: Option<StepTarget>,
    evidence_ref: Option<String>,
}

impl From<NavError> for RunFailure {
    fn from(error: NavError) -> Self {
        Self {
            error,
            failing_step: None,
            evidence_ref: None,
        }
    }
}

impl RunFailure {
    fn step(result: &StepResult) -> Self {
        Self {
            error: NavError::StepFailure {
                target: result.target.to_string(),
                message: result.error.clone().unwrap_or_else(|| "step failed".into()),
            },
            failing_step: Some(result.target.clone()),
            evidence_ref: result.evidence_ref.clone(),
        }
    }

    fn into_failure(self) -> ExecutionFailure {
        ExecutionFailure {
            kind: self.error.kind().to_string(),
            message: self.error.to_string(),
            failing_step: self.failing_step,
            evidence_ref: self.evidence_ref,
        }
    }
}

type RunOutcome = std::result::Result<Completion, RunFailure>;

/// Accepts execution requests, runs each on its own background worker and
/// exposes non-blocking status polling.
///
/// Record map access is limited to single map mutations; no map guard is
/// ever held across device I/O.
pub struct ExecutionOrchestrator {
    config: OrchestratorConfig,
    store: Arc<GraphStore>,
    executor: StepExecutor,
    metrics: Arc<MetricsAggregator>,
    event_bus: Arc<EventBus>,
    records: DashMap<ExecutionId, ExecutionRecord>,
    /// root tree id -> last node reached in that hierarchy
    positions: DashMap<String, String>,
    cancel: CancellationToken,
}

impl ExecutionOrchestrator {
    pub fn new(
        config: OrchestratorConfig,
        store: Arc<GraphStore>,
        executor: StepExecutor,
        metrics: Arc<MetricsAggregator>,
        event_bus: Arc<EventBus>,
    ) -> Self {
        Self {
            config,
            store,
            executor,
            metrics,
            event_bus,
            records: DashMap::new(),
            positions: DashMap::new(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn store(&self) -> &Arc<GraphStore> {
        &self.store
    }

    pub fn metrics(&self) -> &Arc<MetricsAggregator> {
        &self.metrics
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    /// Token cancelled by [`shutdown`](Self::shutdown); background tasks
    /// tied to the orchestrator's lifetime select on it.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Validate `request`, record it as `running` and hand it to a worker.
    ///
    /// Returns as soon as the worker is spawned.
    pub fn submit(self: &Arc<Self>, request: ExecutionRequest) -> Result<ExecutionId> {
        request.validate()?;

        let id = ExecutionId::new();
        let kind = request.kind();
        self.records
            .insert(id.clone(), ExecutionRecord::new(id.clone(), kind));
        self.event_bus.publish(EngineEvent::ExecutionStarted {
            execution_id: id.clone(),
            kind,
        });
        info!(execution_id = %id, %kind, "Execution submitted");

        let this = Arc::clone(self);
        let execution_id = id.clone();
        tokio::spawn(async move {
            let start = Instant::now();
            let runner = Arc::clone(&this);
            let run_id = execution_id.clone();
            // The inner task is the crash boundary: a panic surfaces here
            // as a JoinError instead of leaving the record running.
            let worker = tokio::spawn(async move { runner.run(&run_id, request).await });
            let outcome = match worker.await {
                Ok(outcome) => outcome,
                Err(e) => Err(RunFailure::from(NavError::WorkerFault(join_error_message(e)))),
            };
            this.finish(&execution_id, outcome, start);
        });

        Ok(id)
    }

    /// Snapshot of one record.
    pub fn status(&self, id: &ExecutionId) -> Result<ExecutionRecord> {
        self.records
            .get(id)
            .map(|r| r.value().clone())
            .ok_or_else(|| NavError::UnknownExecution(id.to_string()))
    }

    /// Snapshots of all live records, oldest first.
    pub fn list(&self) -> Vec<ExecutionRecord> {
        let mut records: Vec<ExecutionRecord> =
            self.records.iter().map(|r| r.value().clone()).collect();
        records.sort_by_key(|r| r.submitted_at);
        records
    }

    /// Poll `status` every `poll` until the record is terminal.
    pub async fn wait_for_terminal(
        &self,
        id: &ExecutionId,
        poll: Duration,
    ) -> Result<ExecutionRecord> {
        loop {
            let record = self.status(id)?;
            if record.status.is_terminal() {
                return Ok(record);
            }
            tokio::time::sleep(poll).await;
        }
    }

    /// Last node reached in the hierarchy rooted at `root_tree_id`.
    pub fn position(&self, root_tree_id: &str) -> Option<String> {
        self.positions.get(root_tree_id).map(|p| p.value().clone())
    }

    /// Forget the tracked position, e.g. after the device was reset.
    pub fn reset_position(&self, root_tree_id: &str) {
        self.positions.remove(root_tree_id);
    }

    /// Remove terminal records that finished at least `retention_secs`
    /// before `now`. Returns how many were removed.
    ///
    /// A retention too large to represent as a deadline never expires.
    pub fn reap_expired(&self, now: DateTime<Utc>) -> usize {
        let retention = i64::try_from(self.config.retention_secs)
            .ok()
            .and_then(chrono::Duration::try_seconds);
        let expired = |record: &ExecutionRecord| {
            let (Some(finished), Some(retention)) = (record.finished_at, retention) else {
                return false;
            };
            record.status.is_terminal()
                && finished
                    .checked_add_signed(retention)
                    .is_some_and(|deadline| deadline <= now)
        };

        let candidates: Vec<ExecutionId> = self
            .records
            .iter()
            .filter(|r| expired(r.value()))
            .map(|r| r.key().clone())
            .collect();

        let mut removed = 0;
        for id in candidates {
            if self.records.remove_if(&id, |_, r| expired(r)).is_some() {
                removed += 1;
            }
        }
        if removed > 0 {
            debug!(removed, remaining = self.records.len(), "Reaped execution records");
        }
        removed
    }

    /// Spawn the periodic reaper. It runs until [`shutdown`](Self::shutdown).
    pub fn start_reaper(self: &Arc<Self>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        let cancel = self.cancel.clone();
        let period = Duration::from_secs(self.config.reap_interval_secs.max(1));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // the first tick fires immediately
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        this.reap_expired(Utc::now());
                    }
                    _ = cancel.cancelled() => {
                        info!("Execution reaper stopped");
                        break;
                    }
                }
            }
        })
    }

    /// Stop background tasks. Running workers are not interrupted.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    // -----------------------------------------------------------------------
    // Worker
    // -----------------------------------------------------------------------

    async fn run(&self, id: &ExecutionId, request: ExecutionRequest) -> RunOutcome {
        match request {
            ExecutionRequest::Navigate(req) => self.navigate(id, &req, true).await,
            ExecutionRequest::Actions(batch) => {
                self.update(id, |r| r.progress.total_steps = Some(1));
                self.run_batch(id, &batch).await
            }
            ExecutionRequest::Verifications(req) => {
                self.update(id, |r| r.progress.total_steps = Some(1));
                self.verify(id, &req).await
            }
            ExecutionRequest::Block { steps } => self.run_block(id, &steps).await,
        }
    }

    async fn navigate(
        &self,
        id: &ExecutionId,
        req: &NavigateRequest,
        plan_progress: bool,
    ) -> RunOutcome {
        let handle = self.store.tree(&req.tree_id)?;
        let root_id = self.store.root_of(&req.tree_id)?.id().to_string();
        let from = self.starting_node(&handle, &root_id, req)?;

        let path = Pathfinder::new(&self.store).find_path(&handle, &from, &req.to)?;

        if plan_progress {
            let total = path.len() + usize::from(req.verify_target);
            self.update(id, |r| r.progress.total_steps = Some(total));
        }
        info!(
            execution_id = %id,
            tree_id = %req.tree_id,
            from = %from,
            to = %req.to,
            hops = path.len(),
            "Navigation planned"
        );

        for hop in &path {
            self.update(id, |r| {
                r.progress.current = Some(format!("{} -> {}", hop.from_node(), hop.to_node()))
            });
            let result = self
                .executor
                .run_edge(&hop.tree_id, &hop.edge, hop.direction)
                .await;
            if let Err(failure) = self.record_step(id, result) {
                // The device is somewhere between two screens now.
                self.positions.remove(&root_id);
                return Err(failure);
            }
            self.positions
                .insert(root_id.clone(), hop.to_node().to_string());
        }
        if path.is_empty() {
            self.positions.insert(root_id.clone(), req.to.clone());
        }

        if req.verify_target {
            let target_tree = self
                .store
                .locate(&handle, &req.to)
                .ok_or_else(|| NavError::UnknownNode {
                    tree_id: req.tree_id.clone(),
                    node_id: req.to.clone(),
                })?;
            let node = target_tree
                .node(&req.to)
                .ok_or_else(|| NavError::UnknownNode {
                    tree_id: target_tree.id().to_string(),
                    node_id: req.to.clone(),
                })?;
            self.update(id, |r| r.progress.current = Some(format!("verify {}", req.to)));
            let result = self.executor.run_verifications(target_tree.id(), node).await;
            self.record_step(id, result)?;
        }

        Ok(Completion {
            final_node: Some(req.to.clone()),
            hops: path.len(),
        })
    }

    /// Explicit `from`, else the tracked position, else the entry node.
    fn starting_node(
        &self,
        handle: &TreeHandle,
        root_id: &str,
        req: &NavigateRequest,
    ) -> Result<String> {
        if let Some(from) = &req.from {
            return Ok(from.clone());
        }
        if let Some(position) = self.position(root_id) {
            if self.store.locate(handle, &position).is_some() {
                return Ok(position);
            }
            warn!(tree_id = %root_id, node_id = %position, "Tracked position no longer exists");
        }
        handle
            .entry_node_id()
            .map(String::from)
            .ok_or_else(|| {
                NavError::InvalidRequest(format!(
                    "no start node given and tree '{}' has no entry node",
                    handle.id()
                ))
            })
    }

    async fn run_batch(&self, id: &ExecutionId, batch: &ActionBatch) -> RunOutcome {
        self.update(id, |r| r.progress.current = Some(format!("batch {}", batch.label)));
        let result = self.executor.run_actions(batch).await;
        self.record_step(id, result)?;
        Ok(Completion::default())
    }

    async fn verify(&self, id: &ExecutionId, req: &VerifyRequest) -> RunOutcome {
        let handle = self.store.tree(&req.tree_id)?;
        let node = handle
            .node(&req.node_id)
            .ok_or_else(|| NavError::UnknownNode {
                tree_id: req.tree_id.clone(),
                node_id: req.node_id.clone(),
            })?;
        self.update(id, |r| r.progress.current = Some(format!("verify {}", req.node_id)));
        let result = self.executor.run_verifications(handle.id(), node).await;
        self.record_step(id, result)?;
        Ok(Completion::default())
    }

    async fn run_block(&self, id: &ExecutionId, steps: &[BlockStep]) -> RunOutcome {
        let mut summary = Completion::default();
        for (i, step) in steps.iter().enumerate() {
            debug!(execution_id = %id, step = i, "Running block step");
            let done = match step {
                BlockStep::Navigate(req) => self.navigate(id, req, false).await?,
                BlockStep::Actions(batch) => self.run_batch(id, batch).await?,
                BlockStep::Verifications(req) => self.verify(id, req).await?,
            };
            summary.hops += done.hops;
            if done.final_node.is_some() {
                summary.final_node = done.final_node;
            }
        }
        Ok(summary)
    }

    /// Report a finished step to metrics, append it to the record and
    /// announce it. Fails when the step failed.
    fn record_step(
        &self,
        id: &ExecutionId,
        result: StepResult,
    ) -> std::result::Result<(), RunFailure> {
        self.metrics.record_step(&result);

        let failure = (!result.success).then(|| RunFailure::step(&result));
        let mut index = 0;
        self.update(id, |r| {
            index = r.steps.len();
            r.steps.push(result.clone());
            r.progress.completed_steps = r.steps.len();
        });
        debug!(
            execution_id = %id,
            step = %result.target,
            success = result.success,
            elapsed_ms = result.elapsed_ms,
            "Step completed"
        );
        self.event_bus.publish(EngineEvent::StepCompleted {
            execution_id: id.clone(),
            index,
            result,
        });

        match failure {
            Some(failure) => Err(failure),
            None => Ok(()),
        }
    }

    fn update(&self, id: &ExecutionId, f: impl FnOnce(&mut ExecutionRecord)) {
        if let Some(mut record) = self.records.get_mut(id) {
            f(record.value_mut());
        }
    }

    fn finish(&self, id: &ExecutionId, outcome: RunOutcome, start: Instant) {
        let elapsed_ms = start.elapsed().as_millis() as u64;

        let event = {
            let Some(mut record) = self.records.get_mut(id) else {
                warn!(execution_id = %id, "Execution record vanished before completion");
                return;
            };
            record.finished_at = Some(Utc::now());
            record.progress.current = None;
            match outcome {
                Ok(done) => {
                    record.status = ExecutionStatus::Completed;
                    record.result = Some(ExecutionSummary {
                        final_node: done.final_node,
                        hops: done.hops,
                        elapsed_ms,
                    });
                    info!(execution_id = %id, steps = record.steps.len(), elapsed_ms, "Execution completed");
                    EngineEvent::ExecutionCompleted {
                        execution_id: id.clone(),
                        steps: record.steps.len(),
                        elapsed_ms,
                    }
                }
                Err(failure) => {
                    let failure = failure.into_failure();
                    error!(
                        execution_id = %id,
                        kind = %failure.kind,
                        error = %failure.message,
                        "Execution failed"
                    );
                    let message = failure.message.clone();
                    record.status = ExecutionStatus::Error;
                    record.error = Some(failure);
                    EngineEvent::ExecutionFailed {
                        execution_id: id.clone(),
                        error: message,
                    }
                }
            }
        };
        self.event_bus.publish(event);
    }
}

fn join_error_message(err: JoinError) -> String {
    if !err.is_panic() {
        return "worker task was cancelled".to_string();
    }
    let payload = err.into_panic();
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("worker panicked: {}", message)
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("worker panicked: {}", message)
    } else {
        "worker panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use navgraph_core::traits::{DeviceController, VerificationProvider};
    use navgraph_core::tree::{Action, NavigationNode, Verification, VerificationKind};
    use navgraph_core::types::MetricKey;
    use navgraph_test_utils::{
        forward_command, home_search_player_tree, one_way_edge, tree_with_nodes, two_way_edge,
        GatedController, PanickingController, ScriptedController, StaticVerifier,
    };

    const POLL: Duration = Duration::from_millis(5);

    fn orchestrator_with(
        device: Arc<dyn DeviceController>,
        verifier: Arc<dyn VerificationProvider>,
    ) -> Arc<ExecutionOrchestrator> {
        configured(OrchestratorConfig::default(), device, verifier)
    }

    fn configured(
        config: OrchestratorConfig,
        device: Arc<dyn DeviceController>,
        verifier: Arc<dyn VerificationProvider>,
    ) -> Arc<ExecutionOrchestrator> {
        let store = Arc::new(GraphStore::new());
        store.load(home_search_player_tree()).unwrap();
        let bus = Arc::new(EventBus::default());
        let metrics = Arc::new(MetricsAggregator::new().with_event_bus(bus.clone()));
        Arc::new(ExecutionOrchestrator::new(
            config,
            store,
            StepExecutor::new(device, verifier),
            metrics,
            bus,
        ))
    }

    fn orchestrator(device: Arc<dyn DeviceController>) -> Arc<ExecutionOrchestrator> {
        orchestrator_with(device, Arc::new(StaticVerifier::new()))
    }

    async fn settle(orch: &ExecutionOrchestrator, id: &ExecutionId) -> ExecutionRecord {
        tokio::time::timeout(Duration::from_secs(5), orch.wait_for_terminal(id, POLL))
            .await
            .expect("execution did not settle")
            .unwrap()
    }

    fn navigate(from: &str, to: &str) -> ExecutionRequest {
        ExecutionRequest::Navigate(NavigateRequest::new("tv", to).from_node(from))
    }

    #[tokio::test]
    async fn test_status_running_while_device_busy() {
        let device = Arc::new(GatedController::new());
        let orch = orchestrator(device.clone());

        let id = orch.submit(navigate("home", "player")).unwrap();
        assert_eq!(orch.status(&id).unwrap().status, ExecutionStatus::Running);

        tokio::time::timeout(Duration::from_secs(5), async {
            while device.waiting() == 0 {
                tokio::time::sleep(POLL).await;
            }
        })
        .await
        .unwrap();
        let record = orch.status(&id).unwrap();
        assert_eq!(record.status, ExecutionStatus::Running);
        assert_eq!(record.progress.total_steps, Some(2));
        assert_eq!(record.progress.current.as_deref(), Some("home -> search"));

        device.open();
        let record = settle(&orch, &id).await;
        assert_eq!(record.status, ExecutionStatus::Completed);
        assert_eq!(record.steps.len(), 2);
        let summary = record.result.unwrap();
        assert_eq!(summary.hops, 2);
        assert_eq!(summary.final_node.as_deref(), Some("player"));
        assert!(record.finished_at.is_some());
        assert_eq!(orch.position("tv").as_deref(), Some("player"));
    }

    #[tokio::test]
    async fn test_concurrent_submits_are_independent() {
        let device = Arc::new(ScriptedController::new().with_delay(Duration::from_millis(10)));
        let orch = orchestrator(device.clone());

        let a = orch.submit(navigate("home", "player")).unwrap();
        let b = orch.submit(navigate("search", "home")).unwrap();
        assert_ne!(a, b);

        let a = settle(&orch, &a).await;
        let b = settle(&orch, &b).await;
        assert_eq!(a.status, ExecutionStatus::Completed);
        assert_eq!(b.status, ExecutionStatus::Completed);
        assert_eq!(a.steps.len(), 2);
        assert_eq!(b.steps.len(), 1);
        assert_eq!(orch.list().len(), 2);
    }

    #[tokio::test]
    async fn test_unreachable_target_is_error() {
        let orch = orchestrator(Arc::new(ScriptedController::new()));
        let id = orch.submit(navigate("player", "home")).unwrap();

        let record = settle(&orch, &id).await;
        assert_eq!(record.status, ExecutionStatus::Error);
        let error = record.error.unwrap();
        assert_eq!(error.kind, "unreachable_node");
        assert!(error.message.contains("home"));
        assert!(record.steps.is_empty());
    }

    #[tokio::test]
    async fn test_step_failure_identifies_edge_and_evidence() {
        let device = Arc::new(ScriptedController::new());
        device.fail_always(&forward_command("search_player"));
        let orch = orchestrator(device.clone());
        orch.positions.insert("tv".into(), "home".into());

        let id = orch.submit(navigate("home", "player")).unwrap();
        let record = settle(&orch, &id).await;

        assert_eq!(record.status, ExecutionStatus::Error);
        assert_eq!(record.steps.len(), 2);
        assert!(record.steps[0].success);
        let error = record.error.unwrap();
        assert_eq!(error.kind, "step_failure");
        match error.failing_step.unwrap() {
            StepTarget::Edge { edge_id, .. } => assert_eq!(edge_id, "search_player"),
            other => panic!("unexpected target {other:?}"),
        }
        assert_eq!(
            error.evidence_ref.as_deref(),
            Some("/captures/search_player_fwd.png")
        );
        assert_eq!(orch.position("tv"), None);
    }

    #[tokio::test]
    async fn test_worker_panic_becomes_error() {
        let orch = orchestrator(Arc::new(PanickingController));
        let id = orch.submit(navigate("home", "search")).unwrap();

        let record = settle(&orch, &id).await;
        assert_eq!(record.status, ExecutionStatus::Error);
        let error = record.error.unwrap();
        assert_eq!(error.kind, "worker_fault");
        assert!(error.message.contains("controller crashed"));
    }

    #[tokio::test]
    async fn test_navigation_starts_from_tracked_position() {
        let device = Arc::new(ScriptedController::new());
        let orch = orchestrator(device.clone());

        // no `from`: starts at the entry node
        let id = orch
            .submit(ExecutionRequest::Navigate(NavigateRequest::new("tv", "search")))
            .unwrap();
        assert_eq!(settle(&orch, &id).await.steps.len(), 1);
        assert_eq!(orch.position("tv").as_deref(), Some("search"));

        let id = orch
            .submit(ExecutionRequest::Navigate(NavigateRequest::new("tv", "player")))
            .unwrap();
        let record = settle(&orch, &id).await;
        assert_eq!(record.steps.len(), 1);
        assert_eq!(device.call_count(&forward_command("home_search")), 1);
    }

    #[tokio::test]
    async fn test_already_there_is_empty_success() {
        let device = Arc::new(ScriptedController::new());
        let orch = orchestrator(device.clone());
        let id = orch.submit(navigate("search", "search")).unwrap();
        let record = settle(&orch, &id).await;
        assert_eq!(record.status, ExecutionStatus::Completed);
        assert!(record.steps.is_empty());
        assert!(device.calls().is_empty());
        assert_eq!(orch.position("tv").as_deref(), Some("search"));
    }

    #[tokio::test]
    async fn test_verify_target_failure() {
        let verifier = Arc::new(StaticVerifier::new());
        verifier.fail("player_logo");
        let orch = orchestrator_with(Arc::new(ScriptedController::new()), verifier.clone());
        orch.store()
            .load(
                tree_with_nodes("tv", &["home"])
                    .with_node(
                        NavigationNode::new("player", "Player").with_verification(
                            Verification::new(VerificationKind::Image, "player_logo"),
                        ),
                    )
                    .with_edge(one_way_edge("home_player", "home", "player")),
            )
            .unwrap();

        let id = orch
            .submit(ExecutionRequest::Navigate(
                NavigateRequest::new("tv", "player").from_node("home").verify_target(),
            ))
            .unwrap();
        let record = settle(&orch, &id).await;

        assert_eq!(record.status, ExecutionStatus::Error);
        assert_eq!(record.progress.total_steps, Some(2));
        assert_eq!(record.steps.len(), 2);
        let failure = record.error.unwrap();
        assert_eq!(
            failure.failing_step,
            Some(StepTarget::Node {
                tree_id: "tv".into(),
                node_id: "player".into()
            })
        );
        assert_eq!(verifier.calls(), vec!["player_logo"]);
    }

    #[tokio::test]
    async fn test_block_aborts_on_first_failure() {
        let device = Arc::new(ScriptedController::new());
        device.fail_always("bad");
        let orch = orchestrator(device.clone());

        let id = orch
            .submit(ExecutionRequest::Block {
                steps: vec![
                    BlockStep::Navigate(NavigateRequest::new("tv", "search").from_node("home")),
                    BlockStep::Actions(ActionBatch::new("poke", vec![Action::remote("bad")])),
                    BlockStep::Navigate(NavigateRequest::new("tv", "player")),
                ],
            })
            .unwrap();
        let record = settle(&orch, &id).await;

        assert_eq!(record.kind, ExecutionKind::Block);
        assert_eq!(record.status, ExecutionStatus::Error);
        assert_eq!(record.steps.len(), 2);
        assert_eq!(device.call_count(&forward_command("search_player")), 0);
    }

    #[tokio::test]
    async fn test_block_completes() {
        let orch = orchestrator(Arc::new(ScriptedController::new()));
        let id = orch
            .submit(ExecutionRequest::Block {
                steps: vec![
                    BlockStep::Navigate(NavigateRequest::new("tv", "search").from_node("home")),
                    BlockStep::Verifications(VerifyRequest {
                        tree_id: "tv".into(),
                        node_id: "search".into(),
                    }),
                    BlockStep::Navigate(NavigateRequest::new("tv", "player")),
                ],
            })
            .unwrap();
        let record = settle(&orch, &id).await;
        assert_eq!(record.status, ExecutionStatus::Completed);
        let summary = record.result.unwrap();
        assert_eq!(summary.hops, 2);
        assert_eq!(summary.final_node.as_deref(), Some("player"));
    }

    #[tokio::test]
    async fn test_steps_reported_to_metrics() {
        let orch = orchestrator(Arc::new(ScriptedController::new()));
        let id = orch.submit(navigate("home", "player")).unwrap();
        settle(&orch, &id).await;

        let metrics = orch.metrics();
        assert_eq!(metrics.get(&MetricKey::edge("tv", "home_search")).unwrap().total, 1);
        assert_eq!(metrics.get(&MetricKey::edge("tv", "search_player")).unwrap().total, 1);
    }

    #[tokio::test]
    async fn test_events_published_in_order() {
        let orch = orchestrator(Arc::new(ScriptedController::new()));
        let mut rx = orch.event_bus().subscribe();
        orch.submit(navigate("home", "search")).unwrap();

        let mut names = Vec::new();
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .unwrap()
                .unwrap();
            let name = match event {
                EngineEvent::ExecutionStarted { .. } => "started",
                EngineEvent::StepCompleted { .. } => "step",
                EngineEvent::ExecutionCompleted { .. } => "completed",
                EngineEvent::ExecutionFailed { .. } => "failed",
                EngineEvent::MetricUpdated { .. } => "metric",
            };
            names.push(name);
            if matches!(name, "completed" | "failed") {
                break;
            }
        }
        assert_eq!(names, vec!["started", "metric", "step", "completed"]);
    }

    #[tokio::test]
    async fn test_invalid_request_rejected_synchronously() {
        let orch = orchestrator(Arc::new(ScriptedController::new()));
        let err = orch
            .submit(ExecutionRequest::Actions(ActionBatch::new("empty", vec![])))
            .unwrap_err();
        assert!(matches!(err, NavError::InvalidRequest(_)));
        assert!(orch.list().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_execution() {
        let orch = orchestrator(Arc::new(ScriptedController::new()));
        assert!(matches!(
            orch.status(&ExecutionId::from_str("nope")),
            Err(NavError::UnknownExecution(_))
        ));
    }

    #[tokio::test]
    async fn test_unknown_tree_is_error_record() {
        let orch = orchestrator(Arc::new(ScriptedController::new()));
        let id = orch
            .submit(ExecutionRequest::Navigate(NavigateRequest::new("radio", "home")))
            .unwrap();
        let record = settle(&orch, &id).await;
        assert_eq!(record.error.unwrap().kind, "unknown_tree");
    }

    #[tokio::test]
    async fn test_reap_expired_records() {
        let orch = orchestrator(Arc::new(ScriptedController::new()));
        let id = orch
            .submit(ExecutionRequest::Actions(ActionBatch::new(
                "ok",
                vec![Action::remote("ok")],
            )))
            .unwrap();
        settle(&orch, &id).await;

        assert_eq!(orch.reap_expired(Utc::now()), 0);
        assert_eq!(
            orch.reap_expired(Utc::now() + chrono::Duration::seconds(3601)),
            1
        );
        assert!(matches!(orch.status(&id), Err(NavError::UnknownExecution(_))));
    }

    #[tokio::test]
    async fn test_huge_retention_never_expires() {
        for retention_secs in [9_000_000_000_000, u64::MAX] {
            let config = OrchestratorConfig {
                retention_secs,
                ..OrchestratorConfig::default()
            };
            let orch = configured(
                config,
                Arc::new(ScriptedController::new()),
                Arc::new(StaticVerifier::new()),
            );
            let id = orch
                .submit(ExecutionRequest::Actions(ActionBatch::new(
                    "ok",
                    vec![Action::remote("ok")],
                )))
                .unwrap();
            settle(&orch, &id).await;

            assert_eq!(orch.reap_expired(Utc::now()), 0);
            assert_eq!(orch.reap_expired(Utc::now() + chrono::Duration::days(365)), 0);
            assert_eq!(orch.status(&id).unwrap().status, ExecutionStatus::Completed);
        }
    }

    #[tokio::test]
    async fn test_running_records_never_reaped() {
        let device = Arc::new(GatedController::new());
        let orch = orchestrator(device.clone());
        let id = orch.submit(navigate("home", "search")).unwrap();

        assert_eq!(orch.reap_expired(Utc::now() + chrono::Duration::days(30)), 0);
        device.open();
        settle(&orch, &id).await;
    }

    #[tokio::test]
    async fn test_reaper_stops_on_shutdown() {
        let orch = orchestrator(Arc::new(ScriptedController::new()));
        let handle = orch.start_reaper();
        orch.shutdown();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_cross_tree_navigation_tracks_root_position() {
        let orch = orchestrator(Arc::new(ScriptedController::new()));
        orch.store()
            .load(
                tree_with_nodes("player-tree", &["subtitles"])
                    .with_edge(two_way_edge("player_subtitles", "player", "subtitles"))
                    .nested_under("tv", "player"),
            )
            .unwrap();

        let id = orch.submit(navigate("home", "subtitles")).unwrap();
        let record = settle(&orch, &id).await;
        assert_eq!(record.status, ExecutionStatus::Completed);
        assert_eq!(record.steps.len(), 3);
        assert_eq!(orch.position("tv").as_deref(), Some("subtitles"));
    }
}
