use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::future::BoxFuture;
use rand::Rng;

use navgraph_core::config::SimulationConfig;
use navgraph_core::error::Result;
use navgraph_core::traits::{DeviceController, VerificationProvider};
use navgraph_core::tree::{Action, Verification};
use navgraph_core::types::ActionOutcome;

/// Device stand-in for offline runs: every call sleeps `latency_ms` and fails
/// with probability `failure_rate`.
pub struct SimulatedDevice {
    failure_rate: f64,
    latency: Duration,
    captures: AtomicU64,
}

impl SimulatedDevice {
    pub fn new(config: &SimulationConfig) -> Self {
        Self {
            failure_rate: config.failure_rate.clamp(0.0, 1.0),
            latency: Duration::from_millis(config.latency_ms),
            captures: AtomicU64::new(0),
        }
    }

    async fn outcome(&self, command: String, fail: bool) -> ActionOutcome {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        if fail {
            let n = self.captures.fetch_add(1, Ordering::Relaxed);
            ActionOutcome::failure(format!("{} did not take effect", command))
                .with_evidence(format!("sim://captures/{:04}-{}.png", n, command))
        } else {
            ActionOutcome::success(format!("{} ok", command))
        }
    }

    fn roll(&self) -> bool {
        rand::thread_rng().gen_bool(self.failure_rate)
    }
}

impl DeviceController for SimulatedDevice {
    fn execute(&self, action: &Action) -> BoxFuture<'_, Result<ActionOutcome>> {
        let fail = self.roll();
        let command = action.command.clone();
        Box::pin(async move { Ok(self.outcome(command, fail).await) })
    }

    fn name(&self) -> &str {
        "simulated"
    }
}

impl VerificationProvider for SimulatedDevice {
    fn run(&self, verification: &Verification) -> BoxFuture<'_, Result<ActionOutcome>> {
        let fail = self.roll();
        let command = verification.command.clone();
        Box::pin(async move { Ok(self.outcome(command, fail).await) })
    }
}
