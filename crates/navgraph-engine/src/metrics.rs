use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

use navgraph_core::event::EventBus;
use navgraph_core::types::{EngineEvent, MetricElement, MetricKey, MetricPoint, StepResult};

/// Rolling per-node and per-edge execution statistics.
///
/// Each update touches only its own map shard, so concurrent executions
/// recording different keys never contend, and writers of the same key are
/// serialized by the entry lock.
#[derive(Default)]
pub struct MetricsAggregator {
    points: DashMap<MetricKey, MetricPoint>,
    event_bus: Option<Arc<EventBus>>,
}

impl MetricsAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a `MetricUpdated` event for every change.
    pub fn with_event_bus(mut self, event_bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    /// Fold one step outcome into the point for `key`. Returns the new point.
    pub fn record(&self, key: &MetricKey, result: &StepResult) -> MetricPoint {
        let point = {
            let mut entry = self.points.entry(key.clone()).or_default();
            entry.observe(result.success, result.elapsed_ms);
            entry.clone()
        };

        debug!(
            key = %key,
            total = point.total,
            success_rate = point.success_rate(),
            "Metric updated"
        );
        if let Some(bus) = &self.event_bus {
            bus.publish(EngineEvent::MetricUpdated {
                key: key.clone(),
                point: point.clone(),
            });
        }
        point
    }

    /// Record a step against the key derived from its target. Batches are
    /// not tracked and return `None`.
    pub fn record_step(&self, result: &StepResult) -> Option<MetricPoint> {
        let key = result.target.metric_key()?;
        Some(self.record(&key, result))
    }

    pub fn get(&self, key: &MetricKey) -> Option<MetricPoint> {
        self.points.get(key).map(|p| p.clone())
    }

    /// Confidence for `key`; 0.0 when nothing was recorded.
    pub fn confidence(&self, key: &MetricKey) -> f64 {
        self.get(key).map(|p| p.confidence()).unwrap_or(0.0)
    }

    /// All points, ordered by key for stable output.
    pub fn snapshot(&self) -> Vec<(MetricKey, MetricPoint)> {
        let mut points: Vec<_> = self
            .points
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        points.sort_by(|(a, _), (b, _)| sort_key(a).cmp(&sort_key(b)));
        points
    }

    /// Seed a point loaded from storage.
    pub fn restore(&self, key: MetricKey, point: MetricPoint) {
        self.points.insert(key, point);
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

/// Tree, then edges before nodes, then id.
fn sort_key(key: &MetricKey) -> (&str, bool, &str) {
    (&key.tree_id, key.element == MetricElement::Node, &key.id)
}
