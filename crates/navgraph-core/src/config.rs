use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{NavError, Result};

/// Top-level navgraph configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub log: Option<LogConfig>,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub simulation: SimulationConfig,
}

/// Execution record lifecycle settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Seconds a completed or failed record is kept before it is reaped.
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,
    /// Seconds between reaper sweeps.
    #[serde(default = "default_reap_interval_secs")]
    pub reap_interval_secs: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            retention_secs: default_retention_secs(),
            reap_interval_secs: default_reap_interval_secs(),
        }
    }
}

/// Upper bound for `orchestrator.retention_secs` (100 years).
pub const MAX_RETENTION_SECS: u64 = 100 * 365 * 24 * 60 * 60;

fn default_retention_secs() -> u64 { 3600 }
fn default_reap_interval_secs() -> u64 { 60 }

/// JSONL execution logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Enable execution logging (default: true when section is present).
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// Directory for log files. Default: ./logs
    #[serde(default)]
    pub log_dir: Option<String>,
    /// Logging level: 1 = execution summary, 2 = per-step, 3 = per-step + metrics (default: 2).
    #[serde(default = "default_log_level")]
    pub level: u8,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            log_dir: None,
            level: 2,
        }
    }
}

impl LogConfig {
    /// Resolve the log directory (expand ~).
    pub fn resolved_dir(&self) -> PathBuf {
        let dir = self.log_dir.as_deref().unwrap_or("./logs");
        match (dir.strip_prefix("~/"), std::env::var_os("HOME")) {
            (Some(rest), Some(home)) => PathBuf::from(home).join(rest),
            _ => PathBuf::from(dir),
        }
    }
}

fn default_log_enabled() -> bool { true }
fn default_log_level() -> u8 { 2 }

/// Confidence banding thresholds used for display.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_high_confidence")]
    pub high_confidence: f64,
    #[serde(default = "default_medium_confidence")]
    pub medium_confidence: f64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            high_confidence: default_high_confidence(),
            medium_confidence: default_medium_confidence(),
        }
    }
}

impl MetricsConfig {
    /// Band label for a confidence score.
    pub fn band(&self, confidence: f64) -> &'static str {
        if confidence >= self.high_confidence {
            "high"
        } else if confidence >= self.medium_confidence {
            "medium"
        } else {
            "low"
        }
    }
}

fn default_high_confidence() -> f64 { 0.95 }
fn default_medium_confidence() -> f64 { 0.90 }

/// Parameters of the simulated device used by the CLI.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SimulationConfig {
    /// Probability (0.0-1.0) that a simulated action fails.
    #[serde(default)]
    pub failure_rate: f64,
    /// Simulated latency per action in milliseconds.
    #[serde(default)]
    pub latency_ms: u64,
}

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| NavError::ConfigNotFound(path.display().to_string()))?;

        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(&content);

        let config: Self =
            toml::from_str(&expanded).map_err(|e| NavError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path` if it exists, defaults otherwise.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    fn validate(&self) -> Result<()> {
        if let Some(log) = &self.log {
            if !(1..=3).contains(&log.level) {
                return Err(NavError::Config(format!(
                    "log.level must be 1-3, got {}",
                    log.level
                )));
            }
        }
        if !(0.0..=1.0).contains(&self.simulation.failure_rate) {
            return Err(NavError::Config(format!(
                "simulation.failure_rate must be within 0.0-1.0, got {}",
                self.simulation.failure_rate
            )));
        }
        if self.metrics.medium_confidence > self.metrics.high_confidence {
            return Err(NavError::Config(
                "metrics.medium_confidence must not exceed metrics.high_confidence".into(),
            ));
        }
        if self.orchestrator.retention_secs > MAX_RETENTION_SECS {
            return Err(NavError::Config(format!(
                "orchestrator.retention_secs must be at most {}, got {}",
                MAX_RETENTION_SECS, self.orchestrator.retention_secs
            )));
        }
        if self.orchestrator.reap_interval_secs == 0 {
            return Err(NavError::Config(
                "orchestrator.reap_interval_secs must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Substitute `${NAME}` with the value of environment variable `NAME`.
///
/// Unset variables and an unterminated `${` are kept as written, so the TOML
/// parser reports them in context.
fn expand_env_vars(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(open) = rest.find("${") {
        out.push_str(&rest[..open]);
        let after = &rest[open + 2..];
        let Some(close) = after.find('}') else {
            rest = &rest[open..];
            break;
        };
        let reference = &rest[open..open + close + 3];
        match std::env::var(&after[..close]) {
            Ok(value) => out.push_str(&value),
            Err(_) => out.push_str(reference),
        }
        rest = &after[close + 1..];
    }
    out.push_str(rest);
    out
}
