mod simulate;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Deserialize;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use navgraph_core::config::AppConfig;
use navgraph_core::event::EventBus;
use navgraph_core::tree::NavigationTree;
use navgraph_core::types::ExecutionStatus;
use navgraph_engine::{
    ExecutionLogger, ExecutionOrchestrator, ExecutionRequest, GraphStore, MetricsAggregator,
    NavigateRequest, Pathfinder, StepExecutor,
};

use simulate::SimulatedDevice;

#[derive(Parser)]
#[command(
    name = "navgraph",
    version,
    about = "Navigation graph pathfinding and execution engine"
)]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "navgraph.toml", env = "NAVGRAPH_CONFIG")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check tree files for integrity errors
    Validate {
        /// JSON files holding one tree or an array of trees
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Print the hops between two nodes
    Path {
        /// Tree files to load
        #[arg(long = "trees", required = true, num_args = 1..)]
        trees: Vec<PathBuf>,
        /// Tree the node ids are resolved against first
        #[arg(long)]
        tree: String,
        #[arg(long)]
        from: String,
        #[arg(long)]
        to: String,
    },
    /// Run navigations against a simulated device and print edge metrics
    Simulate {
        /// Tree files to load
        #[arg(long = "trees", required = true, num_args = 1..)]
        trees: Vec<PathBuf>,
        #[arg(long)]
        tree: String,
        /// Start node (default: the tree's entry node)
        #[arg(long)]
        from: Option<String>,
        #[arg(long)]
        to: String,
        /// Number of navigations to run
        #[arg(long, default_value = "1")]
        runs: usize,
        /// Override simulation.failure_rate
        #[arg(long)]
        failure_rate: Option<f64>,
        /// Override simulation.latency_ms
        #[arg(long)]
        latency_ms: Option<u64>,
    },
    /// Show current configuration
    Config,
}

/// A tree file holds a single tree or an array of trees.
#[derive(Deserialize)]
#[serde(untagged)]
enum TreeFile {
    Many(Vec<NavigationTree>),
    One(Box<NavigationTree>),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("navgraph=info,warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let config = AppConfig::load_or_default(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;

    match cli.command {
        Commands::Validate { files } => validate(&files),
        Commands::Path {
            trees,
            tree,
            from,
            to,
        } => print_path(&trees, &tree, &from, &to),
        Commands::Simulate {
            trees,
            tree,
            from,
            to,
            runs,
            failure_rate,
            latency_ms,
        } => {
            let mut config = config;
            if let Some(rate) = failure_rate {
                config.simulation.failure_rate = rate;
            }
            if let Some(latency) = latency_ms {
                config.simulation.latency_ms = latency;
            }
            simulate(&config, &trees, &tree, from, &to, runs).await
        }
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

fn read_trees(files: &[PathBuf]) -> anyhow::Result<Vec<NavigationTree>> {
    let mut trees = Vec::new();
    for path in files {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let file: TreeFile = serde_json::from_str(&content)
            .with_context(|| format!("parsing {}", path.display()))?;
        match file {
            TreeFile::Many(many) => trees.extend(many),
            TreeFile::One(one) => trees.push(*one),
        }
    }
    Ok(trees)
}

/// Load trees parents-first, whatever order the files list them in.
fn build_store(trees: Vec<NavigationTree>) -> anyhow::Result<GraphStore> {
    let store = GraphStore::new();
    let mut pending = trees;

    while !pending.is_empty() {
        let before = pending.len();
        let mut deferred = Vec::new();
        for tree in pending {
            let ready = tree
                .parent_tree_id
                .as_deref()
                .map_or(true, |parent| store.tree(parent).is_ok());
            if ready {
                let id = tree.id.clone();
                store
                    .load(tree)
                    .with_context(|| format!("loading tree '{}'", id))?;
            } else {
                deferred.push(tree);
            }
        }
        if deferred.len() == before {
            // Nothing was loadable; loading the first one reports why.
            let tree = deferred.remove(0);
            let id = tree.id.clone();
            store
                .load(tree)
                .with_context(|| format!("loading tree '{}'", id))?;
        }
        pending = deferred;
    }
    Ok(store)
}

fn load_store(files: &[PathBuf]) -> anyhow::Result<GraphStore> {
    build_store(read_trees(files)?)
}

fn validate(files: &[PathBuf]) -> anyhow::Result<()> {
    let store = load_store(files)?;
    for id in store.tree_ids() {
        let tree = store.tree(&id)?;
        let bidirectional = tree.edges().iter().filter(|e| e.is_bidirectional()).count();
        println!(
            "  ok  {:<24} {} nodes, {} edges ({} bidirectional), depth {}",
            id,
            tree.nodes().len(),
            tree.edges().len(),
            bidirectional,
            tree.depth()
        );
    }
    println!("{} tree(s) valid", store.tree_ids().len());
    Ok(())
}

fn print_path(files: &[PathBuf], tree_id: &str, from: &str, to: &str) -> anyhow::Result<()> {
    let store = load_store(files)?;
    let handle = store.tree(tree_id)?;
    let path = Pathfinder::new(&store).find_path(&handle, from, to)?;

    if path.is_empty() {
        println!("Already at '{}'", to);
        return Ok(());
    }
    for (i, hop) in path.iter().enumerate() {
        println!(
            "{:>3}. [{}] {:<20} {} -> {} ({})",
            i + 1,
            hop.tree_id,
            hop.edge.id,
            hop.from_node(),
            hop.to_node(),
            hop.direction
        );
    }
    Ok(())
}

async fn simulate(
    config: &AppConfig,
    files: &[PathBuf],
    tree_id: &str,
    from: Option<String>,
    to: &str,
    runs: usize,
) -> anyhow::Result<()> {
    let store = Arc::new(load_store(files)?);
    let handle = store.tree(tree_id)?;
    let from = match from {
        Some(from) => from,
        None => handle
            .entry_node_id()
            .map(String::from)
            .with_context(|| format!("tree '{}' has no entry node; pass --from", tree_id))?,
    };

    let device = Arc::new(SimulatedDevice::new(&config.simulation));
    let event_bus = Arc::new(EventBus::default());
    let metrics = Arc::new(MetricsAggregator::new().with_event_bus(event_bus.clone()));
    let orchestrator = Arc::new(ExecutionOrchestrator::new(
        config.orchestrator.clone(),
        store,
        StepExecutor::new(device.clone(), device),
        metrics.clone(),
        event_bus.clone(),
    ));
    let reaper = orchestrator.start_reaper();

    let logger = match &config.log {
        Some(log) if log.enabled => {
            let dir = log.resolved_dir();
            info!(dir = %dir.display(), level = log.level, "Execution logging enabled");
            Some(ExecutionLogger::new(dir, log.level).spawn(&event_bus, orchestrator.cancel_token()))
        }
        _ => None,
    };

    info!(
        tree_id = %tree_id,
        from = %from,
        to = %to,
        runs,
        failure_rate = config.simulation.failure_rate,
        "Starting simulation"
    );

    let mut failed = 0;
    for run in 1..=runs {
        let request = ExecutionRequest::Navigate(NavigateRequest::new(tree_id, to).from_node(&from));
        let id = orchestrator.submit(request)?;
        let record = orchestrator
            .wait_for_terminal(&id, Duration::from_millis(20))
            .await?;

        match record.status {
            ExecutionStatus::Completed => {
                let hops = record.result.as_ref().map(|r| r.hops).unwrap_or(0);
                println!("run {:>3}: completed  {} hop(s)", run, hops);
            }
            _ => {
                failed += 1;
                let reason = record
                    .error
                    .as_ref()
                    .map(|e| e.message.as_str())
                    .unwrap_or("unknown error");
                println!("run {:>3}: {}  {}", run, record.status, reason);
                if let Some(step) = record.failing_step() {
                    if let Some(evidence) = &step.evidence_ref {
                        println!("          evidence: {}", evidence);
                    }
                }
            }
        }
    }

    print_metrics(config, &metrics);

    orchestrator.shutdown();
    reaper.await.ok();
    if let Some(logger) = logger {
        logger.await.ok();
    }

    if failed > 0 {
        warn!(failed, runs, "Some simulated runs failed");
    }
    Ok(())
}

fn print_metrics(config: &AppConfig, metrics: &MetricsAggregator) {
    let points = metrics.snapshot();
    if points.is_empty() {
        println!("No metrics recorded.");
        return;
    }
    println!();
    println!(
        "  {:<32} {:>6} {:>8} {:>9} {:>10}  band",
        "element", "runs", "success", "avg ms", "confidence"
    );
    for (key, point) in points {
        let confidence = point.confidence();
        println!(
            "  {:<32} {:>6} {:>7.0}% {:>9.1} {:>10.3}  {}",
            key.to_string(),
            point.total,
            point.success_rate() * 100.0,
            point.avg_execution_ms,
            confidence,
            config.metrics.band(confidence)
        );
    }
}
