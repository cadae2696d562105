//! Salted CLI - Lineage-versioned task runner
//!
//! Commands:
//! - salted hash              - Content hash of every task
//! - salted graph             - Build order and depth levels
//! - salted affected <task>   - Tasks downstream of a task
//! - salted status            - Which tasks are stale (dry run)
//! - salted run               - Build stale tasks
//! - salted clear-cache       - Drop every stored artifact

mod manifest;

use anyhow::Result;
use clap::{Parser, Subcommand};
use manifest::Manifest;
use salted_core::{
    default_config_path, load_config, BuildConfig, Engine, Freshness, NodeState, Resolution,
    SledStore, StaleReason, TaskGraph,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::Level;

/// Salted - content-addressed builds for task graphs
#[derive(Parser)]
#[command(name = "salted", version, about = "Lineage-versioned task runner")]
struct Cli {
    /// Task manifest
    #[arg(short, long, global = true, default_value = "salted.json")]
    manifest: PathBuf,

    /// Artifact store directory
    #[arg(long, global = true, default_value = ".salted/store")]
    store: PathBuf,

    /// Config file (default: ~/.salted/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// More logging (-v, -vv)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the content hash of every task
    Hash,
    /// Show build order and depth levels
    Graph,
    /// Show tasks affected by a change to one task
    Affected {
        /// Task id that changed
        task: String,
    },
    /// Show which tasks are stale without running anything
    Status,
    /// Run every stale task
    Run {
        /// Max concurrent tasks (default: from config)
        #[arg(short = 'j', long)]
        concurrency: Option<usize>,
        /// Print the build report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Remove every artifact from the store
    ClearCache,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    let config = load_config(&config_path)?;

    match cli.command {
        Commands::Hash => show_hashes(&cli.manifest)?,
        Commands::Graph => show_graph(&cli.manifest)?,
        Commands::Affected { ref task } => show_affected(&cli.manifest, task)?,
        Commands::Status => show_status(&cli.manifest, &cli.store, config).await?,
        Commands::Run { concurrency, json } => {
            let config = match concurrency {
                Some(n) => config.with_concurrency(n),
                None => config,
            };
            let success = run_build(&cli.manifest, &cli.store, config, json).await?;
            if !success {
                std::process::exit(1);
            }
        }
        Commands::ClearCache => {
            let store = SledStore::open(&cli.store)?;
            let (count, _) = store.stats()?;
            store.clear()?;
            println!("🗑️  Cleared {} artifacts", count);
        }
    }

    Ok(())
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn load_graph(manifest: &Path) -> Result<TaskGraph> {
    let manifest = Manifest::load(manifest)?;
    Ok(TaskGraph::build(manifest.descriptors())?)
}

/// Print every task's content hash
fn show_hashes(manifest: &Path) -> Result<()> {
    let graph = load_graph(manifest)?;
    let resolution = salted_core::resolve(&graph)?;

    for node in resolution.iter() {
        println!("{:<24} {}", node.task_id, node.content_hash);
    }
    print_unhashable(&graph, &resolution);
    Ok(())
}

/// Print build order
fn show_graph(manifest: &Path) -> Result<()> {
    let start = Instant::now();
    let graph = load_graph(manifest)?;

    println!("📦 Tasks: {}", graph.len());
    println!("🔗 Dependencies: {}", graph.edge_count());
    println!();

    println!("🔨 Build Order (dependencies first):");
    for (i, task) in graph.topological_order().enumerate() {
        if task.dependencies.is_empty() {
            println!("   {}. {} (v{})", i + 1, task.task_id, task.logic_version);
        } else {
            println!(
                "   {}. {} (v{}) <- {}",
                i + 1,
                task.task_id,
                task.logic_version,
                task.dependencies.join(", ")
            );
        }
    }
    println!();

    println!("🪜 Levels (tasks in one level can run in parallel):");
    for (depth, level) in graph.levels().iter().enumerate() {
        let ids: Vec<&str> = level.iter().map(|t| t.task_id.as_str()).collect();
        println!("   {}: {}", depth, ids.join(", "));
    }

    println!();
    println!("✅ Graph built in {:?}", start.elapsed());
    Ok(())
}

/// Print downstream tasks
fn show_affected(manifest: &Path, task: &str) -> Result<()> {
    let graph = load_graph(manifest)?;
    if !graph.contains(task) {
        println!("❌ Task '{}' not found", task);
        return Ok(());
    }

    let affected = graph.affected(task);
    println!("📦 Tasks re-keyed by a change to {} ({}):", task, affected.len());
    for id in &affected {
        println!("   • {}", id);
    }
    Ok(())
}

/// Tasks without a hash: their own encoding failed, or an upstream one did
fn print_unhashable(graph: &TaskGraph, resolution: &Resolution) {
    for (task_id, error) in resolution.failed() {
        println!("❌ {:<21} {}", task_id, error);
    }
    for task in graph.topological_order() {
        if resolution.is_unresolved(&task.task_id) {
            println!("⊘ {:<22} no hash (upstream cannot be hashed)", task.task_id);
        }
    }
}

/// Dry run against the store
async fn show_status(manifest: &Path, store: &Path, config: BuildConfig) -> Result<()> {
    let manifest = Manifest::load(manifest)?;
    let store = Arc::new(SledStore::open(store)?);
    let engine = Engine::new(store).with_config(config);

    let graph = TaskGraph::build(manifest.descriptors())?;
    let (resolution, plan) = engine.plan(manifest.descriptors()).await?;

    for (node, freshness) in plan.iter() {
        let status = match freshness {
            Freshness::Fresh => "✓ fresh".to_string(),
            Freshness::Stale(StaleReason::Missing) => "● stale (no artifact)".to_string(),
            Freshness::Stale(StaleReason::UpstreamStale { dependency }) => {
                format!("● stale (upstream {})", dependency)
            }
            Freshness::Unknown { error } => format!("? unknown ({})", error),
        };
        println!("{:<24} {}  {}", node.task_id, node.content_hash.short(12), status);
    }
    print_unhashable(&graph, &resolution);

    println!();
    println!(
        "{} of {} tasks need to run",
        plan.stale().len(),
        plan.len()
    );
    Ok(())
}

/// Build stale tasks; returns whether everything succeeded
async fn run_build(manifest_path: &Path, store: &Path, config: BuildConfig, json: bool) -> Result<bool> {
    let workdir = manifest_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    let manifest = Manifest::load(manifest_path)?;

    let store = Arc::new(SledStore::open(store)?);
    let engine = Engine::new(store).with_config(config);

    let cancel = engine.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("⚠️  Cancelling: waiting for running tasks...");
            cancel.cancel();
        }
    });

    if !json {
        println!("🚀 salted run ({} tasks)", manifest.tasks.len());
    }
    let report = engine.run(manifest.into_tasks(&workdir)).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(report.is_success());
    }

    println!();
    for node in &report.nodes {
        let icon = match node.state {
            NodeState::Skipped => "⏭",
            NodeState::Completed => "✓",
            NodeState::Failed => "✗",
            NodeState::Blocked => "⊘",
            _ => "…",
        };
        let shared = if node.shared { " (shared)" } else { "" };
        println!(
            "{} {:<24} {}  {}{}",
            icon,
            node.task_id,
            node.content_hash
                .map(|h| h.short(12))
                .unwrap_or_else(|| "-".repeat(12)),
            node.state,
            shared
        );
        if let Some(failure) = &node.failure {
            println!("   • {}", failure);
        }
    }

    println!();
    if report.is_success() {
        println!("✅ {} in {}ms", report.summary(), report.duration_ms);
    } else {
        println!("❌ {} in {}ms", report.summary(), report.duration_ms);
    }

    Ok(report.is_success())
}
