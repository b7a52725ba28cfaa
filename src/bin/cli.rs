//! Taxotree CLI - command-line interface for classification trees
//!
//! Usage: taxotree-cli [OPTIONS] <COMMAND>
//!
//! Supports JSON output for scripting.

use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use taxotree_lib::db::Database;
use taxotree_lib::hierarchy::{self, SynonymizeOptions};
use taxotree_lib::import::{self, ImportConfig, ImportEvent, ImportJob, ImportOptions, UnresolvedParentPolicy};
use taxotree_lib::{numbering, settings, FailureReport, TreeError};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "taxotree-cli")]
#[command(version, about = "Classification tree CLI", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Database path (default: settings, then app data dir)
    #[arg(long, global = true)]
    db: Option<String>,

    /// Output as JSON for scripting
    #[arg(long, global = true)]
    json: bool,

    /// Suppress progress output
    #[arg(long, short, global = true)]
    quiet: bool,

    /// Name recorded as the author of mutations
    #[arg(long, global = true, default_value = "cli")]
    actor: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the definition, ranks and root described by an import config
    Init {
        /// Import config (JSON)
        config: PathBuf,
    },
    /// Import a delimited dataset (file path or http(s) URL)
    Import {
        /// Import config (JSON)
        config: PathBuf,
        /// File path or URL of the dataset
        source: String,
        /// Records per flush (overrides config and settings)
        #[arg(long)]
        batch_size: Option<usize>,
        /// Keep nodes with unresolved parents for the next flush instead of dropping them
        #[arg(long)]
        retry_unresolved: bool,
    },
    /// Renumber a definition and check the range invariant
    Repair { definition_id: i64 },
    /// Report every range or structure violation without changing anything
    Validate { definition_id: i64 },
    /// Merge a node into another; its children, synonyms and records move to the target
    Merge { source: i64, target: i64 },
    /// Move a node (and its subtree) under a new parent
    Move { node: i64, new_parent: i64 },
    /// Make a node a synonym of another
    Synonymize {
        node: i64,
        target: i64,
        /// Allow a target that has children
        #[arg(long)]
        allow_children: bool,
    },
    /// Restore a synonym to canonical status
    Desynonymize { node: i64 },
    /// Reassign every record at or below a node to another node
    BulkMove { node: i64, target: i64 },
    /// List everything under a node
    Subtree { node: i64 },
    /// List the ranks of a definition
    Ranks { definition_id: i64 },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let json = cli.json;

    if let Err(e) = run_cli(cli).await {
        if json {
            let report = FailureReport::from(&e);
            println!("{}", serde_json::to_string_pretty(&report).unwrap_or_else(|_| e.to_string()));
        } else {
            eprintln!("Error: {}", e);
        }
        std::process::exit(1);
    }
}

async fn run_cli(cli: Cli) -> Result<(), TreeError> {
    settings::init(settings::default_app_data_dir());

    let db_path = cli.db.map(PathBuf::from).unwrap_or_else(settings::database_path);
    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .map_err(|e| TreeError::Config(format!("Failed to create {}: {}", parent.display(), e)))?;
        }
    }
    let db = Arc::new(Database::new(&db_path)?);
    tracing::debug!(path = %db_path.display(), "[Cli] Using database");

    let actor = cli.actor.as_str();
    match cli.command {
        Commands::Init { config } => {
            let config = ImportConfig::load(&config)?;
            let now = chrono::Utc::now().timestamp_millis();
            let boot = db.transaction(|tx| import::bootstrap(tx, &config, now))?;
            if cli.json {
                print_json(&serde_json::json!({
                    "definition": boot.catalog.definition(),
                    "root": boot.root,
                    "ranks": boot.catalog.ranks(),
                }));
            } else {
                let def = boot.catalog.definition();
                println!("Definition {} '{}' (scope {})", def.id, def.name, def.scope);
                println!("Root {} '{}'", boot.root.id, boot.root.name);
                println!("{} rank(s)", boot.catalog.ranks().len());
            }
        }
        Commands::Import { config, source, batch_size, retry_unresolved } => {
            let config = ImportConfig::load(&config)?;
            let mut options = ImportOptions::from_settings().with_config(&config);
            if let Some(size) = batch_size {
                options.batch_size = size.max(1);
            }
            if retry_unresolved {
                options.unresolved_parent_policy = UnresolvedParentPolicy::Retry;
            }
            run_import_job(db, config, &source, options, cli.json, cli.quiet).await?;
        }
        Commands::Repair { definition_id } => {
            let report = hierarchy::repair(&db, definition_id)?;
            if cli.json {
                print_json(&report);
            } else {
                println!(
                    "Renumbered {} node(s), {} changed; fixed {} violation(s)",
                    report.stats.numbered,
                    report.stats.changed,
                    report.fixed.len()
                );
            }
        }
        Commands::Validate { definition_id } => {
            let violations = numbering::validate_definition(&db, definition_id)?;
            if cli.json {
                print_json(&violations);
            } else if violations.is_empty() {
                println!("Definition {} is valid", definition_id);
            } else {
                for v in &violations {
                    println!("node {:>8}  {:?}  {}", v.node_id, v.kind, v.detail);
                }
                println!("{} violation(s)", violations.len());
            }
        }
        Commands::Merge { source, target } => {
            let result = hierarchy::merge(&db, source, target, actor)?;
            if cli.json {
                print_json(&result);
            } else {
                println!(
                    "Merged {} into {}: {} child(ren), {} synonym(s), {} record(s) moved. Run `repair` to renumber.",
                    source, target, result.children_moved, result.synonyms_repointed, result.records_moved
                );
            }
        }
        Commands::Move { node, new_parent } => {
            let result = hierarchy::move_node(&db, node, new_parent, actor)?;
            if cli.json {
                print_json(&result);
            } else {
                println!(
                    "Moved {} under {}; {} full name(s) updated. Run `repair` to renumber.",
                    node, new_parent, result.full_names_updated
                );
            }
        }
        Commands::Synonymize { node, target, allow_children } => {
            let options = SynonymizeOptions { allow_target_children: allow_children };
            let result = hierarchy::synonymize(&db, node, target, actor, options)?;
            if cli.json {
                print_json(&result);
            } else {
                println!("{} is now a synonym of {} ({} synonym(s) re-pointed)", node, target, result.synonyms_repointed);
            }
        }
        Commands::Desynonymize { node } => {
            hierarchy::desynonymize(&db, node, actor)?;
            if cli.json {
                print_json(&serde_json::json!({ "node": node, "accepted": true }));
            } else {
                println!("{} is canonical again", node);
            }
        }
        Commands::BulkMove { node, target } => {
            let moved = hierarchy::bulk_reassign_leaves(&db, node, target, actor)?;
            if cli.json {
                print_json(&serde_json::json!({ "moved": moved }));
            } else {
                println!("Reassigned {} record(s) to {}", moved, target);
            }
        }
        Commands::Subtree { node } => {
            let root = db.get_node(node)?.ok_or(TreeError::NodeNotFound(node))?;
            let descendants = db.subtree(&root)?;
            if cli.json {
                print_json(&descendants);
            } else {
                for n in &descendants {
                    let marker = if n.is_accepted() { "" } else { " (synonym)" };
                    println!(
                        "{:>8}  [{:>4}]  {}{}",
                        n.id,
                        n.rank_id,
                        n.full_name.as_deref().unwrap_or(&n.name),
                        marker
                    );
                }
                if descendants.is_empty() && root.node_number.is_none() {
                    eprintln!("Node {} has no range yet; run `repair` first", node);
                }
            }
        }
        Commands::Ranks { definition_id } => {
            let ranks = db.get_ranks(definition_id)?;
            if cli.json {
                print_json(&ranks);
            } else {
                for r in &ranks {
                    let mut flags = Vec::new();
                    if r.is_enforced {
                        flags.push("enforced");
                    }
                    if r.is_in_full_name {
                        flags.push("in full name");
                    }
                    println!("{:>4}  {}  {}", r.rank_id, r.name, flags.join(", "));
                }
            }
        }
    }
    Ok(())
}

async fn run_import_job(
    db: Arc<Database>,
    config: ImportConfig,
    source: &str,
    options: ImportOptions,
    json: bool,
    quiet: bool,
) -> Result<(), TreeError> {
    let (tx, mut rx) = mpsc::channel(256);
    let job = ImportJob::start(db, config, source, options, Some(tx))?;

    let mut cancelled = false;
    let mut last_report = Instant::now() - Duration::from_secs(10);
    loop {
        let event = tokio::select! {
            event = rx.recv() => event,
            // Ctrl-C asks the job to stop; committed batches stay
            _ = tokio::signal::ctrl_c(), if !cancelled => {
                eprintln!("Cancelling import...");
                job.cancel();
                cancelled = true;
                continue;
            }
        };
        // The channel closes when the job ends
        let Some(event) = event else { break };
        match event {
            ImportEvent::Started { job_id, definition } => {
                if !quiet {
                    eprintln!("[Import] Job {} started for '{}'", job_id, definition);
                }
            }
            ImportEvent::Progress { progress, .. } => {
                if !quiet && last_report.elapsed() >= Duration::from_secs(1) {
                    last_report = Instant::now();
                    let pct = if progress.total > 0 {
                        progress.current as f64 * 100.0 / progress.total as f64
                    } else {
                        0.0
                    };
                    eprintln!("[Import] {} rows, {:.1}% of {} bytes", progress.rows, pct, progress.total);
                }
            }
            ImportEvent::Completed { summary, .. } => {
                if json {
                    print_json(&summary);
                } else {
                    println!(
                        "Imported {} rows into definition {}: {} node(s) created, {} duplicate(s) skipped, {} dropped",
                        summary.rows_read,
                        summary.definition_id,
                        summary.nodes_created,
                        summary.duplicates_skipped,
                        summary.unresolved_dropped
                    );
                    for (rank, count) in &summary.created_by_rank {
                        println!("  {:<16} {}", rank, count);
                    }
                    for path in &summary.dropped_paths {
                        println!("  dropped: {}", path);
                    }
                }
            }
            // Reported by main from the job result
            ImportEvent::Failed { .. } => {}
        }
    }

    job.wait().await.map(|_| ())
}

fn print_json<T: Serialize + ?Sized>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(s) => println!("{}", s),
        Err(e) => eprintln!("Failed to serialize output: {}", e),
    }
}
