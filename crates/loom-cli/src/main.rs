//! Loom CLI - knowledge graph consolidation engine

use std::sync::Arc;

use clap::{Parser, Subcommand};
use loom_core::config::Config;
use loom_core::domain::consolidation::ConsolidationEngine;
use loom_core::domain::dedup::DuplicateDetector;
use loom_core::domain::graph::{GraphEvent, GraphStore, RelationshipType};
use loom_core::domain::locking::{LockConfig, NodeLockManager};
use loom_core::domain::pipeline::{Pipeline, PipelineGate, UnitStatus};
use loom_core::domain::query::QueryExplorer;
use loom_core::domain::repair::{Escalation, RepairController, RepairLoop};
use loom_core::domain::taxonomy::TaxonomyPlacer;
use loom_core::infrastructure::SqliteCommitLog;
use loom_core::llm::{HttpModelClient, ProposalGateway};
use loom_core::storage::Database;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info};

#[derive(Parser)]
#[command(name = "loom")]
#[command(author, version, about = "Knowledge graph consolidation engine", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output format (text or json)
    #[arg(long, global = true, default_value = "text")]
    format: OutputFormat,

    /// Quiet mode (minimal output)
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Clone, Copy, Default, PartialEq, Eq, Debug, clap::ValueEnum)]
enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Ingest a text document through the pipeline
    Ingest {
        /// Path to a UTF-8 text file
        file: std::path::PathBuf,
        /// Skip the duplicate detection cycle after ingesting
        #[arg(long)]
        no_detect: bool,
    },

    /// Select nodes from the committed graph
    Query {
        /// Full-text search terms
        text: Option<String>,
        /// Start from these node ids
        #[arg(short, long)]
        seed: Vec<String>,
        /// Only follow these relationship types
        #[arg(short, long)]
        relationship: Vec<String>,
        #[arg(long)]
        depth: Option<u32>,
        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Graph counts
    Stats,

    /// Commit log inspection
    Log {
        #[command(subcommand)]
        action: LogAction,
    },

    /// Repair queue
    Repair {
        #[command(subcommand)]
        action: RepairAction,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum LogAction {
    /// Show commit log and schema status
    Status,
    /// Rebuild the graph from the commit log and report what it holds
    Replay,
    /// Show recent commits as events
    Show {
        #[arg(short, long, default_value = "20")]
        limit: u32,
    },
}

#[derive(Subcommand)]
enum RepairAction {
    /// Scan the graph and list the cases that need an operator
    Scan,
    /// Scan, then answer escalations interactively
    Review,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Get a configuration value
    Get { key: String },
    /// Set a configuration value
    Set { key: String, value: String },
    /// List all configuration values
    List,
    /// Reset configuration to defaults
    Reset,
    /// Show config file path
    Path,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("loom=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Ingest { file, no_detect } => {
            let config = Config::load()?;
            cmd_ingest(&config, &file, no_detect, cli.format, cli.quiet).await
        }
        Commands::Query {
            text,
            seed,
            relationship,
            depth,
            limit,
        } => {
            let config = Config::load()?;
            let args = QueryArgs {
                text,
                seed,
                relationship,
                depth,
                limit,
            };
            cmd_query(&config, args, cli.format).await
        }
        Commands::Stats => {
            let config = Config::load()?;
            cmd_stats(&config, cli.format).await
        }
        Commands::Log { action } => {
            let config = Config::load()?;
            cmd_log(&config, action, cli.format).await
        }
        Commands::Repair { action } => {
            let config = Config::load()?;
            cmd_repair(&config, action, cli.format, cli.quiet).await
        }
        Commands::Config { action } => cmd_config(action, cli.quiet),
    }
}

// ============================================================================
// Wiring
// ============================================================================

struct Graph {
    db: Database,
    log: Arc<SqliteCommitLog>,
    store: Arc<GraphStore>,
}

/// Open the commit log and rebuild the graph from it
async fn open_graph(config: &Config) -> anyhow::Result<Graph> {
    config.validate()?;
    let path = config.database_path()?;
    debug!(path = %path.display(), "Opening commit log");
    let db = Database::open(&path).await?;
    let log = Arc::new(SqliteCommitLog::new(db.pool().clone()));
    let store = Arc::new(GraphStore::open(log.clone()).await?);
    Ok(Graph { db, log, store })
}

fn lock_manager(config: &Config) -> Arc<NodeLockManager> {
    let consolidation = config.consolidation_config();
    Arc::new(NodeLockManager::new(
        LockConfig::default().with_timeout(consolidation.lock_timeout),
    ))
}

// ============================================================================
// Command Implementations
// ============================================================================

async fn cmd_ingest(
    config: &Config,
    file: &std::path::Path,
    no_detect: bool,
    format: OutputFormat,
    quiet: bool,
) -> anyhow::Result<()> {
    let text = std::fs::read_to_string(file)
        .map_err(|e| anyhow::anyhow!("Failed to read {}: {}", file.display(), e))?;
    let graph = open_graph(config).await?;
    let gate = PipelineGate::new();
    let locks = lock_manager(config);

    let (mut repair, mut controller) = RepairLoop::new(
        Arc::clone(&graph.store),
        Arc::clone(&locks),
        gate.clone(),
        config.repair_config()?,
    );
    let engine = Arc::new(
        ConsolidationEngine::new(
            Arc::clone(&graph.store),
            locks,
            gate,
            config.consolidation_config(),
        )
        .with_deferred_sink(repair.deferred_sink()),
    );
    let mut repair = repair.with_engine(Arc::clone(&engine));

    let client = Arc::new(HttpModelClient::new(config.http_model_config()?)?);
    let gateway = Arc::new(ProposalGateway::new(client, config.gateway_config()));
    let pipeline = Pipeline::new(
        engine,
        Arc::clone(&gateway),
        TaxonomyPlacer::new(config.placement_config()),
        DuplicateDetector::new(config.detector_config()),
        config.pipeline_config(),
    );

    if !quiet && format == OutputFormat::Text {
        println!("Ingesting {}...", file.display());
    }
    let outcomes = pipeline.ingest_document(&text).await;
    let committed = outcomes.iter().filter(|o| o.is_committed()).count();
    let empty = outcomes
        .iter()
        .filter(|o| o.status == UnitStatus::Empty)
        .count();
    let failed: Vec<_> = outcomes
        .iter()
        .filter(|o| o.status == UnitStatus::Failed)
        .collect();

    let cycle = if no_detect {
        None
    } else {
        Some(pipeline.run_detection_cycle().await?)
    };

    let tick = repair.tick().await?;
    let escalations = drain_escalations(&mut controller);

    match format {
        OutputFormat::Json => {
            let failures: Vec<_> = failed
                .iter()
                .map(|o| serde_json::json!({"unit_id": o.unit_id, "error": o.error}))
                .collect();
            let report = serde_json::json!({
                "units": outcomes.len(),
                "committed": committed,
                "empty": empty,
                "failed": failures,
                "detection": cycle.as_ref().map(|c| serde_json::json!({
                    "groups": c.groups,
                    "merged": c.merged,
                    "deferred": c.deferred,
                    "rejected": c.rejected,
                })),
                "escalations": escalations,
                "gateway": {
                    "attempts": gateway.stats().attempts,
                    "rejections": gateway.stats().rejections,
                },
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        OutputFormat::Text => {
            if !quiet {
                println!(
                    "Units: {} ({} committed, {} empty, {} failed)",
                    outcomes.len(),
                    committed,
                    empty,
                    failed.len()
                );
                for outcome in &failed {
                    println!(
                        "  [failed] {}: {}",
                        outcome.unit_id,
                        outcome.error.as_deref().unwrap_or("unknown error")
                    );
                }
                if let Some(cycle) = &cycle {
                    println!(
                        "Detection: {} groups ({} merged, {} deferred, {} rejected)",
                        cycle.groups, cycle.merged, cycle.deferred, cycle.rejected
                    );
                }
                println!(
                    "Repair: {} resolved, {} escalated",
                    tick.resolved, tick.escalated
                );
                print_escalations(&escalations);
            }
        }
    }
    graph.db.close().await;
    Ok(())
}

struct QueryArgs {
    text: Option<String>,
    seed: Vec<String>,
    relationship: Vec<String>,
    depth: Option<u32>,
    limit: Option<usize>,
}

async fn cmd_query(config: &Config, args: QueryArgs, format: OutputFormat) -> anyhow::Result<()> {
    let graph = open_graph(config).await?;
    let mut criteria = config.selection_defaults();
    criteria.text = args.text;
    criteria.seed_ids = args.seed;
    if !args.relationship.is_empty() {
        criteria.relationship_filter = Some(
            args.relationship
                .iter()
                .map(|r| RelationshipType::parse(r))
                .collect(),
        );
    }
    if let Some(depth) = args.depth {
        criteria.max_depth = depth;
    }
    if let Some(limit) = args.limit {
        criteria.limit = limit;
    }

    let explorer = QueryExplorer::new(Arc::clone(&graph.store));
    let results = explorer.select_nodes(&criteria).await?;
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&results)?),
        OutputFormat::Text => {
            if results.is_empty() {
                println!("No matching nodes.");
            }
            for selected in results {
                let node = &selected.node;
                println!(
                    "{:.3}  {} [{}] {}  ({})",
                    selected.score,
                    node.label,
                    node.node_type,
                    node.taxonomy_path.join(" / "),
                    selected.reason
                );
                println!("       id: {}", node.id);
            }
        }
    }
    graph.db.close().await;
    Ok(())
}

async fn cmd_stats(config: &Config, format: OutputFormat) -> anyhow::Result<()> {
    let graph = open_graph(config).await?;
    let stats = graph.store.stats().await;
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&stats)?),
        OutputFormat::Text => {
            println!("Nodes:      {}", stats.nodes);
            println!("Edges:      {}", stats.edges);
            println!("Categories: {}", stats.categories);
            println!("Retired:    {}", stats.retired);
            println!("Sequence:   {}", stats.last_sequence);
        }
    }
    graph.db.close().await;
    Ok(())
}

async fn cmd_log(config: &Config, action: LogAction, format: OutputFormat) -> anyhow::Result<()> {
    let graph = open_graph(config).await?;
    match action {
        LogAction::Status => {
            let status = graph.db.migration_status().await?;
            let count = graph.log.count().await?;
            match format {
                OutputFormat::Json => println!(
                    "{}",
                    serde_json::to_string_pretty(&serde_json::json!({
                        "path": graph.db.path().display().to_string(),
                        "records": count,
                        "schema_version": status.current_version,
                        "target_version": status.target_version,
                        "needs_migration": status.needs_migration,
                    }))?
                ),
                OutputFormat::Text => {
                    println!("Commit log: {}", graph.db.path().display());
                    println!("  Records: {}", count);
                    println!(
                        "  Schema: v{} (target v{})",
                        status.current_version, status.target_version
                    );
                }
            }
        }
        LogAction::Replay => {
            // open_graph already replayed every record
            let stats = graph.store.stats().await;
            match format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&stats)?),
                OutputFormat::Text => println!(
                    "Replayed {} commits: {} nodes, {} edges, {} categories, {} retired",
                    stats.last_sequence, stats.nodes, stats.edges, stats.categories, stats.retired
                ),
            }
        }
        LogAction::Show { limit } => {
            let records = graph.log.recent(limit).await?;
            let events: Vec<GraphEvent> = records.iter().flat_map(GraphEvent::from_record).collect();
            match format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&events)?),
                OutputFormat::Text => {
                    for record in &records {
                        println!(
                            "#{} {} {}",
                            record.sequence,
                            record.committed_at.format("%Y-%m-%d %H:%M:%S"),
                            record.transaction.description
                        );
                        for event in GraphEvent::from_record(record) {
                            println!("    {}", event.summary());
                        }
                    }
                }
            }
        }
    }
    graph.db.close().await;
    Ok(())
}

fn drain_escalations(controller: &mut RepairController) -> Vec<Escalation> {
    let mut out = Vec::new();
    while let Some(escalation) = controller.try_next_escalation() {
        out.push(escalation);
    }
    out
}

fn print_escalations(escalations: &[Escalation]) {
    for escalation in escalations {
        println!(
            "  [{}] case {} on node {}",
            escalation.problem, escalation.case_id, escalation.node_id
        );
        println!("      {}", escalation.reason);
        if !escalation.suggested_actions.is_empty() {
            println!("      try: {}", escalation.suggested_actions.join(" | "));
        }
    }
}

async fn cmd_repair(
    config: &Config,
    action: RepairAction,
    format: OutputFormat,
    quiet: bool,
) -> anyhow::Result<()> {
    let graph = open_graph(config).await?;
    let locks = lock_manager(config);
    let gate = PipelineGate::new();
    let engine = Arc::new(ConsolidationEngine::new(
        Arc::clone(&graph.store),
        Arc::clone(&locks),
        gate.clone(),
        config.consolidation_config(),
    ));
    let (repair, mut controller) = RepairLoop::new(
        Arc::clone(&graph.store),
        locks,
        gate.clone(),
        config.repair_config()?,
    );
    let mut repair = repair.with_engine(engine);

    let tick = repair.tick().await?;
    let mut escalations = drain_escalations(&mut controller);

    match action {
        RepairAction::Scan => match format {
            OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&escalations)?),
            OutputFormat::Text => {
                if !quiet {
                    println!(
                        "Opened {} cases: {} resolved, {} skipped, {} escalated",
                        tick.opened, tick.resolved, tick.skipped, tick.escalated
                    );
                }
                print_escalations(&escalations);
            }
        },
        RepairAction::Review => {
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            'review: while !escalations.is_empty() {
                for escalation in &escalations {
                    print_escalations(std::slice::from_ref(escalation));
                    println!("verdict (pause | skip | postpone <time> | instruct <text> | quit):");
                    let Some(line) = lines.next_line().await? else {
                        break 'review;
                    };
                    match line.trim() {
                        "quit" | "q" => break 'review,
                        "resume" => {
                            controller.resume_pipeline();
                            println!("Pipeline resumed.");
                        }
                        verdict => {
                            if let Err(e) = controller.submit_line(&escalation.case_id, verdict) {
                                println!("  {}", e);
                            }
                        }
                    }
                }
                let tick = repair.tick().await?;
                info!(
                    resolved = tick.resolved,
                    escalated = tick.escalated,
                    "Verdicts applied"
                );
                if gate.is_paused() {
                    println!(
                        "Pipeline paused: {}",
                        gate.reason().unwrap_or_default()
                    );
                }
                escalations = drain_escalations(&mut controller);
            }
            if !quiet && escalations.is_empty() {
                println!("No escalated cases remain.");
            }
        }
    }
    graph.db.close().await;
    Ok(())
}

fn cmd_config(action: ConfigAction, quiet: bool) -> anyhow::Result<()> {
    match action {
        ConfigAction::Get { key } => {
            let config = Config::load()?;
            let value = config.get(&key)?;
            println!("{}", value);
        }
        ConfigAction::Set { key, value } => {
            let mut config = Config::load()?;
            config.set(&key, &value)?;
            config.save()?;
            if !quiet {
                println!("Set {} = {}", key, value);
            }
        }
        ConfigAction::List => {
            let config = Config::load()?;
            let items = config.list()?;
            for (key, value) in items {
                println!("{} = {}", key, value);
            }
        }
        ConfigAction::Reset => {
            Config::reset()?;
            if !quiet {
                println!("Configuration reset to defaults.");
            }
        }
        ConfigAction::Path => {
            let path = Config::config_path()?;
            println!("{}", path.display());
        }
    }
    Ok(())
}
