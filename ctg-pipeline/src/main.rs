//! ctg-pipeline - Cognitive Triangulation Pipeline
//!
//! CLI entry point. `start` runs a whole-tree sweep against cleared
//! stores; `stop`/`status` operate on durable run records; `clear` purges
//! all three stores; `test-connections` probes each external collaborator.
//!
//! Exit codes: 0 success, 1 fatal configuration error, 2 connection
//! failure, 3 pipeline failure.

use clap::{Parser, Subcommand};
use ctg_common::config::AppConfig;
use ctg_common::db::runs::{self, RunStatus};
use ctg_common::events::EventBus;
use ctg_pipeline::broker::Broker;
use ctg_pipeline::graph::{GraphSink, Neo4jGraph};
use ctg_pipeline::oracle::AnthropicOracle;
use ctg_pipeline::pipeline::{
    self, clear_run_state, run_pipeline, visibility_timeout_ms, PipelineDeps, PipelineRegistry,
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

const EXIT_CONFIG: u8 = 1;
const EXIT_CONNECTION: u8 = 2;
const EXIT_PIPELINE: u8 = 3;

/// Cognitive triangulation pipeline for source-code knowledge graphs
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a full analysis sweep over a source tree
    Start {
        /// Target directory (overrides TARGET_DIRECTORY)
        target_dir: PathBuf,
    },
    /// Request cancellation of a running pipeline
    Stop {
        /// Run id printed by `start`
        pipeline_id: Uuid,
    },
    /// Show the status record of a pipeline run
    Status {
        /// Run id printed by `start`
        pipeline_id: Uuid,
    },
    /// Purge the relational, broker, and graph stores
    Clear,
    /// Probe connectivity to every external collaborator
    TestConnections,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("ctg_pipeline={},ctg_common={}", log_level, log_level).into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Configuration problems are fatal before any connection is opened
    let mut config = match AppConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            error!("Configuration error: {}", err);
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    match cli.command {
        Command::Start { target_dir } => {
            config.target_directory = target_dir;
            start(config).await
        }
        Command::Stop { pipeline_id } => stop(config, pipeline_id).await,
        Command::Status { pipeline_id } => status(config, pipeline_id).await,
        Command::Clear => clear(config).await,
        Command::TestConnections => test_connections(config).await,
    }
}

async fn connect_all(
    config: &AppConfig,
) -> Result<(sqlx::SqlitePool, Arc<Broker>, Arc<Neo4jGraph>), ExitCode> {
    let db = match ctg_common::db::init_database(&config.sqlite_db_path).await {
        Ok(db) => db,
        Err(err) => {
            error!("Relational store unavailable: {}", err);
            return Err(ExitCode::from(EXIT_CONNECTION));
        }
    };
    let broker = match Broker::connect(&config.redis, visibility_timeout_ms()).await {
        Ok(broker) => Arc::new(broker),
        Err(err) => {
            error!("Broker unavailable: {}", err);
            return Err(ExitCode::from(EXIT_CONNECTION));
        }
    };
    let graph = match Neo4jGraph::connect(&config.neo4j).await {
        Ok(graph) => Arc::new(graph),
        Err(err) => {
            error!("Graph store unavailable: {}", err);
            return Err(ExitCode::from(EXIT_CONNECTION));
        }
    };
    Ok((db, broker, graph))
}

async fn start(config: AppConfig) -> ExitCode {
    if !config.target_directory.is_dir() {
        error!(
            "Target directory {} does not exist",
            config.target_directory.display()
        );
        return ExitCode::from(EXIT_CONFIG);
    }

    let (db, broker, graph) = match connect_all(&config).await {
        Ok(connections) => connections,
        Err(code) => return code,
    };

    let oracle = match AnthropicOracle::new(
        config.anthropic_api_key.clone(),
        config.oracle_max_concurrent,
        config.oracle_timeout_ms,
        config.max_job_attempts,
    ) {
        Ok(oracle) => Arc::new(oracle),
        Err(err) => {
            error!("Oracle client init failed: {}", err);
            return ExitCode::from(EXIT_CONNECTION);
        }
    };

    let deps = PipelineDeps {
        config,
        db,
        broker,
        oracle,
        graph,
        event_bus: EventBus::new(1000),
    };
    let registry = PipelineRegistry::spawn();
    let run_id = Uuid::new_v4();
    info!("Pipeline run {} starting", run_id);
    println!("{}", run_id);

    match run_pipeline(&deps, &registry, run_id).await {
        Ok(status) => {
            info!("Run {} finished: {}", run_id, status.as_str());
            match status {
                RunStatus::Completed | RunStatus::CompletedWithFailures => ExitCode::SUCCESS,
                RunStatus::Cancelled => ExitCode::SUCCESS,
                _ => ExitCode::from(EXIT_PIPELINE),
            }
        }
        Err(err) => {
            error!("Run {} failed: {}", run_id, err);
            ExitCode::from(EXIT_PIPELINE)
        }
    }
}

async fn stop(config: AppConfig, pipeline_id: Uuid) -> ExitCode {
    let db = match ctg_common::db::init_database(&config.sqlite_db_path).await {
        Ok(db) => db,
        Err(err) => {
            error!("Relational store unavailable: {}", err);
            return ExitCode::from(EXIT_CONNECTION);
        }
    };

    match runs::request_stop(&db, pipeline_id).await {
        Ok(true) => {
            println!("Stop requested for {}", pipeline_id);
            ExitCode::SUCCESS
        }
        Ok(false) => {
            error!("Run {} is not running", pipeline_id);
            ExitCode::from(EXIT_PIPELINE)
        }
        Err(err) => {
            error!("Stop failed: {}", err);
            ExitCode::from(EXIT_PIPELINE)
        }
    }
}

async fn status(config: AppConfig, pipeline_id: Uuid) -> ExitCode {
    let db = match ctg_common::db::init_database(&config.sqlite_db_path).await {
        Ok(db) => db,
        Err(err) => {
            error!("Relational store unavailable: {}", err);
            return ExitCode::from(EXIT_CONNECTION);
        }
    };

    let run = match runs::get_run(&db, pipeline_id).await {
        Ok(Some(run)) => run,
        Ok(None) => {
            error!("Run {} not found", pipeline_id);
            return ExitCode::from(EXIT_PIPELINE);
        }
        Err(err) => {
            error!("Status lookup failed: {}", err);
            return ExitCode::from(EXIT_PIPELINE);
        }
    };

    println!("run:        {}", run.run_id);
    println!("target:     {}", run.target_directory);
    println!("phase:      {}", run.phase);
    println!("status:     {}", run.status.as_str());
    if let Some(error) = &run.error {
        println!("error:      {}", error);
    }
    println!("started:    {}", run.started_at.to_rfc3339());
    if let Some(finished) = run.finished_at {
        println!("finished:   {}", finished.to_rfc3339());
    }
    let metrics = &run.metrics;
    println!(
        "files:      {} discovered, {} analyzed, {} failed",
        metrics.files_discovered, metrics.files_analyzed, metrics.files_failed
    );
    println!("pois:       {}", metrics.pois_extracted);
    println!("evidence:   {}", metrics.evidence_rows);
    println!("accepted:   {}", metrics.relationships_accepted);
    println!("dead-letter:{}", metrics.dead_letter_jobs);
    if let Ok(summaries) = pipeline::summary_count(&db).await {
        println!("summaries:  {}", summaries);
    }

    ExitCode::SUCCESS
}

async fn clear(config: AppConfig) -> ExitCode {
    let (db, broker, graph) = match connect_all(&config).await {
        Ok(connections) => connections,
        Err(code) => return code,
    };

    if let Err(err) = clear_run_state(&db).await {
        error!("Failed to clear relational store: {}", err);
        return ExitCode::from(EXIT_PIPELINE);
    }
    if let Err(err) = broker.purge().await {
        error!("Failed to purge broker queues: {}", err);
        return ExitCode::from(EXIT_PIPELINE);
    }
    if let Err(err) = graph.clear().await {
        error!("Failed to clear graph store: {}", err);
        return ExitCode::from(EXIT_PIPELINE);
    }

    println!("All stores cleared");
    ExitCode::SUCCESS
}

async fn test_connections(config: AppConfig) -> ExitCode {
    let mut healthy = true;

    match ctg_common::db::init_database(&config.sqlite_db_path).await {
        Ok(_) => println!("relational store: ok ({})", config.sqlite_db_path.display()),
        Err(err) => {
            healthy = false;
            println!("relational store: FAILED ({})", err);
        }
    }

    match Broker::connect(&config.redis, visibility_timeout_ms()).await {
        Ok(broker) => match broker.ping().await {
            Ok(()) => println!("broker:           ok ({})", config.redis.url),
            Err(err) => {
                healthy = false;
                println!("broker:           FAILED ({})", err);
            }
        },
        Err(err) => {
            healthy = false;
            println!("broker:           FAILED ({})", err);
        }
    }

    match Neo4jGraph::connect(&config.neo4j).await {
        Ok(graph) => match graph.node_count().await {
            Ok(count) => println!("graph store:      ok ({} nodes)", count),
            Err(err) => {
                healthy = false;
                println!("graph store:      FAILED ({})", err);
            }
        },
        Err(err) => {
            healthy = false;
            println!("graph store:      FAILED ({})", err);
        }
    }

    if healthy {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(EXIT_CONNECTION)
    }
}
