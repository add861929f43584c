use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use latticework_config::{ExecutorConfig, ExecutorOverrides, Settings};
use latticework_dispatcher::{Dispatcher, Planner, RoundRobinPolicy, RunStatus};
use latticework_executor::{
  ClusterExecutor, ConnectionPool, ExecutorRegistry, LocalExecutor, LoopbackConnector,
};
use latticework_graph::Inputs;

mod demo;

/// Latticework - run workflow graphs across compute backends
#[derive(Parser)]
#[command(name = "latticework")]
#[command(version, about, long_about = None)]
struct Cli {
  /// Path to the settings file (default: $LATTICEWORK_CONFIG or the user config dir)
  #[arg(long, global = true)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
  /// Print the resolved configuration of an executor
  Config {
    /// Executor type tag
    #[arg(long, default_value = LocalExecutor::SHORT_NAME)]
    executor: String,
  },

  /// Print the transport graph of the demo lattice
  Graph {
    #[arg(long, default_value_t = 2)]
    x: i64,

    #[arg(long, default_value_t = 1)]
    rounds: usize,

    /// Only print lattice metadata and node names
    #[arg(long)]
    metadata_only: bool,
  },

  /// Dispatch the demo lattice and print the result
  Demo {
    #[arg(long, default_value_t = 2)]
    x: i64,

    #[arg(long, default_value_t = 1)]
    rounds: usize,

    /// Executor the demo electrons request
    #[arg(long, default_value = LocalExecutor::SHORT_NAME)]
    executor: String,

    /// Scheduler address for the cluster executor
    #[arg(long)]
    scheduler_address: Option<String>,

    /// Spread tasks over every registered executor
    #[arg(long)]
    schedule: bool,
  },
}

fn main() -> Result<()> {
  let cli = Cli::parse();

  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
    .with_writer(std::io::stderr)
    .init();

  let settings = match &cli.config {
    Some(path) => Settings::load(path),
    None => Settings::load_default(),
  }
  .context("failed to load settings")?;

  match cli.command {
    Some(Commands::Config { executor }) => {
      let config = ExecutorConfig::resolve(&executor, ExecutorOverrides::default(), &settings)?;
      println!("{}", serde_json::to_string_pretty(&config)?);
    }
    Some(Commands::Graph {
      x,
      rounds,
      metadata_only,
    }) => {
      let invocation = demo::chain(rounds, LocalExecutor::SHORT_NAME)
        .build_graph(Inputs::new().with_kwarg("x", serde_json::json!(x)))?;
      println!(
        "{}",
        serde_json::to_string_pretty(&invocation.graph.to_json(metadata_only)?)?
      );
    }
    Some(Commands::Demo {
      x,
      rounds,
      executor,
      scheduler_address,
      schedule,
    }) => {
      let rt = tokio::runtime::Runtime::new()?;
      let status = rt.block_on(run_demo(
        settings,
        x,
        rounds,
        executor,
        scheduler_address,
        schedule,
      ))?;
      if status != RunStatus::Completed {
        std::process::exit(1);
      }
    }
    None => {
      println!("latticework - use --help to see available commands");
    }
  }

  Ok(())
}

async fn run_demo(
  settings: Settings,
  x: i64,
  rounds: usize,
  executor: String,
  scheduler_address: Option<String>,
  schedule: bool,
) -> Result<RunStatus> {
  let mut registry = ExecutorRegistry::new();
  registry.register(Arc::new(LocalExecutor::from_settings(
    ExecutorOverrides::default(),
    &settings,
  )?));

  // The cluster executor is optional unless the demo asks for it.
  let cluster = ClusterExecutor::from_settings(
    scheduler_address,
    ExecutorOverrides::default(),
    &settings,
    Arc::new(LoopbackConnector::new()),
    Arc::new(ConnectionPool::new()),
  );
  match cluster {
    Ok(cluster) => registry.register(Arc::new(cluster)),
    Err(e) if executor == ClusterExecutor::SHORT_NAME => {
      return Err(e).context("cluster executor is not configured");
    }
    Err(e) => tracing::debug!(error = %e, "cluster executor not registered"),
  }

  let mut dispatcher = Dispatcher::new(registry);
  if schedule {
    let pool: Vec<String> = dispatcher
      .registry()
      .names()
      .into_iter()
      .map(str::to_string)
      .collect();
    dispatcher = dispatcher.with_planner(Planner::with_policy(Arc::new(RoundRobinPolicy::new(pool))));
  }

  let cancel = CancellationToken::new();
  let on_signal = cancel.clone();
  tokio::spawn(async move {
    if tokio::signal::ctrl_c().await.is_ok() {
      eprintln!("Cancelling...");
      on_signal.cancel();
    }
  });

  let lattice = demo::chain(rounds, &executor).with_schedule(schedule);
  let result = dispatcher
    .dispatch(
      &lattice,
      Inputs::new().with_kwarg("x", serde_json::json!(x)),
      cancel,
    )
    .await
    .context("dispatch failed")?;

  eprintln!("Dispatch {}: {:?}", result.dispatch_id, result.status);
  println!("{}", serde_json::to_string_pretty(&result)?);

  Ok(result.status)
}
