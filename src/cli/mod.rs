//! CLI argument parsing and command dispatch

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use stampede_core::error::Error;
use stampede_core::orchestrator::OrchestratorBuilder;
use stampede_core::outcome::EXIT_INVALID_PLAN;
use stampede_core::plan::{self, PlanConfig};
use stampede_core::settings::RunSettings;
use stampede_core::traits::{BlobStore, ContainerProvider};
use stampede_providers::{AzureBlobStore, AzureContainerProvider, AzureSettings, FakeProvider, WorkerScript};
use stampede_storage::MemoryBlobStore;

#[derive(Parser)]
#[command(name = "stampede")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Execute a load-test plan against the configured provider
    Run {
        /// Path to the plan file (JSON)
        #[arg(short, long)]
        plan: PathBuf,
        /// Run against the in-process fake provider instead of Azure
        #[arg(long)]
        dry_run: bool,
    },
    /// Validate a plan file without running it
    Validate {
        /// Path to the plan file (JSON)
        #[arg(short, long)]
        plan: PathBuf,
    },
}

impl Cli {
    /// Dispatch the selected command; returns the process exit code
    pub async fn execute(self) -> Result<i32> {
        match self.command {
            Commands::Run { plan, dry_run } => run(&plan, dry_run).await,
            Commands::Validate { plan } => validate(&plan),
        }
    }
}

fn load_plan(path: &Path) -> Result<PlanConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read plan file {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse plan file {}", path.display()))
}

fn validate(path: &Path) -> Result<i32> {
    let config = load_plan(path)?;
    match plan::compile(&config) {
        Ok(plan) => {
            tracing::info!(
                run_id = %plan.run_id,
                total_vus = plan.total_vus,
                duration = %plan.duration_label,
                "plan is valid"
            );
            Ok(0)
        }
        Err(e) => {
            tracing::error!(error = %e, "plan is invalid");
            Ok(EXIT_INVALID_PLAN)
        }
    }
}

async fn run(path: &Path, dry_run: bool) -> Result<i32> {
    let config = load_plan(path)?;

    let (provider, blobs): (Arc<dyn ContainerProvider>, Arc<dyn BlobStore>) = if dry_run {
        let blobs: Arc<dyn BlobStore> = Arc::new(MemoryBlobStore::new());
        let samples = (0..200)
            .map(|i| ("http_req_duration".to_string(), 50.0 + (i % 100) as f64 * 3.0))
            .collect();
        let provider = FakeProvider::new(Arc::clone(&blobs))
            .with_default_script(WorkerScript::succeeding(samples));
        (Arc::new(provider), blobs)
    } else {
        let settings =
            AzureSettings::from_env().context("Azure environment is not configured")?;
        let provider =
            AzureContainerProvider::new(settings).context("failed to build Azure provider")?;
        let blobs = AzureBlobStore::from_env().context("Azure storage is not configured")?;
        (Arc::new(provider), Arc::new(blobs))
    };

    let (orchestrator, mut events_rx) = OrchestratorBuilder::new()
        .provider(provider)
        .blobs(blobs)
        .settings(RunSettings::default())
        .build()?;

    // Surface terminal worker states as they arrive.
    let events_task = tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            tracing::info!(
                worker_index = event.worker_index,
                state = %event.state,
                exit_code = event.exit_code,
                "worker terminal"
            );
        }
    });

    let outcome = match orchestrator.run_with_signal(&config).await {
        Ok(outcome) => outcome,
        Err(e @ Error::InvalidPlan { .. }) | Err(e @ Error::InvalidDistribution(_)) => {
            tracing::error!(error = %e, "plan rejected");
            return Ok(EXIT_INVALID_PLAN);
        }
        Err(e) => return Err(e.into()),
    };
    events_task.abort();

    tracing::info!(
        run_id = %outcome.run_id,
        status = ?outcome.status,
        grade = ?outcome.report.grade,
        score = outcome.report.score,
        findings = outcome.report.findings.len(),
        exit_code = outcome.exit_code(),
        "run complete"
    );
    if let Some(location) = &outcome.canonical_summary_location {
        tracing::info!(blob = %location, "canonical summary uploaded");
    }

    Ok(outcome.exit_code())
}
