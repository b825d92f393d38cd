//! Orchestrator execution logic

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::aggregator::{CanonicalSummary, ResultAggregator};
use crate::analyzer::{AnalyzerContext, MetricsAnalyzer};
use crate::distribute::distribute;
use crate::error::Result;
use crate::manager::{ContainerManager, WorkerEvent, WorkerState};
use crate::outcome::{OrchestratorError, RunOutcome, RunStatus};
use crate::plan::{self, PlanConfig, RunPlan};
use crate::settings::RunSettings;
use crate::traits::{BlobStore, ContainerProvider};

/// Top-level controller for one or more runs
///
/// Wires the plan compiler, workload distributor, container manager,
/// result aggregator, and metrics analyzer together, owns the run's
/// cancellation token, and exposes the single `run` entry point.
pub struct Orchestrator {
    provider: Arc<dyn ContainerProvider>,
    blobs: Arc<dyn BlobStore>,
    settings: RunSettings,
    events_tx: mpsc::Sender<WorkerEvent>,
    cancel: CancellationToken,
}

impl Orchestrator {
    /// Create a new orchestrator
    ///
    /// Use `OrchestratorBuilder` for a more ergonomic construction.
    pub(crate) fn new(
        provider: Arc<dyn ContainerProvider>,
        blobs: Arc<dyn BlobStore>,
        settings: RunSettings,
        events_tx: mpsc::Sender<WorkerEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            provider,
            blobs,
            settings,
            events_tx,
            cancel,
        }
    }

    /// Token that cancels the current run when tripped
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Trip cancellation; the first cancellation wins and is one-way
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Compile and execute one full run
    ///
    /// # Errors
    ///
    /// Only plan validation and distribution failures surface as `Err`;
    /// once a run exists, every condition (worker failures, cancellation,
    /// infrastructure trouble) is reported inside the returned outcome.
    pub async fn run(&self, config: &PlanConfig) -> Result<RunOutcome> {
        let plan = plan::compile(config)?;
        self.run_plan(plan).await
    }

    /// Execute an already-compiled plan
    pub async fn run_plan(&self, plan: RunPlan) -> Result<RunOutcome> {
        let assignments = distribute(plan.total_vus, plan.per_worker_vus)?;
        let hard_deadline = self.settings.hard_deadline(plan.duration);
        tracing::info!(
            run_id = %plan.run_id,
            target = %plan.target_url,
            kind = %plan.test_kind,
            workers = assignments.len(),
            total_vus = plan.total_vus,
            hard_deadline_s = hard_deadline.as_secs(),
            "starting run"
        );

        let manager = ContainerManager::new(
            Arc::clone(&self.provider),
            Arc::clone(&self.blobs),
            self.settings.clone(),
            self.events_tx.clone(),
        );

        // The child token lets the hard deadline stop the fleet without
        // tripping the caller-visible token.
        let run_cancel = self.cancel.child_token();
        let mut deadline_exceeded = false;
        let handles = {
            let managed = manager.run(&plan, &assignments, run_cancel.clone());
            tokio::pin!(managed);
            tokio::select! {
                handles = &mut managed => handles,
                _ = tokio::time::sleep(hard_deadline) => {
                    deadline_exceeded = true;
                    tracing::error!(run_id = %plan.run_id, "hard deadline reached, stopping the fleet");
                    run_cancel.cancel();
                    managed.await
                }
            }
        };
        let cancelled = self.cancel.is_cancelled();

        let aggregator = ResultAggregator::new(Arc::clone(&self.blobs), &self.settings);
        let mut orchestrator_error = None;
        let summary = match aggregator.aggregate(&plan, &handles).await {
            Ok(summary) => summary,
            Err(e) => {
                tracing::error!(run_id = %plan.run_id, error = %e, "aggregation failed");
                orchestrator_error = Some(OrchestratorError::AggregatorFailed {
                    detail: e.to_string(),
                });
                CanonicalSummary::empty(&plan.run_id, &handles)
            }
        };

        let ctx = AnalyzerContext {
            test_kind: plan.test_kind,
            target_url: plan.target_url.clone(),
            duration_s: plan.duration.as_secs_f64(),
            total_vus: plan.total_vus,
            cancelled,
            deadline_exceeded,
        };
        let report = MetricsAnalyzer::analyze(&summary, &ctx);

        let mut summary_location = None;
        if orchestrator_error.is_none() {
            match aggregator.upload(&plan, &summary).await {
                Ok(location) => summary_location = Some(location),
                Err(e) => {
                    tracing::warn!(run_id = %plan.run_id, error = %e, "failed to upload aggregated summary");
                    orchestrator_error = Some(OrchestratorError::BlobUnavailable {
                        detail: e.to_string(),
                    });
                }
            }
            if let Err(e) = self.upload_report(&plan, &report).await {
                tracing::warn!(run_id = %plan.run_id, error = %e, "failed to upload performance report");
                orchestrator_error.get_or_insert(OrchestratorError::BlobUnavailable {
                    detail: e.to_string(),
                });
            }
        }

        let status = if cancelled || deadline_exceeded {
            RunStatus::Cancelled
        } else {
            let successful = handles
                .iter()
                .filter(|h| h.state == WorkerState::Succeeded)
                .count();
            if successful == handles.len() {
                RunStatus::Ok
            } else if successful > 0 {
                RunStatus::Degraded
            } else {
                RunStatus::Failed
            }
        };

        tracing::info!(
            run_id = %plan.run_id,
            status = ?status,
            grade = ?report.grade,
            score = report.score,
            samples = report.summary.total_samples(),
            "run finished"
        );

        Ok(RunOutcome {
            run_id: plan.run_id,
            status,
            workers: handles,
            canonical_summary_location: summary_location,
            report,
            orchestrator_error,
        })
    }

    /// Compile and execute a run, cancelling on Ctrl+C
    pub async fn run_with_signal(&self, config: &PlanConfig) -> Result<RunOutcome> {
        let cancel = self.cancel.clone();
        let signal_handle = tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    tracing::info!("received Ctrl+C, cancelling run");
                    cancel.cancel();
                }
                Err(e) => {
                    tracing::error!(error = %e, "failed to listen for Ctrl+C");
                }
            }
        });

        let result = self.run(config).await;
        signal_handle.abort();
        result
    }

    async fn upload_report(
        &self,
        plan: &RunPlan,
        report: &crate::analyzer::PerformanceReport,
    ) -> Result<()> {
        let name = format!("{}/performance_report.json", plan.run_id);
        let bytes = serde_json::to_vec_pretty(report)
            .map_err(|e| crate::error::Error::Config(format!("report encoding failed: {e}")))?;
        self.blobs.put(&plan.blob_namespace, &name, &bytes).await?;
        Ok(())
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("provider", &self.provider.name())
            .field("settings", &self.settings)
            .finish()
    }
}
