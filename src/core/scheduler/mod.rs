//! Fans montages out over a bounded pool of workers and gathers every result.
//!
//! Each montage is one tokio task holding a semaphore permit for its whole
//! run, so at most `max_workers` solver processes exist at any time. Tasks
//! own their `PipelineRun` and hand it back on join; the scheduler never
//! aborts a sibling when one fails.

use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{Instrument, error, info, info_span, warn};

use crate::core::config::SimulationConfig;
use crate::core::envelope::EnvelopeCalculator;
use crate::core::error::{TiError, TiResult};
use crate::core::gateway::{SolverGateway, VisualizationService};
use crate::core::montage::{
    CatalogLoad, CatalogOverlay, CatalogView, MontageCatalog, MontageModel, RejectedMontage,
};
use crate::core::pipeline::{PipelineRun, PipelineRunner, panic_message};
use crate::core::report::{CompletionReport, Session};
use crate::logging::montage_log_path;

/// Directory names under the simulations root that belong to the batch.
const RESERVED_NAMES: [&str; 2] = ["logs", "reports"];

/// Worker count for a batch. `0` means half of the logical cores. Never more
/// workers than montages, never fewer than one when there is work.
pub fn resolve_workers(requested: usize, montages: usize) -> usize {
    if montages == 0 {
        return 0;
    }
    let budget = if requested == 0 {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(2);
        (cores / 2).max(1)
    } else {
        requested
    };
    budget.min(montages)
}

pub struct ParallelScheduler {
    solver: Arc<dyn SolverGateway>,
    visualizer: Arc<dyn VisualizationService>,
    catalog: Arc<MontageCatalog>,
    calculator: EnvelopeCalculator,
}

impl ParallelScheduler {
    pub fn new(solver: Arc<dyn SolverGateway>, visualizer: Arc<dyn VisualizationService>) -> Self {
        Self {
            solver,
            visualizer,
            catalog: Arc::new(MontageCatalog::new()),
            calculator: EnvelopeCalculator::default(),
        }
    }

    /// Base catalog the visualizer resolves names against.
    pub fn with_catalog(mut self, catalog: Arc<MontageCatalog>) -> Self {
        self.catalog = catalog;
        self
    }

    pub fn with_calculator(mut self, calculator: EnvelopeCalculator) -> Self {
        self.calculator = calculator;
        self
    }

    pub async fn run(
        &self,
        montages: Vec<MontageModel>,
        config: Arc<SimulationConfig>,
        max_workers: usize,
    ) -> TiResult<CompletionReport> {
        self.run_batch(montages, Vec::new(), config, max_workers).await
    }

    /// Like [`run`](Self::run), carrying catalog rejections into the report.
    pub async fn run_load(
        &self,
        load: CatalogLoad,
        config: Arc<SimulationConfig>,
        max_workers: usize,
    ) -> TiResult<CompletionReport> {
        self.run_batch(load.montages, load.rejected, config, max_workers)
            .await
    }

    async fn run_batch(
        &self,
        montages: Vec<MontageModel>,
        mut rejected: Vec<RejectedMontage>,
        config: Arc<SimulationConfig>,
        max_workers: usize,
    ) -> TiResult<CompletionReport> {
        let session = Session::start();
        let logs_dir = config.logs_dir();
        for dir in [config.simulations_dir(), logs_dir.clone()] {
            tokio::fs::create_dir_all(&dir)
                .await
                .map_err(|e| TiError::io(&dir, e))?;
        }

        // Two workers must never share a montage directory, and no montage
        // may take over the batch's own directories.
        let mut seen = HashSet::new();
        let mut unique = Vec::with_capacity(montages.len());
        for montage in montages {
            let reason = if RESERVED_NAMES.contains(&montage.name()) {
                Some("name is reserved for batch output")
            } else if !seen.insert(montage.name().to_string()) {
                Some("scheduled more than once")
            } else {
                None
            };
            match reason {
                None => unique.push(montage),
                Some(reason) => {
                    warn!("Dropping montage {}: {}", montage.name(), reason);
                    rejected.push(RejectedMontage {
                        name: montage.name().to_string(),
                        error: TiError::config(montage.name(), reason),
                    });
                }
            }
        }
        let montages = unique;

        let workers = resolve_workers(max_workers, montages.len());
        if !montages.is_empty() && workers == 0 {
            return Err(TiError::config("batch", "no worker available"));
        }
        info!(
            "Session {}: {} montage(s), {} worker(s), {} rejected",
            session.id,
            montages.len(),
            workers,
            rejected.len()
        );

        // Lives for this batch only; dropped with the runner once every
        // worker has joined.
        let overlay = CatalogOverlay::for_montages(&montages);
        if !overlay.is_empty() {
            info!("Catalog overlay holds {} coordinate montage(s)", overlay.len());
        }
        let view = CatalogView::new(self.catalog.clone(), overlay);
        let runner = PipelineRunner::new(
            config.clone(),
            self.solver.clone(),
            self.visualizer.clone(),
            view,
        )
        .with_calculator(self.calculator.clone());

        let runs = if montages.len() == 1 {
            let montage = &montages[0];
            let span = info_span!("montage", montage = %montage.name());
            let joined = AssertUnwindSafe(runner.run(montage).instrument(span.clone()))
                .catch_unwind()
                .await;
            let mut run = match joined {
                Ok(run) => run,
                Err(panic) => {
                    let detail = format!("worker panicked: {}", panic_message(panic.as_ref()));
                    span.in_scope(|| error!("Worker for {} did not finish: {}", montage.name(), detail));
                    let mut run = PipelineRun::new(montage.name(), montage.simulation_mode());
                    run.abandon(detail);
                    run
                }
            };
            run.log_path = Some(montage_log_path(&logs_dir, montage.name()));
            vec![run]
        } else {
            self.fan_out(&runner, &montages, workers, &logs_dir).await
        };

        let report = CompletionReport::build(&session, &config.subject_id, runs, &rejected);
        info!("{}", report.summary_line());
        Ok(report)
    }

    async fn fan_out(
        &self,
        runner: &PipelineRunner,
        montages: &[MontageModel],
        workers: usize,
        logs_dir: &std::path::Path,
    ) -> Vec<PipelineRun> {
        let permits = Arc::new(Semaphore::new(workers));
        let mut set = JoinSet::new();
        let mut slots: HashMap<tokio::task::Id, usize> = HashMap::new();

        for (slot, montage) in montages.iter().enumerate() {
            let runner = runner.clone();
            let montage = montage.clone();
            let permits = permits.clone();
            let span = info_span!("montage", montage = %montage.name());
            let handle = set.spawn(
                async move {
                    let Ok(_permit) = permits.acquire_owned().await else {
                        let mut run = PipelineRun::new(montage.name(), montage.simulation_mode());
                        run.abandon("worker pool closed");
                        return run;
                    };
                    info!("Worker started");
                    runner.run(&montage).await
                }
                .instrument(span),
            );
            slots.insert(handle.id(), slot);
        }

        let mut results: Vec<Option<PipelineRun>> = vec![None; montages.len()];
        while let Some(joined) = set.join_next_with_id().await {
            match joined {
                Ok((id, run)) => {
                    if let Some(&slot) = slots.get(&id) {
                        results[slot] = Some(run);
                    }
                }
                // Stage panics are caught by the runner; this is a panic
                // outside any stage, so no stage records survive it.
                Err(err) => {
                    let Some(&slot) = slots.get(&err.id()) else {
                        continue;
                    };
                    let montage = &montages[slot];
                    let detail = if err.is_panic() {
                        format!("worker panicked: {}", panic_message(err.into_panic().as_ref()))
                    } else {
                        "worker cancelled".to_string()
                    };
                    error!("Worker for {} did not finish: {}", montage.name(), detail);
                    let mut run = PipelineRun::new(montage.name(), montage.simulation_mode());
                    run.abandon(detail);
                    results[slot] = Some(run);
                }
            }
        }

        results
            .into_iter()
            .zip(montages)
            .map(|(run, montage)| {
                let mut run = run.unwrap_or_else(|| {
                    let mut lost = PipelineRun::new(montage.name(), montage.simulation_mode());
                    lost.abandon("worker result lost");
                    lost
                });
                run.log_path = Some(montage_log_path(logs_dir, montage.name()));
                run
            })
            .collect()
    }
}
