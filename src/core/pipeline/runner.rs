use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use tracing::{debug, error, info, warn};

use super::{PipelineRun, Stage, panic_message};
use crate::core::artifacts::{
    ArtifactLayout, ArtifactManifest, ArtifactVerifier, FieldArtifact, MANIFEST_FILE,
    TargetSpace, VerificationReport, write_json_atomic,
};
use crate::core::config::SimulationConfig;
use crate::core::envelope::{EnvelopeCalculator, EnvelopeResult, FieldSampleSet};
use crate::core::error::{TiError, TiResult};
use crate::core::gateway::{SolveRequest, SolverGateway, VisualizationService};
use crate::core::montage::{CatalogView, MontageModel, SimulationMode};

/// Values handed from one stage to the next within a single run.
struct StageState {
    layout: ArtifactLayout,
    manifest: Option<ArtifactManifest>,
    currents: Vec<f64>,
    fields: Vec<FieldSampleSet>,
    envelope: Option<EnvelopeResult>,
    verification: Option<VerificationReport>,
}

/// Drives one montage through every stage. Cheap to clone; the scheduler
/// hands a clone to each worker.
#[derive(Clone)]
pub struct PipelineRunner {
    config: Arc<SimulationConfig>,
    solver: Arc<dyn SolverGateway>,
    visualizer: Arc<dyn VisualizationService>,
    calculator: EnvelopeCalculator,
    view: CatalogView,
    verifier: ArtifactVerifier,
}

impl PipelineRunner {
    pub fn new(
        config: Arc<SimulationConfig>,
        solver: Arc<dyn SolverGateway>,
        visualizer: Arc<dyn VisualizationService>,
        view: CatalogView,
    ) -> Self {
        Self {
            config,
            solver,
            visualizer,
            calculator: EnvelopeCalculator::default(),
            view,
            verifier: ArtifactVerifier,
        }
    }

    pub fn with_calculator(mut self, calculator: EnvelopeCalculator) -> Self {
        self.calculator = calculator;
        self
    }

    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    /// Runs `montage` to a finished [`PipelineRun`], honouring the configured
    /// whole-montage timeout.
    pub async fn run(&self, montage: &MontageModel) -> PipelineRun {
        let mut run = PipelineRun::new(montage.name(), montage.simulation_mode());
        let limit = self.config.montage_timeout_secs;
        match limit {
            Some(seconds) => {
                let timed = tokio::time::timeout(
                    Duration::from_secs(seconds),
                    self.execute(montage, &mut run),
                )
                .await;
                if timed.is_err() {
                    let err = TiError::Timeout { seconds };
                    error!(
                        stage = run.position.as_str(),
                        "Montage {} {}",
                        montage.name(),
                        err
                    );
                    run.fail_current(&err);
                }
            }
            None => self.execute(montage, &mut run).await,
        }
        run
    }

    /// Executes the stages in order against `run`, stopping at the first
    /// failure. Leaves `run` finished.
    pub async fn execute(&self, montage: &MontageModel, run: &mut PipelineRun) {
        let layout = ArtifactLayout::new(
            self.config.montage_dir(montage.name()),
            montage.name(),
            montage.simulation_mode(),
        );
        let mut state = StageState {
            layout,
            manifest: None,
            currents: Vec::new(),
            fields: Vec::new(),
            envelope: None,
            verification: None,
        };

        for stage in Stage::PIPELINE {
            if !run.begin(stage) {
                warn!("Stage {} refused for {}", stage.as_str(), montage.name());
                break;
            }
            info!(stage = stage.as_str(), "Stage started");
            let work = async {
                match stage {
                    Stage::Setup => self.setup(montage, &mut state).await,
                    Stage::Visualize => self.visualize(montage, &state).await,
                    Stage::Solve => self.solve(montage, &mut state).await,
                    Stage::ComputeEnvelope => self.compute_envelope(montage, &mut state).await,
                    Stage::ExtractTissue => self.extract_tissue(montage, &state).await,
                    Stage::Transform => self.transform(&state).await,
                    Stage::Verify => self.verify(&mut state).await,
                    Stage::Queued | Stage::Done => Ok(None),
                }
            };
            // A panicking collaborator fails this stage only; the records of
            // the stages before it are kept.
            let result = AssertUnwindSafe(work).catch_unwind().await;
            // Keep whatever the stages produced, even on failure.
            run.manifest = state.manifest.clone();
            run.verification = state.verification.clone();
            let result = match result {
                Ok(result) => result,
                Err(panic) => {
                    let detail = format!(
                        "{} stage panicked: {}",
                        stage.as_str(),
                        panic_message(panic.as_ref())
                    );
                    error!(stage = stage.as_str(), kind = "worker", "{}", detail);
                    run.abandon(detail);
                    break;
                }
            };
            match result {
                Ok(detail) => {
                    info!(
                        stage = stage.as_str(),
                        "Stage succeeded{}",
                        detail.as_deref().map(|d| format!(": {}", d)).unwrap_or_default()
                    );
                    run.succeed(stage, detail);
                }
                Err(err) => {
                    error!(stage = stage.as_str(), kind = err.kind(), "Stage failed: {}", err);
                    run.fail(stage, &err);
                    break;
                }
            }
        }
        run.complete();
    }

    async fn setup(&self, montage: &MontageModel, state: &mut StageState) -> TiResult<Option<String>> {
        // Bad intensities must surface before any collaborator is called.
        state.currents = self
            .config
            .intensity
            .currents_for(montage.simulation_mode())
            .map_err(|e| match e {
                TiError::Configuration { reason, .. } => TiError::config(montage.name(), reason),
                other => other,
            })?;

        let layout = &state.layout;
        for dir in layout.directories() {
            let path = layout.resolve(&dir);
            tokio::fs::create_dir_all(&path)
                .await
                .map_err(|e| TiError::io(&path, e))?;
        }

        let manifest = ArtifactManifest::derive(layout, &self.config.mapping, &self.config.tissues);
        // A re-run must not pass verification on files left by an earlier run.
        let mut stale = 0;
        for entry in &manifest.entries {
            let path = layout.resolve(&entry.path);
            match tokio::fs::remove_file(&path).await {
                Ok(()) => stale += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(TiError::io(&path, e)),
            }
        }
        if stale > 0 {
            debug!("Removed {} stale artifacts from a previous run", stale);
        }
        manifest.persist(&layout.resolve(MANIFEST_FILE)).await?;

        let detail = format!(
            "{} entries in manifest ({} required)",
            manifest.entries.len(),
            manifest.required().count()
        );
        state.manifest = Some(manifest);
        Ok(Some(detail))
    }

    async fn visualize(&self, montage: &MontageModel, state: &StageState) -> TiResult<Option<String>> {
        if montage.is_coordinate_based() {
            return Ok(Some("skipped for coordinate montage".to_string()));
        }
        let output = state.layout.resolve(&state.layout.visualization());
        let rendered = self.visualizer.render(montage, &self.view, &output).await?;
        Ok(Some(match rendered {
            Some(path) => format!("rendered {}", path.display()),
            None => "no renderer configured".to_string(),
        }))
    }

    async fn solve(&self, montage: &MontageModel, state: &mut StageState) -> TiResult<Option<String>> {
        let mut fields = Vec::with_capacity(state.currents.len());
        // One pair at a time: the solver is the heavy resource.
        for (slot, current) in state.currents.iter().enumerate() {
            let pair_index = slot + 1;
            let output = state.layout.resolve(&state.layout.high_frequency(pair_index));
            let request = SolveRequest::new(montage, pair_index, *current, &self.config, output)
                .ok_or_else(|| {
                    TiError::config(montage.name(), format!("no electrode pair in slot {}", pair_index))
                })?;
            info!("Solving pair {} ({}) at {} mA", pair_index, request.pair, current);
            let field = self.solver.solve(&request).await?;
            field.check_shape()?;
            fields.push(field);
        }
        let samples = fields.first().map(FieldSampleSet::len).unwrap_or(0);
        state.fields = fields;
        Ok(Some(format!("{} pair fields, {} samples each", state.fields.len(), samples)))
    }

    async fn compute_envelope(
        &self,
        montage: &MontageModel,
        state: &mut StageState,
    ) -> TiResult<Option<String>> {
        let fields = std::mem::take(&mut state.fields);
        let calculator = self.calculator.clone();
        let mode = montage.simulation_mode();
        let computed = tokio::task::spawn_blocking(move || match mode {
            SimulationMode::Ti => match fields.as_slice() {
                [e1, e2] => calculator.two_field(e1, e2).map(|env| (env, None)),
                other => Err(TiError::InputMismatch(format!(
                    "TI envelope needs 2 fields, got {}",
                    other.len()
                ))),
            },
            SimulationMode::Mti => calculator
                .multipolar(&fields)
                .map(|m| (m.combined, Some((m.ab, m.cd)))),
        })
        .await
        .map_err(|e| TiError::InputMismatch(format!("envelope computation aborted: {}", e)))??;

        let (envelope, intermediates) = computed;
        let layout = &state.layout;
        let name = montage.name();
        if let Some((ab, cd)) = intermediates {
            write_field(layout, &layout.intermediate("AB"), name, "TI_AB", ab).await?;
            write_field(layout, &layout.intermediate("CD"), name, "TI_CD", cd).await?;
        }
        if let Some(normal) = &envelope.envelope_normal {
            let projected = EnvelopeResult {
                indices: envelope.indices.clone(),
                envelope_max: normal.clone(),
                envelope_normal: None,
                tags: envelope.tags.clone(),
            };
            let quantity = format!("{}_normal", mode.as_str());
            write_field(layout, &layout.normal_envelope(), name, &quantity, projected).await?;
        }
        write_field(layout, &layout.envelope(), name, mode.as_str(), envelope.clone()).await?;

        let detail = format!(
            "peak {:.4} V/m over {} samples ({})",
            envelope.peak(),
            envelope.len(),
            self.calculator.combiner_name()
        );
        state.envelope = Some(envelope);
        Ok(Some(detail))
    }

    async fn extract_tissue(&self, montage: &MontageModel, state: &StageState) -> TiResult<Option<String>> {
        let envelope = state.envelope.as_ref().ok_or_else(|| {
            TiError::InputMismatch("no envelope computed before tissue extraction".to_string())
        })?;
        let mode = montage.simulation_mode();
        let mut counts = Vec::with_capacity(self.config.tissues.len());
        for tissue in &self.config.tissues {
            let restricted = envelope.restrict(&tissue.tags)?;
            if restricted.is_empty() {
                warn!("Tissue {} has no samples (tags {:?})", tissue.name, tissue.tags);
            }
            counts.push(format!("{}={}", tissue.name, restricted.len()));
            let quantity = format!("{}_{}", tissue.name, mode.as_str());
            write_field(
                &state.layout,
                &state.layout.tissue(&tissue.name),
                montage.name(),
                &quantity,
                restricted,
            )
            .await?;
        }
        Ok(Some(counts.join(", ")))
    }

    async fn transform(&self, state: &StageState) -> TiResult<Option<String>> {
        let spaces = TargetSpace::requested(&self.config.mapping);
        if spaces.is_empty() {
            return Ok(Some("no mapping requested".to_string()));
        }
        let input = state.layout.resolve(&state.layout.envelope());
        for space in &spaces {
            let output = state.layout.resolve(&state.layout.mapped(*space));
            info!("Transforming envelope into {} space", space.as_str());
            self.solver.transform(&input, *space, &output).await?;
        }
        let names: Vec<&str> = spaces.iter().map(|s| s.as_str()).collect();
        Ok(Some(names.join(", ")))
    }

    async fn verify(&self, state: &mut StageState) -> TiResult<Option<String>> {
        let path = state.layout.resolve(MANIFEST_FILE);
        let manifest = match ArtifactManifest::load(&path).await {
            Ok(manifest) => manifest,
            Err(e) => {
                warn!("Persisted manifest unreadable ({}), using the derived one", e);
                state.manifest.clone().ok_or(e)?
            }
        };
        let report = self.verifier.verify(&state.layout, &manifest).await?;
        if !report.unexpected.is_empty() {
            debug!("Unlisted files in montage directory: {:?}", report.unexpected);
        }
        for missing in &report.missing_optional {
            debug!("Optional artifact not produced: {}", missing);
        }
        state.manifest = Some(manifest);
        state.verification = Some(report.clone());
        let report = report.into_result()?;
        Ok(Some(format!(
            "{} artifacts verified, {} optional missing",
            report.produced.len(),
            report.missing_optional.len()
        )))
    }
}

async fn write_field(
    layout: &ArtifactLayout,
    relative: &str,
    montage: &str,
    quantity: &str,
    envelope: EnvelopeResult,
) -> TiResult<()> {
    let artifact = FieldArtifact {
        montage: montage.to_string(),
        quantity: quantity.to_string(),
        envelope,
    };
    let path = layout.resolve(relative);
    write_json_atomic(&path, &artifact).await?;
    debug!("Wrote {}", display_relative(layout.root(), &path));
    Ok(())
}

fn display_relative(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .display()
        .to_string()
}
