use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::core::artifacts::TargetSpace;
use crate::core::config::SimulationConfig;
use crate::core::envelope::FieldSampleSet;
use crate::core::error::{TiError, TiResult};
use crate::core::gateway::{SolveRequest, SolverGateway, VisualizationService};
use crate::core::montage::{
    CatalogOverlay, CatalogView, ElectrodePair, MontageCatalog, MontageModel,
};
use crate::core::pipeline::PipelineRunner;

/// Six samples, tags cycling white(1) / grey(2) / csf(3).
pub fn synthetic_field(pair_index: usize, current: f64) -> FieldSampleSet {
    let vectors = (0..6)
        .map(|i| {
            let base = (i + 1) as f64 * current;
            match pair_index % 2 {
                1 => [base, 0.0, 0.0],
                _ => [0.0, base, 0.0],
            }
        })
        .collect();
    FieldSampleSet::new((0..6).collect(), vectors).with_tags(vec![1, 2, 3, 1, 2, 3])
}

#[derive(Default)]
pub struct StubSolver {
    pub fail_pair: Option<usize>,
    pub delay: Option<Duration>,
    pub skip_transform_output: bool,
    pub active: AtomicUsize,
    pub max_active: AtomicUsize,
    pub calls: Mutex<Vec<(String, usize)>>,
}

#[async_trait]
impl SolverGateway for StubSolver {
    async fn solve(&self, request: &SolveRequest) -> TiResult<FieldSampleSet> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.active.fetch_sub(1, Ordering::SeqCst);
        self.calls
            .lock()
            .unwrap()
            .push((request.montage.clone(), request.pair_index));

        if self.fail_pair == Some(request.pair_index) {
            return Err(TiError::ExternalTool {
                tool: "solver".into(),
                status: "exit 2".into(),
                excerpt: "ERROR: mesh not found".into(),
            });
        }
        Ok(synthetic_field(request.pair_index, request.current_ma))
    }

    async fn transform(&self, _input: &Path, _space: TargetSpace, output: &Path) -> TiResult<PathBuf> {
        if !self.skip_transform_output {
            tokio::fs::create_dir_all(output.parent().unwrap()).await.unwrap();
            tokio::fs::write(output, b"mapped").await.unwrap();
        }
        Ok(output.to_path_buf())
    }
}

#[derive(Default)]
pub struct StubVisualizer {
    pub rendered: Mutex<Vec<String>>,
}

#[async_trait]
impl VisualizationService for StubVisualizer {
    async fn render(
        &self,
        montage: &MontageModel,
        _view: &CatalogView,
        output: &Path,
    ) -> TiResult<Option<PathBuf>> {
        self.rendered.lock().unwrap().push(montage.name().to_string());
        tokio::fs::write(output, b"png").await.unwrap();
        Ok(Some(output.to_path_buf()))
    }
}

pub fn ti_montage(name: &str) -> MontageModel {
    MontageModel::new(
        name,
        vec![
            ElectrodePair::named("E1", "E2"),
            ElectrodePair::named("E3", "E4"),
        ],
        Some("GSN-HydroCel-185".to_string()),
    )
    .unwrap()
}

pub fn mti_montage(name: &str) -> MontageModel {
    MontageModel::new(
        name,
        vec![
            ElectrodePair::named("E1", "E2"),
            ElectrodePair::named("E3", "E4"),
            ElectrodePair::named("E5", "E6"),
            ElectrodePair::named("E7", "E8"),
        ],
        Some("GSN-HydroCel-185".to_string()),
    )
    .unwrap()
}

pub fn coordinate_montage(name: &str) -> MontageModel {
    MontageModel::new(
        name,
        vec![
            ElectrodePair::coordinates([0.0, 10.0, 0.0], [0.0, -10.0, 0.0]),
            ElectrodePair::coordinates([10.0, 0.0, 0.0], [-10.0, 0.0, 0.0]),
        ],
        None,
    )
    .unwrap()
}

pub fn runner(
    config: SimulationConfig,
    solver: Arc<StubSolver>,
    visualizer: Arc<StubVisualizer>,
) -> PipelineRunner {
    let view = CatalogView::new(Arc::new(MontageCatalog::new()), CatalogOverlay::default());
    PipelineRunner::new(Arc::new(config), solver, visualizer, view)
}
