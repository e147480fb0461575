//! Boundary to the external collaborators: the field solver, the
//! mesh/image transform tool and the montage renderer.
//!
//! Implementations are swapped per platform, and tests substitute
//! deterministic stubs.

mod command;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::core::artifacts::TargetSpace;
use crate::core::config::{Conductivity, ElectrodeConfig, SimulationConfig};
use crate::core::envelope::FieldSampleSet;
use crate::core::error::TiResult;
use crate::core::montage::{CatalogView, ElectrodePair, MontageModel};

pub use command::{CommandSolverGateway, CommandVisualizer, ToolOutput, resolve_program, run_tool};

/// Everything the solver needs for one energized pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SolveRequest {
    pub montage: String,
    /// 1-based slot of the pair within the montage.
    pub pair_index: usize,
    pub pair: ElectrodePair,
    pub current_ma: f64,
    pub subject_id: String,
    pub conductivity: Conductivity,
    pub eeg_net: Option<String>,
    pub electrode: ElectrodeConfig,
    /// Where the solver writes its `FieldSampleSet` document.
    pub output: PathBuf,
}

impl SolveRequest {
    pub fn new(
        montage: &MontageModel,
        pair_index: usize,
        current_ma: f64,
        config: &SimulationConfig,
        output: PathBuf,
    ) -> Option<Self> {
        let pair = montage.pairs().get(pair_index.checked_sub(1)?)?.clone();
        Some(Self {
            montage: montage.name().to_string(),
            pair_index,
            pair,
            current_ma,
            subject_id: config.subject_id.clone(),
            conductivity: config.conductivity,
            eeg_net: montage.eeg_net().map(str::to_string),
            electrode: config.electrode.clone(),
            output,
        })
    }
}

/// Field solver and space transform.
///
/// Contract: one montage worker calls these strictly one at a time. The solver
/// parallelises internally and needs gigabytes per instance, so concurrent
/// calls from a single montage would oversubscribe the machine. Parallelism
/// exists only across montages and is bounded by the scheduler.
#[async_trait]
pub trait SolverGateway: Send + Sync {
    async fn solve(&self, request: &SolveRequest) -> TiResult<FieldSampleSet>;

    /// Converts `input` into `space`, writing `output`. Returns the written path.
    async fn transform(&self, input: &Path, space: TargetSpace, output: &Path)
    -> TiResult<PathBuf>;
}

#[async_trait]
pub trait VisualizationService: Send + Sync {
    /// Renders the montage to `output`. Coordinate montages have nothing to
    /// draw on a net template and return `Ok(None)`.
    async fn render(
        &self,
        montage: &MontageModel,
        view: &CatalogView,
        output: &Path,
    ) -> TiResult<Option<PathBuf>>;
}

/// Used when no renderer is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoVisualization;

#[async_trait]
impl VisualizationService for NoVisualization {
    async fn render(
        &self,
        _montage: &MontageModel,
        _view: &CatalogView,
        _output: &Path,
    ) -> TiResult<Option<PathBuf>> {
        Ok(None)
    }
}
