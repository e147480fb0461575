//! Run configuration, loaded from `simulation.toml`.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::core::error::{TiError, TiResult};
use crate::core::montage::{SimulationMode, is_single_component};

const CONFIG_SCOPE: &str = "<config>";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ElectrodeShape {
    #[default]
    Rect,
    Ellipse,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElectrodeConfig {
    #[serde(default)]
    pub shape: ElectrodeShape,
    /// Width and height in mm.
    #[serde(default = "default_dimensions")]
    pub dimensions: [f64; 2],
    #[serde(default = "default_thickness")]
    pub thickness: f64,
    #[serde(default = "default_sponge_thickness")]
    pub sponge_thickness: f64,
}

fn default_dimensions() -> [f64; 2] {
    [8.0, 8.0]
}
fn default_thickness() -> f64 {
    4.0
}
fn default_sponge_thickness() -> f64 {
    2.0
}

impl Default for ElectrodeConfig {
    fn default() -> Self {
        Self {
            shape: ElectrodeShape::default(),
            dimensions: default_dimensions(),
            thickness: default_thickness(),
            sponge_thickness: default_sponge_thickness(),
        }
    }
}

impl ElectrodeConfig {
    pub fn validate(&self) -> TiResult<()> {
        let positive = |v: f64| v.is_finite() && v > 0.0;
        if !self.dimensions.iter().all(|d| positive(*d)) {
            return Err(TiError::config(
                CONFIG_SCOPE,
                format!("electrode dimensions must be positive, got {:?}", self.dimensions),
            ));
        }
        if !positive(self.thickness) {
            return Err(TiError::config(
                CONFIG_SCOPE,
                format!("electrode thickness must be positive, got {}", self.thickness),
            ));
        }
        if !(self.sponge_thickness.is_finite() && self.sponge_thickness >= 0.0) {
            return Err(TiError::config(
                CONFIG_SCOPE,
                format!(
                    "sponge thickness must be non-negative, got {}",
                    self.sponge_thickness
                ),
            ));
        }
        Ok(())
    }
}

/// Current per pair slot in mA.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct IntensityConfig {
    pub pair1: Option<f64>,
    pub pair2: Option<f64>,
    pub pair3: Option<f64>,
    pub pair4: Option<f64>,
}

impl IntensityConfig {
    pub fn uniform(ma: f64) -> Self {
        Self {
            pair1: Some(ma),
            pair2: Some(ma),
            pair3: Some(ma),
            pair4: Some(ma),
        }
    }

    /// Parses `"2"`, `"1,2"` (mirrored onto pairs 3 and 4) or `"1,2,3,4"`.
    pub fn parse(raw: &str) -> TiResult<Self> {
        let values = raw
            .split(',')
            .map(|v| v.trim().parse::<f64>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| TiError::config(CONFIG_SCOPE, format!("bad intensity '{}': {}", raw, e)))?;
        match values.as_slice() {
            [all] => Ok(Self::uniform(*all)),
            [a, b] => Ok(Self {
                pair1: Some(*a),
                pair2: Some(*b),
                pair3: Some(*a),
                pair4: Some(*b),
            }),
            [a, b, c, d] => Ok(Self {
                pair1: Some(*a),
                pair2: Some(*b),
                pair3: Some(*c),
                pair4: Some(*d),
            }),
            _ => Err(TiError::config(
                CONFIG_SCOPE,
                format!("intensity needs 1, 2 or 4 values, got {}", values.len()),
            )),
        }
    }

    pub fn slot(&self, index: usize) -> Option<f64> {
        match index {
            0 => self.pair1,
            1 => self.pair2,
            2 => self.pair3,
            3 => self.pair4,
            _ => None,
        }
    }

    /// Amplitudes for the active slots of `mode`. Every one must be present,
    /// finite and strictly positive.
    pub fn currents_for(&self, mode: SimulationMode) -> TiResult<Vec<f64>> {
        (0..mode.pair_count())
            .map(|i| match self.slot(i) {
                Some(v) if v.is_finite() && v > 0.0 => Ok(v),
                Some(v) => Err(TiError::config(
                    CONFIG_SCOPE,
                    format!("pair{} current must be finite and > 0 mA, got {}", i + 1, v),
                )),
                None => Err(TiError::config(
                    CONFIG_SCOPE,
                    format!("pair{} current is required in {} mode", i + 1, mode),
                )),
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Conductivity {
    #[default]
    Scalar,
    Vn,
    Dir,
    Mc,
}

impl Conductivity {
    pub fn as_str(self) -> &'static str {
        match self {
            Conductivity::Scalar => "scalar",
            Conductivity::Vn => "vn",
            Conductivity::Dir => "dir",
            Conductivity::Mc => "mc",
        }
    }
}

/// Which target spaces the envelope is converted into after extraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct MappingFlags {
    #[serde(default)]
    pub surface: bool,
    #[serde(default)]
    pub volume: bool,
    #[serde(default)]
    pub normalized: bool,
    #[serde(default)]
    pub atlas: bool,
}

impl MappingFlags {
    pub fn all() -> Self {
        Self {
            surface: true,
            volume: true,
            normalized: true,
            atlas: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TissueSpec {
    pub name: String,
    /// Element tags in the head mesh that belong to this compartment.
    pub tags: Vec<u32>,
}

fn default_tissues() -> Vec<TissueSpec> {
    vec![
        TissueSpec {
            name: "grey".to_string(),
            tags: vec![2],
        },
        TissueSpec {
            name: "white".to_string(),
            tags: vec![1],
        },
    ]
}

/// External commands for the collaborators. Each is a program plus fixed
/// leading arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolConfig {
    #[serde(default = "default_solver")]
    pub solver: Vec<String>,
    #[serde(default = "default_transform")]
    pub transform: Vec<String>,
    #[serde(default)]
    pub visualizer: Option<Vec<String>>,
}

fn default_solver() -> Vec<String> {
    vec!["ti-solve".to_string()]
}
fn default_transform() -> Vec<String> {
    vec!["ti-transform".to_string()]
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            solver: default_solver(),
            transform: default_transform(),
            visualizer: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationConfig {
    pub subject_id: String,
    pub project_dir: PathBuf,
    #[serde(default)]
    pub conductivity: Conductivity,
    #[serde(default)]
    pub eeg_net: Option<String>,
    #[serde(default)]
    pub electrode: ElectrodeConfig,
    #[serde(default)]
    pub intensity: IntensityConfig,
    #[serde(default)]
    pub mapping: MappingFlags,
    #[serde(default = "default_tissues")]
    pub tissues: Vec<TissueSpec>,
    #[serde(default)]
    pub tools: ToolConfig,
    /// 0 picks half of the logical cores.
    #[serde(default)]
    pub max_workers: usize,
    #[serde(default)]
    pub montage_timeout_secs: Option<u64>,
    #[serde(default)]
    pub strict_catalog: bool,
}

impl SimulationConfig {
    pub fn new(subject_id: impl Into<String>, project_dir: impl Into<PathBuf>) -> Self {
        Self {
            subject_id: subject_id.into(),
            project_dir: project_dir.into(),
            conductivity: Conductivity::default(),
            eeg_net: None,
            electrode: ElectrodeConfig::default(),
            intensity: IntensityConfig::uniform(1.0),
            mapping: MappingFlags::default(),
            tissues: default_tissues(),
            tools: ToolConfig::default(),
            max_workers: 0,
            montage_timeout_secs: None,
            strict_catalog: false,
        }
    }

    pub async fn load(path: &Path) -> TiResult<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| TiError::io(path, e))?;
        let config: SimulationConfig =
            toml::from_str(&content).map_err(|e| TiError::parse(path, e))?;
        config.validate()?;
        info!(
            "Loaded simulation config: subject={}, conductivity={}, net={}, mapping={:?}",
            config.subject_id,
            config.conductivity.as_str(),
            config.eeg_net.as_deref().unwrap_or("-"),
            config.mapping
        );
        Ok(config)
    }

    pub fn validate(&self) -> TiResult<()> {
        if self.subject_id.trim().is_empty() || self.subject_id.contains(['/', '\\']) {
            return Err(TiError::config(
                CONFIG_SCOPE,
                format!("invalid subject id '{}'", self.subject_id),
            ));
        }
        self.electrode.validate()?;
        if self.tissues.iter().any(|t| t.name.trim().is_empty() || t.tags.is_empty()) {
            return Err(TiError::config(
                CONFIG_SCOPE,
                "every tissue needs a name and at least one tag",
            ));
        }
        // Tissue names become file names inside the montage directory.
        let mut seen = HashSet::new();
        for tissue in &self.tissues {
            if !is_single_component(&tissue.name) {
                return Err(TiError::config(
                    CONFIG_SCOPE,
                    format!("tissue name '{}' must not contain path separators", tissue.name),
                ));
            }
            if !seen.insert(tissue.name.as_str()) {
                return Err(TiError::config(
                    CONFIG_SCOPE,
                    format!("tissue '{}' is listed more than once", tissue.name),
                ));
            }
        }
        if self.tools.solver.is_empty() || self.tools.transform.is_empty() {
            return Err(TiError::config(CONFIG_SCOPE, "tool commands must not be empty"));
        }
        if self.montage_timeout_secs == Some(0) {
            return Err(TiError::config(CONFIG_SCOPE, "montage timeout must be > 0"));
        }
        Ok(())
    }

    /// `<project>/derivatives/tiflow/sub-<id>/Simulations`
    pub fn simulations_dir(&self) -> PathBuf {
        self.project_dir
            .join("derivatives")
            .join("tiflow")
            .join(format!("sub-{}", self.subject_id))
            .join("Simulations")
    }

    pub fn montage_dir(&self, montage: &str) -> PathBuf {
        self.simulations_dir().join(montage)
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.simulations_dir().join("logs")
    }

    pub fn reports_dir(&self) -> PathBuf {
        self.simulations_dir().join("reports")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn electrode_defaults() {
        let e = ElectrodeConfig::default();
        assert_eq!(e.shape, ElectrodeShape::Rect);
        assert_eq!(e.dimensions, [8.0, 8.0]);
        assert_eq!(e.sponge_thickness, 2.0);
        assert!(e.validate().is_ok());
    }

    #[test]
    fn electrode_rejects_non_positive_lengths() {
        let mut e = ElectrodeConfig::default();
        e.dimensions = [8.0, 0.0];
        assert!(e.validate().is_err());

        let mut e = ElectrodeConfig::default();
        e.thickness = -1.0;
        assert!(e.validate().is_err());

        let mut e = ElectrodeConfig::default();
        e.sponge_thickness = 0.0;
        assert!(e.validate().is_ok());
    }

    #[test]
    fn intensity_string_forms() {
        assert_eq!(IntensityConfig::parse("2").unwrap(), IntensityConfig::uniform(2.0));

        let two = IntensityConfig::parse("1.0, 2.5").unwrap();
        assert_eq!(two.pair3, Some(1.0));
        assert_eq!(two.pair4, Some(2.5));

        let four = IntensityConfig::parse("1,2,3,4").unwrap();
        assert_eq!(four.slot(3), Some(4.0));

        assert!(IntensityConfig::parse("1,2,3").is_err());
        assert!(IntensityConfig::parse("abc").is_err());
    }

    #[test]
    fn currents_require_every_active_slot() {
        let cfg = IntensityConfig {
            pair1: Some(1.0),
            pair2: Some(1.0),
            pair3: None,
            pair4: None,
        };
        assert_eq!(cfg.currents_for(SimulationMode::Ti).unwrap(), vec![1.0, 1.0]);
        assert!(cfg.currents_for(SimulationMode::Mti).is_err());

        let zero = IntensityConfig::parse("1,0").unwrap();
        assert!(zero.currents_for(SimulationMode::Ti).is_err());

        let nan = IntensityConfig {
            pair1: Some(f64::NAN),
            ..IntensityConfig::uniform(1.0)
        };
        assert!(nan.currents_for(SimulationMode::Ti).is_err());
    }

    #[test]
    fn parse_minimal_toml_fills_defaults() {
        let content = r#"
subject_id = "101"
project_dir = "/data/project"
eeg_net = "EGI_template.csv"

[intensity]
pair1 = 2.0
pair2 = 2.0

[mapping]
volume = true
"#;
        let cfg: SimulationConfig = toml::from_str(content).unwrap();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.conductivity, Conductivity::Scalar);
        assert_eq!(cfg.tissues.len(), 2);
        assert!(cfg.mapping.volume);
        assert!(!cfg.mapping.surface);
        assert_eq!(cfg.tools.solver, vec!["ti-solve".to_string()]);
        assert_eq!(cfg.max_workers, 0);
        assert_eq!(
            cfg.montage_dir("m1"),
            PathBuf::from("/data/project/derivatives/tiflow/sub-101/Simulations/m1")
        );
    }

    #[test]
    fn subject_with_separator_is_invalid() {
        let cfg = SimulationConfig::new("a/b", "/tmp");
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn tissue_names_stay_inside_the_montage_directory() {
        for bad in ["../../../../escaped", "grey/matter", "..", "."] {
            let mut cfg = SimulationConfig::new("101", "/tmp");
            cfg.tissues[0].name = bad.to_string();
            let err = cfg.validate().unwrap_err();
            assert_eq!(err.kind(), "configuration", "{}", bad);
        }
    }

    #[test]
    fn duplicate_tissue_names_are_invalid() {
        let mut cfg = SimulationConfig::new("101", "/tmp");
        let first = cfg.tissues[0].name.clone();
        cfg.tissues[1].name = first;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("more than once"));
    }

    #[tokio::test]
    async fn load_reports_parse_errors_with_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("simulation.toml");
        std::fs::write(&path, "subject_id = 5").unwrap();
        let err = SimulationConfig::load(&path).await.unwrap_err();
        assert_eq!(err.kind(), "parse");
        assert!(err.to_string().contains("simulation.toml"));
    }
}
