//! Per-montage output layout and the manifest of files a run must produce.

mod verify;

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::core::config::{MappingFlags, TissueSpec};
use crate::core::envelope::EnvelopeResult;
use crate::core::error::{TiError, TiResult};
use crate::core::montage::SimulationMode;

pub use verify::{ArtifactVerifier, ProducedArtifact, VerificationReport};

pub const MANIFEST_FILE: &str = "documentation/manifest.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetSpace {
    Surface,
    Volume,
    Normalized,
    Atlas,
}

impl TargetSpace {
    pub fn as_str(self) -> &'static str {
        match self {
            TargetSpace::Surface => "surface",
            TargetSpace::Volume => "volume",
            TargetSpace::Normalized => "normalized",
            TargetSpace::Atlas => "atlas",
        }
    }

    /// Spaces requested by `flags`, in a fixed order.
    pub fn requested(flags: &MappingFlags) -> Vec<TargetSpace> {
        [
            (flags.surface, TargetSpace::Surface),
            (flags.volume, TargetSpace::Volume),
            (flags.normalized, TargetSpace::Normalized),
            (flags.atlas, TargetSpace::Atlas),
        ]
        .into_iter()
        .filter(|(on, _)| *on)
        .map(|(_, space)| space)
        .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ArtifactKind {
    Envelope,
    Intermediate { label: String },
    Tissue { name: String },
    Mapped { space: TargetSpace },
    NormalEnvelope,
    HighFrequency { pair: usize },
    Visualization,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Relative to the montage directory, `/`-separated.
    pub path: String,
    pub required: bool,
    #[serde(flatten)]
    pub kind: ArtifactKind,
}

/// File naming for one montage directory.
#[derive(Debug, Clone)]
pub struct ArtifactLayout {
    root: PathBuf,
    montage: String,
    mode: SimulationMode,
}

impl ArtifactLayout {
    pub fn new(root: impl Into<PathBuf>, montage: impl Into<String>, mode: SimulationMode) -> Self {
        Self {
            root: root.into(),
            montage: montage.into(),
            mode,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn mode(&self) -> SimulationMode {
        self.mode
    }

    pub fn resolve(&self, relative: &str) -> PathBuf {
        relative
            .split('/')
            .fold(self.root.clone(), |acc, part| acc.join(part))
    }

    /// Directories created by the setup stage.
    pub fn directories(&self) -> Vec<String> {
        let mode = self.mode.as_str();
        vec![
            format!("{}/mesh", mode),
            format!("{}/niftis", mode),
            format!("{}/surface_overlays", mode),
            format!("{}/fsavg_overlays", mode),
            "high_Frequency/mesh".to_string(),
            "documentation/montage_imgs".to_string(),
        ]
    }

    pub fn envelope(&self) -> String {
        let mode = self.mode.as_str();
        format!("{}/mesh/{}_{}.field.json", mode, self.montage, mode)
    }

    pub fn normal_envelope(&self) -> String {
        let mode = self.mode.as_str();
        format!("{}/mesh/{}_{}_normal.field.json", mode, self.montage, mode)
    }

    /// `label` is `AB` or `CD`.
    pub fn intermediate(&self, label: &str) -> String {
        format!("mTI/mesh/{}_TI_{}.field.json", self.montage, label)
    }

    pub fn tissue(&self, tissue: &str) -> String {
        let mode = self.mode.as_str();
        format!("{}/mesh/{}_{}_{}.field.json", mode, tissue, self.montage, mode)
    }

    pub fn mapped(&self, space: TargetSpace) -> String {
        let mode = self.mode.as_str();
        let m = &self.montage;
        match space {
            TargetSpace::Surface => format!("{}/surface_overlays/{}_{}.central.msh", mode, m, mode),
            TargetSpace::Volume => format!("{}/niftis/{}_{}_subject.nii.gz", mode, m, mode),
            TargetSpace::Normalized => format!("{}/niftis/{}_{}_MNI.nii.gz", mode, m, mode),
            TargetSpace::Atlas => format!("{}/fsavg_overlays/{}_{}.fsavg.msh", mode, m, mode),
        }
    }

    /// `pair` is 1-based.
    pub fn high_frequency(&self, pair: usize) -> String {
        format!("high_Frequency/mesh/{}_HF_{}.field.json", self.montage, pair)
    }

    pub fn visualization(&self) -> String {
        format!(
            "documentation/montage_imgs/{}_highlighted_visualization.png",
            self.montage
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactManifest {
    pub montage: String,
    pub mode: SimulationMode,
    pub entries: Vec<ManifestEntry>,
}

impl ArtifactManifest {
    /// Deterministic for a given mode, mapping flags and tissue list.
    pub fn derive(layout: &ArtifactLayout, mapping: &MappingFlags, tissues: &[TissueSpec]) -> Self {
        let mut entries = Vec::new();
        let mut push = |path: String, required: bool, kind: ArtifactKind| {
            entries.push(ManifestEntry {
                path,
                required,
                kind,
            })
        };

        push(layout.envelope(), true, ArtifactKind::Envelope);
        if layout.mode() == SimulationMode::Mti {
            for label in ["AB", "CD"] {
                push(
                    layout.intermediate(label),
                    true,
                    ArtifactKind::Intermediate {
                        label: label.to_string(),
                    },
                );
            }
        }
        for tissue in tissues {
            push(
                layout.tissue(&tissue.name),
                true,
                ArtifactKind::Tissue {
                    name: tissue.name.clone(),
                },
            );
        }
        for space in TargetSpace::requested(mapping) {
            push(layout.mapped(space), true, ArtifactKind::Mapped { space });
        }

        push(layout.normal_envelope(), false, ArtifactKind::NormalEnvelope);
        for pair in 1..=layout.mode().pair_count() {
            push(
                layout.high_frequency(pair),
                false,
                ArtifactKind::HighFrequency { pair },
            );
        }
        push(layout.visualization(), false, ArtifactKind::Visualization);

        Self {
            montage: layout.montage.clone(),
            mode: layout.mode(),
            entries,
        }
    }

    pub fn required(&self) -> impl Iterator<Item = &ManifestEntry> {
        self.entries.iter().filter(|e| e.required)
    }

    pub fn find(&self, kind: &ArtifactKind) -> Option<&ManifestEntry> {
        self.entries.iter().find(|e| &e.kind == kind)
    }

    pub async fn persist(&self, path: &Path) -> TiResult<()> {
        write_json_atomic(path, self).await
    }

    pub async fn load(path: &Path) -> TiResult<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| TiError::io(path, e))?;
        serde_json::from_str(&content).map_err(|e| TiError::parse(path, e))
    }
}

/// Envelope payload written by the pipeline itself (not by a collaborator).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldArtifact {
    pub montage: String,
    pub quantity: String,
    pub envelope: EnvelopeResult,
}

/// Serializes to `<path>.tmp` and renames into place so readers never see a
/// half-written document.
pub async fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> TiResult<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| TiError::io(parent, e))?;
    }
    let body = serde_json::to_vec_pretty(value).map_err(|e| TiError::parse(path, e))?;
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    tokio::fs::write(&tmp, body)
        .await
        .map_err(|e| TiError::io(&tmp, e))?;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|e| TiError::io(path, e))
}
