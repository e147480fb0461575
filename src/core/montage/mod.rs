//! Montage data model.
//!
//! A montage is a named list of electrode pairs. Two pairs run as classic
//! temporal interference (TI), four pairs as multipolar TI (mTI). The mode is
//! always derived from the pair count and never stored.

mod catalog;
mod net;

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::error::{TiError, TiResult};

pub use catalog::{
    CatalogLoad, CatalogOverlay, CatalogQuery, CatalogView, MontageCatalog, RejectedMontage,
};
pub use net::ElectrodeNet;

pub type Point3 = [f64; 3];

/// One electrode: either a label resolved through an EEG net, or an explicit
/// position in subject space (mm).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Electrode {
    Named(String),
    Coordinate(Point3),
}

impl Electrode {
    pub fn label(&self) -> Option<&str> {
        match self {
            Electrode::Named(label) => Some(label),
            Electrode::Coordinate(_) => None,
        }
    }
}

impl fmt::Display for Electrode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Electrode::Named(label) => write!(f, "{}", label),
            Electrode::Coordinate([x, y, z]) => write!(f, "({:.2}, {:.2}, {:.2})", x, y, z),
        }
    }
}

/// Two electrodes driven with equal and opposite current.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElectrodePair(pub Electrode, pub Electrode);

impl ElectrodePair {
    pub fn named(a: impl Into<String>, b: impl Into<String>) -> Self {
        ElectrodePair(Electrode::Named(a.into()), Electrode::Named(b.into()))
    }

    pub fn coordinates(a: Point3, b: Point3) -> Self {
        ElectrodePair(Electrode::Coordinate(a), Electrode::Coordinate(b))
    }

    pub fn electrodes(&self) -> [&Electrode; 2] {
        [&self.0, &self.1]
    }
}

impl fmt::Display for ElectrodePair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} <-> {}", self.0, self.1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SimulationMode {
    #[serde(rename = "TI")]
    Ti,
    #[serde(rename = "mTI")]
    Mti,
}

impl SimulationMode {
    pub fn from_pair_count(count: usize) -> Option<Self> {
        match count {
            2 => Some(SimulationMode::Ti),
            4 => Some(SimulationMode::Mti),
            _ => None,
        }
    }

    pub fn pair_count(self) -> usize {
        match self {
            SimulationMode::Ti => 2,
            SimulationMode::Mti => 4,
        }
    }

    /// Directory and file-name tag for this mode.
    pub fn as_str(self) -> &'static str {
        match self {
            SimulationMode::Ti => "TI",
            SimulationMode::Mti => "mTI",
        }
    }
}

impl fmt::Display for SimulationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable, validated montage. Fields are private so the pair list and the
/// derived mode can never drift apart.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MontageModel {
    name: String,
    pairs: Vec<ElectrodePair>,
    eeg_net: Option<String>,
}

impl MontageModel {
    pub fn new(
        name: impl Into<String>,
        pairs: Vec<ElectrodePair>,
        eeg_net: Option<String>,
    ) -> TiResult<Self> {
        let name = name.into();
        validate_name(&name)?;

        if SimulationMode::from_pair_count(pairs.len()).is_none() {
            return Err(TiError::config(
                &name,
                format!("expected 2 or 4 electrode pairs, got {}", pairs.len()),
            ));
        }

        let named = pairs
            .iter()
            .flat_map(|p| p.electrodes())
            .filter(|e| matches!(e, Electrode::Named(_)))
            .count();
        let total = pairs.len() * 2;
        if named != 0 && named != total {
            return Err(TiError::config(
                &name,
                "mixes named electrodes and explicit coordinates",
            ));
        }

        let eeg_net = if named == total {
            let mut seen = HashSet::new();
            for label in pairs.iter().flat_map(|p| p.electrodes()).filter_map(|e| e.label()) {
                if label.trim().is_empty() {
                    return Err(TiError::config(&name, "empty electrode label"));
                }
                if !seen.insert(label) {
                    return Err(TiError::config(
                        &name,
                        format!("electrode '{}' is used by more than one channel", label),
                    ));
                }
            }
            match eeg_net {
                Some(net) if !net.trim().is_empty() => Some(net),
                _ => {
                    return Err(TiError::config(
                        &name,
                        "named electrodes require an EEG net",
                    ));
                }
            }
        } else {
            for electrode in pairs.iter().flat_map(|p| p.electrodes()) {
                if let Electrode::Coordinate(point) = electrode
                    && !point.iter().all(|v| v.is_finite())
                {
                    return Err(TiError::config(
                        &name,
                        format!("non-finite electrode coordinate {:?}", point),
                    ));
                }
            }
            None
        };

        Ok(Self {
            name,
            pairs,
            eeg_net,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pairs(&self) -> &[ElectrodePair] {
        &self.pairs
    }

    pub fn eeg_net(&self) -> Option<&str> {
        self.eeg_net.as_deref()
    }

    pub fn simulation_mode(&self) -> SimulationMode {
        // Construction rejects every other count.
        SimulationMode::from_pair_count(self.pairs.len()).unwrap_or(SimulationMode::Ti)
    }

    pub fn is_coordinate_based(&self) -> bool {
        self.eeg_net.is_none()
    }
}

/// Montage names become directory and log file names.
/// True when `name` can be joined onto a directory without leaving it.
pub(crate) fn is_single_component(name: &str) -> bool {
    name != "." && name != ".." && !name.contains(['/', '\\', '\0'])
}

fn validate_name(name: &str) -> TiResult<()> {
    if name.trim().is_empty() {
        return Err(TiError::config(name, "montage name is empty"));
    }
    if !is_single_component(name) {
        return Err(TiError::config(
            name,
            "montage name must not contain path separators",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests;
