use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use serde::Deserialize;
use tracing::{info, warn};

use super::{Electrode, ElectrodeNet, ElectrodePair, MontageModel, Point3};
use crate::core::error::{TiError, TiResult};

#[derive(Debug, Default, Deserialize)]
struct CatalogFile {
    #[serde(default)]
    nets: BTreeMap<String, NetSection>,
}

#[derive(Debug, Default, Deserialize)]
struct NetSection {
    #[serde(default)]
    uni_polar_montages: BTreeMap<String, Vec<[String; 2]>>,
    #[serde(default)]
    multi_polar_montages: BTreeMap<String, Vec<[String; 2]>>,
}

#[derive(Debug, Clone, Deserialize)]
struct AdHocEntry {
    name: String,
    pairs: Vec<[Point3; 2]>,
}

/// Which montages to pull out of the catalog.
#[derive(Debug, Clone)]
pub enum CatalogQuery {
    /// Look each name up under the given net, falling back to ad hoc entries.
    Names { names: Vec<String>, eeg_net: String },
    /// Every ad hoc (coordinate) montage that was loaded.
    AllAdHoc,
}

#[derive(Debug)]
pub struct RejectedMontage {
    pub name: String,
    pub error: TiError,
}

#[derive(Debug, Default)]
pub struct CatalogLoad {
    pub montages: Vec<MontageModel>,
    pub rejected: Vec<RejectedMontage>,
}

/// Montage definitions from the named catalog, ad hoc coordinate sources and
/// EEG net position files. Read-only once loaded.
#[derive(Debug, Default)]
pub struct MontageCatalog {
    named: BTreeMap<String, BTreeMap<String, Vec<[String; 2]>>>,
    adhoc: BTreeMap<String, Vec<[Point3; 2]>>,
    nets: HashMap<String, ElectrodeNet>,
}

impl MontageCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_named_json(&mut self, content: &str, origin: &Path) -> TiResult<()> {
        let file: CatalogFile =
            serde_json::from_str(content).map_err(|e| TiError::parse(origin, e))?;
        for (net, section) in file.nets {
            let entry = self.named.entry(net.clone()).or_default();
            let pairs = section
                .uni_polar_montages
                .into_iter()
                .chain(section.multi_polar_montages);
            for (name, pairs) in pairs {
                if entry.insert(name.clone(), pairs).is_some() {
                    warn!("Montage {} defined twice for net {}, keeping the last one", name, net);
                }
            }
        }
        Ok(())
    }

    pub fn add_adhoc_json(&mut self, content: &str, origin: &Path) -> TiResult<()> {
        let entries: Vec<AdHocEntry> =
            serde_json::from_str(content).map_err(|e| TiError::parse(origin, e))?;
        for entry in entries {
            if self.adhoc.insert(entry.name.clone(), entry.pairs).is_some() {
                warn!("Ad hoc montage {} defined twice, keeping the last one", entry.name);
            }
        }
        Ok(())
    }

    pub fn add_net(&mut self, net: ElectrodeNet) {
        self.nets.insert(net.name.clone(), net);
    }

    pub async fn load_named_file(&mut self, path: &Path) -> TiResult<()> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| TiError::io(path, e))?;
        self.add_named_json(&content, path)
    }

    pub async fn load_adhoc_file(&mut self, path: &Path) -> TiResult<()> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| TiError::io(path, e))?;
        self.add_adhoc_json(&content, path)
    }

    pub fn net(&self, name: &str) -> Option<&ElectrodeNet> {
        self.nets.get(name)
    }

    /// Resolves and validates the requested montages. Invalid entries are
    /// collected in `rejected` unless `strict`, in which case the first one
    /// fails the whole load.
    pub fn load(&self, query: &CatalogQuery, strict: bool) -> TiResult<CatalogLoad> {
        let mut out = CatalogLoad::default();
        let mut seen = HashSet::new();

        let candidates: Vec<(String, TiResult<MontageModel>)> = match query {
            CatalogQuery::Names { names, eeg_net } => names
                .iter()
                .map(|name| (name.clone(), self.resolve_named(name, eeg_net)))
                .collect(),
            CatalogQuery::AllAdHoc => self
                .adhoc
                .iter()
                .map(|(name, pairs)| (name.clone(), build_adhoc(name, pairs)))
                .collect(),
        };

        for (name, result) in candidates {
            let result = result.and_then(|m| {
                if seen.insert(m.name().to_string()) {
                    Ok(m)
                } else {
                    Err(TiError::config(&name, "requested more than once"))
                }
            });
            match result {
                Ok(montage) => {
                    info!(
                        "Montage {} classified as {} ({} pairs)",
                        montage.name(),
                        montage.simulation_mode(),
                        montage.pairs().len()
                    );
                    out.montages.push(montage);
                }
                Err(error) if strict => return Err(error),
                Err(error) => {
                    warn!("Skipping montage {}: {}", name, error);
                    out.rejected.push(RejectedMontage { name, error });
                }
            }
        }

        Ok(out)
    }

    fn resolve_named(&self, name: &str, eeg_net: &str) -> TiResult<MontageModel> {
        if let Some(pairs) = self.named.get(eeg_net).and_then(|m| m.get(name)) {
            let pairs = pairs
                .iter()
                .map(|[a, b]| ElectrodePair::named(a, b))
                .collect();
            let montage = MontageModel::new(name, pairs, Some(eeg_net.to_string()))?;
            if let Some(net) = self.nets.get(eeg_net) {
                for label in montage
                    .pairs()
                    .iter()
                    .flat_map(|p| p.electrodes())
                    .filter_map(Electrode::label)
                {
                    if !net.contains(label) {
                        return Err(TiError::config(
                            name,
                            format!("electrode '{}' not found in net {}", label, eeg_net),
                        ));
                    }
                }
            }
            return Ok(montage);
        }
        if let Some(pairs) = self.adhoc.get(name) {
            return build_adhoc(name, pairs);
        }
        Err(TiError::config(
            name,
            format!("not found in catalog for net {}", eeg_net),
        ))
    }
}

fn build_adhoc(name: &str, pairs: &[[Point3; 2]]) -> TiResult<MontageModel> {
    let pairs = pairs
        .iter()
        .map(|[a, b]| ElectrodePair::coordinates(*a, *b))
        .collect();
    MontageModel::new(name, pairs, None)
}

/// Transient name lookups for coordinate montages, owned by the scheduler for
/// the length of one batch. Never written back to any catalog file.
///
/// The pipeline skips rendering for coordinate montages and the command
/// visualizer renders named montages only, so overlay entries are read by
/// custom [`VisualizationService`](crate::core::gateway::VisualizationService)
/// implementations that look coordinate montages up by name.
#[derive(Debug, Default, Clone)]
pub struct CatalogOverlay {
    entries: BTreeMap<String, Vec<ElectrodePair>>,
}

impl CatalogOverlay {
    pub fn for_montages(montages: &[MontageModel]) -> Self {
        let entries = montages
            .iter()
            .filter(|m| m.is_coordinate_based())
            .map(|m| (m.name().to_string(), m.pairs().to_vec()))
            .collect();
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Read-time merge of the base catalog and a batch overlay. Cheap to clone
/// into every worker.
#[derive(Debug, Clone)]
pub struct CatalogView {
    base: Arc<MontageCatalog>,
    overlay: Arc<CatalogOverlay>,
}

impl CatalogView {
    pub fn new(base: Arc<MontageCatalog>, overlay: CatalogOverlay) -> Self {
        Self {
            base,
            overlay: Arc::new(overlay),
        }
    }

    /// Pairs for `name`: the named catalog of `eeg_net` first, then the overlay.
    pub fn resolve(&self, name: &str, eeg_net: Option<&str>) -> Option<Vec<ElectrodePair>> {
        if let Some(pairs) = eeg_net
            .and_then(|net| self.base.named.get(net))
            .and_then(|m| m.get(name))
        {
            return Some(
                pairs
                    .iter()
                    .map(|[a, b]| ElectrodePair::named(a, b))
                    .collect(),
            );
        }
        self.overlay.entries.get(name).cloned()
    }

    pub fn electrode_position(&self, eeg_net: &str, label: &str) -> Option<Point3> {
        self.base.net(eeg_net).and_then(|net| net.position(label))
    }
}
