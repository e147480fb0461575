use std::collections::HashMap;
use std::path::Path;

use tracing::debug;

use super::Point3;
use crate::core::error::{TiError, TiResult};

/// Electrode positions of one EEG net, keyed by label.
#[derive(Debug, Clone, Default)]
pub struct ElectrodeNet {
    pub name: String,
    positions: HashMap<String, Point3>,
}

impl ElectrodeNet {
    /// Parses `label,x,y,z` rows. Rows in the head-model export form
    /// `Electrode,x,y,z,label` are accepted too; fiducials and unparseable
    /// rows (headers) are skipped.
    pub fn parse_csv(name: impl Into<String>, content: &str) -> Self {
        let mut positions = HashMap::new();
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let cols: Vec<&str> = line.split(',').map(str::trim).collect();
            let (label, coords) = match cols.first().copied() {
                Some("Fiducial") => continue,
                Some("Electrode") | Some("ReferenceElectrode") if cols.len() >= 5 => {
                    (cols[4], &cols[1..4])
                }
                Some(label) if cols.len() >= 4 => (label, &cols[1..4]),
                _ => continue,
            };
            let parsed: Vec<f64> = coords.iter().filter_map(|c| c.parse().ok()).collect();
            if parsed.len() != 3 || label.is_empty() {
                continue;
            }
            positions.insert(label.to_string(), [parsed[0], parsed[1], parsed[2]]);
        }
        Self {
            name: name.into(),
            positions,
        }
    }

    pub async fn load(path: &Path) -> TiResult<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| TiError::io(path, e))?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let net = Self::parse_csv(name, &content);
        debug!("Loaded EEG net {} ({} electrodes)", net.name, net.len());
        Ok(net)
    }

    pub fn position(&self, label: &str) -> Option<Point3> {
        self.positions.get(label).copied()
    }

    pub fn contains(&self, label: &str) -> bool {
        self.positions.contains_key(label)
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }
}
