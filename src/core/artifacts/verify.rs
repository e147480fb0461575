use std::collections::BTreeSet;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use super::{ArtifactLayout, ArtifactManifest, MANIFEST_FILE};
use crate::core::error::{TiError, TiResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProducedArtifact {
    pub path: String,
    pub bytes: u64,
    pub sha256: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationReport {
    pub produced: Vec<ProducedArtifact>,
    pub missing_required: Vec<String>,
    pub missing_optional: Vec<String>,
    /// Files in the montage directory that the manifest does not list.
    pub unexpected: Vec<String>,
}

impl VerificationReport {
    pub fn is_complete(&self) -> bool {
        self.missing_required.is_empty()
    }

    pub fn into_result(self) -> TiResult<Self> {
        if self.is_complete() {
            Ok(self)
        } else {
            Err(TiError::FileVerification {
                missing: self.missing_required,
            })
        }
    }
}

/// Compares what is on disk against a manifest. Stage outcomes are not
/// consulted: a run whose stages all succeeded still fails here if a
/// required file is absent or empty.
#[derive(Debug, Clone, Copy, Default)]
pub struct ArtifactVerifier;

impl ArtifactVerifier {
    pub async fn verify(
        &self,
        layout: &ArtifactLayout,
        manifest: &ArtifactManifest,
    ) -> TiResult<VerificationReport> {
        let root = layout.root().to_path_buf();
        let manifest = manifest.clone();
        tokio::task::spawn_blocking(move || verify_blocking(&root, &manifest))
            .await
            .map_err(|e| TiError::io(layout.root(), std::io::Error::other(e)))?
    }
}

fn verify_blocking(root: &Path, manifest: &ArtifactManifest) -> TiResult<VerificationReport> {
    let mut report = VerificationReport::default();
    let listed: BTreeSet<&str> = manifest.entries.iter().map(|e| e.path.as_str()).collect();

    for entry in &manifest.entries {
        let path = entry
            .path
            .split('/')
            .fold(root.to_path_buf(), |acc, part| acc.join(part));
        match std::fs::metadata(&path) {
            Ok(meta) if meta.is_file() && meta.len() > 0 => {
                let body = std::fs::read(&path).map_err(|e| TiError::io(&path, e))?;
                report.produced.push(ProducedArtifact {
                    path: entry.path.clone(),
                    bytes: meta.len(),
                    sha256: hex::encode(Sha256::digest(&body)),
                });
            }
            _ if entry.required => {
                warn!("Required artifact missing: {}", entry.path);
                report.missing_required.push(entry.path.clone());
            }
            _ => {
                debug!("Optional artifact absent: {}", entry.path);
                report.missing_optional.push(entry.path.clone());
            }
        }
    }

    let mut on_disk = Vec::new();
    collect_files(root, root, &mut on_disk).map_err(|e| TiError::io(root, e))?;
    report.unexpected = on_disk
        .into_iter()
        .filter(|p| p != MANIFEST_FILE && !listed.contains(p.as_str()))
        .collect();
    report.unexpected.sort();

    Ok(report)
}

fn collect_files(root: &Path, dir: &Path, out: &mut Vec<String>) -> std::io::Result<()> {
    if !dir.exists() {
        return Ok(());
    }
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            collect_files(root, &path, out)?;
        } else if let Ok(rel) = path.strip_prefix(root) {
            let rel = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            out.push(rel);
        }
    }
    Ok(())
}
