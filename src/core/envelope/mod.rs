//! Temporal interference envelope.
//!
//! Two fields oscillating at slightly different frequencies produce a
//! low-frequency amplitude modulation. Its maximum depth at a point depends
//! only on the two field vectors at that point, so every kernel here is a
//! pure per-index function mapped over the whole sample set with rayon.

use std::sync::Arc;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::core::error::{TiError, TiResult};

pub type Vec3 = [f64; 3];

/// Relative threshold under which `|E1 - E2|` is treated as zero.
const DIFF_EPSILON: f64 = 1e-12;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MeshKind {
    #[default]
    Volume,
    Surface,
}

/// Field solution of one electrode pair, one vector per node or element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSampleSet {
    #[serde(default)]
    pub mesh: MeshKind,
    pub indices: Vec<u64>,
    /// V/m, already scaled by the pair current.
    pub vectors: Vec<Vec3>,
    /// Outward surface normals, surface meshes only.
    #[serde(default)]
    pub normals: Option<Vec<Vec3>>,
    /// Tissue tag of each sample.
    #[serde(default)]
    pub tags: Option<Vec<u32>>,
}

impl FieldSampleSet {
    pub fn new(indices: Vec<u64>, vectors: Vec<Vec3>) -> Self {
        Self {
            mesh: MeshKind::Volume,
            indices,
            vectors,
            normals: None,
            tags: None,
        }
    }

    pub fn with_tags(mut self, tags: Vec<u32>) -> Self {
        self.tags = Some(tags);
        self
    }

    pub fn with_normals(mut self, normals: Vec<Vec3>) -> Self {
        self.mesh = MeshKind::Surface;
        self.normals = Some(normals);
        self
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    pub fn check_shape(&self) -> TiResult<()> {
        let n = self.indices.len();
        if self.vectors.len() != n {
            return Err(TiError::InputMismatch(format!(
                "{} indices but {} vectors",
                n,
                self.vectors.len()
            )));
        }
        if let Some(normals) = &self.normals
            && normals.len() != n
        {
            return Err(TiError::InputMismatch(format!(
                "{} indices but {} normals",
                n,
                normals.len()
            )));
        }
        if let Some(tags) = &self.tags
            && tags.len() != n
        {
            return Err(TiError::InputMismatch(format!(
                "{} indices but {} tissue tags",
                n,
                tags.len()
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvelopeResult {
    pub indices: Vec<u64>,
    pub envelope_max: Vec<f64>,
    #[serde(default)]
    pub envelope_normal: Option<Vec<f64>>,
    #[serde(default)]
    pub tags: Option<Vec<u32>>,
}

impl EnvelopeResult {
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    /// Keeps only samples whose tissue tag is in `tags`.
    pub fn restrict(&self, tags: &[u32]) -> TiResult<EnvelopeResult> {
        let own = self.tags.as_ref().ok_or_else(|| {
            TiError::InputMismatch("field samples carry no tissue tags".to_string())
        })?;
        let keep: Vec<usize> = own
            .iter()
            .enumerate()
            .filter(|(_, t)| tags.contains(*t))
            .map(|(i, _)| i)
            .collect();
        Ok(EnvelopeResult {
            indices: keep.iter().map(|&i| self.indices[i]).collect(),
            envelope_max: keep.iter().map(|&i| self.envelope_max[i]).collect(),
            envelope_normal: self
                .envelope_normal
                .as_ref()
                .map(|v| keep.iter().map(|&i| v[i]).collect()),
            tags: Some(keep.iter().map(|&i| own[i]).collect()),
        })
    }

    pub fn peak(&self) -> f64 {
        self.envelope_max.iter().copied().fold(0.0, f64::max)
    }
}

#[derive(Debug, Clone)]
pub struct MultipolarEnvelope {
    pub ab: EnvelopeResult,
    pub cd: EnvelopeResult,
    pub combined: EnvelopeResult,
}

/// Merges the AB and CD envelopes of a four-pair montage into the final
/// multipolar field.
pub trait MultipolarCombiner: Send + Sync {
    fn name(&self) -> &str;
    fn combine(&self, ab: &[f64], cd: &[f64]) -> Vec<f64>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ElementwiseMax;

impl MultipolarCombiner for ElementwiseMax {
    fn name(&self) -> &str {
        "elementwise_max"
    }

    fn combine(&self, ab: &[f64], cd: &[f64]) -> Vec<f64> {
        ab.par_iter().zip(cd.par_iter()).map(|(a, b)| a.max(*b)).collect()
    }
}

/// Any per-index rule can serve as a combiner.
pub struct PointwiseCombiner<F> {
    name: String,
    rule: F,
}

impl<F> PointwiseCombiner<F>
where
    F: Fn(f64, f64) -> f64 + Send + Sync,
{
    pub fn new(name: impl Into<String>, rule: F) -> Self {
        Self {
            name: name.into(),
            rule,
        }
    }
}

impl<F> MultipolarCombiner for PointwiseCombiner<F>
where
    F: Fn(f64, f64) -> f64 + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn combine(&self, ab: &[f64], cd: &[f64]) -> Vec<f64> {
        ab.par_iter()
            .zip(cd.par_iter())
            .map(|(a, b)| (self.rule)(*a, *b))
            .collect()
    }
}

#[derive(Clone)]
pub struct EnvelopeCalculator {
    combiner: Arc<dyn MultipolarCombiner>,
}

impl Default for EnvelopeCalculator {
    fn default() -> Self {
        Self::new(Arc::new(ElementwiseMax))
    }
}

impl std::fmt::Debug for EnvelopeCalculator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvelopeCalculator")
            .field("combiner", &self.combiner.name())
            .finish()
    }
}

impl EnvelopeCalculator {
    pub fn new(combiner: Arc<dyn MultipolarCombiner>) -> Self {
        Self { combiner }
    }

    pub fn combiner_name(&self) -> &str {
        self.combiner.name()
    }

    /// Envelope of two pair fields sampled at the same indices.
    pub fn two_field(&self, e1: &FieldSampleSet, e2: &FieldSampleSet) -> TiResult<EnvelopeResult> {
        e1.check_shape()?;
        e2.check_shape()?;
        if e1.indices != e2.indices {
            return Err(TiError::InputMismatch(format!(
                "index sets differ ({} vs {} samples)",
                e1.len(),
                e2.len()
            )));
        }

        let envelope_max: Vec<f64> = e1
            .vectors
            .par_iter()
            .zip(e2.vectors.par_iter())
            .map(|(a, b)| envelope_max(*a, *b))
            .collect();

        let envelope_normal = match (e1.mesh, &e1.normals) {
            (MeshKind::Surface, Some(normals)) => Some(
                e1.vectors
                    .par_iter()
                    .zip(e2.vectors.par_iter())
                    .zip(normals.par_iter())
                    .map(|((a, b), n)| envelope_along_normal(*a, *b, *n))
                    .collect(),
            ),
            _ => None,
        };

        Ok(EnvelopeResult {
            indices: e1.indices.clone(),
            envelope_max,
            envelope_normal,
            tags: e1.tags.clone().or_else(|| e2.tags.clone()),
        })
    }

    /// Four pair fields in order A, B, C, D.
    fn combine_checked(&self, ab: &[f64], cd: &[f64]) -> TiResult<Vec<f64>> {
        let combined = self.combiner.combine(ab, cd);
        if combined.len() != ab.len() {
            return Err(TiError::InputMismatch(format!(
                "combiner {} returned {} values for {} samples",
                self.combiner.name(),
                combined.len(),
                ab.len()
            )));
        }
        Ok(combined)
    }

    pub fn multipolar(&self, fields: &[FieldSampleSet]) -> TiResult<MultipolarEnvelope> {
        let [a, b, c, d] = fields else {
            return Err(TiError::InputMismatch(format!(
                "multipolar envelope needs 4 fields, got {}",
                fields.len()
            )));
        };
        let ab = self.two_field(a, b)?;
        let cd = self.two_field(c, d)?;
        if ab.indices != cd.indices {
            return Err(TiError::InputMismatch(
                "AB and CD envelopes cover different indices".to_string(),
            ));
        }

        let envelope_max = self.combine_checked(&ab.envelope_max, &cd.envelope_max)?;
        let envelope_normal = match (&ab.envelope_normal, &cd.envelope_normal) {
            (Some(x), Some(y)) => Some(self.combine_checked(x, y)?),
            _ => None,
        };
        let combined = EnvelopeResult {
            indices: ab.indices.clone(),
            envelope_max,
            envelope_normal,
            tags: ab.tags.clone(),
        };
        Ok(MultipolarEnvelope { ab, cd, combined })
    }
}

fn dot(a: Vec3, b: Vec3) -> f64 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

fn norm(a: Vec3) -> f64 {
    dot(a, a).sqrt()
}

fn cross(a: Vec3, b: Vec3) -> Vec3 {
    [
        a[1] * b[2] - a[2] * b[1],
        a[2] * b[0] - a[0] * b[2],
        a[0] * b[1] - a[1] * b[0],
    ]
}

fn sub(a: Vec3, b: Vec3) -> Vec3 {
    [a[0] - b[0], a[1] - b[1], a[2] - b[2]]
}

/// Maximum modulation depth of two superposed fields.
///
/// With `m = |E1| >= n = |E2|` (swapped otherwise):
/// - one field zero: `2 * max(m, n)`
/// - `cos(theta) >= n / m`: `2 * n`
/// - otherwise `2 * |E1 x E2| / |E1 - E2|`
///
/// `E2` is flipped first when the fields point into opposite half-spaces;
/// the envelope only depends on the unsigned angle between the two axes.
pub fn envelope_max(e1: Vec3, e2: Vec3) -> f64 {
    let (mut a, mut b) = (e1, e2);
    let (mut m, mut n) = (norm(a), norm(b));
    if m < n {
        std::mem::swap(&mut a, &mut b);
        std::mem::swap(&mut m, &mut n);
    }
    if n == 0.0 {
        return 2.0 * m;
    }
    if dot(a, b) < 0.0 {
        b = [-b[0], -b[1], -b[2]];
    }
    let cos = dot(a, b) / (m * n);
    if cos >= n / m {
        return 2.0 * n;
    }
    let diff = norm(sub(a, b));
    if diff <= DIFF_EPSILON * m {
        return 2.0 * n;
    }
    2.0 * norm(cross(a, b)) / diff
}

/// Envelope of the field components along `normal` (need not be unit).
pub fn envelope_along_normal(e1: Vec3, e2: Vec3, normal: Vec3) -> f64 {
    let len = norm(normal);
    if len == 0.0 {
        return 0.0;
    }
    let unit = [normal[0] / len, normal[1] / len, normal[2] / len];
    envelope_max([dot(e1, unit), 0.0, 0.0], [dot(e2, unit), 0.0, 0.0])
}
