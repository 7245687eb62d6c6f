//! Parameters handed to the mesh worker, computed from mesh statistics and the
//! selected profile. Nothing in here edits geometry.

use serde::Deserialize;
use tracing::warn;

use crate::config::Profile;

/// Numeric thresholds that are tuned per deployment rather than fixed.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Tuning {
    /// Weld distance for merge-by-distance, in model units.
    pub merge_distance: f32,
    /// Lowest decimation ratio ever requested from the worker.
    pub min_decimation_ratio: f64,
    pub matte_roughness: f32,
    pub matte_coat_weight: f32,
    pub matte_subsurface_weight: f32,
    /// Simplification ratio passed to the compressor.
    pub compressor_simplify_ratio: f32,
}

impl Default for Tuning {
    fn default() -> Self {
        Self {
            merge_distance: 0.001,
            min_decimation_ratio: 0.05,
            matte_roughness: 0.8,
            matte_coat_weight: 0.05,
            matte_subsurface_weight: 0.0,
            compressor_simplify_ratio: 0.5,
        }
    }
}

impl Tuning {
    pub fn check(&self) -> Result<(), String> {
        if !self.merge_distance.is_finite() || self.merge_distance < 0.0 {
            return Err(format!("merge_distance must be >= 0, got {}", self.merge_distance));
        }
        if !(self.min_decimation_ratio > 0.0 && self.min_decimation_ratio <= 1.0) {
            return Err(format!(
                "min_decimation_ratio must be in (0, 1], got {}",
                self.min_decimation_ratio
            ));
        }
        for (name, v) in [
            ("matte_roughness", self.matte_roughness),
            ("matte_coat_weight", self.matte_coat_weight),
            ("matte_subsurface_weight", self.matte_subsurface_weight),
            ("compressor_simplify_ratio", self.compressor_simplify_ratio),
        ] {
            if !(0.0..=1.0).contains(&v) {
                return Err(format!("{name} must be in [0, 1], got {v}"));
            }
        }
        Ok(())
    }
}

/// Fraction of vertices to keep, or `None` when no decimation is needed.
///
/// `floor` stops an aggressive target from collapsing the mesh below that
/// share of its density.
pub fn decimation_ratio(current: u64, target: u64, floor: f64) -> Option<f64> {
    if target == 0 || current <= target {
        return None;
    }
    Some((target as f64 / current as f64).max(floor))
}

/// Lowest world-space Z; the mesh is moved by its negation to sit on Z = 0.
pub fn floor_offset(points: impl IntoIterator<Item = [f32; 3]>) -> Option<f32> {
    points.into_iter().map(|p| p[2]).reduce(f32::min)
}

/// Uniform factor that brings the largest dimension to one unit.
pub fn normalization_scale(dimensions: [f32; 3]) -> Option<f32> {
    let max = dimensions.into_iter().fold(0.0f32, f32::max);
    (max > 0.0).then(|| 1.0 / max)
}

/// New size for a texture larger than `max_edge` on either axis.
///
/// Both axes share one factor, so the aspect ratio is kept.
pub fn texture_target(width: u32, height: u32, max_edge: u32) -> Option<(u32, u32)> {
    if max_edge == 0 || (width <= max_edge && height <= max_edge) {
        return None;
    }
    let scale = f64::from(max_edge) / f64::from(width.max(height));
    let w = (f64::from(width) * scale).round().max(1.0) as u32;
    let h = (f64::from(height) * scale).round().max(1.0) as u32;
    Some((w, h))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextureResize {
    pub image: String,
    pub from: (u32, u32),
    pub to: (u32, u32),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ManifoldReport {
    /// Edges used by exactly one face.
    pub boundary_edges: usize,
    /// Edges shared by more than two faces.
    pub non_manifold_edges: usize,
}

impl ManifoldReport {
    pub fn from_triangles(triangles: impl IntoIterator<Item = [u32; 3]>) -> Self {
        use std::collections::HashMap;

        let mut edges: HashMap<(u32, u32), u32> = HashMap::new();
        for [a, b, c] in triangles {
            for (u, v) in [(a, b), (b, c), (c, a)] {
                if u == v {
                    continue;
                }
                *edges.entry((u.min(v), u.max(v))).or_default() += 1;
            }
        }

        let mut report = ManifoldReport::default();
        for count in edges.into_values() {
            match count {
                1 => report.boundary_edges += 1,
                2 => {}
                _ => report.non_manifold_edges += 1,
            }
        }
        report
    }

    pub fn is_manifold(&self) -> bool {
        self.boundary_edges == 0 && self.non_manifold_edges == 0
    }

    /// Logs non-manifold geometry. Repair is left alone since it breaks UV
    /// continuity.
    pub fn flag(&self, object: &str) -> bool {
        if self.is_manifold() {
            return false;
        }
        warn!(
            object,
            boundary_edges = self.boundary_edges,
            non_manifold_edges = self.non_manifold_edges,
            "non-manifold geometry, skipping destructive repair"
        );
        true
    }
}

/// Vertex count and axis-aligned bounds in host space (Z up).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MeshStats {
    pub vertex_count: u64,
    pub min: [f32; 3],
    pub max: [f32; 3],
}

impl MeshStats {
    /// `None` when there are no points.
    pub fn from_points(points: &[[f32; 3]]) -> Option<Self> {
        let (first, rest) = points.split_first()?;
        let (mut min, mut max) = (*first, *first);
        for p in rest {
            for axis in 0..3 {
                min[axis] = min[axis].min(p[axis]);
                max[axis] = max[axis].max(p[axis]);
            }
        }
        Some(Self {
            vertex_count: points.len() as u64,
            min,
            max,
        })
    }

    pub fn dimensions(&self) -> [f32; 3] {
        [
            self.max[0] - self.min[0],
            self.max[1] - self.min[1],
            self.max[2] - self.min[2],
        ]
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Directives {
    pub merge_distance: f32,
    pub decimation_ratio: Option<f64>,
    pub floor_offset: f32,
    pub normalization_scale: Option<f32>,
}

/// Everything the worker is told about one joined mesh, given its welded
/// world-space points. `None` for an empty mesh.
pub fn directives(points: &[[f32; 3]], profile: &Profile, tuning: &Tuning) -> Option<Directives> {
    let floor_offset = floor_offset(points.iter().copied())?;
    let stats = MeshStats::from_points(points)?;

    Some(Directives {
        merge_distance: tuning.merge_distance,
        decimation_ratio: decimation_ratio(
            stats.vertex_count,
            profile.target_vertices,
            tuning.min_decimation_ratio,
        ),
        floor_offset,
        normalization_scale: if profile.normalize {
            normalization_scale(stats.dimensions())
        } else {
            None
        },
    })
}
