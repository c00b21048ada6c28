//! The volume-reconstruction collaborator.
//!
//! Turning a micro domain's point cloud into a closed volume (dual
//! contouring or equivalent) is external; this module fixes the contract the
//! homogenization engine consumes: total volume, total surface area, an
//! iteration surface of patches with area/centroid/normal and the micro
//! nodes supported on them, and point containment.
//!
//! [`AabbReconstructor`] is a deliberately simple baseline (the axis-aligned
//! bounding box of the domain's nodes), adequate for box-like domains and
//! for exercising the engine without the real reconstructor.

use eyre::Result;
use nalgebra::{Point3, Vector3};
use rustc_hash::FxHashMap;

use crate::dof::NodeId;
use crate::error::CouplingError;

/// One flat piece of a reconstructed bounding surface.
#[derive(Debug, Clone)]
pub struct SurfacePatch {
    pub area: f64,
    pub centroid: Point3<f64>,
    /// Outward unit normal.
    pub normal: Vector3<f64>,
    /// Micro nodes whose surface tractions act through this patch.
    pub nodes: Vec<NodeId>,
}

/// A closed volume reconstructed from a micro domain's node positions.
pub trait ReconstructedVolume: std::fmt::Debug {
    fn volume(&self) -> f64;

    /// Total bounding-surface area; equals the sum of the patch areas.
    fn surface_area(&self) -> f64;

    fn patches(&self) -> &[SurfacePatch];

    fn contains(&self, point: &Point3<f64>) -> bool;
}

/// Builds [`ReconstructedVolume`]s from current micro node positions.
pub trait VolumeReconstructor {
    fn reconstruct(
        &self,
        nodes: &[NodeId],
        positions: &FxHashMap<NodeId, Point3<f64>>,
    ) -> Result<Box<dyn ReconstructedVolume>>;
}

/// Axis-aligned bounding-box reconstruction.
#[derive(Debug, Clone, Default)]
pub struct AabbReconstructor {
    /// Uniform padding added on every side of the box.
    pub padding: f64,
}

impl AabbReconstructor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_padding(padding: f64) -> Self {
        Self { padding }
    }
}

/// The box volume produced by [`AabbReconstructor`].
#[derive(Debug, Clone)]
pub struct AabbVolume {
    min: Point3<f64>,
    max: Point3<f64>,
    patches: Vec<SurfacePatch>,
}

impl AabbVolume {
    /// Tolerance for deciding that a node lies on a box face, relative to
    /// the box diagonal.
    const FACE_TOLERANCE: f64 = 1e-9;

    fn from_nodes(nodes: &[NodeId], positions: &FxHashMap<NodeId, Point3<f64>>, padding: f64) -> Result<Self> {
        let op = "AabbVolume::from_nodes";
        if nodes.is_empty() {
            return Err(CouplingError::geometry(op, "cannot reconstruct a volume from an empty node set").into());
        }

        let mut min = Point3::new(f64::INFINITY, f64::INFINITY, f64::INFINITY);
        let mut max = Point3::new(f64::NEG_INFINITY, f64::NEG_INFINITY, f64::NEG_INFINITY);
        for &node in nodes {
            let p = positions
                .get(&node)
                .ok_or_else(|| CouplingError::io(op, format!("no position supplied for micro node {node}")))?;
            for i in 0..3 {
                min[i] = min[i].min(p[i]);
                max[i] = max[i].max(p[i]);
            }
        }
        for i in 0..3 {
            min[i] -= padding;
            max[i] += padding;
        }

        let extents = max - min;
        let diagonal = extents.norm();
        if extents.iter().any(|&e| e <= diagonal * Self::FACE_TOLERANCE) || diagonal == 0.0 {
            return Err(CouplingError::geometry(
                op,
                format!("the reconstructed box is degenerate (extents {:?})", extents),
            )
            .into());
        }

        let tolerance = diagonal * Self::FACE_TOLERANCE;
        let center = Point3::from((min.coords + max.coords) / 2.0);
        let mut patches = Vec::with_capacity(6);
        for axis in 0..3 {
            let u = (axis + 1) % 3;
            let v = (axis + 2) % 3;
            let area = extents[u] * extents[v];
            for (side, plane) in [(-1.0, min[axis]), (1.0, max[axis])] {
                let mut normal = Vector3::zeros();
                normal[axis] = side;
                let mut centroid = center;
                centroid[axis] = plane;
                let face_nodes = nodes
                    .iter()
                    .copied()
                    .filter(|node| {
                        positions
                            .get(node)
                            .map(|p| (p[axis] - plane).abs() <= tolerance.max(padding + tolerance))
                            .unwrap_or(false)
                    })
                    .collect();
                patches.push(SurfacePatch {
                    area,
                    centroid,
                    normal,
                    nodes: face_nodes,
                });
            }
        }

        Ok(Self { min, max, patches })
    }
}

impl ReconstructedVolume for AabbVolume {
    fn volume(&self) -> f64 {
        let extents = self.max - self.min;
        extents[0] * extents[1] * extents[2]
    }

    fn surface_area(&self) -> f64 {
        self.patches.iter().map(|patch| patch.area).sum()
    }

    fn patches(&self) -> &[SurfacePatch] {
        &self.patches
    }

    fn contains(&self, point: &Point3<f64>) -> bool {
        (0..3).all(|i| point[i] >= self.min[i] && point[i] <= self.max[i])
    }
}

impl VolumeReconstructor for AabbReconstructor {
    fn reconstruct(
        &self,
        nodes: &[NodeId],
        positions: &FxHashMap<NodeId, Point3<f64>>,
    ) -> Result<Box<dyn ReconstructedVolume>> {
        let volume = AabbVolume::from_nodes(nodes, positions, self.padding)?;
        Ok(Box::new(volume))
    }
}
