//! Multiscale mesh topology: macro cells, their faces, and micro domains.
//!
//! Micro-domain records live in a flat arena indexed by [`DomainIndex`];
//! the `(cell id, domain name)` lookup is resolved once at construction so
//! the numerical pipeline never hashes strings.

use eyre::Result;
use nalgebra::{Point3, Vector3};
use rustc_hash::{FxHashMap, FxHashSet};

use crate::dof::{CellId, NodeId};
use crate::element::Hex8Element;
use crate::error::CouplingError;

/// Free cells/domains are independently solved; ghost ones are derived from
/// the other scale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DomainKind {
    Free,
    Ghost,
}

/// Compact index of a micro domain in the mesh arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DomainIndex(pub usize);

/// One face of a hexahedral macro cell: the local vertex ids in outward
/// (counter-clockwise seen from outside) order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HexFace {
    pub local_nodes: [usize; 4],
}

/// The six faces of a Hex8 cell, ordered −ζ, +ζ, −η, +η, −ξ, +ξ.
pub const HEX8_FACES: [HexFace; 6] = [
    HexFace { local_nodes: [0, 3, 2, 1] },
    HexFace { local_nodes: [4, 5, 6, 7] },
    HexFace { local_nodes: [0, 1, 5, 4] },
    HexFace { local_nodes: [3, 7, 6, 2] },
    HexFace { local_nodes: [0, 4, 7, 3] },
    HexFace { local_nodes: [1, 2, 6, 5] },
];

/// A macro finite element cell.
#[derive(Debug, Clone)]
pub struct MacroCell {
    pub id: CellId,
    pub kind: DomainKind,
    /// Ordered macro node ids (Hex8 connectivity).
    pub connectivity: [NodeId; 8],
    /// Arena indices of the micro domains owned by this cell.
    pub domains: Vec<DomainIndex>,
}

impl MacroCell {
    /// Builds the cell's element from per-node positions.
    pub fn element(&self, positions: &FxHashMap<NodeId, Point3<f64>>) -> Result<Hex8Element> {
        let mut vertices = [Point3::origin(); 8];
        for (vertex, node) in vertices.iter_mut().zip(&self.connectivity) {
            *vertex = *positions.get(node).ok_or_else(|| {
                CouplingError::io(
                    "MacroCell::element",
                    format!("no position supplied for macro node {node} of cell {}", self.id),
                )
            })?;
        }
        Ok(Hex8Element::from_vertices(vertices))
    }

    /// Area-weighted outward normal and centroid of one face in global
    /// coordinates.
    pub fn face_geometry(&self, face: usize, positions: &FxHashMap<NodeId, Point3<f64>>) -> Result<FaceGeometry> {
        let local = HEX8_FACES[face].local_nodes;
        let mut corners = [Point3::origin(); 4];
        for (corner, &l) in corners.iter_mut().zip(&local) {
            let node = self.connectivity[l];
            *corner = *positions.get(&node).ok_or_else(|| {
                CouplingError::io(
                    "MacroCell::face_geometry",
                    format!("no position supplied for macro node {node} of cell {}", self.id),
                )
            })?;
        }

        let centroid = Point3::from((corners[0].coords + corners[1].coords + corners[2].coords + corners[3].coords) / 4.0);
        // Half the cross product of the diagonals is the area vector of a
        // (possibly warped) quadrilateral.
        let area_vector = 0.5 * (corners[2] - corners[0]).cross(&(corners[3] - corners[1]));
        let area = area_vector.norm();
        let normal = if area > 0.0 { area_vector / area } else { Vector3::zeros() };
        Ok(FaceGeometry { area, centroid, normal })
    }
}

/// Global-coordinate geometry of one macro cell face.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FaceGeometry {
    pub area: f64,
    pub centroid: Point3<f64>,
    pub normal: Vector3<f64>,
}

/// A named micro-node subset owned by one macro cell.
#[derive(Debug, Clone)]
pub struct MicroDomain {
    pub name: String,
    pub cell: CellId,
    pub kind: DomainKind,
    pub nodes: Vec<NodeId>,
}

/// Macro cells plus the micro-domain arena and its lookup tables.
#[derive(Debug, Clone, Default)]
pub struct MultiscaleMesh {
    cells: Vec<MacroCell>,
    domains: Vec<MicroDomain>,
    cell_index: FxHashMap<CellId, usize>,
    domain_index: FxHashMap<(CellId, String), DomainIndex>,
}

impl MultiscaleMesh {
    /// Wires cells and domains together, validating the ownership invariants:
    /// every domain's owning cell exists, domain names are unique per cell,
    /// and a micro node joins at most one domain per macro cell.
    pub fn from_parts(mut cells: Vec<MacroCell>, domains: Vec<MicroDomain>) -> Result<Self> {
        let op = "MultiscaleMesh::from_parts";

        let mut cell_index = FxHashMap::default();
        for (index, cell) in cells.iter_mut().enumerate() {
            cell.domains.clear();
            if cell_index.insert(cell.id, index).is_some() {
                return Err(CouplingError::configuration(op, format!("duplicate macro cell id {}", cell.id)).into());
            }
        }

        let mut domain_index = FxHashMap::default();
        let mut cell_nodes: FxHashMap<CellId, FxHashSet<NodeId>> = FxHashMap::default();
        for (raw_index, domain) in domains.iter().enumerate() {
            let index = DomainIndex(raw_index);
            let cell_slot = *cell_index.get(&domain.cell).ok_or_else(|| {
                CouplingError::configuration(
                    op,
                    format!("micro domain '{}' references unknown macro cell {}", domain.name, domain.cell),
                )
            })?;

            if domain_index.insert((domain.cell, domain.name.clone()), index).is_some() {
                return Err(CouplingError::configuration(
                    op,
                    format!("micro domain '{}' appears more than once in macro cell {}", domain.name, domain.cell),
                )
                .into());
            }

            let seen = cell_nodes.entry(domain.cell).or_default();
            for &node in &domain.nodes {
                if !seen.insert(node) {
                    return Err(CouplingError::configuration(
                        op,
                        format!(
                            "micro node {node} belongs to more than one domain of macro cell {} ('{}' among them)",
                            domain.cell, domain.name
                        ),
                    )
                    .into());
                }
            }

            cells[cell_slot].domains.push(index);
        }

        Ok(Self {
            cells,
            domains,
            cell_index,
            domain_index,
        })
    }

    pub fn cells(&self) -> &[MacroCell] {
        &self.cells
    }

    pub fn domains(&self) -> &[MicroDomain] {
        &self.domains
    }

    pub fn num_domains(&self) -> usize {
        self.domains.len()
    }

    pub fn cell(&self, id: CellId) -> Option<&MacroCell> {
        self.cell_index.get(&id).map(|&index| &self.cells[index])
    }

    pub fn domain(&self, index: DomainIndex) -> &MicroDomain {
        &self.domains[index.0]
    }

    /// Resolves a `(cell, domain name)` pair to its arena index.
    pub fn domain_by_name(&self, cell: CellId, name: &str) -> Option<DomainIndex> {
        self.domain_index.get(&(cell, name.to_owned())).copied()
    }

    /// Cells of the given kind, in construction order.
    pub fn cells_of_kind(&self, kind: DomainKind) -> impl Iterator<Item = &MacroCell> {
        self.cells.iter().filter(move |cell| cell.kind == kind)
    }
}
