//! Shared fixtures: a two-cell macro mesh (one free, one ghost) with eight
//! octant micro domains per cell, mirroring the canonical overlap-coupling
//! test configuration.
#![allow(dead_code)] // each test binary uses a different subset
//!
//! Geometry: the free macro cell is the unit cube [0,1]³, the ghost cell is
//! stacked on top of it ([0,1]²×[1,2]). Each cell's micro material is
//! partitioned into eight 0.5-cubes ("octants"); each octant domain carries
//! its own eight corner nodes with nodal volume 0.125/8, density 2 and
//! weight 1, so every domain has volume 0.125 and mass 0.25.

use nalgebra::{Matrix3, Point3, Vector3};

use micromorph::data::{IncrementSnapshot, InMemoryMultiscaleData, MacroState, MicroState};
use micromorph::dof::NodeId;
use micromorph::mesh::{DomainKind, MacroCell, MicroDomain, MultiscaleMesh};

pub const MICRO_DENSITY: f64 = 2.0;
pub const NODE_VOLUME: f64 = 0.125 / 8.0;
pub const DOMAIN_VOLUME: f64 = 0.125;
pub const DOMAIN_MASS: f64 = MICRO_DENSITY * DOMAIN_VOLUME;
pub const BODY_FORCE: [f64; 3] = [-1.0, -2.0, -3.0];
pub const SURFACE_FORCE: [f64; 3] = [1.0, 1.0, 1.0];

pub const FREE_CELL: usize = 1;
pub const GHOST_CELL: usize = 2;

/// Builds the macro mesh, the micro domains and a zero-motion snapshot.
pub fn two_cell_fixture() -> (MultiscaleMesh, IncrementSnapshot) {
    let macro_positions: Vec<Point3<f64>> = vec![
        // Free cell, bottom face then top face.
        Point3::new(0.0, 0.0, 0.0),
        Point3::new(1.0, 0.0, 0.0),
        Point3::new(1.0, 1.0, 0.0),
        Point3::new(0.0, 1.0, 0.0),
        Point3::new(0.0, 0.0, 1.0),
        Point3::new(1.0, 0.0, 1.0),
        Point3::new(1.0, 1.0, 1.0),
        Point3::new(0.0, 1.0, 1.0),
        // Ghost cell top face.
        Point3::new(0.0, 0.0, 2.0),
        Point3::new(1.0, 0.0, 2.0),
        Point3::new(1.0, 1.0, 2.0),
        Point3::new(0.0, 1.0, 2.0),
    ];

    let cells = vec![
        MacroCell {
            id: FREE_CELL,
            kind: DomainKind::Free,
            connectivity: [0, 1, 2, 3, 4, 5, 6, 7],
            domains: Vec::new(),
        },
        MacroCell {
            id: GHOST_CELL,
            kind: DomainKind::Ghost,
            connectivity: [4, 5, 6, 7, 8, 9, 10, 11],
            domains: Vec::new(),
        },
    ];

    let mut micro = MicroState::default();
    let mut domains = Vec::new();
    let mut ghost_micro_nodes = Vec::new();
    let mut free_micro_nodes = Vec::new();
    let mut next_node: NodeId = 100;

    for (cell, base_z, domain_kind, prefix) in [
        (FREE_CELL, 0.0, DomainKind::Ghost, "ghost"),
        (GHOST_CELL, 1.0, DomainKind::Free, "free"),
    ] {
        let mut octant = 0;
        for k in 0..2 {
            for j in 0..2 {
                for i in 0..2 {
                    octant += 1;
                    let corner = Vector3::new(0.5 * i as f64, 0.5 * j as f64, base_z + 0.5 * k as f64);
                    let mut nodes = Vec::with_capacity(8);
                    for dz in 0..2 {
                        for dy in 0..2 {
                            for dx in 0..2 {
                                let node = next_node;
                                next_node += 1;
                                let position = Point3::from(
                                    corner + Vector3::new(0.5 * dx as f64, 0.5 * dy as f64, 0.5 * dz as f64),
                                );
                                micro.reference_positions.insert(node, position);
                                micro.displacements.insert(node, Vector3::zeros());
                                micro.velocities.insert(node, Vector3::zeros());
                                micro.accelerations.insert(node, Vector3::zeros());
                                micro.densities.insert(node, MICRO_DENSITY);
                                micro.volumes.insert(node, NODE_VOLUME);
                                micro.weights.insert(node, 1.0);
                                micro.body_forces.insert(node, Vector3::from_row_slice(&BODY_FORCE));
                                micro.surface_forces.insert(node, Vector3::from_row_slice(&SURFACE_FORCE));
                                micro
                                    .stresses
                                    .insert(node, Matrix3::from_row_slice(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0]));
                                nodes.push(node);
                                match domain_kind {
                                    DomainKind::Ghost => ghost_micro_nodes.push(node),
                                    DomainKind::Free => free_micro_nodes.push(node),
                                }
                            }
                        }
                    }
                    domains.push(MicroDomain {
                        name: format!("{prefix}_nodeset_{octant}"),
                        cell,
                        kind: domain_kind,
                        nodes,
                    });
                }
            }
        }
    }

    let mesh = MultiscaleMesh::from_parts(cells, domains).expect("fixture mesh is valid");

    let mut macro_state = MacroState::default();
    for (node, position) in macro_positions.iter().enumerate() {
        macro_state.reference_positions.insert(node, *position);
        macro_state.dof.insert(node, micromorph::data::MacroDof::zeros());
        macro_state.velocities.insert(node, micromorph::data::MacroDof::zeros());
        macro_state.accelerations.insert(node, micromorph::data::MacroDof::zeros());
    }

    let snapshot = IncrementSnapshot {
        time: 0.0,
        micro,
        macro_state,
        free_micro_nodes,
        ghost_micro_nodes,
        free_macro_nodes: (0..8).collect(),
        ghost_macro_nodes: (8..12).collect(),
    };

    (mesh, snapshot)
}

/// The fixture wrapped in the in-memory data collaborator, with the same
/// snapshot repeated for `num_increments` increments.
pub fn two_cell_data(num_increments: usize) -> InMemoryMultiscaleData {
    let (mesh, snapshot) = two_cell_fixture();
    InMemoryMultiscaleData::new(mesh, vec![snapshot; num_increments])
}

