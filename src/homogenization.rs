//! Volume and surface homogenization of micro fields.
//!
//! Every increment, each micro domain's volume is reconstructed from its
//! displaced node positions, domain-internal fields are integrated over that
//! volume, and the bounding surface is decomposed into regions associated
//! with the owning macro cell's faces. The per-domain results are then
//! interpolated to the cell's quadrature points for force and mass assembly.
//!
//! Failures here are recoverable per domain: a degenerate reconstruction
//! zeroes that domain's contribution for the increment and records a
//! warning; the increment itself continues.

use eyre::Result;
use itertools::izip;
use log::warn;
use nalgebra::{Matrix3, Point3, Vector3};
use ordered_float::OrderedFloat;
use rustc_hash::FxHashMap;

use crate::data::{IncrementSnapshot, MacroState};
use crate::dof::{CellId, NodeId};
use crate::mesh::{DomainIndex, MacroCell, MultiscaleMesh, HEX8_FACES};
use crate::reference::ReferenceState;
use crate::util::symmetric_part;
use crate::volume::VolumeReconstructor;

/// Reconstructed volumes below this are treated as degenerate.
const DEGENERATE_VOLUME: f64 = 1e-12;

/// Normal-alignment slack within which several faces count as candidates
/// for a surface patch.
const ALIGNMENT_TOLERANCE: f64 = 1e-6;

/// Distance slack (relative to the cell diameter) within which candidate
/// faces remain tied after the distance comparison.
const DISTANCE_TOLERANCE: f64 = 1e-6;

/// One macro-face-aligned region of a domain's bounding surface.
#[derive(Debug, Clone)]
pub struct SurfaceRegion {
    /// Index of the owning cell's face (0..6) this region is assigned to.
    pub face: usize,
    pub area: f64,
    /// Area-weighted centroid of the region's patches.
    pub centroid: Point3<f64>,
    /// The centroid projected onto the macro face plane along its normal.
    pub projected_centroid: Point3<f64>,
    /// Integrated traction (force) over the region.
    pub traction: Vector3<f64>,
    /// First moment of the traction about the domain center of mass.
    pub couple: Matrix3<f64>,
    /// Whether the assignment had to be split among tied candidate faces.
    pub ambiguous: bool,
}

/// Homogenized state of one micro domain for the current increment.
#[derive(Debug, Clone)]
pub struct HomogenizedDomain {
    pub domain: DomainIndex,
    /// Reconstructed volume.
    pub volume: f64,
    /// Total reconstructed surface area.
    pub surface_area: f64,
    /// Mass over reconstructed volume.
    pub density: f64,
    /// Current (displaced) center of mass.
    pub center_of_mass: Point3<f64>,
    /// Mass-weighted second moment per unit volume.
    pub micro_inertia: Matrix3<f64>,
    /// Volume-averaged micro stress.
    pub stress: Matrix3<f64>,
    /// Symmetric part of the homogenized micro stress.
    pub symmetric_stress: Matrix3<f64>,
    /// Mass-averaged body force (per unit mass).
    pub body_force: Vector3<f64>,
    /// Mass-averaged acceleration.
    pub acceleration: Vector3<f64>,
    /// First moment of the body force about the center of mass, per unit
    /// volume.
    pub body_couple: Matrix3<f64>,
    /// First moment of the inertial acceleration about the center of mass,
    /// per unit volume.
    pub micro_spin_inertia: Matrix3<f64>,
    pub regions: Vec<SurfaceRegion>,
}

/// Homogenized fields evaluated at one macro quadrature point.
#[derive(Debug, Clone)]
pub struct QuadraturePointState {
    /// Quadrature weight times the Jacobian determinant.
    pub weight: f64,
    pub position: Point3<f64>,
    pub density: f64,
    pub micro_inertia: Matrix3<f64>,
    pub stress: Matrix3<f64>,
    pub symmetric_stress: Matrix3<f64>,
    pub body_force: Vector3<f64>,
    pub body_couple: Matrix3<f64>,
    pub acceleration: Vector3<f64>,
    pub micro_spin_inertia: Matrix3<f64>,
}

/// Quadrature-point fields of one macro cell.
#[derive(Debug, Clone)]
pub struct CellQuadratureField {
    pub cell: CellId,
    /// Set when the nodal fit was rank deficient and the cell fell back to
    /// the volume-weighted domain average.
    pub fallback_average: bool,
    pub points: Vec<QuadraturePointState>,
}

/// The homogenized state of one increment.
#[derive(Debug, Clone)]
pub struct HomogenizedIncrement {
    /// Aligned with the mesh domain arena; `None` marks a domain excluded
    /// from this increment.
    pub domains: Vec<Option<HomogenizedDomain>>,
    /// One entry per macro cell, in mesh order.
    pub cells: Vec<CellQuadratureField>,
    /// Human-readable record of the per-domain geometry warnings.
    pub warnings: Vec<String>,
}

/// Current macro node positions: reference plus the displacement part of the
/// generalized DOF. Nodes without a supplied DOF vector stay at their
/// reference position.
pub fn macro_current_positions(macro_state: &MacroState) -> FxHashMap<NodeId, Point3<f64>> {
    macro_state
        .reference_positions
        .iter()
        .map(|(&node, &reference)| {
            let displacement = macro_state
                .dof
                .get(&node)
                .map(|dof| Vector3::new(dof[0], dof[1], dof[2]))
                .unwrap_or_else(Vector3::zeros);
            (node, reference + displacement)
        })
        .collect()
}

/// Runs the homogenization engine for one increment.
pub fn homogenize_increment(
    mesh: &MultiscaleMesh,
    reference: &ReferenceState,
    snapshot: &IncrementSnapshot,
    reconstructor: &dyn VolumeReconstructor,
) -> Result<HomogenizedIncrement> {
    let mut warnings = Vec::new();

    let mut current_micro_positions = FxHashMap::default();
    for domain in mesh.domains() {
        for &node in &domain.nodes {
            if !current_micro_positions.contains_key(&node) {
                current_micro_positions.insert(node, snapshot.micro.current_position(node)?);
            }
        }
    }
    let current_macro_positions = macro_current_positions(&snapshot.macro_state);

    let mut domains = Vec::with_capacity(mesh.num_domains());
    for (raw_index, domain) in mesh.domains().iter().enumerate() {
        let index = DomainIndex(raw_index);
        let cell = mesh
            .cell(domain.cell)
            .expect("mesh construction validated domain ownership");
        match homogenize_domain(index, cell, mesh, snapshot, &current_micro_positions, &current_macro_positions, reconstructor) {
            Ok(homogenized) => domains.push(Some(homogenized)),
            Err(err) => {
                let message = format!(
                    "micro domain '{}' of macro cell {} excluded from this increment: {err:#}",
                    domain.name, domain.cell
                );
                warn!("{message}");
                warnings.push(message);
                domains.push(None);
            }
        }
    }

    let mut cells = Vec::with_capacity(mesh.cells().len());
    for cell in mesh.cells() {
        cells.push(interpolate_to_quadrature_points(
            cell,
            mesh,
            reference,
            &domains,
            &current_macro_positions,
            &mut warnings,
        )?);
    }

    Ok(HomogenizedIncrement {
        domains,
        cells,
        warnings,
    })
}

#[allow(clippy::too_many_arguments)]
fn homogenize_domain(
    index: DomainIndex,
    cell: &MacroCell,
    mesh: &MultiscaleMesh,
    snapshot: &IncrementSnapshot,
    micro_positions: &FxHashMap<NodeId, Point3<f64>>,
    macro_positions: &FxHashMap<NodeId, Point3<f64>>,
    reconstructor: &dyn VolumeReconstructor,
) -> Result<HomogenizedDomain> {
    let domain = mesh.domain(index);
    let micro = &snapshot.micro;

    let volume = reconstructor.reconstruct(&domain.nodes, micro_positions)?;
    if volume.volume() <= DEGENERATE_VOLUME {
        return Err(crate::error::CouplingError::geometry(
            "homogenize_domain",
            format!("the reconstructed volume of domain '{}' is degenerate ({})", domain.name, volume.volume()),
        )
        .into());
    }

    // Volume integrals, weighted by the nodal volume fraction w·V.
    let mut mass = 0.0;
    let mut weighted_position = Vector3::zeros();
    for &node in &domain.nodes {
        mass += micro.node_mass(node)?;
        weighted_position += micro.node_mass(node)? * micro_positions[&node].coords;
    }
    let center_of_mass = Point3::from(weighted_position / mass);

    let mut micro_inertia = Matrix3::zeros();
    let mut stress = Matrix3::zeros();
    let mut body_force = Vector3::zeros();
    let mut acceleration = Vector3::zeros();
    let mut body_couple = Matrix3::zeros();
    let mut micro_spin_inertia = Matrix3::zeros();
    for &node in &domain.nodes {
        let node_mass = micro.node_mass(node)?;
        let node_volume = micro.node_volume(node)?;
        let xi = micro_positions[&node] - center_of_mass;

        micro_inertia += node_mass * xi * xi.transpose();
        stress += node_volume * micro.require("stress", &micro.stresses, node)?;

        let b = *micro.require("body force", &micro.body_forces, node)?;
        body_force += node_mass * b;
        body_couple += node_mass * b * xi.transpose();

        let a = *micro.require("acceleration", &micro.accelerations, node)?;
        acceleration += node_mass * a;
        micro_spin_inertia += node_mass * a * xi.transpose();
    }

    let reconstructed_volume = volume.volume();
    let stress = stress / reconstructed_volume;
    let homogenized = HomogenizedDomain {
        domain: index,
        volume: reconstructed_volume,
        surface_area: volume.surface_area(),
        density: mass / reconstructed_volume,
        center_of_mass,
        micro_inertia: micro_inertia / reconstructed_volume,
        stress,
        symmetric_stress: symmetric_part(&stress),
        body_force: body_force / mass,
        acceleration: acceleration / mass,
        body_couple: body_couple / reconstructed_volume,
        micro_spin_inertia: micro_spin_inertia / reconstructed_volume,
        regions: decompose_surface(cell, volume.as_ref(), &center_of_mass, micro, macro_positions)?,
    };
    Ok(homogenized)
}

/// Assigns every surface patch to a macro cell face and integrates
/// tractions and couples per region.
///
/// Nearest-face assignment compares outward normals first; candidates tied
/// within tolerance are separated by centroid-to-face distance; patches
/// still tied are split proportionally to their normal alignment and the
/// resulting regions are flagged ambiguous.
fn decompose_surface(
    cell: &MacroCell,
    volume: &dyn crate::volume::ReconstructedVolume,
    center_of_mass: &Point3<f64>,
    micro: &crate::data::MicroState,
    macro_positions: &FxHashMap<NodeId, Point3<f64>>,
) -> Result<Vec<SurfaceRegion>> {
    struct RegionAccumulator {
        area: f64,
        weighted_centroid: Vector3<f64>,
        traction: Vector3<f64>,
        couple: Matrix3<f64>,
        ambiguous: bool,
    }

    let faces: Vec<_> = (0..HEX8_FACES.len())
        .map(|face| cell.face_geometry(face, macro_positions))
        .collect::<Result<_>>()?;
    let diameter = faces
        .iter()
        .flat_map(|f| faces.iter().map(move |g| (f.centroid - g.centroid).norm()))
        .fold(0.0f64, f64::max)
        .max(1.0);

    let mut accumulators: Vec<Option<RegionAccumulator>> = (0..faces.len()).map(|_| None).collect();

    for patch in volume.patches() {
        // Mean nodal traction over the patch.
        let mut traction_density = Vector3::zeros();
        let mut supported = 0usize;
        for &node in &patch.nodes {
            let weight = *micro.require("weight", &micro.weights, node)?;
            traction_density += weight * *micro.require("surface force", &micro.surface_forces, node)?;
            supported += 1;
        }
        if supported > 0 {
            traction_density /= supported as f64;
        }
        let patch_force = patch.area * traction_density;

        let alignments: Vec<f64> = faces.iter().map(|f| patch.normal.dot(&f.normal)).collect();
        let best_alignment = alignments.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let mut candidates: Vec<usize> = (0..faces.len())
            .filter(|&f| best_alignment - alignments[f] <= ALIGNMENT_TOLERANCE)
            .collect();

        if candidates.len() > 1 {
            let distance = |f: usize| {
                let face: &crate::mesh::FaceGeometry = &faces[f];
                ((patch.centroid - face.centroid).dot(&face.normal)).abs()
            };
            let nearest = candidates
                .iter()
                .copied()
                .min_by_key(|&f| OrderedFloat(distance(f)))
                .expect("at least one candidate");
            let nearest_distance = distance(nearest);
            candidates.retain(|&f| distance(f) - nearest_distance <= DISTANCE_TOLERANCE * diameter);
        }

        let ambiguous = candidates.len() > 1;
        if ambiguous {
            warn!(
                "surface patch of a domain in macro cell {} is equidistant from faces {candidates:?}; splitting its traction",
                cell.id
            );
        }
        let alignment_total: f64 = candidates.iter().map(|&f| alignments[f].max(0.0)).sum();

        for &face in &candidates {
            let fraction = if ambiguous {
                if alignment_total > 0.0 {
                    alignments[face].max(0.0) / alignment_total
                } else {
                    1.0 / candidates.len() as f64
                }
            } else {
                1.0
            };

            let slot = accumulators[face].get_or_insert_with(|| RegionAccumulator {
                area: 0.0,
                weighted_centroid: Vector3::zeros(),
                traction: Vector3::zeros(),
                couple: Matrix3::zeros(),
                ambiguous: false,
            });
            slot.area += fraction * patch.area;
            slot.weighted_centroid += fraction * patch.area * patch.centroid.coords;
            let force = fraction * patch_force;
            slot.traction += force;
            slot.couple += force * (patch.centroid - center_of_mass).transpose();
            slot.ambiguous |= ambiguous;
        }
    }

    let mut regions = Vec::new();
    for (face, accumulator) in accumulators.into_iter().enumerate() {
        let Some(accumulator) = accumulator else {
            continue;
        };
        if accumulator.area <= 0.0 {
            continue;
        }
        let centroid = Point3::from(accumulator.weighted_centroid / accumulator.area);
        let geometry = &faces[face];
        let offset = (centroid - geometry.centroid).dot(&geometry.normal);
        regions.push(SurfaceRegion {
            face,
            area: accumulator.area,
            centroid,
            projected_centroid: centroid - offset * geometry.normal,
            traction: accumulator.traction,
            couple: accumulator.couple,
            ambiguous: accumulator.ambiguous,
        });
    }
    Ok(regions)
}

/// Number of scalar components interpolated per domain sample.
const FIELD_COMPONENTS: usize = 1 + 9 + 9 + 3 + 9 + 3 + 9;

fn pack_fields(domain: &HomogenizedDomain) -> [f64; FIELD_COMPONENTS] {
    let mut packed = [0.0; FIELD_COMPONENTS];
    let mut cursor = 0;
    packed[cursor] = domain.density;
    cursor += 1;
    for matrix in [&domain.micro_inertia, &domain.stress] {
        for i in 0..3 {
            for j in 0..3 {
                packed[cursor] = matrix[(i, j)];
                cursor += 1;
            }
        }
    }
    for i in 0..3 {
        packed[cursor] = domain.body_force[i];
        cursor += 1;
    }
    for i in 0..3 {
        for j in 0..3 {
            packed[cursor] = domain.body_couple[(i, j)];
            cursor += 1;
        }
    }
    for i in 0..3 {
        packed[cursor] = domain.acceleration[i];
        cursor += 1;
    }
    for i in 0..3 {
        for j in 0..3 {
            packed[cursor] = domain.micro_spin_inertia[(i, j)];
            cursor += 1;
        }
    }
    packed
}

fn unpack_fields(packed: &[f64], weight: f64, position: Point3<f64>) -> QuadraturePointState {
    let mut cursor = 0;
    let density = packed[cursor];
    cursor += 1;
    let mut read_matrix = |cursor: &mut usize| {
        let matrix = Matrix3::from_fn(|i, j| packed[*cursor + 3 * i + j]);
        *cursor += 9;
        matrix
    };
    let micro_inertia = read_matrix(&mut cursor);
    let stress = read_matrix(&mut cursor);
    let body_force = Vector3::new(packed[cursor], packed[cursor + 1], packed[cursor + 2]);
    cursor += 3;
    let body_couple = read_matrix(&mut cursor);
    let acceleration = Vector3::new(packed[cursor], packed[cursor + 1], packed[cursor + 2]);
    cursor += 3;
    let micro_spin_inertia = read_matrix(&mut cursor);

    QuadraturePointState {
        weight,
        position,
        density,
        micro_inertia,
        stress,
        symmetric_stress: symmetric_part(&stress),
        body_force,
        body_couple,
        acceleration,
        micro_spin_inertia,
    }
}

/// Interpolates the per-domain homogenized fields of a cell to its 2×2×2
/// quadrature points.
///
/// Nodal values are fit from the domain center-of-mass samples through the
/// cell's shape functions (least squares); a rank-deficient fit falls back
/// to the volume-weighted domain average at every quadrature point.
fn interpolate_to_quadrature_points(
    cell: &MacroCell,
    mesh: &MultiscaleMesh,
    reference: &ReferenceState,
    domains: &[Option<HomogenizedDomain>],
    macro_positions: &FxHashMap<NodeId, Point3<f64>>,
    warnings: &mut Vec<String>,
) -> Result<CellQuadratureField> {
    use nalgebra::DMatrix;

    let samples: Vec<&HomogenizedDomain> = cell
        .domains
        .iter()
        .filter_map(|&index| domains[index.0].as_ref())
        .collect();

    if samples.is_empty() {
        if !cell.domains.is_empty() {
            let message = format!("macro cell {} has no usable homogenized domains this increment", cell.id);
            warn!("{message}");
            warnings.push(message);
        }
        return Ok(CellQuadratureField {
            cell: cell.id,
            fallback_average: false,
            points: Vec::new(),
        });
    }

    let element = cell.element(macro_positions)?;
    let quadrature = element.quadrature();

    // Least-squares fit of nodal values to the domain samples.
    let mut design = DMatrix::zeros(samples.len(), 8);
    let mut observations = DMatrix::zeros(samples.len(), FIELD_COMPONENTS);
    for (row, sample) in samples.iter().enumerate() {
        let shape = &reference.domain(sample.domain).shape_functions;
        for a in 0..8 {
            design[(row, a)] = shape[a];
        }
        for (column, value) in pack_fields(sample).into_iter().enumerate() {
            observations[(row, column)] = value;
        }
    }

    let normal = design.transpose() * &design;
    let nodal_values = crate::util::well_conditioned_cholesky(normal, 1e-7)
        .map(|cholesky| cholesky.solve(&(design.transpose() * &observations)));
    let fallback_average = nodal_values.is_none();
    if fallback_average {
        let message = format!(
            "the shape-function fit for macro cell {} is rank deficient; falling back to the domain average",
            cell.id
        );
        warn!("{message}");
        warnings.push(message);
    }

    // Volume-weighted average fallback.
    let total_volume: f64 = samples.iter().map(|s| s.volume).sum();
    let mut average = [0.0; FIELD_COMPONENTS];
    for sample in &samples {
        for (slot, value) in izip!(average.iter_mut(), pack_fields(sample)) {
            *slot += sample.volume / total_volume * value;
        }
    }

    let mut points = Vec::with_capacity(quadrature.len());
    for (w, xi) in quadrature.iter() {
        let jacobian = element.reference_jacobian(xi);
        let weight = w * jacobian.determinant().abs();
        let position = element.map_reference_coords(xi);

        let packed: Vec<f64> = match &nodal_values {
            Some(nodal) => {
                let basis = element.evaluate_basis(xi);
                (0..FIELD_COMPONENTS)
                    .map(|c| (0..8).map(|a| basis[a] * nodal[(a, c)]).sum::<f64>())
                    .collect()
            }
            None => average.to_vec(),
        };
        points.push(unpack_fields(&packed, weight, position));
    }

    Ok(CellQuadratureField {
        cell: cell.id,
        fallback_average,
        points,
    })
}
