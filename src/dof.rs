//! Degree-of-freedom maps.
//!
//! Sparse and dense matrices are addressed by dense local indices, not by
//! global node ids: a [`DofMap`] is the bijection between the two for one
//! node set. There is one map per (scale, free/ghost) combination, so the
//! four block operators of the projector and the assembled system vectors
//! all agree on their index spaces.

use eyre::Result;
use rustc_hash::FxHashMap;

use crate::error::CouplingError;

/// Global node identifier, shared with the external data collaborator.
pub type NodeId = usize;

/// Global macro cell identifier.
pub type CellId = usize;

/// Spatial degrees of freedom per micro node (displacement).
pub const MICRO_DOF_PER_NODE: usize = 3;

/// Degrees of freedom per macro node: 3 displacement + 9 micro-deformation.
pub const MACRO_DOF_PER_NODE: usize = 12;

/// A bijection between global node ids and a dense local index, with a fixed
/// number of degrees of freedom per node.
#[derive(Debug, Clone, Default)]
pub struct DofMap {
    dof_per_node: usize,
    local: FxHashMap<NodeId, usize>,
    global: Vec<NodeId>,
}

impl DofMap {
    /// Builds a map assigning local indices in the order the nodes appear.
    ///
    /// A duplicated node id is a configuration error: the free/ghost node
    /// sets supplied by the data collaborator must partition each scale.
    pub fn from_nodes(nodes: &[NodeId], dof_per_node: usize) -> Result<Self> {
        let mut local = FxHashMap::default();
        local.reserve(nodes.len());
        for (index, &node) in nodes.iter().enumerate() {
            if local.insert(node, index).is_some() {
                return Err(CouplingError::configuration(
                    "DofMap::from_nodes",
                    format!("node {node} appears more than once in the node set"),
                )
                .into());
            }
        }
        Ok(Self {
            dof_per_node,
            local,
            global: nodes.to_vec(),
        })
    }

    pub fn dof_per_node(&self) -> usize {
        self.dof_per_node
    }

    pub fn num_nodes(&self) -> usize {
        self.global.len()
    }

    /// Total number of degrees of freedom addressed by this map.
    pub fn num_dofs(&self) -> usize {
        self.dof_per_node * self.global.len()
    }

    pub fn contains(&self, node: NodeId) -> bool {
        self.local.contains_key(&node)
    }

    /// Dense local index of a node, if the node belongs to this set.
    pub fn local_index(&self, node: NodeId) -> Option<usize> {
        self.local.get(&node).copied()
    }

    /// Index of the first degree of freedom of a node.
    pub fn first_dof(&self, node: NodeId) -> Option<usize> {
        self.local_index(node).map(|index| self.dof_per_node * index)
    }

    /// Global node id at a dense local index.
    pub fn global_id(&self, local_index: usize) -> NodeId {
        self.global[local_index]
    }

    /// Iterates `(local index, global node id)` pairs in local order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, NodeId)> + '_ {
        self.global.iter().copied().enumerate()
    }
}

/// The four DOF maps of the coupled problem.
#[derive(Debug, Clone, Default)]
pub struct DofPartition {
    pub free_macro: DofMap,
    pub ghost_macro: DofMap,
    pub free_micro: DofMap,
    pub ghost_micro: DofMap,
}

impl DofPartition {
    pub fn new(
        free_macro_nodes: &[NodeId],
        ghost_macro_nodes: &[NodeId],
        free_micro_nodes: &[NodeId],
        ghost_micro_nodes: &[NodeId],
    ) -> Result<Self> {
        Ok(Self {
            free_macro: DofMap::from_nodes(free_macro_nodes, MACRO_DOF_PER_NODE)?,
            ghost_macro: DofMap::from_nodes(ghost_macro_nodes, MACRO_DOF_PER_NODE)?,
            free_micro: DofMap::from_nodes(free_micro_nodes, MICRO_DOF_PER_NODE)?,
            ghost_micro: DofMap::from_nodes(ghost_micro_nodes, MICRO_DOF_PER_NODE)?,
        })
    }
}
