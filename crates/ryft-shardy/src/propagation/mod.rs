//! Sharding propagation.
//!
//! Propagation assigns shardings to the values of a [`Module`](crate::graph::Module) that the user left unsharded (or
//! only partially sharded), based on the shardings the user did provide and the [sharding rules](crate::rules) of the
//! operations that connect them. It is organized in three nested tiers:
//!
//!   1. **User priorities** ([`user_priority`]): user-provided dimension shardings with a priority are admitted in
//!      increasing priority order, with a full propagation run after each admission.
//!   2. **Op priorities** ([`op_priority`]): each run consists of one worklist pass per op-priority heuristic, in which
//!      operations only propagate in the directions their heuristics allow.
//!   3. **Factor propagation** ([`factor_propagation`]): for each operation, the shardings of its operands and results
//!      are [projected](projection) onto the factors of its rule and reconciled factor by factor.
//!
//! Every sharding change goes through [`ShardingTable::refine`], which only ever appends minor axes to open
//! dimensions. This makes propagation monotonic, and therefore guarantees that it terminates.

use crate::compatibility::{are_equivalent, is_prefix, overlaps_any, strip_prefix};
use crate::graph::{Module, ValueId};
use crate::mesh::{AxisRef, Mesh, merge_adjacent};
use crate::sharding::TensorSharding;

pub mod debug;
pub mod driver;
pub mod factor_propagation;
pub mod op_priority;
pub mod projection;
pub mod user_priority;

pub use debug::*;
pub use factor_propagation::{ConflictResolutionPolicy, FactorPropagation, FactorUpdate, LargestShardedSize, PropagationStrategy};
pub use op_priority::{
    DEFAULT_OP_PRIORITY_HEURISTICS, OpPriorityHeuristic, PropagationDirection, all_operations,
    broadcast_operations_forward, pass_through_operations,
};
pub use projection::{FactorSharding, ShardingProjection, TensorFactorShardings, TensorIndex};
pub use user_priority::propagate_with_user_priorities;

/// Current sharding of every value of a module during propagation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShardingTable {
    shardings: Vec<Option<TensorSharding>>,
    ranks: Vec<usize>,
}

impl ShardingTable {
    /// Creates a table for the values of `module` in which no value is sharded.
    pub fn new(module: &Module) -> Self {
        Self {
            shardings: vec![None; module.values().len()],
            ranks: module.values().iter().map(|value| value.rank()).collect(),
        }
    }

    pub fn get(&self, value: ValueId) -> Option<&TensorSharding> {
        self.shardings.get(value.0).and_then(Option::as_ref)
    }

    pub fn set(&mut self, value: ValueId, sharding: Option<TensorSharding>) {
        self.shardings[value.0] = sharding;
    }

    /// Refines dimension `dimension` of the sharding of `value` to `axes`, returning `true` if the sharding changed.
    ///
    /// The refinement is only applied if the dimension is open, its current axes are a strict prefix of `axes`, and
    /// the new axes do not overlap with any other axis used by the sharding. A value without a sharding is first
    /// given a fully open sharding over `mesh_name`. A value sharded over a different mesh is never changed.
    pub fn refine(&mut self, value: ValueId, dimension: usize, axes: &[AxisRef], mesh_name: &str, mesh: &Mesh) -> bool {
        let Some(slot) = self.shardings.get(value.0) else {
            return false;
        };
        let mut sharding = slot.clone().unwrap_or_else(|| TensorSharding::fully_open(mesh_name, self.ranks[value.0]));
        if sharding.mesh_name() != mesh_name {
            return false;
        }
        let Some(current) = sharding.dimension_sharding(dimension) else {
            return false;
        };
        if current.is_closed() || !is_prefix(current.axes(), axes, mesh) || are_equivalent(current.axes(), axes, mesh) {
            return false;
        }
        let Some(new_axes) = strip_prefix(axes, current.axes(), mesh) else {
            return false;
        };
        let other_axes = sharding
            .dimension_shardings()
            .iter()
            .enumerate()
            .filter(|(other_dimension, _)| *other_dimension != dimension)
            .flat_map(|(_, other)| other.axes().iter())
            .chain(sharding.replicated_axes().iter())
            .chain(sharding.unreduced_axes().iter())
            .collect::<Vec<_>>();
        if new_axes.iter().any(|axis| overlaps_any(axis, other_axes.iter().copied(), mesh)) {
            return false;
        }
        if let Some(current) = sharding.dimension_sharding_mut(dimension) {
            current.set_axes(merge_adjacent(axes, mesh));
        }
        self.shardings[value.0] = Some(sharding);
        true
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
