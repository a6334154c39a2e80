//! Tensor shardings: how each dimension of a tensor is partitioned across the axes of a [`Mesh`].
//!
//! | Type | Shardy MLIR representation |
//! |---|---|
//! | [`DimensionSharding`] | `{"x", "y"}`, `{"x", ?}`, `{?}`, `{}p0` |
//! | [`TensorSharding`] | `#sdy.sharding<@mesh, [{"x"}, {?}], replicated={"y"}, unreduced={"z"}>` |
//!
//! A dimension sharding lists its axes from major to minor. A _closed_ dimension sharding is final and is never
//! extended by propagation, while an _open_ one (rendered with a trailing `?`) may receive further minor axes. An
//! optional priority (lower value means higher priority) controls when a user-provided dimension sharding is admitted
//! by the user-priority propagation tier; dimension shardings without a priority are always admitted.

use std::fmt::{Display, Formatter};

use crate::errors::Error;
use crate::mesh::{AxisRef, Mesh, escape_shardy_string, format_axis_list, merge_adjacent, total_size};

/// Sharding of one tensor dimension.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct DimensionSharding {
    axes: Vec<AxisRef>,
    is_closed: bool,
    priority: Option<usize>,
}

impl DimensionSharding {
    pub fn new(axes: Vec<AxisRef>, is_closed: bool) -> Self {
        Self { axes, is_closed, priority: None }
    }

    /// Creates a closed dimension sharding, which propagation will never extend.
    pub fn closed(axes: Vec<AxisRef>) -> Self {
        Self::new(axes, true)
    }

    /// Creates an open dimension sharding, which propagation may extend with further minor axes.
    pub fn open(axes: Vec<AxisRef>) -> Self {
        Self::new(axes, false)
    }

    /// Returns a copy of this dimension sharding with the provided priority.
    pub fn with_priority(mut self, priority: usize) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn axes(&self) -> &[AxisRef] {
        self.axes.as_slice()
    }

    pub fn is_closed(&self) -> bool {
        self.is_closed
    }

    pub fn priority(&self) -> Option<usize> {
        self.priority
    }

    pub fn is_empty(&self) -> bool {
        self.axes.is_empty()
    }

    /// Number of shards along this dimension.
    pub fn sharded_size(&self, mesh: &Mesh) -> usize {
        total_size(&self.axes, mesh)
    }

    pub(crate) fn set_axes(&mut self, axes: Vec<AxisRef>) {
        self.axes = axes;
    }

    pub(crate) fn set_closed(&mut self, is_closed: bool) {
        self.is_closed = is_closed;
    }

    pub(crate) fn clear_priority(&mut self) {
        self.priority = None;
    }
}

impl Display for DimensionSharding {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> std::fmt::Result {
        write!(formatter, "{{{}", format_axis_list(&self.axes))?;
        match (self.is_closed, self.axes.is_empty()) {
            (true, _) => write!(formatter, "}}")?,
            (false, true) => write!(formatter, "?}}")?,
            (false, false) => write!(formatter, ", ?}}")?,
        }
        if let Some(priority) = self.priority {
            write!(formatter, "p{priority}")?;
        }
        Ok(())
    }
}

/// Sharding of a tensor over a named mesh.
///
/// Besides the per-dimension shardings, a tensor sharding can explicitly list axes along which the tensor is
/// _replicated_ (meaning that propagation must not use them to shard the tensor) and axes along which the tensor is
/// _unreduced_ (meaning that each device holds a partial result that still needs to be all-reduced).
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TensorSharding {
    mesh_name: String,
    dimension_shardings: Vec<DimensionSharding>,
    replicated_axes: Vec<AxisRef>,
    unreduced_axes: Vec<AxisRef>,
}

impl TensorSharding {
    pub fn new<N: Into<String>>(mesh_name: N, dimension_shardings: Vec<DimensionSharding>) -> Self {
        Self::with_extra_axes(mesh_name, dimension_shardings, Vec::new(), Vec::new())
    }

    pub fn with_extra_axes<N: Into<String>>(
        mesh_name: N,
        dimension_shardings: Vec<DimensionSharding>,
        replicated_axes: Vec<AxisRef>,
        unreduced_axes: Vec<AxisRef>,
    ) -> Self {
        Self { mesh_name: mesh_name.into(), dimension_shardings, replicated_axes, unreduced_axes }
    }

    /// Creates a sharding with `rank` open and empty dimension shardings.
    pub fn fully_open<N: Into<String>>(mesh_name: N, rank: usize) -> Self {
        Self::new(mesh_name, vec![DimensionSharding::open(Vec::new()); rank])
    }

    /// Creates a fully replicated sharding with `rank` closed and empty dimension shardings.
    pub fn fully_closed<N: Into<String>>(mesh_name: N, rank: usize) -> Self {
        Self::new(mesh_name, vec![DimensionSharding::closed(Vec::new()); rank])
    }

    pub fn mesh_name(&self) -> &str {
        self.mesh_name.as_str()
    }

    pub fn dimension_shardings(&self) -> &[DimensionSharding] {
        self.dimension_shardings.as_slice()
    }

    pub fn dimension_sharding(&self, dimension: usize) -> Option<&DimensionSharding> {
        self.dimension_shardings.get(dimension)
    }

    pub fn rank(&self) -> usize {
        self.dimension_shardings.len()
    }

    pub fn replicated_axes(&self) -> &[AxisRef] {
        self.replicated_axes.as_slice()
    }

    pub fn unreduced_axes(&self) -> &[AxisRef] {
        self.unreduced_axes.as_slice()
    }

    /// Returns `true` if no dimension of this sharding is sharded along any axis.
    pub fn is_fully_replicated(&self) -> bool {
        self.dimension_shardings.iter().all(DimensionSharding::is_empty)
    }

    /// Returns the number of shards along each dimension.
    pub fn sharded_sizes(&self, mesh: &Mesh) -> Vec<usize> {
        self.dimension_shardings.iter().map(|dimension| dimension.sharded_size(mesh)).collect()
    }

    /// Returns every axis reference claimed by this sharding: dimension axes, followed by replicated and unreduced
    /// axes.
    pub fn used_axes(&self) -> Vec<&AxisRef> {
        self.dimension_shardings
            .iter()
            .flat_map(|dimension| dimension.axes.iter())
            .chain(self.replicated_axes.iter())
            .chain(self.unreduced_axes.iter())
            .collect()
    }

    /// Returns a copy of this sharding with every dimension closed, as done when exporting a module.
    pub fn closed_like(&self) -> Self {
        let mut sharding = self.clone();
        sharding.dimension_shardings.iter_mut().for_each(|dimension| dimension.is_closed = true);
        sharding
    }

    /// Returns a copy of this sharding with every dimension open.
    pub fn open_like(&self) -> Self {
        let mut sharding = self.clone();
        sharding.dimension_shardings.iter_mut().for_each(|dimension| dimension.is_closed = false);
        sharding
    }

    /// Returns a copy of this sharding without dimension priorities.
    pub fn without_priorities(&self) -> Self {
        let mut sharding = self.clone();
        sharding.dimension_shardings.iter_mut().for_each(DimensionSharding::clear_priority);
        sharding
    }

    /// Returns a copy of this sharding in which adjacent sub-axes of every axis list are merged.
    pub fn canonicalized(&self, mesh: &Mesh) -> Self {
        let mut sharding = self.clone();
        for dimension in &mut sharding.dimension_shardings {
            dimension.axes = merge_adjacent(&dimension.axes, mesh);
        }
        sharding.replicated_axes = merge_adjacent(&sharding.replicated_axes, mesh);
        sharding.unreduced_axes = merge_adjacent(&sharding.unreduced_axes, mesh);
        sharding
    }

    /// Returns `true` if this sharding places data on devices exactly like `other` does (i.e., both have the same
    /// mesh and the same canonical per-dimension axes), regardless of open/closed flags, priorities, and replicated
    /// axes.
    pub fn has_same_layout(&self, other: &TensorSharding, mesh: &Mesh) -> bool {
        self.mesh_name == other.mesh_name
            && self.rank() == other.rank()
            && merge_adjacent(&self.unreduced_axes, mesh) == merge_adjacent(&other.unreduced_axes, mesh)
            && self
                .dimension_shardings
                .iter()
                .zip(other.dimension_shardings.iter())
                .all(|(lhs, rhs)| merge_adjacent(&lhs.axes, mesh) == merge_adjacent(&rhs.axes, mesh))
    }

    /// Validates this sharding against `mesh` and a tensor of shape `shape`.
    ///
    /// Checks that the rank matches, that every axis reference is valid for the mesh, and that no part of any mesh
    /// axis is claimed more than once across dimensions, replicated axes, and unreduced axes.
    pub fn validate(&self, mesh: &Mesh, shape: &[usize]) -> Result<(), Error> {
        if self.rank() != shape.len() {
            return Err(Error::RankMismatch { sharding_rank: self.rank(), tensor_rank: shape.len() });
        }
        let used_axes = self.used_axes();
        for (index, axis) in used_axes.iter().enumerate() {
            axis.validate(mesh)?;
            if used_axes[..index].iter().any(|previous| previous.overlaps(axis, mesh)) {
                return Err(Error::AxisUsedMoreThanOnce { axis: axis.to_string() });
            }
        }
        Ok(())
    }

    /// Checks that every dimension of a tensor of shape `shape` is evenly divided by its sharding.
    pub fn validate_divisibility(&self, mesh: &Mesh, shape: &[usize]) -> Result<(), Error> {
        for (dimension, (sharding, dimension_size)) in self.dimension_shardings.iter().zip(shape.iter()).enumerate() {
            let sharded_size = sharding.sharded_size(mesh);
            if dimension_size % sharded_size != 0 {
                return Err(Error::NonDivisibleAxis { dimension, dimension_size: *dimension_size, sharded_size });
            }
        }
        Ok(())
    }

    pub(crate) fn dimension_sharding_mut(&mut self, dimension: usize) -> Option<&mut DimensionSharding> {
        self.dimension_shardings.get_mut(dimension)
    }

    pub(crate) fn dimension_shardings_mut(&mut self) -> &mut [DimensionSharding] {
        self.dimension_shardings.as_mut_slice()
    }
}

impl Display for TensorSharding {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> std::fmt::Result {
        let dimensions = self.dimension_shardings.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ");
        write!(formatter, "#sdy.sharding<@{}, [{dimensions}]", escape_shardy_string(&self.mesh_name))?;
        if !self.replicated_axes.is_empty() {
            write!(formatter, ", replicated={{{}}}", format_axis_list(&self.replicated_axes))?;
        }
        if !self.unreduced_axes.is_empty() {
            write!(formatter, ", unreduced={{{}}}", format_axis_list(&self.unreduced_axes))?;
        }
        write!(formatter, ">")
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
