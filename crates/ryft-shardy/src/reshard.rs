//! Resharding synthesis.
//!
//! When the sharding an operation expects for one of its operands differs from the sharding that operand has, the
//! operand must be _resharded_ by a sequence of collectives. [`reshard`] synthesizes such a sequence from four
//! collectives, each of which has exact symbolic semantics (see [`Collective::apply`]):
//!
//! | Collective | Effect on the sharding |
//! |---|---|
//! | [`AllGather`](Collective::AllGather) | removes a suffix of axes from each dimension |
//! | [`AllSlice`](Collective::AllSlice) | appends unused axes to each dimension |
//! | [`AllToAll`](Collective::AllToAll) | moves a suffix of axes from one dimension to the end of another |
//! | [`CollectivePermute`](Collective::CollectivePermute) | replaces the sharding with one that has the same number of shards along every dimension |
//!
//! Synthesis works on a common subdivision of all axes used by the source and the target (see
//! [`atomize`](crate::compatibility::atomize)). Each resulting atom is either kept in place, moved to another
//! dimension, gathered, or sliced. Moves are applied with all-to-alls in an order that respects their dependencies,
//! and moves that cannot be ordered (or that would get in the way of a gather) are degraded to a gather followed by a
//! slice. Axes for which no common subdivision exists are always gathered and then sliced again.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt::{Display, Formatter};

use tracing::{debug, trace};

use crate::compatibility::{atomize, overlaps_any};
use crate::errors::Error;
use crate::mesh::{AxisRef, Mesh, format_axis_list, merge_adjacent};
use crate::sharding::{DimensionSharding, TensorSharding};

// ---------------------------------------------------------------------------
// Collectives
// ---------------------------------------------------------------------------

/// Move of a suffix of axes from one dimension to the end of another, as part of an [`Collective::AllToAll`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AllToAllParam {
    pub axes: Vec<AxisRef>,
    pub source_dimension: usize,
    pub target_dimension: usize,
}

impl AllToAllParam {
    pub fn new(axes: Vec<AxisRef>, source_dimension: usize, target_dimension: usize) -> Self {
        Self { axes, source_dimension, target_dimension }
    }
}

impl Display for AllToAllParam {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            formatter,
            "{{{}}}: {}->{}",
            format_axis_list(&self.axes),
            self.source_dimension,
            self.target_dimension,
        )
    }
}

/// Collective operation that changes the sharding of a tensor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Collective {
    /// Gathers each dimension along the given axes, which must be a suffix of the axes the dimension is sharded on.
    AllGather { gathering_axes: Vec<Vec<AxisRef>> },

    /// Slices each dimension further along the given axes, which must not be used by the sharding.
    AllSlice { slicing_axes: Vec<Vec<AxisRef>> },

    /// Applies the given moves one after the other.
    AllToAll { params: Vec<AllToAllParam> },

    /// Moves data between devices such that the tensor ends up sharded as `out_sharding`, which must have the same
    /// number of shards along every dimension as the input sharding.
    CollectivePermute { out_sharding: TensorSharding },
}

impl Collective {
    /// Short name of this collective (e.g., `all_gather`).
    pub fn name(&self) -> &'static str {
        match self {
            Self::AllGather { .. } => "all_gather",
            Self::AllSlice { .. } => "all_slice",
            Self::AllToAll { .. } => "all_to_all",
            Self::CollectivePermute { .. } => "collective_permute",
        }
    }

    /// Name of the operation that performs this collective in a [`Module`](crate::graph::Module).
    pub fn operation_name(&self) -> &'static str {
        match self {
            Self::AllGather { .. } => "sdy.all_gather",
            Self::AllSlice { .. } => "sdy.all_slice",
            Self::AllToAll { .. } => "sdy.all_to_all",
            Self::CollectivePermute { .. } => "sdy.collective_permute",
        }
    }

    /// Name of the operation attribute that holds the parameters of this collective.
    pub fn attribute_name(&self) -> &'static str {
        match self {
            Self::AllGather { .. } => "gathering_axes",
            Self::AllSlice { .. } => "slicing_axes",
            Self::AllToAll { .. } => "params",
            Self::CollectivePermute { .. } => "out_sharding",
        }
    }

    /// Returns `true` if this collective does not change any sharding.
    pub fn is_empty(&self) -> bool {
        match self {
            Self::AllGather { gathering_axes: axes } | Self::AllSlice { slicing_axes: axes } => {
                axes.iter().all(Vec::is_empty)
            }
            Self::AllToAll { params } => params.is_empty(),
            Self::CollectivePermute { .. } => false,
        }
    }

    /// Returns the sharding that results from applying this collective to a tensor sharded as `sharding`.
    pub fn apply(&self, sharding: &TensorSharding, mesh: &Mesh) -> Result<TensorSharding, Error> {
        match self {
            Self::AllGather { gathering_axes } => {
                self.check_rank(gathering_axes.len(), sharding)?;
                let mut result = sharding.clone();
                for (dimension, (dimension_sharding, axes)) in
                    result.dimension_shardings_mut().iter_mut().zip(gathering_axes.iter()).enumerate()
                {
                    let remaining = remove_suffix(dimension_sharding.axes(), axes, mesh).ok_or_else(|| {
                        self.invalid(format!(
                            "[{}] is not a suffix of the axes [{}] of dimension #{dimension}",
                            format_axis_list(axes),
                            format_axis_list(dimension_sharding.axes()),
                        ))
                    })?;
                    dimension_sharding.set_axes(remaining);
                }
                Ok(result)
            }
            Self::AllSlice { slicing_axes } => {
                self.check_rank(slicing_axes.len(), sharding)?;
                let mut used_axes = sharding
                    .dimension_shardings()
                    .iter()
                    .flat_map(|dimension| dimension.axes().iter())
                    .chain(sharding.unreduced_axes().iter())
                    .collect::<Vec<_>>();
                for axis in slicing_axes.iter().flatten() {
                    axis.validate(mesh)?;
                    if overlaps_any(axis, used_axes.iter().copied(), mesh) {
                        return Err(self.invalid(format!("axis {axis} is already used by {sharding}")));
                    }
                    used_axes.push(axis);
                }
                let dimension_shardings = sharding
                    .dimension_shardings()
                    .iter()
                    .zip(slicing_axes.iter())
                    .map(|(dimension, axes)| {
                        let mut sliced = dimension.axes().to_vec();
                        sliced.extend(axes.iter().cloned());
                        DimensionSharding::new(merge_adjacent(&sliced, mesh), dimension.is_closed())
                    })
                    .collect();
                let replicated_axes = sharding
                    .replicated_axes()
                    .iter()
                    .filter(|axis| !overlaps_any(axis, slicing_axes.iter().flatten(), mesh))
                    .cloned()
                    .collect();
                Ok(TensorSharding::with_extra_axes(
                    sharding.mesh_name(),
                    dimension_shardings,
                    replicated_axes,
                    sharding.unreduced_axes().to_vec(),
                ))
            }
            Self::AllToAll { params } => {
                let mut result = sharding.clone();
                for param in params {
                    let AllToAllParam { axes, source_dimension, target_dimension } = param;
                    if source_dimension == target_dimension
                        || *source_dimension >= result.rank()
                        || *target_dimension >= result.rank()
                    {
                        return Err(self.invalid(format!("invalid dimensions in {param} for rank {}", result.rank())));
                    }
                    if axes.is_empty() {
                        return Err(self.invalid(format!("{param} does not move any axes")));
                    }
                    let source_axes = result.dimension_shardings()[*source_dimension].axes().to_vec();
                    let remaining = remove_suffix(&source_axes, axes, mesh).ok_or_else(|| {
                        self.invalid(format!(
                            "[{}] is not a suffix of the axes [{}] of dimension #{source_dimension}",
                            format_axis_list(axes),
                            format_axis_list(&source_axes),
                        ))
                    })?;
                    let shardings = result.dimension_shardings_mut();
                    shardings[*source_dimension].set_axes(remaining);
                    let mut target_axes = shardings[*target_dimension].axes().to_vec();
                    target_axes.extend(axes.iter().cloned());
                    shardings[*target_dimension].set_axes(merge_adjacent(&target_axes, mesh));
                }
                Ok(result)
            }
            Self::CollectivePermute { out_sharding } => {
                if out_sharding.mesh_name() != sharding.mesh_name() {
                    return Err(self.invalid(format!(
                        "cannot permute from mesh '@{}' to mesh '@{}'",
                        sharding.mesh_name(),
                        out_sharding.mesh_name(),
                    )));
                }
                self.check_rank(out_sharding.rank(), sharding)?;
                if out_sharding.sharded_sizes(mesh) != sharding.sharded_sizes(mesh) {
                    return Err(self.invalid(format!(
                        "{out_sharding} does not have the same number of shards along every dimension as {sharding}",
                    )));
                }
                if merge_adjacent(out_sharding.unreduced_axes(), mesh) != merge_adjacent(sharding.unreduced_axes(), mesh)
                {
                    return Err(self.invalid("unreduced axes cannot be changed".to_string()));
                }
                Ok(out_sharding.clone())
            }
        }
    }

    fn check_rank(&self, rank: usize, sharding: &TensorSharding) -> Result<(), Error> {
        if rank != sharding.rank() {
            return Err(self.invalid(format!("expected {} dimension(s), but got {rank}", sharding.rank())));
        }
        Ok(())
    }

    fn invalid(&self, message: String) -> Error {
        Error::InvalidCollective { collective: self.name(), message }
    }
}

/// Returns `true` if `operation_name` is the name of an operation that performs a [`Collective`].
pub fn is_collective_operation(operation_name: &str) -> bool {
    matches!(operation_name, "sdy.all_gather" | "sdy.all_slice" | "sdy.all_to_all" | "sdy.collective_permute")
}

impl Display for Collective {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AllGather { gathering_axes: axes } | Self::AllSlice { slicing_axes: axes } => {
                let axes = axes.iter().map(|axes| format!("{{{}}}", format_axis_list(axes))).collect::<Vec<_>>();
                write!(formatter, "[{}]", axes.join(", "))
            }
            Self::AllToAll { params } => {
                let params = params.iter().map(ToString::to_string).collect::<Vec<_>>();
                write!(formatter, "[{}]", params.join(", "))
            }
            Self::CollectivePermute { out_sharding } => write!(formatter, "{out_sharding}"),
        }
    }
}

/// Removes `suffix` from the end of `axes`, splitting sub-axes as needed.
fn remove_suffix(axes: &[AxisRef], suffix: &[AxisRef], mesh: &Mesh) -> Option<Vec<AxisRef>> {
    let atomization = atomize(&[axes, suffix], mesh);
    let [axes, suffix] = atomization.lists.as_slice() else {
        return None;
    };
    if !axes.ends_with(suffix) {
        return None;
    }
    Some(merge_adjacent(&axes[..axes.len() - suffix.len()], mesh))
}

// ---------------------------------------------------------------------------
// Synthesis
// ---------------------------------------------------------------------------

/// Returns a sequence of collectives that turns a tensor sharded as `source` into one sharded as `target`.
///
/// The result is empty if both shardings already place data identically. Open/closed flags, priorities, and
/// replicated axes are ignored. Both shardings must be over the same mesh, have the same rank, and have the same
/// unreduced axes.
pub fn reshard(source: &TensorSharding, target: &TensorSharding, mesh: &Mesh) -> Result<Vec<Collective>, Error> {
    if source.mesh_name() != target.mesh_name() {
        return Err(Error::UnsupportedResharding {
            message: format!("cannot reshard from mesh '@{}' to mesh '@{}'", source.mesh_name(), target.mesh_name()),
        });
    }
    if source.rank() != target.rank() {
        return Err(Error::UnsupportedResharding {
            message: format!("cannot reshard from rank {} to rank {}", source.rank(), target.rank()),
        });
    }
    if merge_adjacent(source.unreduced_axes(), mesh) != merge_adjacent(target.unreduced_axes(), mesh) {
        return Err(Error::UnsupportedResharding {
            message: format!("cannot change the unreduced axes of {source} to those of {target}"),
        });
    }
    if source.has_same_layout(target, mesh) {
        return Ok(Vec::new());
    }
    if source.sharded_sizes(mesh) == target.sharded_sizes(mesh) {
        return Ok(vec![Collective::CollectivePermute { out_sharding: target.clone() }]);
    }

    let source_axes = source.dimension_shardings().iter().map(DimensionSharding::axes);
    let target_axes = target.dimension_shardings().iter().map(DimensionSharding::axes);
    let lists = source_axes.chain(target_axes).collect::<Vec<_>>();
    let atomization = atomize(&lists, mesh);
    if !atomization.opaque_axes.is_empty() {
        debug!(
            opaque_axes = ?atomization.opaque_axes,
            "resharding axes without a common subdivision by gathering and slicing them again",
        );
    }
    let (source_atoms, target_atoms) = atomization.lists.split_at(source.rank());
    let plan = ReshardPlan::new(source_atoms, target_atoms, &atomization.opaque_axes);
    let collectives = plan.into_collectives(source, mesh);
    debug!(%source, %target, collectives = collectives.len(), "synthesized resharding");
    Ok(collectives)
}

/// Atoms of one dimension, classified by what happens to them.
#[derive(Clone, Debug, Default)]
struct DimensionPlan {
    /// Atoms that stay in this dimension, in target order.
    kept: Vec<AxisRef>,

    /// Atoms of the source dimension that are gathered.
    gathered: Vec<AxisRef>,

    /// Atoms moved into this dimension from other dimensions, in target order.
    incoming: Vec<AxisRef>,

    /// Atoms that are sliced into this dimension.
    sliced: Vec<AxisRef>,
}

#[derive(Clone, Debug)]
struct ReshardPlan {
    source: Vec<Vec<AxisRef>>,
    dimensions: Vec<DimensionPlan>,

    /// Moves in application order.
    moves: Vec<AllToAllParam>,
}

impl ReshardPlan {
    fn new(source: &[Vec<AxisRef>], target: &[Vec<AxisRef>], opaque_axes: &BTreeSet<String>) -> Self {
        let rank = source.len();
        let is_opaque = |atom: &AxisRef| opaque_axes.contains(atom.name());
        let prefix_lengths = source
            .iter()
            .zip(target.iter())
            .map(|(source, target)| {
                source.iter().zip(target.iter()).take_while(|(lhs, rhs)| lhs == rhs && !is_opaque(*lhs)).count()
            })
            .collect::<Vec<_>>();
        let mut origins = HashMap::<&AxisRef, usize>::new();
        for (dimension, atoms) in source.iter().enumerate() {
            for atom in &atoms[prefix_lengths[dimension]..] {
                if !is_opaque(atom) {
                    origins.insert(atom, dimension);
                }
            }
        }

        // Atoms that must be gathered from their source dimension and sliced into their target dimension, even
        // though they could in principle be moved.
        let mut forced = HashSet::<&AxisRef>::new();
        loop {
            let mut dimensions = vec![DimensionPlan::default(); rank];
            let mut moves = Vec::<AllToAllParam>::new();
            let mut staying = HashSet::<&AxisRef>::new();
            let mut moved = HashSet::<&AxisRef>::new();
            for (dimension, plan) in dimensions.iter_mut().enumerate() {
                let remaining = &target[dimension][prefix_lengths[dimension]..];
                let reordered = remaining.iter().take_while(|atom| origins.get(atom) == Some(&dimension)).count();
                plan.kept = target[dimension][..prefix_lengths[dimension] + reordered].to_vec();
                staying.extend(remaining[..reordered].iter());

                let remaining = &remaining[reordered..];
                let incoming = remaining
                    .iter()
                    .take_while(|atom| {
                        matches!(origins.get(atom), Some(origin) if *origin != dimension) && !forced.contains(atom)
                    })
                    .count();
                for atom in &remaining[..incoming] {
                    let origin = origins[atom];
                    match moves.last_mut() {
                        Some(last) if last.target_dimension == dimension && last.source_dimension == origin => {
                            last.axes.push(atom.clone());
                        }
                        _ => moves.push(AllToAllParam::new(vec![atom.clone()], origin, dimension)),
                    }
                    moved.insert(atom);
                }
                plan.incoming = remaining[..incoming].to_vec();
                plan.sliced = remaining[incoming..].to_vec();
            }
            for (dimension, plan) in dimensions.iter_mut().enumerate() {
                plan.gathered = source[dimension][prefix_lengths[dimension]..]
                    .iter()
                    .filter(|atom| !staying.contains(atom) && !moved.contains(atom))
                    .cloned()
                    .collect();
            }

            // A dimension that still has to gather atoms cannot receive atoms before it does, because they would end
            // up after the atoms to gather.
            let mut changed = false;
            for plan in &dimensions {
                if !plan.gathered.is_empty() && !plan.incoming.is_empty() {
                    for atom in &plan.incoming {
                        if let Some((atom, _)) = origins.get_key_value(atom) {
                            changed |= forced.insert(*atom);
                        }
                    }
                }
            }
            if changed {
                trace!(forced = forced.len(), "degrading moves into dimensions that gather to gather and slice");
                continue;
            }

            match order_moves(&moves) {
                Ok(order) => {
                    let moves = order.into_iter().map(|index| moves[index].clone()).collect();
                    return Self { source: source.to_vec(), dimensions, moves };
                }
                Err(unordered) => {
                    trace!(moves = unordered.len(), "degrading cyclic moves to gather and slice");
                    for index in unordered {
                        for atom in &moves[index].axes {
                            if let Some((atom, _)) = origins.get_key_value(atom) {
                                forced.insert(*atom);
                            }
                        }
                    }
                }
            }
        }
    }

    fn into_collectives(self, source: &TensorSharding, mesh: &Mesh) -> Vec<Collective> {
        let mut collectives = Vec::new();

        // Lay out every source dimension such that the atoms to gather follow the atoms that stay, and the atoms
        // that move out follow those, with the first one to move out being last.
        let mut aligned = self
            .dimensions
            .iter()
            .map(|plan| plan.kept.iter().chain(plan.gathered.iter()).cloned().collect::<Vec<_>>())
            .collect::<Vec<_>>();
        for param in self.moves.iter().rev() {
            aligned[param.source_dimension].extend(param.axes.iter().cloned());
        }
        let is_aligned = aligned
            .iter()
            .zip(self.source.iter())
            .all(|(aligned, source)| merge_adjacent(aligned, mesh) == merge_adjacent(source, mesh));
        if !is_aligned {
            let dimension_shardings = aligned
                .iter()
                .zip(source.dimension_shardings().iter())
                .map(|(axes, dimension)| DimensionSharding::new(merge_adjacent(axes, mesh), dimension.is_closed()))
                .collect();
            collectives.push(Collective::CollectivePermute {
                out_sharding: TensorSharding::with_extra_axes(
                    source.mesh_name(),
                    dimension_shardings,
                    source.replicated_axes().to_vec(),
                    source.unreduced_axes().to_vec(),
                ),
            });
        }

        // Moves that share a dimension go into separate all-to-alls.
        let mut params = Vec::<AllToAllParam>::new();
        let mut dimensions = HashSet::new();
        for param in self.moves {
            if dimensions.contains(&param.source_dimension) || dimensions.contains(&param.target_dimension) {
                collectives.push(Collective::AllToAll { params: std::mem::take(&mut params) });
                dimensions.clear();
            }
            dimensions.insert(param.source_dimension);
            dimensions.insert(param.target_dimension);
            params.push(AllToAllParam { axes: merge_adjacent(&param.axes, mesh), ..param });
        }
        if !params.is_empty() {
            collectives.push(Collective::AllToAll { params });
        }

        let all_gather = Collective::AllGather {
            gathering_axes: self.dimensions.iter().map(|plan| merge_adjacent(&plan.gathered, mesh)).collect(),
        };
        let all_slice = Collective::AllSlice {
            slicing_axes: self.dimensions.iter().map(|plan| merge_adjacent(&plan.sliced, mesh)).collect(),
        };
        let gathered = self.dimensions.iter().flat_map(|plan| plan.gathered.iter()).collect::<Vec<_>>();
        let gather_first = self.dimensions.iter().any(|plan| !plan.gathered.is_empty() && !plan.sliced.is_empty())
            || self
                .dimensions
                .iter()
                .flat_map(|plan| plan.sliced.iter())
                .any(|atom| overlaps_any(atom, gathered.iter().copied(), mesh));
        let (first, second) = if gather_first { (all_gather, all_slice) } else { (all_slice, all_gather) };
        collectives.extend([first, second].into_iter().filter(|collective| !collective.is_empty()));
        collectives
    }
}

/// Orders `moves` such that the moves into each dimension happen in target order and all moves out of a dimension
/// happen before any move into it. Returns the indices of the moves that cannot be ordered if there is a cycle.
fn order_moves(moves: &[AllToAllParam]) -> Result<Vec<usize>, Vec<usize>> {
    let mut successors = vec![Vec::new(); moves.len()];
    let mut predecessor_counts = vec![0usize; moves.len()];
    let mut add_edge = |from: usize, to: usize| {
        successors[from].push(to);
        predecessor_counts[to] += 1;
    };
    for (index, param) in moves.iter().enumerate() {
        if let Some(next) = (index + 1..moves.len()).find(|next| moves[*next].target_dimension == param.target_dimension)
        {
            add_edge(index, next);
        }
        for (other, other_param) in moves.iter().enumerate() {
            if other_param.target_dimension == param.source_dimension {
                add_edge(index, other);
            }
        }
    }

    let mut ready = (0..moves.len()).filter(|index| predecessor_counts[*index] == 0).collect::<BTreeSet<_>>();
    let mut order = Vec::with_capacity(moves.len());
    while let Some(index) = ready.pop_first() {
        order.push(index);
        for successor in &successors[index] {
            predecessor_counts[*successor] -= 1;
            if predecessor_counts[*successor] == 0 {
                ready.insert(*successor);
            }
        }
    }
    if order.len() == moves.len() {
        Ok(order)
    } else {
        Err((0..moves.len()).filter(|index| !order.contains(index)).collect())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
