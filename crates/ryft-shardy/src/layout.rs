//! Per-device shard layouts.
//!
//! A [`ShardingLayout`] materializes which part of a tensor every device of a mesh holds under a given
//! [`TensorSharding`]. Layouts are what collectives physically operate on, so comparing the layouts before and after
//! a [`Collective`] (see [`check_transition`]) tells whether its symbolic semantics are realizable by moving data
//! between devices.

use std::collections::HashMap;

use crate::errors::Error;
use crate::mesh::{AxisRef, Mesh};
use crate::reshard::Collective;
use crate::sharding::TensorSharding;

// ---------------------------------------------------------------------------
// Shard metadata
// ---------------------------------------------------------------------------

/// Half-open slice `[start, end)` for one tensor dimension in a shard.
///
/// For an unsharded dimension, the slice spans the full extent `[0, dimension_size)`. For a sharded dimension, it
/// covers the partition assigned to a specific device based on its mesh coordinate.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ShardSlice {
    start: usize,
    end: usize,
}

impl ShardSlice {
    /// Inclusive start index.
    pub fn start(&self) -> usize {
        self.start
    }

    /// Exclusive end index.
    pub fn end(&self) -> usize {
        self.end
    }

    /// Length of this slice.
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    /// Returns `true` iff this slice is empty.
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Returns `true` iff `other` lies within this slice.
    pub fn contains(&self, other: &ShardSlice) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

/// Metadata for the shard of a tensor held by one device of a mesh.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ShardDescriptor {
    shard_index: usize,
    device_id: i64,
    mesh_coordinate: Vec<usize>,
    slices: Vec<ShardSlice>,
    shape: Vec<usize>,
}

impl ShardDescriptor {
    /// Shard index in row-major mesh order.
    pub fn shard_index(&self) -> usize {
        self.shard_index
    }

    /// ID of the device that holds this shard.
    pub fn device_id(&self) -> i64 {
        self.device_id
    }

    /// Row-major mesh coordinate of this shard.
    pub fn mesh_coordinate(&self) -> &[usize] {
        self.mesh_coordinate.as_slice()
    }

    /// Per-dimension slices of this shard.
    pub fn slices(&self) -> &[ShardSlice] {
        self.slices.as_slice()
    }

    /// Shape of this shard.
    pub fn shape(&self) -> &[usize] {
        self.shape.as_slice()
    }

    /// Number of elements in this shard.
    pub fn element_count(&self) -> usize {
        self.shape.iter().product()
    }

    /// Returns `true` iff every element of `other` is also part of this shard.
    pub fn contains(&self, other: &ShardDescriptor) -> bool {
        self.slices.len() == other.slices.len()
            && self.slices.iter().zip(other.slices.iter()).all(|(slice, other)| slice.contains(other))
    }
}

// ---------------------------------------------------------------------------
// Sharding layout
// ---------------------------------------------------------------------------

/// Shard metadata of a tensor for every device in a mesh.
///
/// Sharded dimensions that are not evenly divisible are split such that the first `dimension_size % shard_count`
/// shards hold one extra element.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShardingLayout {
    global_shape: Vec<usize>,
    shards: Vec<ShardDescriptor>,
    shard_index_by_device: HashMap<i64, usize>,
}

impl ShardingLayout {
    /// Constructs the shard metadata of a tensor with shape `global_shape` sharded as `sharding` over `mesh`.
    pub fn new(global_shape: Vec<usize>, mesh: &Mesh, sharding: &TensorSharding) -> Result<Self, Error> {
        sharding.validate(mesh, &global_shape)?;

        let device_count = mesh.device_count()?;
        let mut shards = Vec::with_capacity(device_count);
        let mut shard_index_by_device = HashMap::with_capacity(device_count);
        for shard_index in 0..device_count {
            let mesh_coordinate = mesh.coordinate_for_device_index(shard_index);
            let mut slices = Vec::with_capacity(global_shape.len());
            let mut shape = Vec::with_capacity(global_shape.len());
            for (dimension_size, dimension) in global_shape.iter().copied().zip(sharding.dimension_shardings()) {
                let (partition_index, partition_count) =
                    partition_index_for_axes(mesh, mesh_coordinate.as_slice(), dimension.axes())?;
                let slice = partition_slice(dimension_size, partition_count, partition_index)?;
                shape.push(slice.len());
                slices.push(slice);
            }

            let device_id = mesh.device_id(shard_index).ok_or_else(|| Error::Overflow {
                context: format!("converting device index {shard_index} to a device ID"),
            })?;
            shard_index_by_device.insert(device_id, shard_index);
            shards.push(ShardDescriptor { shard_index, device_id, mesh_coordinate, slices, shape });
        }

        Ok(Self { global_shape, shards, shard_index_by_device })
    }

    /// Global tensor shape.
    pub fn global_shape(&self) -> &[usize] {
        self.global_shape.as_slice()
    }

    /// All shards in row-major mesh order.
    pub fn shards(&self) -> &[ShardDescriptor] {
        self.shards.as_slice()
    }

    /// Returns the shard held by the device with ID `device_id`, if that device is part of the mesh.
    pub fn shard_for_device(&self, device_id: i64) -> Option<&ShardDescriptor> {
        self.shard_index_by_device.get(&device_id).map(|shard_index| &self.shards[*shard_index])
    }

    /// Returns `true` if both layouts assign the same slices to every device.
    pub fn has_same_shards(&self, other: &ShardingLayout) -> bool {
        self.global_shape == other.global_shape
            && self.shards.len() == other.shards.len()
            && self.shards.iter().zip(other.shards.iter()).all(|(lhs, rhs)| lhs.slices == rhs.slices)
    }
}

/// Checks that going from layout `before` to layout `after` is something `collective` can physically do: an
/// all-gather may only grow the shard of each device, an all-slice may only shrink it, and an all-to-all or a
/// collective permute must keep the number of elements each device holds.
pub fn check_transition(collective: &Collective, before: &ShardingLayout, after: &ShardingLayout) -> Result<(), Error> {
    let invalid = |message: String| Error::InvalidCollective { collective: collective.name(), message };
    if before.global_shape != after.global_shape || before.shards.len() != after.shards.len() {
        return Err(invalid("layouts describe different tensors or meshes".to_string()));
    }
    for (before, after) in before.shards.iter().zip(after.shards.iter()) {
        let is_valid = match collective {
            Collective::AllGather { .. } => after.contains(before),
            Collective::AllSlice { .. } => before.contains(after),
            Collective::AllToAll { .. } | Collective::CollectivePermute { .. } => {
                before.element_count() == after.element_count()
            }
        };
        if !is_valid {
            return Err(invalid(format!(
                "device {} cannot go from shard {:?} to shard {:?}",
                before.device_id, before.slices, after.slices,
            )));
        }
    }
    Ok(())
}

/// Returns the coordinate of the device at `mesh_coordinate` along `axis`. For a sub-axis `"x":(pre_size)size` of an
/// axis with size `n`, the axis coordinate is decomposed major to minor into parts of sizes `pre_size`, `size`, and
/// `n / (pre_size * size)`, and the coordinate along the middle part is returned.
fn axis_coordinate(mesh: &Mesh, mesh_coordinate: &[usize], axis: &AxisRef) -> Result<usize, Error> {
    let axis_index =
        mesh.axis_index(axis.name()).ok_or_else(|| Error::UnknownMeshAxis { axis_name: axis.name().to_string() })?;
    let coordinate = mesh_coordinate[axis_index];
    let minor_size = axis.full_axis_size(mesh) / axis.next_pre_size(mesh);
    Ok((coordinate / minor_size) % axis.size(mesh))
}

fn partition_index_for_axes(
    mesh: &Mesh,
    mesh_coordinate: &[usize],
    axes: &[AxisRef],
) -> Result<(usize, usize), Error> {
    let mut partition_index = 0usize;
    let mut partition_count = 1usize;

    for axis in axes {
        let axis_size = axis.size(mesh);
        let axis_coordinate = axis_coordinate(mesh, mesh_coordinate, axis)?;
        partition_index = partition_index
            .checked_mul(axis_size)
            .and_then(|value| value.checked_add(axis_coordinate))
            .ok_or_else(|| Error::Overflow { context: format!("computing partition index for axis {axis}") })?;
        partition_count = partition_count
            .checked_mul(axis_size)
            .ok_or_else(|| Error::Overflow { context: format!("computing partition count for axis {axis}") })?;
    }

    Ok((partition_index, partition_count))
}

fn partition_slice(dimension_size: usize, partition_count: usize, partition_index: usize) -> Result<ShardSlice, Error> {
    let base_size = dimension_size / partition_count;
    let remainder = dimension_size % partition_count;
    let extra_before = partition_index.min(remainder);

    let start = partition_index
        .checked_mul(base_size)
        .and_then(|value| value.checked_add(extra_before))
        .ok_or_else(|| Error::Overflow { context: "computing shard-slice start index".to_string() })?;
    let size = base_size + usize::from(partition_index < remainder);
    let end = start
        .checked_add(size)
        .ok_or_else(|| Error::Overflow { context: "computing shard-slice end index".to_string() })?;

    Ok(ShardSlice { start, end })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    use crate::mesh::tests::test_mesh;
    use crate::reshard::reshard;
    use crate::sharding::DimensionSharding;

    use super::*;

    fn slices(layout: &ShardingLayout, shard_index: usize) -> Vec<(usize, usize)> {
        layout.shards()[shard_index].slices().iter().map(|slice| (slice.start(), slice.end())).collect()
    }

    #[test]
    fn test_sharding_layout() {
        let mesh = test_mesh(&[("x", 2), ("y", 2)]);
        let sharding = TensorSharding::new(
            "mesh",
            vec![DimensionSharding::closed(vec![AxisRef::new("x")]), DimensionSharding::closed(Vec::new())],
        );
        let layout = ShardingLayout::new(vec![8, 4], &mesh, &sharding).unwrap();
        assert_eq!(layout.global_shape(), &[8, 4]);
        assert_eq!(layout.shards().len(), 4);
        assert_eq!(slices(&layout, 0), vec![(0, 4), (0, 4)]);
        assert_eq!(slices(&layout, 1), vec![(0, 4), (0, 4)]);
        assert_eq!(slices(&layout, 2), vec![(4, 8), (0, 4)]);
        assert_eq!(layout.shards()[3].mesh_coordinate(), &[1, 1]);
        assert_eq!(layout.shards()[3].shape(), &[4, 4]);
        assert_eq!(layout.shard_for_device(2).map(ShardDescriptor::shard_index), Some(2));
        assert_eq!(layout.shard_for_device(7), None);
    }

    #[test]
    fn test_sharding_layout_with_sub_axes() {
        let mesh = test_mesh(&[("x", 4)]);
        let minor = TensorSharding::new("mesh", vec![DimensionSharding::closed(vec![AxisRef::sub_axis("x", 2, 2)])]);
        let layout = ShardingLayout::new(vec![8], &mesh, &minor).unwrap();
        let starts = layout.shards().iter().map(|shard| shard.slices()[0].start()).collect::<Vec<_>>();
        assert_eq!(starts, vec![0, 4, 0, 4]);

        let major = TensorSharding::new("mesh", vec![DimensionSharding::closed(vec![AxisRef::sub_axis("x", 1, 2)])]);
        let layout = ShardingLayout::new(vec![8], &mesh, &major).unwrap();
        let starts = layout.shards().iter().map(|shard| shard.slices()[0].start()).collect::<Vec<_>>();
        assert_eq!(starts, vec![0, 0, 4, 4]);

        let split = TensorSharding::new(
            "mesh",
            vec![DimensionSharding::closed(vec![AxisRef::sub_axis("x", 1, 2), AxisRef::sub_axis("x", 2, 2)])],
        );
        let full = TensorSharding::new("mesh", vec![DimensionSharding::closed(vec![AxisRef::new("x")])]);
        assert!(
            ShardingLayout::new(vec![8], &mesh, &split)
                .unwrap()
                .has_same_shards(&ShardingLayout::new(vec![8], &mesh, &full).unwrap())
        );
    }

    #[test]
    fn test_uneven_sharding_layout() {
        let mesh = test_mesh(&[("x", 4)]);
        let sharding = TensorSharding::new("mesh", vec![DimensionSharding::closed(vec![AxisRef::new("x")])]);
        let layout = ShardingLayout::new(vec![6], &mesh, &sharding).unwrap();
        assert_eq!(
            layout.shards().iter().map(|shard| shard.shape()[0]).collect::<Vec<_>>(),
            vec![2, 2, 1, 1],
        );
    }

    #[test]
    fn test_check_transition() {
        let mesh = test_mesh(&[("x", 2), ("y", 2)]);
        let sharded = TensorSharding::new(
            "mesh",
            vec![DimensionSharding::closed(vec![AxisRef::new("x")]), DimensionSharding::closed(Vec::new())],
        );
        let replicated = TensorSharding::fully_closed("mesh", 2);
        let sharded_layout = ShardingLayout::new(vec![8, 8], &mesh, &sharded).unwrap();
        let replicated_layout = ShardingLayout::new(vec![8, 8], &mesh, &replicated).unwrap();
        let gather = Collective::AllGather { gathering_axes: vec![vec![AxisRef::new("x")], Vec::new()] };
        let slice = Collective::AllSlice { slicing_axes: vec![vec![AxisRef::new("x")], Vec::new()] };
        assert!(check_transition(&gather, &sharded_layout, &replicated_layout).is_ok());
        assert!(check_transition(&slice, &replicated_layout, &sharded_layout).is_ok());
        assert!(matches!(
            check_transition(&gather, &replicated_layout, &sharded_layout),
            Err(Error::InvalidCollective { collective: "all_gather", .. }),
        ));
    }

    /// Sharding over mesh `x=2, y=2, z=2` that assigns each axis to one of three dimensions (or to none), in a random
    /// order.
    fn sharding_strategy() -> impl Strategy<Value = TensorSharding> {
        let axes = vec![AxisRef::new("x"), AxisRef::new("y"), AxisRef::new("z")];
        (Just(axes).prop_shuffle(), proptest::collection::vec(0usize..4, 3)).prop_map(sharding_from_assignment)
    }

    /// Sharding over mesh `w=4, x=2` in which the two halves of `w` are assigned independently.
    fn sub_axis_sharding_strategy() -> impl Strategy<Value = TensorSharding> {
        let axes = vec![AxisRef::sub_axis("w", 1, 2), AxisRef::sub_axis("w", 2, 2), AxisRef::new("x")];
        (Just(axes).prop_shuffle(), proptest::collection::vec(0usize..4, 3)).prop_map(sharding_from_assignment)
    }

    fn sharding_from_assignment((axes, dimensions): (Vec<AxisRef>, Vec<usize>)) -> TensorSharding {
        let mut dimension_axes = vec![Vec::new(); 3];
        for (axis, dimension) in axes.into_iter().zip(dimensions) {
            if let Some(axes) = dimension_axes.get_mut(dimension) {
                axes.push(axis);
            }
        }
        TensorSharding::new("mesh", dimension_axes.into_iter().map(DimensionSharding::closed).collect())
    }

    fn check_reshard_round_trip(source: &TensorSharding, target: &TensorSharding, mesh: &Mesh) {
        let shape = vec![16, 16, 16];
        let collectives = reshard(source, target, mesh).unwrap();
        assert!(collectives.iter().all(|collective| !collective.is_empty()));
        let mut sharding = source.clone();
        let mut layout = ShardingLayout::new(shape.clone(), mesh, &sharding).unwrap();
        for collective in &collectives {
            let next_sharding = collective.apply(&sharding, mesh).unwrap();
            let next_layout = ShardingLayout::new(shape.clone(), mesh, &next_sharding).unwrap();
            check_transition(collective, &layout, &next_layout).unwrap();
            sharding = next_sharding;
            layout = next_layout;
        }
        assert!(sharding.has_same_layout(target, mesh), "{sharding} != {target} after {collectives:?}");
        assert!(layout.has_same_shards(&ShardingLayout::new(shape, mesh, target).unwrap()));
    }

    proptest! {
        #[test]
        fn test_reshard_round_trip(source in sharding_strategy(), target in sharding_strategy()) {
            let mesh = test_mesh(&[("x", 2), ("y", 2), ("z", 2)]);
            check_reshard_round_trip(&source, &target, &mesh);
            prop_assert!(reshard(&source, &source, &mesh).unwrap().is_empty());
        }

        #[test]
        fn test_reshard_round_trip_with_sub_axes(
            source in sub_axis_sharding_strategy(),
            target in sub_axis_sharding_strategy(),
        ) {
            let mesh = test_mesh(&[("w", 4), ("x", 2)]);
            check_reshard_round_trip(&source, &target, &mesh);
        }
    }
}
