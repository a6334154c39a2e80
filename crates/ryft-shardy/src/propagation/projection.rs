//! Projection of tensor shardings onto the factors of an [`OpShardingRule`].
//!
//! The axes of a dimension are distributed over the factors of that dimension from major to minor. Every factor that
//! is not the minor-most one takes axes until the product of their sizes reaches the factor size, splitting an axis
//! into sub-axes if it only partially fits. If an axis neither divides nor is divided by the remaining capacity of the
//! factor, the axis is still assigned to it, and every remaining axis of the dimension becomes _overflow_ of that
//! factor. The minor-most factor takes whatever is left.
//!
//! Projecting back concatenates the axes (and overflow axes) of the factors of each dimension, so a projection that was
//! not modified reproduces the original axes exactly (up to merging adjacent sub-axes).

use std::collections::{BTreeMap, VecDeque};

use crate::mesh::{AxisRef, Mesh, merge_adjacent};
use crate::rules::{OpShardingRule, TensorMapping};
use crate::sharding::TensorSharding;

/// Position of a tensor among the operands or results of an operation.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TensorIndex {
    Operand(usize),
    Result(usize),
}

/// Sharding of one factor in one tensor.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FactorSharding {
    /// Axes that shard this factor, from major to minor.
    pub axes: Vec<AxisRef>,

    /// Whether the dimension this factor belongs to is closed.
    pub is_closed: bool,

    /// Whether this is the minor-most factor of its dimension.
    pub is_minor_most: bool,

    /// Axes of the dimension that could not be assigned to any factor because an axis before them does not evenly
    /// fit this factor.
    pub overflow_axes: Vec<AxisRef>,
}

/// Factor shardings of one tensor, together with the axes the tensor uses outside of its dimensions.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TensorFactorShardings {
    factor_shardings: BTreeMap<usize, FactorSharding>,
    replicated_axes: Vec<AxisRef>,
    unreduced_axes: Vec<AxisRef>,
}

impl TensorFactorShardings {
    fn project(sharding: Option<&TensorSharding>, mapping: &TensorMapping, rule: &OpShardingRule, mesh: &Mesh) -> Self {
        let mut factor_shardings = BTreeMap::new();
        for (dimension, factors) in mapping.dimensions().iter().enumerate() {
            let dimension_sharding = sharding.and_then(|sharding| sharding.dimension_sharding(dimension));
            let is_closed = dimension_sharding.is_some_and(|dimension| dimension.is_closed());
            let mut axes = dimension_sharding
                .map(|dimension| dimension.axes().iter().cloned().collect::<VecDeque<_>>())
                .unwrap_or_default();
            for (position, factor) in factors.iter().enumerate() {
                let mut factor_sharding = FactorSharding {
                    is_closed,
                    is_minor_most: position + 1 == factors.len(),
                    ..FactorSharding::default()
                };
                if factor_sharding.is_minor_most {
                    factor_sharding.axes.extend(axes.drain(..));
                } else {
                    let mut capacity = rule.factor_size(*factor);
                    while capacity > 1 {
                        let Some(axis) = axes.pop_front() else {
                            break;
                        };
                        let size = axis.size(mesh);
                        if capacity % size == 0 {
                            capacity /= size;
                            factor_sharding.axes.push(axis);
                        } else if let Some((major, minor)) =
                            (size % capacity == 0).then(|| axis.split(capacity, mesh)).flatten()
                        {
                            capacity = 1;
                            factor_sharding.axes.push(major);
                            axes.push_front(minor);
                        } else {
                            capacity = 1;
                            factor_sharding.axes.push(axis);
                            factor_sharding.overflow_axes.extend(axes.drain(..));
                        }
                    }
                }
                factor_shardings.insert(*factor, factor_sharding);
            }
        }
        let (replicated_axes, unreduced_axes) = sharding
            .map(|sharding| (sharding.replicated_axes().to_vec(), sharding.unreduced_axes().to_vec()))
            .unwrap_or_default();
        Self { factor_shardings, replicated_axes, unreduced_axes }
    }

    pub fn factor_sharding(&self, factor: usize) -> Option<&FactorSharding> {
        self.factor_shardings.get(&factor)
    }

    pub(crate) fn factor_sharding_mut(&mut self, factor: usize) -> Option<&mut FactorSharding> {
        self.factor_shardings.get_mut(&factor)
    }

    /// Returns every axis this tensor uses, except for the axes of `excluded_factor`.
    pub fn used_axes_except(&self, excluded_factor: usize) -> Vec<&AxisRef> {
        self.factor_shardings
            .iter()
            .flat_map(|(factor, sharding)| {
                let axes = if *factor == excluded_factor { &[][..] } else { sharding.axes.as_slice() };
                axes.iter().chain(sharding.overflow_axes.iter())
            })
            .chain(self.replicated_axes.iter())
            .chain(self.unreduced_axes.iter())
            .collect()
    }

    /// Axes of `dimension` obtained by concatenating the axes of its factors, followed by their overflow axes.
    pub fn dimension_axes(&self, mapping: &TensorMapping, dimension: usize, mesh: &Mesh) -> Vec<AxisRef> {
        let mut axes = Vec::new();
        for factor in mapping.factors(dimension) {
            if let Some(sharding) = self.factor_shardings.get(factor) {
                axes.extend(sharding.axes.iter().cloned());
                axes.extend(sharding.overflow_axes.iter().cloned());
            }
        }
        merge_adjacent(&axes, mesh)
    }
}

/// Factor shardings of all operands and results of an operation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShardingProjection {
    operands: Vec<TensorFactorShardings>,
    results: Vec<TensorFactorShardings>,
}

impl ShardingProjection {
    /// Projects the shardings of the operands and results of an operation onto the factors of `rule`. Tensors
    /// without a sharding are treated as fully open and unsharded.
    pub fn new(
        operand_shardings: &[Option<&TensorSharding>],
        result_shardings: &[Option<&TensorSharding>],
        rule: &OpShardingRule,
        mesh: &Mesh,
    ) -> Self {
        let project = |shardings: &[Option<&TensorSharding>], mappings: &[TensorMapping]| {
            mappings
                .iter()
                .enumerate()
                .map(|(index, mapping)| {
                    let sharding = shardings.get(index).copied().flatten();
                    TensorFactorShardings::project(sharding, mapping, rule, mesh)
                })
                .collect::<Vec<_>>()
        };
        Self {
            operands: project(operand_shardings, rule.operand_mappings()),
            results: project(result_shardings, rule.result_mappings()),
        }
    }

    pub fn tensor(&self, index: TensorIndex) -> &TensorFactorShardings {
        match index {
            TensorIndex::Operand(index) => &self.operands[index],
            TensorIndex::Result(index) => &self.results[index],
        }
    }

    pub(crate) fn tensor_mut(&mut self, index: TensorIndex) -> &mut TensorFactorShardings {
        match index {
            TensorIndex::Operand(index) => &mut self.operands[index],
            TensorIndex::Result(index) => &mut self.results[index],
        }
    }

    /// Indices of all operands followed by all results.
    pub fn tensor_indices(&self) -> impl Iterator<Item = TensorIndex> + use<> {
        let operands = (0..self.operands.len()).map(TensorIndex::Operand);
        let results = (0..self.results.len()).map(TensorIndex::Result);
        operands.chain(results)
    }
}

/// Returns the mapping of tensor `index` in `rule`.
pub fn tensor_mapping(rule: &OpShardingRule, index: TensorIndex) -> &TensorMapping {
    match index {
        TensorIndex::Operand(index) => &rule.operand_mappings()[index],
        TensorIndex::Result(index) => &rule.result_mappings()[index],
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use crate::mesh::tests::test_mesh;
    use crate::rules::OpShardingRuleBuilder;
    use crate::sharding::DimensionSharding;

    use super::*;

    fn reshape_like_rule() -> OpShardingRule {
        // [8] -> [2, 4]
        let mut builder = OpShardingRuleBuilder::new(&[vec![8]], &[vec![2, 4]]);
        builder
            .add_factor(&[Some(0)], &[Some(0)], 2, Default::default(), false)
            .add_factor(&[Some(0)], &[Some(1)], 4, Default::default(), false);
        builder.build()
    }

    #[test]
    fn test_projection_splits_axes_across_factors() {
        let mesh = test_mesh(&[("x", 4), ("y", 2)]);
        let rule = reshape_like_rule();
        let sharding = TensorSharding::new("mesh", vec![DimensionSharding::open(vec![AxisRef::new("x"), AxisRef::new("y")])]);
        let projection = ShardingProjection::new(&[Some(&sharding)], &[None], &rule, &mesh);
        let operand = projection.tensor(TensorIndex::Operand(0));
        assert_eq!(operand.factor_sharding(0).unwrap().axes, vec![AxisRef::sub_axis("x", 1, 2)]);
        assert_eq!(operand.factor_sharding(1).unwrap().axes, vec![AxisRef::sub_axis("x", 2, 2), AxisRef::new("y")]);
        assert!(operand.factor_sharding(1).unwrap().is_minor_most);
        assert!(!operand.factor_sharding(0).unwrap().is_closed);
        assert_eq!(
            operand.dimension_axes(&rule.operand_mappings()[0], 0, &mesh),
            vec![AxisRef::new("x"), AxisRef::new("y")],
        );

        let result = projection.tensor(TensorIndex::Result(0));
        assert_eq!(result.factor_sharding(0).unwrap(), &FactorSharding { is_minor_most: true, ..Default::default() });
        assert_eq!(projection.tensor_indices().collect::<Vec<_>>(), vec![TensorIndex::Operand(0), TensorIndex::Result(0)]);
    }

    #[test]
    fn test_projection_overflow() {
        let mesh = test_mesh(&[("x", 3), ("y", 2)]);
        let rule = reshape_like_rule();
        let sharding = TensorSharding::new("mesh", vec![DimensionSharding::closed(vec![AxisRef::new("x"), AxisRef::new("y")])]);
        let projection = ShardingProjection::new(&[Some(&sharding)], &[None], &rule, &mesh);
        let operand = projection.tensor(TensorIndex::Operand(0));
        let major = operand.factor_sharding(0).unwrap();
        assert_eq!(major.axes, vec![AxisRef::new("x")]);
        assert_eq!(major.overflow_axes, vec![AxisRef::new("y")]);
        assert!(major.is_closed);
        assert!(operand.factor_sharding(1).unwrap().axes.is_empty());
        assert_eq!(operand.used_axes_except(0), vec![&AxisRef::new("y")]);
        assert_eq!(
            operand.dimension_axes(&rule.operand_mappings()[0], 0, &mesh),
            vec![AxisRef::new("x"), AxisRef::new("y")],
        );
    }
}
