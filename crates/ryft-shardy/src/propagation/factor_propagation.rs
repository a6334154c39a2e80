//! Reconciliation of factor shardings across the tensors of one operation.
//!
//! For every factor that can be propagated (i.e., that is neither blocked nor a need-replication factor), a
//! _candidate_ axis list is computed from the shardings of that factor in the source tensors, and each target tensor
//! is extended towards the candidate as far as it can be:
//!
//! | Strategy | Candidate |
//! |---|---|
//! | [`PropagationStrategy::Basic`] | Longest common prefix of all non-empty source axis lists |
//! | [`PropagationStrategy::Aggressive`] | Source axis list picked by a [`ConflictResolutionPolicy`] |
//!
//! A target is only updated if its current axis list is a prefix of the candidate, so factor shardings only ever grow
//! by appending minor axes.

use std::fmt::Debug;

use crate::compatibility::{common_prefix_of_all, overlaps_any, strip_prefix};
use crate::mesh::{AxisRef, Mesh, total_size};
use crate::rules::{FactorType, OpShardingRule};

use super::op_priority::PropagationDirection;
use super::projection::{ShardingProjection, TensorIndex, tensor_mapping};

/// Strategy used to compute the candidate sharding of a factor from the shardings of its source tensors.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum PropagationStrategy {
    /// Only propagates the axes that all sharded sources agree on.
    Basic,

    /// Resolves conflicts between sources by picking one of them with a [`ConflictResolutionPolicy`].
    #[default]
    Aggressive,
}

/// Policy that picks a winner among conflicting factor shardings in [`PropagationStrategy::Aggressive`] mode.
pub trait ConflictResolutionPolicy: Debug + Send + Sync {
    /// Returns the index of the winning candidate among `candidates`, which are all non-empty and ordered with operand
    /// shardings before result shardings. Returning `None` leaves the factor unchanged.
    fn select(&self, candidates: &[&[AxisRef]], mesh: &Mesh) -> Option<usize>;
}

/// Picks the candidate with the largest total sharded size, breaking ties in favor of the earliest candidate.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct LargestShardedSize;

impl ConflictResolutionPolicy for LargestShardedSize {
    fn select(&self, candidates: &[&[AxisRef]], mesh: &Mesh) -> Option<usize> {
        let mut best: Option<(usize, usize)> = None;
        for (index, candidate) in candidates.iter().enumerate() {
            let size = total_size(candidate, mesh);
            if best.is_none_or(|(_, best_size)| size > best_size) {
                best = Some((index, size));
            }
        }
        best.map(|(index, _)| index)
    }
}

/// Update of one factor sharding of one tensor, produced by [`FactorPropagation::propagate`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FactorUpdate {
    pub factor: usize,
    pub target: TensorIndex,

    /// Source tensor whose sharding provided the new axes.
    pub source: TensorIndex,
}

/// Factor-level propagation step.
#[derive(Debug)]
pub struct FactorPropagation<'a> {
    mesh: &'a Mesh,
    strategy: PropagationStrategy,
    policy: &'a dyn ConflictResolutionPolicy,
    is_conservative: bool,
}

impl<'a> FactorPropagation<'a> {
    pub fn new(
        mesh: &'a Mesh,
        strategy: PropagationStrategy,
        policy: &'a dyn ConflictResolutionPolicy,
        is_conservative: bool,
    ) -> Self {
        Self { mesh, strategy, policy, is_conservative }
    }

    /// Propagates the factor shardings of `projection` in `direction` and returns the factor shardings that changed.
    /// Factors are processed in index order and each update is visible to the factors processed after it.
    pub fn propagate(
        &self,
        projection: &mut ShardingProjection,
        rule: &OpShardingRule,
        direction: PropagationDirection,
    ) -> Vec<FactorUpdate> {
        let mut updates = Vec::new();
        if direction == PropagationDirection::None {
            return updates;
        }
        for factor in 0..rule.factor_count() {
            if rule.is_blocked(factor) || rule.factor_type(factor) == FactorType::NeedReplication {
                continue;
            }
            let tensors = projection
                .tensor_indices()
                .filter(|index| projection.tensor(*index).factor_sharding(factor).is_some())
                .collect::<Vec<_>>();
            let is_source = |index: &TensorIndex| match index {
                TensorIndex::Operand(_) => direction.propagates_forward(),
                TensorIndex::Result(_) => direction.propagates_backward(),
            };
            let is_target = |index: &TensorIndex| match index {
                TensorIndex::Operand(_) => direction.propagates_backward(),
                TensorIndex::Result(_) => direction.propagates_forward(),
            };
            let sources = tensors
                .iter()
                .copied()
                .filter(is_source)
                .filter_map(|index| {
                    let axes = projection.tensor(index).factor_sharding(factor)?.axes.clone();
                    (!axes.is_empty()).then_some((index, axes))
                })
                .collect::<Vec<_>>();
            let Some((candidate, source)) = self.candidate(&sources) else {
                continue;
            };
            for target in tensors.iter().copied().filter(is_target) {
                if self.extend(projection, rule, factor, target, &candidate) {
                    updates.push(FactorUpdate { factor, target, source });
                }
            }
        }
        updates
    }

    fn candidate(&self, sources: &[(TensorIndex, Vec<AxisRef>)]) -> Option<(Vec<AxisRef>, TensorIndex)> {
        let (first_source, _) = sources.first()?;
        match self.strategy {
            PropagationStrategy::Basic => {
                let candidate = common_prefix_of_all(sources.iter().map(|(_, axes)| axes.as_slice()), self.mesh);
                (!candidate.is_empty()).then_some((candidate, *first_source))
            }
            PropagationStrategy::Aggressive => {
                let candidates = sources.iter().map(|(_, axes)| axes.as_slice()).collect::<Vec<_>>();
                let selected = self.policy.select(&candidates, self.mesh)?;
                sources.get(selected).map(|(index, axes)| (axes.clone(), *index))
            }
        }
    }

    /// Returns `true` if the sharding of `factor` in tensor `target` may be extended with further minor axes.
    fn can_expand(&self, projection: &ShardingProjection, rule: &OpShardingRule, factor: usize, target: TensorIndex) -> bool {
        let tensor = projection.tensor(target);
        let Some(sharding) = tensor.factor_sharding(factor) else {
            return false;
        };
        if sharding.is_closed || !sharding.overflow_axes.is_empty() {
            return false;
        }
        let mapping = tensor_mapping(rule, target);
        let Some((dimension, position)) = mapping.position_of(factor) else {
            return false;
        };
        let factors = mapping.factors(dimension);
        let are_major_factors_full = factors[..position].iter().all(|major| {
            tensor
                .factor_sharding(*major)
                .is_some_and(|major_sharding| total_size(&major_sharding.axes, self.mesh) == rule.factor_size(*major))
        });
        let are_minor_factors_empty = sharding.is_minor_most
            || factors[position + 1..]
                .iter()
                .all(|minor| tensor.factor_sharding(*minor).is_none_or(|minor_sharding| minor_sharding.axes.is_empty()));
        are_major_factors_full && are_minor_factors_empty
    }

    /// Extends the sharding of `factor` in `target` towards `candidate`, returning `true` if it changed.
    fn extend(
        &self,
        projection: &mut ShardingProjection,
        rule: &OpShardingRule,
        factor: usize,
        target: TensorIndex,
        candidate: &[AxisRef],
    ) -> bool {
        if !self.can_expand(projection, rule, factor, target) {
            return false;
        }
        let tensor = projection.tensor(target);
        let Some(sharding) = tensor.factor_sharding(factor) else {
            return false;
        };
        let Some(remainder) = strip_prefix(candidate, &sharding.axes, self.mesh) else {
            return false;
        };
        let used_elsewhere = tensor.used_axes_except(factor);
        let factor_size = rule.factor_size(factor);
        let mut axes = sharding.axes.clone();
        let mut sharded_size = total_size(&axes, self.mesh);
        for axis in remainder {
            if overlaps_any(&axis, used_elsewhere.iter().copied(), self.mesh) {
                break;
            }
            if self.is_conservative && axis.is_sub_axis() {
                break;
            }
            let size = axis.size(self.mesh);
            if factor_size % (sharded_size * size) == 0 {
                sharded_size *= size;
                axes.push(axis);
                continue;
            }
            if self.is_conservative {
                break;
            }
            if sharding.is_minor_most && sharded_size < factor_size {
                axes.push(axis);
                break;
            }
            if factor_size % sharded_size == 0 {
                let divisor = gcd(factor_size / sharded_size, size);
                if let Some((major, _)) = axis.split(divisor, self.mesh) {
                    axes.push(major);
                }
            }
            break;
        }
        if axes.len() == sharding.axes.len() {
            return false;
        }
        if let Some(sharding) = projection.tensor_mut(target).factor_sharding_mut(factor) {
            sharding.axes = axes;
        }
        true
    }
}

fn gcd(mut lhs: usize, mut rhs: usize) -> usize {
    while rhs != 0 {
        (lhs, rhs) = (rhs, lhs % rhs);
    }
    lhs
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use crate::mesh::tests::test_mesh;
    use crate::rules::OpShardingRuleBuilder;
    use crate::sharding::{DimensionSharding, TensorSharding};

    use super::*;

    fn sharding(dimensions: Vec<DimensionSharding>) -> TensorSharding {
        TensorSharding::new("mesh", dimensions)
    }

    fn factor_axes(projection: &ShardingProjection, index: TensorIndex, factor: usize) -> Vec<AxisRef> {
        projection.tensor(index).factor_sharding(factor).unwrap().axes.clone()
    }

    #[test]
    fn test_largest_sharded_size_policy() {
        let mesh = test_mesh(&[("x", 2), ("y", 4)]);
        let x = [AxisRef::new("x")];
        let y = [AxisRef::new("y")];
        let x_major = [AxisRef::sub_axis("y", 1, 2)];
        assert_eq!(LargestShardedSize.select(&[&x[..], &y[..]], &mesh), Some(1));
        assert_eq!(LargestShardedSize.select(&[&x[..], &x_major[..]], &mesh), Some(0));
        assert_eq!(LargestShardedSize.select(&[], &mesh), None);
    }

    #[test]
    fn test_pointwise_propagation_in_both_directions() {
        let mesh = test_mesh(&[("x", 2), ("y", 2)]);
        let shapes = vec![vec![8, 8]];
        let rule = OpShardingRuleBuilder::build_pointwise(&shapes, &shapes);
        let operand = sharding(vec![DimensionSharding::open(vec![AxisRef::new("x")]), DimensionSharding::open(Vec::new())]);
        let result = sharding(vec![DimensionSharding::open(Vec::new()), DimensionSharding::open(vec![AxisRef::new("y")])]);
        let mut projection = ShardingProjection::new(&[Some(&operand)], &[Some(&result)], &rule, &mesh);
        let propagation = FactorPropagation::new(&mesh, PropagationStrategy::Aggressive, &LargestShardedSize, false);
        let updates = propagation.propagate(&mut projection, &rule, PropagationDirection::Both);
        assert_eq!(
            updates,
            vec![
                FactorUpdate { factor: 0, target: TensorIndex::Result(0), source: TensorIndex::Operand(0) },
                FactorUpdate { factor: 1, target: TensorIndex::Operand(0), source: TensorIndex::Result(0) },
            ],
        );
        assert_eq!(factor_axes(&projection, TensorIndex::Result(0), 0), vec![AxisRef::new("x")]);
        assert_eq!(factor_axes(&projection, TensorIndex::Operand(0), 1), vec![AxisRef::new("y")]);
    }

    #[test]
    fn test_direction_restricts_sources_and_targets() {
        let mesh = test_mesh(&[("x", 2)]);
        let shapes = vec![vec![8]];
        let rule = OpShardingRuleBuilder::build_pointwise(&shapes, &shapes);
        let result = sharding(vec![DimensionSharding::open(vec![AxisRef::new("x")])]);
        let mut projection = ShardingProjection::new(&[None], &[Some(&result)], &rule, &mesh);
        let propagation = FactorPropagation::new(&mesh, PropagationStrategy::Aggressive, &LargestShardedSize, false);
        assert!(propagation.propagate(&mut projection, &rule, PropagationDirection::Forward).is_empty());
        assert!(propagation.propagate(&mut projection, &rule, PropagationDirection::None).is_empty());
        assert_eq!(propagation.propagate(&mut projection, &rule, PropagationDirection::Backward).len(), 1);
        assert_eq!(factor_axes(&projection, TensorIndex::Operand(0), 0), vec![AxisRef::new("x")]);
    }

    #[test]
    fn test_basic_strategy_uses_common_prefix() {
        let mesh = test_mesh(&[("x", 2), ("y", 2), ("z", 2)]);
        let shapes = vec![vec![8], vec![8]];
        let rule = OpShardingRuleBuilder::build_pointwise(&shapes, &[vec![8]]);
        let lhs = sharding(vec![DimensionSharding::open(vec![AxisRef::new("x"), AxisRef::new("y")])]);
        let rhs = sharding(vec![DimensionSharding::open(vec![AxisRef::new("x"), AxisRef::new("z")])]);

        let mut projection = ShardingProjection::new(&[Some(&lhs), Some(&rhs)], &[None], &rule, &mesh);
        let basic = FactorPropagation::new(&mesh, PropagationStrategy::Basic, &LargestShardedSize, false);
        basic.propagate(&mut projection, &rule, PropagationDirection::Forward);
        assert_eq!(factor_axes(&projection, TensorIndex::Result(0), 0), vec![AxisRef::new("x")]);

        let mut projection = ShardingProjection::new(&[Some(&lhs), Some(&rhs)], &[None], &rule, &mesh);
        let aggressive = FactorPropagation::new(&mesh, PropagationStrategy::Aggressive, &LargestShardedSize, false);
        aggressive.propagate(&mut projection, &rule, PropagationDirection::Both);
        assert_eq!(factor_axes(&projection, TensorIndex::Result(0), 0), vec![AxisRef::new("x"), AxisRef::new("y")]);
        assert_eq!(factor_axes(&projection, TensorIndex::Operand(1), 0), vec![AxisRef::new("x"), AxisRef::new("z")]);
    }

    #[test]
    fn test_closed_and_blocked_factors_are_not_updated() {
        let mesh = test_mesh(&[("x", 2)]);
        let shapes = vec![vec![8, 8]];
        let mut builder = OpShardingRuleBuilder::new(&shapes, &shapes);
        builder.add_pointwise_with_blocking(&[8, 8], |_| FactorType::PassThrough, |dimension| dimension == 1);
        let rule = builder.build();
        let operand = sharding(vec![DimensionSharding::open(Vec::new()), DimensionSharding::open(vec![AxisRef::new("x")])]);
        let result = sharding(vec![DimensionSharding::closed(Vec::new()), DimensionSharding::open(Vec::new())]);
        let mut projection = ShardingProjection::new(&[Some(&operand)], &[Some(&result)], &rule, &mesh);
        let propagation = FactorPropagation::new(&mesh, PropagationStrategy::Aggressive, &LargestShardedSize, false);
        assert!(propagation.propagate(&mut projection, &rule, PropagationDirection::Both).is_empty());
    }

    #[test]
    fn test_axes_used_by_other_factors_are_not_reused() {
        let mesh = test_mesh(&[("x", 2), ("y", 2)]);
        let shapes = vec![vec![8, 8]];
        let rule = OpShardingRuleBuilder::build_pointwise(&shapes, &shapes);
        let operand = sharding(vec![DimensionSharding::open(vec![AxisRef::new("x")]), DimensionSharding::open(Vec::new())]);
        let result = sharding(vec![DimensionSharding::open(Vec::new()), DimensionSharding::open(vec![AxisRef::new("x")])]);
        let mut projection = ShardingProjection::new(&[Some(&operand)], &[Some(&result)], &rule, &mesh);
        let propagation = FactorPropagation::new(&mesh, PropagationStrategy::Aggressive, &LargestShardedSize, false);
        assert!(propagation.propagate(&mut projection, &rule, PropagationDirection::Both).is_empty());
    }

    #[test]
    fn test_non_divisible_axes() {
        let mesh = test_mesh(&[("x", 4)]);
        let rule = OpShardingRuleBuilder::build_pointwise(&[vec![6]], &[vec![6]]);
        let operand = sharding(vec![DimensionSharding::open(vec![AxisRef::new("x")])]);

        let mut projection = ShardingProjection::new(&[Some(&operand)], &[None], &rule, &mesh);
        let aggressive = FactorPropagation::new(&mesh, PropagationStrategy::Aggressive, &LargestShardedSize, false);
        aggressive.propagate(&mut projection, &rule, PropagationDirection::Forward);
        assert_eq!(factor_axes(&projection, TensorIndex::Result(0), 0), vec![AxisRef::new("x")]);

        let mut projection = ShardingProjection::new(&[Some(&operand)], &[None], &rule, &mesh);
        let conservative = FactorPropagation::new(&mesh, PropagationStrategy::Aggressive, &LargestShardedSize, true);
        assert!(conservative.propagate(&mut projection, &rule, PropagationDirection::Forward).is_empty());
    }

    #[test]
    fn test_non_minor_factors_take_the_divisible_part_of_an_axis() {
        // [12] -> [6, 2], with a size-4 axis on the major result dimension.
        let mesh = test_mesh(&[("x", 4)]);
        let mut builder = OpShardingRuleBuilder::new(&[vec![12]], &[vec![6, 2]]);
        builder
            .add_factor(&[Some(0)], &[Some(0)], 6, FactorType::PassThrough, false)
            .add_factor(&[Some(0)], &[Some(1)], 2, FactorType::PassThrough, false);
        let rule = builder.build();
        let result = sharding(vec![DimensionSharding::open(vec![AxisRef::new("x")]), DimensionSharding::open(Vec::new())]);
        let mut projection = ShardingProjection::new(&[None], &[Some(&result)], &rule, &mesh);
        let propagation = FactorPropagation::new(&mesh, PropagationStrategy::Aggressive, &LargestShardedSize, false);
        propagation.propagate(&mut projection, &rule, PropagationDirection::Backward);
        assert_eq!(factor_axes(&projection, TensorIndex::Operand(0), 0), vec![AxisRef::sub_axis("x", 1, 2)]);
    }

    #[test]
    fn test_gcd() {
        assert_eq!(gcd(12, 8), 4);
        assert_eq!(gcd(7, 3), 1);
        assert_eq!(gcd(5, 0), 5);
    }
}
