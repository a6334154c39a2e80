//! Op-priority propagation tier.
//!
//! Some operations are better sources of sharding information than others. For instance, elementwise operations
//! never change how data is laid out, so propagating through them first tends to produce the shardings a user would
//! expect, while a broadcast should only push shardings forward before anything flows backward into its operand.
//!
//! Each heuristic maps an operation to a [`PropagationDirection`]. Propagation runs one worklist pass per heuristic,
//! where pass `p` propagates each operation in the union of the directions that heuristics `0..=p` assign to it.

use crate::graph::Operation;
use crate::rules::{FactorType, is_elementwise_operation};

/// Direction in which shardings may flow through an operation.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum PropagationDirection {
    #[default]
    None,

    /// From operands to results.
    Forward,

    /// From results to operands.
    Backward,

    Both,
}

impl PropagationDirection {
    /// Returns the direction that allows every flow that either `self` or `other` allows.
    pub fn union(self, other: Self) -> Self {
        match (self, other) {
            (Self::None, direction) | (direction, Self::None) => direction,
            (Self::Both, _) | (_, Self::Both) | (Self::Forward, Self::Backward) | (Self::Backward, Self::Forward) => {
                Self::Both
            }
            (direction, _) => direction,
        }
    }

    pub fn propagates_forward(self) -> bool {
        matches!(self, Self::Forward | Self::Both)
    }

    pub fn propagates_backward(self) -> bool {
        matches!(self, Self::Backward | Self::Both)
    }
}

/// Heuristic that assigns a propagation direction to an operation.
pub type OpPriorityHeuristic = fn(&Operation) -> PropagationDirection;

/// Default heuristics, from highest to lowest priority.
pub const DEFAULT_OP_PRIORITY_HEURISTICS: &[OpPriorityHeuristic] =
    &[pass_through_operations, broadcast_operations_forward, all_operations];

/// Propagates through operations that do not change how data is laid out: elementwise operations, transposes,
/// reshapes, and operations whose sharding rule maps every non-trivial factor, unblocked and of pass-through type, to
/// every operand and result. Broadcasts are excluded by the last condition since their new dimensions only appear in
/// the result.
pub fn pass_through_operations(operation: &Operation) -> PropagationDirection {
    let is_pass_through_rule = operation.sharding_rule().is_some_and(|rule| {
        (0..rule.factor_count()).filter(|factor| rule.factor_size(*factor) > 1).all(|factor| {
            rule.factor_type(factor) == FactorType::PassThrough
                && !rule.is_blocked(factor)
                && rule
                    .operand_mappings()
                    .iter()
                    .chain(rule.result_mappings())
                    .all(|mapping| mapping.position_of(factor).is_some())
        })
    });
    let is_pass_through = is_pass_through_rule
        || is_elementwise_operation(operation.name())
        || matches!(operation.name(), "stablehlo.transpose" | "stablehlo.reshape");
    if is_pass_through { PropagationDirection::Both } else { PropagationDirection::None }
}

/// Propagates forward through broadcasts.
pub fn broadcast_operations_forward(operation: &Operation) -> PropagationDirection {
    if operation.name() == "stablehlo.broadcast_in_dim" { PropagationDirection::Forward } else { PropagationDirection::None }
}

/// Propagates through every operation in both directions.
pub fn all_operations(_operation: &Operation) -> PropagationDirection {
    PropagationDirection::Both
}

/// Returns the direction of `operation` in the pass with index `pass`.
pub(crate) fn direction_for_pass(heuristics: &[OpPriorityHeuristic], pass: usize, operation: &Operation) -> PropagationDirection {
    heuristics
        .iter()
        .take(pass + 1)
        .fold(PropagationDirection::None, |direction, heuristic| direction.union(heuristic(operation)))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use crate::graph::{Attribute, Attributes, Module, OperationId, ValueId};
    use crate::mesh::AxisRef;
    use crate::mesh::tests::test_mesh;
    use crate::options::PropagationOptions;
    use crate::propagation::driver::tests::attach_sharding_rules;
    use crate::propagation::{LargestShardedSize, propagate_with_user_priorities};
    use crate::sharding::{DimensionSharding, TensorSharding};

    use super::*;

    #[test]
    fn test_direction_union() {
        use PropagationDirection::*;
        assert_eq!(None.union(Forward), Forward);
        assert_eq!(Backward.union(None), Backward);
        assert_eq!(Forward.union(Forward), Forward);
        assert_eq!(Forward.union(Backward), Both);
        assert_eq!(Both.union(Forward), Both);
        assert_eq!(None.union(None), None);
        assert!(Both.propagates_forward() && Both.propagates_backward());
        assert!(!Forward.propagates_backward());
    }

    #[test]
    fn test_default_heuristics() {
        let mut module = Module::new();
        let argument = module.add_argument(vec![4], None);
        let attributes = Attributes::new().with("broadcast_dimensions", Attribute::Ints(vec![0]));
        let broadcast = module
            .add_operation("stablehlo.broadcast_in_dim", vec![argument], vec![vec![4, 8]], attributes)
            .unwrap();
        module.add_operation("stablehlo.negate", broadcast, vec![vec![4, 8]], Attributes::new()).unwrap();

        let broadcast = module.operation(OperationId(0)).unwrap();
        let negate = module.operation(OperationId(1)).unwrap();
        let heuristics = DEFAULT_OP_PRIORITY_HEURISTICS;
        assert_eq!(direction_for_pass(heuristics, 0, negate), PropagationDirection::Both);
        assert_eq!(direction_for_pass(heuristics, 0, broadcast), PropagationDirection::None);
        assert_eq!(direction_for_pass(heuristics, 1, broadcast), PropagationDirection::Forward);
        assert_eq!(direction_for_pass(heuristics, 2, broadcast), PropagationDirection::Both);
    }

    /// Builds `s = add(broadcast_in_dim(a), b)` where `a` is sharded along `x` and `b` along `y`.
    fn broadcast_and_add_module() -> (Module, ValueId, ValueId) {
        let mut module = Module::new();
        module.add_mesh("mesh", test_mesh(&[("x", 2), ("y", 2)]));
        let a = module.add_argument(
            vec![8],
            Some(TensorSharding::new("mesh", vec![DimensionSharding::open(vec![AxisRef::new("x")])])),
        );
        let b = module.add_argument(
            vec![8, 8],
            Some(TensorSharding::new(
                "mesh",
                vec![DimensionSharding::open(vec![AxisRef::new("y")]), DimensionSharding::open(Vec::new())],
            )),
        );
        let attributes = Attributes::new().with("broadcast_dimensions", Attribute::Ints(vec![0]));
        let broadcast = module
            .add_operation("stablehlo.broadcast_in_dim", vec![a], vec![vec![8, 8]], attributes)
            .unwrap();
        let sum = module.add_operation("stablehlo.add", vec![broadcast[0], b], vec![vec![8, 8]], Attributes::new()).unwrap();
        attach_sharding_rules(&mut module);
        (module, broadcast[0], sum[0])
    }

    fn rendered(module: &Module, value: ValueId) -> Option<String> {
        module.value(value).unwrap().sharding().map(ToString::to_string)
    }

    #[test]
    fn test_op_priority_propagates_elementwise_operations_before_broadcasts() {
        let (mut module, broadcast, sum) = broadcast_and_add_module();
        let broadcast_operation = module.operation(OperationId(0)).unwrap();
        assert_eq!(pass_through_operations(broadcast_operation), PropagationDirection::None);
        assert_eq!(pass_through_operations(module.operation(OperationId(1)).unwrap()), PropagationDirection::Both);

        let options = PropagationOptions::default();
        propagate_with_user_priorities(&mut module, &options, &LargestShardedSize, DEFAULT_OP_PRIORITY_HEURISTICS)
            .unwrap();
        assert_eq!(rendered(&module, broadcast).as_deref(), Some("#sdy.sharding<@mesh, [{\"y\", ?}, {?}]>"));
        assert_eq!(rendered(&module, sum).as_deref(), Some("#sdy.sharding<@mesh, [{\"y\", ?}, {?}]>"));

        // A single pass in both directions reaches the broadcast first.
        let (mut module, broadcast, sum) = broadcast_and_add_module();
        let options = PropagationOptions { run_op_priority_propagation: false, ..PropagationOptions::default() };
        propagate_with_user_priorities(&mut module, &options, &LargestShardedSize, DEFAULT_OP_PRIORITY_HEURISTICS)
            .unwrap();
        assert_eq!(rendered(&module, broadcast).as_deref(), Some("#sdy.sharding<@mesh, [{\"x\", ?}, {?}]>"));
        assert_eq!(rendered(&module, sum).as_deref(), Some("#sdy.sharding<@mesh, [{\"x\", ?}, {?}]>"));
    }
}
