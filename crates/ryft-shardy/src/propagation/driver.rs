use std::collections::{BTreeSet, VecDeque};

use tracing::{debug, trace, warn};

use crate::errors::Error;
use crate::graph::{Module, Operation, OperationId, ValueId};
use crate::mesh::{AxisRef, Mesh};
use crate::options::PropagationOptions;
use crate::rules::OpShardingRule;

use super::ShardingTable;
use super::debug::DebugRecorder;
use super::factor_propagation::{ConflictResolutionPolicy, FactorPropagation};
use super::op_priority::{OpPriorityHeuristic, PropagationDirection, direction_for_pass};
use super::projection::{ShardingProjection, TensorIndex, tensor_mapping};

/// Refinement of one dimension sharding requested by propagating through an operation.
#[derive(Clone, Debug, PartialEq, Eq)]
struct ShardingUpdate {
    value: ValueId,
    dimension: usize,
    axes: Vec<AxisRef>,
    source: ValueId,
}

/// Worklist-based propagation driver.
///
/// Operations are processed in FIFO order, starting from all operations in program order. Whenever the sharding of a
/// value changes, the operation that produces it and every operation that uses it are enqueued again (unless they
/// already are). Deciding how an operation changes shardings is a pure function of the current [`ShardingTable`],
/// and all changes are applied through [`ShardingTable::refine`].
pub(crate) struct PropagationDriver<'a> {
    module: &'a Module,
    users: Vec<Vec<OperationId>>,
    options: &'a PropagationOptions,
    policy: &'a dyn ConflictResolutionPolicy,
}

impl<'a> PropagationDriver<'a> {
    pub(crate) fn new(
        module: &'a Module,
        options: &'a PropagationOptions,
        policy: &'a dyn ConflictResolutionPolicy,
    ) -> Self {
        Self { module, users: module.users(), options, policy }
    }

    /// Runs one propagation pass per op-priority heuristic (or a single pass in both directions if op-priority
    /// propagation is disabled), returning `true` if any sharding changed.
    pub(crate) fn run_op_priority_passes(
        &self,
        table: &mut ShardingTable,
        heuristics: &[OpPriorityHeuristic],
        recorder: &mut DebugRecorder,
    ) -> Result<bool, Error> {
        if !self.options.run_op_priority_propagation || heuristics.is_empty() {
            return self.run(table, |_| PropagationDirection::Both, recorder);
        }
        let mut changed = false;
        for pass in 0..heuristics.len() {
            debug!(pass, "running op-priority propagation pass");
            changed |= self.run(table, |operation| direction_for_pass(heuristics, pass, operation), recorder)?;
        }
        Ok(changed)
    }

    /// Runs the worklist until it is empty, returning `true` if any sharding changed. Exceeding the configured number
    /// of iterations only logs a warning, since every update goes through the monotone [`ShardingTable::refine`].
    pub(crate) fn run<D>(&self, table: &mut ShardingTable, direction_of: D, recorder: &mut DebugRecorder) -> Result<bool, Error>
    where
        D: Fn(&Operation) -> PropagationDirection,
    {
        let operation_count = self.module.operations().len();
        let mut queue = (0..operation_count).map(OperationId).collect::<VecDeque<_>>();
        let mut is_queued = vec![true; operation_count];
        let mut iterations = 0usize;
        let mut changed = false;
        while let Some(operation_id) = queue.pop_front() {
            is_queued[operation_id.0] = false;
            if iterations == self.options.max_worklist_iterations {
                warn!(
                    max_iterations = self.options.max_worklist_iterations,
                    pending_operations = queue.len() + 1,
                    "sharding propagation exceeded its expected number of iterations",
                );
            }
            iterations += 1;

            let operation = self.module.operation(operation_id)?;
            let direction = direction_of(operation);
            let Some(rule) = operation.sharding_rule() else {
                continue;
            };
            if direction == PropagationDirection::None {
                continue;
            }
            let Some((mesh_name, mesh, updates)) = self.decide(operation, rule, direction, table)? else {
                continue;
            };
            for update in updates {
                let previous_axes = table
                    .get(update.value)
                    .and_then(|sharding| sharding.dimension_sharding(update.dimension))
                    .map(|dimension| dimension.axes().to_vec())
                    .unwrap_or_default();
                if !table.refine(update.value, update.dimension, &update.axes, mesh_name, mesh) {
                    continue;
                }
                trace!(
                    operation = operation.name(),
                    value = %update.value,
                    dimension = update.dimension,
                    sharding = %table.get(update.value).map(ToString::to_string).unwrap_or_default(),
                    "refined sharding",
                );
                recorder.record_update(
                    operation_id,
                    update.source,
                    update.value,
                    update.dimension,
                    &previous_axes,
                    &update.axes,
                    mesh,
                );
                changed = true;
                let value = self.module.value(update.value)?;
                let neighbors = value.producer().into_iter().chain(self.users[update.value.0].iter().copied());
                for neighbor in neighbors {
                    if !is_queued[neighbor.0] {
                        is_queued[neighbor.0] = true;
                        queue.push_back(neighbor);
                    }
                }
            }
        }
        Ok(changed)
    }

    /// Computes the sharding updates that propagating through `operation` in `direction` would make. Returns `None`
    /// if none of the operands and results are sharded, or if they are sharded over different meshes.
    fn decide(
        &self,
        operation: &Operation,
        rule: &OpShardingRule,
        direction: PropagationDirection,
        table: &ShardingTable,
    ) -> Result<Option<(&'a str, &'a Mesh, Vec<ShardingUpdate>)>, Error> {
        let shardings = |values: &[ValueId]| values.iter().map(|value| table.get(*value)).collect::<Vec<_>>();
        let operand_shardings = shardings(operation.operands());
        let result_shardings = shardings(operation.results());
        let mesh_names = operand_shardings
            .iter()
            .chain(result_shardings.iter())
            .flatten()
            .map(|sharding| sharding.mesh_name())
            .collect::<BTreeSet<_>>();
        let mesh_name = match mesh_names.len() {
            0 => return Ok(None),
            1 => mesh_names.into_iter().next().unwrap_or_default(),
            _ => {
                debug!(
                    operation = operation.name(),
                    meshes = ?mesh_names,
                    "skipping operation whose operands and results are sharded over different meshes",
                );
                return Ok(None);
            }
        };
        let (mesh_name, mesh) = self
            .module
            .meshes()
            .get_key_value(mesh_name)
            .ok_or_else(|| Error::UnknownMesh { mesh_name: mesh_name.to_string() })?;

        let mut projection = ShardingProjection::new(&operand_shardings, &result_shardings, rule, mesh);
        let factor_propagation = FactorPropagation::new(
            mesh,
            self.options.propagation_strategy,
            self.policy,
            self.options.conservative_propagation,
        );
        let factor_updates = factor_propagation.propagate(&mut projection, rule, direction);

        let value_of = |index: TensorIndex| match index {
            TensorIndex::Operand(index) => operation.operands()[index],
            TensorIndex::Result(index) => operation.results()[index],
        };
        let mut updated_dimensions = BTreeSet::new();
        let mut updates = Vec::new();
        for factor_update in &factor_updates {
            let mapping = tensor_mapping(rule, factor_update.target);
            let Some((dimension, _)) = mapping.position_of(factor_update.factor) else {
                continue;
            };
            if !updated_dimensions.insert((factor_update.target, dimension)) {
                continue;
            }
            updates.push(ShardingUpdate {
                value: value_of(factor_update.target),
                dimension,
                axes: projection.tensor(factor_update.target).dimension_axes(mapping, dimension, mesh),
                source: value_of(factor_update.source),
            });
        }
        Ok(Some((mesh_name.as_str(), mesh, updates)))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use pretty_assertions::assert_eq;

    use crate::graph::Attributes;
    use crate::mesh::tests::test_mesh;
    use crate::propagation::factor_propagation::LargestShardedSize;
    use crate::rules::ShardingRuleRegistry;
    use crate::sharding::{DimensionSharding, TensorSharding};

    use super::*;

    /// Attaches the default sharding rule to every operation of `module`.
    pub(crate) fn attach_sharding_rules(module: &mut Module) {
        let registry = ShardingRuleRegistry::default();
        for index in 0..module.operations().len() {
            let operation = OperationId(index);
            let (operand_shapes, result_shapes) = module.operand_and_result_shapes(operation).unwrap();
            let rule = {
                let operation = module.operation(operation).unwrap();
                registry.rule_for(operation.name(), operation.attributes(), &operand_shapes, &result_shapes).unwrap()
            };
            module.set_sharding_rule(operation, Some(rule)).unwrap();
        }
    }

    fn rendered(table: &ShardingTable, value: ValueId) -> Option<String> {
        table.get(value).map(ToString::to_string)
    }

    #[test]
    fn test_run_converges_past_max_worklist_iterations() {
        let mut module = Module::new();
        module.add_mesh("mesh", test_mesh(&[("x", 2), ("y", 2)]));
        let sharding = TensorSharding::new(
            "mesh",
            vec![DimensionSharding::closed(vec![AxisRef::new("x")]), DimensionSharding::closed(Vec::new())],
        );
        let argument = module.add_argument(vec![8, 8], Some(sharding.clone()));
        let negated = module.add_operation("stablehlo.negate", vec![argument], vec![vec![8, 8]], Attributes::new()).unwrap();
        let negated = module.add_operation("stablehlo.negate", negated, vec![vec![8, 8]], Attributes::new()).unwrap();
        attach_sharding_rules(&mut module);

        let options = PropagationOptions { max_worklist_iterations: 1, ..PropagationOptions::default() };
        let driver = PropagationDriver::new(&module, &options, &LargestShardedSize);
        let mut table = ShardingTable::new(&module);
        table.set(argument, Some(sharding));
        let mut recorder = DebugRecorder::new(false, false);
        assert_eq!(driver.run(&mut table, |_| PropagationDirection::Both, &mut recorder), Ok(true));
        assert_eq!(rendered(&table, negated[0]).as_deref(), Some("#sdy.sharding<@mesh, [{\"x\", ?}, {?}]>"));

        // Running again from the fixed point changes nothing.
        assert_eq!(driver.run(&mut table, |_| PropagationDirection::Both, &mut recorder), Ok(false));
    }

    #[test]
    fn test_run_respects_propagation_directions() {
        let mut module = Module::new();
        module.add_mesh("mesh", test_mesh(&[("x", 2), ("y", 2)]));
        let argument = module.add_argument(vec![8], None);
        let negated = module.add_operation("stablehlo.negate", vec![argument], vec![vec![8]], Attributes::new()).unwrap();
        attach_sharding_rules(&mut module);

        let options = PropagationOptions::default();
        let driver = PropagationDriver::new(&module, &options, &LargestShardedSize);
        let mut table = ShardingTable::new(&module);
        table.set(negated[0], Some(TensorSharding::new("mesh", vec![DimensionSharding::open(vec![AxisRef::new("y")])])));
        let mut recorder = DebugRecorder::new(false, false);

        assert_eq!(driver.run(&mut table, |_| PropagationDirection::Forward, &mut recorder), Ok(false));
        assert_eq!(rendered(&table, argument), None);

        assert_eq!(driver.run(&mut table, |_| PropagationDirection::Backward, &mut recorder), Ok(true));
        assert_eq!(rendered(&table, argument).as_deref(), Some("#sdy.sharding<@mesh, [{\"y\", ?}]>"));
    }

    #[test]
    fn test_run_skips_operations_without_rules() {
        let mut module = Module::new();
        module.add_mesh("mesh", test_mesh(&[("x", 2)]));
        let argument = module.add_argument(vec![8], None);
        let negated = module.add_operation("stablehlo.negate", vec![argument], vec![vec![8]], Attributes::new()).unwrap();

        let options = PropagationOptions::default();
        let driver = PropagationDriver::new(&module, &options, &LargestShardedSize);
        let mut table = ShardingTable::new(&module);
        table.set(argument, Some(TensorSharding::new("mesh", vec![DimensionSharding::open(vec![AxisRef::new("x")])])));
        let mut recorder = DebugRecorder::new(false, false);
        assert_eq!(driver.run_op_priority_passes(&mut table, &[], &mut recorder), Ok(false));
        assert_eq!(rendered(&table, negated[0]), None);
    }
}
