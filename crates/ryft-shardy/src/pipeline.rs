//! Import → propagate → export pipeline.
//!
//! [`ShardingPropagationPipeline::run`] takes a [`Module`] with user-provided shardings and turns it into a module in
//! which every sharding has been resolved and every mismatch between the sharding of an operand and the sharding its
//! operation expects has been made explicit through collective operations:
//!
//! | Stage | What it does |
//! |---|---|
//! | [`import`](ShardingPropagationPipeline::import) | Validates shardings, materializes sharding rules from the registry, and turns sharding groups into group operations |
//! | [`propagate`](ShardingPropagationPipeline::propagate) | Runs [user-priority propagation](crate::propagation::user_priority) |
//! | [`export`](ShardingPropagationPipeline::export) | Removes group operations, inserts collectives, drops non-custom rules, and closes shardings |
//!
//! When [`PropagationOptions::dump_directory`] is set, a textual snapshot of the module is written to that directory
//! before the first stage and after every stage (e.g., `02_propagate.mlir`).

use std::collections::BTreeMap;
use std::fs;

use tracing::debug;

use crate::compatibility::are_equivalent;
use crate::errors::Error;
use crate::graph::{Attribute, Attributes, Module, Operation, OperationId, ValueId};
use crate::mesh::merge_adjacent;
use crate::options::PropagationOptions;
use crate::propagation::{
    ConflictResolutionPolicy, DEFAULT_OP_PRIORITY_HEURISTICS, LargestShardedSize, OpPriorityHeuristic,
    PropagationDebugInfo, ShardingProjection, TensorIndex, propagate_with_user_priorities,
};
use crate::reshard::{Collective, is_collective_operation, reshard};
use crate::rules::{FactorType, OpShardingRule, OpShardingRuleBuilder, SHARDING_GROUP_OPERATION, ShardingRuleRegistry};
use crate::sharding::{DimensionSharding, TensorSharding};

/// Collectives that were inserted in front of an operand of an operation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InsertedReshard {
    /// Operation (in the output module) whose operand was resharded.
    pub operation: OperationId,
    pub operand_index: usize,

    /// Value that the operation used before the collectives were inserted.
    pub source: ValueId,
    pub collectives: Vec<Collective>,
}

/// Result of running a [`ShardingPropagationPipeline`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PropagationReport {
    pub reshards: Vec<InsertedReshard>,
    pub debug_info: PropagationDebugInfo,
}

/// Sharding propagation pipeline. See the [module-level documentation](self) for details.
#[derive(Debug)]
pub struct ShardingPropagationPipeline {
    options: PropagationOptions,
    registry: ShardingRuleRegistry,
    policy: Box<dyn ConflictResolutionPolicy>,
    heuristics: Vec<OpPriorityHeuristic>,
}

impl ShardingPropagationPipeline {
    /// Creates a pipeline that uses the default [`ShardingRuleRegistry`], resolves conflicts with
    /// [`LargestShardedSize`], and uses the [default op-priority heuristics](DEFAULT_OP_PRIORITY_HEURISTICS).
    pub fn new(options: PropagationOptions) -> Self {
        Self {
            options,
            registry: ShardingRuleRegistry::default(),
            policy: Box::new(LargestShardedSize),
            heuristics: DEFAULT_OP_PRIORITY_HEURISTICS.to_vec(),
        }
    }

    pub fn with_registry(mut self, registry: ShardingRuleRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_conflict_resolution_policy(mut self, policy: Box<dyn ConflictResolutionPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_op_priority_heuristics(mut self, heuristics: Vec<OpPriorityHeuristic>) -> Self {
        self.heuristics = heuristics;
        self
    }

    pub fn options(&self) -> &PropagationOptions {
        &self.options
    }

    /// Runs all stages of this pipeline on `module`.
    pub fn run(&self, module: &mut Module) -> Result<PropagationReport, Error> {
        self.dump(module, 0, "input")?;
        self.import(module)?;
        self.dump(module, 1, "import")?;
        let debug_info = self.propagate(module)?;
        self.dump(module, 2, "propagate")?;
        let reshards = self.export(module)?;
        self.dump(module, 3, "export")?;
        debug!(
            operations = module.operations().len(),
            reshards = reshards.len(),
            "finished sharding propagation pipeline",
        );
        Ok(PropagationReport { reshards, debug_info })
    }

    /// Validates the shardings of `module`, attaches a sharding rule to every operation that does not have one, and
    /// replaces every sharding group with an operation that keeps the shardings of its members in sync.
    pub fn import(&self, module: &mut Module) -> Result<(), Error> {
        for value in module.values() {
            if let Some(sharding) = value.sharding() {
                sharding.validate(module.mesh(sharding.mesh_name())?, value.shape())?;
            }
        }

        for index in 0..module.operations().len() {
            let operation_id = OperationId(index);
            let operation = module.operation(operation_id)?;
            if is_collective_operation(operation.name()) {
                continue;
            }
            let (operand_shapes, result_shapes) = module.operand_and_result_shapes(operation_id)?;
            if let Some(rule) = operation.sharding_rule() {
                rule.verify(&operand_shapes, &result_shapes)?;
                continue;
            }
            let rule = self.registry.rule_for(operation.name(), operation.attributes(), &operand_shapes, &result_shapes)?;
            module.set_sharding_rule(operation_id, Some(rule))?;
        }

        let groups = module.sharding_groups().to_vec();
        for group in &groups {
            import_sharding_group(module, group)?;
        }
        module.clear_sharding_groups();
        debug!(operations = module.operations().len(), sharding_groups = groups.len(), "imported module");
        Ok(())
    }

    /// Propagates shardings through `module`.
    pub fn propagate(&self, module: &mut Module) -> Result<PropagationDebugInfo, Error> {
        propagate_with_user_priorities(module, &self.options, self.policy.as_ref(), &self.heuristics)
    }

    /// Removes sharding group operations, inserts the collectives that make every operand match the sharding its
    /// operation expects, drops sharding rules that were not provided by the user (unless they should be kept), and
    /// closes all shardings (if requested).
    pub fn export(&self, module: &mut Module) -> Result<Vec<InsertedReshard>, Error> {
        let operations = module
            .operations()
            .iter()
            .filter(|operation| operation.name() != SHARDING_GROUP_OPERATION)
            .cloned()
            .collect::<Vec<_>>();
        module.rebuild(operations, &BTreeMap::new());

        let reshards = self.insert_reshards(module)?;

        if !self.options.keep_sharding_rules {
            for operation in module.operations_mut() {
                if operation.sharding_rule().is_some_and(|rule| !rule.is_custom()) {
                    operation.take_sharding_rule();
                }
            }
        }
        if self.options.close_shardings {
            for index in 0..module.values().len() {
                let value = ValueId(index);
                let closed = module.value(value)?.sharding().map(TensorSharding::closed_like);
                if closed.is_some() {
                    module.set_sharding(value, closed)?;
                }
            }
        }
        Ok(reshards)
    }

    fn insert_reshards(&self, module: &mut Module) -> Result<Vec<InsertedReshard>, Error> {
        let mut mismatches = Vec::new();
        for (index, operation) in module.operations().iter().enumerate() {
            let Some(rule) = operation.sharding_rule() else {
                continue;
            };
            for operand_index in 0..operation.operands().len() {
                let Some(expected) = expected_operand_sharding(module, operation, rule, operand_index)? else {
                    continue;
                };
                if !self.options.enable_insert_explicit_collectives {
                    let operand = operation.operands()[operand_index];
                    let is_operand_closed = module.value(operand)?.sharding().is_some_and(is_fully_closed);
                    let is_reference_closed = module.value(expected.reference)?.sharding().is_some_and(is_fully_closed);
                    if is_operand_closed && is_reference_closed {
                        return Err(Error::IncompatibleSharding {
                            message: format!(
                                "operand #{operand_index} ({operand}) of '{}' must be sharded as {}",
                                operation.name(),
                                expected.sharding,
                            ),
                        });
                    }
                    debug!(
                        operation = operation.name(),
                        operand = %operand,
                        expected = %expected.sharding,
                        "leaving operand sharding mismatch in place",
                    );
                    continue;
                }
                mismatches.push((OperationId(index), operand_index, expected.sharding));
            }
        }
        if mismatches.is_empty() {
            return Ok(Vec::new());
        }

        let mut pending = Vec::with_capacity(mismatches.len());
        for (operation, operand_index, expected) in mismatches {
            let operation_name = module.operation(operation)?.name().to_string();
            let source = module.operation(operation)?.operands()[operand_index];
            let source_value = module.value(source)?;
            let shape = source_value.shape().to_vec();
            let Some(source_sharding) = source_value.sharding().cloned() else {
                continue;
            };
            let mesh = module.mesh(expected.mesh_name())?.clone();
            let collectives = reshard(&source_sharding, &expected, &mesh)?;
            if collectives.is_empty() {
                continue;
            }
            debug!(
                operation = operation_name.as_str(),
                operand = %source,
                source = %source_sharding,
                target = %expected,
                collectives = collectives.len(),
                "inserting reshard",
            );

            let mut collective_operations = Vec::with_capacity(collectives.len());
            let mut current_value = source;
            let mut current_sharding = source_sharding;
            for (position, collective) in collectives.iter().enumerate() {
                let applied = collective.apply(&current_sharding, &mesh)?;
                let sharding = if position + 1 == collectives.len() { expected.clone() } else { applied };
                let result = module.push_value(shape.clone(), Some(sharding.clone()), None);
                let attributes =
                    Attributes::new().with(collective.attribute_name(), Attribute::Collective(collective.clone()));
                collective_operations.push(Operation::new(
                    collective.operation_name().to_string(),
                    vec![current_value],
                    vec![result],
                    attributes,
                    None,
                ));
                current_value = result;
                current_sharding = sharding;
            }
            pending.push((operation, operand_index, source, collectives, collective_operations, current_value));
        }

        let mut pending = pending.into_iter().peekable();
        let mut operations = Vec::with_capacity(module.operations().len());
        let mut reshards = Vec::new();
        for (index, mut operation) in module.operations().to_vec().into_iter().enumerate() {
            let mut inserted = Vec::new();
            while let Some((_, operand_index, source, collectives, collective_operations, value)) =
                pending.next_if(|(operation, ..)| *operation == OperationId(index))
            {
                operations.extend(collective_operations);
                operation.set_operand(operand_index, value);
                inserted.push((operand_index, source, collectives));
            }
            let operation_id = OperationId(operations.len());
            operations.push(operation);
            reshards.extend(inserted.into_iter().map(|(operand_index, source, collectives)| InsertedReshard {
                operation: operation_id,
                operand_index,
                source,
                collectives,
            }));
        }
        module.rebuild(operations, &BTreeMap::new());
        Ok(reshards)
    }

    fn dump(&self, module: &Module, index: usize, stage: &str) -> Result<(), Error> {
        let Some(directory) = &self.options.dump_directory else {
            return Ok(());
        };
        let path = directory.join(format!("{index:02}_{stage}.mlir"));
        let dump_error = |error: std::io::Error| Error::Dump { path: path.display().to_string(), message: error.to_string() };
        fs::create_dir_all(directory).map_err(dump_error)?;
        fs::write(&path, module.to_string()).map_err(dump_error)?;
        debug!(path = %path.display(), "dumped module");
        Ok(())
    }
}

impl Default for ShardingPropagationPipeline {
    fn default() -> Self {
        Self::new(PropagationOptions::default())
    }
}

/// Sharding that an operation expects one of its operands to have.
struct ExpectedSharding {
    sharding: TensorSharding,

    /// Result whose sharding the expectation was derived from.
    reference: ValueId,
}

/// Checks that the members of `group` can share one sharding and adds a group operation for them.
fn import_sharding_group(module: &mut Module, group: &[ValueId]) -> Result<(), Error> {
    let Some(first) = group.first() else {
        return Ok(());
    };
    let shape = module.value(*first)?.shape().to_vec();
    let mut shardings = Vec::new();
    for member in group {
        let value = module.value(*member)?;
        if value.shape() != shape.as_slice() {
            return Err(Error::IncompatibleSharding {
                message: format!("sharding group members {first} and {member} have different shapes"),
            });
        }
        if let Some(sharding) = value.sharding() {
            shardings.push((*member, sharding));
        }
    }
    for (index, (lhs_value, lhs)) in shardings.iter().enumerate() {
        for (rhs_value, rhs) in &shardings[index + 1..] {
            let conflict = || Error::IncompatibleSharding {
                message: format!("sharding group members {lhs_value} ({lhs}) and {rhs_value} ({rhs}) conflict"),
            };
            if lhs.mesh_name() != rhs.mesh_name() {
                return Err(conflict());
            }
            let mesh = module.mesh(lhs.mesh_name())?;
            let conflicts = lhs.dimension_shardings().iter().zip(rhs.dimension_shardings()).any(|(lhs_dimension, rhs_dimension)| {
                lhs_dimension.is_closed()
                    && rhs_dimension.is_closed()
                    && !are_equivalent(lhs_dimension.axes(), rhs_dimension.axes(), mesh)
            });
            if conflicts {
                return Err(conflict());
            }
        }
    }

    let results = module.add_operation(SHARDING_GROUP_OPERATION, group.to_vec(), vec![shape.clone()], Attributes::new())?;
    let rule = OpShardingRuleBuilder::identity_rule(&shape, group.len(), results.len());
    module.set_sharding_rule(OperationId(module.operations().len() - 1), Some(rule))
}

fn is_fully_closed(sharding: &TensorSharding) -> bool {
    sharding.dimension_shardings().iter().all(DimensionSharding::is_closed)
}

/// Computes the sharding that `operation` expects operand `operand_index` to have, given the sharding of its first
/// sharded result. Factors shared with that result take its axes, need-replication factors take no axes, and all
/// other factors keep the axes of the operand. Returns `None` if the operand already has the expected layout or if no
/// valid expectation can be derived.
fn expected_operand_sharding(
    module: &Module,
    operation: &Operation,
    rule: &OpShardingRule,
    operand_index: usize,
) -> Result<Option<ExpectedSharding>, Error> {
    let operand = operation.operands()[operand_index];
    let operand_value = module.value(operand)?;
    let Some(operand_sharding) = operand_value.sharding() else {
        return Ok(None);
    };
    let mut reference = None;
    for (result_index, result) in operation.results().iter().enumerate() {
        let sharding = module.value(*result)?.sharding();
        if let Some(sharding) = sharding.filter(|sharding| sharding.mesh_name() == operand_sharding.mesh_name()) {
            reference = Some((result_index, *result, sharding));
            break;
        }
    }
    let Some((result_index, result, result_sharding)) = reference else {
        return Ok(None);
    };
    let (Some(operand_mapping), Some(result_mapping)) =
        (rule.operand_mappings().get(operand_index), rule.result_mappings().get(result_index))
    else {
        return Ok(None);
    };

    let mesh = module.mesh(operand_sharding.mesh_name())?;
    let mut operand_shardings = vec![None; operation.operands().len()];
    operand_shardings[operand_index] = Some(operand_sharding);
    let mut result_shardings = vec![None; operation.results().len()];
    result_shardings[result_index] = Some(result_sharding);
    let projection = ShardingProjection::new(&operand_shardings, &result_shardings, rule, mesh);
    let operand_factors = projection.tensor(TensorIndex::Operand(operand_index));
    let result_factors = projection.tensor(TensorIndex::Result(result_index));

    let mut dimensions = Vec::with_capacity(operand_sharding.rank());
    for (dimension, current) in operand_sharding.dimension_shardings().iter().enumerate() {
        let mut axes = Vec::new();
        for factor in operand_mapping.factors(dimension) {
            if rule.factor_type(*factor) == FactorType::NeedReplication {
                continue;
            }
            let factors = if result_mapping.position_of(*factor).is_some() { result_factors } else { operand_factors };
            if let Some(sharding) = factors.factor_sharding(*factor) {
                axes.extend(sharding.axes.iter().cloned());
                axes.extend(sharding.overflow_axes.iter().cloned());
            }
        }
        dimensions.push(DimensionSharding::new(merge_adjacent(&axes, mesh), current.is_closed()));
    }
    let expected = TensorSharding::with_extra_axes(
        operand_sharding.mesh_name(),
        dimensions,
        operand_sharding.replicated_axes().to_vec(),
        operand_sharding.unreduced_axes().to_vec(),
    );
    if expected.has_same_layout(operand_sharding, mesh) {
        return Ok(None);
    }
    if let Err(error) = expected.validate(mesh, operand_value.shape()) {
        debug!(
            operation = operation.name(),
            operand = %operand,
            %error,
            "skipping reshard towards a sharding that is not valid for the operand",
        );
        return Ok(None);
    }
    Ok(Some(ExpectedSharding { sharding: expected, reference: result }))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
