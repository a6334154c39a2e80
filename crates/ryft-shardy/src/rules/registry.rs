use std::collections::HashMap;

use crate::errors::Error;
use crate::graph::Attributes;

use super::{FactorType, OpShardingRule, OpShardingRuleBuilder};

/// Function that creates the sharding rule of an operation from its attributes and operand and result shapes.
pub type ShardingRuleFn = fn(&Attributes, &[Vec<usize>], &[Vec<usize>]) -> Result<OpShardingRule, Error>;

/// Name of the operation that the import stage creates for each sharding group.
pub const SHARDING_GROUP_OPERATION: &str = "sdy.sharding_group";

/// Name of the operation that pins the sharding of a value without changing it.
pub const SHARDING_CONSTRAINT_OPERATION: &str = "sdy.sharding_constraint";

const ELEMENTWISE_OPERATIONS: &[&str] = &[
    "stablehlo.abs",
    "stablehlo.add",
    "stablehlo.and",
    "stablehlo.clamp",
    "stablehlo.compare",
    "stablehlo.convert",
    "stablehlo.cosine",
    "stablehlo.divide",
    "stablehlo.exponential",
    "stablehlo.log",
    "stablehlo.logistic",
    "stablehlo.maximum",
    "stablehlo.minimum",
    "stablehlo.multiply",
    "stablehlo.negate",
    "stablehlo.or",
    "stablehlo.power",
    "stablehlo.rsqrt",
    "stablehlo.select",
    "stablehlo.sine",
    "stablehlo.sqrt",
    "stablehlo.subtract",
    "stablehlo.tanh",
];

/// Returns `true` if `operation_name` is a StableHLO elementwise operation.
pub fn is_elementwise_operation(operation_name: &str) -> bool {
    ELEMENTWISE_OPERATIONS.contains(&operation_name)
}

/// Registry of sharding rule factories keyed by operation name.
///
/// [`ShardingRuleRegistry::default`] contains rules for common StableHLO operations. Operations without a registered
/// rule whose operands and results all have the same shape fall back to a pointwise rule.
#[derive(Clone, Debug)]
pub struct ShardingRuleRegistry {
    rules: HashMap<String, ShardingRuleFn>,
}

impl ShardingRuleRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self { rules: HashMap::new() }
    }

    /// Registers `rule` for `operation_name`, returning the previously registered rule, if any.
    pub fn register<N: Into<String>>(&mut self, operation_name: N, rule: ShardingRuleFn) -> Option<ShardingRuleFn> {
        self.rules.insert(operation_name.into(), rule)
    }

    pub fn contains(&self, operation_name: &str) -> bool {
        self.rules.contains_key(operation_name)
    }

    /// Creates the sharding rule of an operation and checks that it is well-formed for the provided shapes.
    pub fn rule_for(
        &self,
        operation_name: &str,
        attributes: &Attributes,
        operand_shapes: &[Vec<usize>],
        result_shapes: &[Vec<usize>],
    ) -> Result<OpShardingRule, Error> {
        let rule = match self.rules.get(operation_name) {
            Some(rule) => rule(attributes, operand_shapes, result_shapes)?,
            None => {
                let mut shapes = operand_shapes.iter().chain(result_shapes.iter());
                let first = shapes.next();
                if !shapes.all(|shape| Some(shape) == first) {
                    return Err(Error::UnknownOperation { operation_name: operation_name.to_string() });
                }
                OpShardingRuleBuilder::build_pointwise(operand_shapes, result_shapes)
            }
        };
        rule.verify(operand_shapes, result_shapes)?;
        Ok(rule)
    }
}

impl Default for ShardingRuleRegistry {
    fn default() -> Self {
        let mut registry = Self::new();
        for operation_name in ELEMENTWISE_OPERATIONS {
            registry.register(*operation_name, pointwise_rule);
        }
        registry.register("stablehlo.broadcast_in_dim", broadcast_in_dim_rule);
        registry.register("stablehlo.concatenate", concatenate_rule);
        registry.register("stablehlo.dot_general", dot_general_rule);
        registry.register("stablehlo.pad", pad_or_slice_rule);
        registry.register("stablehlo.reduce", reduce_rule);
        registry.register("stablehlo.reshape", reshape_rule);
        registry.register("stablehlo.slice", pad_or_slice_rule);
        registry.register("stablehlo.transpose", transpose_rule);
        registry.register(SHARDING_CONSTRAINT_OPERATION, identity_rule);
        registry.register(SHARDING_GROUP_OPERATION, identity_rule);
        registry
    }
}

fn expect_tensor_counts(
    operation: &str,
    operand_shapes: &[Vec<usize>],
    result_shapes: &[Vec<usize>],
    operand_count: usize,
    result_count: usize,
) -> Result<(), Error> {
    if operand_shapes.len() != operand_count || result_shapes.len() != result_count {
        return Err(Error::MalformedRule {
            message: format!(
                "'{operation}' expects {operand_count} operand(s) and {result_count} result(s), \
                 but got {} and {}",
                operand_shapes.len(),
                result_shapes.len(),
            ),
        });
    }
    Ok(())
}

fn pointwise_rule(
    _attributes: &Attributes,
    operand_shapes: &[Vec<usize>],
    result_shapes: &[Vec<usize>],
) -> Result<OpShardingRule, Error> {
    Ok(OpShardingRuleBuilder::build_pointwise(operand_shapes, result_shapes))
}

fn identity_rule(
    _attributes: &Attributes,
    operand_shapes: &[Vec<usize>],
    result_shapes: &[Vec<usize>],
) -> Result<OpShardingRule, Error> {
    let shape = operand_shapes.first().or(result_shapes.first()).cloned().unwrap_or_default();
    if operand_shapes.iter().chain(result_shapes.iter()).any(|other| *other != shape) {
        return Err(Error::MalformedRule { message: "identity operands and results must have the same shape".to_string() });
    }
    Ok(OpShardingRuleBuilder::identity_rule(&shape, operand_shapes.len(), result_shapes.len()))
}

fn broadcast_in_dim_rule(
    attributes: &Attributes,
    operand_shapes: &[Vec<usize>],
    result_shapes: &[Vec<usize>],
) -> Result<OpShardingRule, Error> {
    expect_tensor_counts("stablehlo.broadcast_in_dim", operand_shapes, result_shapes, 1, 1)?;
    let (operand, result) = (&operand_shapes[0], &result_shapes[0]);
    let broadcast_dimensions = attributes.dimensions("broadcast_dimensions")?;
    if broadcast_dimensions.len() != operand.len() || broadcast_dimensions.iter().any(|dimension| *dimension >= result.len())
    {
        return Err(Error::MalformedRule { message: "invalid 'broadcast_dimensions'".to_string() });
    }
    let mut builder = OpShardingRuleBuilder::new(operand_shapes, result_shapes);
    for (result_dimension, result_size) in result.iter().enumerate() {
        match broadcast_dimensions.iter().position(|dimension| *dimension == result_dimension) {
            Some(operand_dimension) if operand[operand_dimension] == *result_size => {
                builder.add_factor(&[Some(operand_dimension)], &[Some(result_dimension)], *result_size, FactorType::PassThrough, false);
            }
            _ => {
                builder.add_factor(&[None], &[Some(result_dimension)], *result_size, FactorType::PassThrough, false);
            }
        }
    }
    Ok(builder.build())
}

fn concatenate_rule(
    attributes: &Attributes,
    operand_shapes: &[Vec<usize>],
    result_shapes: &[Vec<usize>],
) -> Result<OpShardingRule, Error> {
    if operand_shapes.is_empty() {
        return Err(Error::MalformedRule { message: "'stablehlo.concatenate' expects at least one operand".to_string() });
    }
    expect_tensor_counts("stablehlo.concatenate", operand_shapes, result_shapes, operand_shapes.len(), 1)?;
    let result = &result_shapes[0];
    let concatenated_dimension = attributes.dimension("dimension")?;
    if concatenated_dimension >= result.len() {
        return Err(Error::MalformedRule { message: "invalid concatenation 'dimension'".to_string() });
    }
    let mut builder = OpShardingRuleBuilder::new(operand_shapes, result_shapes);
    for (dimension, size) in result.iter().enumerate() {
        let factor_type =
            if dimension == concatenated_dimension { FactorType::Permutation } else { FactorType::PassThrough };
        builder.add_factor_same_for_all_operands(dimension, &[Some(dimension)], *size, factor_type, false);
    }
    Ok(builder.build())
}

fn dot_general_rule(
    attributes: &Attributes,
    operand_shapes: &[Vec<usize>],
    result_shapes: &[Vec<usize>],
) -> Result<OpShardingRule, Error> {
    expect_tensor_counts("stablehlo.dot_general", operand_shapes, result_shapes, 2, 1)?;
    let (lhs, rhs) = (&operand_shapes[0], &operand_shapes[1]);
    let lhs_batching = attributes.dimensions("lhs_batching_dimensions")?;
    let rhs_batching = attributes.dimensions("rhs_batching_dimensions")?;
    let lhs_contracting = attributes.dimensions("lhs_contracting_dimensions")?;
    let rhs_contracting = attributes.dimensions("rhs_contracting_dimensions")?;
    let is_valid = lhs_batching.len() == rhs_batching.len()
        && lhs_contracting.len() == rhs_contracting.len()
        && lhs_batching.iter().chain(lhs_contracting.iter()).all(|dimension| *dimension < lhs.len())
        && rhs_batching.iter().chain(rhs_contracting.iter()).all(|dimension| *dimension < rhs.len());
    if !is_valid {
        return Err(Error::MalformedRule { message: "invalid 'stablehlo.dot_general' dimension numbers".to_string() });
    }

    let mut builder = OpShardingRuleBuilder::new(operand_shapes, result_shapes);
    for (result_dimension, (lhs_dimension, rhs_dimension)) in lhs_batching.iter().zip(rhs_batching.iter()).enumerate() {
        builder.add_factor(
            &[Some(*lhs_dimension), Some(*rhs_dimension)],
            &[Some(result_dimension)],
            lhs[*lhs_dimension],
            FactorType::PassThrough,
            false,
        );
    }
    let mut result_dimension = lhs_batching.len();
    for (dimension, size) in lhs.iter().enumerate() {
        if !lhs_batching.contains(&dimension) && !lhs_contracting.contains(&dimension) {
            builder.add_factor(&[Some(dimension), None], &[Some(result_dimension)], *size, FactorType::PassThrough, false);
            result_dimension += 1;
        }
    }
    for (dimension, size) in rhs.iter().enumerate() {
        if !rhs_batching.contains(&dimension) && !rhs_contracting.contains(&dimension) {
            builder.add_factor(&[None, Some(dimension)], &[Some(result_dimension)], *size, FactorType::PassThrough, false);
            result_dimension += 1;
        }
    }
    for (lhs_dimension, rhs_dimension) in lhs_contracting.iter().zip(rhs_contracting.iter()) {
        builder.add_factor(
            &[Some(*lhs_dimension), Some(*rhs_dimension)],
            &[None],
            lhs[*lhs_dimension],
            FactorType::Reduction,
            false,
        );
    }
    Ok(builder.build())
}

fn pad_or_slice_rule(
    _attributes: &Attributes,
    operand_shapes: &[Vec<usize>],
    result_shapes: &[Vec<usize>],
) -> Result<OpShardingRule, Error> {
    let (Some(operand), Some(result)) = (operand_shapes.first(), result_shapes.first()) else {
        return Err(Error::MalformedRule { message: "pad and slice expect an operand and a result".to_string() });
    };
    let mut builder = OpShardingRuleBuilder::new(operand_shapes, result_shapes);
    builder.add_pointwise_with_diff_type_for_mismatch(operand, result, FactorType::Permutation, true);
    Ok(builder.build())
}

/// Rule of a `stablehlo.reduce` with `n` inputs, `n` scalar initial values, and `n` results.
fn reduce_rule(
    attributes: &Attributes,
    operand_shapes: &[Vec<usize>],
    result_shapes: &[Vec<usize>],
) -> Result<OpShardingRule, Error> {
    let input_count = result_shapes.len();
    expect_tensor_counts("stablehlo.reduce", operand_shapes, result_shapes, 2 * input_count, input_count)?;
    let Some(input) = operand_shapes.first() else {
        return Err(Error::MalformedRule { message: "'stablehlo.reduce' expects at least one input".to_string() });
    };
    let reduced_dimensions = attributes.dimensions("dimensions")?;
    let mut builder = OpShardingRuleBuilder::new(operand_shapes, result_shapes);
    let mut result_dimension = 0;
    for (dimension, size) in input.iter().enumerate() {
        let operand_dimensions = (0..operand_shapes.len())
            .map(|operand| (operand < input_count).then_some(dimension))
            .collect::<Vec<_>>();
        if reduced_dimensions.contains(&dimension) {
            builder.add_factor(&operand_dimensions, &[], *size, FactorType::Reduction, false);
        } else {
            builder.add_factor_same_for_all_results(&operand_dimensions, result_dimension, *size, FactorType::PassThrough, false);
            result_dimension += 1;
        }
    }
    Ok(builder.build())
}

/// Rule of a `stablehlo.reshape`.
///
/// Dimensions of the input and the output are matched greedily from major to minor. Equal sizes share a single
/// factor, while a dimension whose size is a multiple of the other one is split into several factors. Once sizes are
/// no longer divisible, every remaining dimension gets its own need-replication factor.
fn reshape_rule(
    _attributes: &Attributes,
    operand_shapes: &[Vec<usize>],
    result_shapes: &[Vec<usize>],
) -> Result<OpShardingRule, Error> {
    expect_tensor_counts("stablehlo.reshape", operand_shapes, result_shapes, 1, 1)?;
    let (input, output) = (&operand_shapes[0], &result_shapes[0]);
    if input.iter().product::<usize>() != output.iter().product::<usize>() {
        return Err(Error::MalformedRule { message: "reshape must preserve the number of elements".to_string() });
    }

    let mut builder = OpShardingRuleBuilder::new(operand_shapes, result_shapes);
    let (mut input_dimension, mut output_dimension) = (0, 0);

    // Remaining (not yet factored) sizes of the current dimensions, or 0 when the next dimension must be loaded.
    let (mut input_remainder, mut output_remainder) = (0, 0);
    loop {
        if input_remainder == 0 {
            while input_dimension < input.len() && input[input_dimension] == 1 {
                input_dimension += 1;
            }
            input_remainder = input.get(input_dimension).copied().unwrap_or(0);
        }
        if output_remainder == 0 {
            while output_dimension < output.len() && output[output_dimension] == 1 {
                output_dimension += 1;
            }
            output_remainder = output.get(output_dimension).copied().unwrap_or(0);
        }
        if input_remainder == 0 || output_remainder == 0 {
            break;
        }
        let operand_dimensions = [Some(input_dimension)];
        let result_dimensions = [Some(output_dimension)];
        if input_remainder == output_remainder {
            builder.add_factor(&operand_dimensions, &result_dimensions, input_remainder, FactorType::PassThrough, false);
            (input_remainder, output_remainder) = (0, 0);
            input_dimension += 1;
            output_dimension += 1;
        } else if input_remainder % output_remainder == 0 {
            builder.add_factor(&operand_dimensions, &result_dimensions, output_remainder, FactorType::PassThrough, false);
            input_remainder /= output_remainder;
            output_remainder = 0;
            output_dimension += 1;
        } else if output_remainder % input_remainder == 0 {
            builder.add_factor(&operand_dimensions, &result_dimensions, input_remainder, FactorType::PassThrough, false);
            output_remainder /= input_remainder;
            input_remainder = 0;
            input_dimension += 1;
        } else {
            break;
        }
    }

    if input_remainder > 1 {
        builder.add_factor(&[Some(input_dimension)], &[None], input_remainder, FactorType::NeedReplication, false);
        input_dimension += 1;
    }
    for (dimension, size) in input.iter().enumerate().skip(input_dimension).filter(|(_, size)| **size > 1) {
        builder.add_factor(&[Some(dimension)], &[None], *size, FactorType::NeedReplication, false);
    }
    if output_remainder > 1 {
        builder.add_factor(&[None], &[Some(output_dimension)], output_remainder, FactorType::NeedReplication, false);
        output_dimension += 1;
    }
    for (dimension, size) in output.iter().enumerate().skip(output_dimension).filter(|(_, size)| **size > 1) {
        builder.add_factor(&[None], &[Some(dimension)], *size, FactorType::NeedReplication, false);
    }
    Ok(builder.build())
}

fn transpose_rule(
    attributes: &Attributes,
    operand_shapes: &[Vec<usize>],
    result_shapes: &[Vec<usize>],
) -> Result<OpShardingRule, Error> {
    expect_tensor_counts("stablehlo.transpose", operand_shapes, result_shapes, 1, 1)?;
    let (operand, result) = (&operand_shapes[0], &result_shapes[0]);
    let permutation = attributes.dimensions("permutation")?;
    let mut sorted = permutation.clone();
    sorted.sort_unstable();
    if permutation.len() != result.len() || sorted != (0..operand.len()).collect::<Vec<_>>() {
        return Err(Error::MalformedRule { message: "invalid transpose 'permutation'".to_string() });
    }
    let mut builder = OpShardingRuleBuilder::new(operand_shapes, result_shapes);
    for (result_dimension, operand_dimension) in permutation.iter().enumerate() {
        builder.add_factor(
            &[Some(*operand_dimension)],
            &[Some(result_dimension)],
            operand[*operand_dimension],
            FactorType::PassThrough,
            false,
        );
    }
    Ok(builder.build())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use crate::graph::Attribute;

    use super::*;

    fn rule(
        operation_name: &str,
        attributes: Attributes,
        operand_shapes: &[Vec<usize>],
        result_shapes: &[Vec<usize>],
    ) -> Result<OpShardingRule, Error> {
        ShardingRuleRegistry::default().rule_for(operation_name, &attributes, operand_shapes, result_shapes)
    }

    #[test]
    fn test_elementwise_and_fallback_rules() {
        let add = rule("stablehlo.add", Attributes::new(), &[vec![4, 8], vec![4, 8]], &[vec![4, 8]]).unwrap();
        assert_eq!(add.to_string(), "#sdy.op_sharding_rule<([i, j], [i, j])->([i, j]) {i=4, j=8}>");

        let custom = rule("my.custom_op", Attributes::new(), &[vec![4]], &[vec![4]]).unwrap();
        assert_eq!(custom.factor_sizes(), &[4]);
        assert!(matches!(
            rule("my.custom_op", Attributes::new(), &[vec![4]], &[vec![2]]),
            Err(Error::UnknownOperation { operation_name }) if operation_name == "my.custom_op",
        ));
    }

    #[test]
    fn test_broadcast_in_dim_rule() {
        let attributes = Attributes::new().with("broadcast_dimensions", Attribute::Ints(vec![0, 2]));
        let rule = rule("stablehlo.broadcast_in_dim", attributes, &[vec![4, 1]], &[vec![4, 6, 8]]).unwrap();
        assert_eq!(rule.to_string(), "#sdy.op_sharding_rule<([i, l])->([i, j, k]) {i=4, j=6, k=8, l=1}>");
    }

    #[test]
    fn test_dot_general_rule() {
        let attributes = Attributes::new()
            .with("lhs_batching_dimensions", Attribute::Ints(vec![0]))
            .with("rhs_batching_dimensions", Attribute::Ints(vec![0]))
            .with("lhs_contracting_dimensions", Attribute::Ints(vec![2]))
            .with("rhs_contracting_dimensions", Attribute::Ints(vec![1]));
        let rule = rule("stablehlo.dot_general", attributes, &[vec![2, 8, 32], vec![2, 32, 16]], &[vec![2, 8, 16]]).unwrap();
        assert_eq!(
            rule.to_string(),
            "#sdy.op_sharding_rule<([i, j, l], [i, l, k])->([i, j, k]) {i=2, j=8, k=16, l=32} reduction={l}>",
        );
    }

    #[test]
    fn test_reduce_rule() {
        let attributes = Attributes::new().with("dimensions", Attribute::Ints(vec![1]));
        let rule = rule("stablehlo.reduce", attributes, &[vec![4, 8], vec![]], &[vec![4]]).unwrap();
        assert_eq!(rule.to_string(), "#sdy.op_sharding_rule<([i, j], [])->([i]) {i=4, j=8} reduction={j}>");
    }

    #[test]
    fn test_transpose_and_concatenate_rules() {
        let attributes = Attributes::new().with("permutation", Attribute::Ints(vec![1, 0]));
        let transpose = rule("stablehlo.transpose", attributes, &[vec![4, 8]], &[vec![8, 4]]).unwrap();
        assert_eq!(transpose.to_string(), "#sdy.op_sharding_rule<([j, i])->([i, j]) {i=8, j=4}>");
        let attributes = Attributes::new().with("permutation", Attribute::Ints(vec![0, 0]));
        assert!(matches!(
            rule("stablehlo.transpose", attributes, &[vec![4, 8]], &[vec![4, 4]]),
            Err(Error::MalformedRule { .. }),
        ));

        let attributes = Attributes::new().with("dimension", Attribute::Int(0));
        let concatenate = rule("stablehlo.concatenate", attributes, &[vec![2, 8], vec![6, 8]], &[vec![8, 8]]).unwrap();
        assert_eq!(concatenate.permutation_factors(), vec![0]);
        assert_eq!(concatenate.blocked_factors(), Vec::<usize>::new());
    }

    #[test]
    fn test_reshape_rule() {
        let split = rule("stablehlo.reshape", Attributes::new(), &[vec![8, 4]], &[vec![2, 4, 4]]).unwrap();
        assert_eq!(split.to_string(), "#sdy.op_sharding_rule<([ij, k])->([i, j, k]) {i=2, j=4, k=4}>");

        let with_unit_dimensions = rule("stablehlo.reshape", Attributes::new(), &[vec![1, 6]], &[vec![6, 1]]).unwrap();
        assert_eq!(with_unit_dimensions.to_string(), "#sdy.op_sharding_rule<([j, i])->([i, k]) {i=6, j=1, k=1}>");

        let non_divisible = rule("stablehlo.reshape", Attributes::new(), &[vec![6, 4]], &[vec![4, 6]]).unwrap();
        assert_eq!(non_divisible.need_replication_factors(), vec![0, 1, 2, 3]);
        assert_eq!(non_divisible.verify(&[vec![6, 4]], &[vec![4, 6]]), Ok(()));
    }

    #[test]
    fn test_slice_rule_blocks_sliced_dimensions() {
        let rule = rule("stablehlo.slice", Attributes::new(), &[vec![8, 4]], &[vec![3, 4]]).unwrap();
        assert_eq!(rule.permutation_factors(), vec![0]);
        assert_eq!(rule.blocked_factors(), vec![0]);
    }

    #[test]
    fn test_custom_registration() {
        fn replicate_everything(
            _attributes: &Attributes,
            operand_shapes: &[Vec<usize>],
            result_shapes: &[Vec<usize>],
        ) -> Result<OpShardingRule, Error> {
            let mut builder = OpShardingRuleBuilder::new(operand_shapes, result_shapes);
            builder.add_pointwise(&result_shapes[0], |_| FactorType::NeedReplication);
            Ok(builder.build())
        }

        let mut registry = ShardingRuleRegistry::new();
        assert!(!registry.contains("stablehlo.sort"));
        assert!(registry.register("stablehlo.sort", replicate_everything).is_none());
        let rule = registry.rule_for("stablehlo.sort", &Attributes::new(), &[vec![16]], &[vec![16]]).unwrap();
        assert_eq!(rule.need_replication_factors(), vec![0]);
    }
}
