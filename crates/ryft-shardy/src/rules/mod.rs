//! Operation sharding rules.
//!
//! An [`OpShardingRule`] describes how the dimensions of the operands and results of an operation relate to each
//! other through a set of _factors_. Each factor has a size and a [`FactorType`] and is mapped to at most one dimension
//! of each operand and result. For example, a matrix multiplication `[m, k] x [k, n] -> [m, n]` has three factors: `m`
//! and `n` are pass-through factors shared between one operand and the result, while `k` is a reduction factor that
//! only appears in the operands.
//!
//! Propagation reasons purely in terms of factors: the sharding of each tensor is projected onto the factors of the
//! rule, factor shardings are reconciled across tensors, and the result is projected back onto each tensor.
//!
//! The Shardy counterpart of this type is the [`#sdy.op_sharding_rule`][sdy-rule] attribute, e.g.:
//!
//! ```text
//! #sdy.op_sharding_rule<([i, k], [k, j])->([i, j]) {i=8, j=16, k=32} reduction={k}>
//! ```
//!
//! [sdy-rule]: https://openxla.org/shardy/sdy_dialect#opshardingruleattr

use std::fmt::{Display, Formatter};

use crate::errors::Error;

pub mod builder;
pub mod registry;

pub use builder::*;
pub use registry::*;

/// Type of a factor in an [`OpShardingRule`].
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum FactorType {
    /// Factor whose sharding can be freely propagated between all tensors it is mapped to.
    #[default]
    PassThrough,

    /// Factor that is reduced over by the operation (e.g., the contracting dimension of a dot product). Sharding it
    /// leaves partial results that must be all-reduced.
    Reduction,

    /// Factor that must be replicated for the operation to be computed locally (e.g., the sorted dimension of a
    /// sort). It is never propagated.
    NeedReplication,

    /// Factor along which the operation permutes data (e.g., the sliced dimension of a slice). Sharding it requires
    /// data exchange between devices.
    Permutation,
}

/// Mapping from the dimensions of one tensor to factor indices. Each dimension lists its factors from major to minor.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct TensorMapping {
    dimensions: Vec<Vec<usize>>,
}

impl TensorMapping {
    pub fn new(dimensions: Vec<Vec<usize>>) -> Self {
        Self { dimensions }
    }

    pub fn rank(&self) -> usize {
        self.dimensions.len()
    }

    pub fn dimensions(&self) -> &[Vec<usize>] {
        self.dimensions.as_slice()
    }

    /// Factors of `dimension`, from major to minor.
    pub fn factors(&self, dimension: usize) -> &[usize] {
        self.dimensions.get(dimension).map(Vec::as_slice).unwrap_or_default()
    }

    /// Returns the dimension `factor` is mapped to and its position within that dimension, if any.
    pub fn position_of(&self, factor: usize) -> Option<(usize, usize)> {
        self.dimensions.iter().enumerate().find_map(|(dimension, factors)| {
            factors.iter().position(|candidate| *candidate == factor).map(|position| (dimension, position))
        })
    }

    pub(crate) fn dimensions_mut(&mut self) -> &mut Vec<Vec<usize>> {
        &mut self.dimensions
    }
}

/// Sharding rule of an operation. See the [module-level documentation](self) for details.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct OpShardingRule {
    factor_sizes: Vec<usize>,
    factor_types: Vec<FactorType>,
    blocked_factors: Vec<bool>,
    operand_mappings: Vec<TensorMapping>,
    result_mappings: Vec<TensorMapping>,
    is_custom: bool,
}

impl OpShardingRule {
    /// Creates a rule in which every factor is a non-blocked [`FactorType::PassThrough`] factor.
    pub fn new(
        factor_sizes: Vec<usize>,
        operand_mappings: Vec<TensorMapping>,
        result_mappings: Vec<TensorMapping>,
    ) -> Self {
        let factor_count = factor_sizes.len();
        Self {
            factor_sizes,
            factor_types: vec![FactorType::PassThrough; factor_count],
            blocked_factors: vec![false; factor_count],
            operand_mappings,
            result_mappings,
            is_custom: false,
        }
    }

    pub(crate) fn from_parts(
        factor_sizes: Vec<usize>,
        factor_types: Vec<FactorType>,
        blocked_factors: Vec<bool>,
        operand_mappings: Vec<TensorMapping>,
        result_mappings: Vec<TensorMapping>,
    ) -> Self {
        Self { factor_sizes, factor_types, blocked_factors, operand_mappings, result_mappings, is_custom: false }
    }

    /// Returns a copy of this rule in which `factor` has type `factor_type`.
    pub fn with_factor_type(mut self, factor: usize, factor_type: FactorType) -> Self {
        if let Some(current) = self.factor_types.get_mut(factor) {
            *current = factor_type;
        }
        self
    }

    /// Returns a copy of this rule in which propagation along `factor` is blocked.
    pub fn with_blocked_factor(mut self, factor: usize) -> Self {
        if let Some(blocked) = self.blocked_factors.get_mut(factor) {
            *blocked = true;
        }
        self
    }

    /// Returns a copy of this rule marked as user-provided. Custom rules are never dropped when exporting a module.
    pub fn into_custom(mut self) -> Self {
        self.is_custom = true;
        self
    }

    pub fn factor_count(&self) -> usize {
        self.factor_sizes.len()
    }

    pub fn factor_sizes(&self) -> &[usize] {
        self.factor_sizes.as_slice()
    }

    pub fn factor_size(&self, factor: usize) -> usize {
        self.factor_sizes[factor]
    }

    pub fn factor_type(&self, factor: usize) -> FactorType {
        self.factor_types[factor]
    }

    pub fn is_blocked(&self, factor: usize) -> bool {
        self.blocked_factors[factor]
    }

    pub fn is_custom(&self) -> bool {
        self.is_custom
    }

    pub fn operand_mappings(&self) -> &[TensorMapping] {
        self.operand_mappings.as_slice()
    }

    pub fn result_mappings(&self) -> &[TensorMapping] {
        self.result_mappings.as_slice()
    }

    pub fn reduction_factors(&self) -> Vec<usize> {
        self.factors_with_type(FactorType::Reduction)
    }

    pub fn need_replication_factors(&self) -> Vec<usize> {
        self.factors_with_type(FactorType::NeedReplication)
    }

    pub fn permutation_factors(&self) -> Vec<usize> {
        self.factors_with_type(FactorType::Permutation)
    }

    pub fn blocked_factors(&self) -> Vec<usize> {
        (0..self.factor_count()).filter(|factor| self.blocked_factors[*factor]).collect()
    }

    fn factors_with_type(&self, factor_type: FactorType) -> Vec<usize> {
        (0..self.factor_count()).filter(|factor| self.factor_types[*factor] == factor_type).collect()
    }

    /// Checks that this rule is well-formed for an operation with the provided operand and result shapes:
    ///
    ///   - the number and ranks of the tensor mappings match the shapes,
    ///   - every dimension is mapped to at least one factor and every factor index is in range,
    ///   - no factor is mapped to more than one dimension of the same tensor, and
    ///   - the product of the sizes of the factors of each dimension equals the size of that dimension. The only
    ///     exception are dimensions mapped to a single [`FactorType::Permutation`] or [`FactorType::NeedReplication`]
    ///     factor, which may differ in size from the factor (e.g., the sliced dimension of a slice).
    pub fn verify(&self, operand_shapes: &[Vec<usize>], result_shapes: &[Vec<usize>]) -> Result<(), Error> {
        if self.factor_types.len() != self.factor_count() || self.blocked_factors.len() != self.factor_count() {
            return Err(Error::MalformedRule { message: "factor metadata does not match the factor count".to_string() });
        }
        self.verify_mappings("operand", &self.operand_mappings, operand_shapes)?;
        self.verify_mappings("result", &self.result_mappings, result_shapes)
    }

    fn verify_mappings(&self, kind: &str, mappings: &[TensorMapping], shapes: &[Vec<usize>]) -> Result<(), Error> {
        if mappings.len() != shapes.len() {
            return Err(Error::MalformedRule {
                message: format!("expected {} {kind} mapping(s) but got {}", shapes.len(), mappings.len()),
            });
        }
        for (tensor, (mapping, shape)) in mappings.iter().zip(shapes.iter()).enumerate() {
            if mapping.rank() != shape.len() {
                return Err(Error::MalformedRule {
                    message: format!("{kind} #{tensor} has rank {} but its mapping has rank {}", shape.len(), mapping.rank()),
                });
            }
            let mut seen = vec![false; self.factor_count()];
            for (dimension, (factors, dimension_size)) in mapping.dimensions().iter().zip(shape.iter()).enumerate() {
                if factors.is_empty() {
                    return Err(Error::MalformedRule {
                        message: format!("dimension #{dimension} of {kind} #{tensor} is not mapped to any factor"),
                    });
                }
                for factor in factors {
                    if *factor >= self.factor_count() {
                        return Err(Error::MalformedRule { message: format!("factor index {factor} is out of range") });
                    }
                    if std::mem::replace(&mut seen[*factor], true) {
                        return Err(Error::MalformedRule {
                            message: format!("factor {factor} is mapped more than once in {kind} #{tensor}"),
                        });
                    }
                }
                let is_exempt = factors.len() == 1
                    && matches!(self.factor_type(factors[0]), FactorType::Permutation | FactorType::NeedReplication);
                let product = factors.iter().map(|factor| self.factor_sizes[*factor]).product::<usize>();
                if product != *dimension_size && !is_exempt {
                    return Err(Error::MalformedRule {
                        message: format!(
                            "factors of dimension #{dimension} of {kind} #{tensor} have total size {product}, \
                             but the dimension has size {dimension_size}",
                        ),
                    });
                }
            }
        }
        Ok(())
    }
}

impl Display for OpShardingRule {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> std::fmt::Result {
        fn factor_name(factor: usize) -> String {
            let letter = char::from(b'i' + (factor % 18) as u8);
            if factor < 18 { letter.to_string() } else { format!("{letter}{}", factor / 18) }
        }

        fn write_mappings(formatter: &mut Formatter<'_>, mappings: &[TensorMapping]) -> std::fmt::Result {
            let mappings = mappings
                .iter()
                .map(|mapping| {
                    let dimensions = mapping
                        .dimensions()
                        .iter()
                        .map(|factors| factors.iter().map(|factor| factor_name(*factor)).collect::<String>())
                        .collect::<Vec<_>>()
                        .join(", ");
                    format!("[{dimensions}]")
                })
                .collect::<Vec<_>>()
                .join(", ");
            write!(formatter, "({mappings})")
        }

        fn write_factor_set(formatter: &mut Formatter<'_>, label: &str, factors: &[usize]) -> std::fmt::Result {
            if factors.is_empty() {
                return Ok(());
            }
            let factors = factors.iter().map(|factor| factor_name(*factor)).collect::<Vec<_>>().join(", ");
            write!(formatter, " {label}={{{factors}}}")
        }

        write!(formatter, "#sdy.op_sharding_rule<")?;
        write_mappings(formatter, &self.operand_mappings)?;
        write!(formatter, "->")?;
        write_mappings(formatter, &self.result_mappings)?;
        let sizes = self
            .factor_sizes
            .iter()
            .enumerate()
            .map(|(factor, size)| format!("{}={size}", factor_name(factor)))
            .collect::<Vec<_>>()
            .join(", ");
        write!(formatter, " {{{sizes}}}")?;
        write_factor_set(formatter, "reduction", &self.reduction_factors())?;
        write_factor_set(formatter, "need_replication", &self.need_replication_factors())?;
        write_factor_set(formatter, "permutation", &self.permutation_factors())?;
        write_factor_set(formatter, "blocked_propagation", &self.blocked_factors())?;
        if self.is_custom {
            write!(formatter, ", custom")?;
        }
        write!(formatter, ">")
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn matmul_rule() -> OpShardingRule {
        OpShardingRule::new(
            vec![8, 16, 32],
            vec![TensorMapping::new(vec![vec![0], vec![2]]), TensorMapping::new(vec![vec![2], vec![1]])],
            vec![TensorMapping::new(vec![vec![0], vec![1]])],
        )
        .with_factor_type(2, FactorType::Reduction)
    }

    #[test]
    fn test_op_sharding_rule_accessors() {
        let rule = matmul_rule();
        assert_eq!(rule.factor_count(), 3);
        assert_eq!(rule.reduction_factors(), vec![2]);
        assert_eq!(rule.need_replication_factors(), Vec::<usize>::new());
        assert_eq!(rule.operand_mappings()[1].position_of(2), Some((0, 0)));
        assert_eq!(rule.result_mappings()[0].position_of(2), None);
        assert!(!rule.is_blocked(0));
        assert!(rule.clone().with_blocked_factor(0).is_blocked(0));
        assert_eq!(
            rule.to_string(),
            "#sdy.op_sharding_rule<([i, k], [k, j])->([i, j]) {i=8, j=16, k=32} reduction={k}>",
        );
    }

    #[test]
    fn test_op_sharding_rule_verification() {
        let rule = matmul_rule();
        assert_eq!(rule.verify(&[vec![8, 32], vec![32, 16]], &[vec![8, 16]]), Ok(()));
        assert!(matches!(
            rule.verify(&[vec![8, 32], vec![32, 16]], &[vec![8, 17]]),
            Err(Error::MalformedRule { message }) if message.contains("total size 16"),
        ));
        assert!(matches!(rule.verify(&[vec![8, 32]], &[vec![8, 16]]), Err(Error::MalformedRule { .. })));
        assert!(matches!(
            rule.verify(&[vec![8, 32, 1], vec![32, 16]], &[vec![8, 16]]),
            Err(Error::MalformedRule { .. }),
        ));

        let duplicated = OpShardingRule::new(vec![4], vec![TensorMapping::new(vec![vec![0], vec![0]])], Vec::new());
        assert!(matches!(
            duplicated.verify(&[vec![4, 4]], &[]),
            Err(Error::MalformedRule { message }) if message.contains("more than once"),
        ));

        let slice = OpShardingRule::new(
            vec![8],
            vec![TensorMapping::new(vec![vec![0]])],
            vec![TensorMapping::new(vec![vec![0]])],
        )
        .with_factor_type(0, FactorType::Permutation);
        assert_eq!(slice.verify(&[vec![8]], &[vec![3]]), Ok(()));
    }
}
