use super::{FactorType, OpShardingRule, TensorMapping};

/// Incremental builder for [`OpShardingRule`]s.
///
/// Factors are added one at a time together with the dimension they map to in each operand and result (or `None` if
/// the factor does not appear in that tensor). Factors added to the same dimension are ordered from major to minor in
/// the order in which they are added. A factor of size `1` is not mapped to dimensions that already have factors,
/// since it would not change how they are partitioned.
///
/// [`OpShardingRuleBuilder::build`] maps every dimension that is left without factors to a fresh factor of size `1`.
#[derive(Clone, Debug)]
pub struct OpShardingRuleBuilder {
    factor_sizes: Vec<usize>,
    factor_types: Vec<FactorType>,
    blocked_factors: Vec<bool>,
    operand_mappings: Vec<TensorMapping>,
    result_mappings: Vec<TensorMapping>,
}

impl OpShardingRuleBuilder {
    pub fn new(operand_shapes: &[Vec<usize>], result_shapes: &[Vec<usize>]) -> Self {
        let empty_mapping = |shape: &Vec<usize>| TensorMapping::new(vec![Vec::new(); shape.len()]);
        Self {
            factor_sizes: Vec::new(),
            factor_types: Vec::new(),
            blocked_factors: Vec::new(),
            operand_mappings: operand_shapes.iter().map(empty_mapping).collect(),
            result_mappings: result_shapes.iter().map(empty_mapping).collect(),
        }
    }

    /// Number of factors added so far.
    pub fn factor_count(&self) -> usize {
        self.factor_sizes.len()
    }

    /// Adds a factor of size `size` mapped to `operand_dimensions[i]` of operand `i` and to `result_dimensions[j]` of
    /// result `j`. Missing entries (because a slice is shorter than the number of tensors) mean that the factor does
    /// not appear in the corresponding tensor.
    pub fn add_factor(
        &mut self,
        operand_dimensions: &[Option<usize>],
        result_dimensions: &[Option<usize>],
        size: usize,
        factor_type: FactorType,
        is_blocked: bool,
    ) -> &mut Self {
        let factor = self.push_factor(size, factor_type, is_blocked);
        for (mapping, dimension) in self.operand_mappings.iter_mut().zip(operand_dimensions.iter()) {
            if let Some(dimension) = dimension {
                Self::map_dimension(mapping, *dimension, factor, size);
            }
        }
        for (mapping, dimension) in self.result_mappings.iter_mut().zip(result_dimensions.iter()) {
            if let Some(dimension) = dimension {
                Self::map_dimension(mapping, *dimension, factor, size);
            }
        }
        self
    }

    /// Adds a factor that is mapped to dimension `operand_dimension` of every operand.
    pub fn add_factor_same_for_all_operands(
        &mut self,
        operand_dimension: usize,
        result_dimensions: &[Option<usize>],
        size: usize,
        factor_type: FactorType,
        is_blocked: bool,
    ) -> &mut Self {
        let operand_dimensions = vec![Some(operand_dimension); self.operand_mappings.len()];
        self.add_factor(&operand_dimensions, result_dimensions, size, factor_type, is_blocked)
    }

    /// Adds a factor that is mapped to dimension `result_dimension` of every result.
    pub fn add_factor_same_for_all_results(
        &mut self,
        operand_dimensions: &[Option<usize>],
        result_dimension: usize,
        size: usize,
        factor_type: FactorType,
        is_blocked: bool,
    ) -> &mut Self {
        let result_dimensions = vec![Some(result_dimension); self.result_mappings.len()];
        self.add_factor(operand_dimensions, &result_dimensions, size, factor_type, is_blocked)
    }

    /// Adds a factor mapped to dimension `dimension` of every operand and result whose rank is greater than
    /// `dimension`. Lower-rank tensors (e.g., scalar operands) are skipped.
    pub fn add_pointwise_factor(
        &mut self,
        dimension: usize,
        size: usize,
        factor_type: FactorType,
        is_blocked: bool,
    ) -> &mut Self {
        let factor = self.push_factor(size, factor_type, is_blocked);
        for mapping in self.operand_mappings.iter_mut().chain(self.result_mappings.iter_mut()) {
            if dimension < mapping.rank() {
                Self::map_dimension(mapping, dimension, factor, size);
            }
        }
        self
    }

    /// Adds one pointwise factor per dimension of `shape`, with the type returned by `factor_type` for that dimension.
    pub fn add_pointwise<F: Fn(usize) -> FactorType>(&mut self, shape: &[usize], factor_type: F) -> &mut Self {
        self.add_pointwise_with_blocking(shape, factor_type, |_| false)
    }

    /// Like [`OpShardingRuleBuilder::add_pointwise`], but additionally blocks propagation along the dimensions for
    /// which `is_blocked` returns `true`.
    pub fn add_pointwise_with_blocking<F, B>(&mut self, shape: &[usize], factor_type: F, is_blocked: B) -> &mut Self
    where
        F: Fn(usize) -> FactorType,
        B: Fn(usize) -> bool,
    {
        for (dimension, size) in shape.iter().enumerate() {
            self.add_pointwise_factor(dimension, *size, factor_type(dimension), is_blocked(dimension));
        }
        self
    }

    /// Adds pointwise factors only for the dimensions of `shape` for which `predicate` returns `true`.
    pub fn add_pointwise_if<P, F>(&mut self, shape: &[usize], predicate: P, factor_type: F) -> &mut Self
    where
        P: Fn(usize) -> bool,
        F: Fn(usize) -> FactorType,
    {
        for (dimension, size) in shape.iter().enumerate() {
            if predicate(dimension) {
                self.add_pointwise_factor(dimension, *size, factor_type(dimension), false);
            }
        }
        self
    }

    /// Adds one pointwise factor per dimension, sized after `input_shape`. Dimensions whose size differs between
    /// `input_shape` and `output_shape` (e.g., the padded dimensions of a pad) get `mismatch_factor_type` and are
    /// blocked if `is_mismatch_blocked` is `true`. All other dimensions are pass-through.
    pub fn add_pointwise_with_diff_type_for_mismatch(
        &mut self,
        input_shape: &[usize],
        output_shape: &[usize],
        mismatch_factor_type: FactorType,
        is_mismatch_blocked: bool,
    ) -> &mut Self {
        for (dimension, size) in input_shape.iter().enumerate() {
            if output_shape.get(dimension) == Some(size) {
                self.add_pointwise_factor(dimension, *size, FactorType::PassThrough, false);
            } else {
                self.add_pointwise_factor(dimension, *size, mismatch_factor_type, is_mismatch_blocked);
            }
        }
        self
    }

    /// Builds the rule, mapping every dimension without factors to a fresh factor of size `1`. The builder itself is
    /// left untouched.
    pub fn build(&self) -> OpShardingRule {
        let mut factor_sizes = self.factor_sizes.clone();
        let mut factor_types = self.factor_types.clone();
        let mut blocked_factors = self.blocked_factors.clone();
        let mut operand_mappings = self.operand_mappings.clone();
        let mut result_mappings = self.result_mappings.clone();
        for mapping in operand_mappings.iter_mut().chain(result_mappings.iter_mut()) {
            for factors in mapping.dimensions_mut().iter_mut().filter(|factors| factors.is_empty()) {
                factors.push(factor_sizes.len());
                factor_sizes.push(1);
                factor_types.push(FactorType::PassThrough);
                blocked_factors.push(false);
            }
        }
        OpShardingRule::from_parts(factor_sizes, factor_types, blocked_factors, operand_mappings, result_mappings)
    }

    /// Builds a rule for an elementwise operation: one pass-through factor per dimension of the first result (or of
    /// the first operand if there are no results).
    pub fn build_pointwise(operand_shapes: &[Vec<usize>], result_shapes: &[Vec<usize>]) -> OpShardingRule {
        let shape = result_shapes.first().or(operand_shapes.first()).cloned().unwrap_or_default();
        let mut builder = Self::new(operand_shapes, result_shapes);
        builder.add_pointwise(&shape, |_| FactorType::PassThrough);
        builder.build()
    }

    /// Builds the rule of an operation whose `operand_count` operands and `result_count` results all have shape
    /// `shape` and whose results are identical to its operands. Rank-0 shapes produce a rule without factors.
    pub fn identity_rule(shape: &[usize], operand_count: usize, result_count: usize) -> OpShardingRule {
        let operand_shapes = vec![shape.to_vec(); operand_count];
        let result_shapes = vec![shape.to_vec(); result_count];
        Self::build_pointwise(&operand_shapes, &result_shapes)
    }

    fn push_factor(&mut self, size: usize, factor_type: FactorType, is_blocked: bool) -> usize {
        self.factor_sizes.push(size);
        self.factor_types.push(factor_type);
        self.blocked_factors.push(is_blocked);
        self.factor_sizes.len() - 1
    }

    fn map_dimension(mapping: &mut TensorMapping, dimension: usize, factor: usize, size: usize) {
        let Some(factors) = mapping.dimensions_mut().get_mut(dimension) else {
            return;
        };
        if size == 1 && !factors.is_empty() {
            return;
        }
        factors.push(factor);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_add_factor_and_build() {
        let operand_shapes = vec![vec![8, 32], vec![32, 16]];
        let result_shapes = vec![vec![8, 16]];
        let mut builder = OpShardingRuleBuilder::new(&operand_shapes, &result_shapes);
        builder
            .add_factor(&[Some(0), None], &[Some(0)], 8, FactorType::PassThrough, false)
            .add_factor(&[None, Some(1)], &[Some(1)], 16, FactorType::PassThrough, false)
            .add_factor(&[Some(1), Some(0)], &[None], 32, FactorType::Reduction, false);
        let rule = builder.build();
        assert_eq!(rule.verify(&operand_shapes, &result_shapes), Ok(()));
        assert_eq!(rule.factor_sizes(), &[8, 16, 32]);
        assert_eq!(rule.reduction_factors(), vec![2]);
        assert_eq!(rule.operand_mappings()[0].dimensions(), &[vec![0], vec![2]]);
        assert_eq!(builder.factor_count(), 3);
    }

    #[test]
    fn test_build_pads_unmapped_dimensions() {
        let operand_shapes = vec![vec![1, 4]];
        let result_shapes = vec![vec![2, 4]];
        let mut builder = OpShardingRuleBuilder::new(&operand_shapes, &result_shapes);
        builder
            .add_factor(&[None], &[Some(0)], 2, FactorType::PassThrough, false)
            .add_factor(&[Some(1)], &[Some(1)], 4, FactorType::PassThrough, false);
        let rule = builder.build();
        assert_eq!(rule.factor_sizes(), &[2, 4, 1]);
        assert_eq!(rule.operand_mappings()[0].dimensions(), &[vec![2], vec![1]]);
        assert_eq!(rule.verify(&operand_shapes, &result_shapes), Ok(()));
        assert_eq!(builder.factor_count(), 2);
    }

    #[test]
    fn test_size_one_factors_are_not_added_to_mapped_dimensions() {
        let shapes = vec![vec![4]];
        let mut builder = OpShardingRuleBuilder::new(&shapes, &shapes);
        builder.add_pointwise_factor(0, 4, FactorType::PassThrough, false);
        builder.add_pointwise_factor(0, 1, FactorType::PassThrough, false);
        let rule = builder.build();
        assert_eq!(rule.operand_mappings()[0].dimensions(), &[vec![0]]);
    }

    #[test]
    fn test_pointwise_helpers() {
        let operand_shapes = vec![vec![4, 6], vec![]];
        let result_shapes = vec![vec![4, 3]];
        let mut builder = OpShardingRuleBuilder::new(&operand_shapes, &result_shapes);
        builder.add_pointwise_with_diff_type_for_mismatch(&[4, 6], &[4, 3], FactorType::Permutation, true);
        let rule = builder.build();
        assert_eq!(rule.permutation_factors(), vec![1]);
        assert_eq!(rule.blocked_factors(), vec![1]);
        assert_eq!(rule.operand_mappings()[1].rank(), 0);
        assert_eq!(rule.verify(&operand_shapes, &result_shapes), Ok(()));

        let shapes = vec![vec![2, 3, 5]];
        let mut builder = OpShardingRuleBuilder::new(&shapes, &shapes);
        builder
            .add_pointwise_if(&[2, 3, 5], |dimension| dimension != 1, |_| FactorType::PassThrough)
            .add_pointwise_factor(1, 3, FactorType::NeedReplication, false);
        let rule = builder.build();
        assert_eq!(rule.factor_sizes(), &[2, 5, 3]);
        assert_eq!(rule.need_replication_factors(), vec![2]);

        let mut builder = OpShardingRuleBuilder::new(&shapes, &shapes);
        builder.add_pointwise_with_blocking(&[2, 3, 5], |_| FactorType::PassThrough, |dimension| dimension == 0);
        assert_eq!(builder.build().blocked_factors(), vec![0]);
    }

    #[test]
    fn test_identity_rule() {
        let rule = OpShardingRuleBuilder::identity_rule(&[4, 8], 2, 1);
        assert_eq!(rule.factor_sizes(), &[4, 8]);
        assert_eq!(rule.operand_mappings().len(), 2);
        assert_eq!(rule.result_mappings()[0].dimensions(), &[vec![0], vec![1]]);

        let scalar = OpShardingRuleBuilder::identity_rule(&[], 1, 1);
        assert_eq!(scalar.factor_count(), 0);
        assert_eq!(scalar.verify(&[vec![]], &[vec![]]), Ok(()));
    }
}
