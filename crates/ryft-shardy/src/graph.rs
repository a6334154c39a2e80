//! Minimal program representation that sharding propagation operates on.
//!
//! A [`Module`] holds the meshes it refers to, a flat list of SSA [`Value`]s (function arguments and operation
//! results), and a list of [`Operation`]s in program order. Every value carries its static shape and an optional
//! [`TensorSharding`], and every operation may carry an [`OpShardingRule`]. Values can additionally be grouped into
//! _sharding groups_, whose members must all end up with the same sharding.
//!
//! The textual form produced by the [`Display`] implementation follows Shardy's MLIR syntax closely enough to be
//! readable, and is what the propagation pipeline writes to its dump directory:
//!
//! ```text
//! sdy.mesh @mesh = <["x"=2, "y"=2]>
//!
//! %0 = sdy.argument : tensor<8x8> {sdy.sharding = #sdy.sharding<@mesh, [{"x"}, {?}]>}
//! %1 = stablehlo.add(%0, %0) : tensor<8x8> {sdy.sharding = #sdy.sharding_per_value<[#sdy.sharding<@mesh, [{"x", ?}, {?}]>]>}
//! return %1
//! ```

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use crate::errors::Error;
use crate::mesh::{Mesh, escape_shardy_string};
use crate::reshard::Collective;
use crate::rules::OpShardingRule;
use crate::sharding::TensorSharding;

/// Identifier of a [`Value`] in a [`Module`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ValueId(pub usize);

impl Display for ValueId {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> std::fmt::Result {
        write!(formatter, "%{}", self.0)
    }
}

/// Identifier of an [`Operation`] in a [`Module`] (i.e., its position in program order).
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OperationId(pub usize);

/// Operation attribute.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Attribute {
    Int(i64),
    Ints(Vec<i64>),
    String(String),
    Collective(Collective),
}

impl Display for Attribute {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Int(value) => write!(formatter, "{value}"),
            Self::Ints(values) => {
                let values = values.iter().map(i64::to_string).collect::<Vec<_>>().join(", ");
                write!(formatter, "array<i64: {values}>")
            }
            Self::String(value) => write!(formatter, "\"{}\"", escape_shardy_string(value)),
            Self::Collective(collective) => write!(formatter, "{collective}"),
        }
    }
}

/// Named attributes of an [`Operation`], kept sorted by name.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Attributes {
    attributes: BTreeMap<String, Attribute>,
}

impl Attributes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of these attributes with `name` set to `value`.
    pub fn with<N: Into<String>>(mut self, name: N, value: Attribute) -> Self {
        self.attributes.insert(name.into(), value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Attribute> {
        self.attributes.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Attribute)> {
        self.attributes.iter().map(|(name, value)| (name.as_str(), value))
    }

    /// Returns the non-negative integer attribute `name` as a dimension index.
    pub fn dimension(&self, name: &str) -> Result<usize, Error> {
        match self.get(name) {
            Some(Attribute::Int(value)) => {
                usize::try_from(*value).map_err(|_| Self::malformed(name, "expected a non-negative integer"))
            }
            Some(_) => Err(Self::malformed(name, "expected an integer")),
            None => Err(Self::malformed(name, "missing attribute")),
        }
    }

    /// Returns the integer array attribute `name` as a list of dimension indices.
    pub fn dimensions(&self, name: &str) -> Result<Vec<usize>, Error> {
        match self.get(name) {
            Some(Attribute::Ints(values)) => values
                .iter()
                .map(|value| usize::try_from(*value).map_err(|_| Self::malformed(name, "expected non-negative integers")))
                .collect(),
            Some(_) => Err(Self::malformed(name, "expected an integer array")),
            None => Err(Self::malformed(name, "missing attribute")),
        }
    }

    fn malformed(name: &str, message: &str) -> Error {
        Error::MalformedRule { message: format!("attribute '{name}': {message}") }
    }
}

/// SSA value with a static shape and an optional sharding.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Value {
    shape: Vec<usize>,
    sharding: Option<TensorSharding>,
    producer: Option<OperationId>,
}

impl Value {
    pub fn shape(&self) -> &[usize] {
        self.shape.as_slice()
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    pub fn sharding(&self) -> Option<&TensorSharding> {
        self.sharding.as_ref()
    }

    /// Operation that produces this value, or `None` for function arguments.
    pub fn producer(&self) -> Option<OperationId> {
        self.producer
    }
}

/// Operation with operands, results, attributes, and an optional sharding rule.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Operation {
    name: String,
    operands: Vec<ValueId>,
    results: Vec<ValueId>,
    attributes: Attributes,
    sharding_rule: Option<OpShardingRule>,
}

impl Operation {
    pub fn name(&self) -> &str {
        self.name.as_str()
    }

    pub fn operands(&self) -> &[ValueId] {
        self.operands.as_slice()
    }

    pub fn results(&self) -> &[ValueId] {
        self.results.as_slice()
    }

    pub fn attributes(&self) -> &Attributes {
        &self.attributes
    }

    pub fn sharding_rule(&self) -> Option<&OpShardingRule> {
        self.sharding_rule.as_ref()
    }
}

/// Program made of values and operations in program order. See the [module-level documentation](self) for details.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Module {
    meshes: BTreeMap<String, Mesh>,
    values: Vec<Value>,
    operations: Vec<Operation>,
    arguments: Vec<ValueId>,
    outputs: Vec<ValueId>,
    sharding_groups: Vec<Vec<ValueId>>,
}

impl Module {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds (or replaces) the mesh named `name`.
    pub fn add_mesh<N: Into<String>>(&mut self, name: N, mesh: Mesh) {
        self.meshes.insert(name.into(), mesh);
    }

    pub fn meshes(&self) -> &BTreeMap<String, Mesh> {
        &self.meshes
    }

    pub fn mesh(&self, name: &str) -> Result<&Mesh, Error> {
        self.meshes.get(name).ok_or_else(|| Error::UnknownMesh { mesh_name: name.to_string() })
    }

    /// Adds a function argument with the provided shape and (optional) user sharding.
    pub fn add_argument(&mut self, shape: Vec<usize>, sharding: Option<TensorSharding>) -> ValueId {
        let value = self.push_value(shape, sharding, None);
        self.arguments.push(value);
        value
    }

    /// Appends an operation to the end of the program and returns the IDs of its results, which have the provided
    /// shapes and no sharding.
    pub fn add_operation<N: Into<String>>(
        &mut self,
        name: N,
        operands: Vec<ValueId>,
        result_shapes: Vec<Vec<usize>>,
        attributes: Attributes,
    ) -> Result<Vec<ValueId>, Error> {
        for operand in &operands {
            self.value(*operand)?;
        }
        let operation = OperationId(self.operations.len());
        let results = result_shapes
            .into_iter()
            .map(|shape| self.push_value(shape, None, Some(operation)))
            .collect::<Vec<_>>();
        self.operations.push(Operation {
            name: name.into(),
            operands,
            results: results.clone(),
            attributes,
            sharding_rule: None,
        });
        Ok(results)
    }

    /// Marks `values` as the values returned by the program.
    pub fn set_outputs(&mut self, values: Vec<ValueId>) -> Result<(), Error> {
        for value in &values {
            self.value(*value)?;
        }
        self.outputs = values;
        Ok(())
    }

    /// Declares that all `values` must end up with the same sharding.
    pub fn add_sharding_group(&mut self, values: Vec<ValueId>) -> Result<(), Error> {
        for value in &values {
            self.value(*value)?;
        }
        self.sharding_groups.push(values);
        Ok(())
    }

    pub fn values(&self) -> &[Value] {
        self.values.as_slice()
    }

    pub fn value(&self, value: ValueId) -> Result<&Value, Error> {
        self.values.get(value.0).ok_or(Error::UnknownValue { value: value.0 })
    }

    pub fn arguments(&self) -> &[ValueId] {
        self.arguments.as_slice()
    }

    pub fn outputs(&self) -> &[ValueId] {
        self.outputs.as_slice()
    }

    pub fn sharding_groups(&self) -> &[Vec<ValueId>] {
        self.sharding_groups.as_slice()
    }

    pub fn operations(&self) -> &[Operation] {
        self.operations.as_slice()
    }

    pub fn operation(&self, operation: OperationId) -> Result<&Operation, Error> {
        self.operations.get(operation.0).ok_or(Error::UnknownOperationId { operation: operation.0 })
    }

    /// Sets the sharding of `value`.
    pub fn set_sharding(&mut self, value: ValueId, sharding: Option<TensorSharding>) -> Result<(), Error> {
        self.values.get_mut(value.0).ok_or(Error::UnknownValue { value: value.0 })?.sharding = sharding;
        Ok(())
    }

    /// Attaches a sharding rule to `operation`, replacing any existing one.
    pub fn set_sharding_rule(&mut self, operation: OperationId, rule: Option<OpShardingRule>) -> Result<(), Error> {
        self.operations
            .get_mut(operation.0)
            .ok_or(Error::UnknownOperationId { operation: operation.0 })?
            .sharding_rule = rule;
        Ok(())
    }

    /// Shapes of the operands and results of `operation`.
    #[allow(clippy::type_complexity)]
    pub fn operand_and_result_shapes(&self, operation: OperationId) -> Result<(Vec<Vec<usize>>, Vec<Vec<usize>>), Error> {
        let operation = self.operation(operation)?;
        let shapes = |values: &[ValueId]| -> Vec<Vec<usize>> {
            values.iter().map(|value| self.values[value.0].shape.clone()).collect()
        };
        Ok((shapes(&operation.operands), shapes(&operation.results)))
    }

    /// Returns, for every value, the operations that use it as an operand (each listed once, in program order).
    pub fn users(&self) -> Vec<Vec<OperationId>> {
        let mut users = vec![Vec::new(); self.values.len()];
        for (index, operation) in self.operations.iter().enumerate() {
            for operand in &operation.operands {
                let operand_users: &mut Vec<OperationId> = &mut users[operand.0];
                if operand_users.last() != Some(&OperationId(index)) {
                    operand_users.push(OperationId(index));
                }
            }
        }
        users
    }

    pub(crate) fn push_value(
        &mut self,
        shape: Vec<usize>,
        sharding: Option<TensorSharding>,
        producer: Option<OperationId>,
    ) -> ValueId {
        self.values.push(Value { shape, sharding, producer });
        ValueId(self.values.len() - 1)
    }

    pub(crate) fn operations_mut(&mut self) -> &mut [Operation] {
        self.operations.as_mut_slice()
    }

    /// Replaces the operations of this module, updating the producers of all values and replacing the operands of
    /// program outputs according to `output_replacements`.
    pub(crate) fn rebuild(&mut self, operations: Vec<Operation>, output_replacements: &BTreeMap<ValueId, ValueId>) {
        self.values.iter_mut().filter(|value| value.producer.is_some()).for_each(|value| value.producer = None);
        for (index, operation) in operations.iter().enumerate() {
            for result in &operation.results {
                self.values[result.0].producer = Some(OperationId(index));
            }
        }
        self.operations = operations;
        for output in &mut self.outputs {
            if let Some(replacement) = output_replacements.get(output) {
                *output = *replacement;
            }
        }
    }

    pub(crate) fn clear_sharding_groups(&mut self) {
        self.sharding_groups.clear();
    }
}

impl Operation {
    pub(crate) fn new(
        name: String,
        operands: Vec<ValueId>,
        results: Vec<ValueId>,
        attributes: Attributes,
        sharding_rule: Option<OpShardingRule>,
    ) -> Self {
        Self { name, operands, results, attributes, sharding_rule }
    }

    pub(crate) fn set_operand(&mut self, index: usize, value: ValueId) {
        self.operands[index] = value;
    }

    pub(crate) fn take_sharding_rule(&mut self) -> Option<OpShardingRule> {
        self.sharding_rule.take()
    }
}

// ---------------------------------------------------------------------------
// Rendering
// ---------------------------------------------------------------------------

fn render_tensor_type(shape: &[usize]) -> String {
    let dimensions = shape.iter().map(usize::to_string).collect::<Vec<_>>().join("x");
    format!("tensor<{dimensions}>")
}

impl Display for Module {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> std::fmt::Result {
        for (name, mesh) in &self.meshes {
            writeln!(formatter, "sdy.mesh @{} = {}", escape_shardy_string(name), mesh.to_shardy_mesh_literal())?;
        }
        if !self.meshes.is_empty() {
            writeln!(formatter)?;
        }
        for argument in &self.arguments {
            let value = &self.values[argument.0];
            write!(formatter, "{argument} = sdy.argument : {}", render_tensor_type(&value.shape))?;
            if let Some(sharding) = &value.sharding {
                write!(formatter, " {{sdy.sharding = {sharding}}}")?;
            }
            writeln!(formatter)?;
        }
        for operation in &self.operations {
            let results = operation.results.iter().map(ValueId::to_string).collect::<Vec<_>>().join(", ");
            let operands = operation.operands.iter().map(ValueId::to_string).collect::<Vec<_>>().join(", ");
            if !results.is_empty() {
                write!(formatter, "{results} = ")?;
            }
            write!(formatter, "{}({operands})", operation.name)?;
            if !operation.attributes.is_empty() {
                let attributes = operation
                    .attributes
                    .iter()
                    .map(|(name, value)| format!("{name} = {value}"))
                    .collect::<Vec<_>>()
                    .join(", ");
                write!(formatter, " {{{attributes}}}")?;
            }
            let types = operation
                .results
                .iter()
                .map(|result| render_tensor_type(&self.values[result.0].shape))
                .collect::<Vec<_>>()
                .join(", ");
            write!(formatter, " : {types}")?;
            if operation.results.iter().any(|result| self.values[result.0].sharding.is_some()) {
                let shardings = operation
                    .results
                    .iter()
                    .map(|result| match &self.values[result.0].sharding {
                        Some(sharding) => sharding.to_string(),
                        None => "<none>".to_string(),
                    })
                    .collect::<Vec<_>>()
                    .join(", ");
                write!(formatter, " {{sdy.sharding = #sdy.sharding_per_value<[{shardings}]>}}")?;
            }
            if let Some(rule) = &operation.sharding_rule {
                write!(formatter, " {{sdy.sharding_rule = {rule}}}")?;
            }
            writeln!(formatter)?;
        }
        for group in &self.sharding_groups {
            let members = group.iter().map(ValueId::to_string).collect::<Vec<_>>().join(", ");
            writeln!(formatter, "sdy.sharding_group({members})")?;
        }
        let outputs = self.outputs.iter().map(ValueId::to_string).collect::<Vec<_>>().join(", ");
        writeln!(formatter, "return {outputs}")
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use indoc::indoc;
    use pretty_assertions::assert_eq;

    use crate::mesh::AxisRef;
    use crate::mesh::tests::test_mesh;
    use crate::sharding::DimensionSharding;

    use super::*;

    #[test]
    fn test_module_construction() {
        let mut module = Module::new();
        module.add_mesh("mesh", test_mesh(&[("x", 2)]));
        let argument = module.add_argument(vec![8, 4], None);
        let results = module
            .add_operation("stablehlo.add", vec![argument, argument], vec![vec![8, 4]], Attributes::new())
            .unwrap();
        assert_eq!(results, vec![ValueId(1)]);
        assert_eq!(module.value(results[0]).unwrap().producer(), Some(OperationId(0)));
        assert_eq!(module.value(argument).unwrap().producer(), None);
        assert_eq!(module.users(), vec![vec![OperationId(0)], vec![]]);
        assert_eq!(
            module.operand_and_result_shapes(OperationId(0)),
            Ok((vec![vec![8, 4], vec![8, 4]], vec![vec![8, 4]])),
        );
        assert_eq!(module.operation(OperationId(0)).map(Operation::name), Ok("stablehlo.add"));
        assert!(matches!(module.operation(OperationId(1)), Err(Error::UnknownOperationId { operation: 1 })));
        assert!(matches!(
            module.set_sharding_rule(OperationId(3), None),
            Err(Error::UnknownOperationId { operation: 3 }),
        ));
        assert!(matches!(module.operand_and_result_shapes(OperationId(2)), Err(Error::UnknownOperationId { .. })));
        assert!(matches!(
            module.add_operation("stablehlo.negate", vec![ValueId(7)], vec![vec![8, 4]], Attributes::new()),
            Err(Error::UnknownValue { value: 7 }),
        ));
        assert!(matches!(module.mesh("other"), Err(Error::UnknownMesh { mesh_name }) if mesh_name == "other"));
    }

    #[test]
    fn test_attribute_accessors() {
        let attributes = Attributes::new()
            .with("dimension", Attribute::Int(1))
            .with("permutation", Attribute::Ints(vec![1, 0]))
            .with("negative", Attribute::Ints(vec![-1]));
        assert_eq!(attributes.dimension("dimension"), Ok(1));
        assert_eq!(attributes.dimensions("permutation"), Ok(vec![1, 0]));
        assert!(matches!(attributes.dimensions("negative"), Err(Error::MalformedRule { .. })));
        assert!(matches!(attributes.dimension("permutation"), Err(Error::MalformedRule { .. })));
        assert!(matches!(attributes.dimensions("missing"), Err(Error::MalformedRule { message }) if message.contains("missing")));
    }

    #[test]
    fn test_module_rendering() {
        let mut module = Module::new();
        module.add_mesh("mesh", test_mesh(&[("x", 2)]));
        let sharding = TensorSharding::new(
            "mesh",
            vec![DimensionSharding::closed(vec![AxisRef::new("x")]), DimensionSharding::open(Vec::new())],
        );
        let argument = module.add_argument(vec![8, 4], Some(sharding));
        let attributes = Attributes::new().with("permutation", Attribute::Ints(vec![1, 0]));
        let results = module.add_operation("stablehlo.transpose", vec![argument], vec![vec![4, 8]], attributes).unwrap();
        module.set_outputs(results).unwrap();
        assert_eq!(
            module.to_string(),
            indoc! {r#"
                sdy.mesh @mesh = <["x"=2]>

                %0 = sdy.argument : tensor<8x4> {sdy.sharding = #sdy.sharding<@mesh, [{"x"}, {?}]>}
                %1 = stablehlo.transpose(%0) {permutation = array<i64: 1, 0>} : tensor<4x8>
                return %1
            "#},
        );
    }
}
