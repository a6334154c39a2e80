//! Factor-based sharding propagation and resharding collective synthesis for tensor programs that run on device
//! meshes.
//!
//! The entry point is [`ShardingPropagationPipeline`], which resolves the shardings of a [`Module`] and inserts the
//! collectives that are needed wherever an operand is sharded differently from what its operation expects. The
//! individual pieces (i.e., [sharding rules](rules), [propagation], and [resharding](reshard)) can also be used on
//! their own.

pub mod compatibility;
pub mod errors;
pub mod graph;
pub mod layout;
pub mod mesh;
pub mod options;
pub mod pipeline;
pub mod propagation;
pub mod protos;
pub mod reshard;
pub mod rules;
pub mod sharding;

pub use errors::Error;
pub use graph::{Attribute, Attributes, Module, Operation, OperationId, Value, ValueId};
pub use mesh::{AxisRef, Mesh, MeshAxis};
pub use options::PropagationOptions;
pub use pipeline::{InsertedReshard, PropagationReport, ShardingPropagationPipeline};
pub use reshard::{AllToAllParam, Collective, reshard};
pub use rules::{FactorType, OpShardingRule, OpShardingRuleBuilder, ShardingRuleRegistry};
pub use sharding::{DimensionSharding, TensorSharding};
