use thiserror::Error;

#[derive(Error, Clone, Debug, Eq, PartialEq)]
pub enum Error {
    #[error("mesh axis names must be non-empty")]
    EmptyMeshAxisName,

    #[error("mesh axis '{axis_name}' must have size > 0")]
    InvalidMeshAxisSize { axis_name: String },

    #[error("mesh axis '{axis_name}' appears more than once")]
    DuplicateMeshAxisName { axis_name: String },

    #[error("mesh device id {device_id} appears more than once")]
    DuplicateMeshDeviceId { device_id: i64 },

    #[error("mesh has {actual_device_count} device(s), but axis sizes imply {expected_device_count} device(s)")]
    MeshDeviceCountMismatch { expected_device_count: usize, actual_device_count: usize },

    #[error("unknown mesh '@{mesh_name}'")]
    UnknownMesh { mesh_name: String },

    #[error("sharding references unknown mesh axis '{axis_name}'")]
    UnknownMeshAxis { axis_name: String },

    #[error("invalid sub-axis '{axis_name}':({pre_size}){size} of an axis with size {axis_size}")]
    InvalidSubAxis { axis_name: String, pre_size: usize, size: usize, axis_size: usize },

    #[error("mesh axis region {axis} is used more than once in the same sharding")]
    AxisUsedMoreThanOnce { axis: String },

    #[error("sharding rank {sharding_rank} does not match tensor rank {tensor_rank}")]
    RankMismatch { sharding_rank: usize, tensor_rank: usize },

    #[error("axes of size {sharded_size} do not evenly divide dimension #{dimension} of size {dimension_size}")]
    NonDivisibleAxis { dimension: usize, dimension_size: usize, sharded_size: usize },

    #[error("incompatible shardings: {message}")]
    IncompatibleSharding { message: String },

    #[error("malformed sharding rule: {message}")]
    MalformedRule { message: String },

    #[error("no sharding rule is registered for operation '{operation_name}'")]
    UnknownOperation { operation_name: String },

    #[error("unsupported resharding: {message}")]
    UnsupportedResharding { message: String },

    #[error("invalid {collective} collective: {message}")]
    InvalidCollective { collective: &'static str, message: String },

    #[error("value %{value} does not exist")]
    UnknownValue { value: usize },

    #[error("operation #{operation} does not exist")]
    UnknownOperationId { operation: usize },

    #[error("invalid option '{option}': {message}")]
    InvalidOption { option: String, message: String },

    #[error("failed to decode serialized sharding record: {message}")]
    Decode { message: String },

    #[error("failed to dump module to '{path}': {message}")]
    Dump { path: String, message: String },

    #[error("overflow while {context}")]
    Overflow { context: String },
}
