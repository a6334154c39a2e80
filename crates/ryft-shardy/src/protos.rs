//! Protobuf serialization of meshes, shardings, sharding rules, and all-to-all parameters.
//!
//! Every serialized object is wrapped in a [`Record`] that carries its [`RecordKind`] and a format version, and
//! records are written as a stream of length-delimited messages (see [`encode_records`] and [`decode_records`]).
//! Readers skip records of unknown kinds and records whose version is newer than the one they understand, so streams
//! written by newer versions of this crate remain readable.
//!
//! | Kind | Versions | Payload |
//! |---|---|---|
//! | [`RecordKind::Mesh`] | 1 | [`MeshProto`] |
//! | [`RecordKind::TensorSharding`] | 1, 2 | [`TensorShardingV1Proto`] (no unreduced axes), [`TensorShardingProto`] |
//! | [`RecordKind::OpShardingRule`] | 1 | [`OpShardingRuleProto`] |
//! | [`RecordKind::AllToAllParams`] | 1 | [`AllToAllParamListProto`] |
//!
//! Tensor shardings without unreduced axes are written as version 1 records.

use prost::{Enumeration, Message};
use tracing::debug;

use crate::errors::Error;
use crate::mesh::{AxisRef, Mesh, MeshAxis};
use crate::reshard::AllToAllParam;
use crate::rules::{FactorType, OpShardingRule, TensorMapping};
use crate::sharding::{DimensionSharding, TensorSharding};

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// Named axis of a [`MeshProto`].
#[derive(Clone, PartialEq, Message)]
pub struct MeshAxisProto {
    #[prost(string, tag = "1")]
    pub name: String,

    #[prost(int64, tag = "2")]
    pub size: i64,
}

/// Device mesh.
#[derive(Clone, PartialEq, Message)]
pub struct MeshProto {
    #[prost(message, repeated, tag = "1")]
    pub axes: Vec<MeshAxisProto>,

    /// Explicit row-major device IDs. Empty for meshes that use the implicit iota device order.
    #[prost(int64, repeated, tag = "2")]
    pub device_ids: Vec<i64>,
}

#[derive(Clone, PartialEq, Message)]
pub struct SubAxisInfoProto {
    #[prost(int64, tag = "1")]
    pub pre_size: i64,

    #[prost(int64, tag = "2")]
    pub size: i64,
}

#[derive(Clone, PartialEq, Message)]
pub struct AxisRefProto {
    #[prost(string, tag = "1")]
    pub name: String,

    #[prost(message, optional, tag = "2")]
    pub sub_axis_info: Option<SubAxisInfoProto>,
}

#[derive(Clone, PartialEq, Message)]
pub struct DimensionShardingProto {
    #[prost(message, repeated, tag = "1")]
    pub axes: Vec<AxisRefProto>,

    #[prost(bool, tag = "2")]
    pub is_closed: bool,

    #[prost(int64, optional, tag = "3")]
    pub priority: Option<i64>,
}

/// Tensor sharding as written by the first version of the format, which did not support unreduced axes.
#[derive(Clone, PartialEq, Message)]
pub struct TensorShardingV1Proto {
    #[prost(string, tag = "1")]
    pub mesh_name: String,

    #[prost(message, repeated, tag = "2")]
    pub dimension_shardings: Vec<DimensionShardingProto>,

    #[prost(message, repeated, tag = "3")]
    pub replicated_axes: Vec<AxisRefProto>,
}

#[derive(Clone, PartialEq, Message)]
pub struct TensorShardingProto {
    #[prost(string, tag = "1")]
    pub mesh_name: String,

    #[prost(message, repeated, tag = "2")]
    pub dimension_shardings: Vec<DimensionShardingProto>,

    #[prost(message, repeated, tag = "3")]
    pub replicated_axes: Vec<AxisRefProto>,

    #[prost(message, repeated, tag = "4")]
    pub unreduced_axes: Vec<AxisRefProto>,
}

/// Factors mapped to one tensor dimension, major to minor.
#[derive(Clone, PartialEq, Message)]
pub struct DimMappingProto {
    #[prost(int64, repeated, tag = "1")]
    pub factor_indices: Vec<i64>,
}

#[derive(Clone, PartialEq, Message)]
pub struct TensorMappingProto {
    #[prost(message, repeated, tag = "1")]
    pub dim_mappings: Vec<DimMappingProto>,
}

/// Operation sharding rule. Factors that are not listed in any of the factor type lists are pass-through factors.
#[derive(Clone, PartialEq, Message)]
pub struct OpShardingRuleProto {
    #[prost(int64, repeated, tag = "1")]
    pub factor_sizes: Vec<i64>,

    #[prost(message, repeated, tag = "2")]
    pub operand_mappings: Vec<TensorMappingProto>,

    #[prost(message, repeated, tag = "3")]
    pub result_mappings: Vec<TensorMappingProto>,

    #[prost(int64, repeated, tag = "4")]
    pub reduction_factors: Vec<i64>,

    #[prost(int64, repeated, tag = "5")]
    pub need_replication_factors: Vec<i64>,

    #[prost(int64, repeated, tag = "6")]
    pub permutation_factors: Vec<i64>,

    #[prost(int64, repeated, tag = "7")]
    pub blocked_propagation_factors: Vec<i64>,

    #[prost(bool, tag = "8")]
    pub is_custom_rule: bool,
}

#[derive(Clone, PartialEq, Message)]
pub struct AllToAllParamProto {
    #[prost(message, repeated, tag = "1")]
    pub axes: Vec<AxisRefProto>,

    #[prost(int64, tag = "2")]
    pub source_dimension: i64,

    #[prost(int64, tag = "3")]
    pub target_dimension: i64,
}

#[derive(Clone, PartialEq, Message)]
pub struct AllToAllParamListProto {
    #[prost(message, repeated, tag = "1")]
    pub params: Vec<AllToAllParamProto>,
}

/// Kind of the payload of a [`Record`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Enumeration)]
#[repr(i32)]
pub enum RecordKind {
    Unknown = 0,
    Mesh = 1,
    TensorSharding = 2,
    OpShardingRule = 3,
    AllToAllParams = 4,
}

/// Versioned envelope around a serialized object.
#[derive(Clone, PartialEq, Message)]
pub struct Record {
    #[prost(enumeration = "RecordKind", tag = "1")]
    pub kind: i32,

    #[prost(uint32, tag = "2")]
    pub version: u32,

    #[prost(bytes = "vec", tag = "3")]
    pub payload: Vec<u8>,
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

const MESH_VERSION: u32 = 1;
const TENSOR_SHARDING_VERSION: u32 = 2;
const OP_SHARDING_RULE_VERSION: u32 = 1;
const ALL_TO_ALL_PARAMS_VERSION: u32 = 1;

/// Object that can be serialized as a [`Record`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SerializedObject {
    Mesh(Mesh),
    TensorSharding(TensorSharding),
    OpShardingRule(OpShardingRule),
    AllToAllParams(Vec<AllToAllParam>),
}

impl SerializedObject {
    /// Wraps this object in a [`Record`], using the oldest format version that can represent it.
    pub fn to_record(&self) -> Record {
        let (kind, version, payload) = match self {
            Self::Mesh(mesh) => (RecordKind::Mesh, MESH_VERSION, MeshProto::from(mesh).encode_to_vec()),
            Self::TensorSharding(sharding) if sharding.unreduced_axes().is_empty() => {
                (RecordKind::TensorSharding, 1, TensorShardingV1Proto::from(sharding).encode_to_vec())
            }
            Self::TensorSharding(sharding) => (
                RecordKind::TensorSharding,
                TENSOR_SHARDING_VERSION,
                TensorShardingProto::from(sharding).encode_to_vec(),
            ),
            Self::OpShardingRule(rule) => {
                (RecordKind::OpShardingRule, OP_SHARDING_RULE_VERSION, OpShardingRuleProto::from(rule).encode_to_vec())
            }
            Self::AllToAllParams(params) => (
                RecordKind::AllToAllParams,
                ALL_TO_ALL_PARAMS_VERSION,
                AllToAllParamListProto { params: params.iter().map(AllToAllParamProto::from).collect() }
                    .encode_to_vec(),
            ),
        };
        Record { kind: kind as i32, version, payload }
    }

    /// Unwraps the object in `record`. Returns `None` if the record has an unknown kind or a newer version than this
    /// reader supports.
    pub fn from_record(record: &Record) -> Result<Option<Self>, Error> {
        let Ok(kind) = RecordKind::try_from(record.kind) else {
            debug!(kind = record.kind, "skipping record of unknown kind");
            return Ok(None);
        };
        let latest_version = match kind {
            RecordKind::Unknown => {
                debug!("skipping record of unknown kind");
                return Ok(None);
            }
            RecordKind::Mesh => MESH_VERSION,
            RecordKind::TensorSharding => TENSOR_SHARDING_VERSION,
            RecordKind::OpShardingRule => OP_SHARDING_RULE_VERSION,
            RecordKind::AllToAllParams => ALL_TO_ALL_PARAMS_VERSION,
        };
        if record.version > latest_version {
            debug!(?kind, version = record.version, latest_version, "skipping record with a newer version");
            return Ok(None);
        }

        let payload = record.payload.as_slice();
        let object = match (kind, record.version) {
            (RecordKind::Mesh, _) => Self::Mesh(Mesh::try_from(decode::<MeshProto>(payload)?)?),
            (RecordKind::TensorSharding, 0 | 1) => {
                Self::TensorSharding(TensorSharding::try_from(decode::<TensorShardingV1Proto>(payload)?)?)
            }
            (RecordKind::TensorSharding, _) => {
                Self::TensorSharding(TensorSharding::try_from(decode::<TensorShardingProto>(payload)?)?)
            }
            (RecordKind::OpShardingRule, _) => {
                Self::OpShardingRule(OpShardingRule::try_from(decode::<OpShardingRuleProto>(payload)?)?)
            }
            (RecordKind::AllToAllParams, _) => Self::AllToAllParams(
                decode::<AllToAllParamListProto>(payload)?
                    .params
                    .into_iter()
                    .map(AllToAllParam::try_from)
                    .collect::<Result<_, _>>()?,
            ),
            (RecordKind::Unknown, _) => return Ok(None),
        };
        Ok(Some(object))
    }
}

/// Serializes `objects` as a stream of length-delimited [`Record`]s.
pub fn encode_records(objects: &[SerializedObject]) -> Vec<u8> {
    let mut bytes = Vec::new();
    for object in objects {
        bytes.extend(object.to_record().encode_length_delimited_to_vec());
    }
    bytes
}

/// Deserializes a stream of length-delimited [`Record`]s, skipping records that this reader does not understand.
pub fn decode_records(mut bytes: &[u8]) -> Result<Vec<SerializedObject>, Error> {
    let mut objects = Vec::new();
    while !bytes.is_empty() {
        let record = Record::decode_length_delimited(&mut bytes).map_err(decode_error)?;
        if let Some(object) = SerializedObject::from_record(&record)? {
            objects.push(object);
        }
    }
    Ok(objects)
}

fn decode<M: Message + Default>(payload: &[u8]) -> Result<M, Error> {
    M::decode(payload).map_err(decode_error)
}

fn decode_error(error: prost::DecodeError) -> Error {
    Error::Decode { message: error.to_string() }
}

// ---------------------------------------------------------------------------
// Conversions
// ---------------------------------------------------------------------------

fn to_i64(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn to_usize(value: i64, field: &str) -> Result<usize, Error> {
    usize::try_from(value)
        .map_err(|_| Error::Decode { message: format!("field '{field}' must be non-negative, but got {value}") })
}

impl From<&Mesh> for MeshProto {
    fn from(mesh: &Mesh) -> Self {
        Self {
            axes: mesh
                .axes()
                .iter()
                .map(|axis| MeshAxisProto { name: axis.name().to_string(), size: to_i64(axis.size()) })
                .collect(),
            device_ids: mesh.device_ids().map(<[i64]>::to_vec).unwrap_or_default(),
        }
    }
}

impl TryFrom<MeshProto> for Mesh {
    type Error = Error;

    fn try_from(proto: MeshProto) -> Result<Self, Self::Error> {
        let axes = proto
            .axes
            .into_iter()
            .map(|axis| MeshAxis::new(axis.name, to_usize(axis.size, "size")?))
            .collect::<Result<Vec<_>, _>>()?;
        if proto.device_ids.is_empty() { Mesh::new(axes) } else { Mesh::with_device_ids(axes, proto.device_ids) }
    }
}

impl From<&AxisRef> for AxisRefProto {
    fn from(axis: &AxisRef) -> Self {
        Self {
            name: axis.name().to_string(),
            sub_axis_info: axis
                .sub_axis_info()
                .map(|info| SubAxisInfoProto { pre_size: to_i64(info.pre_size()), size: to_i64(info.size()) }),
        }
    }
}

impl TryFrom<AxisRefProto> for AxisRef {
    type Error = Error;

    fn try_from(proto: AxisRefProto) -> Result<Self, Self::Error> {
        match proto.sub_axis_info {
            Some(info) => Ok(AxisRef::sub_axis(
                proto.name,
                to_usize(info.pre_size, "pre_size")?,
                to_usize(info.size, "size")?,
            )),
            None => Ok(AxisRef::new(proto.name)),
        }
    }
}

fn axes_to_protos(axes: &[AxisRef]) -> Vec<AxisRefProto> {
    axes.iter().map(AxisRefProto::from).collect()
}

fn axes_from_protos(protos: Vec<AxisRefProto>) -> Result<Vec<AxisRef>, Error> {
    protos.into_iter().map(AxisRef::try_from).collect()
}

impl From<&DimensionSharding> for DimensionShardingProto {
    fn from(dimension: &DimensionSharding) -> Self {
        Self {
            axes: axes_to_protos(dimension.axes()),
            is_closed: dimension.is_closed(),
            priority: dimension.priority().map(to_i64),
        }
    }
}

impl TryFrom<DimensionShardingProto> for DimensionSharding {
    type Error = Error;

    fn try_from(proto: DimensionShardingProto) -> Result<Self, Self::Error> {
        let dimension = DimensionSharding::new(axes_from_protos(proto.axes)?, proto.is_closed);
        match proto.priority {
            Some(priority) => Ok(dimension.with_priority(to_usize(priority, "priority")?)),
            None => Ok(dimension),
        }
    }
}

impl From<&TensorSharding> for TensorShardingV1Proto {
    fn from(sharding: &TensorSharding) -> Self {
        Self {
            mesh_name: sharding.mesh_name().to_string(),
            dimension_shardings: sharding.dimension_shardings().iter().map(DimensionShardingProto::from).collect(),
            replicated_axes: axes_to_protos(sharding.replicated_axes()),
        }
    }
}

impl From<&TensorSharding> for TensorShardingProto {
    fn from(sharding: &TensorSharding) -> Self {
        Self {
            mesh_name: sharding.mesh_name().to_string(),
            dimension_shardings: sharding.dimension_shardings().iter().map(DimensionShardingProto::from).collect(),
            replicated_axes: axes_to_protos(sharding.replicated_axes()),
            unreduced_axes: axes_to_protos(sharding.unreduced_axes()),
        }
    }
}

impl TryFrom<TensorShardingV1Proto> for TensorSharding {
    type Error = Error;

    fn try_from(proto: TensorShardingV1Proto) -> Result<Self, Self::Error> {
        TensorSharding::try_from(TensorShardingProto {
            mesh_name: proto.mesh_name,
            dimension_shardings: proto.dimension_shardings,
            replicated_axes: proto.replicated_axes,
            unreduced_axes: Vec::new(),
        })
    }
}

impl TryFrom<TensorShardingProto> for TensorSharding {
    type Error = Error;

    fn try_from(proto: TensorShardingProto) -> Result<Self, Self::Error> {
        Ok(TensorSharding::with_extra_axes(
            proto.mesh_name,
            proto.dimension_shardings.into_iter().map(DimensionSharding::try_from).collect::<Result<Vec<_>, _>>()?,
            axes_from_protos(proto.replicated_axes)?,
            axes_from_protos(proto.unreduced_axes)?,
        ))
    }
}

impl From<&TensorMapping> for TensorMappingProto {
    fn from(mapping: &TensorMapping) -> Self {
        Self {
            dim_mappings: mapping
                .dimensions()
                .iter()
                .map(|factors| DimMappingProto { factor_indices: factors.iter().copied().map(to_i64).collect() })
                .collect(),
        }
    }
}

impl TryFrom<TensorMappingProto> for TensorMapping {
    type Error = Error;

    fn try_from(proto: TensorMappingProto) -> Result<Self, Self::Error> {
        let dimensions = proto
            .dim_mappings
            .into_iter()
            .map(|mapping| {
                mapping
                    .factor_indices
                    .into_iter()
                    .map(|factor| to_usize(factor, "factor_indices"))
                    .collect::<Result<Vec<_>, _>>()
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(TensorMapping::new(dimensions))
    }
}

impl From<&OpShardingRule> for OpShardingRuleProto {
    fn from(rule: &OpShardingRule) -> Self {
        let factors = |factors: Vec<usize>| -> Vec<i64> { factors.into_iter().map(to_i64).collect() };
        Self {
            factor_sizes: rule.factor_sizes().iter().copied().map(to_i64).collect(),
            operand_mappings: rule.operand_mappings().iter().map(TensorMappingProto::from).collect(),
            result_mappings: rule.result_mappings().iter().map(TensorMappingProto::from).collect(),
            reduction_factors: factors(rule.reduction_factors()),
            need_replication_factors: factors(rule.need_replication_factors()),
            permutation_factors: factors(rule.permutation_factors()),
            blocked_propagation_factors: factors(rule.blocked_factors()),
            is_custom_rule: rule.is_custom(),
        }
    }
}

impl TryFrom<OpShardingRuleProto> for OpShardingRule {
    type Error = Error;

    fn try_from(proto: OpShardingRuleProto) -> Result<Self, Self::Error> {
        let factor_sizes = proto
            .factor_sizes
            .into_iter()
            .map(|size| to_usize(size, "factor_sizes"))
            .collect::<Result<Vec<_>, _>>()?;
        let factor_count = factor_sizes.len();
        let factor_index = |factor: i64, field: &str| -> Result<usize, Error> {
            let factor = to_usize(factor, field)?;
            if factor >= factor_count {
                return Err(Error::Decode {
                    message: format!("factor {factor} in '{field}' is out of range for {factor_count} factor(s)"),
                });
            }
            Ok(factor)
        };

        let mut factor_types = vec![FactorType::PassThrough; factor_count];
        let typed_factors = [
            (proto.reduction_factors, FactorType::Reduction, "reduction_factors"),
            (proto.need_replication_factors, FactorType::NeedReplication, "need_replication_factors"),
            (proto.permutation_factors, FactorType::Permutation, "permutation_factors"),
        ];
        for (factors, factor_type, field) in typed_factors {
            for factor in factors {
                let factor = factor_index(factor, field)?;
                if factor_types[factor] != FactorType::PassThrough {
                    return Err(Error::Decode { message: format!("factor {factor} has more than one type") });
                }
                factor_types[factor] = factor_type;
            }
        }
        let mut blocked_factors = vec![false; factor_count];
        for factor in proto.blocked_propagation_factors {
            blocked_factors[factor_index(factor, "blocked_propagation_factors")?] = true;
        }

        let mappings = |mappings: Vec<TensorMappingProto>| -> Result<Vec<TensorMapping>, Error> {
            let mappings = mappings.into_iter().map(TensorMapping::try_from).collect::<Result<Vec<_>, _>>()?;
            for factor in mappings.iter().flat_map(|mapping| mapping.dimensions().iter().flatten()) {
                if *factor >= factor_count {
                    return Err(Error::Decode {
                        message: format!("factor {factor} is out of range for {factor_count} factor(s)"),
                    });
                }
            }
            Ok(mappings)
        };
        let rule = OpShardingRule::from_parts(
            factor_sizes,
            factor_types,
            blocked_factors,
            mappings(proto.operand_mappings)?,
            mappings(proto.result_mappings)?,
        );
        Ok(if proto.is_custom_rule { rule.into_custom() } else { rule })
    }
}

impl From<&AllToAllParam> for AllToAllParamProto {
    fn from(param: &AllToAllParam) -> Self {
        Self {
            axes: axes_to_protos(&param.axes),
            source_dimension: to_i64(param.source_dimension),
            target_dimension: to_i64(param.target_dimension),
        }
    }
}

impl TryFrom<AllToAllParamProto> for AllToAllParam {
    type Error = Error;

    fn try_from(proto: AllToAllParamProto) -> Result<Self, Self::Error> {
        Ok(AllToAllParam::new(
            axes_from_protos(proto.axes)?,
            to_usize(proto.source_dimension, "source_dimension")?,
            to_usize(proto.target_dimension, "target_dimension")?,
        ))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
