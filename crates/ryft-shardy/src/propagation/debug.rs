use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use crate::compatibility::strip_prefix;
use crate::graph::{OperationId, ValueId};
use crate::mesh::{AxisRef, Mesh, format_axis_list};

/// Value whose sharding introduced an axis into the sharding of another value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AxisOrigin {
    pub axis: AxisRef,
    pub origin: ValueId,
}

/// Sharding change caused by propagating through an operation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PropagationEdge {
    /// Position of this change among all sharding changes made during propagation.
    pub step: usize,
    pub operation: OperationId,
    pub source: ValueId,
    pub target: ValueId,
    pub dimension: usize,

    /// Axes that were appended to the sharding of `target`.
    pub axes: Vec<AxisRef>,
}

/// Debugging information collected during propagation when requested through the propagation options.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PropagationDebugInfo {
    /// For every sharded value, the value each of its axes originates from. Axes of user-provided shardings originate
    /// from the value they are attached to.
    pub sharding_origins: BTreeMap<ValueId, Vec<AxisOrigin>>,

    /// Every sharding change, in the order in which it was made.
    pub edges: Vec<PropagationEdge>,
}

impl Display for PropagationDebugInfo {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> std::fmt::Result {
        for (value, origins) in &self.sharding_origins {
            let origins = origins
                .iter()
                .map(|origin| format!("{}: {}", origin.axis, origin.origin))
                .collect::<Vec<_>>()
                .join(", ");
            writeln!(formatter, "{value} origins = {{{origins}}}")?;
        }
        for edge in &self.edges {
            writeln!(
                formatter,
                "step {}: op #{} {} -> {} dim {} [{}]",
                edge.step,
                edge.operation.0,
                edge.source,
                edge.target,
                edge.dimension,
                format_axis_list(&edge.axes),
            )?;
        }
        Ok(())
    }
}

#[derive(Debug)]
pub(crate) struct DebugRecorder {
    record_origins: bool,
    record_edges: bool,
    step: usize,
    info: PropagationDebugInfo,
}

impl DebugRecorder {
    pub(crate) fn new(record_origins: bool, record_edges: bool) -> Self {
        Self { record_origins, record_edges, step: 0, info: PropagationDebugInfo::default() }
    }

    /// Records that the user-provided `axes` of `value` originate from `value` itself.
    pub(crate) fn record_user_axes(&mut self, value: ValueId, axes: &[AxisRef]) {
        if !self.record_origins || axes.is_empty() {
            return;
        }
        let origins = self.info.sharding_origins.entry(value).or_default();
        for axis in axes {
            if !origins.iter().any(|origin| origin.axis == *axis) {
                origins.push(AxisOrigin { axis: axis.clone(), origin: value });
            }
        }
    }

    /// Records that dimension `dimension` of `target` went from `previous_axes` to `axes` because of `source`.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn record_update(
        &mut self,
        operation: OperationId,
        source: ValueId,
        target: ValueId,
        dimension: usize,
        previous_axes: &[AxisRef],
        axes: &[AxisRef],
        mesh: &Mesh,
    ) {
        self.step += 1;
        if !self.record_origins && !self.record_edges {
            return;
        }
        let new_axes = strip_prefix(axes, previous_axes, mesh).unwrap_or_default();
        if self.record_origins {
            let source_origins = self.info.sharding_origins.get(&source).cloned().unwrap_or_default();
            let target_origins = self.info.sharding_origins.entry(target).or_default();
            for axis in &new_axes {
                let origin = source_origins
                    .iter()
                    .find(|origin| origin.axis.overlaps(axis, mesh))
                    .map_or(source, |origin| origin.origin);
                target_origins.push(AxisOrigin { axis: axis.clone(), origin });
            }
        }
        if self.record_edges {
            self.info.edges.push(PropagationEdge {
                step: self.step,
                operation,
                source,
                target,
                dimension,
                axes: new_axes,
            });
        }
    }

    pub(crate) fn into_info(self) -> PropagationDebugInfo {
        self.info
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use crate::mesh::tests::test_mesh;

    use super::*;

    #[test]
    fn test_debug_recorder_tracks_origins_through_edges() {
        let mesh = test_mesh(&[("x", 2), ("y", 2)]);
        let x = AxisRef::new("x");
        let y = AxisRef::new("y");
        let mut recorder = DebugRecorder::new(true, true);
        recorder.record_user_axes(ValueId(0), &[x.clone()]);
        recorder.record_update(OperationId(0), ValueId(0), ValueId(1), 0, &[], &[x.clone()], &mesh);
        recorder.record_update(OperationId(1), ValueId(3), ValueId(2), 1, &[], &[y.clone()], &mesh);
        recorder.record_update(OperationId(2), ValueId(1), ValueId(2), 0, &[], &[x.clone()], &mesh);
        let info = recorder.into_info();
        assert_eq!(
            info.sharding_origins[&ValueId(2)],
            vec![AxisOrigin { axis: y.clone(), origin: ValueId(3) }, AxisOrigin { axis: x.clone(), origin: ValueId(0) }],
        );
        assert_eq!(info.edges.len(), 3);
        assert_eq!(info.edges[2].step, 3);
        assert_eq!(
            info.to_string().lines().last(),
            Some("step 3: op #2 %1 -> %2 dim 0 [\"x\"]"),
        );
    }

    #[test]
    fn test_disabled_debug_recorder_records_nothing() {
        let mesh = test_mesh(&[("x", 2)]);
        let mut recorder = DebugRecorder::new(false, false);
        recorder.record_user_axes(ValueId(0), &[AxisRef::new("x")]);
        recorder.record_update(OperationId(0), ValueId(0), ValueId(1), 0, &[], &[AxisRef::new("x")], &mesh);
        assert_eq!(recorder.into_info(), PropagationDebugInfo::default());
    }
}
