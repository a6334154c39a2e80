//! User-priority propagation tier.
//!
//! User-provided dimension shardings may carry a priority (e.g., `{"x"}p1`), where lower values mean higher priority.
//! Propagation runs once per distinct priority, in increasing order. In the iteration for priority `p`, only the
//! dimension shardings with a priority of at most `p` (and those without a priority) are visible. All other dimensions
//! start out open and empty, so higher-priority shardings get to propagate into them first.
//!
//! When a dimension sharding is admitted, it is reconciled with whatever propagation already assigned to that
//! dimension:
//!
//!   - if the current axes are a prefix of the user axes, the user axes (and the user's open/closed flag) are used,
//!   - otherwise, if the user dimension is open and its axes are a prefix of the current axes, the current axes are
//!     kept (the user allowed further refinement), and
//!   - otherwise the two conflict and the propagated axes are kept. If the user dimension is closed, the kept
//!     dimension is closed as well so that later iterations cannot add further axes to it.
//!
//! Priorities are dropped from the final shardings.

use std::collections::BTreeSet;

use tracing::debug;

use crate::compatibility::{is_prefix, overlaps_any};
use crate::errors::Error;
use crate::graph::{Module, ValueId};
use crate::mesh::Mesh;
use crate::options::PropagationOptions;
use crate::sharding::{DimensionSharding, TensorSharding};

use super::ShardingTable;
use super::debug::{DebugRecorder, PropagationDebugInfo};
use super::driver::PropagationDriver;
use super::factor_propagation::ConflictResolutionPolicy;
use super::op_priority::OpPriorityHeuristic;

/// Propagates shardings through `module`, admitting user-provided dimension shardings in priority order, and stores
/// the resulting shardings (without priorities) in `module`.
pub fn propagate_with_user_priorities(
    module: &mut Module,
    options: &PropagationOptions,
    policy: &dyn ConflictResolutionPolicy,
    heuristics: &[OpPriorityHeuristic],
) -> Result<PropagationDebugInfo, Error> {
    let user_shardings = module.values().iter().map(|value| value.sharding().cloned()).collect::<Vec<_>>();
    let priorities = user_shardings
        .iter()
        .flatten()
        .flat_map(|sharding| sharding.dimension_shardings().iter().filter_map(DimensionSharding::priority))
        .collect::<BTreeSet<_>>();
    let levels = if priorities.is_empty() { vec![None] } else { priorities.into_iter().map(Some).collect() };

    let mut table = ShardingTable::new(module);
    let mut recorder = DebugRecorder::new(options.debug_sharding_origins, options.debug_edge_source_sharding);
    {
        let driver = PropagationDriver::new(module, options, policy);
        for level in levels {
            debug!(priority = ?level, "running user-priority propagation iteration");
            for (index, user_sharding) in user_shardings.iter().enumerate() {
                let Some(user_sharding) = user_sharding else {
                    continue;
                };
                let value = ValueId(index);
                let mesh = module.mesh(user_sharding.mesh_name())?;
                let admitted = admit(value, user_sharding, table.get(value), level, mesh, &mut recorder);
                table.set(value, Some(admitted));
            }
            driver.run_op_priority_passes(&mut table, heuristics, &mut recorder)?;
        }
    }

    for index in 0..module.values().len() {
        let value = ValueId(index);
        if let Some(sharding) = table.get(value) {
            module.set_sharding(value, Some(sharding.without_priorities()))?;
        }
    }
    Ok(recorder.into_info())
}

/// Admits the dimension shardings of `user_sharding` that are visible at priority `level` into `current`.
fn admit(
    value: ValueId,
    user_sharding: &TensorSharding,
    current: Option<&TensorSharding>,
    level: Option<usize>,
    mesh: &Mesh,
    recorder: &mut DebugRecorder,
) -> TensorSharding {
    let mut admitted = match current {
        Some(current) if current.mesh_name() == user_sharding.mesh_name() && current.rank() == user_sharding.rank() => {
            current.clone()
        }
        Some(current) => {
            debug!(value = %value, "keeping propagated sharding over a different mesh than the user sharding");
            return current.clone();
        }
        None => TensorSharding::with_extra_axes(
            user_sharding.mesh_name(),
            vec![DimensionSharding::open(Vec::new()); user_sharding.rank()],
            user_sharding.replicated_axes().to_vec(),
            user_sharding.unreduced_axes().to_vec(),
        ),
    };

    for (dimension, user_dimension) in user_sharding.dimension_shardings().iter().enumerate() {
        let is_hidden = matches!((user_dimension.priority(), level), (Some(priority), Some(level)) if priority > level);
        if is_hidden {
            continue;
        }
        let other_axes = admitted
            .dimension_shardings()
            .iter()
            .enumerate()
            .filter(|(other_dimension, _)| *other_dimension != dimension)
            .flat_map(|(_, other)| other.axes().iter().cloned())
            .chain(admitted.replicated_axes().iter().cloned())
            .chain(admitted.unreduced_axes().iter().cloned())
            .collect::<Vec<_>>();
        let Some(current_dimension) = admitted.dimension_sharding_mut(dimension) else {
            continue;
        };
        let overlaps_other_dimensions =
            user_dimension.axes().iter().any(|axis| overlaps_any(axis, other_axes.iter(), mesh));
        if !overlaps_other_dimensions && is_prefix(current_dimension.axes(), user_dimension.axes(), mesh) {
            current_dimension.set_axes(user_dimension.axes().to_vec());
            current_dimension.set_closed(user_dimension.is_closed());
            recorder.record_user_axes(value, user_dimension.axes());
        } else if !user_dimension.is_closed() && is_prefix(user_dimension.axes(), current_dimension.axes(), mesh) {
            continue;
        } else {
            debug!(
                value = %value,
                dimension,
                user = %user_dimension,
                propagated = %current_dimension,
                "user dimension sharding conflicts with the propagated one; keeping the propagated sharding",
            );
            if user_dimension.is_closed() {
                current_dimension.set_closed(true);
            }
        }
    }
    admitted
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use crate::graph::Attributes;
    use crate::mesh::AxisRef;
    use crate::mesh::tests::test_mesh;
    use crate::propagation::LargestShardedSize;
    use crate::propagation::driver::tests::attach_sharding_rules;
    use crate::propagation::op_priority::DEFAULT_OP_PRIORITY_HEURISTICS;

    use super::*;

    #[test]
    fn test_admission() {
        let mesh = test_mesh(&[("x", 2), ("y", 2)]);
        let mut recorder = DebugRecorder::new(true, false);
        let user = TensorSharding::new(
            "mesh",
            vec![
                DimensionSharding::closed(vec![AxisRef::new("x")]),
                DimensionSharding::open(vec![AxisRef::new("y")]).with_priority(1),
            ],
        );

        let admitted = admit(ValueId(0), &user, None, Some(0), &mesh, &mut recorder);
        assert_eq!(admitted.to_string(), "#sdy.sharding<@mesh, [{\"x\"}, {?}]>");

        let admitted = admit(ValueId(0), &user, Some(&admitted), Some(1), &mesh, &mut recorder);
        assert_eq!(admitted.to_string(), "#sdy.sharding<@mesh, [{\"x\"}, {\"y\", ?}]>");

        let conflicting = TensorSharding::new(
            "mesh",
            vec![DimensionSharding::closed(vec![AxisRef::new("x")]), DimensionSharding::open(Vec::new())],
        );
        let user = TensorSharding::new(
            "mesh",
            vec![DimensionSharding::open(Vec::new()), DimensionSharding::closed(vec![AxisRef::new("x")])],
        );
        let admitted = admit(ValueId(1), &user, Some(&conflicting), None, &mesh, &mut recorder);
        assert_eq!(admitted.to_string(), "#sdy.sharding<@mesh, [{\"x\"}, {}]>");

        let info = recorder.into_info();
        assert_eq!(info.sharding_origins[&ValueId(0)].len(), 2);
        assert!(!info.sharding_origins.contains_key(&ValueId(1)));
    }

    /// Builds `c = add(a, b)` over vectors of size 8 with the provided user shardings for `a` and `b`.
    fn add_module(a: DimensionSharding, b: DimensionSharding) -> (Module, [ValueId; 3]) {
        let mut module = Module::new();
        module.add_mesh("mesh", test_mesh(&[("x", 2), ("y", 2)]));
        let a = module.add_argument(vec![8], Some(TensorSharding::new("mesh", vec![a])));
        let b = module.add_argument(vec![8], Some(TensorSharding::new("mesh", vec![b])));
        let c = module.add_operation("stablehlo.add", vec![a, b], vec![vec![8]], Attributes::new()).unwrap();
        attach_sharding_rules(&mut module);
        (module, [a, b, c[0]])
    }

    fn propagate(module: &mut Module, values: [ValueId; 3]) -> Vec<String> {
        let options = PropagationOptions::default();
        propagate_with_user_priorities(module, &options, &LargestShardedSize, DEFAULT_OP_PRIORITY_HEURISTICS).unwrap();
        values
            .iter()
            .map(|value| module.value(*value).unwrap().sharding().map(ToString::to_string).unwrap_or_default())
            .collect()
    }

    #[test]
    fn test_lower_priority_values_win_conflicts() {
        let x = || vec![AxisRef::new("x")];
        let y = || vec![AxisRef::new("y")];

        let (mut module, values) = add_module(DimensionSharding::open(x()), DimensionSharding::open(y()));
        assert_eq!(
            propagate(&mut module, values),
            vec![
                "#sdy.sharding<@mesh, [{\"x\", ?}]>".to_string(),
                "#sdy.sharding<@mesh, [{\"y\", ?}]>".to_string(),
                "#sdy.sharding<@mesh, [{\"x\", ?}]>".to_string(),
            ],
        );

        let (mut module, values) =
            add_module(DimensionSharding::open(x()).with_priority(1), DimensionSharding::open(y()).with_priority(0));
        assert_eq!(
            propagate(&mut module, values),
            vec![
                "#sdy.sharding<@mesh, [{\"y\", ?}]>".to_string(),
                "#sdy.sharding<@mesh, [{\"y\", ?}]>".to_string(),
                "#sdy.sharding<@mesh, [{\"y\", ?}]>".to_string(),
            ],
        );
    }

    #[test]
    fn test_conflicting_closed_user_dimensions_stay_closed() {
        let (mut module, values) = add_module(
            DimensionSharding::closed(vec![AxisRef::new("x")]).with_priority(1),
            DimensionSharding::open(vec![AxisRef::new("y")]).with_priority(0),
        );
        assert_eq!(
            propagate(&mut module, values),
            vec![
                "#sdy.sharding<@mesh, [{\"y\"}]>".to_string(),
                "#sdy.sharding<@mesh, [{\"y\", ?}]>".to_string(),
                "#sdy.sharding<@mesh, [{\"y\", ?}]>".to_string(),
            ],
        );
    }
}
