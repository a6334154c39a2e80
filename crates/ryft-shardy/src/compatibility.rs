//! Compatibility oracle for axis lists.
//!
//! Propagation only ever refines a dimension sharding by appending minor axes, so most questions it asks about two
//! axis lists reduce to prefix relations: is one list a prefix of the other, what is their longest common prefix, and
//! what is left of a list once a prefix is removed. All of these are sub-axis aware: `["x":(1)2]` is a prefix of
//! `["x"]` when `"x"` has size 4.
//!
//! Resharding additionally needs a _common subdivision_ of all windows used on the same axis (see [`atomize`]), which
//! only exists when every window boundary divides the next one.

use std::collections::{BTreeMap, BTreeSet};

use crate::mesh::{AxisRef, Mesh, merge_adjacent};

/// Returns `true` if `lhs` and `rhs` shard a dimension identically once adjacent sub-axes are merged.
pub fn are_equivalent(lhs: &[AxisRef], rhs: &[AxisRef], mesh: &Mesh) -> bool {
    merge_adjacent(lhs, mesh) == merge_adjacent(rhs, mesh)
}

/// Returns the longest common, order-respecting prefix of `lhs` and `rhs`.
pub fn common_prefix(lhs: &[AxisRef], rhs: &[AxisRef], mesh: &Mesh) -> Vec<AxisRef> {
    let lhs = merge_adjacent(lhs, mesh);
    let rhs = merge_adjacent(rhs, mesh);
    let mut prefix = Vec::new();
    for (lhs_axis, rhs_axis) in lhs.iter().zip(rhs.iter()) {
        if lhs_axis == rhs_axis {
            prefix.push(lhs_axis.clone());
            continue;
        }
        if let Some(common) = lhs_axis.greatest_common_prefix(rhs_axis, mesh) {
            prefix.push(common);
        }
        break;
    }
    prefix
}

/// Returns the longest common prefix of all provided lists (or an empty list if there are none).
pub fn common_prefix_of_all<'a, I>(lists: I, mesh: &Mesh) -> Vec<AxisRef>
where
    I: IntoIterator<Item = &'a [AxisRef]>,
{
    let mut lists = lists.into_iter();
    let Some(first) = lists.next() else {
        return Vec::new();
    };
    lists.fold(merge_adjacent(first, mesh), |prefix, list| common_prefix(&prefix, list, mesh))
}

/// Returns `true` if `prefix` is a (not necessarily strict) prefix of `axes`.
pub fn is_prefix(prefix: &[AxisRef], axes: &[AxisRef], mesh: &Mesh) -> bool {
    common_prefix(prefix, axes, mesh) == merge_adjacent(prefix, mesh)
}

/// Returns `true` if one of `lhs` and `rhs` is a prefix of the other, meaning that both can be refined into the same
/// axis list.
pub fn are_compatible(lhs: &[AxisRef], rhs: &[AxisRef], mesh: &Mesh) -> bool {
    is_prefix(lhs, rhs, mesh) || is_prefix(rhs, lhs, mesh)
}

/// Returns what remains of `axes` after removing `prefix` from its front, or `None` if `prefix` is not a prefix of
/// `axes`. A partially covered axis is split, such that `strip_prefix(["x"], ["x":(1)2])` returns `["x":(2)2]` when
/// `"x"` has size 4.
pub fn strip_prefix(axes: &[AxisRef], prefix: &[AxisRef], mesh: &Mesh) -> Option<Vec<AxisRef>> {
    let axes = merge_adjacent(axes, mesh);
    let prefix = merge_adjacent(prefix, mesh);
    if prefix.len() > axes.len() {
        return None;
    }
    for (index, prefix_axis) in prefix.iter().enumerate() {
        let axis = &axes[index];
        if prefix_axis == axis {
            continue;
        }
        if index + 1 != prefix.len() || !prefix_axis.is_prefix_of(axis, mesh) {
            return None;
        }
        let (_, minor) = axis.split(prefix_axis.size(mesh), mesh)?;
        let mut remainder = vec![minor];
        remainder.extend(axes[index + 1..].iter().cloned());
        return Some(remainder);
    }
    Some(axes[prefix.len()..].to_vec())
}

/// Returns `true` if `axis` overlaps with any of `axes`.
pub fn overlaps_any<'a, I>(axis: &AxisRef, axes: I, mesh: &Mesh) -> bool
where
    I: IntoIterator<Item = &'a AxisRef>,
{
    axes.into_iter().any(|other| axis.overlaps(other, mesh))
}

/// Result of [`atomize`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Atomization {
    /// Input lists in which every axis reference was replaced by the atoms it covers, major to minor.
    pub lists: Vec<Vec<AxisRef>>,

    /// Names of the axes for which no common subdivision exists. References to these axes are left untouched.
    pub opaque_axes: BTreeSet<String>,
}

/// Splits the references of all `lists` into a minimal common subdivision (the _atoms_), such that any two atoms
/// that refer to the same axis are either equal or disjoint.
///
/// For every axis, the subdivision is defined by the sorted set of all window boundaries (`pre_size` and
/// `pre_size * size`) used on that axis. It exists only if each boundary divides the next one. When it does not (for
/// example, `"x":(1)2` and `"x":(1)3` on an axis of size 6), the axis is reported as opaque and its references are
/// kept as they are.
pub fn atomize(lists: &[&[AxisRef]], mesh: &Mesh) -> Atomization {
    let mut boundaries = BTreeMap::<&str, BTreeSet<usize>>::new();
    for axis in lists.iter().flat_map(|list| list.iter()) {
        let axis_boundaries = boundaries.entry(axis.name()).or_default();
        axis_boundaries.insert(axis.pre_size());
        axis_boundaries.insert(axis.next_pre_size(mesh));
    }

    let mut opaque_axes = BTreeSet::new();
    for (name, axis_boundaries) in &boundaries {
        let axis_boundaries = axis_boundaries.iter().copied().collect::<Vec<_>>();
        if axis_boundaries.windows(2).any(|pair| pair[1] % pair[0] != 0) {
            opaque_axes.insert(name.to_string());
        }
    }

    let lists = lists
        .iter()
        .map(|list| {
            let mut atoms = Vec::with_capacity(list.len());
            for axis in list.iter() {
                if opaque_axes.contains(axis.name()) {
                    atoms.push(axis.clone());
                    continue;
                }
                let axis_size = axis.full_axis_size(mesh);
                let start = axis.pre_size();
                let end = axis.next_pre_size(mesh);
                let cuts = boundaries[axis.name()].range(start..=end).copied().collect::<Vec<_>>();
                for pair in cuts.windows(2) {
                    atoms.push(AxisRef::window(axis.name(), pair[0], pair[1] / pair[0], axis_size));
                }
            }
            atoms
        })
        .collect();

    Atomization { lists, opaque_axes }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
