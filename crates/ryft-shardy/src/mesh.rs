//! Device meshes and references to (parts of) their axes.
//!
//! A [`Mesh`] is an ordered list of named axes, each with a size, optionally bound to an explicit list of device IDs
//! (when absent, devices follow the implicit row-major iota order). Shardings never refer to devices directly.
//! Instead, they refer to mesh axes through [`AxisRef`]s, which may either cover a whole axis or only a _sub-axis_
//! window of it.
//!
//! # Sub-axes
//!
//! An axis of size `n` can be viewed as the product of a major part, a middle part, and a minor part. The sub-axis
//! `"x":(pre_size)size` is the middle part, where `pre_size` is the product of the sizes of the more major parts.
//! This is the same notation that [Shardy][shardy] uses:
//!
//! | Axis `"x"=8` | `pre_size` | `size` | Meaning |
//! |---|---|---|---|
//! | `"x":(1)2` | 1 | 2 | major-most half of `x` |
//! | `"x":(2)4` | 2 | 4 | minor-most quarter of `x` |
//! | `"x":(2)2` | 2 | 2 | middle part of `x` |
//!
//! All comparisons between windows (containment, overlap, adjacency, prefixes) are integer `pre_size`/`size`
//! arithmetic and never require materializing device coordinates.
//!
//! [shardy]: https://openxla.org/shardy/sharding_representation

use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt::{Display, Formatter};

use crate::errors::Error;

// ---------------------------------------------------------------------------
// Mesh
// ---------------------------------------------------------------------------

/// A named axis in a logical device mesh.
///
/// # Shardy representation
///
/// ```mlir
/// sdy.mesh @mesh = <["data"=4, "model"=2]>
/// //                 ^^^^^^^^  ^^^^^^^^^
/// //                 MeshAxis  MeshAxis
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct MeshAxis {
    name: String,
    size: usize,
}

impl MeshAxis {
    /// Creates a mesh axis.
    pub fn new<N: Into<String>>(name: N, size: usize) -> Result<Self, Error> {
        let name = name.into();
        if name.is_empty() {
            return Err(Error::EmptyMeshAxisName);
        }
        if size == 0 {
            return Err(Error::InvalidMeshAxisSize { axis_name: name });
        }
        Ok(Self { name, size })
    }

    /// Name of this axis.
    pub fn name(&self) -> &str {
        self.name.as_str()
    }

    /// Size of this axis.
    pub fn size(&self) -> usize {
        self.size
    }
}

/// Logical mesh of devices.
///
/// Devices are laid out in **row-major order** with respect to the axis list: for a mesh with axes
/// `("data"=4, "model"=2)`, the device at mesh coordinate `(i, j)` has linear index `i * 2 + j`. When no explicit
/// device IDs are provided, the device at linear index `k` has ID `k`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Mesh {
    axes: Vec<MeshAxis>,
    device_ids: Option<Vec<i64>>,
    axis_index_by_name: HashMap<String, usize>,
}

impl Mesh {
    /// Creates a mesh from named axes with implicit iota device ordering.
    pub fn new(axes: Vec<MeshAxis>) -> Result<Self, Error> {
        Self::build(axes, None)
    }

    /// Creates a mesh from named axes and an explicit row-major device ID list.
    ///
    /// The number of `device_ids` must match the product of all axis sizes and device IDs must be unique.
    pub fn with_device_ids(axes: Vec<MeshAxis>, device_ids: Vec<i64>) -> Result<Self, Error> {
        Self::build(axes, Some(device_ids))
    }

    fn build(axes: Vec<MeshAxis>, device_ids: Option<Vec<i64>>) -> Result<Self, Error> {
        let mut axis_index_by_name = HashMap::with_capacity(axes.len());
        for (axis_index, axis) in axes.iter().enumerate() {
            if axis_index_by_name.insert(axis.name.clone(), axis_index).is_some() {
                return Err(Error::DuplicateMeshAxisName { axis_name: axis.name.clone() });
            }
        }
        let mesh = Self { axes, device_ids: None, axis_index_by_name };
        let Some(device_ids) = device_ids else {
            return Ok(mesh);
        };

        let expected_device_count = mesh.device_count()?;
        if device_ids.len() != expected_device_count {
            return Err(Error::MeshDeviceCountMismatch { expected_device_count, actual_device_count: device_ids.len() });
        }
        let mut seen = HashMap::with_capacity(device_ids.len());
        for device_id in &device_ids {
            if seen.insert(*device_id, ()).is_some() {
                return Err(Error::DuplicateMeshDeviceId { device_id: *device_id });
            }
        }
        Ok(Self { device_ids: Some(device_ids), ..mesh })
    }

    /// Returns the axes of this mesh.
    pub fn axes(&self) -> &[MeshAxis] {
        self.axes.as_slice()
    }

    /// Returns the explicit device IDs of this mesh, if any were provided.
    pub fn device_ids(&self) -> Option<&[i64]> {
        self.device_ids.as_deref()
    }

    /// Returns the total number of devices implied by axis sizes.
    pub fn device_count(&self) -> Result<usize, Error> {
        self.axes.iter().try_fold(1usize, |count, axis| {
            count.checked_mul(axis.size).ok_or_else(|| Error::Overflow {
                context: "computing mesh device count from axis sizes".to_string(),
            })
        })
    }

    /// Returns the device ID of the device at row-major `device_index`, or `None` if this mesh has no such device.
    pub fn device_id(&self, device_index: usize) -> Option<i64> {
        match &self.device_ids {
            Some(device_ids) => device_ids.get(device_index).copied(),
            None => {
                let device_count = self.device_count().ok()?;
                if device_index < device_count { i64::try_from(device_index).ok() } else { None }
            }
        }
    }

    /// Returns the index of `axis_name` in this mesh, if present.
    pub fn axis_index<S: AsRef<str>>(&self, axis_name: S) -> Option<usize> {
        self.axis_index_by_name.get(axis_name.as_ref()).copied()
    }

    /// Returns the size of `axis_name` in this mesh, if present.
    pub fn axis_size<S: AsRef<str>>(&self, axis_name: S) -> Option<usize> {
        self.axis_index(axis_name).map(|axis_index| self.axes[axis_index].size)
    }

    /// Returns the mesh coordinate of the device at row-major `device_index`.
    pub fn coordinate_for_device_index(&self, device_index: usize) -> Vec<usize> {
        let mut index = device_index;
        let mut coordinate = vec![0usize; self.axes.len()];
        for axis in (0..self.axes.len()).rev() {
            let axis_size = self.axes[axis].size;
            coordinate[axis] = index % axis_size;
            index /= axis_size;
        }
        coordinate
    }

    /// Renders this mesh as the right-hand side of a Shardy `sdy.mesh` declaration (e.g., `<["x"=8, "y"=2]>`).
    pub fn to_shardy_mesh_literal(&self) -> String {
        let axes = self
            .axes
            .iter()
            .map(|axis| format!("\"{}\"={}", escape_shardy_string(axis.name()), axis.size()))
            .collect::<Vec<_>>()
            .join(", ");
        match &self.device_ids {
            Some(device_ids) => {
                let device_ids = device_ids.iter().map(i64::to_string).collect::<Vec<_>>().join(", ");
                format!("<[{axes}], device_ids=[{device_ids}]>")
            }
            None => format!("<[{axes}]>"),
        }
    }
}

// ---------------------------------------------------------------------------
// Axis references
// ---------------------------------------------------------------------------

/// Window `(pre_size, size)` selecting the middle part of a mesh axis.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct SubAxisInfo {
    pre_size: usize,
    size: usize,
}

impl SubAxisInfo {
    pub fn new(pre_size: usize, size: usize) -> Self {
        Self { pre_size, size }
    }

    /// Product of the sizes of the more major parts of the axis.
    pub fn pre_size(&self) -> usize {
        self.pre_size
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// `pre_size * size`, i.e., the `pre_size` of the sub-axis immediately minor to this one.
    pub fn next_pre_size(&self) -> usize {
        self.pre_size * self.size
    }
}

/// Reference to a full mesh axis or to a sub-axis window of it.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct AxisRef {
    name: String,
    sub_axis_info: Option<SubAxisInfo>,
}

impl AxisRef {
    /// Creates a reference to the full mesh axis named `name`.
    pub fn new<N: Into<String>>(name: N) -> Self {
        Self { name: name.into(), sub_axis_info: None }
    }

    /// Creates a reference to the sub-axis `name:(pre_size)size`. Use [`AxisRef::validate`] to check it against a
    /// mesh.
    pub fn sub_axis<N: Into<String>>(name: N, pre_size: usize, size: usize) -> Self {
        Self { name: name.into(), sub_axis_info: Some(SubAxisInfo::new(pre_size, size)) }
    }

    /// Creates a reference to the window `[pre_size, pre_size * size)` of an axis with size `axis_size`, normalizing
    /// a window that covers the whole axis to a full axis reference.
    pub(crate) fn window<N: Into<String>>(name: N, pre_size: usize, size: usize, axis_size: usize) -> Self {
        if pre_size == 1 && size == axis_size { Self::new(name) } else { Self::sub_axis(name, pre_size, size) }
    }

    pub fn name(&self) -> &str {
        self.name.as_str()
    }

    pub fn sub_axis_info(&self) -> Option<SubAxisInfo> {
        self.sub_axis_info
    }

    pub fn is_sub_axis(&self) -> bool {
        self.sub_axis_info.is_some()
    }

    /// Checks that this reference names an axis of `mesh` and, if it is a sub-axis, that its window is valid (i.e.,
    /// `size > 1`, `pre_size * size` divides the axis size, and the window does not cover the full axis).
    pub fn validate(&self, mesh: &Mesh) -> Result<(), Error> {
        let axis_size =
            mesh.axis_size(self.name()).ok_or_else(|| Error::UnknownMeshAxis { axis_name: self.name.clone() })?;
        if let Some(info) = self.sub_axis_info {
            let is_valid = info.pre_size >= 1
                && info.size > 1
                && axis_size % info.next_pre_size() == 0
                && info.next_pre_size() <= axis_size
                && !(info.pre_size == 1 && info.size == axis_size);
            if !is_valid {
                return Err(Error::InvalidSubAxis {
                    axis_name: self.name.clone(),
                    pre_size: info.pre_size,
                    size: info.size,
                    axis_size,
                });
            }
        }
        Ok(())
    }

    /// Size of the full axis this reference points into (or `1` if the axis is not part of `mesh`).
    pub fn full_axis_size(&self, mesh: &Mesh) -> usize {
        mesh.axis_size(self.name()).unwrap_or(1)
    }

    /// Number of devices along this (sub-)axis.
    pub fn size(&self, mesh: &Mesh) -> usize {
        match self.sub_axis_info {
            Some(info) => info.size,
            None => self.full_axis_size(mesh),
        }
    }

    pub fn pre_size(&self) -> usize {
        self.sub_axis_info.map_or(1, |info| info.pre_size)
    }

    pub fn next_pre_size(&self, mesh: &Mesh) -> usize {
        self.pre_size() * self.size(mesh)
    }

    /// Returns `true` if `other` is fully covered by this reference.
    pub fn contains(&self, other: &AxisRef, mesh: &Mesh) -> bool {
        self.name == other.name
            && self.pre_size() <= other.pre_size()
            && other.next_pre_size(mesh) <= self.next_pre_size(mesh)
    }

    /// Returns `true` if this reference and `other` share at least one part of the same axis.
    pub fn overlaps(&self, other: &AxisRef, mesh: &Mesh) -> bool {
        self.name == other.name
            && self.pre_size() < other.next_pre_size(mesh)
            && other.pre_size() < self.next_pre_size(mesh)
    }

    /// Returns `true` if this reference is a (not necessarily strict) major-most part of `other`.
    pub fn is_prefix_of(&self, other: &AxisRef, mesh: &Mesh) -> bool {
        self.name == other.name
            && self.pre_size() == other.pre_size()
            && self.next_pre_size(mesh) <= other.next_pre_size(mesh)
    }

    /// Returns `true` if `other` is immediately minor to this reference, such that both can be merged into one.
    pub fn can_merge(&self, other: &AxisRef, mesh: &Mesh) -> bool {
        self.name == other.name && self.next_pre_size(mesh) == other.pre_size()
    }

    /// Merges this reference with `other`, which must satisfy [`AxisRef::can_merge`].
    pub fn merge(&self, other: &AxisRef, mesh: &Mesh) -> AxisRef {
        AxisRef::window(self.name.clone(), self.pre_size(), self.size(mesh) * other.size(mesh), self.full_axis_size(mesh))
    }

    /// Returns the largest reference that is a prefix of both this reference and `other`, if any.
    pub fn greatest_common_prefix(&self, other: &AxisRef, mesh: &Mesh) -> Option<AxisRef> {
        if self.name != other.name || self.pre_size() != other.pre_size() {
            return None;
        }
        let size = self.size(mesh).min(other.size(mesh));
        Some(AxisRef::window(self.name.clone(), self.pre_size(), size, self.full_axis_size(mesh)))
    }

    /// Returns the major-most part of this reference that does not overlap with `other`, if any.
    pub fn prefix_without_overlap(&self, other: &AxisRef, mesh: &Mesh) -> Option<AxisRef> {
        if !self.overlaps(other, mesh) {
            return Some(self.clone());
        }
        if other.pre_size() <= self.pre_size() || other.pre_size() % self.pre_size() != 0 {
            return None;
        }
        let size = other.pre_size() / self.pre_size();
        Some(AxisRef::window(self.name.clone(), self.pre_size(), size, self.full_axis_size(mesh)))
    }

    /// Splits this reference into its major part of size `major_size` and the remaining minor part.
    pub fn split(&self, major_size: usize, mesh: &Mesh) -> Option<(AxisRef, AxisRef)> {
        let size = self.size(mesh);
        if major_size <= 1 || major_size >= size || size % major_size != 0 {
            return None;
        }
        let axis_size = self.full_axis_size(mesh);
        let major = AxisRef::window(self.name.clone(), self.pre_size(), major_size, axis_size);
        let minor = AxisRef::window(self.name.clone(), self.pre_size() * major_size, size / major_size, axis_size);
        Some((major, minor))
    }

    /// Orders references by the position of their axis in `mesh`, then by window.
    pub fn compare(&self, other: &AxisRef, mesh: &Mesh) -> Ordering {
        let self_index = mesh.axis_index(self.name()).unwrap_or(usize::MAX);
        let other_index = mesh.axis_index(other.name()).unwrap_or(usize::MAX);
        self_index
            .cmp(&other_index)
            .then_with(|| self.name.cmp(&other.name))
            .then_with(|| self.pre_size().cmp(&other.pre_size()))
            .then_with(|| self.size(mesh).cmp(&other.size(mesh)))
    }
}

impl Display for AxisRef {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> std::fmt::Result {
        write!(formatter, "\"{}\"", escape_shardy_string(self.name()))?;
        if let Some(info) = self.sub_axis_info {
            write!(formatter, ":({}){}", info.pre_size, info.size)?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Axis lists
// ---------------------------------------------------------------------------

/// Product of the sizes of all `axes`.
pub fn total_size(axes: &[AxisRef], mesh: &Mesh) -> usize {
    axes.iter().map(|axis| axis.size(mesh)).product()
}

/// Merges consecutive references that [can be merged][AxisRef::can_merge] (e.g., `["x":(1)2, "x":(2)2]` becomes
/// `["x"]` when `"x"` has size 4), preserving order otherwise.
pub fn merge_adjacent(axes: &[AxisRef], mesh: &Mesh) -> Vec<AxisRef> {
    let mut merged: Vec<AxisRef> = Vec::with_capacity(axes.len());
    for axis in axes {
        match merged.last_mut() {
            Some(last) if last.can_merge(axis, mesh) => *last = last.merge(axis, mesh),
            _ => merged.push(axis.clone()),
        }
    }
    merged
}

/// Combines two reference lists into one canonical, overlap-free list sorted in mesh order, merging windows that
/// are adjacent or overlapping whenever the merged window is itself a valid sub-axis.
pub fn combine(lhs: &[AxisRef], rhs: &[AxisRef], mesh: &Mesh) -> Vec<AxisRef> {
    let mut axes = lhs.iter().chain(rhs.iter()).cloned().collect::<Vec<_>>();
    axes.sort_by(|a, b| a.compare(b, mesh));
    let mut combined: Vec<AxisRef> = Vec::with_capacity(axes.len());
    for axis in axes {
        let Some(last) = combined.last_mut() else {
            combined.push(axis);
            continue;
        };
        if last.contains(&axis, mesh) {
            continue;
        }
        if last.overlaps(&axis, mesh) || last.can_merge(&axis, mesh) {
            let next_pre_size = axis.next_pre_size(mesh).max(last.next_pre_size(mesh));
            if next_pre_size % last.pre_size() == 0 {
                let size = next_pre_size / last.pre_size();
                *last = AxisRef::window(last.name.clone(), last.pre_size(), size, last.full_axis_size(mesh));
                continue;
            }
        }
        combined.push(axis);
    }
    combined
}

pub(crate) fn escape_shardy_string(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

pub(crate) fn format_axis_list(axes: &[AxisRef]) -> String {
    axes.iter().map(AxisRef::to_string).collect::<Vec<_>>().join(", ")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    pub(crate) fn test_mesh(axes: &[(&str, usize)]) -> Mesh {
        Mesh::new(axes.iter().map(|(name, size)| MeshAxis::new(*name, *size).unwrap()).collect()).unwrap()
    }

    #[test]
    fn test_mesh_construction_and_lookups() {
        let mesh = test_mesh(&[("x", 2), ("y", 4)]);
        assert_eq!(mesh.axes().len(), 2);
        assert_eq!(mesh.axis_index("y"), Some(1));
        assert_eq!(mesh.axis_index("z"), None);
        assert_eq!(mesh.axis_size("y"), Some(4));
        assert_eq!(mesh.device_count().unwrap(), 8);
        assert_eq!(mesh.device_id(5), Some(5));
        assert_eq!(mesh.device_id(8), None);
        assert_eq!(mesh.coordinate_for_device_index(5), vec![1, 1]);
        assert_eq!(mesh.to_shardy_mesh_literal(), "<[\"x\"=2, \"y\"=4]>");
    }

    #[test]
    fn test_mesh_validation() {
        assert!(matches!(MeshAxis::new("", 4), Err(Error::EmptyMeshAxisName)));
        assert!(matches!(
            MeshAxis::new("x", 0),
            Err(Error::InvalidMeshAxisSize { axis_name }) if axis_name == "x",
        ));
        let axes = vec![MeshAxis::new("x", 2).unwrap(), MeshAxis::new("x", 3).unwrap()];
        assert!(matches!(
            Mesh::new(axes),
            Err(Error::DuplicateMeshAxisName { axis_name }) if axis_name == "x",
        ));
        let axes = vec![MeshAxis::new("x", 2).unwrap()];
        assert!(matches!(
            Mesh::with_device_ids(axes.clone(), vec![0, 1, 2]),
            Err(Error::MeshDeviceCountMismatch { expected_device_count: 2, actual_device_count: 3 }),
        ));
        assert!(matches!(
            Mesh::with_device_ids(axes.clone(), vec![1, 1]),
            Err(Error::DuplicateMeshDeviceId { device_id: 1 }),
        ));
        let mesh = Mesh::with_device_ids(axes, vec![1, 0]).unwrap();
        assert_eq!(mesh.device_id(0), Some(1));
        assert_eq!(mesh.to_shardy_mesh_literal(), "<[\"x\"=2], device_ids=[1, 0]>");
    }

    #[test]
    fn test_axis_ref_validation() {
        let mesh = test_mesh(&[("x", 8)]);
        assert_eq!(AxisRef::new("x").validate(&mesh), Ok(()));
        assert_eq!(AxisRef::sub_axis("x", 2, 4).validate(&mesh), Ok(()));
        assert!(matches!(AxisRef::new("z").validate(&mesh), Err(Error::UnknownMeshAxis { .. })));
        assert!(matches!(AxisRef::sub_axis("x", 1, 8).validate(&mesh), Err(Error::InvalidSubAxis { .. })));
        assert!(matches!(AxisRef::sub_axis("x", 4, 4).validate(&mesh), Err(Error::InvalidSubAxis { .. })));
        assert!(matches!(AxisRef::sub_axis("x", 1, 3).validate(&mesh), Err(Error::InvalidSubAxis { .. })));
        assert!(matches!(AxisRef::sub_axis("x", 2, 1).validate(&mesh), Err(Error::InvalidSubAxis { .. })));
    }

    #[test]
    fn test_axis_ref_window_relations() {
        let mesh = test_mesh(&[("x", 8), ("y", 2)]);
        let x = AxisRef::new("x");
        let x_major = AxisRef::sub_axis("x", 1, 2);
        let x_middle = AxisRef::sub_axis("x", 2, 2);
        let x_minor = AxisRef::sub_axis("x", 2, 4);
        assert_eq!(x.size(&mesh), 8);
        assert_eq!(x_minor.next_pre_size(&mesh), 8);
        assert!(x.contains(&x_minor, &mesh));
        assert!(!x_minor.contains(&x, &mesh));
        assert!(x_minor.contains(&x_middle, &mesh));
        assert!(x_middle.overlaps(&x_minor, &mesh));
        assert!(!x_major.overlaps(&x_minor, &mesh));
        assert!(!x_major.overlaps(&AxisRef::new("y"), &mesh));
        assert!(x_major.is_prefix_of(&x, &mesh));
        assert!(!x_minor.is_prefix_of(&x, &mesh));
        assert!(x_major.can_merge(&x_minor, &mesh));
        assert_eq!(x_major.merge(&x_minor, &mesh), x);
        assert_eq!(x_middle.greatest_common_prefix(&x_minor, &mesh), Some(x_middle.clone()));
        assert_eq!(x.greatest_common_prefix(&x_minor, &mesh), None);
        assert_eq!(x.prefix_without_overlap(&x_minor, &mesh), Some(x_major.clone()));
        assert_eq!(x_minor.prefix_without_overlap(&x, &mesh), None);
        assert_eq!(x.split(2, &mesh), Some((x_major, x_minor)));
        assert_eq!(x.split(3, &mesh), None);
    }

    #[test]
    fn test_axis_list_helpers() {
        let mesh = test_mesh(&[("x", 4), ("y", 2)]);
        let x_major = AxisRef::sub_axis("x", 1, 2);
        let x_minor = AxisRef::sub_axis("x", 2, 2);
        let y = AxisRef::new("y");
        assert_eq!(total_size(&[x_major.clone(), y.clone()], &mesh), 4);
        assert_eq!(merge_adjacent(&[x_major.clone(), x_minor.clone(), y.clone()], &mesh), vec![AxisRef::new("x"), y.clone()]);
        assert_eq!(merge_adjacent(&[x_minor.clone(), x_major.clone()], &mesh), vec![x_minor.clone(), x_major.clone()]);
        assert_eq!(combine(&[y.clone(), x_minor.clone()], &[x_major.clone()], &mesh), vec![AxisRef::new("x"), y.clone()]);
        assert_eq!(combine(&[AxisRef::new("x")], &[x_minor], &mesh), vec![AxisRef::new("x")]);
    }

    #[test]
    fn test_axis_ref_rendering() {
        assert_eq!(AxisRef::new("x").to_string(), "\"x\"");
        assert_eq!(AxisRef::sub_axis("x", 2, 4).to_string(), "\"x\":(2)4");
        assert_eq!(format_axis_list(&[AxisRef::new("a"), AxisRef::new("b")]), "\"a\", \"b\"");
    }
}
