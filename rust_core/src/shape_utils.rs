//! Validation and normalization of the `shape` / `dims` / `size` arguments
//! accepted by distribution constructors.
//!
//! `shape` is the full shape of a variable (batch and support dimensions),
//! `size` only the batch part, and `dims` names the dimensions through the
//! model's coordinates. At most one of the three may be given. `shape` and
//! `dims` may end in an ellipsis, which stands for "the dimensions implied
//! by the parameters".

use crate::error::{ModelError, Result};
use crate::graph::{Graph, NodeId, Op};

#[derive(Debug, Clone, PartialEq)]
pub enum ShapeEntry {
    Fixed(usize),
    /// Scalar node holding the length.
    Symbolic(NodeId),
    Ellipsis,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ShapeArg {
    Entries(Vec<ShapeEntry>),
    /// A symbolic shape: a scalar node or a vector constant.
    Node(NodeId),
}

impl From<usize> for ShapeArg {
    fn from(n: usize) -> Self {
        ShapeArg::Entries(vec![ShapeEntry::Fixed(n)])
    }
}

impl From<Vec<usize>> for ShapeArg {
    fn from(v: Vec<usize>) -> Self {
        ShapeArg::Entries(v.into_iter().map(ShapeEntry::Fixed).collect())
    }
}

impl<const N: usize> From<[usize; N]> for ShapeArg {
    fn from(v: [usize; N]) -> Self {
        ShapeArg::from(v.to_vec())
    }
}

impl From<Vec<ShapeEntry>> for ShapeArg {
    fn from(v: Vec<ShapeEntry>) -> Self {
        ShapeArg::Entries(v)
    }
}

impl From<NodeId> for ShapeArg {
    fn from(n: NodeId) -> Self {
        ShapeArg::Node(n)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DimEntry {
    Named(String),
    Unnamed,
    Ellipsis,
}

impl DimEntry {
    pub fn name(&self) -> Option<&str> {
        match self {
            DimEntry::Named(n) => Some(n),
            _ => None,
        }
    }
}

/// `"..."` is read as an ellipsis.
impl From<&str> for DimEntry {
    fn from(s: &str) -> Self {
        if s == "..." {
            DimEntry::Ellipsis
        } else {
            DimEntry::Named(s.to_string())
        }
    }
}

impl From<Option<&str>> for DimEntry {
    fn from(s: Option<&str>) -> Self {
        s.map(DimEntry::from).unwrap_or(DimEntry::Unnamed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DimsArg(pub Vec<DimEntry>);

impl From<&str> for DimsArg {
    fn from(s: &str) -> Self {
        DimsArg(vec![DimEntry::from(s)])
    }
}

impl From<Vec<&str>> for DimsArg {
    fn from(v: Vec<&str>) -> Self {
        DimsArg(v.into_iter().map(DimEntry::from).collect())
    }
}

impl<const N: usize> From<[&str; N]> for DimsArg {
    fn from(v: [&str; N]) -> Self {
        DimsArg::from(v.to_vec())
    }
}

impl From<Vec<DimEntry>> for DimsArg {
    fn from(v: Vec<DimEntry>) -> Self {
        DimsArg(v)
    }
}

pub type Shape = Vec<ShapeEntry>;
pub type Dims = Vec<DimEntry>;

fn ellipsis_is_last<T>(entries: &[T], is_ellipsis: impl Fn(&T) -> bool) -> bool {
    match entries.iter().position(is_ellipsis) {
        Some(i) => i == entries.len() - 1,
        None => true,
    }
}

fn expand_node(g: &Graph, node: NodeId) -> Result<Shape> {
    let n = g.node(node);
    match (&n.op, n.ndim) {
        (_, 0) => Ok(vec![ShapeEntry::Symbolic(node)]),
        (Op::Constant(c), 1) => c
            .iter()
            .map(|&v| {
                if v < 0.0 || v.fract() != 0.0 {
                    Err(ModelError::InvalidShapeSpec(format!(
                        "Shape entries must be non-negative integers, got {v}"
                    )))
                } else {
                    Ok(ShapeEntry::Fixed(v as usize))
                }
            })
            .collect(),
        _ => Err(ModelError::InvalidShapeSpec(format!(
            "A symbolic shape must be a scalar or a vector of known length, got `{}`",
            g.describe(node)
        ))),
    }
}

fn normalize(g: &Graph, arg: Option<ShapeArg>) -> Result<Option<Shape>> {
    match arg {
        None => Ok(None),
        Some(ShapeArg::Entries(v)) => Ok(Some(v)),
        Some(ShapeArg::Node(n)) => expand_node(g, n).map(Some),
    }
}

/// Check that at most one of `shape`, `dims` and `size` is given, and
/// normalize each to a tuple.
pub fn validate_shape_dims_size(
    g: &Graph,
    shape: Option<ShapeArg>,
    dims: Option<DimsArg>,
    size: Option<ShapeArg>,
) -> Result<(Option<Shape>, Option<Dims>, Option<Shape>)> {
    let given = [shape.is_some(), dims.is_some(), size.is_some()];
    if given.iter().filter(|&&b| b).count() > 1 {
        return Err(ModelError::InvalidShapeSpec(
            "Passing both `shape` and `dims` (or `size`) is not supported!".to_string(),
        ));
    }
    let shape = normalize(g, shape)?;
    let size = normalize(g, size)?;
    let dims = dims.map(|d| d.0);

    if let Some(s) = &shape {
        if !ellipsis_is_last(s, |e| *e == ShapeEntry::Ellipsis) {
            return Err(ModelError::InvalidShapeSpec(format!(
                "Ellipsis in `shape` may only appear in the last position. Actual: {s:?}"
            )));
        }
    }
    if let Some(d) = &dims {
        if !ellipsis_is_last(d, |e| *e == DimEntry::Ellipsis) {
            return Err(ModelError::InvalidShapeSpec(format!(
                "Ellipsis in `dims` may only appear in the last position. Actual: {d:?}"
            )));
        }
    }
    if let Some(s) = &size {
        if s.contains(&ShapeEntry::Ellipsis) {
            return Err(ModelError::InvalidShapeSpec(format!(
                "The `size` parameter cannot contain an Ellipsis. Actual: {s:?}"
            )));
        }
    }
    Ok((shape, dims, size))
}

/// Scalar nodes for each entry of an ellipsis-free shape.
pub fn size_nodes(g: &mut Graph, entries: &[ShapeEntry]) -> Result<Vec<NodeId>> {
    entries
        .iter()
        .map(|e| match e {
            ShapeEntry::Fixed(n) => Ok(g.scalar(*n as f64)),
            ShapeEntry::Symbolic(node) => Ok(*node),
            ShapeEntry::Ellipsis => Err(ModelError::InvalidShapeSpec(
                "an ellipsis cannot be turned into a length".to_string(),
            )),
        })
        .collect()
}
