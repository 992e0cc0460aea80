use crate::autodiff::broadcast_shapes;
use crate::error::{ModelError, ModelWarning, Result};
use crate::graph::{Graph, NodeId};
use crate::logprob::TotalSize;
use crate::model::{DimLength, Model, ObservedData, RegisterOptions};
use crate::shape_utils::{size_nodes, validate_shape_dims_size, DimEntry, Dims, DimsArg, ShapeArg, ShapeEntry};
use crate::transforms::{Transform, TransformSpec};
use ndarray::{arr0, ArrayD, IxDyn};
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use rand_chacha::ChaCha8Rng;
use std::collections::HashMap;
use std::sync::Arc;

/// Builds the log-density of `value` given the kernel parameters. When
/// `check_bounds` is set, values outside the support map to `-inf`.
pub type LogpFn = fn(g: &mut Graph, value: NodeId, params: &[NodeId], check_bounds: bool) -> Result<NodeId>;

/// Draws one sample of shape `batch ++ support` from concrete parameters.
pub type DrawFn = fn(params: &[&ArrayD<f64>], batch: &[usize], rng: &mut ChaCha8Rng) -> Result<ArrayD<f64>>;

/// Support shape from the parameter shapes.
pub type SupportShapeFn = fn(param_shapes: &[Vec<usize>]) -> Result<Vec<usize>>;

/// Everything the model needs to know about a distribution family.
#[derive(Clone)]
pub struct Kernel {
    pub name: String,
    /// Number of support dimensions of one draw.
    pub ndim_supp: usize,
    /// Core dimensionality of each parameter.
    pub ndims_params: Vec<usize>,
    pub discrete: bool,
    pub logp: LogpFn,
    pub logcdf: Option<LogpFn>,
    pub draw: Option<DrawFn>,
    pub support_shape: Option<SupportShapeFn>,
    pub default_transform: Option<Transform>,
}

impl std::fmt::Debug for Kernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Kernel")
            .field("name", &self.name)
            .field("ndim_supp", &self.ndim_supp)
            .field("ndims_params", &self.ndims_params)
            .field("discrete", &self.discrete)
            .field("default_transform", &self.default_transform)
            .finish()
    }
}

static KERNELS: Lazy<RwLock<HashMap<String, Arc<Kernel>>>> = Lazy::new(|| {
    let builtins = crate::distributions::builtin_kernels()
        .into_iter()
        .map(|k| (k.name.clone(), Arc::new(k)))
        .collect();
    RwLock::new(builtins)
});

/// Make a kernel available by name. Replaces any kernel of the same name.
pub fn register_kernel(kernel: Kernel) -> Arc<Kernel> {
    let kernel = Arc::new(kernel);
    log::debug!("registering distribution kernel {}", kernel.name);
    KERNELS.write().insert(kernel.name.clone(), Arc::clone(&kernel));
    kernel
}

pub fn get_kernel(name: &str) -> Result<Arc<Kernel>> {
    KERNELS
        .read()
        .get(name)
        .cloned()
        .ok_or_else(|| ModelError::UnknownKernel(name.to_string()))
}

/// Batch and full output shape of a draw.
///
/// `implied` is the broadcast of the parameters' batch shapes. For scalar
/// kernels a `size` at least as long as `implied` is the batch shape; a
/// shorter one is prepended to it. Kernels with support dimensions always
/// prepend `size`.
pub fn rv_output_shape(
    kernel: &Kernel,
    param_shapes: &[Vec<usize>],
    size: &[usize],
) -> Result<(Vec<usize>, Vec<usize>)> {
    let batch_shapes: Vec<Vec<usize>> = param_shapes
        .iter()
        .zip(kernel.ndims_params.iter())
        .map(|(s, &nd)| s[..s.len().saturating_sub(nd)].to_vec())
        .collect();
    let implied = broadcast_shapes(&batch_shapes)?;

    let batch = if kernel.ndim_supp == 0 && size.len() >= implied.len() {
        let joint = broadcast_shapes(&[implied.clone(), size.to_vec()])?;
        if joint != size {
            return Err(ModelError::shape(
                format!("{} parameters do not broadcast to the requested size", kernel.name),
                implied,
                size,
            ));
        }
        size.to_vec()
    } else {
        size.iter().chain(implied.iter()).copied().collect()
    };

    let mut full = batch.clone();
    if kernel.ndim_supp > 0 {
        let support = kernel.support_shape.ok_or_else(|| {
            ModelError::InvalidArgument(format!("{} does not define its support shape", kernel.name))
        })?;
        full.extend(support(param_shapes)?);
    }
    Ok((batch, full))
}

/// Draw independently for every element of `batch`, broadcasting scalar
/// parameters.
pub fn draw_elementwise(
    params: &[&ArrayD<f64>],
    batch: &[usize],
    rng: &mut ChaCha8Rng,
    sample: impl Fn(&[f64], &mut ChaCha8Rng) -> Result<f64>,
) -> Result<ArrayD<f64>> {
    let flat: Vec<Vec<f64>> = params
        .iter()
        .map(|p| {
            p.broadcast(IxDyn(batch))
                .map(|b| b.iter().copied().collect())
                .ok_or_else(|| ModelError::shape("cannot broadcast parameter to the draw shape", p.shape(), batch))
        })
        .collect::<Result<_>>()?;
    let n: usize = batch.iter().product();
    let mut args = vec![0.0; params.len()];
    let mut out = Vec::with_capacity(n);
    for i in 0..n {
        for (slot, p) in args.iter_mut().zip(flat.iter()) {
            *slot = p[i];
        }
        out.push(sample(&args, rng)?);
    }
    ArrayD::from_shape_vec(IxDyn(batch), out).map_err(|e| ModelError::Evaluation(e.to_string()))
}

/// A distribution parameter: a number, an array or an existing node.
#[derive(Debug, Clone)]
pub enum Param {
    Scalar(f64),
    Array(ArrayD<f64>),
    Node(NodeId),
}

impl Param {
    pub fn into_node(self, g: &mut Graph) -> NodeId {
        match self {
            Param::Scalar(v) => g.constant(arr0(v).into_dyn()),
            Param::Array(a) => g.constant(a),
            Param::Node(n) => n,
        }
    }
}

impl From<f64> for Param {
    fn from(v: f64) -> Self {
        Param::Scalar(v)
    }
}

impl From<ArrayD<f64>> for Param {
    fn from(a: ArrayD<f64>) -> Self {
        Param::Array(a)
    }
}

impl From<NodeId> for Param {
    fn from(n: NodeId) -> Self {
        Param::Node(n)
    }
}

/// Options of a standalone distribution.
#[derive(Debug, Clone, Default)]
pub struct DistOptions {
    pub shape: Option<ShapeArg>,
    pub size: Option<ShapeArg>,
    pub testval: Option<ArrayD<f64>>,
}

impl DistOptions {
    pub fn shape(mut self, shape: impl Into<ShapeArg>) -> Self {
        self.shape = Some(shape.into());
        self
    }

    pub fn size(mut self, size: impl Into<ShapeArg>) -> Self {
        self.size = Some(size.into());
        self
    }

    pub fn testval(mut self, value: ArrayD<f64>) -> Self {
        self.testval = Some(value);
        self
    }
}

/// Options of a model variable.
#[derive(Debug, Clone, Default)]
pub struct VarOptions {
    pub shape: Option<ShapeArg>,
    pub size: Option<ShapeArg>,
    pub dims: Option<DimsArg>,
    pub observed: Option<ObservedData>,
    pub total_size: Option<TotalSize>,
    pub transform: TransformSpec,
    pub testval: Option<ArrayD<f64>>,
}

impl VarOptions {
    pub fn shape(mut self, shape: impl Into<ShapeArg>) -> Self {
        self.shape = Some(shape.into());
        self
    }

    pub fn size(mut self, size: impl Into<ShapeArg>) -> Self {
        self.size = Some(size.into());
        self
    }

    pub fn dims(mut self, dims: impl Into<DimsArg>) -> Self {
        self.dims = Some(dims.into());
        self
    }

    pub fn observed(mut self, data: impl Into<ObservedData>) -> Self {
        self.observed = Some(data.into());
        self
    }

    pub fn total_size(mut self, total_size: impl Into<TotalSize>) -> Self {
        self.total_size = Some(total_size.into());
        self
    }

    pub fn transform(mut self, transform: impl Into<TransformSpec>) -> Self {
        self.transform = transform.into();
        self
    }

    pub fn testval(mut self, value: ArrayD<f64>) -> Self {
        self.testval = Some(value);
        self
    }
}

/// Create a standalone random variable.
pub fn dist(g: &mut Graph, kernel: &str, params: Vec<Param>, opts: DistOptions) -> Result<NodeId> {
    let kernel = get_kernel(kernel)?;
    let (shape, _, size) = validate_shape_dims_size(g, opts.shape, None, opts.size)?;
    let params: Vec<NodeId> = params.into_iter().map(|p| p.into_node(g)).collect();
    let ndim_supp = kernel.ndim_supp;

    // A trailing ellipsis in `shape` lists batch dimensions to prepend to
    // the implied ones.
    if let Some(prefix) = shape.as_ref().and_then(|s| s.strip_suffix(&[ShapeEntry::Ellipsis])) {
        let rv = g.random(&kernel, &params, &[])?;
        let expand = size_nodes(g, prefix)?;
        let rv = if expand.is_empty() {
            rv
        } else {
            change_rv_size(g, rv, &expand, true)?
        };
        g.set_test_value(rv, opts.testval);
        return Ok(rv);
    }

    let (ndim_expected, create_size) = match (&shape, &size) {
        (Some(s), _) => {
            let ndim_batch = s.len().checked_sub(ndim_supp).ok_or_else(|| {
                ModelError::shape(
                    format!("`shape` of a {} needs at least its support dimensions", kernel.name),
                    s.len(),
                    ndim_supp,
                )
            })?;
            (Some(s.len()), s[..ndim_batch].to_vec())
        }
        (None, Some(s)) => (Some(s.len() + ndim_supp), s.clone()),
        (None, None) => (None, Vec::new()),
    };

    let create_size = size_nodes(g, &create_size)?;
    let mut rv = g.random(&kernel, &params, &create_size)?;
    let ndim_actual = g.ndim(rv);
    let unexpected = ndim_expected.map_or(false, |e| e != ndim_actual);

    if let (Some(shape), Some(expected), true) = (&shape, ndim_expected, unexpected) {
        // Recreate with the implied dimensions only, then prepend the
        // missing leading dimensions of `shape`.
        rv = g.random(&kernel, &params, &[])?;
        if g.ndim(rv) < expected {
            let expand = size_nodes(g, &shape[..expected - g.ndim(rv)])?;
            rv = change_rv_size(g, rv, &expand, true)?;
        }
        if g.ndim(rv) != expected {
            return Err(ModelError::shape(
                "Failed to create the RV with the expected dimensionality",
                ndim_actual,
                expected,
            ));
        }
    }

    if let (Some(size), true) = (&size, unexpected) {
        g.warn(ModelWarning::Shape(format!(
            "You may have expected a ({}+{})-dimensional RV, but the resulting RV will be {}-dimensional",
            size.len(),
            ndim_supp,
            ndim_actual
        )));
    }

    if opts.testval.is_some() {
        g.set_test_value(rv, opts.testval);
    }
    Ok(rv)
}

/// Rebuild a random variable with a new size. With `expand` the new size
/// is prepended to the current batch shape.
pub fn change_rv_size(g: &mut Graph, rv: NodeId, new_size: &[NodeId], expand: bool) -> Result<NodeId> {
    let (name, params, size) = g
        .random_parts(rv)
        .map(|(k, p, s)| (k.to_string(), p.to_vec(), s.to_vec()))
        .ok_or_else(|| ModelError::InvalidArgument(format!("`{}` is not a random variable", g.describe(rv))))?;
    let kernel = get_kernel(&name)?;

    let mut full = new_size.to_vec();
    if expand {
        let scalar_implied = kernel.ndim_supp == 0 && size.len() < g.ndim(rv);
        if scalar_implied {
            full.extend(g.shape_nodes(rv)?);
        } else {
            full.extend(size);
        }
    }
    let new = g.random(&kernel, &params, &full)?;
    let test_value = g.test_value(rv).cloned();
    g.set_test_value(new, test_value);
    log::debug!("resized {} from {}d to {}d", kernel.name, g.ndim(rv), g.ndim(new));
    Ok(new)
}

fn resize_from_dims(model: &Model, dims: Dims, ndim_implied: usize) -> Result<(usize, Vec<NodeId>, Dims)> {
    let dims: Dims = match dims.last() {
        Some(DimEntry::Ellipsis) => dims[..dims.len() - 1]
            .iter()
            .cloned()
            .chain(std::iter::repeat(DimEntry::Unnamed).take(ndim_implied))
            .collect(),
        _ => dims,
    };
    let ndim_resize = dims.len().checked_sub(ndim_implied).ok_or_else(|| {
        ModelError::shape(
            format!("`dims` {dims:?} has fewer entries than the implied dimensions"),
            dims.len(),
            ndim_implied,
        )
    })?;

    let mut unknown = Vec::new();
    let mut resize = Vec::new();
    for d in &dims[..ndim_resize] {
        match d.name().and_then(|n| model.dim_length(n)) {
            Some(len) => resize.push(len),
            None => unknown.push(d.name().unwrap_or("None").to_string()),
        }
    }
    if !unknown.is_empty() {
        return Err(ModelError::UnknownDimension(unknown));
    }
    Ok((ndim_resize, resize, dims))
}

fn resize_from_observed(model: &Model, observed: &ObservedData, ndim_implied: usize) -> Result<(usize, Vec<NodeId>)> {
    let mut g = model.graph_mut();
    let ndim = observed.ndim(&g);
    let ndim_resize = ndim.saturating_sub(ndim_implied);
    let resize = observed.length_nodes(&mut g, ndim_resize)?;
    Ok((ndim_resize, resize))
}

/// Create a random variable in the innermost model and register it.
pub fn new_var(name: &str, kernel: &str, params: Vec<Param>, opts: VarOptions) -> Result<NodeId> {
    let model = Model::get_context()?;
    let VarOptions {
        shape,
        size,
        dims,
        observed,
        total_size,
        transform,
        testval,
    } = opts;

    let dims = match dims {
        Some(d) => validate_shape_dims_size(&model.graph(), None, Some(d), None)?.1,
        None => None,
    };
    if dims.is_some() && (shape.is_some() || size.is_some()) {
        return Err(ModelError::InvalidShapeSpec(
            "Passing both `shape` and `dims` (or `size`) is not supported!".to_string(),
        ));
    }

    let mut rv = dist(
        &mut model.graph_mut(),
        kernel,
        params,
        DistOptions {
            shape,
            size,
            testval: None,
        },
    )?;
    let ndim_implied = model.graph().ndim(rv);

    let (ndim_resize, resize, dims) = match (dims, &observed) {
        (Some(d), _) => {
            let (n, resize, d) = resize_from_dims(&model, d, ndim_implied)?;
            (n, resize, Some(d))
        }
        (None, Some(obs)) => {
            let (n, resize) = resize_from_observed(&model, obs, ndim_implied)?;
            (n, resize, None)
        }
        (None, None) => (0, Vec::new(), None),
    };
    if !resize.is_empty() {
        rv = change_rv_size(&mut model.graph_mut(), rv, &resize, true)?;
    }

    if let Some(d) = &dims {
        for (axis, entry) in d.iter().enumerate().skip(ndim_resize) {
            if let DimEntry::Named(dname) = entry {
                if model.dim_length(dname).is_none() {
                    let len = model.graph_mut().shape_of(rv, axis)?;
                    model.add_coord(dname, None, Some(DimLength::Node(len)))?;
                }
            }
        }
    }

    if testval.is_some() {
        model.graph_mut().set_test_value(rv, testval);
    }

    model.register_rv(
        rv,
        name,
        RegisterOptions {
            observed,
            total_size,
            dims,
            transform,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autodiff::infer_shape;
    use crate::autodiff::Givens;
    use ndarray::{Array, Array2};

    fn shape_of(g: &Graph, rv: NodeId) -> Vec<usize> {
        infer_shape(g, rv, &Givens::new()).unwrap()
    }

    #[test]
    fn test_builtins_are_registered() {
        for name in ["Normal", "HalfNormal", "Uniform", "Gamma", "Poisson", "MvNormal"] {
            assert!(get_kernel(name).is_ok(), "{} missing", name);
        }
        assert!(matches!(get_kernel("Cauchy"), Err(ModelError::UnknownKernel(_))));
    }

    #[test]
    fn test_shape_size_agree_for_scalar_kernels() {
        let mut g = Graph::new();
        let a = dist(&mut g, "Normal", vec![0.0.into(), 1.0.into()], DistOptions::default().shape([5usize, 4])).unwrap();
        let b = dist(&mut g, "Normal", vec![0.0.into(), 1.0.into()], DistOptions::default().size([5usize, 4])).unwrap();
        assert_eq!(shape_of(&g, a), vec![5, 4]);
        assert_eq!(shape_of(&g, b), vec![5, 4]);
        assert!(g.warnings().is_empty());
    }

    #[test]
    fn test_size_mismatch_warns() {
        let mut g = Graph::new();
        let mu: ArrayD<f64> = Array::ones(IxDyn(&[5, 4, 3]));
        let rv = dist(&mut g, "Normal", vec![mu.into(), 1.0.into()], DistOptions::default().size([5usize, 4])).unwrap();
        assert_eq!(shape_of(&g, rv), vec![5, 4, 5, 4, 3]);
        let warnings = g.take_warnings();
        assert_eq!(warnings.len(), 1);
        assert!(matches!(&warnings[0], ModelWarning::Shape(m) if m.contains("(2+0)-dimensional")));
    }

    #[test]
    fn test_shape_mismatch_matches_or_fails() {
        let mut g = Graph::new();
        let mu: ArrayD<f64> = Array::ones(IxDyn(&[5, 4, 3]));
        let err = dist(&mut g, "Normal", vec![mu.clone().into(), 1.0.into()], DistOptions::default().shape([5usize, 4]));
        assert!(matches!(err, Err(ModelError::Shape { .. })));
        let ok = dist(&mut g, "Normal", vec![mu.into(), 1.0.into()], DistOptions::default().shape([2usize, 5, 4, 3])).unwrap();
        assert_eq!(shape_of(&g, ok), vec![2, 5, 4, 3]);
        assert!(g.warnings().is_empty());
    }

    #[test]
    fn test_mvnormal_shape_fallback() {
        let mut g = Graph::new();
        let mu: ArrayD<f64> = Array::ones(IxDyn(&[2, 3]));
        let cov = Array2::<f64>::eye(3).into_dyn();
        let rv = dist(&mut g, "MvNormal", vec![mu.into(), cov.into()], DistOptions::default().shape([2usize, 3])).unwrap();
        assert_eq!(shape_of(&g, rv), vec![2, 3]);

        let mu: ArrayD<f64> = Array::ones(IxDyn(&[3]));
        let cov = Array2::<f64>::eye(3).into_dyn();
        let rv = dist(&mut g, "MvNormal", vec![mu.into(), cov.into()], DistOptions::default().shape([4usize, 2, 3])).unwrap();
        assert_eq!(shape_of(&g, rv), vec![4, 2, 3]);
        assert!(g.warnings().is_empty());
    }

    #[test]
    fn test_shape_with_ellipsis_prepends() {
        let mut g = Graph::new();
        let mu: ArrayD<f64> = Array::zeros(IxDyn(&[3]));
        let shape = vec![ShapeEntry::Fixed(2), ShapeEntry::Ellipsis];
        let rv = dist(&mut g, "Normal", vec![mu.into(), 1.0.into()], DistOptions::default().shape(shape)).unwrap();
        assert_eq!(shape_of(&g, rv), vec![2, 3]);
    }

    #[test]
    fn test_change_rv_size_expands() {
        let mut g = Graph::new();
        let rv = dist(&mut g, "Normal", vec![0.0.into(), 1.0.into()], DistOptions::default().size([3usize])).unwrap();
        let two = g.scalar(2.0);
        let bigger = change_rv_size(&mut g, rv, &[two], true).unwrap();
        assert_eq!(shape_of(&g, bigger), vec![2, 3]);
        let replaced = change_rv_size(&mut g, rv, &[two], false).unwrap();
        assert_eq!(shape_of(&g, replaced), vec![2]);

        let mu: ArrayD<f64> = Array::zeros(IxDyn(&[4]));
        let implied = dist(&mut g, "Normal", vec![mu.into(), 1.0.into()], DistOptions::default()).unwrap();
        let bigger = change_rv_size(&mut g, implied, &[two], true).unwrap();
        assert_eq!(shape_of(&g, bigger), vec![2, 4]);
    }
}
