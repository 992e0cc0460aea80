//! The model: a registry of named random variables over one graph.
//!
//! A model tree shares a single [`ModelState`]. Every registered entry
//! remembers the scope (model) it was created in; a model handle sees the
//! entries of its own scope and of all its descendants, so a parent lists
//! everything its children registered while a child only lists its own.
//! Coordinates and dimension lengths are shared by the whole tree.

use crate::autodiff::{evaluate, evaluate_scalar, grad, Evaluator, Givens};
use crate::config::ModelConfig;
use crate::context::{self, Context, ContextGuard};
use crate::distribution::{get_kernel, Kernel};
use crate::error::{ModelError, Result};
use crate::graph::{Graph, NodeId, Op};
use crate::logprob::{logpt_sum, rvs_to_values, Binding, Bindings, LogpOptions, TotalSize};
use crate::shape_utils::{DimEntry, Dims, DimsArg};
use crate::transforms::{Transform, TransformSpec};
use ndarray::{arr0, Array1, ArrayD, IxDyn};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::cell::{Ref, RefCell, RefMut};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;

/// Dimension names reserved for sampler output.
pub const RESERVED_DIMS: [&str; 3] = ["chain", "draw", "__sample__"];

/// Values of the value variables, keyed by name.
pub type Point = BTreeMap<String, ArrayD<f64>>;

/// A coordinate label of a named dimension.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CoordLabel {
    Int(i64),
    Text(String),
}

impl fmt::Display for CoordLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoordLabel::Int(i) => write!(f, "{i}"),
            CoordLabel::Text(s) => write!(f, "{s}"),
        }
    }
}

impl From<&str> for CoordLabel {
    fn from(s: &str) -> Self {
        CoordLabel::Text(s.to_string())
    }
}

impl From<String> for CoordLabel {
    fn from(s: String) -> Self {
        CoordLabel::Text(s)
    }
}

impl From<i64> for CoordLabel {
    fn from(i: i64) -> Self {
        CoordLabel::Int(i)
    }
}

/// Length of a named dimension.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DimLength {
    /// A scalar node, e.g. the shape of a data container along one axis.
    Node(NodeId),
    /// A fixed length that cannot be resized later.
    Fixed(usize),
}

/// Observed data attached to a random variable.
#[derive(Debug, Clone)]
pub enum ObservedData {
    Dense(ArrayD<f64>),
    /// `mask` is `true` where a value is missing.
    Masked {
        data: ArrayD<f64>,
        mask: ArrayD<bool>,
    },
    /// Coordinate-format sparse data; unlisted entries are zero.
    Sparse {
        shape: Vec<usize>,
        entries: Vec<(Vec<usize>, f64)>,
    },
    /// An independent graph node: a constant, shared data or a minibatch.
    Node(NodeId),
}

/// NaN entries are treated as missing.
impl From<ArrayD<f64>> for ObservedData {
    fn from(data: ArrayD<f64>) -> Self {
        if data.iter().any(|v| v.is_nan()) {
            let mask = data.mapv(f64::is_nan);
            ObservedData::Masked { data, mask }
        } else {
            ObservedData::Dense(data)
        }
    }
}

impl From<NodeId> for ObservedData {
    fn from(node: NodeId) -> Self {
        ObservedData::Node(node)
    }
}

impl ObservedData {
    pub fn masked(data: ArrayD<f64>, mask: ArrayD<bool>) -> Result<Self> {
        if data.shape() != mask.shape() {
            return Err(ModelError::shape("mask and data differ in shape", mask.shape(), data.shape()));
        }
        Ok(ObservedData::Masked { data, mask })
    }

    pub fn ndim(&self, g: &Graph) -> usize {
        match self {
            ObservedData::Dense(a) | ObservedData::Masked { data: a, .. } => a.ndim(),
            ObservedData::Sparse { shape, .. } => shape.len(),
            ObservedData::Node(n) => g.ndim(*n),
        }
    }

    /// Scalar nodes holding the lengths of the leading `n` axes.
    pub fn length_nodes(&self, g: &mut Graph, n: usize) -> Result<Vec<NodeId>> {
        let shape = match self {
            ObservedData::Node(node) => return (0..n).map(|axis| g.shape_of(*node, axis)).collect(),
            ObservedData::Dense(a) | ObservedData::Masked { data: a, .. } => a.shape().to_vec(),
            ObservedData::Sparse { shape, .. } => shape.clone(),
        };
        Ok(shape.iter().take(n).map(|&len| g.scalar(len as f64)).collect())
    }

    fn densify(shape: &[usize], entries: &[(Vec<usize>, f64)]) -> Result<ArrayD<f64>> {
        let mut out = ArrayD::zeros(IxDyn(shape));
        for (idx, v) in entries {
            let slot = out
                .get_mut(IxDyn(idx))
                .ok_or_else(|| ModelError::shape("sparse entry out of bounds", idx, shape))?;
            *slot = *v;
        }
        Ok(out)
    }
}

/// Everything `register_rv` needs besides the variable and its name.
#[derive(Debug, Clone, Default)]
pub struct RegisterOptions {
    pub observed: Option<ObservedData>,
    pub total_size: Option<TotalSize>,
    pub dims: Option<Dims>,
    pub transform: TransformSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Scope {
    pub name: String,
    pub parent: Option<usize>,
}

/// Bookkeeping shared by every model of one tree.
#[derive(Debug, Clone, Default)]
pub(crate) struct ModelState {
    pub graph: Graph,
    pub scopes: Vec<Scope>,
    pub named_vars: Vec<(usize, String, NodeId)>,
    pub free_rvs: Vec<(usize, NodeId)>,
    pub observed_rvs: Vec<(usize, NodeId)>,
    pub deterministics: Vec<(usize, NodeId)>,
    pub auto_deterministics: Vec<(usize, NodeId)>,
    pub potentials: Vec<(usize, NodeId)>,
    pub rvs_to_values: HashMap<NodeId, NodeId>,
    pub values_to_rvs: HashMap<NodeId, NodeId>,
    /// Keyed by value variable.
    pub transforms: HashMap<NodeId, Transform>,
    /// Observed random variable to its data node.
    pub observations: HashMap<NodeId, NodeId>,
    pub total_sizes: HashMap<NodeId, TotalSize>,
    pub rv_dims: Vec<(String, Vec<Option<String>>)>,
    pub coords: Vec<(String, Option<Vec<CoordLabel>>)>,
    pub dim_lengths: HashMap<String, NodeId>,
    pub cache: QueryCache,
}

/// Nodes built by earlier queries. Any registration clears it, since the
/// rewrites depend on which variables are bound.
#[derive(Debug, Clone, Default)]
pub(crate) struct QueryCache {
    /// Keyed by random variable, Jacobian flag and bounds checking.
    terms: HashMap<(NodeId, bool, bool), NodeId>,
    /// Summed log-densities, keyed by scope and kind.
    totals: HashMap<(usize, &'static str), NodeId>,
    /// Nodes with random variables replaced by their values.
    rewrites: HashMap<NodeId, NodeId>,
    /// Back-transformed value variables, keyed by value variable.
    originals: HashMap<NodeId, NodeId>,
}

impl ModelState {
    pub fn new(graph: Graph, root_name: &str) -> Self {
        Self {
            graph,
            scopes: vec![Scope {
                name: root_name.to_string(),
                parent: None,
            }],
            ..Default::default()
        }
    }

    fn has_name(&self, name: &str) -> bool {
        self.named_vars.iter().any(|(_, n, _)| n == name)
    }

    fn coord(&self, name: &str) -> Option<&Option<Vec<CoordLabel>>> {
        self.coords.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    fn bindings(&self) -> Bindings {
        let free = self.rvs_to_values.iter().map(|(&rv, &value)| {
            let transform = self.transforms.get(&value).copied();
            (rv, Binding::Value { value, transform })
        });
        let observed = self.observations.iter().map(|(&rv, &data)| (rv, Binding::Observed(data)));
        free.chain(observed).collect()
    }

    /// Copy of the registries, without the graph. Nodes added after the
    /// checkpoint stay in the graph but become unreachable on restore.
    fn checkpoint(&mut self) -> ModelState {
        let graph = std::mem::take(&mut self.graph);
        let saved = self.clone();
        self.graph = graph;
        saved
    }

    fn restore(&mut self, saved: ModelState) {
        let graph = std::mem::take(&mut self.graph);
        *self = saved;
        self.graph = graph;
    }

    /// `nodes` with random variables replaced by their value variables or
    /// data.
    fn rewritten(&mut self, nodes: &[NodeId]) -> Result<Vec<NodeId>> {
        let pending: Vec<NodeId> = nodes
            .iter()
            .copied()
            .filter(|n| !self.cache.rewrites.contains_key(n))
            .collect();
        if !pending.is_empty() {
            let bindings = self.bindings();
            let out = rvs_to_values(&mut self.graph, &pending, &bindings)?;
            self.cache.rewrites.extend(pending.into_iter().zip(out));
        }
        nodes
            .iter()
            .map(|n| {
                self.cache
                    .rewrites
                    .get(n)
                    .copied()
                    .ok_or_else(|| ModelError::UnknownVariable(self.graph.describe(*n)))
            })
            .collect()
    }

    fn kernel_of(&self, rv: NodeId) -> Result<Arc<Kernel>> {
        let name = self.graph.random_parts(rv).map(|(k, _, _)| k.to_string()).ok_or_else(|| {
            ModelError::InvalidArgument(format!("`{}` is not a random variable", self.graph.describe(rv)))
        })?;
        get_kernel(&name)
    }
}

pub(crate) struct ModelInner {
    pub scope: usize,
    pub config: ModelConfig,
    pub parent: Option<Model>,
    pub state: Rc<RefCell<ModelState>>,
}

/// Handle to a model. Cloning is cheap and yields the same model.
#[derive(Clone)]
pub struct Model(pub(crate) Rc<ModelInner>);

impl Context for Model {
    fn missing() -> ModelError {
        ModelError::NoActiveModel
    }
}

impl fmt::Debug for Model {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Model")
            .field("name", &self.0.config.name)
            .field("scope", &self.0.scope)
            .finish()
    }
}

fn dim_names(dims: &Dims) -> Result<Vec<Option<String>>> {
    dims.iter()
        .map(|d| match d {
            DimEntry::Named(n) => Ok(Some(n.clone())),
            DimEntry::Unnamed => Ok(None),
            DimEntry::Ellipsis => Err(ModelError::InvalidShapeSpec(
                "`dims` must not contain an Ellipsis here".to_string(),
            )),
        })
        .collect()
}

/// The last of `values`, which is the final output requested.
fn last_output(mut values: Vec<ArrayD<f64>>) -> Result<ArrayD<f64>> {
    values
        .pop()
        .ok_or_else(|| ModelError::Evaluation("no output was computed".to_string()))
}

impl Model {
    /// Create a model. Inside another model's scope the new model becomes
    /// its child.
    pub fn new(config: ModelConfig) -> Result<Model> {
        let parent = context::get_context::<Model>(false)?;
        Self::with_parent(config, parent)
    }

    pub fn with_parent(config: ModelConfig, parent: Option<Model>) -> Result<Model> {
        let (state, scope) = match &parent {
            Some(p) => {
                let state = p.0.state.clone();
                let scope = {
                    let mut st = state.borrow_mut();
                    st.scopes.push(Scope {
                        name: config.name.clone(),
                        parent: Some(p.0.scope),
                    });
                    st.scopes.len() - 1
                };
                (state, scope)
            }
            None => {
                let st = ModelState::new(Graph::with_seed(config.seed), &config.name);
                (Rc::new(RefCell::new(st)), 0)
            }
        };
        let coords = config.coords.clone();
        let model = Model(Rc::new(ModelInner {
            scope,
            config,
            parent,
            state,
        }));
        for (name, values) in coords {
            model.add_coord(&name, Some(values), None)?;
        }
        log::debug!("created model '{}' (scope {})", model.name(), scope);
        Ok(model)
    }

    /// Create a model and run `init` with it as the active model.
    pub fn build(config: ModelConfig, init: impl FnOnce(&Model) -> Result<()>) -> Result<Model> {
        let model = Model::new(config)?;
        model.within(|| init(&model))?;
        Ok(model)
    }

    /// Make this the active model until the guard is dropped.
    pub fn enter(&self) -> ContextGuard<Model> {
        context::enter(self.clone())
    }

    pub fn within<R>(&self, f: impl FnOnce() -> R) -> R {
        context::with_context(self.clone(), f)
    }

    /// The innermost active model.
    pub fn get_context() -> Result<Model> {
        context::get_context::<Model>(true)?.ok_or(ModelError::NoActiveModel)
    }

    pub(crate) fn from_parts(config: ModelConfig, state: ModelState) -> Model {
        Model(Rc::new(ModelInner {
            scope: 0,
            config,
            parent: None,
            state: Rc::new(RefCell::new(state)),
        }))
    }

    pub fn name(&self) -> &str {
        &self.0.config.name
    }

    pub fn config(&self) -> &ModelConfig {
        &self.0.config
    }

    pub fn parent(&self) -> Option<&Model> {
        self.0.parent.as_ref()
    }

    pub fn is_root(&self) -> bool {
        self.0.parent.is_none()
    }

    pub fn root(&self) -> Model {
        match &self.0.parent {
            Some(p) => p.root(),
            None => self.clone(),
        }
    }

    pub fn prefix(&self) -> String {
        if self.name().is_empty() {
            String::new()
        } else {
            format!("{}_", self.name())
        }
    }

    /// `name` with this model's prefix, unless it already carries it.
    pub fn name_for(&self, name: &str) -> String {
        let prefix = self.prefix();
        if prefix.is_empty() || name.starts_with(&prefix) {
            name.to_string()
        } else {
            format!("{prefix}{name}")
        }
    }

    /// `name` without this model's prefix.
    pub fn name_of<'n>(&self, name: &'n str) -> &'n str {
        let prefix = self.prefix();
        if prefix.is_empty() {
            return name;
        }
        name.strip_prefix(prefix.as_str()).unwrap_or(name)
    }

    pub fn graph(&self) -> Ref<'_, Graph> {
        Ref::map(self.0.state.borrow(), |s| &s.graph)
    }

    pub fn graph_mut(&self) -> RefMut<'_, Graph> {
        RefMut::map(self.0.state.borrow_mut(), |s| &mut s.graph)
    }

    pub(crate) fn state(&self) -> Ref<'_, ModelState> {
        self.0.state.borrow()
    }

    fn state_mut(&self) -> RefMut<'_, ModelState> {
        self.0.state.borrow_mut()
    }

    // ── views ───────────────────────────────────────────────────────

    fn sees(&self, st: &ModelState, scope: usize) -> bool {
        let mut current = Some(scope);
        while let Some(s) = current {
            if s == self.0.scope {
                return true;
            }
            current = st.scopes.get(s).and_then(|sc| sc.parent);
        }
        false
    }

    fn view(&self, pick: impl Fn(&ModelState) -> &Vec<(usize, NodeId)>) -> Vec<NodeId> {
        let st = self.state();
        pick(&*st)
            .iter()
            .filter(|(scope, _)| self.sees(&st, *scope))
            .map(|(_, node)| *node)
            .collect()
    }

    pub fn free_rvs(&self) -> Vec<NodeId> {
        self.view(|s| &s.free_rvs)
    }

    pub fn observed_rvs(&self) -> Vec<NodeId> {
        self.view(|s| &s.observed_rvs)
    }

    pub fn deterministics(&self) -> Vec<NodeId> {
        self.view(|s| &s.deterministics)
    }

    pub fn auto_deterministics(&self) -> Vec<NodeId> {
        self.view(|s| &s.auto_deterministics)
    }

    pub fn potentials(&self) -> Vec<NodeId> {
        self.view(|s| &s.potentials)
    }

    /// Free and observed random variables.
    pub fn basic_rvs(&self) -> Vec<NodeId> {
        let mut out = self.free_rvs();
        out.extend(self.observed_rvs());
        out
    }

    /// Free random variables and deterministics.
    pub fn unobserved_rvs(&self) -> Vec<NodeId> {
        let mut out = self.free_rvs();
        out.extend(self.deterministics());
        out
    }

    pub fn named_vars(&self) -> Vec<(String, NodeId)> {
        let st = self.state();
        st.named_vars
            .iter()
            .filter(|(scope, _, _)| self.sees(&st, *scope))
            .map(|(_, name, node)| (name.clone(), *node))
            .collect()
    }

    /// Look up a variable by full name, or by name relative to this model.
    pub fn get(&self, key: &str) -> Result<NodeId> {
        let vars = self.named_vars();
        let qualified = self.name_for(key);
        vars.iter()
            .find(|(n, _)| n == key)
            .or_else(|| vars.iter().find(|(n, _)| *n == qualified))
            .map(|(_, node)| *node)
            .ok_or_else(|| ModelError::UnknownVariable(key.to_string()))
    }

    pub fn rv_dims(&self) -> HashMap<String, Vec<Option<String>>> {
        self.state().rv_dims.iter().cloned().collect()
    }

    pub fn coords(&self) -> Vec<(String, Option<Vec<CoordLabel>>)> {
        self.state().coords.clone()
    }

    pub fn dim_lengths(&self) -> HashMap<String, NodeId> {
        self.state().dim_lengths.clone()
    }

    pub fn dim_length(&self, name: &str) -> Option<NodeId> {
        self.state().dim_lengths.get(name).copied()
    }

    pub fn rvs_to_values(&self) -> HashMap<NodeId, NodeId> {
        self.state().rvs_to_values.clone()
    }

    pub fn values_to_rvs(&self) -> HashMap<NodeId, NodeId> {
        self.state().values_to_rvs.clone()
    }

    pub fn value_var(&self, rv: NodeId) -> Option<NodeId> {
        self.state().rvs_to_values.get(&rv).copied()
    }

    /// Transform attached to a value variable.
    pub fn transform_of(&self, value: NodeId) -> Option<Transform> {
        self.state().transforms.get(&value).copied()
    }

    /// Data node of an observed random variable.
    pub fn observations(&self, rv: NodeId) -> Option<NodeId> {
        self.state().observations.get(&rv).copied()
    }

    pub fn total_size(&self, rv: NodeId) -> Option<TotalSize> {
        self.state().total_sizes.get(&rv).cloned()
    }

    /// Value variables of the free random variables.
    pub fn value_vars(&self) -> Vec<NodeId> {
        let st = self.state();
        self.free_rvs()
            .into_iter()
            .filter_map(|rv| st.rvs_to_values.get(&rv).copied())
            .collect()
    }

    fn is_discrete_value(&self, value: NodeId) -> Result<bool> {
        let st = self.state();
        match st.values_to_rvs.get(&value) {
            Some(&rv) => Ok(st.kernel_of(rv)?.discrete),
            None => Ok(false),
        }
    }

    pub fn cont_vars(&self) -> Result<Vec<NodeId>> {
        let mut out = Vec::new();
        for v in self.value_vars() {
            if !self.is_discrete_value(v)? {
                out.push(v);
            }
        }
        Ok(out)
    }

    pub fn disc_vars(&self) -> Result<Vec<NodeId>> {
        let mut out = Vec::new();
        for v in self.value_vars() {
            if self.is_discrete_value(v)? {
                out.push(v);
            }
        }
        Ok(out)
    }

    /// Value variables in their original space (named after their random
    /// variable) followed by the value variables themselves, and the
    /// deterministics rewritten in terms of value variables.
    pub fn unobserved_value_vars(&self) -> Result<Vec<NodeId>> {
        let free = self.free_rvs();
        let deterministics = self.deterministics();
        let mut st = self.state_mut();
        let st = &mut *st;
        let mut out = Vec::new();
        for rv in free {
            let value = *st
                .rvs_to_values
                .get(&rv)
                .ok_or_else(|| ModelError::UnknownVariable(st.graph.describe(rv)))?;
            if let Some(t) = st.transforms.get(&value).copied() {
                let original = match st.cache.originals.get(&value) {
                    Some(&n) => n,
                    None => {
                        let name = st.graph.describe(rv);
                        let params = st.graph.random_parts(rv).map(|(_, p, _)| p.to_vec()).unwrap_or_default();
                        let back = t.backward(&mut st.graph, &params, value)?;
                        let back = st.rewritten(&[back])?[0];
                        let n = st.graph.alias(back, name);
                        st.cache.originals.insert(value, n);
                        n
                    }
                };
                out.push(original);
            }
            out.push(value);
        }
        out.extend(st.rewritten(&deterministics)?);
        Ok(out)
    }

    // ── coordinates and data ────────────────────────────────────────

    /// Register a named dimension. Without `length` the dimension gets a
    /// resizable length holding `values.len()`.
    pub fn add_coord(&self, name: &str, values: Option<Vec<CoordLabel>>, length: Option<DimLength>) -> Result<()> {
        if RESERVED_DIMS.contains(&name) {
            return Err(ModelError::ReservedDimension(name.to_string()));
        }
        let mut st = self.state_mut();
        if let Some(existing) = st.coord(name) {
            if *existing != values {
                return Err(ModelError::IncompatibleCoordinate(name.to_string()));
            }
            return Ok(());
        }
        let length = match (length, &values) {
            (Some(DimLength::Node(n)), _) => {
                if st.graph.ndim(n) != 0 {
                    return Err(ModelError::InvalidArgument(format!(
                        "The `length` passed for the '{name}' coord must be a scalar node"
                    )));
                }
                n
            }
            (Some(DimLength::Fixed(n)), _) => st.graph.scalar(n as f64),
            (None, Some(v)) => st.graph.shared(name, arr0(v.len() as f64).into_dyn()),
            (None, None) => {
                return Err(ModelError::InvalidArgument(format!(
                    "Either `values` or `length` must be specified for the '{name}' dimension."
                )))
            }
        };
        st.coords.push((name.to_string(), values));
        st.dim_lengths.insert(name.to_string(), length);
        log::debug!("registered dimension '{name}'");
        Ok(())
    }

    pub fn add_coords(
        &self,
        coords: impl IntoIterator<Item = (String, Option<Vec<CoordLabel>>)>,
        lengths: &HashMap<String, DimLength>,
    ) -> Result<()> {
        for (name, values) in coords {
            let length = lengths.get(&name).copied();
            self.add_coord(&name, values, length)?;
        }
        Ok(())
    }

    /// Concrete shape spanned by the named dimensions.
    pub fn shape_from_dims(&self, dims: &[&str]) -> Result<Vec<usize>> {
        let unique: HashSet<&&str> = dims.iter().collect();
        if unique.len() != dims.len() {
            return Err(ModelError::InvalidArgument(
                "Can not contain the same dimension name twice.".to_string(),
            ));
        }
        let st = self.state();
        dims.iter()
            .map(|&d| match (st.coord(d), st.dim_lengths.get(d)) {
                (Some(Some(labels)), _) => Ok(labels.len()),
                (Some(None), Some(&len)) => {
                    let v = evaluate_scalar(&st.graph, len, &Givens::new())?;
                    Ok(v.round() as usize)
                }
                _ => Err(ModelError::UnknownDimension(vec![d.to_string()])),
            })
            .collect()
    }

    /// Register a mutable data container. Unknown named dims take their
    /// length from the container, so they follow `set_data`.
    pub fn data(&self, name: &str, value: ArrayD<f64>, dims: Option<DimsArg>) -> Result<NodeId> {
        let name = self.name_for(name);
        if self.state().has_name(&name) {
            return Err(ModelError::DuplicateName(name));
        }
        let dims = dims.map(|d| dim_names(&d.0)).transpose()?;
        if let Some(d) = &dims {
            if d.len() != value.ndim() {
                return Err(ModelError::shape(
                    format!("Length of `dims` must match the dimensions of the dataset '{name}'"),
                    d.len(),
                    value.ndim(),
                ));
            }
        }
        let shared = self.graph_mut().shared(&name, value);
        for (axis, dname) in dims.iter().flatten().enumerate() {
            if let Some(dname) = dname {
                if self.dim_length(dname).is_none() {
                    let len = self.graph_mut().shape_of(shared, axis)?;
                    self.add_coord(dname, None, Some(DimLength::Node(len)))?;
                }
            }
        }
        self.add_random_variable(shared, dims.as_deref())?;
        Ok(shared)
    }

    /// Replace the values of a data container, resizing its dimensions and
    /// updating their labels where needed.
    pub fn set_data(
        &self,
        name: &str,
        values: ArrayD<f64>,
        coords: Option<HashMap<String, Vec<CoordLabel>>>,
    ) -> Result<()> {
        let shared = self.get(name)?;
        let coords = coords.unwrap_or_default();
        let mut st = self.state_mut();
        let st = &mut *st;
        let var_name = st.graph.describe(shared);
        if !matches!(st.graph.node(shared).op, Op::Shared(_)) {
            return Err(ModelError::InvalidArgument(format!(
                "The variable `{name}` must be a data container (see `Model::data`) to allow updating"
            )));
        }
        let ndim = st.graph.ndim(shared);
        if values.ndim() != ndim {
            return Err(ModelError::shape(
                format!("New values for '{name}' must have {ndim} dimensions, just like the original."),
                values.ndim(),
                ndim,
            ));
        }

        let dims = st
            .rv_dims
            .iter()
            .find(|(n, _)| *n == var_name)
            .map(|(_, d)| d.clone())
            .unwrap_or_default();
        let mut new_labels = Vec::new();
        let mut new_lengths = Vec::new();
        for (d, dname) in dims.iter().enumerate() {
            let Some(dname) = dname else { continue };
            let length = *st
                .dim_lengths
                .get(dname)
                .ok_or_else(|| ModelError::UnknownDimension(vec![dname.clone()]))?;
            let old_length = evaluate_scalar(&st.graph, length, &Givens::new())?.round() as usize;
            let new_length = values.shape()[d];
            let changed = new_length != old_length;

            let length_is_shared = matches!(st.graph.node(length).op, Op::Shared(_));
            let follows_shared = match st.graph.node(length).op {
                Op::ShapeOf { x, .. } => matches!(st.graph.node(x).op, Op::Shared(_)),
                _ => false,
            };
            if changed && !length_is_shared && !follows_shared {
                return Err(ModelError::shape(
                    format!(
                        "Resizing dimension '{dname}' with values of length {new_length} would lead to \
                         incompatibilities, because the dimension was not initialized from a data container. \
                         Check if the dimension was defined implicitly before '{var_name}' was created, \
                         for example by a model variable."
                    ),
                    new_length,
                    old_length,
                ));
            }
            let has_labels = matches!(st.coord(dname), Some(Some(_)));
            match coords.get(dname) {
                None if has_labels && changed => {
                    return Err(ModelError::InvalidArgument(format!(
                        "The '{name}' variable already had coord values defined for its {dname} dimension. \
                         With the new values this dimension changes to length {new_length}, so new coord \
                         values for the {dname} dimension are required."
                    )));
                }
                None => {}
                Some(labels) => {
                    if labels.len() != new_length {
                        return Err(ModelError::shape(
                            format!(
                                "Length of new coordinate values for dimension '{dname}' does not match the provided values."
                            ),
                            labels.len(),
                            new_length,
                        ));
                    }
                    new_labels.push((dname.clone(), labels.clone()));
                }
            }
            if changed && length_is_shared {
                new_lengths.push((length, new_length));
            }
        }

        for (dname, labels) in new_labels {
            if let Some(entry) = st.coords.iter_mut().find(|(n, _)| *n == dname) {
                entry.1 = Some(labels);
            }
        }
        for (length, n) in new_lengths {
            st.graph.set_shared(length, arr0(n as f64).into_dyn())?;
        }
        st.graph.set_shared(shared, values)?;
        log::debug!("updated data container '{var_name}'");
        Ok(())
    }

    // ── registration ────────────────────────────────────────────────

    pub(crate) fn kernel_of(&self, rv: NodeId) -> Result<Arc<Kernel>> {
        self.state().kernel_of(rv)
    }

    /// Register a random variable as free, or as observed when data is
    /// given. Returns the node that stands for the variable in the model,
    /// which differs from `rv` when missing values were split off.
    pub fn register_rv(&self, rv: NodeId, name: &str, opts: RegisterOptions) -> Result<NodeId> {
        let name = self.name_for(name);
        let RegisterOptions {
            observed,
            total_size,
            dims,
            transform,
        } = opts;
        let dims = dims.map(|d| dim_names(&d)).transpose()?;
        let kernel = self.kernel_of(rv)?;
        if kernel.discrete && matches!(transform, TransformSpec::Explicit(_)) {
            return Err(ModelError::InvalidArgument(format!(
                "Transforms cannot be applied to the discrete variable '{name}'"
            )));
        }
        if self.state().has_name(&name) {
            return Err(ModelError::DuplicateName(name));
        }

        let saved = self.state_mut().checkpoint();
        let registered = self.register_named(rv, &name, observed, total_size, dims, transform, &kernel);
        if registered.is_err() {
            self.state_mut().restore(saved);
        }
        registered
    }

    #[allow(clippy::too_many_arguments)]
    fn register_named(
        &self,
        rv: NodeId,
        name: &str,
        observed: Option<ObservedData>,
        total_size: Option<TotalSize>,
        dims: Option<Vec<Option<String>>>,
        transform: TransformSpec,
        kernel: &Kernel,
    ) -> Result<NodeId> {
        {
            let mut st = self.state_mut();
            st.graph.set_name(rv, name);
            if let Some(ts) = total_size {
                st.total_sizes.insert(rv, ts);
            }
        }
        match observed {
            None => {
                self.register_free(rv, dims.as_deref(), transform, kernel)?;
                Ok(rv)
            }
            Some(data) => self.make_obs_var(rv, data, dims, transform, kernel),
        }
    }

    fn register_free(
        &self,
        rv: NodeId,
        dims: Option<&[Option<String>]>,
        transform: TransformSpec,
        kernel: &Kernel,
    ) -> Result<NodeId> {
        self.add_random_variable(rv, dims)?;
        self.state_mut().free_rvs.push((self.0.scope, rv));
        let value = self.create_value_var(rv, transform, kernel)?;
        log::debug!("registered free variable '{}' ~ {}", self.graph().describe(rv), kernel.name);
        Ok(value)
    }

    fn make_obs_var(
        &self,
        rv: NodeId,
        data: ObservedData,
        dims: Option<Vec<Option<String>>>,
        transform: TransformSpec,
        kernel: &Kernel,
    ) -> Result<NodeId> {
        let (name, data_ndim, rv_ndim) = {
            let g = self.graph();
            if let ObservedData::Node(n) = &data {
                if !g.is_independent(*n) {
                    return Err(ModelError::DependentObservation(g.describe(*n)));
                }
            }
            (g.describe(rv), data.ndim(&g), g.ndim(rv))
        };
        if data_ndim != rv_ndim {
            return Err(ModelError::shape(
                "Dimensionality of data and RV don't match.",
                data_ndim,
                rv_ndim,
            ));
        }

        let data_node = match data {
            ObservedData::Masked { data, mask } if mask.iter().any(|&m| m) => {
                if mask.iter().all(|&m| m) {
                    // Nothing observed: the variable is simply free.
                    self.register_free(rv, dims.as_deref(), transform, kernel)?;
                    return Ok(rv);
                }
                return crate::missing::split_missing(self, rv, &name, data, mask, dims, transform);
            }
            ObservedData::Dense(a) | ObservedData::Masked { data: a, .. } => self.graph_mut().constant(a),
            ObservedData::Sparse { shape, entries } => {
                let dense = ObservedData::densify(&shape, &entries)?;
                self.graph_mut().constant(dense)
            }
            ObservedData::Node(n) => n,
        };
        self.attach_observations(rv, data_node, dims.as_deref())?;
        log::debug!("registered observed variable '{name}' ~ {}", kernel.name);
        Ok(rv)
    }

    /// Register `rv` as observed against `data`.
    pub(crate) fn attach_observations(
        &self,
        rv: NodeId,
        data: NodeId,
        dims: Option<&[Option<String>]>,
    ) -> Result<()> {
        self.add_random_variable(rv, dims)?;
        let mut st = self.state_mut();
        st.observations.insert(rv, data);
        st.observed_rvs.push((self.0.scope, rv));
        st.cache = QueryCache::default();
        Ok(())
    }

    /// Create the placeholder standing for `rv` in log-density graphs.
    fn create_value_var(&self, rv: NodeId, spec: TransformSpec, kernel: &Kernel) -> Result<NodeId> {
        let transform = match spec {
            TransformSpec::Default => kernel.default_transform,
            TransformSpec::Disabled => None,
            TransformSpec::Explicit(t) => Some(t),
        };
        let mut st = self.state_mut();
        let rv_name = st.graph.describe(rv);
        let value_name = match transform {
            Some(t) => format!("{rv_name}_{}__", t.name()),
            None => rv_name,
        };
        if transform.is_some() && st.has_name(&value_name) {
            return Err(ModelError::DuplicateName(value_name));
        }
        let ndim = st.graph.ndim(rv);
        let value = st.graph.input(&value_name, ndim);
        match transform {
            Some(t) => {
                // The forward-transformed test value is computed on demand
                // by `initial_point`.
                st.transforms.insert(value, t);
                st.named_vars.push((self.0.scope, value_name, value));
            }
            None => {
                let test_value = st.graph.test_value(rv).cloned();
                st.graph.set_test_value(value, test_value);
            }
        }
        st.rvs_to_values.insert(rv, value);
        st.values_to_rvs.insert(value, rv);
        st.cache = QueryCache::default();
        Ok(value)
    }

    /// Add a named node to the registry, recording its dims.
    pub(crate) fn add_random_variable(&self, var: NodeId, dims: Option<&[Option<String>]>) -> Result<()> {
        let mut st = self.state_mut();
        let name = st
            .graph
            .name(var)
            .map(str::to_string)
            .ok_or_else(|| ModelError::InvalidArgument("Variables added to a model must be named".to_string()))?;
        if st.has_name(&name) {
            return Err(ModelError::DuplicateName(name));
        }
        if let Some(dims) = dims {
            let unknown: Vec<String> = dims
                .iter()
                .flatten()
                .filter(|d| st.coord(d).is_none())
                .cloned()
                .collect();
            if !unknown.is_empty() {
                return Err(ModelError::UnknownDimension(unknown));
            }
            st.rv_dims.push((name.clone(), dims.to_vec()));
        }
        st.named_vars.push((self.0.scope, name, var));
        st.cache = QueryCache::default();
        Ok(())
    }

    /// Register `var` as a named deterministic quantity.
    pub fn deterministic(&self, name: &str, var: NodeId, dims: Option<DimsArg>) -> Result<NodeId> {
        let dims = dims.map(|d| dim_names(&d.0)).transpose()?;
        self.add_deterministic(name, var, dims.as_deref(), false)
    }

    pub(crate) fn add_deterministic(
        &self,
        name: &str,
        var: NodeId,
        dims: Option<&[Option<String>]>,
        auto: bool,
    ) -> Result<NodeId> {
        let name = self.name_for(name);
        if self.state().has_name(&name) {
            return Err(ModelError::DuplicateName(name));
        }
        let alias = self.graph_mut().alias(var, &name);
        self.add_random_variable(alias, dims)?;
        let mut st = self.state_mut();
        let list = if auto {
            &mut st.auto_deterministics
        } else {
            &mut st.deterministics
        };
        list.push((self.0.scope, alias));
        Ok(alias)
    }

    /// Add an arbitrary factor to the joint log-density.
    pub fn potential(&self, name: &str, var: NodeId) -> Result<NodeId> {
        let name = self.name_for(name);
        if self.state().has_name(&name) {
            return Err(ModelError::DuplicateName(name));
        }
        let alias = self.graph_mut().alias(var, &name);
        self.add_random_variable(alias, None)?;
        self.state_mut().potentials.push((self.0.scope, alias));
        Ok(alias)
    }

    // ── log-densities ───────────────────────────────────────────────

    fn rv_logp(&self, rv: NodeId, jacobian: bool) -> Result<NodeId> {
        let check_bounds = self.0.config.check_bounds;
        let key = (rv, jacobian, check_bounds);
        let mut st = self.state_mut();
        if let Some(&term) = st.cache.terms.get(&key) {
            return Ok(term);
        }
        let st = &mut *st;
        let bindings = st.bindings();
        let total_size = st.total_sizes.get(&rv).cloned();
        let opts = LogpOptions { jacobian, check_bounds };
        let term = logpt_sum(&mut st.graph, rv, &bindings, total_size.as_ref(), opts)?;
        st.cache.terms.insert(key, term);
        Ok(term)
    }

    fn free_terms(&self, jacobian: bool) -> Result<Vec<NodeId>> {
        self.free_rvs().into_iter().map(|rv| self.rv_logp(rv, jacobian)).collect()
    }

    fn observed_terms(&self) -> Result<Vec<NodeId>> {
        self.observed_rvs().into_iter().map(|rv| self.rv_logp(rv, true)).collect()
    }

    fn potential_terms(&self) -> Result<Vec<NodeId>> {
        let potentials = self.potentials();
        self.state_mut().rewritten(&potentials)
    }

    /// The sum of `terms`, built once per scope and `kind` until the next
    /// registration. With `named`, the node is named after `kind` and the
    /// model.
    fn total(
        &self,
        kind: &'static str,
        named: bool,
        terms: impl FnOnce(&Self) -> Result<Vec<NodeId>>,
    ) -> Result<NodeId> {
        let key = (self.0.scope, kind);
        if let Some(&total) = self.state().cache.totals.get(&key) {
            return Ok(total);
        }
        let terms = terms(self)?;
        let mut g = self.graph_mut();
        let total = g.sum_all(&terms);
        if named {
            let name = if self.name().is_empty() {
                kind.to_string()
            } else {
                format!("{kind}_{}", self.name())
            };
            g.set_name(total, name);
        }
        drop(g);
        self.state_mut().cache.totals.insert(key, total);
        Ok(total)
    }

    /// Joint log-density of the model, Jacobian terms included.
    pub fn logpt(&self) -> Result<NodeId> {
        self.total("__logp", true, |m| {
            let mut terms = m.free_terms(true)?;
            terms.extend(m.observed_terms()?);
            terms.extend(m.potential_terms()?);
            Ok(terms)
        })
    }

    /// Joint log-density without the Jacobian terms of transformed variables.
    pub fn logp_nojact(&self) -> Result<NodeId> {
        self.total("__logp_nojac", true, |m| {
            let mut terms = m.free_terms(false)?;
            terms.extend(m.observed_terms()?);
            terms.extend(m.potential_terms()?);
            Ok(terms)
        })
    }

    /// Log-density of the free random variables only.
    pub fn varlogpt(&self) -> Result<NodeId> {
        self.total("varlogp", false, |m| m.free_terms(true))
    }

    /// Log-density of the observed random variables and the potentials.
    pub fn datalogpt(&self) -> Result<NodeId> {
        self.total("datalogp", false, |m| {
            let mut terms = m.observed_terms()?;
            terms.extend(m.potential_terms()?);
            Ok(terms)
        })
    }

    /// Log-CDF of a random variable at `value`.
    pub fn logcdf(&self, rv: NodeId, value: NodeId) -> Result<NodeId> {
        let mut st = self.state_mut();
        let bindings = st.bindings();
        crate::logprob::logcdf(&mut st.graph, rv, value, &bindings)
    }

    // ── points and evaluation ───────────────────────────────────────

    fn initial_value(&self, rv: NodeId, value: NodeId) -> Result<ArrayD<f64>> {
        let mut st = self.state_mut();
        let st = &mut *st;
        let transform = st.transforms.get(&value).copied();
        let g = &mut st.graph;
        let givens: Givens = g.test_value(rv).map(|tv| [(rv, tv.clone())].into_iter().collect()).unwrap_or_default();
        let mut outputs = vec![rv];
        if let Some(t) = transform {
            let params = g.random_parts(rv).map(|(_, p, _)| p.to_vec()).unwrap_or_default();
            outputs.push(t.forward(g, &params, rv)?);
        }
        // The transformed value, when present, is the last output.
        let values = evaluate(g, &outputs, &givens).map_err(|e| match e {
            ModelError::MissingInput(_) | ModelError::NotSampleable(_) => ModelError::MissingInput(g.describe(rv)),
            e => e,
        })?;
        last_output(values)
    }

    /// Starting values of every value variable: the explicit test value,
    /// otherwise a draw from the prior mapped through the transform.
    /// Computed values are cached on the value variables.
    pub fn initial_point(&self) -> Result<Point> {
        let mut point = Point::new();
        for rv in self.free_rvs() {
            let value = self
                .value_var(rv)
                .ok_or_else(|| ModelError::UnknownVariable(self.graph().describe(rv)))?;
            let (name, cached) = {
                let g = self.graph();
                (g.describe(value), g.test_value(value).cloned())
            };
            let v = match cached {
                Some(v) => v,
                None => {
                    let v = self.initial_value(rv, value)?;
                    self.graph_mut().set_test_value(value, Some(v.clone()));
                    v
                }
            };
            point.insert(name, v);
        }
        Ok(point)
    }

    /// Givens for the value variables named in `point`. With `strict`,
    /// unknown names are an error; otherwise they are skipped.
    fn givens_for(&self, point: &Point, strict: bool) -> Result<Givens> {
        let st = self.state();
        let by_name: HashMap<String, NodeId> = st
            .rvs_to_values
            .values()
            .map(|&v| (st.graph.describe(v), v))
            .collect();
        let mut givens = Givens::new();
        for (key, value) in point {
            match by_name.get(key) {
                Some(&node) => {
                    givens.insert(node, value.clone());
                }
                None if strict => return Err(ModelError::UnknownVariable(key.clone())),
                None => {}
            }
        }
        Ok(givens)
    }

    /// Function of a point computing `outs`, with random variables replaced
    /// by their value variables. Keys that are not value variables are
    /// ignored.
    pub fn fn_(&self, outs: &[NodeId]) -> Result<PointFunc> {
        self.point_func(outs, false)
    }

    /// Like [`Model::fn_`], but every key of the point must name a value
    /// variable.
    pub fn fastfn(&self, outs: &[NodeId]) -> Result<PointFunc> {
        self.point_func(outs, true)
    }

    fn point_func(&self, outs: &[NodeId], strict: bool) -> Result<PointFunc> {
        let outputs = self.state_mut().rewritten(outs)?;
        Ok(PointFunc {
            model: self.clone(),
            outputs,
            strict,
        })
    }

    /// Evaluate `node`. With a point, random variables take the point's
    /// values; without one, they are drawn forward from the graph's
    /// generator.
    pub fn eval(&self, node: NodeId, point: Option<&Point>) -> Result<ArrayD<f64>> {
        match point {
            Some(p) => last_output(self.fn_(&[node])?.call(p)?),
            None => last_output(evaluate(&mut self.graph_mut(), &[node], &Givens::new())?),
        }
    }

    /// Lay the given variables (default: all value variables) end to end in
    /// one flat input vector.
    pub fn flatten(&self, vars: Option<&[NodeId]>, order: Option<&[&str]>) -> Result<FlatView> {
        let vars = match vars {
            Some(v) => v.to_vec(),
            None => self.value_vars(),
        };
        let vars = match order {
            Some(order) => {
                let g = self.graph();
                order
                    .iter()
                    .map(|name| {
                        vars.iter()
                            .copied()
                            .find(|&v| g.name(v) == Some(*name))
                            .ok_or_else(|| ModelError::UnknownVariable(name.to_string()))
                    })
                    .collect::<Result<Vec<_>>>()?
            }
            None => vars,
        };
        self.initial_point()?;

        let mut g = self.graph_mut();
        let mut layout = Vec::with_capacity(vars.len());
        let mut flat = Vec::new();
        for &v in &vars {
            let tv = g
                .test_value(v)
                .cloned()
                .ok_or_else(|| ModelError::MissingInput(g.describe(v)))?;
            layout.push(FlatEntry {
                name: g.describe(v),
                node: v,
                start: flat.len(),
                shape: tv.shape().to_vec(),
            });
            flat.extend(tv.iter().copied());
        }
        let input = g.input("flat_view", 1);
        g.set_test_value(input, Some(Array1::from(flat).into_dyn()));
        let replacements = layout
            .iter()
            .map(|e| (e.node, g.flat_slice(input, e.start, e.shape.clone())))
            .collect();
        Ok(FlatView {
            input,
            layout,
            replacements,
        })
    }

    /// Summed log-density of every basic random variable at `point`
    /// (default: the initial point), rounded to `round_vals` decimals.
    pub fn point_logps(&self, point: Option<&Point>) -> Result<Vec<(String, f64)>> {
        let mut full = self.initial_point()?;
        if let Some(p) = point {
            full.extend(p.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        let givens = self.givens_for(&full, false)?;
        let terms = self
            .basic_rvs()
            .into_iter()
            .map(|rv| {
                let name = self.graph().describe(rv);
                let term = self.rv_logp(rv, true)?;
                Ok((name, term))
            })
            .collect::<Result<Vec<_>>>()?;

        let g = self.graph();
        let graph: &Graph = &g;
        let scale = 10f64.powi(self.0.config.round_vals);
        terms
            .par_iter()
            .map(|(name, term)| {
                let v = evaluate_scalar(graph, *term, &givens)?;
                Ok((name.clone(), (v * scale).round() / scale))
            })
            .collect()
    }

    /// Check that every start point only names model variables and gives a
    /// finite log-density for every random variable.
    pub fn check_start_vals(&self, start: &[Point]) -> Result<()> {
        let valid: Vec<String> = self.named_vars().into_iter().map(|(n, _)| n).collect();
        for elem in start {
            let extra: Vec<&str> = elem
                .keys()
                .filter(|k| !valid.contains(k))
                .map(String::as_str)
                .collect();
            if !extra.is_empty() {
                return Err(ModelError::InvalidArgument(format!(
                    "Some start parameters do not appear in the model!\nValid keys are: {}, but {} was supplied",
                    valid.join(", "),
                    extra.join(", ")
                )));
            }
            let logps = self.point_logps(Some(elem))?;
            if logps.iter().any(|(_, v)| !v.is_finite()) {
                let point = elem
                    .iter()
                    .map(|(k, v)| format!("{k}: {v}"))
                    .collect::<Vec<_>>()
                    .join("\n");
                let logps = logps
                    .iter()
                    .map(|(k, v)| format!("{k}    {v}"))
                    .collect::<Vec<_>>()
                    .join("\n");
                return Err(ModelError::InitialEvaluation { point, logps });
            }
        }
        Ok(())
    }

    /// Log-density and gradient with respect to `grad_vars` (default: the
    /// continuous value variables). Random variables may be passed in place
    /// of their value variables. With `tempered` the cost is
    /// `free + weight * observed`.
    pub fn logp_dlogp_function(&self, grad_vars: Option<&[NodeId]>, tempered: bool) -> Result<ValueGradFunction> {
        let grad_vars = match grad_vars {
            None => self.cont_vars()?,
            Some(vars) => vars
                .iter()
                .map(|&v| {
                    let v = self.value_var(v).unwrap_or(v);
                    if self.is_discrete_value(v)? {
                        return Err(ModelError::InvalidArgument(format!(
                            "Can only compute the gradient of continuous types: {}",
                            self.graph().describe(v)
                        )));
                    }
                    Ok(v)
                })
                .collect::<Result<Vec<_>>>()?,
        };

        let costs = if tempered {
            let free = self.total("tempered_free", false, |m| {
                let mut terms = m.free_terms(true)?;
                terms.extend(m.potential_terms()?);
                Ok(terms)
            })?;
            vec![free, self.total("tempered_observed", false, |m| m.observed_terms())?]
        } else {
            vec![self.logpt()?]
        };

        let init = self.initial_point()?;
        let graph = self.graph().clone();
        let ancestors = graph.ancestors(&costs);
        let extra: Vec<NodeId> = self
            .value_vars()
            .into_iter()
            .filter(|v| !grad_vars.contains(v) && ancestors.binary_search(v).is_ok())
            .collect();
        ValueGradFunction::new(graph, &costs, &grad_vars, &extra, &init)
    }
}

impl fmt::Display for Model {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.0.state.try_borrow().map_err(|_| fmt::Error)?;
        let mut rows = Vec::new();
        let vars = self
            .free_rvs()
            .into_iter()
            .chain(self.deterministics())
            .chain(self.observed_rvs());
        for node in vars {
            let dist = match st.graph.random_parts(node) {
                Some((kernel, _, _)) => kernel.to_string(),
                None => "Deterministic".to_string(),
            };
            rows.push((st.graph.describe(node), dist));
        }
        let width = rows.iter().map(|(n, _)| n.len()).max().unwrap_or(0);
        let lines: Vec<String> = rows
            .iter()
            .map(|(name, dist)| format!("{name:>width$} ~ {dist}"))
            .collect();
        write!(f, "{}", lines.join("\n"))
    }
}

/// A compiled-on-demand function of a point.
pub struct PointFunc {
    model: Model,
    outputs: Vec<NodeId>,
    strict: bool,
}

impl PointFunc {
    pub fn outputs(&self) -> &[NodeId] {
        &self.outputs
    }

    pub fn call(&self, point: &Point) -> Result<Vec<ArrayD<f64>>> {
        let givens = self.model.givens_for(point, self.strict)?;
        let g = self.model.graph();
        let mut ev = Evaluator::new(&g, &givens);
        self.outputs.iter().map(|&o| ev.value(o).cloned()).collect()
    }
}

#[derive(Debug, Clone)]
pub struct FlatEntry {
    pub name: String,
    pub node: NodeId,
    pub start: usize,
    pub shape: Vec<usize>,
}

/// Several variables viewed as consecutive slices of one flat input.
#[derive(Debug, Clone)]
pub struct FlatView {
    pub input: NodeId,
    pub layout: Vec<FlatEntry>,
    pub replacements: HashMap<NodeId, NodeId>,
}

impl FlatView {
    pub fn size(&self) -> usize {
        self.layout
            .iter()
            .map(|e| e.shape.iter().product::<usize>())
            .sum()
    }

    /// Rewrite `outputs` to read from the flat input.
    pub fn apply(&self, model: &Model, outputs: &[NodeId]) -> Result<Vec<NodeId>> {
        model.graph_mut().replace(outputs, &self.replacements)
    }
}

/// Scalar cost and its gradient as functions of a flat parameter vector.
///
/// Owns a snapshot of the model graph, so it can be sent to other threads.
#[derive(Debug, Clone)]
pub struct ValueGradFunction {
    graph: Graph,
    cost: NodeId,
    weights: Vec<NodeId>,
    grad_vars: Vec<FlatEntry>,
    extra_vars: Vec<(String, NodeId)>,
    extra_values: Givens,
}

impl ValueGradFunction {
    pub fn new(
        mut graph: Graph,
        costs: &[NodeId],
        grad_vars: &[NodeId],
        extra_vars: &[NodeId],
        init: &Point,
    ) -> Result<Self> {
        let names = grad_vars
            .iter()
            .chain(extra_vars)
            .map(|&v| {
                graph
                    .name(v)
                    .map(str::to_string)
                    .ok_or_else(|| ModelError::InvalidArgument("Arguments must be named.".to_string()))
            })
            .collect::<Result<Vec<_>>>()?;
        let unique: HashSet<&String> = names.iter().collect();
        if unique.len() != names.len() {
            return Err(ModelError::InvalidArgument("Names of the arguments are not unique.".to_string()));
        }

        let (&first_cost, rest) = costs
            .split_first()
            .ok_or_else(|| ModelError::InvalidArgument("At least one cost is required.".to_string()))?;
        let mut cost = first_cost;
        let mut weights = Vec::with_capacity(rest.len());
        for (i, &c) in rest.iter().enumerate() {
            if graph.ndim(cost) > 0 || graph.ndim(c) > 0 {
                return Err(ModelError::InvalidArgument("All costs must be scalar.".to_string()));
            }
            let w = graph.shared(&format!("__weights_{i}"), arr0(1.0).into_dyn());
            let weighted = graph.mul(w, c);
            cost = graph.add(cost, weighted);
            weights.push(w);
        }

        let lookup = |name: &str, node: NodeId, graph: &Graph| -> Result<ArrayD<f64>> {
            init.get(name)
                .or_else(|| graph.test_value(node))
                .cloned()
                .ok_or_else(|| ModelError::MissingInput(name.to_string()))
        };
        let mut layout = Vec::with_capacity(grad_vars.len());
        let mut start = 0;
        for (&node, name) in grad_vars.iter().zip(&names) {
            let shape = lookup(name, node, &graph)?.shape().to_vec();
            let len: usize = shape.iter().product();
            layout.push(FlatEntry {
                name: name.clone(),
                node,
                start,
                shape,
            });
            start += len;
        }
        let mut extra = Vec::with_capacity(extra_vars.len());
        let mut extra_values = Givens::new();
        for (&node, name) in extra_vars.iter().zip(&names[grad_vars.len()..]) {
            extra_values.insert(node, lookup(name, node, &graph)?);
            extra.push((name.clone(), node));
        }

        Ok(Self {
            graph,
            cost,
            weights,
            grad_vars: layout,
            extra_vars: extra,
            extra_values,
        })
    }

    /// Length of the flat parameter vector.
    pub fn size(&self) -> usize {
        self.grad_vars
            .iter()
            .map(|e| e.shape.iter().product::<usize>())
            .sum()
    }

    pub fn grad_var_names(&self) -> Vec<&str> {
        self.grad_vars.iter().map(|e| e.name.as_str()).collect()
    }

    pub fn set_weights(&mut self, values: &[f64]) -> Result<()> {
        if values.len() != self.weights.len() {
            return Err(ModelError::InvalidArgument(
                "Invalid shape. Must be (n_costs - 1,).".to_string(),
            ));
        }
        for (&w, &v) in self.weights.iter().zip(values) {
            self.graph.set_shared(w, arr0(v).into_dyn())?;
        }
        Ok(())
    }

    pub fn set_extra_values(&mut self, point: &Point) -> Result<()> {
        for (name, node) in &self.extra_vars {
            let v = point
                .get(name)
                .ok_or_else(|| ModelError::UnknownVariable(name.clone()))?;
            self.extra_values.insert(*node, v.clone());
        }
        Ok(())
    }

    pub fn get_extra_values(&self) -> Point {
        self.extra_vars
            .iter()
            .filter_map(|(name, node)| self.extra_values.get(node).map(|v| (name.clone(), v.clone())))
            .collect()
    }

    /// Flatten the gradient variables of `point` in layout order.
    pub fn ravel(&self, point: &Point) -> Result<Vec<f64>> {
        let mut out = Vec::with_capacity(self.size());
        for e in &self.grad_vars {
            let v = point
                .get(&e.name)
                .ok_or_else(|| ModelError::UnknownVariable(e.name.clone()))?;
            out.extend(v.iter().copied());
        }
        Ok(out)
    }

    pub fn unravel(&self, x: &[f64]) -> Result<Point> {
        if x.len() != self.size() {
            return Err(ModelError::shape("flat vector has the wrong length", x.len(), self.size()));
        }
        self.grad_vars
            .iter()
            .map(|e| {
                let n: usize = e.shape.iter().product();
                let v = ArrayD::from_shape_vec(IxDyn(&e.shape), x[e.start..e.start + n].to_vec())
                    .map_err(|err| ModelError::Evaluation(err.to_string()))?;
                Ok((e.name.clone(), v))
            })
            .collect()
    }

    fn givens(&self, x: &[f64]) -> Result<Givens> {
        let point = self.unravel(x)?;
        let mut givens = self.extra_values.clone();
        for e in &self.grad_vars {
            if let Some(v) = point.get(&e.name) {
                givens.insert(e.node, v.clone());
            }
        }
        Ok(givens)
    }

    /// The cost alone.
    pub fn value(&self, x: &[f64]) -> Result<f64> {
        evaluate_scalar(&self.graph, self.cost, &self.givens(x)?)
    }

    /// The cost and its flat gradient.
    pub fn call(&self, x: &[f64]) -> Result<(f64, Vec<f64>)> {
        let givens = self.givens(x)?;
        let nodes: Vec<NodeId> = self.grad_vars.iter().map(|e| e.node).collect();
        let (cost, grads) = grad(&self.graph, self.cost, &nodes, &givens)?;
        Ok((cost, grads.iter().flat_map(|g| g.iter().copied()).collect()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autodiff::infer_shape;
    use crate::distributions::{Gamma, HalfNormal, Normal, Poisson, Uniform};
    use crate::distribution::VarOptions;
    use crate::error::ModelWarning;
    use ndarray::{array, Array};

    fn shape(model: &Model, node: NodeId) -> Vec<usize> {
        infer_shape(&model.graph(), node, &Givens::new()).unwrap()
    }

    #[test]
    fn test_var_requires_active_model() {
        let err = Normal::var("x", 0.0, 1.0, VarOptions::default());
        assert!(matches!(err, Err(ModelError::NoActiveModel)));
    }

    #[test]
    fn test_dims_give_the_same_shape_as_shape_and_size() {
        let config = ModelConfig::default()
            .with_coord("a", ["a0", "a1", "a2", "a3", "a4"])
            .with_coord("b", ["b0", "b1", "b2", "b3"]);
        let model = Model::build(config, |_| {
            Normal::var("by_shape", 0.0, 1.0, VarOptions::default().shape([5usize, 4]))?;
            Normal::var("by_size", 0.0, 1.0, VarOptions::default().size([5usize, 4]))?;
            Normal::var("by_dims", 0.0, 1.0, VarOptions::default().dims(["a", "b"]))?;
            Ok(())
        })
        .unwrap();
        for name in ["by_shape", "by_size", "by_dims"] {
            let rv = model.get(name).unwrap();
            assert_eq!(shape(&model, rv), vec![5, 4], "{}", name);
            let drawn = model.eval(rv, None).unwrap();
            assert_eq!(drawn.shape(), &[5, 4], "{}", name);
        }
        assert_eq!(
            model.rv_dims()["by_dims"],
            vec![Some("a".to_string()), Some("b".to_string())]
        );
        assert_eq!(model.shape_from_dims(&["a", "b"]).unwrap(), vec![5, 4]);
    }

    #[test]
    fn test_implied_dims_are_registered() {
        let model = Model::new(ModelConfig::default()).unwrap();
        let _guard = model.enter();
        let mu: ArrayD<f64> = Array::zeros(IxDyn(&[3]));
        Normal::var("x", mu, 1.0, VarOptions::default().dims("city")).unwrap();
        assert!(model.dim_length("city").is_some());
        assert_eq!(model.shape_from_dims(&["city"]).unwrap(), vec![3]);

        let err = Normal::var("y", 0.0, 1.0, VarOptions::default().dims(["nowhere", "city"]));
        assert!(matches!(err, Err(ModelError::UnknownDimension(d)) if d == vec!["nowhere".to_string()]));
    }

    #[test]
    fn test_coordinate_registry() {
        let model = Model::new(ModelConfig::default()).unwrap();
        let labels: Vec<CoordLabel> = vec!["x".into(), "y".into()];
        model.add_coord("letters", Some(labels.clone()), None).unwrap();
        // identical values are accepted again
        model.add_coord("letters", Some(labels), None).unwrap();
        let err = model.add_coord("letters", Some(vec!["z".into()]), None);
        assert!(matches!(err, Err(ModelError::IncompatibleCoordinate(_))));

        for reserved in RESERVED_DIMS {
            assert!(matches!(
                model.add_coord(reserved, Some(vec![CoordLabel::Int(1)]), None),
                Err(ModelError::ReservedDimension(_))
            ));
        }
        assert!(model.add_coord("empty", None, None).is_err());
        model.add_coord("fixed", None, Some(DimLength::Fixed(7))).unwrap();
        assert_eq!(model.shape_from_dims(&["letters", "fixed"]).unwrap(), vec![2, 7]);
        assert!(model.shape_from_dims(&["letters", "letters"]).is_err());
        assert!(matches!(model.shape_from_dims(&["nope"]), Err(ModelError::UnknownDimension(_))));
    }

    #[test]
    fn test_set_data_resizes_dependent_variables() {
        let config = ModelConfig::default().with_coord("second", ["s0", "s1", "s2", "s3"]);
        let model = Model::new(config).unwrap();
        let _guard = model.enter();
        let data: ArrayD<f64> = Array::zeros(IxDyn(&[1, 4]));
        model.data("obs", data, Some(["first", "second"].into())).unwrap();
        let rv = Normal::var("x", 0.0, 1.0, VarOptions::default().dims(["first", "second"])).unwrap();
        assert_eq!(shape(&model, rv), vec![1, 4]);

        // a changed labelled dimension needs new labels
        let bigger: ArrayD<f64> = Array::ones(IxDyn(&[3, 2]));
        assert!(model.set_data("obs", bigger.clone(), None).is_err());

        let labels: HashMap<String, Vec<CoordLabel>> =
            [("second".to_string(), vec!["t0".into(), "t1".into()])].into_iter().collect();
        model.set_data("obs", bigger, Some(labels)).unwrap();
        assert_eq!(shape(&model, rv), vec![3, 2]);
        assert_eq!(model.eval(rv, None).unwrap().shape(), &[3, 2]);
        assert_eq!(model.shape_from_dims(&["first", "second"]).unwrap(), vec![3, 2]);

        let wrong_ndim: ArrayD<f64> = Array::ones(IxDyn(&[3]));
        assert!(matches!(model.set_data("obs", wrong_ndim, None), Err(ModelError::Shape { .. })));
    }

    #[test]
    fn test_dims_defined_by_a_variable_cannot_be_resized() {
        let model = Model::new(ModelConfig::default()).unwrap();
        let _guard = model.enter();
        let mu: ArrayD<f64> = Array::zeros(IxDyn(&[3]));
        Normal::var("x", mu, 1.0, VarOptions::default().dims("row")).unwrap();
        model.data("d", Array::zeros(IxDyn(&[3])), Some("row".into())).unwrap();
        let err = model.set_data("d", Array::zeros(IxDyn(&[5])), None);
        assert!(matches!(err, Err(ModelError::Shape { message, .. }) if message.contains("Resizing dimension 'row'")));
    }

    #[test]
    fn test_child_model_prefixes_and_shares() {
        let outer = Model::new(ModelConfig::default()).unwrap();
        let _o = outer.enter();
        Normal::var("a", 0.0, 1.0, VarOptions::default()).unwrap();
        let inner = Model::new(ModelConfig::named("inner")).unwrap();
        {
            let _i = inner.enter();
            Normal::var("x", 0.0, 1.0, VarOptions::default()).unwrap();
        }
        assert!(!inner.is_root());
        let x = outer.get("inner_x").unwrap();
        assert_eq!(inner.get("x").unwrap(), x);
        assert_eq!(outer.free_rvs().len(), 2);
        assert_eq!(inner.free_rvs(), vec![x]);
        assert!(inner.get("a").is_err());

        // names are unique across the whole tree
        let _i = inner.enter();
        let err = Normal::var("x", 0.0, 1.0, VarOptions::default());
        assert!(matches!(err, Err(ModelError::DuplicateName(n)) if n == "inner_x"));
    }

    #[test]
    fn test_transformed_value_variables() {
        let model = Model::build(ModelConfig::default(), |_| {
            HalfNormal::var("s", 1.0, VarOptions::default())?;
            Uniform::var("u", -1.0, 2.0, VarOptions::default())?;
            Gamma::var("g", 2.0, 1.0, VarOptions::default().transform(TransformSpec::Disabled))?;
            Ok(())
        })
        .unwrap();
        let names: Vec<String> = model
            .value_vars()
            .iter()
            .map(|&v| model.graph().describe(v))
            .collect();
        assert_eq!(names, vec!["s_log__", "u_interval__", "g"]);
        assert!(model.get("s_log__").is_ok());
        let s = model.get("s").unwrap();
        assert_eq!(model.transform_of(model.value_var(s).unwrap()), Some(Transform::Log));

        let point = model.initial_point().unwrap();
        assert_eq!(point.len(), 3);
        let u = point["u_interval__"].sum();
        assert!(u.is_finite());
    }

    #[test]
    fn test_failed_registration_leaves_model_unchanged() {
        let model = Model::new(ModelConfig::default()).unwrap();
        let _guard = model.enter();
        let c = model.graph_mut().scalar(1.0);
        model.deterministic("s_log__", c, None).unwrap();

        let err = HalfNormal::var("s", 1.0, VarOptions::default());
        assert!(matches!(err, Err(ModelError::DuplicateName(n)) if n == "s_log__"));
        assert!(model.free_rvs().is_empty());
        let names: Vec<String> = model.named_vars().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["s_log__"]);
        assert_eq!(model.unobserved_value_vars().unwrap().len(), 1);
        model.logpt().unwrap();

        // the name can be used again
        let s = HalfNormal::var("s", 1.0, VarOptions::default().transform(TransformSpec::Disabled)).unwrap();
        assert_eq!(model.free_rvs(), vec![s]);
        assert!(model.initial_point().unwrap().contains_key("s"));
    }

    #[test]
    fn test_initial_value_needs_every_input() {
        let model = Model::new(ModelConfig::default()).unwrap();
        let _guard = model.enter();
        let mu = model.graph_mut().input("mu_in", 0);
        Normal::var("x", mu, 1.0, VarOptions::default()).unwrap();
        let err = model.initial_point().unwrap_err();
        assert!(matches!(&err, ModelError::MissingInput(n) if n == "x"));
        assert_eq!(err.to_string(), "Couldn't generate an initial value for x");
    }

    #[test]
    fn test_repeated_queries_do_not_grow_the_graph() {
        let model = Model::build(ModelConfig::default(), |_| {
            HalfNormal::var("s", 1.0, VarOptions::default())?;
            Normal::var("y", 0.0, 1.0, VarOptions::default().observed(array![0.5].into_dyn()))?;
            Ok(())
        })
        .unwrap();
        let s = model.get("s").unwrap();
        let point = model.initial_point().unwrap();
        let query = || {
            let logp = model.logpt().unwrap();
            model.logp_nojact().unwrap();
            model.eval(s, Some(&point)).unwrap();
            model.point_logps(None).unwrap();
            model.check_start_vals(&[point.clone()]).unwrap();
            model.unobserved_value_vars().unwrap();
            logp
        };
        let logp = query();
        let nodes = model.graph().nodes.len();
        for _ in 0..20 {
            assert_eq!(query(), logp);
        }
        assert_eq!(model.graph().nodes.len(), nodes);

        // registering a potential rebuilds the joint log-density
        let before = model.eval(logp, Some(&point)).unwrap().sum();
        let penalty = model.graph_mut().scalar(-1.0);
        model.potential("pen", penalty).unwrap();
        let updated = model.logpt().unwrap();
        assert_ne!(updated, logp);
        let after = model.eval(updated, Some(&point)).unwrap().sum();
        assert!((after - (before - 1.0)).abs() < 1e-12);
    }

    #[test]
    fn test_transforms_on_discrete_variables_are_rejected() {
        let model = Model::new(ModelConfig::default()).unwrap();
        let _guard = model.enter();
        let err = Poisson::var("k", 3.0, VarOptions::default().transform(Transform::Log));
        assert!(matches!(err, Err(ModelError::InvalidArgument(_))));
        let k = Poisson::var("k", 3.0, VarOptions::default()).unwrap();
        assert_eq!(model.disc_vars().unwrap(), vec![model.value_var(k).unwrap()]);
        assert!(model.cont_vars().unwrap().is_empty());
    }

    #[test]
    fn test_logpt_is_nojac_plus_jacobian() {
        let model = Model::build(ModelConfig::default(), |_| {
            HalfNormal::var("s", 1.0, VarOptions::default().testval(arr0(2.0).into_dyn()))?;
            Normal::var("y", 0.0, 1.0, VarOptions::default().observed(array![0.5, -0.5].into_dyn()))?;
            Ok(())
        })
        .unwrap();
        let point = model.initial_point().unwrap();
        let y = point["s_log__"].sum();
        assert!((y - 2f64.ln()).abs() < 1e-12);

        let f = model.fn_(&[model.logpt().unwrap(), model.logp_nojact().unwrap()]).unwrap();
        let out = f.call(&point).unwrap();
        let (with, without) = (out[0].sum(), out[1].sum());
        assert!((with - without - y).abs() < 1e-10, "{} - {} != {}", with, without, y);

        let var = model.eval(model.varlogpt().unwrap(), Some(&point)).unwrap().sum();
        let data = model.eval(model.datalogpt().unwrap(), Some(&point)).unwrap().sum();
        assert!((var + data - with).abs() < 1e-10);
    }

    #[test]
    fn test_observed_data_must_be_independent() {
        let model = Model::new(ModelConfig::default()).unwrap();
        let _guard = model.enter();
        let mu = Normal::var("mu", 0.0, 1.0, VarOptions::default()).unwrap();
        let dependent = model.graph_mut().exp(mu);
        let err = Normal::var("y", 0.0, 1.0, VarOptions::default().observed(dependent));
        assert!(matches!(err, Err(ModelError::DependentObservation(_))));

        let err = Normal::var("z", 0.0, 1.0, VarOptions::default().shape([2usize, 3]).observed(array![1.0].into_dyn()));
        assert!(matches!(err, Err(ModelError::Shape { .. })));
    }

    #[test]
    fn test_observed_shared_data_sets_the_shape() {
        let model = Model::new(ModelConfig::default()).unwrap();
        let _guard = model.enter();
        let data = model.data("d", array![1.0, 2.0, 3.0].into_dyn(), None).unwrap();
        let y = Normal::var("y", 0.0, 1.0, VarOptions::default().observed(data)).unwrap();
        assert_eq!(shape(&model, y), vec![3]);
        assert_eq!(model.observations(y), Some(data));
        model.set_data("d", array![1.0, 2.0].into_dyn(), None).unwrap();
        assert_eq!(shape(&model, y), vec![2]);
    }

    #[test]
    fn test_sparse_observations_are_densified() {
        let model = Model::new(ModelConfig::default()).unwrap();
        let _guard = model.enter();
        let sparse = ObservedData::Sparse {
            shape: vec![2, 2],
            entries: vec![(vec![0, 1], 3.0)],
        };
        let y = Normal::var("y", 0.0, 1.0, VarOptions::default().observed(sparse)).unwrap();
        let data = model.observations(y).unwrap();
        assert_eq!(model.eval(data, None).unwrap(), array![[0.0, 3.0], [0.0, 0.0]].into_dyn());
    }

    #[test]
    fn test_total_size_scales_observed_logp() {
        let data = array![0.1, -0.2, 0.3, 0.0].into_dyn();
        let plain = Model::build(ModelConfig::default(), |_| {
            Normal::var("y", 0.0, 1.0, VarOptions::default().observed(data.clone()))?;
            Ok(())
        })
        .unwrap();
        let scaled = Model::build(ModelConfig::default(), |_| {
            Normal::var("y", 0.0, 1.0, VarOptions::default().observed(data.clone()).total_size(40usize))?;
            Ok(())
        })
        .unwrap();
        let p = plain.point_logps(None).unwrap()[0].1;
        let s = scaled.point_logps(None).unwrap()[0].1;
        assert!((s - 10.0 * p).abs() < 0.1, "{} vs 10 * {}", s, p);
        assert_eq!(scaled.total_size(scaled.get("y").unwrap()), Some(TotalSize::Leading(40)));
    }

    #[test]
    fn test_deterministic_and_potential() {
        let model = Model::new(ModelConfig::default()).unwrap();
        let _guard = model.enter();
        let x = Normal::var("x", 0.0, 1.0, VarOptions::default().testval(arr0(0.5).into_dyn())).unwrap();
        let doubled = {
            let mut g = model.graph_mut();
            let two = g.scalar(2.0);
            g.mul(two, x)
        };
        let det = model.deterministic("double", doubled, None).unwrap();
        let penalty = {
            let mut g = model.graph_mut();
            let sq = g.square(x);
            g.neg(sq)
        };
        model.potential("pen", penalty).unwrap();
        assert_eq!(model.deterministics(), vec![det]);
        assert_eq!(model.potentials().len(), 1);

        let point = model.initial_point().unwrap();
        assert_eq!(model.eval(det, Some(&point)).unwrap().sum(), 1.0);
        let data = model.eval(model.datalogpt().unwrap(), Some(&point)).unwrap().sum();
        assert!((data + 0.25).abs() < 1e-12);

        let names: Vec<String> = model
            .unobserved_value_vars()
            .unwrap()
            .iter()
            .map(|&v| model.graph().describe(v))
            .collect();
        assert_eq!(names, vec!["x", "double"]);
        assert!(model.to_string().contains("double ~ Deterministic"));
        assert!(model.to_string().contains("x ~ Normal"));
    }

    #[test]
    fn test_point_logps_and_start_checks() {
        let model = Model::build(ModelConfig::default(), |_| {
            HalfNormal::var("s", 1.0, VarOptions::default())?;
            Normal::var("y", 0.0, 1.0, VarOptions::default().observed(array![0.0].into_dyn()))?;
            Ok(())
        })
        .unwrap();
        let logps = model.point_logps(None).unwrap();
        let names: Vec<&str> = logps.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["s", "y"]);
        assert!((logps[1].1 - (-0.92)).abs() < 1e-12);

        let good: Point = [("s_log__".to_string(), arr0(0.0).into_dyn())].into_iter().collect();
        model.check_start_vals(&[good]).unwrap();

        let unknown: Point = [("nope".to_string(), arr0(0.0).into_dyn())].into_iter().collect();
        assert!(matches!(model.check_start_vals(&[unknown]), Err(ModelError::InvalidArgument(_))));

        let bad: Point = [("s_log__".to_string(), arr0(f64::NAN).into_dyn())].into_iter().collect();
        assert!(matches!(model.check_start_vals(&[bad]), Err(ModelError::InitialEvaluation { .. })));
    }

    #[test]
    fn test_logp_dlogp_matches_finite_differences() {
        let model = Model::build(ModelConfig::default(), |_| {
            let mu = Normal::var("mu", 0.0, 10.0, VarOptions::default())?;
            let s = HalfNormal::var("s", 2.0, VarOptions::default())?;
            Normal::var("y", mu, s, VarOptions::default().observed(array![0.3, 1.2, -0.4].into_dyn()))?;
            Ok(())
        })
        .unwrap();
        let f = model.logp_dlogp_function(None, false).unwrap();
        assert_eq!(f.grad_var_names(), vec!["mu", "s_log__"]);
        let x = vec![0.2, -0.1];
        let (cost, grads) = f.call(&x).unwrap();
        assert!((f.value(&x).unwrap() - cost).abs() < 1e-12);
        let eps = 1e-6;
        for i in 0..x.len() {
            let mut hi = x.clone();
            let mut lo = x.clone();
            hi[i] += eps;
            lo[i] -= eps;
            let fd = (f.value(&hi).unwrap() - f.value(&lo).unwrap()) / (2.0 * eps);
            assert!((fd - grads[i]).abs() < 1e-5, "axis {}: {} vs {}", i, fd, grads[i]);
        }
    }

    #[test]
    fn test_tempered_weights_and_extra_values() {
        let model = Model::build(ModelConfig::default(), |_| {
            let mu = Normal::var("mu", 0.0, 1.0, VarOptions::default())?;
            let s = HalfNormal::var("s", 1.0, VarOptions::default())?;
            Normal::var("y", mu, s, VarOptions::default().observed(array![1.0].into_dyn()))?;
            Ok(())
        })
        .unwrap();
        let mu = model.get("mu").unwrap();
        let mut f = model.logp_dlogp_function(Some(&[mu]), true).unwrap();
        assert_eq!(f.size(), 1);
        assert_eq!(f.get_extra_values().keys().collect::<Vec<_>>(), vec!["s_log__"]);

        let full = f.value(&[0.0]).unwrap();
        f.set_weights(&[0.0]).unwrap();
        let prior_only = f.value(&[0.0]).unwrap();
        assert!(full < prior_only);
        assert!(f.set_weights(&[1.0, 2.0]).is_err());

        let extra: Point = [("s_log__".to_string(), arr0(0.0).into_dyn())].into_iter().collect();
        f.set_extra_values(&extra).unwrap();
        assert_eq!(f.get_extra_values()["s_log__"].sum(), 0.0);
        assert!(f.set_extra_values(&Point::new()).is_err());
    }

    #[test]
    fn test_flatten_and_fastfn() {
        let model = Model::build(ModelConfig::default(), |_| {
            Normal::var("a", 0.0, 1.0, VarOptions::default().size([2usize]).testval(array![1.0, 2.0].into_dyn()))?;
            Normal::var("b", 0.0, 1.0, VarOptions::default().testval(arr0(3.0).into_dyn()))?;
            Ok(())
        })
        .unwrap();
        let view = model.flatten(None, Some(&["b", "a"])).unwrap();
        assert_eq!(view.size(), 3);
        assert_eq!(view.layout[0].name, "b");
        let a = model.get("a").unwrap();
        let a_value = model.value_var(a).unwrap();
        let total = {
            let mut g = model.graph_mut();
            g.sum(a_value)
        };
        let flat_total = view.apply(&model, &[total]).unwrap()[0];
        let v = model.eval(flat_total, Some(&Point::new())).unwrap().sum();
        assert_eq!(v, 3.0);

        let f = model.fastfn(&[a]).unwrap();
        let unknown: Point = [("zzz".to_string(), arr0(0.0).into_dyn())].into_iter().collect();
        assert!(matches!(f.call(&unknown), Err(ModelError::UnknownVariable(_))));
        assert!(model.fn_(&[a]).unwrap().call(&unknown).is_ok());
    }

    #[test]
    fn test_warnings_are_recorded() {
        let model = Model::new(ModelConfig::default()).unwrap();
        let _guard = model.enter();
        let mu: ArrayD<f64> = Array::ones(IxDyn(&[5, 4, 3]));
        Normal::var("x", mu, 1.0, VarOptions::default().size([5usize, 4])).unwrap();
        let warnings = model.graph_mut().take_warnings();
        assert!(matches!(warnings.as_slice(), [ModelWarning::Shape(_)]));
    }
}
