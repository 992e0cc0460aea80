use crate::distribution::Kernel;
use crate::error::{ModelError, ModelWarning, Result};
use ndarray::{arr0, ArrayD};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Unique identifier for a node in the computation graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnaryOp {
    /// Pass-through; gives an existing value a second name.
    Identity,
    Neg,
    Exp,
    Log,
    Log1p,
    Square,
    Sqrt,
    Abs,
    Sigmoid,
    /// `ln(1 + exp(x))`
    Softplus,
    LnGamma,
    Erf,
}

/// Element-wise binary operations. All of them broadcast like NumPy.
/// Comparisons produce `1.0` / `0.0` and carry no gradient.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Lt,
    Le,
    Gt,
    Ge,
}

/// Operations supported in the computation graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Op {
    /// A constant tensor baked into the graph.
    Constant(ArrayD<f64>),
    /// Mutable data (index into the shared-value table). Replacing the value
    /// re-shapes every node whose shape derives from it.
    Shared(usize),
    /// A free symbolic input, fed through `givens` or its test value.
    /// Value variables and flat views are inputs.
    Input,
    /// A draw from a distribution kernel. `size` holds scalar nodes.
    Random {
        kernel: String,
        params: Vec<NodeId>,
        size: Vec<NodeId>,
    },
    Unary(UnaryOp, NodeId),
    Binary(BinaryOp, NodeId, NodeId),
    /// `cond != 0 ? then : otherwise`, broadcasting all three.
    Switch {
        cond: NodeId,
        then: NodeId,
        otherwise: NodeId,
    },
    /// Sum over all elements.
    Sum(NodeId),
    /// Run-time length of one axis of `x`, as a scalar.
    ShapeOf { x: NodeId, axis: usize },
    /// Gather along the leading `indices.len()` axes (one index list per
    /// axis, all of equal length). The gathered axes collapse into one.
    Index {
        x: NodeId,
        indices: Vec<Vec<usize>>,
    },
    /// Copy of `x` with the gathered positions overwritten by `values`.
    SetSubtensor {
        x: NodeId,
        indices: Vec<Vec<usize>>,
        values: NodeId,
    },
    BroadcastTo { x: NodeId, shape: Vec<NodeId> },
    /// Fused multivariate-normal log-density over the last axis.
    MvNormalLogp {
        value: NodeId,
        mu: NodeId,
        cov: NodeId,
    },
    /// Reshaped window into a flat vector.
    FlatSlice {
        flat: NodeId,
        start: usize,
        shape: Vec<usize>,
    },
    /// Random rows of `data`, redrawn at each evaluation.
    Minibatch { data: NodeId, batch_size: usize },
}

impl Op {
    /// Direct inputs of the operation, in a fixed order.
    pub fn inputs(&self) -> Vec<NodeId> {
        match self {
            Op::Constant(_) | Op::Shared(_) | Op::Input => Vec::new(),
            Op::Random { params, size, .. } => params.iter().chain(size.iter()).copied().collect(),
            Op::Unary(_, a) | Op::Sum(a) => vec![*a],
            Op::Binary(_, a, b) => vec![*a, *b],
            Op::Switch {
                cond,
                then,
                otherwise,
            } => vec![*cond, *then, *otherwise],
            Op::ShapeOf { x, .. } | Op::Index { x, .. } => vec![*x],
            Op::SetSubtensor { x, values, .. } => vec![*x, *values],
            Op::BroadcastTo { x, shape } => std::iter::once(*x).chain(shape.iter().copied()).collect(),
            Op::MvNormalLogp { value, mu, cov } => vec![*value, *mu, *cov],
            Op::FlatSlice { flat, .. } => vec![*flat],
            Op::Minibatch { data, .. } => vec![*data],
        }
    }

    /// The same operation reading from different inputs.
    pub fn map_inputs(&self, f: impl Fn(NodeId) -> NodeId) -> Op {
        match self {
            Op::Constant(_) | Op::Shared(_) | Op::Input => self.clone(),
            Op::Random {
                kernel,
                params,
                size,
            } => Op::Random {
                kernel: kernel.clone(),
                params: params.iter().map(|&p| f(p)).collect(),
                size: size.iter().map(|&s| f(s)).collect(),
            },
            Op::Unary(u, a) => Op::Unary(*u, f(*a)),
            Op::Sum(a) => Op::Sum(f(*a)),
            Op::Binary(b, x, y) => Op::Binary(*b, f(*x), f(*y)),
            Op::Switch {
                cond,
                then,
                otherwise,
            } => Op::Switch {
                cond: f(*cond),
                then: f(*then),
                otherwise: f(*otherwise),
            },
            Op::ShapeOf { x, axis } => Op::ShapeOf {
                x: f(*x),
                axis: *axis,
            },
            Op::Index { x, indices } => Op::Index {
                x: f(*x),
                indices: indices.clone(),
            },
            Op::SetSubtensor { x, indices, values } => Op::SetSubtensor {
                x: f(*x),
                indices: indices.clone(),
                values: f(*values),
            },
            Op::BroadcastTo { x, shape } => Op::BroadcastTo {
                x: f(*x),
                shape: shape.iter().map(|&s| f(s)).collect(),
            },
            Op::MvNormalLogp { value, mu, cov } => Op::MvNormalLogp {
                value: f(*value),
                mu: f(*mu),
                cov: f(*cov),
            },
            Op::FlatSlice { flat, start, shape } => Op::FlatSlice {
                flat: f(*flat),
                start: *start,
                shape: shape.clone(),
            },
            Op::Minibatch { data, batch_size } => Op::Minibatch {
                data: f(*data),
                batch_size: *batch_size,
            },
        }
    }
}

/// A single node in the computation graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub op: Op,
    pub name: Option<String>,
    /// Static number of dimensions. Lengths are only known at evaluation.
    pub ndim: usize,
    pub test_value: Option<ArrayD<f64>>,
}

/// The computational graph behind a model.
///
/// Nodes are stored in topological order (each node only references
/// earlier nodes), so evaluation and rewriting never need a sort. Shared
/// values live next to the graph and can be replaced in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Graph {
    pub nodes: Vec<Node>,
    shared_values: Vec<ArrayD<f64>>,
    rng: ChaCha8Rng,
    #[serde(skip)]
    warnings: Vec<ModelWarning>,
}

impl Graph {
    pub fn new() -> Self {
        Self::with_seed(42)
    }

    pub fn with_seed(seed: u64) -> Self {
        Self {
            nodes: Vec::new(),
            shared_values: Vec::new(),
            rng: ChaCha8Rng::seed_from_u64(seed),
            warnings: Vec::new(),
        }
    }

    fn add_node(&mut self, op: Op, ndim: usize, name: Option<String>) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(Node {
            id,
            op,
            name,
            ndim,
            test_value: None,
        });
        id
    }

    fn check(&self, id: NodeId) -> Result<&Node> {
        self.nodes
            .get(id.0)
            .ok_or_else(|| ModelError::InvalidArgument(format!("node {} does not exist", id.0)))
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0]
    }

    pub fn ndim(&self, id: NodeId) -> usize {
        self.nodes[id.0].ndim
    }

    pub fn name(&self, id: NodeId) -> Option<&str> {
        self.nodes[id.0].name.as_deref()
    }

    pub fn set_name(&mut self, id: NodeId, name: impl Into<String>) {
        self.nodes[id.0].name = Some(name.into());
    }

    /// A named alias of `x` that evaluates to the same value.
    pub fn alias(&mut self, x: NodeId, name: impl Into<String>) -> NodeId {
        let id = self.unary(UnaryOp::Identity, x);
        self.set_name(id, name);
        id
    }

    /// Human-readable label used in error messages.
    pub fn describe(&self, id: NodeId) -> String {
        let node = &self.nodes[id.0];
        match (&node.name, &node.op) {
            (Some(n), _) => n.clone(),
            (None, Op::Random { kernel, .. }) => format!("{kernel}_rv{{{}}}", id.0),
            (None, _) => format!("node{{{}}}", id.0),
        }
    }

    pub fn test_value(&self, id: NodeId) -> Option<&ArrayD<f64>> {
        self.nodes[id.0].test_value.as_ref()
    }

    pub fn set_test_value(&mut self, id: NodeId, value: Option<ArrayD<f64>>) {
        self.nodes[id.0].test_value = value;
    }

    // ── leaves ──────────────────────────────────────────────────────

    pub fn constant(&mut self, value: ArrayD<f64>) -> NodeId {
        let ndim = value.ndim();
        self.add_node(Op::Constant(value), ndim, None)
    }

    pub fn scalar(&mut self, value: f64) -> NodeId {
        self.constant(arr0(value).into_dyn())
    }

    pub fn shared(&mut self, name: &str, value: ArrayD<f64>) -> NodeId {
        let idx = self.shared_values.len();
        let ndim = value.ndim();
        self.shared_values.push(value);
        self.add_node(Op::Shared(idx), ndim, Some(name.to_string()))
    }

    pub fn shared_value(&self, id: NodeId) -> Result<&ArrayD<f64>> {
        match self.check(id)?.op {
            Op::Shared(idx) => Ok(&self.shared_values[idx]),
            _ => Err(ModelError::InvalidArgument(format!(
                "`{}` is not a shared variable",
                self.describe(id)
            ))),
        }
    }

    /// Replace the value of a shared node. The dimensionality must not change.
    pub fn set_shared(&mut self, id: NodeId, value: ArrayD<f64>) -> Result<()> {
        let ndim = self.check(id)?.ndim;
        let idx = match self.nodes[id.0].op {
            Op::Shared(idx) => idx,
            _ => {
                return Err(ModelError::InvalidArgument(format!(
                    "`{}` is not a shared variable",
                    self.describe(id)
                )))
            }
        };
        if value.ndim() != ndim {
            return Err(ModelError::shape(
                format!("New values for '{}' must keep their dimensionality", self.describe(id)),
                value.ndim(),
                ndim,
            ));
        }
        self.shared_values[idx] = value;
        Ok(())
    }

    pub fn input(&mut self, name: &str, ndim: usize) -> NodeId {
        self.add_node(Op::Input, ndim, Some(name.to_string()))
    }

    /// Nodes that do not depend on any other node: constants, shared data
    /// and minibatch views of those.
    pub fn is_independent(&self, id: NodeId) -> bool {
        match &self.nodes[id.0].op {
            Op::Constant(_) | Op::Shared(_) => true,
            Op::Minibatch { data, .. } => self.is_independent(*data),
            _ => false,
        }
    }

    // ── random variables ────────────────────────────────────────────

    pub fn random(&mut self, kernel: &Kernel, params: &[NodeId], size: &[NodeId]) -> Result<NodeId> {
        if params.len() != kernel.ndims_params.len() {
            return Err(ModelError::InvalidArgument(format!(
                "{} expects {} parameters, got {}",
                kernel.name,
                kernel.ndims_params.len(),
                params.len()
            )));
        }
        let mut ndim_implied = 0;
        for (&p, &nd) in params.iter().zip(kernel.ndims_params.iter()) {
            let pnd = self.check(p)?.ndim;
            if pnd < nd {
                return Err(ModelError::shape(
                    format!("Parameter {} of {} has too few dimensions", self.describe(p), kernel.name),
                    pnd,
                    nd,
                ));
            }
            ndim_implied = ndim_implied.max(pnd - nd);
        }
        for &s in size {
            if self.check(s)?.ndim != 0 {
                return Err(ModelError::InvalidShapeSpec(format!(
                    "size entries must be scalars, `{}` is {}-dimensional",
                    self.describe(s),
                    self.ndim(s)
                )));
            }
        }
        let ndim = if kernel.ndim_supp == 0 {
            if size.len() >= ndim_implied {
                size.len()
            } else {
                size.len() + ndim_implied
            }
        } else {
            size.len() + ndim_implied + kernel.ndim_supp
        };
        Ok(self.add_node(
            Op::Random {
                kernel: kernel.name.clone(),
                params: params.to_vec(),
                size: size.to_vec(),
            },
            ndim,
            None,
        ))
    }

    /// Kernel name, parameters and size of a random node.
    pub fn random_parts(&self, id: NodeId) -> Option<(&str, &[NodeId], &[NodeId])> {
        match &self.nodes[id.0].op {
            Op::Random {
                kernel,
                params,
                size,
            } => Some((kernel.as_str(), params.as_slice(), size.as_slice())),
            _ => None,
        }
    }

    // ── element-wise ops ────────────────────────────────────────────

    pub fn unary(&mut self, op: UnaryOp, a: NodeId) -> NodeId {
        let ndim = self.ndim(a);
        self.add_node(Op::Unary(op, a), ndim, None)
    }

    pub fn binary(&mut self, op: BinaryOp, a: NodeId, b: NodeId) -> NodeId {
        let ndim = self.ndim(a).max(self.ndim(b));
        self.add_node(Op::Binary(op, a, b), ndim, None)
    }

    pub fn add(&mut self, a: NodeId, b: NodeId) -> NodeId {
        self.binary(BinaryOp::Add, a, b)
    }

    pub fn sub(&mut self, a: NodeId, b: NodeId) -> NodeId {
        self.binary(BinaryOp::Sub, a, b)
    }

    pub fn mul(&mut self, a: NodeId, b: NodeId) -> NodeId {
        self.binary(BinaryOp::Mul, a, b)
    }

    pub fn div(&mut self, a: NodeId, b: NodeId) -> NodeId {
        self.binary(BinaryOp::Div, a, b)
    }

    pub fn neg(&mut self, a: NodeId) -> NodeId {
        self.unary(UnaryOp::Neg, a)
    }

    pub fn exp(&mut self, a: NodeId) -> NodeId {
        self.unary(UnaryOp::Exp, a)
    }

    pub fn log(&mut self, a: NodeId) -> NodeId {
        self.unary(UnaryOp::Log, a)
    }

    pub fn square(&mut self, a: NodeId) -> NodeId {
        self.unary(UnaryOp::Square, a)
    }

    pub fn sigmoid(&mut self, a: NodeId) -> NodeId {
        self.unary(UnaryOp::Sigmoid, a)
    }

    pub fn softplus(&mut self, a: NodeId) -> NodeId {
        self.unary(UnaryOp::Softplus, a)
    }

    pub fn ge(&mut self, a: NodeId, b: NodeId) -> NodeId {
        self.binary(BinaryOp::Ge, a, b)
    }

    pub fn le(&mut self, a: NodeId, b: NodeId) -> NodeId {
        self.binary(BinaryOp::Le, a, b)
    }

    pub fn gt(&mut self, a: NodeId, b: NodeId) -> NodeId {
        self.binary(BinaryOp::Gt, a, b)
    }

    pub fn switch(&mut self, cond: NodeId, then: NodeId, otherwise: NodeId) -> NodeId {
        let ndim = self.ndim(cond).max(self.ndim(then)).max(self.ndim(otherwise));
        self.add_node(
            Op::Switch {
                cond,
                then,
                otherwise,
            },
            ndim,
            None,
        )
    }

    /// `logp` where `cond` holds, `-inf` elsewhere.
    pub fn bound(&mut self, logp: NodeId, cond: NodeId) -> NodeId {
        let neg_inf = self.scalar(f64::NEG_INFINITY);
        self.switch(cond, logp, neg_inf)
    }

    pub fn sum(&mut self, a: NodeId) -> NodeId {
        self.add_node(Op::Sum(a), 0, None)
    }

    /// Sum of several nodes, each reduced to a scalar first.
    pub fn sum_all(&mut self, terms: &[NodeId]) -> NodeId {
        let mut total = self.scalar(0.0);
        for &t in terms {
            let s = if self.ndim(t) == 0 { t } else { self.sum(t) };
            total = self.add(total, s);
        }
        total
    }

    // ── shape and indexing ops ──────────────────────────────────────

    pub fn shape_of(&mut self, x: NodeId, axis: usize) -> Result<NodeId> {
        let ndim = self.check(x)?.ndim;
        if axis >= ndim {
            return Err(ModelError::shape(
                format!("axis {axis} out of range for `{}`", self.describe(x)),
                axis,
                ndim,
            ));
        }
        Ok(self.add_node(Op::ShapeOf { x, axis }, 0, None))
    }

    fn check_indices(&self, x: NodeId, indices: &[Vec<usize>]) -> Result<()> {
        let ndim = self.check(x)?.ndim;
        if indices.is_empty() || indices.len() > ndim {
            return Err(ModelError::shape(
                format!("cannot index `{}` with {} index arrays", self.describe(x), indices.len()),
                indices.len(),
                ndim,
            ));
        }
        let n = indices[0].len();
        if indices.iter().any(|ix| ix.len() != n) {
            return Err(ModelError::InvalidArgument(
                "index arrays must all have the same length".to_string(),
            ));
        }
        Ok(())
    }

    pub fn index(&mut self, x: NodeId, indices: Vec<Vec<usize>>) -> Result<NodeId> {
        self.check_indices(x, &indices)?;
        let ndim = self.ndim(x) - indices.len() + 1;
        Ok(self.add_node(Op::Index { x, indices }, ndim, None))
    }

    pub fn set_subtensor(&mut self, x: NodeId, indices: Vec<Vec<usize>>, values: NodeId) -> Result<NodeId> {
        self.check_indices(x, &indices)?;
        let target = self.ndim(x) - indices.len() + 1;
        if self.check(values)?.ndim > target {
            return Err(ModelError::shape(
                "values have more dimensions than the indexed subtensor",
                self.ndim(values),
                target,
            ));
        }
        let ndim = self.ndim(x);
        Ok(self.add_node(Op::SetSubtensor { x, indices, values }, ndim, None))
    }

    pub fn broadcast_to(&mut self, x: NodeId, shape: Vec<NodeId>) -> Result<NodeId> {
        if shape.len() < self.check(x)?.ndim {
            return Err(ModelError::shape(
                format!("cannot broadcast `{}` to fewer dimensions", self.describe(x)),
                shape.len(),
                self.ndim(x),
            ));
        }
        let ndim = shape.len();
        Ok(self.add_node(Op::BroadcastTo { x, shape }, ndim, None))
    }

    /// Symbolic shape of `x` as one scalar node per axis.
    pub fn shape_nodes(&mut self, x: NodeId) -> Result<Vec<NodeId>> {
        (0..self.check(x)?.ndim).map(|axis| self.shape_of(x, axis)).collect()
    }

    pub fn mv_normal_logp(&mut self, value: NodeId, mu: NodeId, cov: NodeId) -> NodeId {
        let ndim = (self.ndim(value).max(1) - 1)
            .max(self.ndim(mu).max(1) - 1)
            .max(self.ndim(cov).max(2) - 2);
        self.add_node(Op::MvNormalLogp { value, mu, cov }, ndim, None)
    }

    pub fn flat_slice(&mut self, flat: NodeId, start: usize, shape: Vec<usize>) -> NodeId {
        let ndim = shape.len();
        self.add_node(Op::FlatSlice { flat, start, shape }, ndim, None)
    }

    /// Random rows of an independent data node, for subsampled likelihoods.
    pub fn minibatch(&mut self, data: NodeId, batch_size: usize) -> Result<NodeId> {
        let ndim = self.check(data)?.ndim;
        if !self.is_independent(data) || ndim == 0 {
            return Err(ModelError::InvalidArgument(format!(
                "minibatches need independent data with at least one axis, got `{}`",
                self.describe(data)
            )));
        }
        Ok(self.add_node(Op::Minibatch { data, batch_size }, ndim, None))
    }

    // ── graph traversal and rewriting ───────────────────────────────

    /// All ancestors of `outputs` (inclusive), in topological order.
    pub fn ancestors(&self, outputs: &[NodeId]) -> Vec<NodeId> {
        let mut seen: HashSet<NodeId> = HashSet::new();
        let mut stack: Vec<NodeId> = outputs.to_vec();
        while let Some(id) = stack.pop() {
            if seen.insert(id) {
                stack.extend(self.nodes[id.0].op.inputs());
            }
        }
        let mut out: Vec<NodeId> = seen.into_iter().collect();
        out.sort();
        out
    }

    /// True if `target` is an ancestor of (or equal to) `node`.
    pub fn depends_on(&self, node: NodeId, target: NodeId) -> bool {
        self.ancestors(&[node]).binary_search(&target).is_ok()
    }

    /// Clone the subgraph behind `outputs`, letting `replace` substitute
    /// nodes as they are visited.
    ///
    /// `replace` sees every ancestor in topological order together with its
    /// inputs after earlier substitutions were applied, and may return a new
    /// node to stand in for it. Nodes with substituted inputs are cloned;
    /// untouched nodes are shared with the original graph.
    pub fn rewrite<F>(&mut self, outputs: &[NodeId], mut replace: F) -> Result<Vec<NodeId>>
    where
        F: FnMut(&mut Graph, NodeId, &[NodeId]) -> Result<Option<NodeId>>,
    {
        let mut map: HashMap<NodeId, NodeId> = HashMap::new();
        for id in self.ancestors(outputs) {
            let inputs = self.nodes[id.0].op.inputs();
            let mapped: Vec<NodeId> = inputs.iter().map(|i| *map.get(i).unwrap_or(i)).collect();
            if let Some(new) = replace(self, id, &mapped)? {
                map.insert(id, new);
                continue;
            }
            if mapped != inputs {
                let node = &self.nodes[id.0];
                let op = node.op.map_inputs(|i| *map.get(&i).unwrap_or(&i));
                let (ndim, name) = (node.ndim, node.name.clone());
                let new = self.add_node(op, ndim, name);
                map.insert(id, new);
            }
        }
        Ok(outputs.iter().map(|o| *map.get(o).unwrap_or(o)).collect())
    }

    /// Rewrite with a fixed substitution table.
    pub fn replace(&mut self, outputs: &[NodeId], table: &HashMap<NodeId, NodeId>) -> Result<Vec<NodeId>> {
        self.rewrite(outputs, |_, id, _| Ok(table.get(&id).copied()))
    }

    // ── randomness and warnings ─────────────────────────────────────

    pub fn reseed(&mut self, seed: u64) {
        self.rng = ChaCha8Rng::seed_from_u64(seed);
    }

    pub(crate) fn rng(&self) -> &ChaCha8Rng {
        &self.rng
    }

    pub(crate) fn set_rng(&mut self, rng: ChaCha8Rng) {
        self.rng = rng;
    }

    pub fn warn(&mut self, warning: ModelWarning) {
        log::warn!("{warning}");
        self.warnings.push(warning);
    }

    pub fn warnings(&self) -> &[ModelWarning] {
        &self.warnings
    }

    pub fn take_warnings(&mut self) -> Vec<ModelWarning> {
        std::mem::take(&mut self.warnings)
    }
}

impl Default for Graph {
    fn default() -> Self {
        Self::new()
    }
}
