use crate::distribution::{get_kernel, rv_output_shape};
use crate::error::{ModelError, Result};
use crate::graph::{BinaryOp, Graph, NodeId, Op, UnaryOp};
use crate::special::{digamma, erf, ln_gamma};
use nalgebra::{Cholesky, DMatrix, DVector};
use ndarray::{arr0, ArrayD, ArrayViewMutD, Axis, IxDyn, Zip};
use rand::seq::index::sample;
use rand_chacha::ChaCha8Rng;
use std::collections::HashMap;

/// Values substituted for graph nodes during evaluation.
pub type Givens = HashMap<NodeId, ArrayD<f64>>;

/// Memoizing evaluator over a borrowed graph.
///
/// Values and shapes are computed lazily, so asking for the shape of a
/// node never forces a random draw unless a `size` entry itself is random.
/// Random nodes draw from a private copy of the graph's generator; see
/// [`evaluate`] for the variant that advances the graph's generator.
pub struct Evaluator<'a> {
    graph: &'a Graph,
    givens: &'a Givens,
    rng: ChaCha8Rng,
    values: HashMap<NodeId, ArrayD<f64>>,
    shapes: HashMap<NodeId, Vec<usize>>,
}

impl<'a> Evaluator<'a> {
    pub fn new(graph: &'a Graph, givens: &'a Givens) -> Self {
        Self {
            graph,
            givens,
            rng: graph.rng().clone(),
            values: HashMap::new(),
            shapes: HashMap::new(),
        }
    }

    pub fn into_rng(self) -> ChaCha8Rng {
        self.rng
    }

    pub fn value(&mut self, id: NodeId) -> Result<&ArrayD<f64>> {
        self.ensure(id)?;
        Ok(&self.values[&id])
    }

    pub fn scalar(&mut self, id: NodeId) -> Result<f64> {
        as_scalar(self.value(id)?)
    }

    fn input_value(&self, id: NodeId) -> Option<&ArrayD<f64>> {
        self.givens.get(&id).or_else(|| self.graph.test_value(id))
    }

    fn size_values(&mut self, size: &[NodeId]) -> Result<Vec<usize>> {
        size.iter()
            .map(|&s| {
                let v = self.scalar(s)?;
                if v < 0.0 || !v.is_finite() {
                    return Err(ModelError::shape("negative or non-finite length", v, "a length >= 0"));
                }
                Ok(v.round() as usize)
            })
            .collect()
    }

    fn ensure(&mut self, id: NodeId) -> Result<()> {
        if self.values.contains_key(&id) {
            return Ok(());
        }
        // Any node can be pinned through `givens`, not just inputs.
        if let Some(v) = self.givens.get(&id) {
            self.values.insert(id, v.clone());
            return Ok(());
        }
        let graph = self.graph;
        let value = match &graph.node(id).op {
            Op::Constant(c) => c.clone(),
            Op::Shared(_) => graph.shared_value(id)?.clone(),
            Op::Input => self
                .input_value(id)
                .cloned()
                .ok_or_else(|| ModelError::MissingInput(graph.describe(id)))?,
            Op::ShapeOf { x, axis } => {
                let shape = self.shape(*x)?;
                arr0(shape[*axis] as f64).into_dyn()
            }
            Op::Random {
                kernel,
                params,
                size,
            } => {
                let kernel = get_kernel(kernel)?;
                let draw = kernel.draw.ok_or_else(|| ModelError::NotSampleable(kernel.name.clone()))?;
                for &p in params {
                    self.ensure(p)?;
                }
                let size = self.size_values(size)?;
                let args: Vec<&ArrayD<f64>> = params.iter().map(|p| &self.values[p]).collect();
                let shapes: Vec<Vec<usize>> = args.iter().map(|a| a.shape().to_vec()).collect();
                let (batch, _) = rv_output_shape(&kernel, &shapes, &size)?;
                draw(&args, &batch, &mut self.rng)?
            }
            Op::Minibatch { data, batch_size } => {
                self.ensure(*data)?;
                let data = &self.values[data];
                let n = data.shape()[0];
                if *batch_size > n {
                    return Err(ModelError::shape(
                        "minibatch larger than the data",
                        batch_size,
                        format!("<= {n}"),
                    ));
                }
                let rows = sample(&mut self.rng, n, *batch_size).into_vec();
                data.select(Axis(0), &rows)
            }
            op => {
                for inp in op.inputs() {
                    self.ensure(inp)?;
                }
                self.compute(op)?
            }
        };
        self.values.insert(id, value);
        Ok(())
    }

    fn compute(&self, op: &Op) -> Result<ArrayD<f64>> {
        let v = |id: &NodeId| &self.values[id];
        match op {
            Op::Unary(u, a) => Ok(v(a).mapv(|x| unary_fn(*u, x))),
            Op::Binary(b, x, y) => zip2(v(x), v(y), |p, q| binary_fn(*b, p, q)),
            Op::Switch {
                cond,
                then,
                otherwise,
            } => zip3(v(cond), v(then), v(otherwise), |c, t, o| if c != 0.0 { t } else { o }),
            Op::Sum(a) => Ok(arr0(v(a).sum()).into_dyn()),
            Op::Index { x, indices } => gather(v(x), indices),
            Op::SetSubtensor { x, indices, values } => {
                let mut out = v(x).clone();
                let rows = gather_shape(v(x).shape(), indices);
                let vals = v(values).broadcast(IxDyn(&rows)).ok_or_else(|| {
                    ModelError::shape("cannot broadcast values into subtensor", v(values).shape(), &rows)
                })?;
                for j in 0..indices[0].len() {
                    subview_mut(&mut out, indices, j)?.assign(&vals.index_axis(Axis(0), j));
                }
                Ok(out)
            }
            Op::BroadcastTo { x, shape } => {
                let shape = shape
                    .iter()
                    .map(|s| as_scalar(v(s)).map(|n| n.round() as usize))
                    .collect::<Result<Vec<_>>>()?;
                v(x).broadcast(IxDyn(&shape))
                    .map(|b| b.to_owned())
                    .ok_or_else(|| ModelError::shape("cannot broadcast", v(x).shape(), shape))
            }
            Op::MvNormalLogp { value, mu, cov } => {
                let batches = MvBatches::new(v(value), v(mu), v(cov))?;
                Ok(batches.logp())
            }
            Op::FlatSlice { flat, start, shape } => {
                let n: usize = shape.iter().product();
                let flat = v(flat);
                if flat.ndim() != 1 || start + n > flat.len() {
                    return Err(ModelError::shape("flat view out of range", flat.shape(), start + n));
                }
                let seg: Vec<f64> = flat.iter().skip(*start).take(n).copied().collect();
                ArrayD::from_shape_vec(IxDyn(shape), seg).map_err(|e| ModelError::Evaluation(e.to_string()))
            }
            _ => Err(ModelError::Evaluation(format!("cannot compute {op:?}"))),
        }
    }

    /// Run-time shape of a node.
    pub fn shape(&mut self, id: NodeId) -> Result<Vec<usize>> {
        if let Some(v) = self.values.get(&id) {
            return Ok(v.shape().to_vec());
        }
        if let Some(s) = self.shapes.get(&id) {
            return Ok(s.clone());
        }
        if let Some(v) = self.givens.get(&id) {
            return Ok(v.shape().to_vec());
        }
        let graph = self.graph;
        let shape = match &graph.node(id).op {
            Op::Constant(c) => c.shape().to_vec(),
            Op::Shared(_) => graph.shared_value(id)?.shape().to_vec(),
            Op::Input => self
                .input_value(id)
                .map(|v| v.shape().to_vec())
                .ok_or_else(|| ModelError::MissingInput(graph.describe(id)))?,
            Op::Random {
                kernel,
                params,
                size,
            } => {
                let kernel = get_kernel(kernel)?;
                let shapes = params.iter().map(|&p| self.shape(p)).collect::<Result<Vec<_>>>()?;
                let size = self.size_values(size)?;
                rv_output_shape(&kernel, &shapes, &size)?.1
            }
            Op::Unary(_, a) => self.shape(*a)?,
            Op::Binary(_, a, b) => broadcast_shapes(&[self.shape(*a)?, self.shape(*b)?])?,
            Op::Switch {
                cond,
                then,
                otherwise,
            } => broadcast_shapes(&[self.shape(*cond)?, self.shape(*then)?, self.shape(*otherwise)?])?,
            Op::Sum(_) | Op::ShapeOf { .. } => Vec::new(),
            Op::Index { x, indices } => gather_shape(&self.shape(*x)?, indices),
            Op::SetSubtensor { x, .. } => self.shape(*x)?,
            Op::BroadcastTo { shape, .. } => self.size_values(shape)?,
            Op::MvNormalLogp { value, mu, cov } => {
                let (v, m, c) = (self.shape(*value)?, self.shape(*mu)?, self.shape(*cov)?);
                broadcast_shapes(&[drop_last(&v, 1), drop_last(&m, 1), drop_last(&c, 2)])?
            }
            Op::FlatSlice { shape, .. } => shape.clone(),
            Op::Minibatch { data, batch_size } => {
                let mut s = self.shape(*data)?;
                s[0] = *batch_size;
                s
            }
        };
        self.shapes.insert(id, shape.clone());
        Ok(shape)
    }

    /// Push the adjoint `g` of node `id` to its inputs.
    fn backprop(&self, id: NodeId, g: &ArrayD<f64>, adj: &mut HashMap<NodeId, ArrayD<f64>>) -> Result<()> {
        let v = |id: &NodeId| &self.values[id];
        match &self.graph.node(id).op {
            Op::Unary(u, a) => {
                let ga = Zip::from(g).and(v(a)).map_collect(|&g, &x| g * unary_deriv(*u, x));
                accumulate(adj, *a, ga);
            }
            Op::Binary(op, a, b) => {
                let (va, vb) = (v(a), v(b));
                let (ga, gb) = match op {
                    BinaryOp::Add => (g.clone(), g.clone()),
                    BinaryOp::Sub => (g.clone(), g.mapv(|x| -x)),
                    BinaryOp::Mul => (zip3(g, va, vb, |g, _, y| g * y)?, zip3(g, va, vb, |g, x, _| g * x)?),
                    BinaryOp::Div => (
                        zip3(g, va, vb, |g, _, y| g / y)?,
                        zip3(g, va, vb, |g, x, y| -g * x / (y * y))?,
                    ),
                    BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => return Ok(()),
                };
                accumulate(adj, *a, unbroadcast(ga, va.shape()));
                accumulate(adj, *b, unbroadcast(gb, vb.shape()));
            }
            Op::Switch {
                cond,
                then,
                otherwise,
            } => {
                let c = v(cond);
                let gt = zip2(g, c, |g, c| if c != 0.0 { g } else { 0.0 })?;
                let go = zip2(g, c, |g, c| if c != 0.0 { 0.0 } else { g })?;
                accumulate(adj, *then, unbroadcast(gt, v(then).shape()));
                accumulate(adj, *otherwise, unbroadcast(go, v(otherwise).shape()));
            }
            Op::Sum(a) => {
                let ga = ArrayD::from_elem(IxDyn(v(a).shape()), as_scalar(g)?);
                accumulate(adj, *a, ga);
            }
            Op::Index { x, indices } => {
                let mut gx = ArrayD::zeros(IxDyn(v(x).shape()));
                for j in 0..indices[0].len() {
                    let mut sub = subview_mut(&mut gx, indices, j)?;
                    sub += &g.index_axis(Axis(0), j);
                }
                accumulate(adj, *x, gx);
            }
            Op::SetSubtensor { x, indices, values } => {
                let gvals = gather(g, indices)?;
                let mut gx = g.clone();
                for j in 0..indices[0].len() {
                    subview_mut(&mut gx, indices, j)?.fill(0.0);
                }
                accumulate(adj, *x, gx);
                accumulate(adj, *values, unbroadcast(gvals, v(values).shape()));
            }
            Op::BroadcastTo { x, .. } => {
                accumulate(adj, *x, unbroadcast(g.clone(), v(x).shape()));
            }
            Op::MvNormalLogp { value, mu, cov } => {
                let batches = MvBatches::new(v(value), v(mu), v(cov))?;
                let (gv, gm, gc) = batches.grad(g)?;
                accumulate(adj, *value, unbroadcast(gv, v(value).shape()));
                accumulate(adj, *mu, unbroadcast(gm, v(mu).shape()));
                accumulate(adj, *cov, unbroadcast(gc, v(cov).shape()));
            }
            Op::FlatSlice { flat, start, .. } => {
                let mut gf = ArrayD::zeros(IxDyn(v(flat).shape()));
                for (slot, &gi) in gf.iter_mut().skip(*start).zip(g.iter()) {
                    *slot = gi;
                }
                accumulate(adj, *flat, gf);
            }
            // Leaves, random draws and shape queries carry no gradient.
            Op::Constant(_)
            | Op::Shared(_)
            | Op::Input
            | Op::Random { .. }
            | Op::ShapeOf { .. }
            | Op::Minibatch { .. } => {}
        }
        Ok(())
    }
}

/// Evaluate `outputs`, advancing the graph's random generator.
pub fn evaluate(graph: &mut Graph, outputs: &[NodeId], givens: &Givens) -> Result<Vec<ArrayD<f64>>> {
    let (values, rng) = {
        let mut ev = Evaluator::new(graph, givens);
        let values = outputs
            .iter()
            .map(|&o| ev.value(o).cloned())
            .collect::<Result<Vec<_>>>()?;
        (values, ev.into_rng())
    };
    graph.set_rng(rng);
    Ok(values)
}

/// Evaluate a scalar node without touching the graph's generator.
pub fn evaluate_scalar(graph: &Graph, output: NodeId, givens: &Givens) -> Result<f64> {
    Evaluator::new(graph, givens).scalar(output)
}

pub fn infer_shape(graph: &Graph, node: NodeId, givens: &Givens) -> Result<Vec<usize>> {
    Evaluator::new(graph, givens).shape(node)
}

/// Reverse-mode autodiff: value of the scalar `cost` and its gradient with
/// respect to each node in `wrt`.
pub fn grad(graph: &Graph, cost: NodeId, wrt: &[NodeId], givens: &Givens) -> Result<(f64, Vec<ArrayD<f64>>)> {
    if graph.ndim(cost) != 0 {
        return Err(ModelError::InvalidArgument(format!(
            "cost `{}` must be a scalar",
            graph.describe(cost)
        )));
    }
    let mut ev = Evaluator::new(graph, givens);
    let total = ev.scalar(cost)?;

    let mut adj: HashMap<NodeId, ArrayD<f64>> = HashMap::new();
    adj.insert(cost, arr0(1.0).into_dyn());
    for id in graph.ancestors(&[cost]).into_iter().rev() {
        let g = match adj.get(&id) {
            Some(g) if !givens.contains_key(&id) => g.clone(),
            _ => continue,
        };
        ev.backprop(id, &g, &mut adj)?;
    }

    let grads = wrt
        .iter()
        .map(|&w| match adj.get(&w) {
            Some(g) => Ok(g.clone()),
            None => Ok(ArrayD::zeros(IxDyn(&ev.shape(w)?))),
        })
        .collect::<Result<Vec<_>>>()?;
    Ok((total, grads))
}

pub(crate) fn as_scalar(a: &ArrayD<f64>) -> Result<f64> {
    match a.len() {
        1 => Ok(a.iter().next().copied().unwrap_or(f64::NAN)),
        _ => Err(ModelError::shape("expected a scalar", a.shape(), "()")),
    }
}

/// NumPy broadcasting of several shapes.
pub fn broadcast_shapes(shapes: &[Vec<usize>]) -> Result<Vec<usize>> {
    let ndim = shapes.iter().map(|s| s.len()).max().unwrap_or(0);
    let mut out = vec![1; ndim];
    for shape in shapes {
        let offset = ndim - shape.len();
        for (i, &n) in shape.iter().enumerate() {
            let slot = &mut out[offset + i];
            if *slot == 1 {
                *slot = n;
            } else if n != 1 && n != *slot {
                return Err(ModelError::shape("shapes cannot be broadcast together", shapes, "compatible shapes"));
            }
        }
    }
    Ok(out)
}

/// Sum `g` down to `shape`, undoing broadcasting.
pub fn unbroadcast(mut g: ArrayD<f64>, shape: &[usize]) -> ArrayD<f64> {
    while g.ndim() > shape.len() {
        g = g.sum_axis(Axis(0));
    }
    for (axis, &n) in shape.iter().enumerate() {
        if n == 1 && g.shape()[axis] != 1 {
            g = g.sum_axis(Axis(axis)).insert_axis(Axis(axis));
        }
    }
    g
}

fn accumulate(adj: &mut HashMap<NodeId, ArrayD<f64>>, id: NodeId, g: ArrayD<f64>) {
    match adj.get_mut(&id) {
        Some(existing) => *existing += &g,
        None => {
            adj.insert(id, g);
        }
    }
}

fn drop_last(shape: &[usize], n: usize) -> Vec<usize> {
    shape[..shape.len().saturating_sub(n)].to_vec()
}

fn zip2(a: &ArrayD<f64>, b: &ArrayD<f64>, f: impl Fn(f64, f64) -> f64) -> Result<ArrayD<f64>> {
    let shape = broadcast_shapes(&[a.shape().to_vec(), b.shape().to_vec()])?;
    let (av, bv) = match (a.broadcast(IxDyn(&shape)), b.broadcast(IxDyn(&shape))) {
        (Some(av), Some(bv)) => (av, bv),
        _ => return Err(ModelError::shape("cannot broadcast", a.shape(), b.shape())),
    };
    Ok(Zip::from(av).and(bv).map_collect(|&x, &y| f(x, y)))
}

fn zip3(
    a: &ArrayD<f64>,
    b: &ArrayD<f64>,
    c: &ArrayD<f64>,
    f: impl Fn(f64, f64, f64) -> f64,
) -> Result<ArrayD<f64>> {
    let shape = broadcast_shapes(&[a.shape().to_vec(), b.shape().to_vec(), c.shape().to_vec()])?;
    let dim = IxDyn(&shape);
    let (av, bv, cv) = match (a.broadcast(dim.clone()), b.broadcast(dim.clone()), c.broadcast(dim)) {
        (Some(av), Some(bv), Some(cv)) => (av, bv, cv),
        _ => return Err(ModelError::shape("cannot broadcast", a.shape(), &shape)),
    };
    Ok(Zip::from(av).and(bv).and(cv).map_collect(|&x, &y, &z| f(x, y, z)))
}

fn gather_shape(shape: &[usize], indices: &[Vec<usize>]) -> Vec<usize> {
    let mut out = vec![indices[0].len()];
    out.extend_from_slice(&shape[indices.len()..]);
    out
}

fn gather(x: &ArrayD<f64>, indices: &[Vec<usize>]) -> Result<ArrayD<f64>> {
    let mut out = ArrayD::zeros(IxDyn(&gather_shape(x.shape(), indices)));
    for j in 0..indices[0].len() {
        let mut view = x.view();
        for ix in indices {
            check_bounds(ix[j], view.shape()[0])?;
            view = view.index_axis_move(Axis(0), ix[j]);
        }
        out.index_axis_mut(Axis(0), j).assign(&view);
    }
    Ok(out)
}

fn subview_mut<'b>(a: &'b mut ArrayD<f64>, indices: &[Vec<usize>], j: usize) -> Result<ArrayViewMutD<'b, f64>> {
    let mut view = a.view_mut();
    for ix in indices {
        check_bounds(ix[j], view.shape()[0])?;
        view = view.index_axis_move(Axis(0), ix[j]);
    }
    Ok(view)
}

fn check_bounds(i: usize, len: usize) -> Result<()> {
    if i >= len {
        return Err(ModelError::Evaluation(format!(
            "index {i} is out of bounds for axis with size {len}"
        )));
    }
    Ok(())
}

fn unary_fn(op: UnaryOp, x: f64) -> f64 {
    match op {
        UnaryOp::Identity => x,
        UnaryOp::Neg => -x,
        UnaryOp::Exp => x.exp(),
        UnaryOp::Log => x.ln(),
        UnaryOp::Log1p => x.ln_1p(),
        UnaryOp::Square => x * x,
        UnaryOp::Sqrt => x.sqrt(),
        UnaryOp::Abs => x.abs(),
        UnaryOp::Sigmoid => 1.0 / (1.0 + (-x).exp()),
        UnaryOp::Softplus => {
            if x > 30.0 {
                x
            } else {
                x.exp().ln_1p()
            }
        }
        UnaryOp::LnGamma => ln_gamma(x),
        UnaryOp::Erf => erf(x),
    }
}

fn unary_deriv(op: UnaryOp, x: f64) -> f64 {
    match op {
        UnaryOp::Identity => 1.0,
        UnaryOp::Neg => -1.0,
        UnaryOp::Exp => x.exp(),
        UnaryOp::Log => 1.0 / x,
        UnaryOp::Log1p => 1.0 / (1.0 + x),
        UnaryOp::Square => 2.0 * x,
        UnaryOp::Sqrt => 0.5 / x.sqrt(),
        UnaryOp::Abs => x.signum(),
        UnaryOp::Sigmoid => {
            let s = unary_fn(UnaryOp::Sigmoid, x);
            s * (1.0 - s)
        }
        UnaryOp::Softplus => unary_fn(UnaryOp::Sigmoid, x),
        UnaryOp::LnGamma => digamma(x),
        UnaryOp::Erf => 2.0 / std::f64::consts::PI.sqrt() * (-x * x).exp(),
    }
}

fn binary_fn(op: BinaryOp, a: f64, b: f64) -> f64 {
    let flag = |c: bool| if c { 1.0 } else { 0.0 };
    match op {
        BinaryOp::Add => a + b,
        BinaryOp::Sub => a - b,
        BinaryOp::Mul => a * b,
        BinaryOp::Div => a / b,
        BinaryOp::Lt => flag(a < b),
        BinaryOp::Le => flag(a <= b),
        BinaryOp::Gt => flag(a > b),
        BinaryOp::Ge => flag(a >= b),
    }
}

/// Operands of a batched multivariate-normal density, broadcast over the
/// batch dimensions and flattened row-major.
struct MvBatches {
    batch: Vec<usize>,
    k: usize,
    x: Vec<f64>,
    mu: Vec<f64>,
    cov: Vec<f64>,
}

impl MvBatches {
    fn new(value: &ArrayD<f64>, mu: &ArrayD<f64>, cov: &ArrayD<f64>) -> Result<Self> {
        if value.ndim() < 1 || mu.ndim() < 1 || cov.ndim() < 2 {
            return Err(ModelError::shape(
                "MvNormal needs vector values and means and a matrix covariance",
                (value.ndim(), mu.ndim(), cov.ndim()),
                (1, 1, 2),
            ));
        }
        let k = value.shape()[value.ndim() - 1];
        let (km, kc) = (mu.shape()[mu.ndim() - 1], &cov.shape()[cov.ndim() - 2..]);
        if km != k || kc[0] != k || kc[1] != k {
            return Err(ModelError::shape("MvNormal core dimensions disagree", (km, kc), k));
        }
        let batch = broadcast_shapes(&[
            drop_last(value.shape(), 1),
            drop_last(mu.shape(), 1),
            drop_last(cov.shape(), 2),
        ])?;
        let flat = |a: &ArrayD<f64>, core: &[usize]| -> Result<Vec<f64>> {
            let mut shape = batch.clone();
            shape.extend_from_slice(core);
            a.broadcast(IxDyn(&shape))
                .map(|b| b.iter().copied().collect())
                .ok_or_else(|| ModelError::shape("cannot broadcast MvNormal operand", a.shape(), shape))
        };
        Ok(Self {
            x: flat(value, &[k])?,
            mu: flat(mu, &[k])?,
            cov: flat(cov, &[k, k])?,
            batch,
            k,
        })
    }

    fn n(&self) -> usize {
        self.batch.iter().product()
    }

    fn factor(&self, b: usize) -> Option<(Cholesky<f64, nalgebra::Dyn>, DVector<f64>)> {
        let k = self.k;
        let cov = DMatrix::from_row_slice(k, k, &self.cov[b * k * k..(b + 1) * k * k]);
        let diff = DVector::from_iterator(
            k,
            (0..k).map(|i| self.x[b * k + i] - self.mu[b * k + i]),
        );
        Cholesky::new(cov).map(|c| (c, diff))
    }

    fn logp(&self) -> ArrayD<f64> {
        let k = self.k as f64;
        let vals: Vec<f64> = (0..self.n())
            .map(|b| match self.factor(b) {
                Some((chol, diff)) => {
                    let log_det: f64 = chol.l().diagonal().iter().map(|d| d.ln()).sum::<f64>() * 2.0;
                    let maha = diff.dot(&chol.solve(&diff));
                    -0.5 * (k * std::f64::consts::TAU.ln() + log_det + maha)
                }
                None => f64::NEG_INFINITY,
            })
            .collect();
        ArrayD::from_shape_vec(IxDyn(&self.batch), vals).unwrap_or_else(|_| ArrayD::zeros(IxDyn(&[])))
    }

    fn grad(&self, g: &ArrayD<f64>) -> Result<(ArrayD<f64>, ArrayD<f64>, ArrayD<f64>)> {
        let k = self.k;
        let g = g
            .broadcast(IxDyn(&self.batch))
            .ok_or_else(|| ModelError::shape("bad MvNormal adjoint", g.shape(), &self.batch))?;
        let mut gx = Vec::with_capacity(self.x.len());
        let mut gc = Vec::with_capacity(self.cov.len());
        for (b, &gb) in g.iter().enumerate() {
            match self.factor(b) {
                Some((chol, diff)) => {
                    let inv = chol.inverse();
                    let alpha = &inv * &diff;
                    gx.extend(alpha.iter().map(|a| -gb * a));
                    let outer = &alpha * alpha.transpose();
                    for i in 0..k {
                        for j in 0..k {
                            gc.push(0.5 * gb * (outer[(i, j)] - inv[(i, j)]));
                        }
                    }
                }
                None => {
                    gx.extend(std::iter::repeat(0.0).take(k));
                    gc.extend(std::iter::repeat(0.0).take(k * k));
                }
            }
        }
        let shaped = |core: &[usize], data: Vec<f64>| {
            let mut shape = self.batch.clone();
            shape.extend_from_slice(core);
            ArrayD::from_shape_vec(IxDyn(&shape), data).map_err(|e| ModelError::Evaluation(e.to_string()))
        };
        let gmu = shaped(&[k], gx.iter().map(|v| -v).collect())?;
        Ok((shaped(&[k], gx)?, gmu, shaped(&[k, k], gc)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn finite_diff(g: &Graph, cost: NodeId, x: NodeId, at: &ArrayD<f64>) -> ArrayD<f64> {
        let eps = 1e-6;
        let mut out = ArrayD::zeros(at.raw_dim());
        for (i, slot) in out.iter_mut().enumerate() {
            let mut plus = at.clone();
            let mut minus = at.clone();
            *plus.iter_mut().nth(i).unwrap() += eps;
            *minus.iter_mut().nth(i).unwrap() -= eps;
            let fp = evaluate_scalar(g, cost, &HashMap::from([(x, plus)])).unwrap();
            let fm = evaluate_scalar(g, cost, &HashMap::from([(x, minus)])).unwrap();
            *slot = (fp - fm) / (2.0 * eps);
        }
        out
    }

    #[test]
    fn test_broadcasting_eval() {
        let mut g = Graph::new();
        let a = g.constant(array![[1.0], [2.0]].into_dyn());
        let b = g.constant(array![10.0, 20.0, 30.0].into_dyn());
        let c = g.add(a, b);
        let out = evaluate(&mut g, &[c], &Givens::new()).unwrap();
        assert_eq!(out[0].shape(), &[2, 3]);
        assert_eq!(out[0][[1, 2]], 32.0);
        assert_eq!(infer_shape(&g, c, &Givens::new()).unwrap(), vec![2, 3]);
    }

    #[test]
    fn test_gradient_finite_diff() {
        let mut g = Graph::new();
        let x = g.input("x", 1);
        let c = g.constant(array![[1.0], [2.0]].into_dyn());
        let ex = g.exp(x);
        let scaled = g.mul(ex, c);
        let sq = g.square(x);
        let sp = g.softplus(x);
        let lg = g.unary(UnaryOp::LnGamma, ex);
        let zero = g.scalar(0.0);
        let pos = g.gt(x, zero);
        let sw = g.switch(pos, sq, sp);
        let t1 = g.add(scaled, sw);
        let t2 = g.add(t1, lg);
        let picked = g.index(t2, vec![vec![1, 0], vec![0, 2]]).unwrap();
        let cost = g.sum(picked);

        let at = array![0.3, 1.2, -0.5].into_dyn();
        let givens = HashMap::from([(x, at.clone())]);
        let (_, grads) = grad(&g, cost, &[x], &givens).unwrap();
        let numerical = finite_diff(&g, cost, x, &at);
        for (a, n) in grads[0].iter().zip(numerical.iter()) {
            assert!((a - n).abs() < 1e-4, "analytic={}, numerical={}", a, n);
        }
    }

    #[test]
    fn test_set_subtensor_gradient() {
        let mut g = Graph::new();
        let x = g.input("x", 1);
        let base = g.constant(ArrayD::zeros(IxDyn(&[4])));
        let filled = g.set_subtensor(base, vec![vec![0, 3]], x).unwrap();
        let sq = g.square(filled);
        let cost = g.sum(sq);

        let at = array![1.5, -2.0].into_dyn();
        let givens = HashMap::from([(x, at)]);
        let mut ev = Evaluator::new(&g, &givens);
        assert_eq!(ev.value(filled).unwrap(), &array![1.5, 0.0, 0.0, -2.0].into_dyn());
        let (val, grads) = grad(&g, cost, &[x], &givens).unwrap();
        assert!((val - 6.25).abs() < 1e-12);
        assert_eq!(grads[0], array![3.0, -4.0].into_dyn());
    }

    #[test]
    fn test_mvnormal_matches_independent_normals() {
        let mut g = Graph::new();
        let x = g.input("x", 1);
        let mu = g.constant(array![0.0, 1.0].into_dyn());
        let cov = g.constant(array![[1.0, 0.0], [0.0, 4.0]].into_dyn());
        let lp = g.mv_normal_logp(x, mu, cov);

        let at = array![0.5, -1.0].into_dyn();
        let givens = HashMap::from([(x, at.clone())]);
        let (val, grads) = grad(&g, lp, &[x], &givens).unwrap();
        let norm = |v: f64, m: f64, s: f64| -0.5 * ((v - m) / s).powi(2) - s.ln() - 0.5 * std::f64::consts::TAU.ln();
        let expected = norm(0.5, 0.0, 1.0) + norm(-1.0, 1.0, 2.0);
        assert!((val - expected).abs() < 1e-10);
        assert!((grads[0][0] + 0.5).abs() < 1e-10);
        assert!((grads[0][1] - 0.5).abs() < 1e-10);
    }

    #[test]
    fn test_mvnormal_covariance_gradient() {
        let mut g = Graph::new();
        let cov = g.input("cov", 2);
        let x = g.constant(array![0.3, -0.7].into_dyn());
        let mu = g.constant(array![0.0, 0.0].into_dyn());
        let lp = g.mv_normal_logp(x, mu, cov);
        let at = array![[2.0, 0.3], [0.3, 1.0]].into_dyn();
        let (_, grads) = grad(&g, lp, &[cov], &HashMap::from([(cov, at.clone())])).unwrap();
        // The factorization reads the lower triangle only, so compare the
        // summed off-diagonal sensitivities.
        let numerical = finite_diff(&g, lp, cov, &at);
        assert!((grads[0][[0, 0]] - numerical[[0, 0]]).abs() < 1e-4);
        assert!((grads[0][[1, 1]] - numerical[[1, 1]]).abs() < 1e-4);
        let off = grads[0][[0, 1]] + grads[0][[1, 0]];
        let off_num = numerical[[0, 1]] + numerical[[1, 0]];
        assert!((off - off_num).abs() < 1e-4);
    }

    #[test]
    fn test_missing_input_is_reported() {
        let mut g = Graph::new();
        let x = g.input("x", 0);
        let y = g.exp(x);
        match evaluate(&mut g, &[y], &Givens::new()) {
            Err(ModelError::MissingInput(name)) => assert_eq!(name, "x"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_shape_of_follows_shared_data() {
        let mut g = Graph::new();
        let data = g.shared("data", ArrayD::zeros(IxDyn(&[3, 2])));
        let n = g.shape_of(data, 0).unwrap();
        let one = g.scalar(1.0);
        let b = g.broadcast_to(one, vec![n]).unwrap();
        assert_eq!(infer_shape(&g, b, &Givens::new()).unwrap(), vec![3]);
        g.set_shared(data, ArrayD::zeros(IxDyn(&[5, 2]))).unwrap();
        assert_eq!(infer_shape(&g, b, &Givens::new()).unwrap(), vec![5]);
    }
}
