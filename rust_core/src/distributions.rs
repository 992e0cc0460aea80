use crate::distribution::{
    dist, draw_elementwise, new_var, register_kernel, DistOptions, Kernel, LogpFn, Param, VarOptions,
};
use crate::error::{ModelError, Result};
use crate::graph::{BinaryOp, Graph, NodeId, UnaryOp};
use crate::transforms::Transform;
use nalgebra::{Cholesky, DMatrix, DVector};
use ndarray::{ArrayD, IxDyn};
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution as _, Gamma as GammaDist, Normal as NormalDist, Poisson as PoissonDist, StandardNormal};
use std::f64::consts::{PI, TAU};
use std::sync::Arc;

pub(crate) fn builtin_kernels() -> Vec<Kernel> {
    vec![
        Normal::kernel(),
        HalfNormal::kernel(),
        Uniform::kernel(),
        Gamma::kernel(),
        Poisson::kernel(),
        MvNormal::kernel(),
    ]
}

fn arity(name: &str, n: usize) -> ModelError {
    ModelError::InvalidArgument(format!("{name} takes {n} parameters"))
}

fn sample_error(e: impl std::fmt::Display) -> ModelError {
    ModelError::Evaluation(e.to_string())
}

/// Replace `logp` by `-inf` wherever one of `conds` fails.
fn bounded(g: &mut Graph, logp: NodeId, conds: &[NodeId], check_bounds: bool) -> NodeId {
    if !check_bounds || conds.is_empty() {
        return logp;
    }
    let all = conds[1..].iter().fold(conds[0], |acc, &c| g.mul(acc, c));
    g.bound(logp, all)
}

// ── Normal (unconstrained) ──────────────────────────────────────────

pub struct Normal;

impl Normal {
    pub const NAME: &'static str = "Normal";

    pub fn dist(g: &mut Graph, mu: impl Into<Param>, sigma: impl Into<Param>, opts: DistOptions) -> Result<NodeId> {
        dist(g, Self::NAME, vec![mu.into(), sigma.into()], opts)
    }

    pub fn var(name: &str, mu: impl Into<Param>, sigma: impl Into<Param>, opts: VarOptions) -> Result<NodeId> {
        new_var(name, Self::NAME, vec![mu.into(), sigma.into()], opts)
    }

    fn kernel() -> Kernel {
        Kernel {
            name: Self::NAME.to_string(),
            ndim_supp: 0,
            ndims_params: vec![0, 0],
            discrete: false,
            logp: Self::logp,
            logcdf: Some(Self::logcdf),
            draw: Some(Self::draw),
            support_shape: None,
            default_transform: None,
        }
    }

    fn logp(g: &mut Graph, value: NodeId, params: &[NodeId], check_bounds: bool) -> Result<NodeId> {
        let &[mu, sigma] = params else {
            return Err(arity(Self::NAME, 2));
        };
        // -0.5 * ((x - mu) / sigma)^2 - ln(sigma) - 0.5 * ln(2π)
        let diff = g.sub(value, mu);
        let z = g.div(diff, sigma);
        let z2 = g.square(z);
        let half = g.scalar(-0.5);
        let quad = g.mul(half, z2);
        let log_sigma = g.log(sigma);
        let norm = g.scalar(0.5 * TAU.ln());
        let partial = g.sub(quad, log_sigma);
        let logp = g.sub(partial, norm);

        let zero = g.scalar(0.0);
        let positive = g.gt(sigma, zero);
        Ok(bounded(g, logp, &[positive], check_bounds))
    }

    fn logcdf(g: &mut Graph, value: NodeId, params: &[NodeId], _check_bounds: bool) -> Result<NodeId> {
        let &[mu, sigma] = params else {
            return Err(arity(Self::NAME, 2));
        };
        // ln(0.5 * (1 + erf((x - mu) / (sigma * sqrt(2)))))
        let diff = g.sub(value, mu);
        let sqrt2 = g.scalar(std::f64::consts::SQRT_2);
        let scale = g.mul(sigma, sqrt2);
        let z = g.div(diff, scale);
        let e = g.unary(UnaryOp::Erf, z);
        let cdf = g.unary(UnaryOp::Log1p, e);
        let ln_half = g.scalar(0.5f64.ln());
        Ok(g.add(cdf, ln_half))
    }

    fn draw(params: &[&ArrayD<f64>], batch: &[usize], rng: &mut ChaCha8Rng) -> Result<ArrayD<f64>> {
        draw_elementwise(params, batch, rng, |p, rng| {
            Ok(NormalDist::new(p[0], p[1]).map_err(sample_error)?.sample(rng))
        })
    }
}

// ── HalfNormal (x >= 0, log-transform) ─────────────────────────────

pub struct HalfNormal;

impl HalfNormal {
    pub const NAME: &'static str = "HalfNormal";

    pub fn dist(g: &mut Graph, sigma: impl Into<Param>, opts: DistOptions) -> Result<NodeId> {
        dist(g, Self::NAME, vec![sigma.into()], opts)
    }

    pub fn var(name: &str, sigma: impl Into<Param>, opts: VarOptions) -> Result<NodeId> {
        new_var(name, Self::NAME, vec![sigma.into()], opts)
    }

    fn kernel() -> Kernel {
        Kernel {
            name: Self::NAME.to_string(),
            ndim_supp: 0,
            ndims_params: vec![0],
            discrete: false,
            logp: Self::logp,
            logcdf: None,
            draw: Some(Self::draw),
            support_shape: None,
            default_transform: Some(Transform::Log),
        }
    }

    fn logp(g: &mut Graph, value: NodeId, params: &[NodeId], check_bounds: bool) -> Result<NodeId> {
        let &[sigma] = params else {
            return Err(arity(Self::NAME, 1));
        };
        // 0.5 * ln(2/π) - ln(sigma) - 0.5 * (x / sigma)^2
        let z = g.div(value, sigma);
        let z2 = g.square(z);
        let half = g.scalar(-0.5);
        let quad = g.mul(half, z2);
        let log_sigma = g.log(sigma);
        let norm = g.scalar(0.5 * (2.0 / PI).ln());
        let partial = g.sub(norm, log_sigma);
        let logp = g.add(partial, quad);

        let zero = g.scalar(0.0);
        let nonneg = g.ge(value, zero);
        let positive = g.gt(sigma, zero);
        Ok(bounded(g, logp, &[nonneg, positive], check_bounds))
    }

    fn draw(params: &[&ArrayD<f64>], batch: &[usize], rng: &mut ChaCha8Rng) -> Result<ArrayD<f64>> {
        draw_elementwise(params, batch, rng, |p, rng| {
            Ok(NormalDist::new(0.0, p[0]).map_err(sample_error)?.sample(rng).abs())
        })
    }
}

// ── Uniform (lower <= x <= upper, interval-transform) ──────────────

pub struct Uniform;

impl Uniform {
    pub const NAME: &'static str = "Uniform";

    pub fn dist(g: &mut Graph, lower: impl Into<Param>, upper: impl Into<Param>, opts: DistOptions) -> Result<NodeId> {
        dist(g, Self::NAME, vec![lower.into(), upper.into()], opts)
    }

    pub fn var(name: &str, lower: impl Into<Param>, upper: impl Into<Param>, opts: VarOptions) -> Result<NodeId> {
        new_var(name, Self::NAME, vec![lower.into(), upper.into()], opts)
    }

    fn kernel() -> Kernel {
        Kernel {
            name: Self::NAME.to_string(),
            ndim_supp: 0,
            ndims_params: vec![0, 0],
            discrete: false,
            logp: Self::logp,
            logcdf: Some(Self::logcdf),
            draw: Some(Self::draw),
            support_shape: None,
            default_transform: Some(Transform::Interval),
        }
    }

    fn logp(g: &mut Graph, value: NodeId, params: &[NodeId], check_bounds: bool) -> Result<NodeId> {
        let &[lower, upper] = params else {
            return Err(arity(Self::NAME, 2));
        };
        // -ln(upper - lower), broadcast against the value
        let width = g.sub(upper, lower);
        let log_width = g.log(width);
        let zero = g.scalar(0.0);
        let flat = g.mul(value, zero);
        let logp = g.sub(flat, log_width);

        let above = g.ge(value, lower);
        let below = g.le(value, upper);
        Ok(bounded(g, logp, &[above, below], check_bounds))
    }

    fn logcdf(g: &mut Graph, value: NodeId, params: &[NodeId], _check_bounds: bool) -> Result<NodeId> {
        let &[lower, upper] = params else {
            return Err(arity(Self::NAME, 2));
        };
        let offset = g.sub(value, lower);
        let width = g.sub(upper, lower);
        let frac = g.div(offset, width);
        let inside = g.log(frac);
        let zero = g.scalar(0.0);
        let neg_inf = g.scalar(f64::NEG_INFINITY);
        let past = g.gt(value, upper);
        let capped = g.switch(past, zero, inside);
        let before = g.binary(BinaryOp::Lt, value, lower);
        Ok(g.switch(before, neg_inf, capped))
    }

    fn draw(params: &[&ArrayD<f64>], batch: &[usize], rng: &mut ChaCha8Rng) -> Result<ArrayD<f64>> {
        draw_elementwise(params, batch, rng, |p, rng| {
            if !(p[0] < p[1]) {
                return Err(ModelError::Evaluation(format!(
                    "Uniform needs lower < upper, got [{}, {}]",
                    p[0], p[1]
                )));
            }
            Ok(p[0] + (p[1] - p[0]) * rng.gen::<f64>())
        })
    }
}

// ── Gamma (x > 0, log-transform) ───────────────────────────────────

pub struct Gamma;

impl Gamma {
    pub const NAME: &'static str = "Gamma";

    /// Shape `alpha`, rate `beta`.
    pub fn dist(g: &mut Graph, alpha: impl Into<Param>, beta: impl Into<Param>, opts: DistOptions) -> Result<NodeId> {
        dist(g, Self::NAME, vec![alpha.into(), beta.into()], opts)
    }

    pub fn var(name: &str, alpha: impl Into<Param>, beta: impl Into<Param>, opts: VarOptions) -> Result<NodeId> {
        new_var(name, Self::NAME, vec![alpha.into(), beta.into()], opts)
    }

    fn kernel() -> Kernel {
        Kernel {
            name: Self::NAME.to_string(),
            ndim_supp: 0,
            ndims_params: vec![0, 0],
            discrete: false,
            logp: Self::logp,
            logcdf: None,
            draw: Some(Self::draw),
            support_shape: None,
            default_transform: Some(Transform::Log),
        }
    }

    fn logp(g: &mut Graph, value: NodeId, params: &[NodeId], check_bounds: bool) -> Result<NodeId> {
        let &[alpha, beta] = params else {
            return Err(arity(Self::NAME, 2));
        };
        // alpha * ln(beta) - lnΓ(alpha) + (alpha - 1) * ln(x) - beta * x
        let log_beta = g.log(beta);
        let a_log_b = g.mul(alpha, log_beta);
        let lg = g.unary(UnaryOp::LnGamma, alpha);
        let norm = g.sub(a_log_b, lg);
        let one = g.scalar(1.0);
        let am1 = g.sub(alpha, one);
        let log_x = g.log(value);
        let shape_term = g.mul(am1, log_x);
        let rate_term = g.mul(beta, value);
        let kernel = g.sub(shape_term, rate_term);
        let logp = g.add(norm, kernel);

        let zero = g.scalar(0.0);
        let pos_x = g.gt(value, zero);
        let pos_a = g.gt(alpha, zero);
        let pos_b = g.gt(beta, zero);
        Ok(bounded(g, logp, &[pos_x, pos_a, pos_b], check_bounds))
    }

    fn draw(params: &[&ArrayD<f64>], batch: &[usize], rng: &mut ChaCha8Rng) -> Result<ArrayD<f64>> {
        draw_elementwise(params, batch, rng, |p, rng| {
            Ok(GammaDist::new(p[0], 1.0 / p[1]).map_err(sample_error)?.sample(rng))
        })
    }
}

// ── Poisson (discrete, x >= 0) ─────────────────────────────────────

pub struct Poisson;

impl Poisson {
    pub const NAME: &'static str = "Poisson";

    pub fn dist(g: &mut Graph, mu: impl Into<Param>, opts: DistOptions) -> Result<NodeId> {
        dist(g, Self::NAME, vec![mu.into()], opts)
    }

    pub fn var(name: &str, mu: impl Into<Param>, opts: VarOptions) -> Result<NodeId> {
        new_var(name, Self::NAME, vec![mu.into()], opts)
    }

    fn kernel() -> Kernel {
        Kernel {
            name: Self::NAME.to_string(),
            ndim_supp: 0,
            ndims_params: vec![0],
            discrete: true,
            logp: Self::logp,
            logcdf: None,
            draw: Some(Self::draw),
            support_shape: None,
            default_transform: None,
        }
    }

    fn logp(g: &mut Graph, value: NodeId, params: &[NodeId], check_bounds: bool) -> Result<NodeId> {
        let &[mu] = params else {
            return Err(arity(Self::NAME, 1));
        };
        // x * ln(mu) - mu - lnΓ(x + 1)
        let log_mu = g.log(mu);
        let x_log_mu = g.mul(value, log_mu);
        let one = g.scalar(1.0);
        let xp1 = g.add(value, one);
        let log_fact = g.unary(UnaryOp::LnGamma, xp1);
        let partial = g.sub(x_log_mu, mu);
        let logp = g.sub(partial, log_fact);

        let zero = g.scalar(0.0);
        let nonneg = g.ge(value, zero);
        let rate = g.ge(mu, zero);
        Ok(bounded(g, logp, &[nonneg, rate], check_bounds))
    }

    fn draw(params: &[&ArrayD<f64>], batch: &[usize], rng: &mut ChaCha8Rng) -> Result<ArrayD<f64>> {
        draw_elementwise(params, batch, rng, |p, rng| {
            if p[0] == 0.0 {
                return Ok(0.0);
            }
            Ok(PoissonDist::new(p[0]).map_err(sample_error)?.sample(rng))
        })
    }
}

// ── MvNormal (vector support) ──────────────────────────────────────

pub struct MvNormal;

impl MvNormal {
    pub const NAME: &'static str = "MvNormal";

    pub fn dist(g: &mut Graph, mu: impl Into<Param>, cov: impl Into<Param>, opts: DistOptions) -> Result<NodeId> {
        dist(g, Self::NAME, vec![mu.into(), cov.into()], opts)
    }

    pub fn var(name: &str, mu: impl Into<Param>, cov: impl Into<Param>, opts: VarOptions) -> Result<NodeId> {
        new_var(name, Self::NAME, vec![mu.into(), cov.into()], opts)
    }

    fn kernel() -> Kernel {
        Kernel {
            name: Self::NAME.to_string(),
            ndim_supp: 1,
            ndims_params: vec![1, 2],
            discrete: false,
            logp: Self::logp,
            logcdf: None,
            draw: Some(Self::draw),
            support_shape: Some(Self::support_shape),
            default_transform: None,
        }
    }

    fn support_shape(param_shapes: &[Vec<usize>]) -> Result<Vec<usize>> {
        let (mu, cov) = match param_shapes {
            [mu, cov] => (mu, cov),
            _ => return Err(arity(Self::NAME, 2)),
        };
        let k = mu.last().copied().unwrap_or(0);
        if cov.len() < 2 || cov[cov.len() - 1] != k || cov[cov.len() - 2] != k {
            return Err(ModelError::shape("MvNormal covariance must be k x k", cov, (k, k)));
        }
        Ok(vec![k])
    }

    fn logp(g: &mut Graph, value: NodeId, params: &[NodeId], _check_bounds: bool) -> Result<NodeId> {
        let &[mu, cov] = params else {
            return Err(arity(Self::NAME, 2));
        };
        Ok(g.mv_normal_logp(value, mu, cov))
    }

    fn draw(params: &[&ArrayD<f64>], batch: &[usize], rng: &mut ChaCha8Rng) -> Result<ArrayD<f64>> {
        let shapes: Vec<Vec<usize>> = params.iter().map(|p| p.shape().to_vec()).collect();
        let k = Self::support_shape(&shapes)?[0];
        let core = |extra: &[usize]| -> Vec<usize> { batch.iter().chain(extra.iter()).copied().collect() };
        let mu: Vec<f64> = params[0]
            .broadcast(IxDyn(&core(&[k])))
            .map(|b| b.iter().copied().collect())
            .ok_or_else(|| ModelError::shape("cannot broadcast MvNormal mean", params[0].shape(), core(&[k])))?;
        let cov: Vec<f64> = params[1]
            .broadcast(IxDyn(&core(&[k, k])))
            .map(|b| b.iter().copied().collect())
            .ok_or_else(|| ModelError::shape("cannot broadcast MvNormal covariance", params[1].shape(), core(&[k, k])))?;

        let n: usize = batch.iter().product();
        let mut out = Vec::with_capacity(n * k);
        for b in 0..n {
            let m = DMatrix::from_row_slice(k, k, &cov[b * k * k..(b + 1) * k * k]);
            let chol = Cholesky::new(m)
                .ok_or_else(|| ModelError::Evaluation("MvNormal covariance is not positive definite".to_string()))?;
            let z = DVector::from_iterator(k, (0..k).map(|_| rng.sample::<f64, _>(StandardNormal)));
            let x = chol.l() * z;
            out.extend((0..k).map(|i| mu[b * k + i] + x[i]));
        }
        ArrayD::from_shape_vec(IxDyn(&core(&[k])), out).map_err(|e| ModelError::Evaluation(e.to_string()))
    }
}

// ── DensityDist (user log-density) ─────────────────────────────────

/// Distribution defined by a user log-density. It cannot be sampled, so
/// free variables need a `testval`.
pub struct DensityDist;

impl DensityDist {
    /// Register `logp` as a scalar-support kernel named `name`.
    pub fn register(name: &str, n_params: usize, logp: LogpFn) -> Arc<Kernel> {
        register_kernel(Kernel {
            name: name.to_string(),
            ndim_supp: 0,
            ndims_params: vec![0; n_params],
            discrete: false,
            logp,
            logcdf: None,
            draw: None,
            support_shape: None,
            default_transform: None,
        })
    }

    pub fn var(name: &str, kernel: &str, params: Vec<Param>, opts: VarOptions) -> Result<NodeId> {
        new_var(name, kernel, params, opts)
    }
}
