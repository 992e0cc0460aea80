//! Log-density terms of registered random variables.
//!
//! Every term is first built against the random variable's own parameters
//! and then rewritten so that each registered random variable is replaced
//! by what stands for it in log-density space: the (back-transformed) value
//! variable of a free variable, or the data of an observed one.

use crate::distribution::get_kernel;
use crate::error::{ModelError, Result};
use crate::graph::{Graph, NodeId};
use crate::transforms::Transform;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Size of the full data set when a variable only sees a minibatch.
///
/// The log-density of the variable is scaled by `total / actual` along the
/// listed axes so that it estimates the full-data log-density.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TotalSize {
    /// Total length of the leading axis.
    Leading(usize),
    /// Totals for the leading axes; `None` leaves an axis unscaled.
    Axes(Vec<Option<usize>>),
    /// Totals for leading (`begin`) and trailing (`end`) axes, with any
    /// number of unscaled axes in between.
    Split {
        begin: Vec<Option<usize>>,
        end: Vec<Option<usize>>,
    },
}

impl From<usize> for TotalSize {
    fn from(n: usize) -> Self {
        TotalSize::Leading(n)
    }
}

impl From<Vec<Option<usize>>> for TotalSize {
    fn from(v: Vec<Option<usize>>) -> Self {
        TotalSize::Axes(v)
    }
}

impl From<Vec<usize>> for TotalSize {
    fn from(v: Vec<usize>) -> Self {
        TotalSize::Axes(v.into_iter().map(Some).collect())
    }
}

/// What a random variable turns into inside log-density graphs.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Binding {
    /// A free variable: its value variable, living in the unconstrained
    /// space when a transform is attached.
    Value {
        value: NodeId,
        transform: Option<Transform>,
    },
    /// An observed variable: its data node.
    Observed(NodeId),
}

impl Binding {
    pub fn value(&self) -> NodeId {
        match self {
            Binding::Value { value, .. } => *value,
            Binding::Observed(data) => *data,
        }
    }

    pub fn transform(&self) -> Option<Transform> {
        match self {
            Binding::Value { transform, .. } => *transform,
            Binding::Observed(_) => None,
        }
    }
}

pub type Bindings = HashMap<NodeId, Binding>;

/// Switches for a single log-density term.
#[derive(Debug, Clone, Copy)]
pub struct LogpOptions {
    /// Add `log |d backward / dy|` for transformed value variables.
    pub jacobian: bool,
    /// Map values outside the support to `-inf`.
    pub check_bounds: bool,
}

impl Default for LogpOptions {
    fn default() -> Self {
        Self {
            jacobian: true,
            check_bounds: true,
        }
    }
}

/// Replace every bound random variable in the graphs of `outputs`.
///
/// Free variables become their value variable (mapped back through the
/// transform, whose parameters are rewritten as well) and observed ones
/// become their data.
pub fn rvs_to_values(g: &mut Graph, outputs: &[NodeId], bindings: &Bindings) -> Result<Vec<NodeId>> {
    g.rewrite(outputs, |g, id, mapped| match bindings.get(&id) {
        None => Ok(None),
        Some(Binding::Observed(data)) => Ok(Some(*data)),
        Some(Binding::Value {
            value,
            transform: None,
        }) => Ok(Some(*value)),
        Some(Binding::Value {
            value,
            transform: Some(t),
        }) => {
            let n_params = g.random_parts(id).map_or(0, |(_, p, _)| p.len());
            t.backward(g, &mapped[..n_params], *value).map(Some)
        }
    })
}

/// `total / actual` for the axes listed in `total_size`, as a scalar node.
pub fn scaling(g: &mut Graph, total_size: &TotalSize, value: NodeId) -> Result<NodeId> {
    let ndim = g.ndim(value);
    let (begin, end): (Vec<Option<usize>>, Vec<Option<usize>>) = match total_size {
        TotalSize::Leading(n) => {
            if ndim == 0 {
                return Ok(g.scalar(*n as f64));
            }
            (vec![Some(*n)], Vec::new())
        }
        TotalSize::Axes(v) => (v.clone(), Vec::new()),
        TotalSize::Split { begin, end } => (begin.clone(), end.clone()),
    };
    if begin.len() + end.len() > ndim {
        return Err(ModelError::shape(
            format!("Length of `total_size` is too big, number of scalings is bigger than ndim, got {total_size:?}"),
            begin.len() + end.len(),
            ndim,
        ));
    }

    let axes = begin
        .iter()
        .enumerate()
        .chain(end.iter().enumerate().map(|(i, t)| (ndim - end.len() + i, t)));
    let mut coef = g.scalar(1.0);
    for (axis, total) in axes {
        if let Some(total) = total {
            let total = g.scalar(*total as f64);
            let actual = g.shape_of(value, axis)?;
            let ratio = g.div(total, actual);
            coef = g.mul(coef, ratio);
        }
    }
    Ok(coef)
}

/// Summed log-density of a bound random variable against its value
/// variable or data, expressed entirely in log-density space.
pub fn logpt_sum(
    g: &mut Graph,
    rv: NodeId,
    bindings: &Bindings,
    total_size: Option<&TotalSize>,
    opts: LogpOptions,
) -> Result<NodeId> {
    let binding = *bindings
        .get(&rv)
        .ok_or_else(|| ModelError::UnknownVariable(g.describe(rv)))?;
    let (kernel, params) = g
        .random_parts(rv)
        .map(|(k, p, _)| (k.to_string(), p.to_vec()))
        .ok_or_else(|| ModelError::InvalidArgument(format!("`{}` is not a random variable", g.describe(rv))))?;
    let kernel = get_kernel(&kernel)?;

    let value = binding.value();
    let x = match binding.transform() {
        Some(t) => t.backward(g, &params, value)?,
        None => value,
    };
    let mut terms = vec![(kernel.logp)(g, x, &params, opts.check_bounds)?];
    if let (true, Some(t)) = (opts.jacobian, binding.transform()) {
        terms.push(t.log_jac_det(g, &params, value)?);
    }
    let mut logp = g.sum_all(&terms);
    if let Some(ts) = total_size {
        let coef = scaling(g, ts, value)?;
        logp = g.mul(logp, coef);
    }
    Ok(rvs_to_values(g, &[logp], bindings)?[0])
}

/// Log-CDF of `rv` evaluated at `value`, with random parameters rewritten
/// into log-density space.
pub fn logcdf(g: &mut Graph, rv: NodeId, value: NodeId, bindings: &Bindings) -> Result<NodeId> {
    let (kernel, params) = g
        .random_parts(rv)
        .map(|(k, p, _)| (k.to_string(), p.to_vec()))
        .ok_or_else(|| ModelError::InvalidArgument(format!("`{}` is not a random variable", g.describe(rv))))?;
    let kernel = get_kernel(&kernel)?;
    let logcdf = kernel
        .logcdf
        .ok_or_else(|| ModelError::InvalidArgument(format!("{} has no log-CDF", kernel.name)))?;
    let out = logcdf(g, value, &params, true)?;
    Ok(rvs_to_values(g, &[out], bindings)?[0])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autodiff::{evaluate_scalar, Givens};
    use crate::distribution::{dist, DistOptions};
    use ndarray::{arr0, Array, ArrayD, IxDyn};

    fn normal(g: &mut Graph, mu: NodeId, sigma: f64, opts: DistOptions) -> NodeId {
        dist(g, "Normal", vec![mu.into(), sigma.into()], opts).unwrap()
    }

    #[test]
    fn test_parent_rv_is_replaced_by_value() {
        let mut g = Graph::new();
        let zero = g.scalar(0.0);
        let mu = normal(&mut g, zero, 1.0, DistOptions::default());
        let x = normal(&mut g, mu, 1.0, DistOptions::default());
        let mu_v = g.input("mu", 0);
        let x_v = g.input("x", 0);
        let bindings: Bindings = [
            (mu, Binding::Value { value: mu_v, transform: None }),
            (x, Binding::Value { value: x_v, transform: None }),
        ]
        .into_iter()
        .collect();

        let lp = logpt_sum(&mut g, x, &bindings, None, LogpOptions::default()).unwrap();
        assert!(!g.ancestors(&[lp]).contains(&mu), "random parent left in the graph");

        let givens: Givens = [(mu_v, arr0(1.0).into_dyn()), (x_v, arr0(1.5).into_dyn())]
            .into_iter()
            .collect();
        let expected = -0.5 * 0.25 - 0.5 * std::f64::consts::TAU.ln();
        let v = evaluate_scalar(&g, lp, &givens).unwrap();
        assert!((v - expected).abs() < 1e-12, "{} vs {}", v, expected);
    }

    #[test]
    fn test_jacobian_term_is_optional() {
        let mut g = Graph::new();
        let rv = dist(&mut g, "HalfNormal", vec![1.0.into()], DistOptions::default()).unwrap();
        let y = g.input("x_log__", 0);
        let bindings: Bindings = [(
            rv,
            Binding::Value {
                value: y,
                transform: Some(Transform::Log),
            },
        )]
        .into_iter()
        .collect();
        let with = logpt_sum(&mut g, rv, &bindings, None, LogpOptions::default()).unwrap();
        let without = logpt_sum(
            &mut g,
            rv,
            &bindings,
            None,
            LogpOptions {
                jacobian: false,
                check_bounds: true,
            },
        )
        .unwrap();
        let givens: Givens = [(y, arr0(0.3).into_dyn())].into_iter().collect();
        let diff = evaluate_scalar(&g, with, &givens).unwrap() - evaluate_scalar(&g, without, &givens).unwrap();
        // log-transform Jacobian is y itself
        assert!((diff - 0.3).abs() < 1e-12, "jacobian {}", diff);
    }

    #[test]
    fn test_total_size_scales_by_ratio() {
        let mut g = Graph::new();
        let zero = g.scalar(0.0);
        let rv = normal(&mut g, zero, 1.0, DistOptions::default().size([4usize]));
        let data: ArrayD<f64> = Array::zeros(IxDyn(&[4]));
        let data = g.constant(data);
        let bindings: Bindings = [(rv, Binding::Observed(data))].into_iter().collect();

        let plain = logpt_sum(&mut g, rv, &bindings, None, LogpOptions::default()).unwrap();
        let scaled = logpt_sum(&mut g, rv, &bindings, Some(&TotalSize::Leading(100)), LogpOptions::default()).unwrap();
        let p = evaluate_scalar(&g, plain, &Givens::new()).unwrap();
        let s = evaluate_scalar(&g, scaled, &Givens::new()).unwrap();
        assert!((s - 25.0 * p).abs() < 1e-9, "{} vs 25 * {}", s, p);
    }

    #[test]
    fn test_scaling_with_split_axes() {
        let mut g = Graph::new();
        let x: ArrayD<f64> = Array::zeros(IxDyn(&[2, 3, 5]));
        let x = g.constant(x);
        let ts = TotalSize::Split {
            begin: vec![Some(10)],
            end: vec![None, Some(20)],
        };
        let coef = scaling(&mut g, &ts, x).unwrap();
        let v = evaluate_scalar(&g, coef, &Givens::new()).unwrap();
        assert!((v - 5.0 * 4.0).abs() < 1e-12);

        let too_long = TotalSize::Axes(vec![Some(1); 4]);
        assert!(matches!(scaling(&mut g, &too_long, x), Err(ModelError::Shape { .. })));
    }

    #[test]
    fn test_logcdf_requires_support() {
        let mut g = Graph::new();
        let zero = g.scalar(0.0);
        let rv = normal(&mut g, zero, 1.0, DistOptions::default());
        let at = g.scalar(0.0);
        let lc = logcdf(&mut g, rv, at, &Bindings::new()).unwrap();
        let v = evaluate_scalar(&g, lc, &Givens::new()).unwrap();
        assert!((v - 0.5f64.ln()).abs() < 1e-9);

        let pois = dist(&mut g, "Poisson", vec![3.0.into()], DistOptions::default()).unwrap();
        assert!(logcdf(&mut g, pois, at, &Bindings::new()).is_err());
    }
}
