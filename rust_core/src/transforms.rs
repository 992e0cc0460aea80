use crate::error::{ModelError, Result};
use crate::graph::{Graph, NodeId};
use serde::{Deserialize, Serialize};

/// Bijections from a constrained support onto the real line.
///
/// `forward` maps a value in the variable's support to the unconstrained
/// space, `backward` maps it back, and `log_jac_det` is
/// `log |d backward(y) / dy|` evaluated element-wise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Transform {
    /// Positive support.
    Log,
    /// Support `[params[0], params[1]]`, the first two kernel parameters.
    Interval,
}

impl Transform {
    pub fn name(&self) -> &'static str {
        match self {
            Transform::Log => "log",
            Transform::Interval => "interval",
        }
    }

    fn bounds(&self, params: &[NodeId]) -> Result<(NodeId, NodeId)> {
        match params {
            [lower, upper, ..] => Ok((*lower, *upper)),
            _ => Err(ModelError::InvalidArgument(
                "the interval transform needs lower and upper parameters".to_string(),
            )),
        }
    }

    pub fn forward(&self, g: &mut Graph, params: &[NodeId], x: NodeId) -> Result<NodeId> {
        match self {
            Transform::Log => Ok(g.log(x)),
            Transform::Interval => {
                let (a, b) = self.bounds(params)?;
                let xa = g.sub(x, a);
                let bx = g.sub(b, x);
                let num = g.log(xa);
                let den = g.log(bx);
                Ok(g.sub(num, den))
            }
        }
    }

    pub fn backward(&self, g: &mut Graph, params: &[NodeId], y: NodeId) -> Result<NodeId> {
        match self {
            Transform::Log => Ok(g.exp(y)),
            Transform::Interval => {
                let (a, b) = self.bounds(params)?;
                let width = g.sub(b, a);
                let s = g.sigmoid(y);
                let scaled = g.mul(width, s);
                Ok(g.add(a, scaled))
            }
        }
    }

    pub fn log_jac_det(&self, g: &mut Graph, params: &[NodeId], y: NodeId) -> Result<NodeId> {
        match self {
            Transform::Log => Ok(y),
            Transform::Interval => {
                // log(b - a) + log σ(y) + log(1 - σ(y))
                let (a, b) = self.bounds(params)?;
                let width = g.sub(b, a);
                let log_width = g.log(width);
                let neg_y = g.neg(y);
                let sp_pos = g.softplus(y);
                let sp_neg = g.softplus(neg_y);
                let tails = g.add(sp_pos, sp_neg);
                Ok(g.sub(log_width, tails))
            }
        }
    }
}

/// How a registered variable picks its transform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TransformSpec {
    /// The kernel's default transform, if any.
    #[default]
    Default,
    /// Keep the value variable in the constrained space.
    Disabled,
    Explicit(Transform),
}

impl From<Transform> for TransformSpec {
    fn from(t: Transform) -> Self {
        TransformSpec::Explicit(t)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autodiff::{evaluate_scalar, grad, Givens};
    use ndarray::arr0;

    fn roundtrip(t: Transform, params: &[f64], x: f64) {
        let mut g = Graph::new();
        let p: Vec<NodeId> = params.iter().map(|&v| g.scalar(v)).collect();
        let xn = g.scalar(x);
        let y = t.forward(&mut g, &p, xn).unwrap();
        let back = t.backward(&mut g, &p, y).unwrap();
        let v = evaluate_scalar(&g, back, &Givens::new()).unwrap();
        assert!((v - x).abs() < 1e-10, "{}: {} -> {}", t.name(), x, v);
    }

    #[test]
    fn test_transforms_invert() {
        roundtrip(Transform::Log, &[], 2.5);
        roundtrip(Transform::Interval, &[-1.0, 3.0], 0.7);
    }

    #[test]
    fn test_log_jacobian_matches_derivative() {
        for t in [Transform::Log, Transform::Interval] {
            let mut g = Graph::new();
            let p = vec![g.scalar(-1.0), g.scalar(3.0)];
            let y = g.input("y", 0);
            let x = t.backward(&mut g, &p, y).unwrap();
            let jac = t.log_jac_det(&mut g, &p, y).unwrap();

            let givens: Givens = [(y, arr0(0.4).into_dyn())].into_iter().collect();
            let (_, dx) = grad(&g, x, &[y], &givens).unwrap();
            let log_dx = dx[0].iter().next().unwrap().abs().ln();
            let j = evaluate_scalar(&g, jac, &givens).unwrap();
            assert!((log_dx - j).abs() < 1e-10, "{}: {} vs {}", t.name(), log_dx, j);
        }
    }
}
