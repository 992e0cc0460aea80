//! Splitting partially observed data into observed and imputed parts.

use crate::distribution::Kernel;
use crate::error::{ModelError, ModelWarning, Result};
use crate::graph::NodeId;
use crate::model::{Model, RegisterOptions};
use crate::transforms::TransformSpec;
use ndarray::{Array1, ArrayD, Dimension};

/// Per-axis coordinates of the entries where `mask` equals `missing`,
/// in row-major order.
fn positions(mask: &ArrayD<bool>, missing: bool) -> Vec<Vec<usize>> {
    let mut idx = vec![Vec::new(); mask.ndim()];
    for (pos, &m) in mask.indexed_iter() {
        if m == missing {
            for (axis, &i) in pos.slice().iter().enumerate() {
                idx[axis].push(i);
            }
        }
    }
    idx
}

/// A 1-d copy of `rv` restricted to the entries at `idx`.
fn restrict(model: &Model, rv: NodeId, kernel: &Kernel, idx: &[Vec<usize>]) -> Result<NodeId> {
    let mut g = model.graph_mut();
    let params = g
        .random_parts(rv)
        .map(|(_, p, _)| p.to_vec())
        .ok_or_else(|| ModelError::InvalidArgument(format!("`{}` is not a random variable", g.describe(rv))))?;
    let shape = g.shape_nodes(rv)?;
    let mut picked = Vec::with_capacity(params.len());
    for p in params {
        let full = g.broadcast_to(p, shape.clone())?;
        picked.push(g.index(full, idx.to_vec())?);
    }
    let n = g.scalar(idx.first().map_or(0, Vec::len) as f64);
    g.random(kernel, &picked, &[n])
}

/// Register `rv` with partially missing `data`.
///
/// The missing entries become a free variable `{name}_missing`, the others
/// an observed variable `{name}_observed`. Both are scattered back into
/// the full shape by an automatic deterministic named `name`, which is
/// returned.
pub(crate) fn split_missing(
    model: &Model,
    rv: NodeId,
    name: &str,
    data: ArrayD<f64>,
    mask: ArrayD<bool>,
    dims: Option<Vec<Option<String>>>,
    transform: TransformSpec,
) -> Result<NodeId> {
    let kernel = model.kernel_of(rv)?;
    if kernel.ndim_supp != 0 {
        return Err(ModelError::InvalidArgument(format!(
            "Missing values can only be imputed for variables with scalar support, '{name}' is {}",
            kernel.name
        )));
    }
    if mask.shape() != data.shape() {
        return Err(ModelError::shape("mask and data differ in shape", mask.shape(), data.shape()));
    }
    model.graph_mut().warn(ModelWarning::Imputation(format!(
        "Data in {name} contains missing values and will be automatically imputed from the sampling distribution."
    )));

    let missing_idx = positions(&mask, true);
    let observed_idx = positions(&mask, false);

    let missing_rv = restrict(model, rv, &kernel, &missing_idx)?;
    model.register_rv(
        missing_rv,
        &format!("{name}_missing"),
        RegisterOptions {
            transform,
            ..Default::default()
        },
    )?;

    let observed_rv = restrict(model, rv, &kernel, &observed_idx)?;
    let observed: Vec<f64> = data
        .iter()
        .zip(mask.iter())
        .filter(|(_, &m)| !m)
        .map(|(&v, _)| v)
        .collect();
    let observed_data = {
        let mut g = model.graph_mut();
        g.set_name(observed_rv, model.name_for(&format!("{name}_observed")));
        g.constant(Array1::from(observed).into_dyn())
    };
    model.attach_observations(observed_rv, observed_data, None)?;

    let combined = {
        let mut g = model.graph_mut();
        let zeros = g.constant(ArrayD::zeros(data.raw_dim()));
        let with_missing = g.set_subtensor(zeros, missing_idx, missing_rv)?;
        g.set_subtensor(with_missing, observed_idx, observed_rv)?
    };
    log::debug!("split '{name}' into observed and imputed parts");
    model.add_deterministic(name, combined, dims.as_deref(), true)
}

#[cfg(test)]
mod tests {
    use crate::autodiff::{infer_shape, Givens};
    use crate::config::ModelConfig;
    use crate::distribution::VarOptions;
    use crate::distributions::{MvNormal, Normal};
    use crate::error::{ModelError, ModelWarning};
    use crate::model::{Model, ObservedData};
    use ndarray::{array, Array2, ArrayD};

    #[test]
    fn test_missing_values_are_imputed() {
        let model = Model::new(ModelConfig::default()).unwrap();
        let _guard = model.enter();
        let data = array![1.0, f64::NAN, 3.0].into_dyn();
        let y = Normal::var("y", 0.0, 1.0, VarOptions::default().observed(data)).unwrap();

        let g = model.graph();
        assert_eq!(g.describe(y), "y");
        let missing = model.free_rvs();
        let observed = model.observed_rvs();
        assert_eq!(missing.len(), 1);
        assert_eq!(observed.len(), 1);
        assert_eq!(g.describe(missing[0]), "y_missing");
        assert_eq!(g.describe(observed[0]), "y_observed");
        let shape = |n| infer_shape(&g, n, &Givens::new()).unwrap();
        assert_eq!(shape(missing[0]), vec![1]);
        assert_eq!(shape(observed[0]), vec![2]);
        assert_eq!(shape(y), vec![3]);
        assert_eq!(model.auto_deterministics(), vec![y]);
        assert!(matches!(g.warnings(), [ModelWarning::Imputation(m)] if m.contains("Data in y")));
        drop(g);

        let mut point = model.initial_point().unwrap();
        point.insert("y_missing".to_string(), array![-2.0].into_dyn());
        assert_eq!(model.eval(y, Some(&point)).unwrap(), array![1.0, -2.0, 3.0].into_dyn());
    }

    #[test]
    fn test_fully_missing_data_is_free() {
        let model = Model::new(ModelConfig::default()).unwrap();
        let _guard = model.enter();
        let data = array![f64::NAN, f64::NAN].into_dyn();
        let y = Normal::var("y", 0.0, 1.0, VarOptions::default().observed(data)).unwrap();
        assert_eq!(model.free_rvs(), vec![y]);
        assert!(model.observed_rvs().is_empty());
    }

    #[test]
    fn test_explicit_mask() {
        let model = Model::new(ModelConfig::default()).unwrap();
        let _guard = model.enter();
        let data = array![[1.0, 2.0], [3.0, 4.0]].into_dyn();
        let mask = array![[false, true], [true, false]].into_dyn();
        let obs = ObservedData::masked(data, mask).unwrap();
        Normal::var("y", 0.0, 1.0, VarOptions::default().observed(obs)).unwrap();
        let missing = model.get("y_missing").unwrap();
        let shape = infer_shape(&model.graph(), missing, &Givens::new()).unwrap();
        assert_eq!(shape, vec![2]);
    }

    #[test]
    fn test_multivariate_missing_values_are_rejected() {
        let model = Model::new(ModelConfig::default()).unwrap();
        let _guard = model.enter();
        let mu: ArrayD<f64> = ArrayD::zeros(ndarray::IxDyn(&[2]));
        let cov = Array2::<f64>::eye(2).into_dyn();
        let data = array![[0.0, f64::NAN]].into_dyn();
        let err = MvNormal::var("v", mu, cov, VarOptions::default().observed(data));
        assert!(matches!(err, Err(ModelError::InvalidArgument(_))));
    }
}
