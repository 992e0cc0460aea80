use bayesgraph_core::distribution::{Param, VarOptions};
use bayesgraph_core::distributions::{HalfNormal, Normal, Poisson, Uniform};
use bayesgraph_core::model::{CoordLabel, DimLength, Model, ObservedData, Point, ValueGradFunction};
use bayesgraph_core::{ModelConfig, ModelError, NodeId, Result};
use ndarray::{arr0, ArrayD};
use numpy::{IntoPyArray, PyArray1, PyArrayDyn, PyReadonlyArrayDyn};
use pyo3::exceptions::{PyKeyError, PyRuntimeError, PyValueError};
use pyo3::prelude::*;
use pyo3::types::PyDict;
use std::collections::HashMap;

fn py_err(e: ModelError) -> PyErr {
    match &e {
        ModelError::UnknownVariable(_) | ModelError::UnknownDimension(_) => PyKeyError::new_err(e.to_string()),
        ModelError::NoActiveModel | ModelError::Evaluation(_) | ModelError::NotSampleable(_) => {
            PyRuntimeError::new_err(e.to_string())
        }
        _ => PyValueError::new_err(e.to_string()),
    }
}

fn labels(values: Vec<String>) -> Vec<CoordLabel> {
    values.into_iter().map(CoordLabel::from).collect()
}

/// Handle to a node of the model graph.
#[pyclass(frozen)]
#[derive(Debug, Clone, Copy)]
struct Var {
    #[pyo3(get)]
    id: usize,
}

impl From<NodeId> for Var {
    fn from(node: NodeId) -> Self {
        Var { id: node.0 }
    }
}

#[pymethods]
impl Var {
    fn __repr__(&self) -> String {
        format!("Var({})", self.id)
    }
}

fn array_arg(obj: &Bound<'_, PyAny>) -> PyResult<ArrayD<f64>> {
    if let Ok(v) = obj.extract::<f64>() {
        return Ok(arr0(v).into_dyn());
    }
    let arr: PyReadonlyArrayDyn<'_, f64> = obj.extract()?;
    Ok(arr.as_array().to_owned())
}

/// Accepts a float, a float array or a `Var`.
fn param_arg(obj: &Bound<'_, PyAny>) -> PyResult<Param> {
    if let Ok(var) = obj.extract::<Var>() {
        return Ok(NodeId(var.id).into());
    }
    Ok(array_arg(obj)?.into())
}

fn point_arg(point: Option<&Bound<'_, PyDict>>) -> PyResult<Option<Point>> {
    let Some(dict) = point else { return Ok(None) };
    let mut out = Point::new();
    for (key, value) in dict.iter() {
        out.insert(key.extract()?, array_arg(&value)?);
    }
    Ok(Some(out))
}

fn point_to_dict<'py>(py: Python<'py>, point: Point) -> PyResult<Bound<'py, PyDict>> {
    let dict = PyDict::new(py);
    for (name, value) in point {
        dict.set_item(name, value.into_pyarray(py))?;
    }
    Ok(dict)
}

fn var_options(
    shape: Option<Vec<usize>>,
    dims: Option<Vec<String>>,
    observed: Option<&Bound<'_, PyAny>>,
    total_size: Option<usize>,
) -> PyResult<VarOptions> {
    let mut opts = VarOptions::default();
    if let Some(shape) = shape {
        opts = opts.shape(shape);
    }
    if let Some(dims) = dims {
        let dims: Vec<&str> = dims.iter().map(String::as_str).collect();
        opts = opts.dims(dims);
    }
    if let Some(obs) = observed {
        let data = match obs.extract::<Var>() {
            Ok(var) => ObservedData::Node(NodeId(var.id)),
            Err(_) => array_arg(obs)?.into(),
        };
        opts = opts.observed(data);
    }
    if let Some(total) = total_size {
        opts = opts.total_size(total);
    }
    Ok(opts)
}

#[pyclass(name = "Model", unsendable)]
struct PyModel {
    inner: Model,
}

impl PyModel {
    fn run<T>(&self, f: impl FnOnce() -> Result<T>) -> PyResult<T> {
        self.inner.within(f).map_err(py_err)
    }

    fn node(&self, name: &str) -> PyResult<NodeId> {
        self.inner.get(name).map_err(py_err)
    }

    fn names(&self, nodes: Vec<NodeId>) -> Vec<String> {
        let g = self.inner.graph();
        nodes.into_iter().map(|n| g.describe(n)).collect()
    }
}

#[pymethods]
impl PyModel {
    #[new]
    #[pyo3(signature = (name="", coords=None, check_bounds=true, seed=42))]
    fn new(name: &str, coords: Option<HashMap<String, Vec<String>>>, check_bounds: bool, seed: u64) -> PyResult<Self> {
        let mut config = ModelConfig::named(name).with_check_bounds(check_bounds).with_seed(seed);
        let mut coords: Vec<(String, Vec<String>)> = coords.unwrap_or_default().into_iter().collect();
        coords.sort();
        for (dim, values) in coords {
            config = config.with_coord(dim, values);
        }
        let inner = Model::with_parent(config, None).map_err(py_err)?;
        Ok(PyModel { inner })
    }

    /// A named child model sharing this model's graph.
    fn child(&self, name: &str) -> PyResult<PyModel> {
        let inner = Model::with_parent(ModelConfig::named(name), Some(self.inner.clone())).map_err(py_err)?;
        Ok(PyModel { inner })
    }

    #[getter]
    fn name(&self) -> String {
        self.inner.name().to_string()
    }

    #[pyo3(signature = (name, values=None, length=None))]
    fn add_coord(&self, name: &str, values: Option<Vec<String>>, length: Option<usize>) -> PyResult<()> {
        self.inner
            .add_coord(name, values.map(labels), length.map(DimLength::Fixed))
            .map_err(py_err)
    }

    fn coords(&self) -> HashMap<String, Option<Vec<String>>> {
        self.inner
            .coords()
            .into_iter()
            .map(|(name, values)| (name, values.map(|v| v.iter().map(ToString::to_string).collect())))
            .collect()
    }

    #[pyo3(signature = (name, value, dims=None))]
    fn data(&self, name: &str, value: PyReadonlyArrayDyn<'_, f64>, dims: Option<Vec<String>>) -> PyResult<Var> {
        let dims = dims.map(|d| d.iter().map(String::as_str).collect::<Vec<_>>().into());
        let node = self
            .inner
            .data(name, value.as_array().to_owned(), dims)
            .map_err(py_err)?;
        Ok(node.into())
    }

    #[pyo3(signature = (name, values, coords=None))]
    fn set_data(
        &self,
        name: &str,
        values: PyReadonlyArrayDyn<'_, f64>,
        coords: Option<HashMap<String, Vec<String>>>,
    ) -> PyResult<()> {
        let coords = coords.map(|c| c.into_iter().map(|(k, v)| (k, labels(v))).collect());
        self.inner
            .set_data(name, values.as_array().to_owned(), coords)
            .map_err(py_err)
    }

    #[pyo3(signature = (name, mu, sigma, shape=None, dims=None, observed=None, total_size=None))]
    #[allow(clippy::too_many_arguments)]
    fn normal(
        &self,
        name: &str,
        mu: &Bound<'_, PyAny>,
        sigma: &Bound<'_, PyAny>,
        shape: Option<Vec<usize>>,
        dims: Option<Vec<String>>,
        observed: Option<&Bound<'_, PyAny>>,
        total_size: Option<usize>,
    ) -> PyResult<Var> {
        let (mu, sigma) = (param_arg(mu)?, param_arg(sigma)?);
        let opts = var_options(shape, dims, observed, total_size)?;
        self.run(|| Normal::var(name, mu, sigma, opts)).map(Var::from)
    }

    #[pyo3(signature = (name, sigma, shape=None, dims=None, observed=None, total_size=None))]
    fn half_normal(
        &self,
        name: &str,
        sigma: &Bound<'_, PyAny>,
        shape: Option<Vec<usize>>,
        dims: Option<Vec<String>>,
        observed: Option<&Bound<'_, PyAny>>,
        total_size: Option<usize>,
    ) -> PyResult<Var> {
        let sigma = param_arg(sigma)?;
        let opts = var_options(shape, dims, observed, total_size)?;
        self.run(|| HalfNormal::var(name, sigma, opts)).map(Var::from)
    }

    #[pyo3(signature = (name, lower, upper, shape=None, dims=None, observed=None, total_size=None))]
    #[allow(clippy::too_many_arguments)]
    fn uniform(
        &self,
        name: &str,
        lower: &Bound<'_, PyAny>,
        upper: &Bound<'_, PyAny>,
        shape: Option<Vec<usize>>,
        dims: Option<Vec<String>>,
        observed: Option<&Bound<'_, PyAny>>,
        total_size: Option<usize>,
    ) -> PyResult<Var> {
        let (lower, upper) = (param_arg(lower)?, param_arg(upper)?);
        let opts = var_options(shape, dims, observed, total_size)?;
        self.run(|| Uniform::var(name, lower, upper, opts)).map(Var::from)
    }

    #[pyo3(signature = (name, mu, shape=None, dims=None, observed=None, total_size=None))]
    fn poisson(
        &self,
        name: &str,
        mu: &Bound<'_, PyAny>,
        shape: Option<Vec<usize>>,
        dims: Option<Vec<String>>,
        observed: Option<&Bound<'_, PyAny>>,
        total_size: Option<usize>,
    ) -> PyResult<Var> {
        let mu = param_arg(mu)?;
        let opts = var_options(shape, dims, observed, total_size)?;
        self.run(|| Poisson::var(name, mu, opts)).map(Var::from)
    }

    #[pyo3(signature = (name, var, dims=None))]
    fn deterministic(&self, name: &str, var: Var, dims: Option<Vec<String>>) -> PyResult<Var> {
        let dims = dims.map(|d| d.iter().map(String::as_str).collect::<Vec<_>>().into());
        self.inner
            .deterministic(name, NodeId(var.id), dims)
            .map(Var::from)
            .map_err(py_err)
    }

    fn potential(&self, name: &str, var: Var) -> PyResult<Var> {
        self.inner.potential(name, NodeId(var.id)).map(Var::from).map_err(py_err)
    }

    fn __getitem__(&self, name: &str) -> PyResult<Var> {
        self.node(name).map(Var::from)
    }

    fn free_rvs(&self) -> Vec<String> {
        self.names(self.inner.free_rvs())
    }

    fn observed_rvs(&self) -> Vec<String> {
        self.names(self.inner.observed_rvs())
    }

    fn deterministics(&self) -> Vec<String> {
        self.names(self.inner.deterministics())
    }

    fn value_vars(&self) -> Vec<String> {
        self.names(self.inner.value_vars())
    }

    fn initial_point<'py>(&self, py: Python<'py>) -> PyResult<Bound<'py, PyDict>> {
        let point = self.inner.initial_point().map_err(py_err)?;
        point_to_dict(py, point)
    }

    /// Joint log-density at `point` (default: the initial point).
    #[pyo3(signature = (point=None, jacobian=true))]
    fn logp(&self, point: Option<&Bound<'_, PyDict>>, jacobian: bool) -> PyResult<f64> {
        let point = match point_arg(point)? {
            Some(p) => p,
            None => self.inner.initial_point().map_err(py_err)?,
        };
        let logp = if jacobian {
            self.inner.logpt()
        } else {
            self.inner.logp_nojact()
        }
        .map_err(py_err)?;
        Ok(self.inner.eval(logp, Some(&point)).map_err(py_err)?.sum())
    }

    #[pyo3(signature = (point=None))]
    fn point_logps(&self, point: Option<&Bound<'_, PyDict>>) -> PyResult<Vec<(String, f64)>> {
        let point = point_arg(point)?;
        self.inner.point_logps(point.as_ref()).map_err(py_err)
    }

    #[pyo3(signature = (var, point=None))]
    fn eval<'py>(
        &self,
        py: Python<'py>,
        var: Var,
        point: Option<&Bound<'py, PyDict>>,
    ) -> PyResult<Bound<'py, PyArrayDyn<f64>>> {
        let point = point_arg(point)?;
        let value = self.inner.eval(NodeId(var.id), point.as_ref()).map_err(py_err)?;
        Ok(value.into_pyarray(py))
    }

    #[pyo3(signature = (tempered=false))]
    fn logp_dlogp_function(&self, tempered: bool) -> PyResult<ValueGrad> {
        let inner = self.inner.logp_dlogp_function(None, tempered).map_err(py_err)?;
        Ok(ValueGrad { inner })
    }

    fn to_json(&self) -> PyResult<String> {
        self.inner.to_json().map_err(py_err)
    }

    #[staticmethod]
    fn from_json(json: &str) -> PyResult<PyModel> {
        let inner = Model::from_json(json).map_err(py_err)?;
        Ok(PyModel { inner })
    }

    fn warnings(&self) -> Vec<String> {
        self.inner.graph().warnings().iter().map(ToString::to_string).collect()
    }

    fn __repr__(&self) -> String {
        self.inner.to_string()
    }
}

/// Log-density and gradient over a flat parameter vector.
#[pyclass]
struct ValueGrad {
    inner: ValueGradFunction,
}

#[pymethods]
impl ValueGrad {
    #[getter]
    fn size(&self) -> usize {
        self.inner.size()
    }

    fn names(&self) -> Vec<String> {
        self.inner.grad_var_names().into_iter().map(str::to_string).collect()
    }

    fn set_weights(&mut self, weights: Vec<f64>) -> PyResult<()> {
        self.inner.set_weights(&weights).map_err(py_err)
    }

    fn __call__<'py>(&self, py: Python<'py>, x: Vec<f64>) -> PyResult<(f64, Bound<'py, PyArray1<f64>>)> {
        let f = &self.inner;
        let (logp, grad) = py.allow_threads(move || f.call(&x)).map_err(py_err)?;
        Ok((logp, PyArray1::from_vec(py, grad)))
    }
}

#[pymodule]
fn bayesgraph(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_class::<PyModel>()?;
    m.add_class::<Var>()?;
    m.add_class::<ValueGrad>()?;
    Ok(())
}
