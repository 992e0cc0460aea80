//! JSON snapshots of a whole model tree.
//!
//! Kernels are stored by name only. Custom kernels (see
//! [`crate::distributions::DensityDist`]) must be registered again before a
//! snapshot that uses them is loaded.

use crate::config::ModelConfig;
use crate::distribution::get_kernel;
use crate::error::Result;
use crate::graph::{Graph, NodeId, Op};
use crate::logprob::TotalSize;
use crate::model::{CoordLabel, Model, ModelState, Scope};
use crate::transforms::Transform;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Serialize, Deserialize)]
struct ModelSnapshot {
    name: String,
    check_bounds: bool,
    round_vals: i32,
    seed: u64,
    graph: Graph,
    scopes: Vec<Scope>,
    named_vars: Vec<(usize, String, NodeId)>,
    free_rvs: Vec<(usize, NodeId)>,
    observed_rvs: Vec<(usize, NodeId)>,
    deterministics: Vec<(usize, NodeId)>,
    auto_deterministics: Vec<(usize, NodeId)>,
    potentials: Vec<(usize, NodeId)>,
    rvs_to_values: Vec<(NodeId, NodeId)>,
    transforms: Vec<(NodeId, Transform)>,
    observations: Vec<(NodeId, NodeId)>,
    total_sizes: Vec<(NodeId, TotalSize)>,
    rv_dims: Vec<(String, Vec<Option<String>>)>,
    coords: Vec<(String, Option<Vec<CoordLabel>>)>,
    dim_lengths: Vec<(String, NodeId)>,
}

fn sorted<K: Ord + Clone, V: Clone>(map: &HashMap<K, V>) -> Vec<(K, V)> {
    let mut out: Vec<(K, V)> = map.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
    out.sort_by(|a, b| a.0.cmp(&b.0));
    out
}

impl Model {
    /// Serialize the whole tree this model belongs to.
    pub fn to_json(&self) -> Result<String> {
        let root = self.root();
        let config = root.config();
        let st = root.state();
        let snapshot = ModelSnapshot {
            name: config.name.clone(),
            check_bounds: config.check_bounds,
            round_vals: config.round_vals,
            seed: config.seed,
            graph: st.graph.clone(),
            scopes: st.scopes.clone(),
            named_vars: st.named_vars.clone(),
            free_rvs: st.free_rvs.clone(),
            observed_rvs: st.observed_rvs.clone(),
            deterministics: st.deterministics.clone(),
            auto_deterministics: st.auto_deterministics.clone(),
            potentials: st.potentials.clone(),
            rvs_to_values: sorted(&st.rvs_to_values),
            transforms: sorted(&st.transforms),
            observations: sorted(&st.observations),
            total_sizes: sorted(&st.total_sizes),
            rv_dims: st.rv_dims.clone(),
            coords: st.coords.clone(),
            dim_lengths: sorted(&st.dim_lengths),
        };
        Ok(serde_json::to_string(&snapshot)?)
    }

    /// Restore a tree saved with [`Model::to_json`], returning its root.
    pub fn from_json(json: &str) -> Result<Model> {
        let snap: ModelSnapshot = serde_json::from_str(json)?;
        for node in &snap.graph.nodes {
            if let Op::Random { kernel, .. } = &node.op {
                get_kernel(kernel)?;
            }
        }
        let values_to_rvs = snap.rvs_to_values.iter().map(|&(rv, v)| (v, rv)).collect();
        let state = ModelState {
            graph: snap.graph,
            scopes: snap.scopes,
            named_vars: snap.named_vars,
            free_rvs: snap.free_rvs,
            observed_rvs: snap.observed_rvs,
            deterministics: snap.deterministics,
            auto_deterministics: snap.auto_deterministics,
            potentials: snap.potentials,
            rvs_to_values: snap.rvs_to_values.into_iter().collect(),
            values_to_rvs,
            transforms: snap.transforms.into_iter().collect(),
            observations: snap.observations.into_iter().collect(),
            total_sizes: snap.total_sizes.into_iter().collect(),
            rv_dims: snap.rv_dims,
            coords: snap.coords,
            dim_lengths: snap.dim_lengths.into_iter().collect(),
            cache: Default::default(),
        };
        let config = ModelConfig {
            name: snap.name,
            coords: Vec::new(),
            check_bounds: snap.check_bounds,
            seed: snap.seed,
            round_vals: snap.round_vals,
        };
        log::debug!("restored model '{}' with {} nodes", config.name, state.graph.nodes.len());
        Ok(Model::from_parts(config, state))
    }
}

#[cfg(test)]
mod tests {
    use crate::config::ModelConfig;
    use crate::distribution::VarOptions;
    use crate::distributions::{DensityDist, HalfNormal, Normal};
    use crate::error::{ModelError, Result};
    use crate::graph::{Graph, NodeId};
    use crate::model::Model;
    use ndarray::array;

    fn example() -> Model {
        let config = ModelConfig::default().with_coord("obs_id", ["a", "b", "c"]);
        Model::build(config, |m| {
            let s = HalfNormal::var("s", 1.0, VarOptions::default())?;
            let x = m.data("x", array![0.1, 0.2, 0.3].into_dyn(), Some("obs_id".into()))?;
            Normal::var("y", x, s, VarOptions::default().observed(array![0.0, 0.5, 1.0].into_dyn()).dims("obs_id"))?;
            Ok(())
        })
        .unwrap()
    }

    #[test]
    fn test_snapshot_roundtrip() {
        let model = example();
        let before = model.point_logps(None).unwrap();
        let json = model.to_json().unwrap();
        let restored = Model::from_json(&json).unwrap();

        let names = |m: &Model| m.named_vars().into_iter().map(|(n, _)| n).collect::<Vec<_>>();
        assert_eq!(names(&model), names(&restored));
        assert_eq!(model.coords(), restored.coords());
        assert_eq!(restored.rv_dims()["y"], vec![Some("obs_id".to_string())]);
        assert_eq!(restored.point_logps(None).unwrap(), before);

        restored.set_data("x", array![1.0, 2.0, 3.0].into_dyn(), None).unwrap();
        let x = restored.get("x").unwrap();
        assert_eq!(restored.eval(x, None).unwrap(), array![1.0, 2.0, 3.0].into_dyn());
    }

    #[test]
    fn test_unknown_kernel_is_rejected() {
        let json = example().to_json().unwrap();
        let broken = json.replace("\"HalfNormal\"", "\"Nonexistent\"");
        assert!(matches!(Model::from_json(&broken), Err(ModelError::UnknownKernel(_))));
        assert!(matches!(Model::from_json("{"), Err(ModelError::Serialization(_))));
    }

    fn shifted_logp(g: &mut Graph, value: NodeId, params: &[NodeId], _check_bounds: bool) -> Result<NodeId> {
        let diff = g.sub(value, params[0]);
        let sq = g.square(diff);
        Ok(g.neg(sq))
    }

    #[test]
    fn test_snapshot_with_custom_density() {
        DensityDist::register("snapshot_shifted", 1, shifted_logp);
        let model = Model::build(ModelConfig::default(), |_| {
            let mu = Normal::var("mu", 0.0, 1.0, VarOptions::default())?;
            DensityDist::var(
                "d",
                "snapshot_shifted",
                vec![mu.into()],
                VarOptions::default().observed(array![0.5, -0.5].into_dyn()),
            )?;
            Ok(())
        })
        .unwrap();
        let before = model.point_logps(None).unwrap();
        let json = model.to_json().unwrap();

        // registering the density again before loading is what callers do
        // in a fresh process
        DensityDist::register("snapshot_shifted", 1, shifted_logp);
        let restored = Model::from_json(&json).unwrap();
        assert_eq!(restored.point_logps(None).unwrap(), before);
        assert!(restored.to_string().contains("d ~ snapshot_shifted"));
    }
}
