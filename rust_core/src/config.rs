use crate::model::CoordLabel;

/// Construction-time options for a [`crate::model::Model`].
#[derive(Debug, Clone)]
pub struct ModelConfig {
    /// Name of the model. Non-empty names prefix every registered variable.
    pub name: String,
    /// Coordinates registered before any variable is created.
    pub coords: Vec<(String, Vec<CoordLabel>)>,
    /// Replace log-densities outside the support by `-inf`.
    pub check_bounds: bool,
    /// Seed of the default random generator. Ignored for child models,
    /// which share the generator of their root.
    pub seed: u64,
    /// Decimals kept by `point_logps`.
    pub round_vals: i32,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            coords: Vec::new(),
            check_bounds: true,
            seed: 42,
            round_vals: 2,
        }
    }
}

impl ModelConfig {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_coord<L: Into<CoordLabel>>(
        mut self,
        name: impl Into<String>,
        values: impl IntoIterator<Item = L>,
    ) -> Self {
        self.coords
            .push((name.into(), values.into_iter().map(Into::into).collect()));
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_check_bounds(mut self, check_bounds: bool) -> Self {
        self.check_bounds = check_bounds;
        self
    }
}
