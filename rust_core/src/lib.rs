pub mod autodiff;
pub mod config;
pub mod context;
pub mod distribution;
pub mod distributions;
pub mod error;
pub mod graph;
pub mod logprob;
mod missing;
pub mod model;
pub mod serialize;
pub mod shape_utils;
pub mod special;
pub mod transforms;

pub use config::ModelConfig;
pub use error::{ModelError, ModelWarning, Result};
pub use graph::{Graph, NodeId};
pub use model::{CoordLabel, DimLength, Model, ObservedData, Point};
