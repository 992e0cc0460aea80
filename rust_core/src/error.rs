use thiserror::Error;

/// Errors raised while building or evaluating a model graph.
#[derive(Error, Debug)]
pub enum ModelError {
    /// Conflicting or malformed `shape` / `dims` / `size` arguments.
    #[error("{0}")]
    InvalidShapeSpec(String),

    /// A dimensionality or length contract was violated.
    #[error("{message} (actual: {actual}, expected: {expected})")]
    Shape {
        message: String,
        actual: String,
        expected: String,
    },

    #[error(
        "Dimensions can not be named `draw`, `chain` or `__sample__`, \
         as those are reserved (got '{0}')"
    )]
    ReservedDimension(String),

    #[error("Duplicate and incompatible coordinate: {0}")]
    IncompatibleCoordinate(String),

    #[error("Unknown dimension name(s) {0:?}. All dimension names must be registered with the model first")]
    UnknownDimension(Vec<String>),

    #[error("Variable name {0} already exists")]
    DuplicateName(String),

    #[error("Unknown variable '{0}'")]
    UnknownVariable(String),

    #[error("Variables that depend on other nodes cannot be used for observed data. The data variable was: {0}")]
    DependentObservation(String),

    #[error("No model on context stack, which is needed to instantiate distributions. Enter a model scope, or use `dist` for a standalone distribution")]
    NoActiveModel,

    #[error("Couldn't generate an initial value for {0}")]
    MissingInput(String),

    #[error("Initial evaluation of model at starting point failed!\nStarting values:\n{point}\n\nInitial evaluation results:\n{logps}")]
    InitialEvaluation { point: String, logps: String },

    #[error("Unknown distribution kernel '{0}'")]
    UnknownKernel(String),

    #[error("{0} does not support random draws")]
    NotSampleable(String),

    #[error("Evaluation failed: {0}")]
    Evaluation(String),

    #[error("{0}")]
    InvalidArgument(String),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

impl ModelError {
    pub fn shape(
        message: impl Into<String>,
        actual: impl std::fmt::Debug,
        expected: impl std::fmt::Debug,
    ) -> Self {
        ModelError::Shape {
            message: message.into(),
            actual: format!("{actual:?}"),
            expected: format!("{expected:?}"),
        }
    }
}

pub type Result<T> = std::result::Result<T, ModelError>;

/// Non-fatal conditions surfaced while constructing a model.
///
/// Every warning is logged through the `log` facade and also kept on the
/// graph that produced it, see [`crate::graph::Graph::take_warnings`].
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum ModelWarning {
    /// A `size`-parametrized RV came out with more dimensions than requested.
    Shape(String),
    /// Missing observations will be imputed from the sampling distribution.
    Imputation(String),
}

impl std::fmt::Display for ModelWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModelWarning::Shape(msg) => write!(f, "ShapeWarning: {msg}"),
            ModelWarning::Imputation(msg) => write!(f, "ImputationWarning: {msg}"),
        }
    }
}
