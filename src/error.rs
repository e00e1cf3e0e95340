use thiserror::Error;

#[derive(Debug, Error)]
pub enum DiffusionError {
    /// Invalid schedule kind, timestep count or respacing string.
    #[error("invalid diffusion config: {0}")]
    Config(String),
    #[error("shape mismatch in {op}: expected {expected}, got {actual:?}")]
    Shape {
        op: &'static str,
        expected: String,
        actual: Vec<i64>,
    },
    #[error("predictor call failed")]
    Predictor(#[source] anyhow::Error),
    #[error(transparent)]
    Tch(#[from] tch::TchError),
}

impl DiffusionError {
    pub(crate) fn config<S: Into<String>>(msg: S) -> Self {
        DiffusionError::Config(msg.into())
    }

    pub(crate) fn shape<S: Into<String>>(op: &'static str, expected: S, actual: Vec<i64>) -> Self {
        DiffusionError::Shape { op, expected: expected.into(), actual }
    }
}

pub type Result<T> = std::result::Result<T, DiffusionError>;
