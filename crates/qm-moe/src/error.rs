use thiserror::Error;

#[derive(Error, Debug)]
pub enum MoeError {
    #[error("invalid MOE config: {0}")]
    InvalidConfig(String),
    #[error("weight '{name}' has shape {got:?}, expected {expected:?}")]
    WeightShape {
        name: String,
        expected: Vec<usize>,
        got: Vec<usize>,
    },
    #[error("tensor error: {0}")]
    Tensor(#[from] qm_tensor::TensorError),
}

pub type Result<T> = std::result::Result<T, MoeError>;
