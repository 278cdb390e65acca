use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WorkError {
    #[error("proof-of-work search cancelled")]
    Cancelled,
}
