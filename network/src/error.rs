use thiserror::Error;

#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("peer not found")]
    PeerNotFound,

    #[error("peer is banned")]
    Banned,

    #[error("store error: {0}")]
    Store(#[from] shroud_store::StoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
