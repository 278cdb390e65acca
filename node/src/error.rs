use thiserror::Error;

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("network error: {0}")]
    Network(#[from] shroud_network::NetworkError),

    #[error("store error: {0}")]
    Store(#[from] shroud_store::StoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("macroblock import failed: {0}")]
    MacroblockImport(String),

    #[error("{0}")]
    Other(String),
}

/// A peer broke the protocol. The dispatcher converts this into
/// `delete_self(error = true)` with a ban; it never unwinds further.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("protocol violation: {0}")]
pub struct Violation(pub &'static str);

/// Shorthand used by the message handlers.
pub fn unexpected<T>(what: &'static str) -> Result<T, Violation> {
    Err(Violation(what))
}
