use shroud_store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LmdbError {
    #[error("heed error: {0}")]
    Heed(String),
}

impl From<heed::Error> for LmdbError {
    fn from(e: heed::Error) -> Self {
        LmdbError::Heed(e.to_string())
    }
}

impl From<LmdbError> for StoreError {
    fn from(e: LmdbError) -> Self {
        StoreError::Backend(e.to_string())
    }
}
