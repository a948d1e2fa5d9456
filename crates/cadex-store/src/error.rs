use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("cache root does not exist: {0}")]
    UnknownRoot(String),

    #[error("lock file error: {0}")]
    Lock(#[from] std::io::Error),

    #[error("duckdb error: {0}")]
    DuckDb(#[from] ::duckdb::Error),
}
