use thiserror::Error;

#[derive(Debug, Error)]
pub enum PortalError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("portal returned {status} for {url}")]
    Status { status: u16, url: String },

    #[error("unexpected page structure: {0}")]
    Structure(String),

    #[error("not connected to the portal")]
    NotConnected,

    #[error("cache error: {0}")]
    Cache(#[from] cadex_store::StoreError),

    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}
