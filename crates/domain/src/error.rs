/// Shared error type used across all salesflow crates.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP: {0}")]
    Http(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("llm: {0}")]
    Llm(String),

    #[error("circuit open")]
    CircuitOpen,

    #[error("storage: {0}")]
    Storage(String),

    #[error("snapshot: {0}")]
    Snapshot(String),

    #[error("tenant mismatch: expected {expected}, snapshot has {actual}")]
    TenantMismatch { expected: String, actual: String },

    #[error("client_id is required for session '{0}' to guarantee tenant isolation")]
    MissingClientId(String),

    #[error("config: {0}")]
    Config(String),

    #[error("auth: {0}")]
    Auth(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
