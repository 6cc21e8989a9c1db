#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    ReqwestError(#[from] reqwest::Error),
    #[error("Error while reading file: {0}")]
    FileIOError(#[from] std::io::Error),
    #[error("Download cancelled")]
    Cancelled,
    #[error("Timed out after {0:?} waiting for data")]
    Timeout(std::time::Duration),
    #[error("Download failed with status {status}: {url}")]
    UnexpectedStatus { status: u16, url: String },
    #[error("Server ignored range request (status {status}): {url}")]
    RangeIgnored { status: u16, url: String },
    #[error("Size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: u64, actual: u64 },
    #[error("Invalid byte range: {0}")]
    InvalidRange(String),
}
