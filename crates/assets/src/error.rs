#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Transport(#[from] acq_file::Error),
    #[error(transparent)]
    Config(#[from] acq_assets_config::Error),
    #[error("Error while preparing asset directories: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Asset setup cancelled")]
    Cancelled,
}
