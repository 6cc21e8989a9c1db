mod accelerator;
mod category;
mod error;
mod fetcher;
mod item;
mod manifest;
mod orchestrator;
mod planner;
mod progress;
mod retry;
mod scheduler;
mod thumbnail;

pub use accelerator::*;
pub use category::*;
pub use error::*;
pub use fetcher::*;
pub use item::*;
pub use manifest::*;
pub use orchestrator::*;
pub use planner::*;
pub use progress::*;
pub use retry::*;
pub use scheduler::*;
pub use thumbnail::ThumbnailGenerator;

pub(crate) use thumbnail::produce_thumbnail;

pub use acq_assets_config::Config;
pub use acq_download_interface::DownloadProgress;
