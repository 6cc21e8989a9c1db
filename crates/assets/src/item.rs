use std::path::PathBuf;

use crate::AssetCategory;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum DiskState {
    Missing,
    /// Bytes already sitting in `<file>.tmp`.
    Partial(u64),
    Complete,
}

/// One required file.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct AssetItem {
    pub category: AssetCategory,
    pub file_name: String,
    pub path: PathBuf,
    /// `None` when no base URL is configured for the category.
    pub url: Option<String>,
    /// Model a thumbnail is generated from.
    pub source_model: Option<PathBuf>,
    pub state: DiskState,
}

impl AssetItem {
    pub fn id(&self) -> String {
        format!("{}/{}", self.category, self.file_name)
    }
}
