use std::collections::BTreeMap;

use crate::{AssetCategory, AssetItem, DiskState, Manifest};

/// Result of comparing the manifest with the filesystem.
#[derive(Debug, Clone, PartialEq)]
pub struct Plan {
    pub setup_required: bool,
    pub status: BTreeMap<AssetCategory, String>,
    /// Sorted by `(category, file_name)`.
    pub missing: Vec<AssetItem>,
    pub present: Vec<AssetItem>,
}

pub struct Planner;

impl Planner {
    /// Reads the filesystem only; running it twice without changes gives the same plan.
    pub fn plan(manifest: &Manifest) -> Plan {
        let mut status = BTreeMap::new();
        let mut missing = Vec::new();
        let mut present = Vec::new();

        for category in manifest.categories() {
            let mut category_missing = Vec::new();

            for file_name in &category.files {
                let mut item = manifest.item(category, file_name);
                item.state = disk_state(&item);

                match item.state {
                    DiskState::Complete => present.push(item),
                    _ => category_missing.push(item),
                }
            }

            let description = if !category.dir.is_dir() {
                let dir_name = category
                    .dir
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| category.dir.display().to_string());
                format!("Directory missing: {}", dir_name)
            } else if !category_missing.is_empty() {
                let names: Vec<&str> = category_missing
                    .iter()
                    .map(|item| item.file_name.as_str())
                    .collect();
                format!("Missing {}: {}", category.category, names.join(", "))
            } else {
                format!("{} {} found", category.files.len(), category.category)
            };
            status.insert(category.category, description);

            missing.extend(category_missing);
        }

        missing.sort_by(|a, b| {
            (a.category, a.file_name.as_str()).cmp(&(b.category, b.file_name.as_str()))
        });

        Plan {
            setup_required: !missing.is_empty(),
            status,
            missing,
            present,
        }
    }
}

fn disk_state(item: &AssetItem) -> DiskState {
    if item.path.exists() {
        return DiskState::Complete;
    }

    match std::fs::metadata(acq_file::tmp_path(&item.path)) {
        Ok(metadata) if metadata.len() > 0 => DiskState::Partial(metadata.len()),
        _ => DiskState::Missing,
    }
}
