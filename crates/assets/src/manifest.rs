use std::path::{Path, PathBuf};

use acq_assets_config::Config;

use crate::{AssetCategory, AssetItem, DiskState, Error};

/// Everything the engine knows about one category for a single run.
#[derive(Debug, Clone, PartialEq)]
pub struct CategoryManifest {
    pub category: AssetCategory,
    pub dir: PathBuf,
    pub base_url: Option<String>,
    pub weight: f64,
    pub concurrency: usize,
    pub files: Vec<String>,
}

/// Immutable snapshot of the required asset set, built once per setup run.
#[derive(Debug, Clone, PartialEq)]
pub struct Manifest {
    pub root: PathBuf,
    categories: Vec<CategoryManifest>,
}

impl Manifest {
    pub fn from_config(config: &Config) -> Result<Self, Error> {
        let root = config.asset_root()?;
        Ok(Self::with_root(config, root))
    }

    /// Same as [`Manifest::from_config`] with the asset root given explicitly.
    pub fn with_root(config: &Config, root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let dirs = &config.assets;
        let repo = &config.repo;
        let concurrency = &config.concurrency;
        let weights = &config.weights;

        let thumbnails = config
            .defaults
            .models
            .iter()
            .map(|model| thumbnail_name(model))
            .collect();

        let categories = vec![
            CategoryManifest {
                category: AssetCategory::Model,
                dir: root.join(&dirs.models_dir),
                base_url: repo.model_url().map(str::to_string),
                weight: weights.model,
                concurrency: concurrency.models,
                files: config.defaults.models.clone(),
            },
            CategoryManifest {
                category: AssetCategory::Config,
                dir: root.join(&dirs.prompts_dir),
                base_url: repo.config_url().map(str::to_string),
                weight: weights.config,
                concurrency: concurrency.prompts,
                files: config.defaults.prompts.clone(),
            },
            CategoryManifest {
                category: AssetCategory::Voice,
                dir: root.join(&dirs.voices_dir),
                base_url: repo.voice_url().map(str::to_string),
                weight: weights.voice,
                concurrency: concurrency.voices,
                files: config.defaults.voices.clone(),
            },
            CategoryManifest {
                category: AssetCategory::Thumbnail,
                dir: root.join(&dirs.images_dir),
                base_url: repo.image_url().map(str::to_string),
                weight: weights.thumbnail,
                concurrency: concurrency.thumbnails,
                files: thumbnails,
            },
        ];

        Self { root, categories }
    }

    /// Categories in processing order.
    pub fn categories(&self) -> &[CategoryManifest] {
        &self.categories
    }

    pub fn category(&self, category: AssetCategory) -> Option<&CategoryManifest> {
        self.categories.iter().find(|c| c.category == category)
    }

    /// `Σ (itemCount × weight)` over every category.
    pub fn total_weight(&self) -> f64 {
        self.categories
            .iter()
            .map(|c| c.files.len() as f64 * c.weight)
            .sum()
    }

    pub fn weight(&self, category: AssetCategory) -> f64 {
        self.category(category).map_or(0.0, |c| c.weight)
    }

    pub fn concurrency(&self, category: AssetCategory) -> usize {
        self.category(category).map_or(1, |c| c.concurrency.max(1))
    }

    /// Builds the item for `file_name`, in the `Missing` state.
    pub fn item(&self, category: &CategoryManifest, file_name: &str) -> AssetItem {
        let source_model = match category.category {
            AssetCategory::Thumbnail => self.source_model(file_name),
            _ => None,
        };

        AssetItem {
            category: category.category,
            file_name: file_name.to_string(),
            path: category.dir.join(file_name),
            url: category
                .base_url
                .as_deref()
                .map(|base| join_url(base, file_name)),
            source_model,
            state: DiskState::Missing,
        }
    }

    fn source_model(&self, thumbnail: &str) -> Option<PathBuf> {
        let models = self.category(AssetCategory::Model)?;
        models
            .files
            .iter()
            .find(|model| thumbnail_name(model) == thumbnail)
            .map(|model| models.dir.join(model))
    }
}

/// `<model stem>.jpg`.
pub fn thumbnail_name(model: &str) -> String {
    let stem = Path::new(model)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| model.to_string());
    format!("{}.jpg", stem)
}

fn join_url(base: &str, file_name: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), file_name)
}
