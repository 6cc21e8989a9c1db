mod error;
pub use error::*;

use std::path::PathBuf;

#[macro_export]
macro_rules! common_derives {
    ($item:item) => {
        #[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize, schemars::JsonSchema)]
        $item
    };
}

const APP_DIR_NAME: &str = "asset-acquisition";

/// Platform data directory the asset tree lives under when no override is configured.
pub fn default_user_data_dir() -> Result<PathBuf, Error> {
    dirs::data_dir()
        .map(|dir| dir.join(APP_DIR_NAME))
        .ok_or(Error::NoDataDir)
}

pub fn default_settings_path() -> Result<PathBuf, Error> {
    default_user_data_dir().map(|dir| dir.join("settings"))
}

common_derives! {
    #[derive(Default)]
    #[serde(rename_all = "camelCase", default)]
    pub struct Config {
        #[serde(rename = "$schema", skip_serializing_if = "Option::is_none")]
        #[schemars(skip)]
        pub schema: Option<String>,
        /// Overrides the platform data directory.
        #[serde(skip_serializing_if = "Option::is_none")]
        pub user_data_dir: Option<PathBuf>,
        pub assets: AssetsConfig,
        pub repo: RepoConfig,
        pub defaults: DefaultsConfig,
        pub download: DownloadConfig,
        pub concurrency: ConcurrencyConfig,
        pub weights: WeightsConfig,
    }
}

impl Config {
    /// Loads `path` (or `<data dir>/settings.{json,yaml,json5}`) layered under
    /// `ASSETS__*` environment variables. A missing default file yields defaults.
    ///
    /// Words of an environment key are joined with `_` and sections with `__`:
    /// `ASSETS__DOWNLOAD__MAX_RETRIES` sets `download.maxRetries`.
    pub fn new(path: Option<String>) -> Result<Self, crate::Error> {
        let required = path.is_some();
        let path = match path {
            Some(path) => path,
            None => default_settings_path()?.to_string_lossy().into_owned(),
        };

        let settings = config::Config::builder()
            .add_source(config::File::with_name(&path).required(required))
            .add_source(
                config::Environment::with_prefix("ASSETS")
                    .separator("__")
                    .convert_case(config::Case::Camel)
                    .try_parsing(true),
            )
            .build()?;

        let config = settings.try_deserialize::<Config>()?;
        Ok(config)
    }

    pub fn from_json_str(s: &str) -> Result<Self, crate::Error> {
        let settings = config::Config::builder()
            .add_source(config::File::from_str(s, config::FileFormat::Json))
            .build()?;

        let config = settings.try_deserialize::<Config>()?;
        Ok(config)
    }

    /// Pretty-printed JSON schema of the settings document.
    pub fn json_schema() -> Result<String, crate::Error> {
        let schema = schemars::schema_for!(Config);
        Ok(serde_json::to_string_pretty(&schema)?)
    }

    pub fn user_data_dir(&self) -> Result<PathBuf, crate::Error> {
        match &self.user_data_dir {
            Some(dir) => Ok(dir.clone()),
            None => default_user_data_dir(),
        }
    }

    /// `<user data dir>/<assetDir>`.
    pub fn asset_root(&self) -> Result<PathBuf, crate::Error> {
        Ok(self.user_data_dir()?.join(&self.assets.asset_dir))
    }
}

common_derives! {
    #[serde(rename_all = "camelCase", default)]
    pub struct AssetsConfig {
        pub asset_dir: String,
        pub models_dir: String,
        pub voices_dir: String,
        pub prompts_dir: String,
        pub images_dir: String,
    }
}

impl Default for AssetsConfig {
    fn default() -> Self {
        Self {
            asset_dir: "assets".into(),
            models_dir: "models".into(),
            voices_dir: "voices".into(),
            prompts_dir: "prompts".into(),
            images_dir: "images".into(),
        }
    }
}

common_derives! {
    #[derive(Default)]
    #[serde(rename_all = "camelCase", default)]
    pub struct RepoConfig {
        /// Fallback for any category without its own base URL.
        pub base_url: String,
        pub model_base_url: String,
        pub voice_base_url: String,
        pub config_base_url: String,
        /// Thumbnails are downloaded from here when generation is unavailable.
        pub image_base_url: Option<String>,
    }
}

impl RepoConfig {
    fn or_base<'a>(&'a self, url: &'a str) -> Option<&'a str> {
        [url, self.base_url.as_str()]
            .into_iter()
            .map(str::trim)
            .find(|u| !u.is_empty())
    }

    pub fn model_url(&self) -> Option<&str> {
        self.or_base(&self.model_base_url)
    }

    pub fn voice_url(&self) -> Option<&str> {
        self.or_base(&self.voice_base_url)
    }

    pub fn config_url(&self) -> Option<&str> {
        self.or_base(&self.config_base_url)
    }

    pub fn image_url(&self) -> Option<&str> {
        self.image_base_url
            .as_deref()
            .map(str::trim)
            .filter(|u| !u.is_empty())
    }
}

common_derives! {
    #[derive(Default)]
    #[serde(rename_all = "camelCase", default)]
    pub struct DefaultsConfig {
        pub models: Vec<String>,
        pub voices: Vec<String>,
        pub prompts: Vec<String>,
    }
}

common_derives! {
    #[serde(rename_all = "camelCase", default)]
    pub struct DownloadConfig {
        /// Seconds.
        pub connect_timeout: u64,
        /// Seconds to wait for the next body chunk.
        pub download_timeout: u64,
        /// Seconds.
        pub probe_timeout: u64,
        pub chunk_size: u64,
        pub max_chunk_size: u64,
        pub max_connections_per_file: u64,
        pub large_file_threshold: u64,
        pub min_part_size: u64,
        pub use_multipart_download: bool,
        pub use_external_accelerators: bool,
        pub max_retries: u32,
        pub retry_base_delay_ms: u64,
        pub progress_interval_ms: u64,
    }
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            connect_timeout: 60,
            download_timeout: 120,
            probe_timeout: 60,
            chunk_size: 1024 * 1024,
            max_chunk_size: 4 * 1024 * 1024,
            max_connections_per_file: 3,
            large_file_threshold: 10 * 1024 * 1024,
            min_part_size: 5 * 1024 * 1024,
            use_multipart_download: true,
            use_external_accelerators: true,
            max_retries: 3,
            retry_base_delay_ms: 1000,
            progress_interval_ms: 1000,
        }
    }
}

common_derives! {
    #[serde(rename_all = "camelCase", default)]
    pub struct ConcurrencyConfig {
        pub models: usize,
        pub prompts: usize,
        pub voices: usize,
        pub thumbnails: usize,
    }
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            models: 3,
            prompts: 10,
            voices: 5,
            thumbnails: 1,
        }
    }
}

common_derives! {
    #[serde(rename_all = "camelCase", default)]
    pub struct WeightsConfig {
        pub model: f64,
        pub voice: f64,
        pub config: f64,
        pub thumbnail: f64,
    }
}

impl Default for WeightsConfig {
    fn default() -> Self {
        Self {
            model: 30.0,
            voice: 2.0,
            config: 0.5,
            thumbnail: 3.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_document() {
        let config = Config::from_json_str("{}").unwrap();

        assert_eq!(config.assets, AssetsConfig::default());
        assert_eq!(config.download, DownloadConfig::default());
        assert_eq!(config.concurrency.prompts, 10);
        assert_eq!(config.weights.model, 30.0);
        assert!(config.defaults.models.is_empty());
    }

    #[test]
    fn test_partial_document() {
        let config = Config::from_json_str(
            r#"{
                "userDataDir": "/srv/agent",
                "repo": {
                    "baseUrl": "https://cdn.example.com/all",
                    "modelBaseUrl": "https://cdn.example.com/models/"
                },
                "defaults": { "models": ["albert.imx"], "voices": ["alloy.wav"] },
                "download": { "maxRetries": 5, "useExternalAccelerators": false },
                "weights": { "config": 1 }
            }"#,
        )
        .unwrap();

        assert_eq!(config.repo.model_url(), Some("https://cdn.example.com/models/"));
        assert_eq!(config.repo.voice_url(), Some("https://cdn.example.com/all"));
        assert_eq!(config.repo.image_url(), None);
        assert_eq!(config.defaults.models, vec!["albert.imx".to_string()]);
        assert_eq!(config.download.max_retries, 5);
        assert!(!config.download.use_external_accelerators);
        assert_eq!(config.download.chunk_size, 1024 * 1024);
        assert_eq!(config.weights.config, 1.0);
        assert_eq!(config.weights.voice, 2.0);
        assert_eq!(
            config.asset_root().unwrap(),
            PathBuf::from("/srv/agent/assets")
        );
    }

    #[test]
    #[serial_test::serial]
    fn test_new_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{ "assets": { "promptsDir": "config" }, "concurrency": { "models": 1 } }"#,
        )
        .unwrap();

        let config = Config::new(Some(path.to_string_lossy().into_owned())).unwrap();
        assert_eq!(config.assets.prompts_dir, "config");
        assert_eq!(config.assets.models_dir, "models");
        assert_eq!(config.concurrency.models, 1);
    }

    #[test]
    #[serial_test::serial]
    fn test_environment_overrides_multi_word_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{ "download": { "chunkSize": 4096 } }"#).unwrap();

        let vars = [
            ("ASSETS__DOWNLOAD__MAX_RETRIES", "7"),
            ("ASSETS__DOWNLOAD__USE_EXTERNAL_ACCELERATORS", "false"),
            ("ASSETS__DOWNLOAD__MAX_CONNECTIONS_PER_FILE", "8"),
            ("ASSETS__CONCURRENCY__MODELS", "9"),
            ("ASSETS__REPO__MODEL_BASE_URL", "https://mirror.example.com/models"),
        ];
        for (key, value) in vars {
            std::env::set_var(key, value);
        }
        let config = Config::new(Some(path.to_string_lossy().into_owned()));
        for (key, _) in vars {
            std::env::remove_var(key);
        }
        let config = config.unwrap();

        assert_eq!(config.download.max_retries, 7);
        assert!(!config.download.use_external_accelerators);
        assert_eq!(config.download.max_connections_per_file, 8);
        assert_eq!(config.download.chunk_size, 4096);
        assert_eq!(config.concurrency.models, 9);
        assert_eq!(
            config.repo.model_url(),
            Some("https://mirror.example.com/models")
        );
    }

    #[test]
    #[serial_test::serial]
    fn test_new_requires_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.json");
        assert!(Config::new(Some(path.to_string_lossy().into_owned())).is_err());
    }

    #[test]
    fn test_json_schema() {
        let schema = Config::json_schema().unwrap();
        assert!(schema.contains("\"repo\""));
        assert!(schema.contains("maxConnectionsPerFile"));
    }
}
