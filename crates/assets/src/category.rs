/// Kinds of asset, declared in processing order.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    serde::Serialize,
    serde::Deserialize,
    strum::Display,
)]
#[serde(rename_all = "lowercase")]
pub enum AssetCategory {
    #[strum(serialize = "models")]
    Model,
    #[strum(serialize = "configs")]
    Config,
    #[strum(serialize = "voices")]
    Voice,
    #[strum(serialize = "thumbnails")]
    Thumbnail,
}

impl AssetCategory {
    pub const ALL: [AssetCategory; 4] = [
        AssetCategory::Model,
        AssetCategory::Config,
        AssetCategory::Voice,
        AssetCategory::Thumbnail,
    ];

    /// Singular noun used in per-item progress messages.
    pub fn label(&self) -> &'static str {
        match self {
            AssetCategory::Model => "model",
            AssetCategory::Config => "config file",
            AssetCategory::Voice => "voice",
            AssetCategory::Thumbnail => "thumbnail",
        }
    }
}
