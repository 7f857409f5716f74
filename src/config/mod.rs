pub mod link_config;

use std::path::Path;

use anyhow::Result;
use serde::{Deserialize, Serialize};

pub use link_config::LinkConfig;

/// Top-level configuration file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub link: LinkConfig,
}

impl AppConfig {
    /// Loads `path`, falling back to defaults when the file does not exist.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let config: Self = link_config::load_json(path.as_ref()).await?;
        config.link.validate()?;
        Ok(config)
    }

    pub async fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        link_config::save_json(self, path.as_ref()).await
    }
}
