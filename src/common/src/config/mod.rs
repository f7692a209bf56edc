use std::path::Path;

use serde::{Deserialize, Serialize};

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};

pub use crate::staging::StagingConfig;

/// HTTP server configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address the HTTP server binds to
    pub listen_addr: String,
    /// Directory where finished uploads are stored
    pub upload_dir: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: String::from("0.0.0.0:9000"),
            upload_dir: String::from(".data/uploads"),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct Configuration {
    /// HTTP server configuration
    pub server: ServerConfig,
    /// Staging area configuration (temp-file lifecycle)
    pub staging: StagingConfig,
}

impl Configuration {
    pub fn load() -> Result<Self, Box<figment::Error>> {
        let config = Figment::from(Serialized::defaults(Configuration::default()))
            .merge(Toml::file("filedrop.toml"))
            .merge(Env::prefixed("FILEDROP__").split("__"))
            .extract()
            .map_err(Box::new)?;

        Ok(config)
    }

    /// Load configuration from an explicit file path, still honoring
    /// environment overrides
    pub fn load_from_path(path: &Path) -> Result<Self, Box<figment::Error>> {
        let config = Figment::from(Serialized::defaults(Configuration::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("FILEDROP__").split("__"))
            .extract()
            .map_err(Box::new)?;

        Ok(config)
    }
}
