// Configuration management module
// TOML settings for the embedding/completion services, chunking, retrieval and index

pub mod settings;


pub use settings::{
    API_KEY_ENV_VAR, CompletionConfig, Config, ConfigError, EmbeddingConfig, HOME_ENV_VAR,
    IndexConfig, endpoint_url,
};

/// Get the configuration directory path
#[inline]
pub fn get_config_dir() -> Result<std::path::PathBuf, ConfigError> {
    Config::config_dir()
}
