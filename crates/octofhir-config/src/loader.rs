use std::path::{Path, PathBuf};

use config::{Config, Environment, File};

use crate::ConfigError;
use crate::settings::AppConfig;

/// File read when no explicit path is given.
pub const DEFAULT_CONFIG_PATH: &str = "octofhir.toml";

/// Load the file at `path` (or [`DEFAULT_CONFIG_PATH`]) if it exists, apply
/// environment overrides and validate the result.
pub fn load_config(path: Option<&Path>) -> Result<AppConfig, ConfigError> {
    let mut builder = Config::builder();
    let pathbuf = path.map_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH), Path::to_path_buf);
    if pathbuf.exists() {
        builder = builder.add_source(File::from(pathbuf));
    }
    // Environment variable overrides, e.g., OCTOFHIR__EVENTS__BUFFER_SIZE=4096
    builder = builder.add_source(
        Environment::with_prefix("OCTOFHIR")
            .try_parsing(true)
            .separator("__"),
    );
    let merged: AppConfig = builder.build()?.try_deserialize()?;
    merged.validate()?;
    Ok(merged)
}
