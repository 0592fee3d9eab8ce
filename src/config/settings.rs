use super::ConfigStore;
use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;

/// Settings for the tool itself (as opposed to the persisted build document).
///
/// Layered with the `config` crate, later sources winning:
/// 1. Built-in defaults
/// 2. `unreal-builder.{toml,yaml,json}` in the working directory, or an explicit file
/// 3. `UEB_*` environment variables (`UEB_DEBUG=true`, `UEB_DATA_FILE=...`)
#[derive(Debug, Clone, Deserialize)]
pub struct RuntimeSettings {
    /// Location of the persisted JSON document
    pub data_file: Utf8PathBuf,

    /// Directory for rotating tracing logs
    pub log_dir: Utf8PathBuf,

    pub debug: bool,

    /// Mirror tracing output to the console
    pub console_log: bool,

    /// Write the log file as JSON lines
    pub json_log: bool,
}

impl RuntimeSettings {
    /// Load settings, requiring `file` to exist when one is given
    pub fn load(file: Option<&Utf8Path>) -> Result<Self> {
        let default_data_file = ConfigStore::default_path();

        let builder = ::config::Config::builder()
            .set_default("data_file", default_data_file.as_str())?
            .set_default("log_dir", "logs")?
            .set_default("debug", false)?
            .set_default("console_log", false)?
            .set_default("json_log", false)?;

        let builder = match file {
            Some(path) => {
                builder.add_source(::config::File::with_name(path.as_str()).required(true))
            }
            None => builder.add_source(::config::File::with_name("unreal-builder").required(false)),
        };

        let settings = builder
            .add_source(::config::Environment::with_prefix("UEB").try_parsing(true))
            .build()
            .context("Failed to assemble runtime settings")?
            .try_deserialize::<RuntimeSettings>()
            .context("Failed to parse runtime settings")?;

        Ok(settings)
    }
}
