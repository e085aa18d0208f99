use crate::error::AppError;
use crate::telemetry::types::{SessionConfig, StartSessionArgs};
use ::config::builder::DefaultState;
use ::config::{Config, ConfigBuilder, Environment, File, FileFormat};
use std::path::Path;

pub const ENV_PREFIX: &str = "SOLAR_DASH";

/// Layers an optional TOML file under `SOLAR_DASH_*` environment variables.
pub fn load_session_args(path: Option<&Path>) -> Result<StartSessionArgs, AppError> {
    let mut builder = Config::builder();
    if let Some(path) = path {
        builder = builder.add_source(File::from(path).format(FileFormat::Toml).required(true));
    }
    build_session_args(builder.add_source(environment_source()))
}

pub fn load_session_config(path: Option<&Path>) -> Result<SessionConfig, AppError> {
    load_session_args(path)?.normalize()
}

fn environment_source() -> Environment {
    Environment::with_prefix(ENV_PREFIX).try_parsing(true)
}

fn build_session_args(
    builder: ConfigBuilder<DefaultState>,
) -> Result<StartSessionArgs, AppError> {
    let settings = builder.build()?;
    Ok(settings.try_deserialize()?)
}
