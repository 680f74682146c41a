//! Configuration loading, env substitution, and the skill secrets source.
//!
//! Config files: `squire.toml`, `squire.yaml`, or `squire.json`
//! Searched in `./` then `~/.config/squire/`.
//!
//! Supports `${ENV_VAR}` substitution in all string values.

pub mod env_subst;
pub mod error;
pub mod loader;
pub mod schema;
pub mod secrets;

pub use {
    error::{Error, Result},
    loader::{config_dir, discover_and_load, find_or_default_config_path, load_config},
    schema::{SkillsConfig, SquireConfig},
    secrets::SecretsStore,
};
