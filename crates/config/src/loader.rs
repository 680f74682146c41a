use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::{
    env_subst::substitute_env,
    error::{Context, Result},
    schema::SquireConfig,
};

/// Standard config file names, checked in order.
const CONFIG_FILENAMES: &[&str] = &["squire.toml", "squire.yaml", "squire.yml", "squire.json"];

/// Load config from the given path (any supported format).
pub fn load_config(path: &Path) -> Result<SquireConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let raw = substitute_env(&raw);
    parse_config(&raw, path)
}

/// Discover and load config from standard locations.
///
/// Search order:
/// 1. `./squire.{toml,yaml,yml,json}` (project-local)
/// 2. `~/.config/squire/squire.{toml,yaml,yml,json}` (user-global)
///
/// Returns `SquireConfig::default()` if no config file is found.
pub fn discover_and_load() -> SquireConfig {
    if let Some(path) = find_config_file() {
        debug!(path = %path.display(), "loading config");
        match load_config(&path) {
            Ok(cfg) => return cfg,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to load config, using defaults");
            },
        }
    } else {
        debug!("no config file found, using defaults");
    }
    SquireConfig::default()
}

/// Find the first config file in standard locations.
fn find_config_file() -> Option<PathBuf> {
    for name in CONFIG_FILENAMES {
        let p = PathBuf::from(name);
        if p.exists() {
            return Some(p);
        }
    }

    if let Some(dir) = config_dir() {
        for name in CONFIG_FILENAMES {
            let p = dir.join(name);
            if p.exists() {
                return Some(p);
            }
        }
    }

    None
}

/// Returns the user-global config directory (`~/.config/squire/`).
pub fn config_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "squire").map(|d| d.config_dir().to_path_buf())
}

/// Returns the path of an existing config file, or the default TOML path.
pub fn find_or_default_config_path() -> PathBuf {
    if let Some(path) = find_config_file() {
        return path;
    }
    config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("squire.toml")
}

fn parse_config(raw: &str, path: &Path) -> Result<SquireConfig> {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("toml");

    match ext {
        "toml" => toml::from_str(raw).context("invalid TOML config"),
        "yaml" | "yml" => serde_yaml::from_str(raw).context("invalid YAML config"),
        "json" => serde_json::from_str(raw).context("invalid JSON config"),
        _ => Err(crate::Error::message(format!(
            "unsupported config format: .{ext}"
        ))),
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_toml_config() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("squire.toml");
        std::fs::write(
            &path,
            "[skills]\nskills_dir = \"/data/skills\"\npip_timeout_secs = 60\n",
        )
        .unwrap();
        let cfg = load_config(&path).unwrap();
        assert_eq!(cfg.skills.skills_dir, "/data/skills");
        assert_eq!(cfg.skills.pip_timeout_secs, 60);
        // Untouched fields keep their defaults.
        assert_eq!(cfg.skills.smoke_max_scripts, 5);
    }

    #[test]
    fn load_yaml_config() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("squire.yaml");
        std::fs::write(&path, "skills:\n  shared_dir: /data/skills/shared\n").unwrap();
        let cfg = load_config(&path).unwrap();
        assert_eq!(cfg.skills.shared_dir, "/data/skills/shared");
    }

    #[test]
    fn invalid_config_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("squire.toml");
        std::fs::write(&path, "not valid toml [[[").unwrap();
        assert!(load_config(&path).is_err());
    }
}
