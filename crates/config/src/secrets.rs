//! Skill secrets file: per-skill env vars and declarative config values.
//!
//! ```yaml
//! skills:
//!   himalaya:
//!     env:
//!       HIMALAYA_TOKEN: "..."
//!     config:
//!       backend: imap
//!     users:
//!       ada:
//!         env:
//!           HIMALAYA_TOKEN: "..."   # per-owner override
//! ```
//!
//! The store is a plain snapshot of the file; callers re-load it whenever
//! fresh values must become visible (the "runtime refresh" path).

use std::{collections::BTreeMap, path::Path};

use {serde::Deserialize, tracing::debug};

use crate::error::{Context, Result};

#[derive(Debug, Clone, Default, Deserialize)]
struct SecretsFile {
    #[serde(default)]
    skills: BTreeMap<String, SkillSecrets>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct SkillSecrets {
    #[serde(default)]
    env: BTreeMap<String, serde_yaml::Value>,
    #[serde(default)]
    config: BTreeMap<String, serde_yaml::Value>,
    #[serde(default)]
    users: BTreeMap<String, SkillSecrets>,
}

/// Parsed snapshot of the secrets file.
#[derive(Debug, Clone, Default)]
pub struct SecretsStore {
    file: SecretsFile,
}

impl SecretsStore {
    /// Load the secrets file. A missing file yields an empty store; a file
    /// that exists but fails to parse is an error.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "secrets file not found, using empty store");
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let file: SecretsFile = serde_yaml::from_str(&raw)
            .with_context(|| format!("invalid secrets file {}", path.display()))?;
        Ok(Self { file })
    }

    /// All skill env vars merged into one map, per-owner values overriding
    /// skill-level ones. Null values are skipped; scalars are stringified.
    pub fn merged_env(&self, owner: Option<&str>) -> BTreeMap<String, String> {
        let mut merged = BTreeMap::new();
        for secrets in self.file.skills.values() {
            collect_values(&secrets.env, &mut merged);
            if let Some(owner) = owner
                && let Some(user) = secrets.users.get(owner)
            {
                collect_values(&user.env, &mut merged);
            }
        }
        merged
    }

    /// Declared config values for one skill, per-owner values overriding.
    pub fn skill_config(&self, skill: &str, owner: Option<&str>) -> BTreeMap<String, String> {
        let mut merged = BTreeMap::new();
        let Some(secrets) = self
            .file
            .skills
            .get(skill)
            .or_else(|| self.file.skills.get(&skill.to_lowercase()))
        else {
            return merged;
        };
        collect_values(&secrets.config, &mut merged);
        if let Some(owner) = owner
            && let Some(user) = secrets.users.get(owner)
        {
            collect_values(&user.config, &mut merged);
        }
        merged
    }

    /// Names of skills that declare any secrets.
    pub fn skill_names(&self) -> Vec<&str> {
        self.file.skills.keys().map(String::as_str).collect()
    }
}

fn collect_values(
    src: &BTreeMap<String, serde_yaml::Value>,
    dst: &mut BTreeMap<String, String>,
) {
    for (key, value) in src {
        if let Some(s) = stringify(value) {
            dst.insert(key.clone(), s);
        }
    }
}

/// Scalars become strings; null and structured values are dropped.
fn stringify(value: &serde_yaml::Value) -> Option<String> {
    match value {
        serde_yaml::Value::String(s) => Some(s.clone()),
        serde_yaml::Value::Number(n) => Some(n.to_string()),
        serde_yaml::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
skills:
  himalaya:
    env:
      HIMALAYA_TOKEN: global-token
      HIMALAYA_PORT: 993
    config:
      backend: imap
    users:
      ada:
        env:
          HIMALAYA_TOKEN: ada-token
        config:
          backend: maildir
  weather:
    env:
      WEATHER_API_KEY: wk
"#;

    fn store() -> SecretsStore {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("secrets.yml");
        std::fs::write(&path, SAMPLE).unwrap();
        SecretsStore::load(&path).unwrap()
    }

    #[test]
    fn missing_file_is_empty_store() {
        let store = SecretsStore::load(Path::new("/nonexistent/secrets.yml")).unwrap();
        assert!(store.merged_env(None).is_empty());
    }

    #[test]
    fn merged_env_spans_all_skills() {
        let env = store().merged_env(None);
        assert_eq!(env.get("HIMALAYA_TOKEN").map(String::as_str), Some("global-token"));
        assert_eq!(env.get("WEATHER_API_KEY").map(String::as_str), Some("wk"));
        // Numbers are stringified.
        assert_eq!(env.get("HIMALAYA_PORT").map(String::as_str), Some("993"));
    }

    #[test]
    fn owner_env_overrides_skill_env() {
        let env = store().merged_env(Some("ada"));
        assert_eq!(env.get("HIMALAYA_TOKEN").map(String::as_str), Some("ada-token"));
    }

    #[test]
    fn skill_config_with_owner_override() {
        let s = store();
        assert_eq!(
            s.skill_config("himalaya", None).get("backend").map(String::as_str),
            Some("imap")
        );
        assert_eq!(
            s.skill_config("himalaya", Some("ada"))
                .get("backend")
                .map(String::as_str),
            Some("maildir")
        );
        assert!(s.skill_config("unknown", None).is_empty());
    }

    #[test]
    fn invalid_yaml_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("secrets.yml");
        std::fs::write(&path, "skills: [not: a: map").unwrap();
        assert!(SecretsStore::load(&path).is_err());
    }
}
