//! Config schema types.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SquireConfig {
    pub skills: SkillsConfig,
}

/// Skill pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SkillsConfig {
    /// Base directory holding per-owner skill roots.
    pub skills_dir: String,
    /// Directory holding skills visible to all owners.
    pub shared_dir: String,
    /// Base directory for per-owner working files; rendered config files land
    /// under `<workspace_dir>/<owner>/tmp/`.
    pub workspace_dir: String,
    /// Path to the secrets file (skill env vars and config values).
    pub secrets_path: String,
    /// Timeout for installing a skill's requirements file (per skill).
    pub pip_timeout_secs: u64,
    /// Timeout for each script run during onboarding smoke tests.
    pub script_timeout_secs: u64,
    /// Maximum number of scripts executed per skill during smoke tests.
    pub smoke_max_scripts: usize,
    /// Cap on candidates processed in one bulk preflight pass.
    pub preflight_max_skills: usize,
    /// Whether requirement extraction may write requirements.txt.
    pub generate_requirements: bool,
    /// Whether bulk preflight passes install dependencies.
    pub preflight_install_deps: bool,
}

impl Default for SkillsConfig {
    fn default() -> Self {
        Self {
            skills_dir: "./skills".into(),
            shared_dir: "./skills/shared".into(),
            workspace_dir: "./workspace".into(),
            secrets_path: "secrets.yml".into(),
            pip_timeout_secs: 180,
            script_timeout_secs: 20,
            smoke_max_scripts: 5,
            preflight_max_skills: 200,
            generate_requirements: true,
            preflight_install_deps: true,
        }
    }
}

impl SkillsConfig {
    /// Root for one owner's active skills.
    pub fn owner_root(&self, owner: &str) -> PathBuf {
        Path::new(&self.skills_dir).join(owner)
    }

    /// Root for shared active skills.
    pub fn shared_root(&self) -> PathBuf {
        PathBuf::from(&self.shared_dir)
    }

    /// Staging directory for one owner's pending skills.
    pub fn owner_pending_dir(&self, owner: &str) -> PathBuf {
        self.owner_root(owner).join("pending")
    }

    /// Staging directory for shared pending skills.
    pub fn shared_pending_dir(&self) -> PathBuf {
        self.shared_root().join("pending")
    }

    /// Destination directory for rendered config files.
    ///
    /// Shared-scope skills render into the invoking owner's root; when no
    /// owner is known they fall back to a `shared` slot.
    pub fn rendered_root(&self, owner: Option<&str>) -> PathBuf {
        Path::new(&self.workspace_dir)
            .join(owner.unwrap_or("shared"))
            .join("tmp")
    }

    pub fn secrets_path(&self) -> PathBuf {
        PathBuf::from(&self.secrets_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = SkillsConfig::default();
        assert_eq!(cfg.pip_timeout_secs, 180);
        assert_eq!(cfg.script_timeout_secs, 20);
        assert_eq!(cfg.smoke_max_scripts, 5);
        assert!(cfg.generate_requirements);
    }

    #[test]
    fn path_helpers_compose() {
        let cfg = SkillsConfig {
            skills_dir: "/srv/skills".into(),
            shared_dir: "/srv/skills/shared".into(),
            workspace_dir: "/srv/workspace".into(),
            ..SkillsConfig::default()
        };
        assert_eq!(
            cfg.owner_pending_dir("ada"),
            PathBuf::from("/srv/skills/ada/pending")
        );
        assert_eq!(
            cfg.shared_pending_dir(),
            PathBuf::from("/srv/skills/shared/pending")
        );
        assert_eq!(
            cfg.rendered_root(Some("ada")),
            PathBuf::from("/srv/workspace/ada/tmp")
        );
        assert_eq!(
            cfg.rendered_root(None),
            PathBuf::from("/srv/workspace/shared/tmp")
        );
    }
}
