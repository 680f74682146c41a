use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use {
    anyhow::Context,
    serde::{Deserialize, Serialize},
    squire_config::{SecretsStore, SkillsConfig},
    walkdir::WalkDir,
};

/// Result of one refresh call, for the preflight report.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RefreshOutcome {
    pub ok: bool,
    /// Environment variables applied from the secrets source.
    pub applied: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub skills: Vec<String>,
}

/// Live environment collaborator for the pipeline.
///
/// Stages never read the process environment directly; they take a snapshot
/// from here so pipelines for different owners stay logically isolated and
/// freshly-supplied secrets become visible without a restart.
pub trait EnvSource: Send + Sync {
    /// Re-read the secrets source and fold the owner's variables into the
    /// live view.
    fn refresh(&mut self, owner: Option<&str>) -> anyhow::Result<RefreshOutcome>;

    /// Snapshot of the current environment.
    fn env(&self) -> BTreeMap<String, String>;

    /// Declarative config values for one skill, owner overrides applied.
    fn skill_config(&self, skill: &str, owner: Option<&str>) -> BTreeMap<String, String>;

    /// Render the bundle's template files into the owner's materialized root,
    /// where a config value supplies their content. Returns written paths.
    fn render_templates(
        &self,
        skill: &str,
        skill_dir: &Path,
        owner: Option<&str>,
    ) -> anyhow::Result<Vec<PathBuf>>;

    /// Where rendered config files for this owner live.
    fn rendered_root(&self, owner: Option<&str>) -> PathBuf;
}

/// [`EnvSource`] backed by the secrets file.
///
/// The view is seeded from the process environment once at construction;
/// refreshes overlay secrets on top of that seed without mutating the
/// process-global environment.
pub struct SecretsEnvSource {
    cfg: SkillsConfig,
    env: BTreeMap<String, String>,
}

impl SecretsEnvSource {
    pub fn new(cfg: SkillsConfig) -> Self {
        Self {
            cfg,
            env: std::env::vars().collect(),
        }
    }
}

impl EnvSource for SecretsEnvSource {
    fn refresh(&mut self, owner: Option<&str>) -> anyhow::Result<RefreshOutcome> {
        let store = SecretsStore::load(&self.cfg.secrets_path())?;
        let merged = store.merged_env(owner);
        let mut applied = 0;
        for (key, value) in merged {
            if !is_exportable_env_key(&key) {
                continue;
            }
            self.env.insert(key, value);
            applied += 1;
        }
        Ok(RefreshOutcome {
            ok: true,
            applied,
            skills: store.skill_names().iter().map(|s| s.to_string()).collect(),
        })
    }

    fn env(&self) -> BTreeMap<String, String> {
        self.env.clone()
    }

    fn skill_config(&self, skill: &str, owner: Option<&str>) -> BTreeMap<String, String> {
        match SecretsStore::load(&self.cfg.secrets_path()) {
            Ok(store) => store.skill_config(skill, owner),
            Err(e) => {
                tracing::warn!(%e, skill, "failed to load secrets for skill config");
                BTreeMap::new()
            },
        }
    }

    fn render_templates(
        &self,
        skill: &str,
        skill_dir: &Path,
        owner: Option<&str>,
    ) -> anyhow::Result<Vec<PathBuf>> {
        let config = self.skill_config(skill, owner);
        let out_dir = self.rendered_root(owner);
        let mut written = Vec::new();

        for template in template_files(skill_dir) {
            let Some(file_name) = template.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Some((dest_name, out_name)) = rendered_names(skill, file_name) else {
                continue;
            };
            // Content may be keyed by either the bare destination name or the
            // prefixed one.
            let Some(content) = config.get(&out_name).or_else(|| config.get(&dest_name)) else {
                continue;
            };
            std::fs::create_dir_all(&out_dir)
                .with_context(|| format!("creating {}", out_dir.display()))?;
            let dest = out_dir.join(&out_name);
            // Placeholders resolve against the refreshed view, not the
            // process environment.
            let rendered =
                squire_config::env_subst::substitute_with(content, |name| {
                    self.env.get(name).cloned()
                });
            std::fs::write(&dest, rendered)
                .with_context(|| format!("rendering {}", dest.display()))?;
            written.push(dest);
        }
        Ok(written)
    }

    fn rendered_root(&self, owner: Option<&str>) -> PathBuf {
        self.cfg.rendered_root(owner)
    }
}

/// Only uppercase names are exported as environment variables.
fn is_exportable_env_key(key: &str) -> bool {
    !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_')
        && !key.starts_with(|c: char| c.is_ascii_digit())
}

/// Template files (`*_example` / `*.example`) anywhere in the bundle, minus
/// runtime artifacts.
pub fn template_files(skill_dir: &Path) -> Vec<PathBuf> {
    let mut out: Vec<PathBuf> = WalkDir::new(skill_dir)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| {
            !(e.depth() > 0
                && e.file_type().is_dir()
                && e.file_name()
                    .to_str()
                    .is_some_and(|n| n == ".venv" || n == ".venvs" || n == "__pycache__"))
        })
        .flatten()
        .filter(|e| e.file_type().is_file())
        .filter(|e| {
            e.file_name()
                .to_str()
                .is_some_and(|n| n.ends_with("_example") || n.ends_with(".example"))
        })
        .map(|e| e.into_path())
        .collect();
    out.sort();
    out
}

/// Destination names for one template file: `(bare, skill-prefixed)`.
///
/// The bare name drops the template suffix; the output name gains a
/// `<skill>__` prefix unless it already starts with the skill name, to avoid
/// collisions between skills sharing one materialized root.
pub fn rendered_names(skill: &str, template_name: &str) -> Option<(String, String)> {
    let dest_name = template_name
        .strip_suffix("_example")
        .or_else(|| template_name.strip_suffix(".example"))?;
    if dest_name.is_empty() {
        return None;
    }
    let out_name = if dest_name == skill || dest_name.starts_with(&format!("{skill}.")) {
        dest_name.to_string()
    } else {
        format!("{skill}__{dest_name}")
    };
    Some((dest_name.to_string(), out_name))
}

/// In-memory [`EnvSource`] for tests and dry planning.
#[derive(Default)]
pub struct StaticEnv {
    pub env: BTreeMap<String, String>,
    pub config: BTreeMap<String, BTreeMap<String, String>>,
    pub rendered_base: PathBuf,
}

impl EnvSource for StaticEnv {
    fn refresh(&mut self, _owner: Option<&str>) -> anyhow::Result<RefreshOutcome> {
        Ok(RefreshOutcome {
            ok: true,
            applied: self.env.len(),
            skills: Vec::new(),
        })
    }

    fn env(&self) -> BTreeMap<String, String> {
        self.env.clone()
    }

    fn skill_config(&self, skill: &str, _owner: Option<&str>) -> BTreeMap<String, String> {
        self.config.get(skill).cloned().unwrap_or_default()
    }

    fn render_templates(
        &self,
        _skill: &str,
        _skill_dir: &Path,
        _owner: Option<&str>,
    ) -> anyhow::Result<Vec<PathBuf>> {
        Ok(Vec::new())
    }

    fn rendered_root(&self, owner: Option<&str>) -> PathBuf {
        self.rendered_base.join(owner.unwrap_or("shared")).join("tmp")
    }
}
