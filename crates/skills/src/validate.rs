use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{
    requirements::python_files,
    runtime::{EnvSource, rendered_names, template_files},
    types::{RequirementSpec, SkillCandidate, SkillManifest},
};

/// A missing requirement as surfaced to the operator. Carries the prompt and
/// example from the manifest, never any actual value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MissingValue {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub example: Option<String>,
}

impl From<&RequirementSpec> for MissingValue {
    fn from(spec: &RequirementSpec) -> Self {
        Self {
            name: spec.name.clone(),
            prompt: spec.prompt.clone(),
            example: spec.example.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnvCheckOutcome {
    pub ok: bool,
    pub checked: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub missing: Vec<MissingValue>,
}

/// Check declared environment variables are present and non-blank.
///
/// Refreshes the environment source first so freshly-supplied secrets are
/// visible without a restart. Requirements whose `when` clause evaluates
/// false are not required.
pub fn validate_env(
    candidate: &SkillCandidate,
    manifest: &SkillManifest,
    source: &mut dyn EnvSource,
) -> anyhow::Result<EnvCheckOutcome> {
    let owner = candidate.owner.as_deref();
    source.refresh(owner)?;
    let env = source.env();
    let skill_cfg = source.skill_config(&manifest.name, owner);

    let mut checked = 0;
    let mut missing = Vec::new();
    for spec in &manifest.requires.env {
        if !spec.when.is_active(&env, &skill_cfg) {
            continue;
        }
        checked += 1;
        let present = env
            .get(&spec.name)
            .is_some_and(|value| !value.trim().is_empty());
        if !present {
            missing.push(MissingValue::from(spec));
        }
    }
    Ok(EnvCheckOutcome {
        ok: missing.is_empty(),
        checked,
        missing,
    })
}

/// A template whose rendered counterpart is absent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MissingConfigFile {
    pub template: String,
    pub destination: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigCheckOutcome {
    pub ok: bool,
    pub checked: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub missing_keys: Vec<MissingValue>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub missing_files: Vec<MissingConfigFile>,
}

/// Check declared config keys and rendered template files.
///
/// Rendering templates is the environment source's responsibility, so it is
/// asked to refresh and render before the existence checks; this validator
/// itself is read-only with respect to the bundle.
pub fn validate_config_files(
    candidate: &SkillCandidate,
    manifest: &SkillManifest,
    source: &mut dyn EnvSource,
) -> anyhow::Result<ConfigCheckOutcome> {
    let owner = candidate.owner.as_deref();
    source.refresh(owner)?;
    source.render_templates(&manifest.name, &candidate.dir, owner)?;

    let env = source.env();
    let skill_cfg = source.skill_config(&manifest.name, owner);

    let mut checked = 0;
    let mut missing_keys = Vec::new();
    for spec in &manifest.requires.config {
        if !spec.when.is_active(&env, &skill_cfg) {
            continue;
        }
        checked += 1;
        let present = skill_cfg
            .get(&spec.name)
            .is_some_and(|value| !value.trim().is_empty());
        if !present {
            missing_keys.push(MissingValue::from(spec));
        }
    }

    let rendered_root = source.rendered_root(owner);
    let mut missing_files = Vec::new();
    for template in template_files(&candidate.dir) {
        let Some(file_name) = template.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let Some((_, out_name)) = rendered_names(&manifest.name, file_name) else {
            continue;
        };
        checked += 1;
        if !rendered_root.join(&out_name).is_file() {
            missing_files.push(MissingConfigFile {
                template: template
                    .strip_prefix(&candidate.dir)
                    .unwrap_or(&template)
                    .to_string_lossy()
                    .into_owned(),
                destination: out_name,
            });
        }
    }

    Ok(ConfigCheckOutcome {
        ok: missing_keys.is_empty() && missing_files.is_empty(),
        checked,
        missing_keys,
        missing_files,
    })
}

/// One active skill's outstanding requirements, as reported by the doctor
/// pass. Only produced when something is actually missing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillNeeds {
    pub skill: String,
    pub scope: crate::types::Scope,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub missing_env: Vec<MissingValue>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub missing_config: Vec<MissingValue>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub missing_bins: Vec<MissingValue>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub missing_files: Vec<MissingConfigFile>,
}

/// Survey every active skill for unmet declared requirements: the operator's
/// "what do I still need to supply" view. Skills without a parseable manifest
/// or without declared requirements are silently fine.
pub fn missing_requirements(
    cfg: &squire_config::SkillsConfig,
    owner: Option<&str>,
    source: &mut dyn EnvSource,
) -> anyhow::Result<Vec<SkillNeeds>> {
    let mut needs = Vec::new();
    for candidate in crate::discover::list_active(cfg, owner) {
        let Ok(content) = std::fs::read_to_string(candidate.skill_md_path()) else {
            continue;
        };
        let manifest = match crate::parse::parse_manifest(&content, &candidate.name) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(skill = %candidate.name, %e, "unparseable SKILL.md frontmatter");
                continue;
            },
        };
        if manifest.requires.is_empty() {
            continue;
        }

        let env_check = validate_env(&candidate, &manifest, source)?;
        let config_check = validate_config_files(&candidate, &manifest, source)?;
        let bins_check = crate::provision::validate_required_bins(&candidate, &manifest, &*source);

        if env_check.ok && config_check.ok && bins_check.ok {
            continue;
        }
        needs.push(SkillNeeds {
            skill: candidate.name.clone(),
            scope: candidate.scope,
            owner: candidate.owner.clone(),
            missing_env: env_check.missing,
            missing_config: config_check.missing_keys,
            missing_bins: bins_check.missing,
            missing_files: config_check.missing_files,
        });
    }
    Ok(needs)
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyntaxCheckOutcome {
    pub ok: bool,
    pub checked: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Per-file cap for byte-compilation; generous, since nothing executes.
const COMPILE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

/// Byte-compile every Python file in the bundle without executing any of it.
/// Uses the bundle's provisioned interpreter when one exists.
pub async fn validate_syntax(candidate: &SkillCandidate) -> anyhow::Result<SyntaxCheckOutcome> {
    let files = python_files(&candidate.dir);
    if files.is_empty() {
        return Ok(SyntaxCheckOutcome {
            ok: true,
            ..SyntaxCheckOutcome::default()
        });
    }

    let venv_python = candidate.venv_python();
    let python: &Path = if venv_python.exists() {
        &venv_python
    } else {
        Path::new("python3")
    };

    for file in &files {
        let run = crate::provision::run_with_timeout(
            tokio::process::Command::new(python)
                .arg("-m")
                .arg("py_compile")
                .arg(file)
                .current_dir(&candidate.dir),
            COMPILE_TIMEOUT,
        )
        .await;
        let failure = match run {
            crate::provision::RunResult::Completed(out) if out.status.success() => None,
            crate::provision::RunResult::Completed(out) => {
                Some(truncate(&String::from_utf8_lossy(&out.stderr), 2000))
            },
            crate::provision::RunResult::TimedOut => Some(format!(
                "py_compile timed out after {}s",
                COMPILE_TIMEOUT.as_secs()
            )),
            crate::provision::RunResult::NotFound => {
                Some(format!("{} not found on the host", python.display()))
            },
            crate::provision::RunResult::Failed(e) => Some(e),
        };
        if let Some(error) = failure {
            return Ok(SyntaxCheckOutcome {
                ok: false,
                checked: files.len(),
                error: Some(format!("{}: {error}", relative_display(file, &candidate.dir))),
            });
        }
    }
    Ok(SyntaxCheckOutcome {
        ok: true,
        checked: files.len(),
        error: None,
    })
}

/// Keeps the tail of captured process output. Interpreter tracebacks and
/// pip resolution errors land on the last lines, so those must survive
/// even when a chatty script floods stdout first.
pub(crate) fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut start = s.len() - max;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    format!("…{}", &s[start..])
}

pub(crate) fn relative_display(path: &Path, base: &Path) -> String {
    path.strip_prefix(base)
        .unwrap_or(path)
        .to_string_lossy()
        .into_owned()
}
