use std::{collections::BTreeMap, fmt, path::PathBuf};

use serde::{Deserialize, Serialize};

/// Canonical manifest file name at the bundle root.
pub const SKILL_MD: &str = "SKILL.md";
/// Alternate-cased manifest name, renamed on first touch.
pub const SKILL_MD_ALT: &str = "skill.md";
/// Per-skill install list.
pub const REQUIREMENTS_FILE: &str = "requirements.txt";
/// Per-skill isolated runtime environment.
pub const VENV_DIR: &str = ".venv";
/// Durable failure marker.
pub const FAILED_FILE: &str = "FAILED.json";
/// Machine-readable preflight report.
pub const REPORT_JSON: &str = "onboarding_report.json";
/// Human-readable preflight report.
pub const REPORT_MD: &str = "ONBOARDING_REPORT.md";

/// Directories inside a skills root that are not actual skills.
pub const RESERVED_DIR_NAMES: &[&str] = &["pending", "failed", ".venv", ".venvs", "__pycache__"];

// ── Candidates ──────────────────────────────────────────────────────────────

/// Visibility of a skill: shared across all owners, or scoped to one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    Shared,
    Owner,
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::Shared => write!(f, "shared"),
            Scope::Owner => write!(f, "owner"),
        }
    }
}

/// One pending (or, for repair, active) skill directory.
///
/// Candidates are recomputed on every discovery pass and never persisted;
/// identity is `(scope, owner, name)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkillCandidate {
    pub scope: Scope,
    pub owner: Option<String>,
    pub name: String,
    pub dir: PathBuf,
}

impl SkillCandidate {
    pub fn skill_md_path(&self) -> PathBuf {
        self.dir.join(SKILL_MD)
    }

    pub fn requirements_path(&self) -> PathBuf {
        self.dir.join(REQUIREMENTS_FILE)
    }

    pub fn venv_dir(&self) -> PathBuf {
        self.dir.join(VENV_DIR)
    }

    /// The isolated environment's interpreter, if provisioned.
    pub fn venv_python(&self) -> PathBuf {
        self.venv_dir().join("bin").join("python")
    }

    pub fn failed_path(&self) -> PathBuf {
        self.dir.join(FAILED_FILE)
    }
}

// ── Requirements ────────────────────────────────────────────────────────────

/// Conditional activation of a requirement.
///
/// `equals: None` means "truthy": the referenced value just has to be present
/// and non-blank.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WhenClause {
    #[default]
    Always,
    ConfigEquals {
        key: String,
        equals: Option<String>,
    },
    EnvEquals {
        key: String,
        equals: Option<String>,
    },
}

impl WhenClause {
    /// Evaluate against an env snapshot and a per-skill config map.
    pub fn is_active(
        &self,
        env: &BTreeMap<String, String>,
        skill_cfg: &BTreeMap<String, String>,
    ) -> bool {
        match self {
            WhenClause::Always => true,
            WhenClause::ConfigEquals { key, equals } => matches_value(skill_cfg.get(key), equals),
            WhenClause::EnvEquals { key, equals } => matches_value(env.get(key), equals),
        }
    }
}

fn matches_value(actual: Option<&String>, equals: &Option<String>) -> bool {
    match (actual, equals) {
        (Some(actual), Some(want)) => actual == want,
        (Some(actual), None) => !actual.trim().is_empty(),
        (None, _) => false,
    }
}

/// A declared requirement: an env var, config key, or executable name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequirementSpec {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub example: Option<String>,
    #[serde(default)]
    pub when: WhenClause,
}

impl RequirementSpec {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }
}

/// `requires` section of the manifest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkillRequires {
    #[serde(default)]
    pub env: Vec<RequirementSpec>,
    #[serde(default)]
    pub config: Vec<RequirementSpec>,
    #[serde(default)]
    pub bins: Vec<RequirementSpec>,
}

impl SkillRequires {
    pub fn is_empty(&self) -> bool {
        self.env.is_empty() && self.config.is_empty() && self.bins.is_empty()
    }
}

/// One entry of the manifest's `install` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallSpec {
    pub kind: InstallKind,
    #[serde(default)]
    pub package: Option<String>,
}

/// Install method kind. Only pip entries are consumed by the pipeline;
/// anything else is carried through for reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstallKind {
    Pip,
    #[serde(other)]
    Other,
}

/// Parsed SKILL.md frontmatter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SkillManifest {
    pub name: String,
    pub description: String,
    pub requires: SkillRequires,
    pub install: Vec<InstallSpec>,
}

impl SkillManifest {
    /// Packages declared via `install: [{kind: pip, package: ...}]`,
    /// de-duplicated preserving order.
    pub fn pip_packages(&self) -> Vec<String> {
        let mut seen = std::collections::BTreeSet::new();
        self.install
            .iter()
            .filter(|spec| spec.kind == InstallKind::Pip)
            .filter_map(|spec| spec.package.as_deref())
            .filter(|pkg| !pkg.is_empty() && seen.insert(pkg.to_string()))
            .map(str::to_string)
            .collect()
    }
}

// ── Failure marker & report ─────────────────────────────────────────────────

/// Durable `FAILED.json` payload. Presence means "do not trust this bundle".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureRecord {
    pub status: String,
    pub stage: String,
    pub error: String,
    pub timestamp: String,
    pub scope: Scope,
    pub user_id: Option<String>,
    pub skill_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

/// One stage's outcome inside a preflight report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageRecord {
    pub stage: String,
    pub result: serde_json::Value,
}

/// Per-bundle preflight report, written on every run regardless of outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreflightReport {
    pub skill: String,
    pub scope: Scope,
    pub user_id: Option<String>,
    pub timestamp: String,
    pub ok: bool,
    pub steps: Vec<StageRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PreflightReport {
    pub fn step(&self, stage: &str) -> Option<&serde_json::Value> {
        self.steps
            .iter()
            .find(|s| s.stage == stage)
            .map(|s| &s.result)
    }
}

// ── Onboarding summaries ────────────────────────────────────────────────────

/// Per-bundle outcome of an onboarding pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OnboardStatus {
    Onboarded,
    Skipped,
    Failed,
    DryRun,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OnboardOutcome {
    pub candidate: String,
    pub scope: Scope,
    pub status: OnboardStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Set when an already-active copy was backed up and replaced.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub updated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report: Option<PreflightReport>,
}

/// Whole-pass summary for `onboard_pending`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OnboardSummary {
    pub ok: bool,
    pub total: usize,
    pub onboarded: usize,
    pub skipped: usize,
    pub failed: usize,
    pub results: Vec<OnboardOutcome>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(
        env: &[(&str, &str)],
        cfg: &[(&str, &str)],
    ) -> (BTreeMap<String, String>, BTreeMap<String, String>) {
        let to_map = |pairs: &[(&str, &str)]| {
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect()
        };
        (to_map(env), to_map(cfg))
    }

    #[test]
    fn when_always_is_active() {
        let (env, cfg) = ctx(&[], &[]);
        assert!(WhenClause::Always.is_active(&env, &cfg));
    }

    #[test]
    fn when_env_equals() {
        let (env, cfg) = ctx(&[("MODE", "imap")], &[]);
        let hit = WhenClause::EnvEquals {
            key: "MODE".into(),
            equals: Some("imap".into()),
        };
        let miss = WhenClause::EnvEquals {
            key: "MODE".into(),
            equals: Some("maildir".into()),
        };
        assert!(hit.is_active(&env, &cfg));
        assert!(!miss.is_active(&env, &cfg));
    }

    #[test]
    fn when_config_truthy() {
        let (env, cfg) = ctx(&[], &[("backend", "imap"), ("blank", "  ")]);
        let present = WhenClause::ConfigEquals {
            key: "backend".into(),
            equals: None,
        };
        let blank = WhenClause::ConfigEquals {
            key: "blank".into(),
            equals: None,
        };
        let absent = WhenClause::ConfigEquals {
            key: "missing".into(),
            equals: None,
        };
        assert!(present.is_active(&env, &cfg));
        assert!(!blank.is_active(&env, &cfg));
        assert!(!absent.is_active(&env, &cfg));
    }

    #[test]
    fn pip_packages_dedupe_and_filter() {
        let manifest = SkillManifest {
            name: "demo".into(),
            description: String::new(),
            requires: SkillRequires::default(),
            install: vec![
                InstallSpec {
                    kind: InstallKind::Pip,
                    package: Some("nano-pdf".into()),
                },
                InstallSpec {
                    kind: InstallKind::Pip,
                    package: Some("nano-pdf".into()),
                },
                InstallSpec {
                    kind: InstallKind::Other,
                    package: Some("brew-only".into()),
                },
                InstallSpec {
                    kind: InstallKind::Pip,
                    package: None,
                },
            ],
        };
        assert_eq!(manifest.pip_packages(), vec!["nano-pdf"]);
    }
}
