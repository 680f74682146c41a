use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::{
    provision::{RunResult, run_with_timeout},
    runtime::EnvSource,
    types::SkillCandidate,
    validate::{relative_display, truncate},
};

/// Marker variable set for scripts so they can detect an onboarding run.
pub const ONBOARDING_ENV_MARKER: &str = "SQUIRE_SKILL_ONBOARDING";

const OUTPUT_CAP: usize = 8000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptFailure {
    pub script: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub returncode: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub missing_module: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SmokeOutcome {
    pub ok: bool,
    pub ran: usize,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub skipped: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<ScriptFailure>,
    /// Module names extracted from "No module named" errors across all
    /// failures; these point at dependencies the static extraction missed.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub missing_modules: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub python: Option<String>,
}

/// Run a small, conservative subset of the bundle's scripts.
///
/// Deliberately not every script: the designated entry script plus scripts
/// under `scripts/`, capped at `max_scripts`. Each runs in the bundle
/// directory under the provisioned interpreter (host interpreter if none),
/// with a per-script timeout and the onboarding marker variable set.
pub async fn run_scripts_smoke_test(
    candidate: &SkillCandidate,
    source: &mut dyn EnvSource,
    timeout_secs: u64,
    max_scripts: usize,
) -> anyhow::Result<SmokeOutcome> {
    let scripts = scripts_to_smoke_test(&candidate.dir, max_scripts);
    if scripts.is_empty() {
        return Ok(SmokeOutcome {
            ok: true,
            skipped: true,
            reason: Some("no scripts to run".into()),
            ..SmokeOutcome::default()
        });
    }

    source.refresh(candidate.owner.as_deref())?;
    let mut env = source.env();
    env.entry("PYTHONUNBUFFERED".into()).or_insert_with(|| "1".into());
    env.insert(ONBOARDING_ENV_MARKER.into(), "1".into());

    let py = runtime_python(candidate);
    let timeout = Duration::from_secs(timeout_secs);
    let mut failures = Vec::new();
    let mut missing_modules: Vec<String> = Vec::new();

    for script in &scripts {
        let run = run_with_timeout(
            tokio::process::Command::new(&py)
                .arg(script)
                .current_dir(&candidate.dir)
                .envs(&env),
            timeout,
        )
        .await;

        let rel = relative_display(script, &candidate.dir);
        match run {
            RunResult::Completed(out) if out.status.success() => {},
            RunResult::Completed(out) => {
                let stderr = truncate(&String::from_utf8_lossy(&out.stderr), OUTPUT_CAP);
                let missing = parse_missing_module(&stderr);
                if let Some(module) = &missing
                    && !missing_modules.contains(module)
                {
                    missing_modules.push(module.clone());
                }
                failures.push(ScriptFailure {
                    script: rel,
                    returncode: out.status.code(),
                    stdout: truncate(&String::from_utf8_lossy(&out.stdout), OUTPUT_CAP),
                    stderr,
                    missing_module: missing,
                });
            },
            RunResult::TimedOut => failures.push(ScriptFailure {
                script: rel,
                returncode: None,
                stdout: String::new(),
                stderr: format!("timed out after {timeout_secs}s"),
                missing_module: None,
            }),
            RunResult::NotFound => failures.push(ScriptFailure {
                script: rel,
                returncode: None,
                stdout: String::new(),
                stderr: format!("interpreter not found: {}", py.display()),
                missing_module: None,
            }),
            RunResult::Failed(e) => failures.push(ScriptFailure {
                script: rel,
                returncode: None,
                stdout: String::new(),
                stderr: e,
                missing_module: None,
            }),
        }
    }

    missing_modules.sort();
    Ok(SmokeOutcome {
        ok: failures.is_empty(),
        ran: scripts.len(),
        failures,
        missing_modules,
        python: Some(py.display().to_string()),
        ..SmokeOutcome::default()
    })
}

/// The provisioned interpreter when present, else the host's.
fn runtime_python(candidate: &SkillCandidate) -> PathBuf {
    let venv_py = candidate.venv_python();
    if venv_py.exists() {
        venv_py
    } else {
        PathBuf::from("python3")
    }
}

/// Entry script plus `scripts/` contents, sorted, dunder-free, capped.
fn scripts_to_smoke_test(skill_dir: &Path, max_scripts: usize) -> Vec<PathBuf> {
    let mut scripts = Vec::new();

    let entry = skill_dir.join("skill.py");
    if entry.is_file() {
        scripts.push(entry);
    }

    let scripts_dir = skill_dir.join("scripts");
    if scripts_dir.is_dir() {
        let mut nested: Vec<PathBuf> = walkdir::WalkDir::new(&scripts_dir)
            .follow_links(false)
            .into_iter()
            .flatten()
            .filter(|e| e.file_type().is_file())
            .filter(|e| e.path().extension().is_some_and(|ext| ext == "py"))
            .filter(|e| {
                e.file_name()
                    .to_str()
                    .is_some_and(|name| !name.starts_with("__"))
            })
            .map(|e| e.into_path())
            .collect();
        nested.sort();
        scripts.extend(nested);
    }

    scripts.truncate(max_scripts);
    scripts
}

/// Best-effort extraction of the module name from Python error text like
/// `ModuleNotFoundError: No module named 'requests'`.
pub fn parse_missing_module(stderr: &str) -> Option<String> {
    let marker = "No module named";
    let idx = stderr.find(marker)?;
    let tail = &stderr[idx..];
    for quote in ['\'', '"'] {
        if let Some(q1) = tail.find(quote)
            && let Some(q2) = tail[q1 + 1..].find(quote)
        {
            let module = tail[q1 + 1..q1 + 1 + q2].trim();
            if !module.is_empty() {
                return Some(module.to_string());
            }
        }
    }
    None
}
