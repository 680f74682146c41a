use std::{collections::BTreeMap, path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{
    runtime::EnvSource,
    types::{SkillCandidate, SkillManifest},
    validate::{MissingValue, truncate},
};

/// Cap on captured subprocess output in stage results.
const OUTPUT_CAP: usize = 8000;

/// Timeout for creating the isolated environment itself.
const VENV_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnsureVenvOutcome {
    pub ok: bool,
    pub created: bool,
    pub venv_dir: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Idempotently create the bundle-local isolated environment.
///
/// Prefers `uv venv`; falls back to `python3 -m venv` when uv is not on the
/// host. A present interpreter means the environment exists and nothing runs.
pub async fn ensure_venv(candidate: &SkillCandidate) -> anyhow::Result<EnsureVenvOutcome> {
    let venv_dir = candidate.venv_dir();
    let venv_display = venv_dir.display().to_string();
    if candidate.venv_python().exists() {
        return Ok(EnsureVenvOutcome {
            ok: true,
            created: false,
            venv_dir: venv_display,
            ..EnsureVenvOutcome::default()
        });
    }

    let uv_run = run_with_timeout(
        tokio::process::Command::new("uv")
            .arg("venv")
            .arg(&venv_dir)
            .current_dir(&candidate.dir),
        VENV_TIMEOUT,
    )
    .await;

    match uv_run {
        RunResult::Completed(out) if out.status.success() => Ok(EnsureVenvOutcome {
            ok: true,
            created: true,
            venv_dir: venv_display,
            ..EnsureVenvOutcome::default()
        }),
        RunResult::Completed(out) => Ok(EnsureVenvOutcome {
            ok: false,
            venv_dir: venv_display,
            error: Some(format!(
                "uv venv failed: {}",
                truncate(&String::from_utf8_lossy(&out.stderr), OUTPUT_CAP)
            )),
            ..EnsureVenvOutcome::default()
        }),
        RunResult::TimedOut => Ok(EnsureVenvOutcome {
            ok: false,
            venv_dir: venv_display,
            error: Some(format!(
                "uv venv timed out after {}s",
                VENV_TIMEOUT.as_secs()
            )),
            ..EnsureVenvOutcome::default()
        }),
        RunResult::NotFound => {
            // Host without uv: stdlib venv module.
            let fallback = run_with_timeout(
                tokio::process::Command::new("python3")
                    .arg("-m")
                    .arg("venv")
                    .arg(&venv_dir)
                    .current_dir(&candidate.dir),
                VENV_TIMEOUT,
            )
            .await;
            match fallback {
                RunResult::Completed(out) if out.status.success() => Ok(EnsureVenvOutcome {
                    ok: true,
                    created: true,
                    venv_dir: venv_display,
                    note: Some("uv not found; used python venv fallback".into()),
                    ..EnsureVenvOutcome::default()
                }),
                RunResult::Completed(out) => Ok(EnsureVenvOutcome {
                    ok: false,
                    venv_dir: venv_display,
                    error: Some(format!(
                        "python venv failed: {}",
                        truncate(&String::from_utf8_lossy(&out.stderr), OUTPUT_CAP)
                    )),
                    ..EnsureVenvOutcome::default()
                }),
                RunResult::TimedOut => Ok(EnsureVenvOutcome {
                    ok: false,
                    venv_dir: venv_display,
                    error: Some("python venv timed out".into()),
                    ..EnsureVenvOutcome::default()
                }),
                RunResult::NotFound => Ok(EnsureVenvOutcome {
                    ok: false,
                    venv_dir: venv_display,
                    error: Some("neither uv nor python3 found on the host".into()),
                    ..EnsureVenvOutcome::default()
                }),
                RunResult::Failed(e) => Ok(EnsureVenvOutcome {
                    ok: false,
                    venv_dir: venv_display,
                    error: Some(e),
                    ..EnsureVenvOutcome::default()
                }),
            }
        },
        RunResult::Failed(e) => Ok(EnsureVenvOutcome {
            ok: false,
            venv_dir: venv_display,
            error: Some(e),
            ..EnsureVenvOutcome::default()
        }),
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstallOutcome {
    pub ok: bool,
    pub installed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub venv_dir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
}

/// Install the bundle's requirements file into its isolated environment.
///
/// No-op when no requirements file exists. The environment source is
/// refreshed first so installs authenticating against private indexes see
/// freshly-supplied credentials. Prefers `uv pip` pointed at the venv
/// interpreter, falling back to that interpreter's own pip.
pub async fn install_dependencies(
    candidate: &SkillCandidate,
    source: &mut dyn EnvSource,
    timeout_secs: u64,
) -> anyhow::Result<InstallOutcome> {
    let req = candidate.requirements_path();
    if !req.exists() {
        return Ok(InstallOutcome {
            ok: true,
            installed: false,
            reason: Some("no requirements.txt".into()),
            ..InstallOutcome::default()
        });
    }

    source.refresh(candidate.owner.as_deref())?;

    let ensure = ensure_venv(candidate).await?;
    if !ensure.ok {
        return Ok(InstallOutcome {
            ok: false,
            error: Some(format!(
                "failed to create venv: {}",
                ensure.error.unwrap_or_else(|| "unknown".into())
            )),
            ..InstallOutcome::default()
        });
    }
    let py = candidate.venv_python();
    if !py.exists() {
        return Ok(InstallOutcome {
            ok: false,
            error: Some("venv python not found after creation".into()),
            venv_dir: Some(ensure.venv_dir),
            ..InstallOutcome::default()
        });
    }

    let mut env = source.env();
    env.entry("PIP_DISABLE_PIP_VERSION_CHECK".into())
        .or_insert_with(|| "1".into());
    env.entry("PIP_NO_INPUT".into()).or_insert_with(|| "1".into());
    let timeout = Duration::from_secs(timeout_secs);

    let uv_run = run_with_timeout(
        tokio::process::Command::new("uv")
            .arg("pip")
            .arg("install")
            .arg("--python")
            .arg(&py)
            .arg("-r")
            .arg(&req)
            .current_dir(&candidate.dir)
            .envs(&env),
        timeout,
    )
    .await;

    let run = match uv_run {
        RunResult::NotFound => {
            run_with_timeout(
                tokio::process::Command::new(&py)
                    .arg("-m")
                    .arg("pip")
                    .arg("install")
                    .arg("-r")
                    .arg(&req)
                    .current_dir(&candidate.dir)
                    .envs(&env),
                timeout,
            )
            .await
        },
        other => other,
    };

    match run {
        RunResult::Completed(out) if out.status.success() => Ok(InstallOutcome {
            ok: true,
            installed: true,
            venv_dir: Some(ensure.venv_dir),
            ..InstallOutcome::default()
        }),
        RunResult::Completed(out) => Ok(InstallOutcome {
            ok: false,
            error: Some("pip install failed".into()),
            stdout: Some(truncate(&String::from_utf8_lossy(&out.stdout), OUTPUT_CAP)),
            stderr: Some(truncate(&String::from_utf8_lossy(&out.stderr), OUTPUT_CAP)),
            ..InstallOutcome::default()
        }),
        RunResult::TimedOut => Ok(InstallOutcome {
            ok: false,
            error: Some(format!("pip install timed out after {timeout_secs}s")),
            ..InstallOutcome::default()
        }),
        RunResult::NotFound => Ok(InstallOutcome {
            ok: false,
            error: Some("no package manager found (uv or pip)".into()),
            ..InstallOutcome::default()
        }),
        RunResult::Failed(e) => Ok(InstallOutcome {
            ok: false,
            error: Some(e),
            ..InstallOutcome::default()
        }),
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BinsCheckOutcome {
    pub ok: bool,
    pub checked: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub missing: Vec<MissingValue>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub found: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Resolve each active declared executable: the isolated environment's bin
/// directory first, then the host PATH. Requirements whose `when` clause
/// evaluates false are not required.
///
/// A same-named host binary is accepted without any version or compatibility
/// check; resolution only proves presence.
pub fn validate_required_bins(
    candidate: &SkillCandidate,
    manifest: &SkillManifest,
    source: &dyn EnvSource,
) -> BinsCheckOutcome {
    if manifest.requires.bins.is_empty() {
        return BinsCheckOutcome {
            ok: true,
            reason: Some("no required bins declared".into()),
            ..BinsCheckOutcome::default()
        };
    }

    let env = source.env();
    let skill_cfg = source.skill_config(&manifest.name, candidate.owner.as_deref());
    let venv_bin = candidate.venv_dir().join("bin");
    let mut checked = 0;
    let mut missing = Vec::new();
    let mut found = BTreeMap::new();

    for spec in &manifest.requires.bins {
        if !spec.when.is_active(&env, &skill_cfg) {
            continue;
        }
        checked += 1;
        let local = venv_bin.join(&spec.name);
        if local.exists() {
            found.insert(spec.name.clone(), local.display().to_string());
            continue;
        }
        match which::which(&spec.name) {
            Ok(path) => {
                found.insert(spec.name.clone(), path.display().to_string());
            },
            Err(_) => missing.push(MissingValue::from(spec)),
        }
    }

    BinsCheckOutcome {
        ok: missing.is_empty(),
        checked,
        missing,
        found,
        reason: None,
    }
}

// ── Subprocess plumbing ─────────────────────────────────────────────────────

pub(crate) enum RunResult {
    Completed(std::process::Output),
    TimedOut,
    /// The program itself is not on the host.
    NotFound,
    Failed(String),
}

pub(crate) async fn run_with_timeout(
    command: &mut tokio::process::Command,
    timeout: Duration,
) -> RunResult {
    command.kill_on_drop(true);
    match tokio::time::timeout(timeout, command.output()).await {
        Ok(Ok(output)) => RunResult::Completed(output),
        Ok(Err(e)) if e.kind() == std::io::ErrorKind::NotFound => RunResult::NotFound,
        Ok(Err(e)) => RunResult::Failed(e.to_string()),
        Err(_) => RunResult::TimedOut,
    }
}
