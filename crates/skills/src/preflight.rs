use std::path::{Path, PathBuf};

use {
    anyhow::Context,
    serde::{Deserialize, Serialize},
    squire_config::SkillsConfig,
};

use crate::{
    discover, fingerprint, normalize, parse, provision, requirements,
    runtime::{EnvSource, SecretsEnvSource},
    smoke,
    types::{
        FailureRecord, OnboardOutcome, OnboardStatus, OnboardSummary, PreflightReport, REPORT_JSON,
        REPORT_MD, Scope, SkillCandidate, SkillManifest, StageRecord,
    },
    validate,
};

pub const STAGE_NORMALIZE: &str = "normalize_skill_md";
pub const STAGE_VALIDATE_ENV: &str = "validate_required_env";
pub const STAGE_VALIDATE_CONFIG: &str = "validate_config_files";
pub const STAGE_GENERATE_REQUIREMENTS: &str = "generate_requirements";
pub const STAGE_SYNC_INSTALLS: &str = "sync_manifest_installs";
pub const STAGE_VALIDATE_SYNTAX: &str = "validate_python_syntax";
pub const STAGE_INSTALL: &str = "install_dependencies";
pub const STAGE_VALIDATE_BINS: &str = "validate_required_bins";
pub const STAGE_SMOKE: &str = "run_scripts_smoke_test";
pub const STAGE_EXCEPTION: &str = "preflight_exception";
pub const STAGE_PROMOTION: &str = "promotion";

/// Which staging directories an onboarding pass covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnboardScope {
    Owner,
    Shared,
    All,
}

#[derive(Debug, Clone, Copy)]
pub struct PreflightOptions {
    pub install_deps: bool,
    pub run_scripts: bool,
    pub dry_run: bool,
}

impl Default for PreflightOptions {
    fn default() -> Self {
        Self {
            install_deps: true,
            run_scripts: false,
            dry_run: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreflightAllSummary {
    pub ok: bool,
    pub processed: usize,
    pub failures: usize,
    pub reports: Vec<PreflightReport>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepairOutcome {
    pub ok: bool,
    pub repaired: bool,
    pub skill_dir: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report: Option<PreflightReport>,
}

/// Sequences the per-bundle pipeline: discovery, preflight, promotion and
/// repair. The single place that turns a failed stage into a durable
/// `FAILED.json` and decides continue vs abort.
pub struct SkillOnboarding {
    cfg: SkillsConfig,
    source: Box<dyn EnvSource>,
}

impl SkillOnboarding {
    pub fn new(cfg: SkillsConfig, source: Box<dyn EnvSource>) -> Self {
        Self { cfg, source }
    }

    /// Construct with the secrets-file-backed environment source.
    pub fn with_secrets(cfg: SkillsConfig) -> Self {
        let source = SecretsEnvSource::new(cfg.clone());
        Self::new(cfg, Box::new(source))
    }

    pub fn config(&self) -> &SkillsConfig {
        &self.cfg
    }

    /// Pending candidates visible to one caller. Pure read.
    pub fn list_pending(&self, owner: Option<&str>, include_shared: bool) -> Vec<SkillCandidate> {
        discover::pending_for(&self.cfg, owner, include_shared)
    }

    /// Run the full preflight pipeline against one bundle.
    ///
    /// Never returns an error: unexpected failures are folded into the report
    /// as a `preflight_exception` stage and a failure marker. Reports are
    /// written to the bundle on every run.
    pub async fn preflight(
        &mut self,
        candidate: &SkillCandidate,
        opts: PreflightOptions,
    ) -> PreflightReport {
        let mut report = PreflightReport {
            skill: candidate.name.clone(),
            scope: candidate.scope,
            user_id: candidate.owner.clone(),
            timestamp: utc_now_iso(),
            ok: true,
            steps: Vec::new(),
            error: None,
        };

        match self.run_stages(candidate, opts, &mut report).await {
            Ok(()) => {
                if report.ok {
                    clear_failed(candidate);
                }
            },
            Err(e) => {
                report.ok = false;
                report.error = Some(e.to_string());
                self.write_failed(candidate, STAGE_EXCEPTION, &e.to_string(), None);
            },
        }
        write_reports(candidate, &report);
        report
    }

    /// The fail-fast stage sequence. Returns Err only for unexpected
    /// failures; expected stage failures set `report.ok = false` and write
    /// the failure marker before the early return.
    async fn run_stages(
        &mut self,
        candidate: &SkillCandidate,
        opts: PreflightOptions,
        report: &mut PreflightReport,
    ) -> anyhow::Result<()> {
        let normalized = normalize::normalize(candidate)?;
        push_step(report, STAGE_NORMALIZE, &normalized)?;

        let manifest = self.load_manifest(candidate);

        let env_check = validate::validate_env(candidate, &manifest, self.source.as_mut())?;
        push_step(report, STAGE_VALIDATE_ENV, &env_check)?;
        if !env_check.ok {
            let names: Vec<&str> = env_check.missing.iter().map(|m| m.name.as_str()).collect();
            report.ok = false;
            self.write_failed(
                candidate,
                STAGE_VALIDATE_ENV,
                &format!("missing required env: {}", names.join(", ")),
                Some(serde_json::to_value(&env_check)?),
            );
            return Ok(());
        }

        let config_check =
            validate::validate_config_files(candidate, &manifest, self.source.as_mut())?;
        push_step(report, STAGE_VALIDATE_CONFIG, &config_check)?;
        if !config_check.ok {
            report.ok = false;
            self.write_failed(
                candidate,
                STAGE_VALIDATE_CONFIG,
                "missing required config values or rendered config files",
                Some(serde_json::to_value(&config_check)?),
            );
            return Ok(());
        }

        let generated = requirements::generate_requirements(
            candidate,
            &manifest,
            self.cfg.generate_requirements,
        )?;
        push_step(report, STAGE_GENERATE_REQUIREMENTS, &generated)?;
        if !generated.ok {
            report.ok = false;
            self.write_failed(
                candidate,
                STAGE_GENERATE_REQUIREMENTS,
                "requirements generation failed",
                None,
            );
            return Ok(());
        }

        // Best-effort: a failure here is reported but never aborts.
        match requirements::sync_manifest_installs(candidate, &manifest) {
            Ok(synced) => push_step(report, STAGE_SYNC_INSTALLS, &synced)?,
            Err(e) => {
                tracing::warn!(skill = %candidate.name, %e, "manifest install sync failed");
                push_step(
                    report,
                    STAGE_SYNC_INSTALLS,
                    &serde_json::json!({"ok": false, "error": e.to_string()}),
                )?;
            },
        }

        let syntax = validate::validate_syntax(candidate).await?;
        push_step(report, STAGE_VALIDATE_SYNTAX, &syntax)?;
        if !syntax.ok {
            report.ok = false;
            self.write_failed(
                candidate,
                STAGE_VALIDATE_SYNTAX,
                syntax.error.as_deref().unwrap_or("syntax error"),
                None,
            );
            return Ok(());
        }

        if opts.install_deps && !opts.dry_run {
            let deps = provision::install_dependencies(
                candidate,
                self.source.as_mut(),
                self.cfg.pip_timeout_secs,
            )
            .await?;
            push_step(report, STAGE_INSTALL, &deps)?;
            if !deps.ok {
                report.ok = false;
                let details = serde_json::json!({
                    "stdout": deps.stdout,
                    "stderr": deps.stderr,
                });
                self.write_failed(
                    candidate,
                    STAGE_INSTALL,
                    deps.error.as_deref().unwrap_or("dependency install failed"),
                    Some(details),
                );
                return Ok(());
            }

            let bins = provision::validate_required_bins(candidate, &manifest, self.source.as_ref());
            push_step(report, STAGE_VALIDATE_BINS, &bins)?;
            if !bins.ok {
                report.ok = false;
                let names: Vec<&str> = bins.missing.iter().map(|m| m.name.as_str()).collect();
                self.write_failed(
                    candidate,
                    STAGE_VALIDATE_BINS,
                    &format!("missing required binaries: {}", names.join(", ")),
                    Some(serde_json::to_value(&bins)?),
                );
                return Ok(());
            }
        }

        if opts.run_scripts && !opts.dry_run {
            let smoke_rep = smoke::run_scripts_smoke_test(
                candidate,
                self.source.as_mut(),
                self.cfg.script_timeout_secs,
                self.cfg.smoke_max_scripts,
            )
            .await?;
            push_step(report, STAGE_SMOKE, &smoke_rep)?;
            if !smoke_rep.ok {
                report.ok = false;
                let error = if smoke_rep.missing_modules.is_empty() {
                    "script smoke test failed".to_string()
                } else {
                    format!("missing module(s): {}", smoke_rep.missing_modules.join(", "))
                };
                self.write_failed(
                    candidate,
                    STAGE_SMOKE,
                    &error,
                    Some(serde_json::to_value(&smoke_rep)?),
                );
                return Ok(());
            }
        }

        Ok(())
    }

    /// Preflight every pending bundle (shared plus all owners), capped.
    /// Scripts never run in bulk passes.
    pub async fn preflight_all(&mut self) -> PreflightAllSummary {
        let install_deps = self.cfg.preflight_install_deps;
        let max_skills = self.cfg.preflight_max_skills;
        let candidates = discover::pending_candidates(&self.cfg);

        let mut reports = Vec::new();
        let mut failures = 0;
        for candidate in candidates.into_iter().take(max_skills) {
            let report = self
                .preflight(
                    &candidate,
                    PreflightOptions {
                        install_deps,
                        run_scripts: false,
                        dry_run: false,
                    },
                )
                .await;
            if !report.ok {
                failures += 1;
            }
            reports.push(report);
        }

        PreflightAllSummary {
            ok: failures == 0,
            processed: reports.len(),
            failures,
            reports,
        }
    }

    /// Onboard pending bundles: preflight each, then promote into the active
    /// location, with fingerprint-based skip/replace for existing copies.
    pub async fn onboard_pending(
        &mut self,
        owner: Option<&str>,
        scope: OnboardScope,
        dry_run: bool,
        names: Option<&[String]>,
        install_deps: bool,
        run_scripts: bool,
    ) -> OnboardSummary {
        let include_shared = matches!(scope, OnboardScope::Shared | OnboardScope::All);
        let include_owner = matches!(scope, OnboardScope::Owner | OnboardScope::All);
        let mut candidates =
            self.list_pending(if include_owner { owner } else { None }, include_shared);
        if let Some(names) = names {
            candidates.retain(|c| names.iter().any(|n| n == &c.name));
        }

        let total = candidates.len();
        let mut results = Vec::new();
        let (mut onboarded, mut skipped, mut failed) = (0, 0, 0);

        for candidate in candidates {
            let outcome = self
                .onboard_one(&candidate, owner, dry_run, install_deps, run_scripts)
                .await;
            match outcome.status {
                OnboardStatus::Onboarded => onboarded += 1,
                OnboardStatus::Skipped => skipped += 1,
                OnboardStatus::Failed => failed += 1,
                OnboardStatus::DryRun => {},
            }
            results.push(outcome);
        }

        OnboardSummary {
            ok: failed == 0,
            total,
            onboarded,
            skipped,
            failed,
            results,
        }
    }

    async fn onboard_one(
        &mut self,
        candidate: &SkillCandidate,
        invoking_owner: Option<&str>,
        dry_run: bool,
        install_deps: bool,
        run_scripts: bool,
    ) -> OnboardOutcome {
        let dest = self.destination(candidate, invoking_owner);
        let mut outcome = OnboardOutcome {
            candidate: candidate.name.clone(),
            scope: candidate.scope,
            status: OnboardStatus::Failed,
            path: Some(dest.display().to_string()),
            reason: None,
            error: None,
            updated: false,
            report: None,
        };

        // Identical active copy: up-to-date, not a failure. The pending copy
        // stays in place for the operator to remove.
        let dest_exists = dest.exists();
        if dest_exists {
            match same_content(&candidate.dir, &dest) {
                Ok(true) => {
                    clear_failed(candidate);
                    outcome.status = OnboardStatus::Skipped;
                    outcome.reason = Some("already active with identical content".into());
                    return outcome;
                },
                Ok(false) => {},
                Err(e) => {
                    self.write_failed(candidate, STAGE_PROMOTION, &e.to_string(), None);
                    outcome.error = Some(e.to_string());
                    return outcome;
                },
            }
        }

        let report = self
            .preflight(
                candidate,
                PreflightOptions {
                    install_deps,
                    run_scripts,
                    dry_run,
                },
            )
            .await;
        if !report.ok {
            outcome.report = Some(report);
            return outcome;
        }

        if dry_run {
            outcome.status = OnboardStatus::DryRun;
            outcome.reason = Some(if dest_exists {
                "would back up and replace active copy".into()
            } else {
                "would move into place".into()
            });
            outcome.report = Some(report);
            return outcome;
        }

        match promote(&candidate.dir, &dest) {
            Ok(updated) => {
                outcome.status = OnboardStatus::Onboarded;
                outcome.updated = updated;
                outcome.report = Some(report);
                outcome
            },
            Err(e) => {
                self.record_promotion_failure(candidate, &e.to_string());
                outcome.error = Some(e.to_string());
                outcome
            },
        }
    }

    /// Re-run the dependency/install/bins/smoke portion against an already
    /// active bundle.
    pub async fn repair_installed(
        &mut self,
        owner: Option<&str>,
        name: &str,
        scope: Scope,
        run_scripts: bool,
    ) -> RepairOutcome {
        let candidate = match scope {
            Scope::Shared => SkillCandidate {
                scope: Scope::Shared,
                owner: None,
                name: name.to_string(),
                dir: self.cfg.shared_root().join(name),
            },
            Scope::Owner => {
                let Some(owner) = owner else {
                    return RepairOutcome {
                        ok: false,
                        repaired: false,
                        skill_dir: String::new(),
                        error: Some("owner is required for owner-scoped repair".into()),
                        report: None,
                    };
                };
                SkillCandidate {
                    scope: Scope::Owner,
                    owner: Some(owner.to_string()),
                    name: name.to_string(),
                    dir: self.cfg.owner_root(owner).join(name),
                }
            },
        };

        if !candidate.dir.is_dir() {
            return RepairOutcome {
                ok: false,
                repaired: false,
                skill_dir: candidate.dir.display().to_string(),
                error: Some(format!("skill not found: {}", candidate.dir.display())),
                report: None,
            };
        }

        let report = self
            .preflight(
                &candidate,
                PreflightOptions {
                    install_deps: true,
                    run_scripts,
                    dry_run: false,
                },
            )
            .await;
        RepairOutcome {
            ok: report.ok,
            repaired: report.ok,
            skill_dir: candidate.dir.display().to_string(),
            error: None,
            report: Some(report),
        }
    }

    fn destination(&self, candidate: &SkillCandidate, invoking_owner: Option<&str>) -> PathBuf {
        match candidate.scope {
            Scope::Shared => self.cfg.shared_root().join(&candidate.name),
            Scope::Owner => {
                let owner = candidate
                    .owner
                    .as_deref()
                    .or(invoking_owner)
                    .unwrap_or("shared");
                self.cfg.owner_root(owner).join(&candidate.name)
            },
        }
    }

    /// Parse the manifest, falling back to a minimal one on parse errors; the
    /// normalizer guarantees the file exists.
    fn load_manifest(&self, candidate: &SkillCandidate) -> SkillManifest {
        let content = match std::fs::read_to_string(candidate.skill_md_path()) {
            Ok(content) => content,
            Err(e) => {
                tracing::warn!(skill = %candidate.name, %e, "failed to read SKILL.md");
                return fallback_manifest(&candidate.name);
            },
        };
        match parse::parse_manifest(&content, &candidate.name) {
            Ok(manifest) => manifest,
            Err(e) => {
                tracing::warn!(skill = %candidate.name, %e, "unparseable SKILL.md frontmatter");
                fallback_manifest(&candidate.name)
            },
        }
    }

    fn write_failed(
        &self,
        candidate: &SkillCandidate,
        stage: &str,
        error: &str,
        details: Option<serde_json::Value>,
    ) {
        let record = FailureRecord {
            status: "failed".into(),
            stage: stage.to_string(),
            error: error.to_string(),
            timestamp: utc_now_iso(),
            scope: candidate.scope,
            user_id: candidate.owner.clone(),
            skill_name: candidate.name.clone(),
            details,
        };
        if let Err(e) = write_json(&candidate.failed_path(), &record) {
            tracing::warn!(skill = %candidate.name, %e, "failed to write failure marker");
        }
    }

    /// Promotion errors become failure records, never propagated. When the
    /// pending directory was already consumed by a partial move, the marker
    /// goes to a synthesized pending location.
    fn record_promotion_failure(&self, candidate: &SkillCandidate, error: &str) {
        if candidate.dir.exists() {
            self.write_failed(candidate, STAGE_PROMOTION, error, None);
            return;
        }
        let fallback_dir = match (&candidate.scope, candidate.owner.as_deref()) {
            (Scope::Shared, _) => self.cfg.shared_pending_dir().join(&candidate.name),
            (Scope::Owner, Some(owner)) => {
                self.cfg.owner_pending_dir(owner).join(&candidate.name)
            },
            (Scope::Owner, None) => self.cfg.shared_pending_dir().join(&candidate.name),
        };
        if let Err(e) = std::fs::create_dir_all(&fallback_dir) {
            tracing::warn!(%e, "failed to create fallback failure location");
            return;
        }
        let fallback = SkillCandidate {
            dir: fallback_dir,
            ..candidate.clone()
        };
        self.write_failed(&fallback, STAGE_PROMOTION, error, None);
    }
}

/// Move a pending bundle to its active destination. Returns whether an
/// existing active copy was backed up and replaced.
fn promote(pending: &Path, dest: &Path) -> anyhow::Result<bool> {
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }

    let mut updated = false;
    if dest.exists() {
        let backup = backup_path(dest);
        std::fs::rename(dest, &backup).with_context(|| {
            format!("backing up {} to {}", dest.display(), backup.display())
        })?;
        updated = true;
    }
    std::fs::rename(pending, dest)
        .with_context(|| format!("moving {} to {}", pending.display(), dest.display()))?;
    Ok(updated)
}

fn backup_path(dest: &Path) -> PathBuf {
    let stamp = chrono::Utc::now().format("%Y%m%d%H%M%S");
    let name = dest
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "bundle".to_string());
    dest.with_file_name(format!("{name}.bak-{stamp}"))
}

fn same_content(a: &Path, b: &Path) -> anyhow::Result<bool> {
    Ok(fingerprint::fingerprint_dir(a)? == fingerprint::fingerprint_dir(b)?)
}

fn fallback_manifest(name: &str) -> SkillManifest {
    SkillManifest {
        name: name.to_string(),
        description: "Pending skill".into(),
        ..SkillManifest::default()
    }
}

fn push_step<T: Serialize>(
    report: &mut PreflightReport,
    stage: &str,
    result: &T,
) -> anyhow::Result<()> {
    report.steps.push(StageRecord {
        stage: stage.to_string(),
        result: serde_json::to_value(result)?,
    });
    Ok(())
}

fn utc_now_iso() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    std::fs::write(path, json).with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}

/// Remove a stale failure marker. Best-effort.
pub fn clear_failed(candidate: &SkillCandidate) {
    let path = candidate.failed_path();
    if path.exists()
        && let Err(e) = std::fs::remove_file(&path)
    {
        tracing::warn!(skill = %candidate.name, %e, "failed to clear failure marker");
    }
}

/// Read a bundle's failure marker, if any.
pub fn read_failed(candidate: &SkillCandidate) -> Option<FailureRecord> {
    let content = std::fs::read_to_string(candidate.failed_path()).ok()?;
    serde_json::from_str(&content).ok()
}

/// Write the per-bundle JSON and Markdown reports. Best-effort.
fn write_reports(candidate: &SkillCandidate, report: &PreflightReport) {
    if let Err(e) = write_json(&candidate.dir.join(REPORT_JSON), report) {
        tracing::warn!(skill = %candidate.name, %e, "failed to write JSON report");
    }

    let mut md = format!(
        "# Pending Skill Preflight Report: {}\n\n- Scope: {}\n- Owner: {}\n- Timestamp: {}\n- Status: {}\n\n",
        report.skill,
        report.scope,
        report.user_id.as_deref().unwrap_or("(n/a)"),
        report.timestamp,
        if report.ok { "OK" } else { "FAILED" },
    );
    for step in &report.steps {
        let ok = step
            .result
            .get("ok")
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(true);
        let snippet = serde_json::to_string_pretty(&step.result)
            .unwrap_or_else(|_| step.result.to_string());
        md.push_str(&format!(
            "## {} ({})\n\n```json\n{}\n```\n\n",
            step.stage,
            if ok { "OK" } else { "FAILED" },
            snippet,
        ));
    }
    if let Err(e) = std::fs::write(candidate.dir.join(REPORT_MD), md) {
        tracing::warn!(skill = %candidate.name, %e, "failed to write Markdown report");
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, crate::runtime::StaticEnv, std::collections::BTreeMap};

    fn test_config(root: &Path) -> SkillsConfig {
        SkillsConfig {
            skills_dir: root.join("skills").to_string_lossy().into_owned(),
            shared_dir: root.join("skills/shared").to_string_lossy().into_owned(),
            workspace_dir: root.join("workspace").to_string_lossy().into_owned(),
            secrets_path: root.join("secrets.yml").to_string_lossy().into_owned(),
            ..SkillsConfig::default()
        }
    }

    fn onboarding(root: &Path, env: &[(&str, &str)]) -> SkillOnboarding {
        let source = StaticEnv {
            env: env
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            config: BTreeMap::new(),
            rendered_base: root.join("workspace"),
        };
        SkillOnboarding::new(test_config(root), Box::new(source))
    }

    fn stage_pending(
        cfg: &SkillsConfig,
        name: &str,
        files: &[(&str, &str)],
    ) -> SkillCandidate {
        let dir = cfg.shared_pending_dir().join(name);
        std::fs::create_dir_all(&dir).unwrap();
        for (rel, content) in files {
            let path = dir.join(rel);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).unwrap();
            }
            std::fs::write(path, content).unwrap();
        }
        SkillCandidate {
            scope: Scope::Shared,
            owner: None,
            name: name.to_string(),
            dir,
        }
    }

    fn minimal_manifest(name: &str) -> String {
        format!("---\nname: {name}\ndescription: test\n---\nBody.\n")
    }

    #[tokio::test]
    async fn test_clean_preflight_writes_reports_and_no_marker() {
        let tmp = tempfile::tempdir().unwrap();
        let mut svc = onboarding(tmp.path(), &[]);
        let cand = stage_pending(
            svc.config(),
            "notes",
            &[("SKILL.md", &minimal_manifest("notes"))],
        );

        let report = svc.preflight(&cand, PreflightOptions::default()).await;
        assert!(report.ok, "report: {report:?}");
        assert!(cand.dir.join(REPORT_JSON).is_file());
        assert!(cand.dir.join(REPORT_MD).is_file());
        assert!(!cand.failed_path().exists());
        // Manifest-only bundle: no requirements file materializes.
        assert!(!cand.requirements_path().exists());
    }

    #[tokio::test]
    async fn test_missing_env_fails_before_syntax() {
        let tmp = tempfile::tempdir().unwrap();
        let mut svc = onboarding(tmp.path(), &[]);
        let manifest = "---\nname: mailer\nrequires:\n  env:\n    - SMTP_HOST\n---\nBody.\n";
        let cand = stage_pending(
            svc.config(),
            "mailer",
            &[("SKILL.md", manifest), ("broken.py", "def f(:\n")],
        );

        let report = svc.preflight(&cand, PreflightOptions::default()).await;
        assert!(!report.ok);

        let failed = read_failed(&cand).unwrap();
        assert_eq!(failed.stage, STAGE_VALIDATE_ENV);
        assert!(failed.error.contains("SMTP_HOST"));
    }

    #[tokio::test]
    async fn test_syntax_failure_records_stage() {
        let tmp = tempfile::tempdir().unwrap();
        let mut svc = onboarding(tmp.path(), &[]);
        let cand = stage_pending(
            svc.config(),
            "broken",
            &[
                ("SKILL.md", &minimal_manifest("broken")),
                ("main.py", "def f(:\n"),
            ],
        );

        let report = svc
            .preflight(
                &cand,
                PreflightOptions {
                    install_deps: false,
                    ..PreflightOptions::default()
                },
            )
            .await;
        assert!(!report.ok);
        assert_eq!(read_failed(&cand).unwrap().stage, STAGE_VALIDATE_SYNTAX);
    }

    #[tokio::test]
    async fn test_success_clears_prior_marker() {
        let tmp = tempfile::tempdir().unwrap();
        let mut svc = onboarding(tmp.path(), &[("API_KEY", "sk-123")]);
        let manifest = "---\nname: keyed\nrequires:\n  env:\n    - API_KEY\n---\nBody.\n";
        let cand = stage_pending(svc.config(), "keyed", &[("SKILL.md", manifest)]);
        svc.write_failed(&cand, STAGE_VALIDATE_ENV, "stale", None);
        assert!(cand.failed_path().exists());

        let report = svc
            .preflight(
                &cand,
                PreflightOptions {
                    install_deps: false,
                    ..PreflightOptions::default()
                },
            )
            .await;
        assert!(report.ok);
        assert!(!cand.failed_path().exists());
    }

    #[tokio::test]
    async fn test_onboard_moves_bundle_into_place() {
        let tmp = tempfile::tempdir().unwrap();
        let mut svc = onboarding(tmp.path(), &[]);
        stage_pending(
            svc.config(),
            "notes",
            &[("SKILL.md", &minimal_manifest("notes"))],
        );

        let summary = svc
            .onboard_pending(None, OnboardScope::Shared, false, None, false, false)
            .await;
        assert!(summary.ok);
        assert_eq!(summary.onboarded, 1);
        assert_eq!(summary.results[0].status, OnboardStatus::Onboarded);

        let active = svc.config().shared_root().join("notes");
        assert!(active.join("SKILL.md").is_file());
        assert!(!svc.config().shared_pending_dir().join("notes").exists());
        assert!(!active.join("FAILED.json").exists());
    }

    #[tokio::test]
    async fn test_onboard_identical_content_skips() {
        let tmp = tempfile::tempdir().unwrap();
        let mut svc = onboarding(tmp.path(), &[]);
        let manifest = minimal_manifest("notes");
        stage_pending(svc.config(), "notes", &[("SKILL.md", &manifest)]);
        let active = svc.config().shared_root().join("notes");
        std::fs::create_dir_all(&active).unwrap();
        std::fs::write(active.join("SKILL.md"), &manifest).unwrap();

        let summary = svc
            .onboard_pending(None, OnboardScope::Shared, false, None, false, false)
            .await;
        assert!(summary.ok);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.results[0].status, OnboardStatus::Skipped);
        // No move happened, no failure marker written.
        assert!(svc.config().shared_pending_dir().join("notes").is_dir());
        assert!(!svc
            .config()
            .shared_pending_dir()
            .join("notes/FAILED.json")
            .exists());
    }

    #[tokio::test]
    async fn test_onboard_different_content_backs_up_and_replaces() {
        let tmp = tempfile::tempdir().unwrap();
        let mut svc = onboarding(tmp.path(), &[]);
        stage_pending(
            svc.config(),
            "notes",
            &[("SKILL.md", &minimal_manifest("notes")), ("extra.txt", "v2")],
        );
        let active = svc.config().shared_root().join("notes");
        std::fs::create_dir_all(&active).unwrap();
        std::fs::write(active.join("SKILL.md"), minimal_manifest("notes")).unwrap();
        std::fs::write(active.join("extra.txt"), "v1").unwrap();

        let summary = svc
            .onboard_pending(None, OnboardScope::Shared, false, None, false, false)
            .await;
        assert_eq!(summary.onboarded, 1);
        assert!(summary.results[0].updated);

        // New content in place, old content recoverable at the backup path.
        assert_eq!(
            std::fs::read_to_string(active.join("extra.txt")).unwrap(),
            "v2"
        );
        let backups: Vec<_> = std::fs::read_dir(svc.config().shared_root())
            .unwrap()
            .flatten()
            .filter(|e| e.file_name().to_string_lossy().starts_with("notes.bak-"))
            .collect();
        assert_eq!(backups.len(), 1);
        assert_eq!(
            std::fs::read_to_string(backups[0].path().join("extra.txt")).unwrap(),
            "v1"
        );
    }

    #[tokio::test]
    async fn test_dry_run_moves_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let mut svc = onboarding(tmp.path(), &[]);
        let cand = stage_pending(
            svc.config(),
            "notes",
            &[("SKILL.md", &minimal_manifest("notes"))],
        );

        let summary = svc
            .onboard_pending(None, OnboardScope::Shared, true, None, true, true)
            .await;
        assert!(summary.ok);
        assert_eq!(summary.results[0].status, OnboardStatus::DryRun);
        assert!(cand.dir.is_dir());
        assert!(!svc.config().shared_root().join("notes").exists());
        // Side-effecting stages never ran.
        assert!(!cand.venv_dir().exists());
        let report = summary.results[0].report.as_ref().unwrap();
        assert!(report.step(STAGE_INSTALL).is_none());
        assert!(report.step(STAGE_SMOKE).is_none());
        assert!(report.step(STAGE_VALIDATE_ENV).is_some());
    }

    #[tokio::test]
    async fn test_onboard_names_filter() {
        let tmp = tempfile::tempdir().unwrap();
        let mut svc = onboarding(tmp.path(), &[]);
        stage_pending(svc.config(), "one", &[("SKILL.md", &minimal_manifest("one"))]);
        stage_pending(svc.config(), "two", &[("SKILL.md", &minimal_manifest("two"))]);

        let names = vec!["two".to_string()];
        let summary = svc
            .onboard_pending(None, OnboardScope::Shared, false, Some(&names), false, false)
            .await;
        assert_eq!(summary.total, 1);
        assert_eq!(summary.results[0].candidate, "two");
        assert!(svc.config().shared_pending_dir().join("one").is_dir());
    }

    #[tokio::test]
    async fn test_repair_missing_skill_errors() {
        let tmp = tempfile::tempdir().unwrap();
        let mut svc = onboarding(tmp.path(), &[]);
        let outcome = svc
            .repair_installed(Some("ada"), "ghost", Scope::Owner, false)
            .await;
        assert!(!outcome.ok);
        assert!(outcome.error.unwrap().contains("skill not found"));
    }

    #[tokio::test]
    async fn test_preflight_failed_bundle_not_promoted() {
        let tmp = tempfile::tempdir().unwrap();
        let mut svc = onboarding(tmp.path(), &[]);
        let manifest = "---\nname: needy\nrequires:\n  env:\n    - MISSING_VALUE\n---\nBody.\n";
        let cand = stage_pending(svc.config(), "needy", &[("SKILL.md", manifest)]);

        let summary = svc
            .onboard_pending(None, OnboardScope::Shared, false, None, false, false)
            .await;
        assert!(!summary.ok);
        assert_eq!(summary.failed, 1);
        assert!(cand.dir.is_dir());
        assert!(cand.failed_path().exists());
        assert!(!svc.config().shared_root().join("needy").exists());
    }
}
