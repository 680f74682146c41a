use std::path::PathBuf;

use {
    anyhow::bail,
    clap::{Parser, Subcommand, ValueEnum},
    squire_skills::{
        OnboardScope, PreflightOptions, SkillOnboarding, discover,
        types::{PreflightReport, Scope},
        validate,
    },
    tracing::info,
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
};

#[derive(Parser)]
#[command(name = "squire", about = "Squire — skill onboarding pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,

    /// Print results as JSON instead of human-readable text.
    #[arg(long, global = true, default_value_t = false)]
    json: bool,

    /// Explicit config file (overrides discovery).
    #[arg(long, global = true, env = "SQUIRE_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// List pending bundles awaiting onboarding.
    Pending {
        /// Include this owner's staging directory alongside shared.
        #[arg(long)]
        owner: Option<String>,
    },
    /// Validate pending bundles without promoting them.
    Preflight {
        /// Bundle name; all pending bundles when omitted.
        skill: Option<String>,
        #[arg(long)]
        owner: Option<String>,
        /// Run each bundle script once as a smoke test.
        #[arg(long, default_value_t = false)]
        run_scripts: bool,
        /// Skip venv creation and dependency install.
        #[arg(long, default_value_t = false)]
        no_install: bool,
        /// Read-only validations only; no venvs, installs, or script runs.
        #[arg(long, default_value_t = false)]
        dry_run: bool,
    },
    /// Preflight and promote pending bundles into the active tree.
    Onboard {
        #[arg(long)]
        owner: Option<String>,
        /// Which staging directories to cover.
        #[arg(long, value_enum, default_value_t = ScopeArg::All)]
        scope: ScopeArg,
        /// Only onboard bundles with these names.
        #[arg(long = "skill")]
        skills: Vec<String>,
        /// Validate only; move nothing, create no venvs.
        #[arg(long, default_value_t = false)]
        dry_run: bool,
        #[arg(long, default_value_t = false)]
        run_scripts: bool,
        #[arg(long, default_value_t = false)]
        no_install: bool,
    },
    /// Re-provision an already active skill.
    Repair {
        /// Skill name.
        name: String,
        #[arg(long)]
        owner: Option<String>,
        /// Repair the shared copy instead of an owner's.
        #[arg(long, default_value_t = false)]
        shared: bool,
        #[arg(long, default_value_t = false)]
        run_scripts: bool,
    },
    /// List active skills.
    List {
        #[arg(long)]
        owner: Option<String>,
    },
    /// Show an active skill's manifest.
    Info {
        /// Skill name.
        name: String,
        #[arg(long)]
        owner: Option<String>,
    },
    /// Report unmet requirements across active skills and check the toolchain.
    Doctor {
        #[arg(long)]
        owner: Option<String>,
    },
    /// Remove an owner's active skill directory.
    Uninstall {
        /// Skill name.
        name: String,
        #[arg(long)]
        owner: String,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum ScopeArg {
    All,
    Owner,
    Shared,
}

impl From<ScopeArg> for OnboardScope {
    fn from(arg: ScopeArg) -> Self {
        match arg {
            ScopeArg::All => OnboardScope::All,
            ScopeArg::Owner => OnboardScope::Owner,
            ScopeArg::Shared => OnboardScope::Shared,
        }
    }
}

fn init_telemetry(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    let registry = tracing_subscriber::registry().with(filter);

    if cli.json_logs {
        registry
            .with(fmt::layer().json().with_target(true).with_thread_ids(false))
            .init();
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_ansi(true),
            )
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_telemetry(&cli);

    let config = match &cli.config {
        Some(path) => squire_config::load_config(path)?,
        None => squire_config::discover_and_load(),
    };
    info!(version = env!("CARGO_PKG_VERSION"), "squire starting");

    let json = cli.json;
    let mut svc = SkillOnboarding::with_secrets(config.skills.clone());

    match cli.command {
        Commands::Pending { owner } => {
            let pending = svc.list_pending(owner.as_deref(), true);
            if json {
                println!("{}", serde_json::to_string_pretty(&pending)?);
            } else if pending.is_empty() {
                println!("No pending skills.");
            } else {
                for c in &pending {
                    let failed = squire_skills::preflight::read_failed(c)
                        .map(|f| format!("  [failed: {}]", f.stage))
                        .unwrap_or_default();
                    println!("  {} ({}){failed}", c.name, scope_label(c));
                }
            }
            Ok(())
        },
        Commands::Preflight {
            skill,
            owner,
            run_scripts,
            no_install,
            dry_run,
        } => {
            let opts = PreflightOptions {
                install_deps: !no_install,
                run_scripts,
                dry_run,
            };
            let mut candidates = svc.list_pending(owner.as_deref(), true);
            if let Some(name) = &skill {
                candidates.retain(|c| &c.name == name);
                if candidates.is_empty() {
                    bail!("no pending skill named {name:?}");
                }
            }

            let mut failed = 0;
            for candidate in candidates {
                let report = svc.preflight(&candidate, opts).await;
                if !report.ok {
                    failed += 1;
                }
                if json {
                    println!("{}", serde_json::to_string_pretty(&report)?);
                } else {
                    print_report(&report);
                }
            }
            if failed > 0 {
                bail!("{failed} skill(s) failed preflight");
            }
            Ok(())
        },
        Commands::Onboard {
            owner,
            scope,
            skills,
            dry_run,
            run_scripts,
            no_install,
        } => {
            let names = (!skills.is_empty()).then_some(skills);
            let summary = svc
                .onboard_pending(
                    owner.as_deref(),
                    scope.into(),
                    dry_run,
                    names.as_deref(),
                    !no_install,
                    run_scripts,
                )
                .await;
            if json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                for outcome in &summary.results {
                    let detail = outcome
                        .reason
                        .as_deref()
                        .or(outcome.error.as_deref())
                        .map(|s| format!(" — {s}"))
                        .unwrap_or_default();
                    println!("  {}: {:?}{detail}", outcome.candidate, outcome.status);
                }
                println!(
                    "{} onboarded, {} skipped, {} failed (of {})",
                    summary.onboarded, summary.skipped, summary.failed, summary.total
                );
            }
            if !summary.ok {
                bail!("{} skill(s) failed onboarding", summary.failed);
            }
            Ok(())
        },
        Commands::Repair {
            name,
            owner,
            shared,
            run_scripts,
        } => {
            let scope = if shared { Scope::Shared } else { Scope::Owner };
            let outcome = svc
                .repair_installed(owner.as_deref(), &name, scope, run_scripts)
                .await;
            if json {
                println!("{}", serde_json::to_string_pretty(&outcome)?);
            } else if let Some(report) = &outcome.report {
                print_report(report);
            }
            if !outcome.ok {
                bail!(
                    "repair failed: {}",
                    outcome.error.as_deref().unwrap_or("see report")
                );
            }
            Ok(())
        },
        Commands::List { owner } => {
            let skills = discover::list_active(svc.config(), owner.as_deref());
            if json {
                println!("{}", serde_json::to_string_pretty(&skills)?);
            } else if skills.is_empty() {
                println!("No active skills.");
            } else {
                for c in &skills {
                    println!("  {} ({})", c.name, scope_label(c));
                }
            }
            Ok(())
        },
        Commands::Info { name, owner } => {
            let manifest = discover::manifest_for(svc.config(), owner.as_deref(), &name)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&manifest)?);
            } else {
                println!("Name:        {}", manifest.name);
                println!("Description: {}", manifest.description);
                print_requirement_list("Env", &manifest.requires.env);
                print_requirement_list("Config", &manifest.requires.config);
                print_requirement_list("Bins", &manifest.requires.bins);
                let packages = manifest.pip_packages();
                if !packages.is_empty() {
                    println!("Installs:    {}", packages.join(", "));
                }
            }
            Ok(())
        },
        Commands::Doctor { owner } => handle_doctor(&svc, owner.as_deref(), json),
        Commands::Uninstall { name, owner } => {
            let removed = discover::uninstall_skill(svc.config(), &owner, &name)?;
            println!("Removed {}", removed.display());
            Ok(())
        },
    }
}

fn handle_doctor(svc: &SkillOnboarding, owner: Option<&str>, json: bool) -> anyhow::Result<()> {
    let cfg = svc.config().clone();
    let mut source = squire_skills::SecretsEnvSource::new(cfg.clone());
    let needs = validate::missing_requirements(&cfg, owner, &mut source)?;

    let python = which::which("python3").is_ok();
    let uv = which::which("uv").is_ok();

    if json {
        let out = serde_json::json!({
            "ok": needs.is_empty() && python,
            "python3": python,
            "uv": uv,
            "missing_requirements": needs,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        println!("python3: {}", if python { "found" } else { "MISSING" });
        println!(
            "uv:      {}",
            if uv { "found" } else { "not found (pip fallback)" }
        );
        if needs.is_empty() {
            println!("All active skill requirements satisfied.");
        } else {
            for need in &needs {
                println!("  {}:", need.skill);
                for v in &need.missing_env {
                    println!("    env    {}{}", v.name, prompt_suffix(v));
                }
                for v in &need.missing_config {
                    println!("    config {}{}", v.name, prompt_suffix(v));
                }
                for b in &need.missing_bins {
                    println!("    bin    {}{}", b.name, prompt_suffix(b));
                }
                for f in &need.missing_files {
                    println!("    file   {} (from {})", f.destination, f.template);
                }
            }
        }
    }
    if !python {
        bail!("python3 is required for skill onboarding");
    }
    Ok(())
}

fn print_report(report: &PreflightReport) {
    println!(
        "{} ({}): {}",
        report.skill,
        report.scope,
        if report.ok { "OK" } else { "FAILED" }
    );
    for step in &report.steps {
        let ok = step
            .result
            .get("ok")
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(true);
        println!("  {} {}", if ok { "✓" } else { "✗" }, step.stage);
    }
    if let Some(error) = &report.error {
        println!("  error: {error}");
    }
}

fn print_requirement_list(label: &str, specs: &[squire_skills::types::RequirementSpec]) {
    if specs.is_empty() {
        return;
    }
    let names: Vec<&str> = specs.iter().map(|s| s.name.as_str()).collect();
    println!("{label:<12} {}", names.join(", "));
}

fn prompt_suffix(value: &validate::MissingValue) -> String {
    value
        .prompt
        .as_deref()
        .map(|p| format!(" — {p}"))
        .unwrap_or_default()
}

fn scope_label(candidate: &squire_skills::types::SkillCandidate) -> String {
    match candidate.owner.as_deref() {
        Some(owner) => format!("owner: {owner}"),
        None => "shared".to_string(),
    }
}
