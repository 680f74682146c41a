use {
    anyhow::{Context, bail},
    serde::Deserialize,
};

use crate::types::{
    InstallKind, InstallSpec, RequirementSpec, SkillManifest, SkillRequires, WhenClause,
};

/// Validate a skill name: lowercase ASCII, digits, hyphens/underscores, 1-64 chars.
pub fn validate_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 64
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
        && !name.starts_with('-')
        && !name.ends_with('-')
        && !name.contains("--")
}

/// Parse a SKILL.md file into a normalized manifest.
///
/// `fallback_name` is the bundle directory name, used when the frontmatter
/// omits `name`.
pub fn parse_manifest(content: &str, fallback_name: &str) -> anyhow::Result<SkillManifest> {
    let (frontmatter, _body) = split_frontmatter(content)?;
    let raw: RawManifest =
        serde_yaml::from_str(&frontmatter).context("invalid SKILL.md frontmatter")?;

    let name = raw
        .name
        .as_deref()
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .unwrap_or(fallback_name)
        .to_string();
    if !validate_name(&name) {
        bail!(
            "invalid skill name '{name}': must be 1-64 lowercase alphanumeric/hyphen/underscore chars"
        );
    }

    let requires = match raw.requires {
        Some(req) => SkillRequires {
            env: normalize_entries(req.env)?,
            config: normalize_entries(req.config)?,
            bins: normalize_entries(req.bins)?,
        },
        None => SkillRequires::default(),
    };

    let install = raw
        .install
        .into_iter()
        .map(|spec| InstallSpec {
            kind: match spec.kind.as_str() {
                "pip" | "uv" => InstallKind::Pip,
                _ => InstallKind::Other,
            },
            package: spec.package.or(spec.pkg),
        })
        .collect();

    Ok(SkillManifest {
        name,
        description: raw.description.unwrap_or_default(),
        requires,
        install,
    })
}

// ── Raw frontmatter shapes ──────────────────────────────────────────────────

#[derive(Deserialize, Default)]
struct RawManifest {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    requires: Option<RawRequires>,
    #[serde(default)]
    install: Vec<RawInstallSpec>,
}

#[derive(Deserialize, Default)]
struct RawRequires {
    #[serde(default)]
    env: Vec<RawRequirement>,
    #[serde(default)]
    config: Vec<RawRequirement>,
    #[serde(default)]
    bins: Vec<RawRequirement>,
}

/// A requirement is either a bare name or a map with prompt/example/when.
#[derive(Deserialize)]
#[serde(untagged)]
enum RawRequirement {
    Name(String),
    Spec(RawRequirementSpec),
}

#[derive(Deserialize)]
struct RawRequirementSpec {
    name: String,
    #[serde(default)]
    prompt: Option<String>,
    #[serde(default)]
    example: Option<String>,
    #[serde(default)]
    when: Option<RawWhen>,
}

/// `when: {config: <key>, equals: <value>}` or `when: {env: <key>, ...}`.
#[derive(Deserialize)]
struct RawWhen {
    #[serde(default)]
    config: Option<String>,
    #[serde(default)]
    env: Option<String>,
    #[serde(default)]
    equals: Option<serde_yaml::Value>,
}

#[derive(Deserialize)]
struct RawInstallSpec {
    #[serde(default)]
    kind: String,
    #[serde(default)]
    package: Option<String>,
    #[serde(default)]
    pkg: Option<String>,
}

/// Normalize string-or-map entries, dropping blanks and later duplicates.
fn normalize_entries(raw: Vec<RawRequirement>) -> anyhow::Result<Vec<RequirementSpec>> {
    let mut out: Vec<RequirementSpec> = Vec::new();
    for entry in raw {
        let spec = match entry {
            RawRequirement::Name(name) => RequirementSpec::named(name.trim()),
            RawRequirement::Spec(raw) => RequirementSpec {
                name: raw.name.trim().to_string(),
                prompt: raw.prompt,
                example: raw.example,
                when: match raw.when {
                    Some(when) => parse_when(when)?,
                    None => WhenClause::Always,
                },
            },
        };
        if spec.name.is_empty() {
            continue;
        }
        if out.iter().any(|existing| existing.name == spec.name) {
            continue;
        }
        out.push(spec);
    }
    Ok(out)
}

fn parse_when(raw: RawWhen) -> anyhow::Result<WhenClause> {
    let equals = raw.equals.map(|value| yaml_scalar_to_string(&value));
    match (raw.config, raw.env) {
        (Some(key), None) => Ok(WhenClause::ConfigEquals { key, equals }),
        (None, Some(key)) => Ok(WhenClause::EnvEquals { key, equals }),
        (Some(_), Some(_)) => bail!("when clause may reference either config or env, not both"),
        (None, None) => bail!("when clause must reference a config or env key"),
    }
}

/// Scalars compare as their string rendering; structured values never match.
fn yaml_scalar_to_string(value: &serde_yaml::Value) -> String {
    match value {
        serde_yaml::Value::String(s) => s.clone(),
        serde_yaml::Value::Bool(b) => b.to_string(),
        serde_yaml::Value::Number(n) => n.to_string(),
        _ => String::new(),
    }
}

/// Split SKILL.md content at `---` delimiters into (frontmatter, body).
pub fn split_frontmatter(content: &str) -> anyhow::Result<(String, String)> {
    let trimmed = content.trim_start();
    if !trimmed.starts_with("---") {
        bail!("SKILL.md must start with YAML frontmatter delimited by ---");
    }

    // Skip the opening ---
    let after_open = &trimmed[3..];
    let close_pos = after_open
        .find("\n---")
        .context("SKILL.md missing closing --- for frontmatter")?;

    let frontmatter = after_open[..close_pos].trim().to_string();
    let body = after_open[close_pos + 4..].trim().to_string();
    Ok((frontmatter, body))
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_name() {
        assert!(validate_name("my-skill"));
        assert!(validate_name("skill_2"));
        assert!(validate_name("a"));
        assert!(!validate_name(""));
        assert!(!validate_name("-bad"));
        assert!(!validate_name("bad-"));
        assert!(!validate_name("Bad"));
        assert!(!validate_name("has space"));
        assert!(!validate_name("has--double"));
        assert!(!validate_name(&"a".repeat(65)));
    }

    #[test]
    fn test_parse_minimal() {
        let content = "---\nname: web-search\ndescription: Search the web\n---\nBody here.\n";
        let manifest = parse_manifest(content, "web-search").unwrap();
        assert_eq!(manifest.name, "web-search");
        assert_eq!(manifest.description, "Search the web");
        assert!(manifest.requires.is_empty());
        assert!(manifest.install.is_empty());
    }

    #[test]
    fn test_name_falls_back_to_directory() {
        let content = "---\ndescription: no explicit name\n---\nBody.\n";
        let manifest = parse_manifest(content, "mail-digest").unwrap();
        assert_eq!(manifest.name, "mail-digest");
    }

    #[test]
    fn test_string_and_map_requirements() {
        let content = r#"---
name: mailer
description: Sends mail
requires:
  env:
    - SMTP_HOST
    - name: SMTP_PASSWORD
      prompt: App password for the SMTP account
      example: xxxx-xxxx
  config:
    - name: signature.txt
  bins:
    - curl
---
Body.
"#;
        let manifest = parse_manifest(content, "mailer").unwrap();
        assert_eq!(manifest.requires.env.len(), 2);
        assert_eq!(manifest.requires.env[0].name, "SMTP_HOST");
        assert_eq!(
            manifest.requires.env[1].prompt.as_deref(),
            Some("App password for the SMTP account")
        );
        assert_eq!(manifest.requires.config[0].name, "signature.txt");
        assert_eq!(manifest.requires.bins[0].name, "curl");
    }

    #[test]
    fn test_duplicate_and_blank_entries_dropped() {
        let content = r#"---
name: dedupe
requires:
  env:
    - API_KEY
    - "  "
    - name: API_KEY
      prompt: ignored duplicate
---
Body.
"#;
        let manifest = parse_manifest(content, "dedupe").unwrap();
        assert_eq!(manifest.requires.env.len(), 1);
        assert!(manifest.requires.env[0].prompt.is_none());
    }

    #[test]
    fn test_when_clauses() {
        let content = r#"---
name: mail
requires:
  env:
    - name: IMAP_PASSWORD
      when:
        config: backend
        equals: imap
    - name: OAUTH_TOKEN
      when:
        env: MAIL_OAUTH
---
Body.
"#;
        let manifest = parse_manifest(content, "mail").unwrap();
        assert_eq!(
            manifest.requires.env[0].when,
            WhenClause::ConfigEquals {
                key: "backend".into(),
                equals: Some("imap".into()),
            }
        );
        assert_eq!(
            manifest.requires.env[1].when,
            WhenClause::EnvEquals {
                key: "MAIL_OAUTH".into(),
                equals: None,
            }
        );
    }

    #[test]
    fn test_when_equals_scalar_rendering() {
        let content = r#"---
name: toggles
requires:
  env:
    - name: VERBOSE_LOG
      when:
        config: debug
        equals: true
---
Body.
"#;
        let manifest = parse_manifest(content, "toggles").unwrap();
        assert_eq!(
            manifest.requires.env[0].when,
            WhenClause::ConfigEquals {
                key: "debug".into(),
                equals: Some("true".into()),
            }
        );
    }

    #[test]
    fn test_when_both_keys_rejected() {
        let content = r#"---
name: broken
requires:
  env:
    - name: X
      when:
        config: a
        env: b
---
Body.
"#;
        assert!(parse_manifest(content, "broken").is_err());
    }

    #[test]
    fn test_install_specs() {
        let content = r#"---
name: pdf-tools
install:
  - kind: pip
    package: pypdf
  - kind: uv
    pkg: reportlab
  - kind: brew
    package: poppler
---
Body.
"#;
        let manifest = parse_manifest(content, "pdf-tools").unwrap();
        assert_eq!(manifest.pip_packages(), vec!["pypdf", "reportlab"]);
        assert_eq!(manifest.install[2].kind, InstallKind::Other);
    }

    #[test]
    fn test_invalid_name_rejected() {
        let content = "---\nname: Bad-Name\n---\nbody\n";
        assert!(parse_manifest(content, "bad").is_err());
    }

    #[test]
    fn test_missing_frontmatter() {
        let content = "# No frontmatter\nJust markdown.";
        assert!(parse_manifest(content, "x").is_err());
    }

    #[test]
    fn test_missing_closing_delimiter() {
        let content = "---\nname: test\nno closing\n";
        assert!(parse_manifest(content, "test").is_err());
    }
}
