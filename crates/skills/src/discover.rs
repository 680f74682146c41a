use std::path::{Path, PathBuf};

use {anyhow::Context, squire_config::SkillsConfig};

use crate::types::{RESERVED_DIR_NAMES, Scope, SkillCandidate};

/// Enumerate pending candidates: shared first, then each owner, both sorted.
///
/// A candidate is any direct subdirectory of a `pending/` staging dir that is
/// not hidden, `__`-prefixed, or a reserved name. Presence of a manifest is
/// NOT required here; normalization decides what to do with manifest-less
/// bundles later.
pub fn pending_candidates(cfg: &SkillsConfig) -> Vec<SkillCandidate> {
    let mut out = Vec::new();
    collect_bundles(&cfg.shared_pending_dir(), Scope::Shared, None, &mut out);
    for owner in owner_names(cfg) {
        collect_bundles(
            &cfg.owner_pending_dir(&owner),
            Scope::Owner,
            Some(owner),
            &mut out,
        );
    }
    out
}

/// Pending candidates for one caller: optionally the shared staging dir,
/// plus the given owner's staging dir.
pub fn pending_for(
    cfg: &SkillsConfig,
    owner: Option<&str>,
    include_shared: bool,
) -> Vec<SkillCandidate> {
    let mut out = Vec::new();
    if include_shared {
        collect_bundles(&cfg.shared_pending_dir(), Scope::Shared, None, &mut out);
    }
    if let Some(owner) = owner {
        collect_bundles(
            &cfg.owner_pending_dir(owner),
            Scope::Owner,
            Some(owner.to_string()),
            &mut out,
        );
    }
    out
}

/// Enumerate active (already promoted) skills, shared first then per owner.
pub fn active_candidates(cfg: &SkillsConfig) -> Vec<SkillCandidate> {
    let mut out = Vec::new();
    collect_bundles(&cfg.shared_root(), Scope::Shared, None, &mut out);
    for owner in owner_names(cfg) {
        collect_bundles(&cfg.owner_root(&owner), Scope::Owner, Some(owner), &mut out);
    }
    out
}

/// Active skills visible to one caller: shared plus the owner's own, with an
/// owner copy shadowing a shared one of the same name. Only directories that
/// carry a manifest or entry script count.
pub fn list_active(cfg: &SkillsConfig, owner: Option<&str>) -> Vec<SkillCandidate> {
    let mut by_name: std::collections::BTreeMap<String, SkillCandidate> =
        std::collections::BTreeMap::new();
    let mut shared = Vec::new();
    collect_bundles(&cfg.shared_root(), Scope::Shared, None, &mut shared);
    for candidate in shared {
        if has_skill_files(&candidate) {
            by_name.insert(candidate.name.clone(), candidate);
        }
    }
    if let Some(owner) = owner {
        let mut own = Vec::new();
        collect_bundles(
            &cfg.owner_root(owner),
            Scope::Owner,
            Some(owner.to_string()),
            &mut own,
        );
        for candidate in own {
            if has_skill_files(&candidate) {
                by_name.insert(candidate.name.clone(), candidate);
            }
        }
    }
    by_name.into_values().collect()
}

/// Parse the manifest of an active skill, resolved like [`find_active`].
pub fn manifest_for(
    cfg: &SkillsConfig,
    owner: Option<&str>,
    name: &str,
) -> anyhow::Result<crate::types::SkillManifest> {
    let candidate = find_active(cfg, name, owner)
        .ok_or_else(|| anyhow::anyhow!("skill not found: {name}"))?;
    let content = std::fs::read_to_string(candidate.skill_md_path())
        .with_context(|| format!("reading {}", candidate.skill_md_path().display()))?;
    crate::parse::parse_manifest(&content, &candidate.name)
}

/// Remove an owner's active skill directory. Shared skills are deliberately
/// out of reach here.
pub fn uninstall_skill(cfg: &SkillsConfig, owner: &str, name: &str) -> anyhow::Result<PathBuf> {
    if !crate::parse::validate_name(name) {
        anyhow::bail!("invalid skill name: {name:?}");
    }
    let dir = cfg.owner_root(owner).join(name);
    if !dir.is_dir() {
        anyhow::bail!("skill not found: {}", dir.display());
    }
    std::fs::remove_dir_all(&dir).with_context(|| format!("removing {}", dir.display()))?;
    Ok(dir)
}

fn has_skill_files(candidate: &SkillCandidate) -> bool {
    candidate.skill_md_path().is_file() || candidate.dir.join("skill.py").is_file()
}

/// Locate one active skill by name, preferring the owner's copy over shared.
pub fn find_active(cfg: &SkillsConfig, name: &str, owner: Option<&str>) -> Option<SkillCandidate> {
    if let Some(owner) = owner {
        let dir = cfg.owner_root(owner).join(name);
        if dir.is_dir() {
            return Some(SkillCandidate {
                scope: Scope::Owner,
                owner: Some(owner.to_string()),
                name: name.to_string(),
                dir,
            });
        }
    }
    let dir = cfg.shared_root().join(name);
    if dir.is_dir() {
        return Some(SkillCandidate {
            scope: Scope::Shared,
            owner: None,
            name: name.to_string(),
            dir,
        });
    }
    None
}

/// Owner directory names under `skills_dir`, excluding the shared root,
/// sorted for deterministic passes.
pub fn owner_names(cfg: &SkillsConfig) -> Vec<String> {
    let base = Path::new(&cfg.skills_dir);
    let shared = cfg.shared_root();
    let entries = match std::fs::read_dir(base) {
        Ok(e) => e,
        Err(_) => return Vec::new(),
    };

    let mut owners: Vec<String> = entries
        .flatten()
        .filter(|entry| entry.path().is_dir())
        .filter(|entry| entry.path() != shared)
        .filter_map(|entry| entry.file_name().into_string().ok())
        .filter(|name| is_eligible_dir_name(name))
        .collect();
    owners.sort();
    owners
}

fn collect_bundles(
    base: &Path,
    scope: Scope,
    owner: Option<String>,
    out: &mut Vec<SkillCandidate>,
) {
    let entries = match std::fs::read_dir(base) {
        Ok(e) => e,
        Err(_) => return,
    };

    let mut found: Vec<SkillCandidate> = entries
        .flatten()
        .filter(|entry| entry.path().is_dir())
        .filter_map(|entry| entry.file_name().into_string().ok().map(|n| (entry, n)))
        .filter(|(_, name)| is_eligible_dir_name(name))
        .map(|(entry, name)| SkillCandidate {
            scope,
            owner: owner.clone(),
            name,
            dir: entry.path(),
        })
        .collect();
    found.sort_by(|a, b| a.name.cmp(&b.name));
    out.extend(found);
}

/// Hidden, dunder-prefixed, and reserved directory names are never skills
/// (or owners).
fn is_eligible_dir_name(name: &str) -> bool {
    !name.starts_with('.') && !name.starts_with("__") && !RESERVED_DIR_NAMES.contains(&name)
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(root: &Path) -> SkillsConfig {
        SkillsConfig {
            skills_dir: root.join("skills").to_string_lossy().into_owned(),
            shared_dir: root.join("skills/shared").to_string_lossy().into_owned(),
            workspace_dir: root.join("workspace").to_string_lossy().into_owned(),
            ..SkillsConfig::default()
        }
    }

    #[test]
    fn test_pending_order_shared_then_owners() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = test_config(tmp.path());
        std::fs::create_dir_all(cfg.shared_pending_dir().join("zeta")).unwrap();
        std::fs::create_dir_all(cfg.owner_pending_dir("bob").join("alpha")).unwrap();
        std::fs::create_dir_all(cfg.owner_pending_dir("ada").join("beta")).unwrap();

        let found = pending_candidates(&cfg);
        let names: Vec<(&str, Option<&str>)> = found
            .iter()
            .map(|c| (c.name.as_str(), c.owner.as_deref()))
            .collect();
        assert_eq!(
            names,
            vec![
                ("zeta", None),
                ("beta", Some("ada")),
                ("alpha", Some("bob")),
            ]
        );
        assert_eq!(found[0].scope, Scope::Shared);
        assert_eq!(found[1].scope, Scope::Owner);
    }

    #[test]
    fn test_reserved_and_hidden_dirs_skipped() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = test_config(tmp.path());
        let pending = cfg.shared_pending_dir();
        for name in ["real-skill", ".git", "__pycache__", ".venv", "failed"] {
            std::fs::create_dir_all(pending.join(name)).unwrap();
        }
        std::fs::write(pending.join("a-file.txt"), "not a dir").unwrap();

        let found = pending_candidates(&cfg);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name, "real-skill");
    }

    #[test]
    fn test_shared_root_not_treated_as_owner() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = test_config(tmp.path());
        // The shared root sits inside skills_dir; its pending dir must not be
        // double-counted as an owner named "shared".
        std::fs::create_dir_all(cfg.shared_pending_dir().join("common")).unwrap();
        std::fs::create_dir_all(cfg.owner_pending_dir("ada").join("mine")).unwrap();

        let found = pending_candidates(&cfg);
        assert_eq!(found.len(), 2);
        assert!(found.iter().all(|c| c.owner.as_deref() != Some("shared")));
    }

    #[test]
    fn test_missing_roots_yield_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = test_config(tmp.path());
        assert!(pending_candidates(&cfg).is_empty());
        assert!(active_candidates(&cfg).is_empty());
    }

    #[test]
    fn test_find_active_prefers_owner_copy() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = test_config(tmp.path());
        std::fs::create_dir_all(cfg.shared_root().join("notes")).unwrap();
        std::fs::create_dir_all(cfg.owner_root("ada").join("notes")).unwrap();

        let hit = find_active(&cfg, "notes", Some("ada")).unwrap();
        assert_eq!(hit.scope, Scope::Owner);
        assert_eq!(hit.owner.as_deref(), Some("ada"));

        let shared = find_active(&cfg, "notes", None).unwrap();
        assert_eq!(shared.scope, Scope::Shared);

        assert!(find_active(&cfg, "missing", Some("ada")).is_none());
    }

    #[test]
    fn test_list_active_owner_shadows_shared() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = test_config(tmp.path());
        let shared = cfg.shared_root().join("notes");
        std::fs::create_dir_all(&shared).unwrap();
        std::fs::write(shared.join("SKILL.md"), "---\nname: notes\n---\n").unwrap();
        let own = cfg.owner_root("ada").join("notes");
        std::fs::create_dir_all(&own).unwrap();
        std::fs::write(own.join("skill.py"), "print('hi')\n").unwrap();
        // Bare directory without manifest or entry script is not a skill.
        std::fs::create_dir_all(cfg.shared_root().join("junk")).unwrap();

        let skills = list_active(&cfg, Some("ada"));
        assert_eq!(skills.len(), 1);
        assert_eq!(skills[0].scope, Scope::Owner);
        assert_eq!(skills[0].dir, own);

        let shared_view = list_active(&cfg, None);
        assert_eq!(shared_view.len(), 1);
        assert_eq!(shared_view[0].scope, Scope::Shared);
    }

    #[test]
    fn test_manifest_for_reads_frontmatter() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = test_config(tmp.path());
        let dir = cfg.shared_root().join("weather");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join("SKILL.md"),
            "---\nname: weather\ndescription: forecasts\n---\nBody.\n",
        )
        .unwrap();

        let manifest = manifest_for(&cfg, None, "weather").unwrap();
        assert_eq!(manifest.description, "forecasts");
        assert!(manifest_for(&cfg, None, "absent").is_err());
    }

    #[test]
    fn test_uninstall_removes_owner_skill_only() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = test_config(tmp.path());
        let dir = cfg.owner_root("ada").join("notes");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("SKILL.md"), "---\nname: notes\n---\n").unwrap();

        let removed = uninstall_skill(&cfg, "ada", "notes").unwrap();
        assert_eq!(removed, dir);
        assert!(!dir.exists());
        assert!(uninstall_skill(&cfg, "ada", "notes").is_err());
        assert!(uninstall_skill(&cfg, "ada", "../escape").is_err());
    }

    #[test]
    fn test_active_excludes_pending_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = test_config(tmp.path());
        std::fs::create_dir_all(cfg.shared_root().join("live-skill")).unwrap();
        std::fs::create_dir_all(cfg.shared_pending_dir().join("staged")).unwrap();

        let found = active_candidates(&cfg);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name, "live-skill");
    }
}
