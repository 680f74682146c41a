use std::path::PathBuf;

use {
    anyhow::Context,
    serde::{Deserialize, Serialize},
};

use crate::types::{SKILL_MD_ALT, SkillCandidate};

/// What normalization did to the bundle, for the preflight report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizeOutcome {
    pub ok: bool,
    pub actions: Vec<String>,
    pub skill_md: PathBuf,
}

/// Normalize the bundle's SKILL.md in place.
///
/// Conservative and idempotent:
/// - rename `skill.md` to `SKILL.md`
/// - if missing, author a minimal SKILL.md with frontmatter
/// - if the file lacks a frontmatter block, prepend a minimal one
///
/// Content is never rewritten beyond that; a second run performs no actions.
pub fn normalize(candidate: &SkillCandidate) -> anyhow::Result<NormalizeOutcome> {
    std::fs::create_dir_all(&candidate.dir)
        .with_context(|| format!("creating {}", candidate.dir.display()))?;

    let skill_md = candidate.skill_md_path();
    let alt = candidate.dir.join(SKILL_MD_ALT);
    let mut actions = Vec::new();

    if !skill_md.exists() && alt.exists() {
        std::fs::rename(&alt, &skill_md).context("renaming skill.md")?;
        actions.push("renamed skill.md -> SKILL.md".to_string());
    }

    if !skill_md.exists() {
        let content = format!(
            "---\nname: {name}\ndescription: Pending skill (auto-generated)\n---\n\n\
             # {name}\n\n\
             ## What this skill does\n\n(Describe the capability here.)\n\n\
             ## How to use\n\n(Step-by-step instructions for the agent.)\n",
            name = candidate.name
        );
        std::fs::write(&skill_md, content).context("writing SKILL.md")?;
        actions.push("created SKILL.md".to_string());
    }

    // Unreadable (e.g. non-UTF-8) content is replaced rather than propagated.
    let content = std::fs::read_to_string(&skill_md).unwrap_or_default();
    if !content.starts_with("---") {
        let body = content.trim();
        let mut new_content = format!(
            "---\nname: {}\ndescription: Pending skill\n---\n\n",
            candidate.name
        );
        if !body.is_empty() {
            new_content.push_str(body);
            new_content.push('\n');
        }
        std::fs::write(&skill_md, new_content).context("writing SKILL.md")?;
        actions.push("added frontmatter".to_string());
    }

    Ok(NormalizeOutcome {
        ok: true,
        actions,
        skill_md,
    })
}
