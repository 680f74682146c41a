use std::path::Path;

use {
    anyhow::Context,
    sha2::{Digest, Sha256},
    walkdir::WalkDir,
};

use crate::types::{FAILED_FILE, REPORT_JSON, REPORT_MD};

/// Subtrees that are runtime artifacts, not bundle content.
const EXCLUDED_DIRS: &[&str] = &[".venv", ".venvs", "__pycache__"];

/// Files the pipeline itself writes; they must not perturb the hash.
const EXCLUDED_FILES: &[&str] = &[FAILED_FILE, REPORT_JSON, REPORT_MD];

/// Content-hash a bundle directory.
///
/// The hash covers every regular file's slash-normalized relative path, byte
/// length, and bytes, visited in sorted path order, so two directory trees
/// hash equal iff their non-artifact content is byte-identical. Excluded:
/// the isolated environment, bytecode caches, and pipeline-written markers.
pub fn fingerprint_dir(root: &Path) -> anyhow::Result<String> {
    let mut files: Vec<(String, std::path::PathBuf)> = Vec::new();

    for entry in WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| !is_excluded_dir(e))
    {
        let entry = entry.with_context(|| format!("walking {}", root.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy();
        if entry.depth() == 1 && EXCLUDED_FILES.contains(&name.as_ref()) {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(root)
            .with_context(|| format!("relativizing {}", entry.path().display()))?;
        let rel = rel.to_string_lossy().replace('\\', "/");
        files.push((rel, entry.path().to_path_buf()));
    }

    files.sort_by(|a, b| a.0.cmp(&b.0));

    let mut hasher = Sha256::new();
    for (rel, path) in files {
        let bytes =
            std::fs::read(&path).with_context(|| format!("reading {}", path.display()))?;
        hasher.update(rel.as_bytes());
        hasher.update([0u8]);
        hasher.update(bytes.len().to_le_bytes());
        hasher.update([0u8]);
        hasher.update(&bytes);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

fn is_excluded_dir(entry: &walkdir::DirEntry) -> bool {
    entry.depth() > 0
        && entry.file_type().is_dir()
        && entry
            .file_name()
            .to_str()
            .is_some_and(|name| EXCLUDED_DIRS.contains(&name))
}
