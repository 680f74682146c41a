use std::{
    collections::BTreeSet,
    path::{Path, PathBuf},
};

use {
    anyhow::Context,
    serde::{Deserialize, Serialize},
    walkdir::WalkDir,
};

use crate::types::{SkillCandidate, SkillManifest};

pub const MARKER_START: &str = "# --- AUTO-GENERATED (imports) ---";
pub const MARKER_END: &str = "# --- END AUTO-GENERATED (imports) ---";

pub const INSTALL_MARKER_START: &str = "# --- AUTO-GENERATED (SKILL.md install) ---";
pub const INSTALL_MARKER_END: &str = "# --- END AUTO-GENERATED (SKILL.md install) ---";

/// Top-level CPython standard-library module names (3.12). Imports of these
/// never become install requirements.
const STDLIB_MODULES: &[&str] = &[
    "__future__",
    "_thread",
    "abc",
    "aifc",
    "argparse",
    "array",
    "ast",
    "asyncio",
    "atexit",
    "audioop",
    "base64",
    "bdb",
    "binascii",
    "bisect",
    "builtins",
    "bz2",
    "cProfile",
    "calendar",
    "cgi",
    "cgitb",
    "chunk",
    "cmath",
    "cmd",
    "code",
    "codecs",
    "codeop",
    "collections",
    "colorsys",
    "compileall",
    "concurrent",
    "configparser",
    "contextlib",
    "contextvars",
    "copy",
    "copyreg",
    "crypt",
    "csv",
    "ctypes",
    "curses",
    "dataclasses",
    "datetime",
    "dbm",
    "decimal",
    "difflib",
    "dis",
    "doctest",
    "email",
    "encodings",
    "ensurepip",
    "enum",
    "errno",
    "faulthandler",
    "fcntl",
    "filecmp",
    "fileinput",
    "fnmatch",
    "fractions",
    "ftplib",
    "functools",
    "gc",
    "getopt",
    "getpass",
    "gettext",
    "glob",
    "graphlib",
    "grp",
    "gzip",
    "hashlib",
    "heapq",
    "hmac",
    "html",
    "http",
    "imaplib",
    "imghdr",
    "importlib",
    "inspect",
    "io",
    "ipaddress",
    "itertools",
    "json",
    "keyword",
    "linecache",
    "locale",
    "logging",
    "lzma",
    "mailbox",
    "marshal",
    "math",
    "mimetypes",
    "mmap",
    "modulefinder",
    "multiprocessing",
    "netrc",
    "nntplib",
    "numbers",
    "operator",
    "optparse",
    "os",
    "pathlib",
    "pdb",
    "pickle",
    "pickletools",
    "pipes",
    "pkgutil",
    "platform",
    "plistlib",
    "poplib",
    "posixpath",
    "pprint",
    "profile",
    "pstats",
    "pty",
    "pwd",
    "py_compile",
    "pyclbr",
    "pydoc",
    "queue",
    "quopri",
    "random",
    "re",
    "readline",
    "reprlib",
    "resource",
    "rlcompleter",
    "runpy",
    "sched",
    "secrets",
    "select",
    "selectors",
    "shelve",
    "shlex",
    "shutil",
    "signal",
    "site",
    "smtplib",
    "socket",
    "socketserver",
    "sqlite3",
    "ssl",
    "stat",
    "statistics",
    "string",
    "stringprep",
    "struct",
    "subprocess",
    "symtable",
    "sys",
    "sysconfig",
    "syslog",
    "tarfile",
    "telnetlib",
    "tempfile",
    "termios",
    "textwrap",
    "threading",
    "time",
    "timeit",
    "tkinter",
    "token",
    "tokenize",
    "tomllib",
    "trace",
    "traceback",
    "tracemalloc",
    "tty",
    "turtle",
    "types",
    "typing",
    "unicodedata",
    "unittest",
    "urllib",
    "uu",
    "uuid",
    "venv",
    "warnings",
    "wave",
    "weakref",
    "webbrowser",
    "wsgiref",
    "xml",
    "xmlrpc",
    "zipapp",
    "zipfile",
    "zipimport",
    "zlib",
    "zoneinfo",
];

/// Import roots whose pip package is published under a different name.
const IMPORT_TO_PACKAGE: &[(&str, &str)] = &[
    ("Crypto", "pycryptodome"),
    ("PIL", "Pillow"),
    ("bs4", "beautifulsoup4"),
    ("cv2", "opencv-python"),
    ("dateutil", "python-dateutil"),
    ("sklearn", "scikit-learn"),
    ("yaml", "PyYAML"),
];

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GenerateOutcome {
    pub ok: bool,
    pub enabled: bool,
    pub generated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<bool>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub requirements: Vec<String>,
    /// Package names appended to a pre-existing requirements file.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub added: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

/// Generate or refresh the bundle's requirements.txt from static analysis.
///
/// Conservative rules:
/// - inferred imports are unioned with the manifest's declared pip packages
/// - an empty result creates no file
/// - an existing file is never rewritten or reordered; missing packages are
///   appended inside a fresh marker block, comparing base names so version
///   pins in existing lines are respected
pub fn generate_requirements(
    candidate: &SkillCandidate,
    manifest: &SkillManifest,
    enabled: bool,
) -> anyhow::Result<GenerateOutcome> {
    if !enabled {
        return Ok(GenerateOutcome {
            ok: true,
            ..GenerateOutcome::default()
        });
    }

    let (roots, warnings) = extract_import_roots(&candidate.dir);
    let mut packages: BTreeSet<String> =
        roots.iter().map(|r| map_import_to_package(r)).collect();
    packages.extend(manifest.pip_packages());
    let packages: Vec<String> = packages.into_iter().collect();

    if packages.is_empty() {
        return Ok(GenerateOutcome {
            ok: true,
            enabled: true,
            reason: Some("no third-party imports detected".into()),
            warnings,
            ..GenerateOutcome::default()
        });
    }

    let req_path = candidate.requirements_path();
    if !req_path.exists() {
        let mut content = String::from(MARKER_START);
        content.push('\n');
        for pkg in &packages {
            content.push_str(pkg);
            content.push('\n');
        }
        content.push_str(MARKER_END);
        content.push('\n');
        std::fs::write(&req_path, content).context("writing requirements.txt")?;
        return Ok(GenerateOutcome {
            ok: true,
            enabled: true,
            generated: true,
            created: Some(true),
            requirements: packages,
            path: Some(req_path.display().to_string()),
            warnings,
            ..GenerateOutcome::default()
        });
    }

    let existing = std::fs::read_to_string(&req_path).context("reading requirements.txt")?;
    let existing_pkgs: BTreeSet<String> = existing
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(base_package_name)
        .collect();

    let missing: Vec<String> = packages
        .iter()
        .filter(|pkg| !existing_pkgs.contains(&base_package_name(pkg)))
        .cloned()
        .collect();
    if missing.is_empty() {
        return Ok(GenerateOutcome {
            ok: true,
            enabled: true,
            reason: Some("requirements already contain inferred packages".into()),
            requirements: packages,
            warnings,
            ..GenerateOutcome::default()
        });
    }

    let mut content = existing.trim_end().to_string();
    content.push_str("\n\n");
    content.push_str(MARKER_START);
    content.push('\n');
    for pkg in &missing {
        content.push_str(pkg);
        content.push('\n');
    }
    content.push_str(MARKER_END);
    content.push('\n');
    std::fs::write(&req_path, content).context("writing requirements.txt")?;

    Ok(GenerateOutcome {
        ok: true,
        enabled: true,
        generated: true,
        created: Some(false),
        added: missing,
        requirements: packages,
        path: Some(req_path.display().to_string()),
        warnings,
        ..GenerateOutcome::default()
    })
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncInstallsOutcome {
    pub ok: bool,
    pub synced: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub added: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Fold the manifest's declared pip packages into requirements.txt, under a
/// separately-labelled fenced block so operators can tell declared installs
/// apart from inferred ones. Treated as best-effort by the orchestrator.
pub fn sync_manifest_installs(
    candidate: &SkillCandidate,
    manifest: &SkillManifest,
) -> anyhow::Result<SyncInstallsOutcome> {
    let packages = manifest.pip_packages();
    if packages.is_empty() {
        return Ok(SyncInstallsOutcome {
            ok: true,
            reason: Some("no pip installs declared".into()),
            ..SyncInstallsOutcome::default()
        });
    }

    let req_path = candidate.requirements_path();
    let existing = if req_path.exists() {
        std::fs::read_to_string(&req_path).context("reading requirements.txt")?
    } else {
        String::new()
    };
    let existing_pkgs: BTreeSet<String> = existing
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(base_package_name)
        .collect();

    let missing: Vec<String> = packages
        .into_iter()
        .filter(|pkg| !existing_pkgs.contains(&base_package_name(pkg)))
        .collect();
    if missing.is_empty() {
        return Ok(SyncInstallsOutcome {
            ok: true,
            reason: Some("declared installs already present".into()),
            ..SyncInstallsOutcome::default()
        });
    }

    let mut content = existing.trim_end().to_string();
    if !content.is_empty() {
        content.push_str("\n\n");
    }
    content.push_str(INSTALL_MARKER_START);
    content.push('\n');
    for pkg in &missing {
        content.push_str(pkg);
        content.push('\n');
    }
    content.push_str(INSTALL_MARKER_END);
    content.push('\n');
    std::fs::write(&req_path, content).context("writing requirements.txt")?;

    Ok(SyncInstallsOutcome {
        ok: true,
        synced: true,
        added: missing,
        reason: None,
    })
}

/// Base name of a requirements line, ignoring version pins and extras.
pub fn base_package_name(line: &str) -> String {
    let mut end = line.len();
    for (idx, ch) in line.char_indices() {
        if matches!(ch, '=' | '>' | '<' | '~' | '!' | '[' | ';' | ' ') {
            end = idx;
            break;
        }
    }
    line[..end].trim().to_string()
}

/// Every Python file in the bundle, skipping runtime artifacts.
pub(crate) fn python_files(root: &Path) -> Vec<PathBuf> {
    WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| {
            !(e.depth() > 0
                && e.file_type().is_dir()
                && e.file_name()
                    .to_str()
                    .is_some_and(|n| n == ".venv" || n == ".venvs" || n == "__pycache__"))
        })
        .flatten()
        .filter(|e| e.file_type().is_file())
        .filter(|e| e.path().extension().is_some_and(|ext| ext == "py"))
        .map(|e| e.into_path())
        .collect()
}

/// Top-level import roots referenced by the bundle's scripts, minus the
/// standard library and modules the bundle ships itself.
///
/// Line-oriented best-effort scan; imports inside string literals may be
/// picked up, which at worst adds a spurious install candidate.
fn extract_import_roots(skill_dir: &Path) -> (BTreeSet<String>, Vec<String>) {
    let mut roots = BTreeSet::new();
    let mut warnings = Vec::new();

    for py_file in python_files(skill_dir) {
        let src = match std::fs::read_to_string(&py_file) {
            Ok(src) => src,
            Err(e) => {
                warnings.push(format!("Failed to read {}: {e}", py_file.display()));
                continue;
            },
        };
        for line in src.lines() {
            roots.extend(import_roots_in_line(line));
        }
    }

    let filtered = roots
        .into_iter()
        .filter(|root| !STDLIB_MODULES.contains(&root.as_str()))
        .filter(|root| !is_local_import(root, skill_dir))
        .collect();
    (filtered, warnings)
}

/// Parse one source line for `import a, b.c` / `from x.y import z` roots.
fn import_roots_in_line(line: &str) -> Vec<String> {
    let line = line.trim();
    if let Some(rest) = line.strip_prefix("import ") {
        return rest
            .split(',')
            .filter_map(|part| {
                let name = part.trim().split_whitespace().next()?;
                module_root(name)
            })
            .collect();
    }
    if let Some(rest) = line.strip_prefix("from ") {
        // Relative imports are intra-bundle by definition.
        if rest.starts_with('.') {
            return Vec::new();
        }
        if let Some(name) = rest.split_whitespace().next()
            && let Some(root) = module_root(name)
        {
            return vec![root];
        }
    }
    Vec::new()
}

fn module_root(dotted: &str) -> Option<String> {
    let root = dotted.split('.').next()?.trim();
    let valid = !root.is_empty()
        && root
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !root.starts_with(|c: char| c.is_ascii_digit());
    valid.then(|| root.to_string())
}

/// A module the bundle ships itself is not an external dependency.
fn is_local_import(root: &str, skill_dir: &Path) -> bool {
    let as_package = skill_dir.join(root);
    if as_package.is_dir() && as_package.join("__init__.py").is_file() {
        return true;
    }
    skill_dir.join(format!("{root}.py")).is_file()
}

fn map_import_to_package(import_root: &str) -> String {
    IMPORT_TO_PACKAGE
        .iter()
        .find(|(root, _)| *root == import_root)
        .map(|(_, pkg)| (*pkg).to_string())
        .unwrap_or_else(|| import_root.to_string())
}
