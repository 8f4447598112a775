//! Object sharing between working copies through git alternates.
//!
//! A template is a directory path where `%s` stands for the package name,
//! e.g. `/var/cache/autobuild/git/%s`.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::package::write_atomic;

pub const GIT_CACHE_DIR_VAR: &str = "AUTOBUILD_GIT_CACHE_DIR";
pub const CACHE_DIR_VAR: &str = "AUTOBUILD_CACHE_DIR";

/// Templates derived from the process environment.
pub fn templates_from_env() -> Vec<String> {
    templates_from_env_with(|name| std::env::var(name).ok())
}

/// `AUTOBUILD_GIT_CACHE_DIR` roots map to `<root>/%s`; otherwise
/// `AUTOBUILD_CACHE_DIR` roots map to `<root>/git/%s`.
pub fn templates_from_env_with(get: impl Fn(&str) -> Option<String>) -> Vec<String> {
    let split = |v: String| -> Vec<String> {
        v.split(':')
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect()
    };
    if let Some(roots) = get(GIT_CACHE_DIR_VAR) {
        return split(roots)
            .into_iter()
            .map(|root| format!("{}/%s", root.trim_end_matches('/')))
            .collect();
    }
    match get(CACHE_DIR_VAR) {
        Some(roots) => split(roots)
            .into_iter()
            .map(|root| format!("{}/git/%s", root.trim_end_matches('/')))
            .collect(),
        None => Vec::new(),
    }
}

/// Expands templates for `package`, keeping directories that exist.
pub fn expand(templates: &[String], package: &str) -> Vec<PathBuf> {
    let mut out: Vec<PathBuf> = Vec::new();
    for t in templates {
        let path = PathBuf::from(t.replace("%s", package));
        if path.is_dir() && !out.contains(&path) {
            out.push(path);
        }
    }
    out
}

/// The object store of a repository at `path`, bare or not.
pub fn objects_dir(path: &Path) -> PathBuf {
    let normal = path.join(".git").join("objects");
    if normal.is_dir() {
        normal
    } else {
        path.join("objects")
    }
}

pub fn alternates_file(git_dir: &Path) -> PathBuf {
    git_dir.join("objects").join("info").join("alternates")
}

/// Object directories currently recorded for the repository.
pub fn read(git_dir: &Path) -> io::Result<Vec<PathBuf>> {
    match fs::read_to_string(alternates_file(git_dir)) {
        Ok(data) => Ok(data
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(PathBuf::from)
            .collect()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e),
    }
}

/// Rewrites the alternates file of `git_dir` to point at the object stores
/// of `repositories`. Removes the file when the list is empty.
pub fn update(git_dir: &Path, repositories: &[PathBuf]) -> io::Result<()> {
    let desired: Vec<PathBuf> = repositories
        .iter()
        .map(|r| objects_dir(r))
        .filter(|o| o.is_dir())
        .collect();
    let current = read(git_dir)?;
    if !current.is_empty() && current != desired {
        warn!(
            git_dir = %git_dir.display(),
            "alternates changed from {:?} to {:?}; \
             objects only available from the old alternates will be lost",
            current,
            desired
        );
    }

    let file = alternates_file(git_dir);
    if desired.is_empty() {
        match fs::remove_file(&file) {
            Ok(()) => debug!(file = %file.display(), "removed alternates"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        return Ok(());
    }
    let lines: Vec<String> = desired.iter().map(|p| p.display().to_string()).collect();
    write_atomic(&file, lines.join("\n").as_bytes())
}
