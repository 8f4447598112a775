//! Shared test utilities for git-based integration tests.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::environment::Environment;
use crate::shell::ShellFormat;
use crate::subprocess::{Runner, RunnerSettings, TailLines};

const IDENTITY: &[(&str, &str)] = &[
    ("GIT_AUTHOR_NAME", "Test"),
    ("GIT_AUTHOR_EMAIL", "test@test.com"),
    ("GIT_COMMITTER_NAME", "Test"),
    ("GIT_COMMITTER_EMAIL", "test@test.com"),
];

/// Runs git in `dir`, panicking on failure. Returns trimmed stdout.
pub fn git(dir: &Path, args: &[&str]) -> String {
    let out = Command::new("git")
        .args(args)
        .current_dir(dir)
        .envs(IDENTITY.iter().copied())
        .env("GIT_CONFIG_NOSYSTEM", "1")
        .output()
        .unwrap();
    assert!(
        out.status.success(),
        "git {:?}: {}",
        args,
        String::from_utf8_lossy(&out.stderr)
    );
    String::from_utf8_lossy(&out.stdout).trim().to_string()
}

/// Creates a source repo with a single commit on main.
/// Returns (source_dir, source_tempdir).
pub fn create_source_repo() -> (PathBuf, tempfile::TempDir) {
    let source_tmp = tempfile::tempdir().unwrap();
    let source = source_tmp.path().join("source");
    std::fs::create_dir(&source).unwrap();
    git(&source, &["init", "--initial-branch=main"]);
    git(&source, &["config", "commit.gpgsign", "false"]);
    local_commit(&source, "README", "initial\n");
    (source, source_tmp)
}

/// Commits a file in a repo on the current branch.
pub fn local_commit(dir: &Path, file: &str, content: &str) {
    let path = dir.join(file);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(&path, content).unwrap();
    git(dir, &["add", file]);
    git(dir, &["commit", "-m", &format!("add {}", file)]);
}

pub fn head(dir: &Path) -> String {
    git(dir, &["rev-parse", "HEAD"])
}

/// A runner logging into a fresh temp dir, with a git identity in its
/// environment so merges can create commits.
pub fn runner() -> (Runner, tempfile::TempDir) {
    let logs = tempfile::tempdir().unwrap();
    let mut env = Environment::with_ambient(ShellFormat::Posix, BTreeMap::new());
    for (name, value) in IDENTITY {
        env.set(name, &[*value]);
    }
    let runner = Runner::new(
        RunnerSettings {
            log_dir: logs.path().to_path_buf(),
            retry_count: 0,
            tail: TailLines::default(),
        },
        env.into_shared(),
    );
    (runner, logs)
}
