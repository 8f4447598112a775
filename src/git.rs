use std::path::{Path, PathBuf};

use crate::error::{ErrorKind, PackageError, Phase};
use crate::package::Package;
use crate::subprocess::{Probe, RunOptions, Runner};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepoKind {
    Bare,
    Normal,
}

fn path_str(p: &Path) -> Result<&str, String> {
    p.to_str()
        .ok_or_else(|| format!("path contains non-UTF8 characters: {}", p.display()))
}

fn probe_git_dir(
    runner: &Runner,
    package: &Package,
    phase: Phase,
    candidate: &Path,
) -> Option<(PathBuf, RepoKind)> {
    let git_dir = format!("--git-dir={}", candidate.to_str()?);
    let lines = runner
        .run(
            &package.name,
            phase.as_str(),
            "git",
            &[&git_dir, "rev-parse", "--is-bare-repository", "--absolute-git-dir"],
            &RunOptions::default(),
        )
        .ok()?;
    let mut lines = lines.iter().map(|l| l.trim());
    let kind = match lines.next()? {
        "true" => RepoKind::Bare,
        _ => RepoKind::Normal,
    };
    let dir = lines
        .next()
        .map(PathBuf::from)
        .unwrap_or_else(|| candidate.to_path_buf());
    Some((dir, kind))
}

/// Finds the git directory for `path`, trying `path/.git` first and then
/// `path` itself (bare repository). The probes run through `runner`, so they
/// see the same environment and land in the same log as every other git call
/// for `package`.
pub fn resolve_git_dir(
    runner: &Runner,
    package: &Package,
    phase: Phase,
    path: &Path,
) -> Option<(PathBuf, RepoKind)> {
    let dot_git = path.join(".git");
    if dot_git.exists()
        && let Some(found) = probe_git_dir(runner, package, phase, &dot_git)
    {
        return Some(found);
    }
    probe_git_dir(runner, package, phase, path)
}

/// Git commands bound to one package's working copy.
pub struct Git<'a> {
    runner: &'a Runner,
    package: &'a Package,
    phase: Phase,
    git_dir: PathBuf,
    kind: RepoKind,
}

impl<'a> Git<'a> {
    /// Opens the working copy in `package.importdir`. Fails with a
    /// configuration error if it is not a repository, or if it is bare and a
    /// work tree is required.
    pub fn open(
        runner: &'a Runner,
        package: &'a Package,
        phase: Phase,
        require_work_tree: bool,
    ) -> Result<Self, PackageError> {
        let dir = &package.importdir;
        let Some((git_dir, kind)) = resolve_git_dir(runner, package, phase, dir) else {
            return Err(package.error(
                phase,
                ErrorKind::Config(format!(
                    "{} is neither a git repository nor a bare git repository; \
                     delete it and import again",
                    dir.display()
                )),
            ));
        };
        if require_work_tree && kind == RepoKind::Bare {
            return Err(package.error(
                phase,
                ErrorKind::Config(format!(
                    "{} is a bare git repository but a checked-out tree is required",
                    dir.display()
                )),
            ));
        }
        Ok(Git {
            runner,
            package,
            phase,
            git_dir,
            kind,
        })
    }

    pub fn git_dir(&self) -> &Path {
        &self.git_dir
    }

    pub fn kind(&self) -> RepoKind {
        self.kind
    }

    pub fn package(&self) -> &Package {
        self.package
    }

    pub fn error(&self, kind: impl Into<ErrorKind>) -> PackageError {
        self.package.error(self.phase, kind)
    }

    fn invoke(&self, args: &[&str], bare: bool, retry: bool) -> Result<Vec<String>, PackageError> {
        let full = self.full_args(args, bare)?;
        let full: Vec<&str> = full.iter().map(|s| s.as_str()).collect();
        self.runner
            .run(
                &self.package.name,
                self.phase.as_str(),
                "git",
                &full,
                &RunOptions {
                    working_dir: Some(&self.package.importdir),
                    retry,
                },
            )
            .map_err(|e| self.error(e))
    }

    fn full_args(&self, args: &[&str], bare: bool) -> Result<Vec<String>, PackageError> {
        let mut full = Vec::with_capacity(args.len() + 1);
        if bare {
            let dir = path_str(&self.git_dir).map_err(|e| self.error(ErrorKind::Config(e)))?;
            full.push(format!("--git-dir={}", dir));
        }
        full.extend(args.iter().map(|s| s.to_string()));
        Ok(full)
    }

    /// Runs a command that needs the work tree.
    pub fn run(&self, args: &[&str]) -> Result<Vec<String>, PackageError> {
        self.invoke(args, false, false)
    }

    /// Runs a command against the git directory only.
    pub fn run_bare(&self, args: &[&str]) -> Result<Vec<String>, PackageError> {
        self.invoke(args, true, false)
    }

    /// Runs a network command against the git directory, retrying on failure.
    pub fn run_bare_with_retry(&self, args: &[&str]) -> Result<Vec<String>, PackageError> {
        self.invoke(args, true, true)
    }

    pub fn probe(&self, args: &[&str]) -> Result<Probe, PackageError> {
        let full = self.full_args(args, true)?;
        let full: Vec<&str> = full.iter().map(|s| s.as_str()).collect();
        self.runner
            .probe(
                &self.package.name,
                self.phase.as_str(),
                "git",
                &full,
                &RunOptions {
                    working_dir: Some(&self.package.importdir),
                    retry: false,
                },
            )
            .map_err(|e| self.error(e))
    }

    /// Resolves `rev` to a full commit id, peeling tags. `None` if unknown.
    pub fn rev_parse(&self, rev: &str) -> Result<Option<String>, PackageError> {
        let spec = format!("{}^{{commit}}", rev);
        match self.probe(&["rev-parse", "-q", "--verify", &spec])? {
            Probe::Success(lines) => Ok(lines.into_iter().next().map(|l| l.trim().to_string())),
            Probe::NotFound => Ok(None),
        }
    }

    pub fn has_local_branch(&self, branch: &str) -> Result<bool, PackageError> {
        let ref_name = format!("refs/heads/{}", branch);
        match self.probe(&["show-ref", "--verify", "--quiet", &ref_name])? {
            Probe::Success(_) => Ok(true),
            Probe::NotFound => Ok(false),
        }
    }

    /// Name of the checked-out branch, `None` when HEAD is detached.
    pub fn current_branch(&self) -> Result<Option<String>, PackageError> {
        match self.probe(&["symbolic-ref", "-q", "HEAD"])? {
            Probe::Success(lines) => Ok(lines.into_iter().next().map(|r| {
                r.trim()
                    .strip_prefix("refs/heads/")
                    .map(String::from)
                    .unwrap_or(r)
            })),
            Probe::NotFound => Ok(None),
        }
    }

    /// Sets `key` to exactly `value`, replacing every existing value.
    pub fn config_replace_all(&self, key: &str, value: &str) -> Result<(), PackageError> {
        self.run_bare(&["config", "--replace-all", key, value])?;
        Ok(())
    }

    pub fn changed_file_count(&self) -> Result<u32, PackageError> {
        let out = self.run(&["status", "--porcelain"])?;
        Ok(out.iter().filter(|l| !l.trim().is_empty()).count() as u32)
    }

    /// One-line summaries of the first-parent commits in `from..to`.
    pub fn commit_list(&self, from: &str, to: &str) -> Result<Vec<String>, PackageError> {
        let range = format!("{}..{}", from, to);
        self.run_bare(&["rev-list", "--first-parent", "--oneline", &range])
    }
}
