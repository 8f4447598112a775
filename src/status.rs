use std::fmt;
use std::sync::OnceLock;

use serde::Serialize;

use crate::error::{ErrorKind, PackageError};
use crate::git::Git;

/// Relationship between a reference commit (usually HEAD) and a fetched
/// commit, derived from their merge-base.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStatus {
    UpToDate,
    /// The reference can be fast-forwarded to the fetched commit.
    SimpleUpdate,
    /// The reference has commits the fetched commit lacks.
    Advanced,
    /// Histories diverged.
    NeedsMerge,
}

impl MergeStatus {
    pub fn classify(common: &str, reference: &str, fetch: &str) -> Self {
        match (common == reference, common == fetch) {
            (true, true) => MergeStatus::UpToDate,
            (true, false) => MergeStatus::SimpleUpdate,
            (false, true) => MergeStatus::Advanced,
            (false, false) => MergeStatus::NeedsMerge,
        }
    }

    pub fn needs_update(self) -> bool {
        matches!(self, MergeStatus::SimpleUpdate | MergeStatus::NeedsMerge)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MergeStatus::UpToDate => "up-to-date",
            MergeStatus::SimpleUpdate => "behind",
            MergeStatus::Advanced => "ahead",
            MergeStatus::NeedsMerge => "diverged",
        }
    }
}

impl fmt::Display for MergeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
pub struct Status {
    pub status: MergeStatus,
    pub fetch_commit: String,
    pub head_commit: String,
    pub common_commit: String,
    local_commits: OnceLock<Vec<String>>,
    remote_commits: OnceLock<Vec<String>>,
}

impl Status {
    pub fn new(fetch_commit: String, head_commit: String, common_commit: String) -> Self {
        Status {
            status: MergeStatus::classify(&common_commit, &head_commit, &fetch_commit),
            fetch_commit,
            head_commit,
            common_commit,
            local_commits: OnceLock::new(),
            remote_commits: OnceLock::new(),
        }
    }

    /// Commits only the reference side has, newest first.
    pub fn local_commits(&self, git: &Git<'_>) -> Result<&[String], PackageError> {
        memoized(&self.local_commits, || {
            git.commit_list(&self.common_commit, &self.head_commit)
        })
    }

    /// Commits only the fetched side has, newest first.
    pub fn remote_commits(&self, git: &Git<'_>) -> Result<&[String], PackageError> {
        memoized(&self.remote_commits, || {
            git.commit_list(&self.common_commit, &self.fetch_commit)
        })
    }
}

fn memoized<'a>(
    cell: &'a OnceLock<Vec<String>>,
    compute: impl FnOnce() -> Result<Vec<String>, PackageError>,
) -> Result<&'a [String], PackageError> {
    if let Some(v) = cell.get() {
        return Ok(v);
    }
    let v = compute()?;
    Ok(cell.get_or_init(|| v))
}

/// Computes how `reference` relates to `fetch`.
pub fn merge_status(git: &Git<'_>, reference: &str, fetch: &str) -> Result<Status, PackageError> {
    let common = git
        .run_bare(&["merge-base", reference, fetch])
        .ok()
        .and_then(|lines| lines.into_iter().next())
        .map(|l| l.trim().to_string())
        .filter(|l| !l.is_empty())
        .ok_or_else(|| {
            git.error(ErrorKind::Failed(format!(
                "failed to find the merge-base between {} and {}. \
                 Are you sure these commits exist?",
                reference, fetch
            )))
        })?;
    let head_commit = resolve(git, reference)?;
    let fetch_commit = resolve(git, fetch)?;
    Ok(Status::new(fetch_commit, head_commit, common))
}

fn resolve(git: &Git<'_>, rev: &str) -> Result<String, PackageError> {
    git.rev_parse(rev)?
        .ok_or_else(|| git.error(ErrorKind::Failed(format!("cannot resolve {}", rev))))
}
