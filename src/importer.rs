//! Keeps a package's working copy in sync with its upstream git repository.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::alternates;
use crate::error::{ErrorKind, PackageError, Phase};
use crate::git::{Git, RepoKind};
use crate::package::Package;
use crate::patch::{self, PatchOutcome, PatchSpec};
use crate::status::{MergeStatus, merge_status};
use crate::subprocess::{RunOptions, Runner};

pub const DEFAULT_REMOTE: &str = "autobuild";
pub const DEFAULT_BRANCH: &str = "master";

/// What a working copy follows upstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tracking {
    Branch(String),
    Tag(String),
    Commit(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct RepositoryRef {
    pub url: String,
    pub remote_name: String,
    pub push_url: Option<String>,
    pub tracking: Tracking,
    local_branch: Option<String>,
}

impl RepositoryRef {
    pub fn new(url: impl Into<String>) -> Self {
        RepositoryRef {
            url: url.into(),
            remote_name: DEFAULT_REMOTE.to_string(),
            push_url: None,
            tracking: Tracking::Branch(DEFAULT_BRANCH.to_string()),
            local_branch: None,
        }
    }

    pub fn with_remote_name(mut self, name: impl Into<String>) -> Self {
        self.remote_name = name.into();
        self
    }

    pub fn with_push_url(mut self, url: impl Into<String>) -> Self {
        self.push_url = Some(url.into());
        self
    }

    pub fn with_tracking(mut self, tracking: Tracking) -> Self {
        self.tracking = tracking;
        self
    }

    pub fn with_local_branch(mut self, branch: impl Into<String>) -> Self {
        self.local_branch = Some(branch.into());
        self
    }

    /// The configured local branch, defaulting to the tracked branch.
    pub fn local_branch(&self) -> Option<&str> {
        self.local_branch.as_deref().or(match &self.tracking {
            Tracking::Branch(b) => Some(b.as_str()),
            _ => None,
        })
    }

    pub fn remote_branch(&self) -> Option<&str> {
        match &self.tracking {
            Tracking::Branch(b) => Some(b),
            _ => None,
        }
    }

    pub fn push_url(&self) -> &str {
        self.push_url.as_deref().unwrap_or(&self.url)
    }

    /// The ref holding the last fetched state of what is tracked.
    pub fn cached_remote_ref(&self) -> String {
        match &self.tracking {
            Tracking::Branch(b) => format!("refs/remotes/{}/{}", self.remote_name, b),
            Tracking::Tag(t) => format!("refs/tags/{}", t),
            Tracking::Commit(c) => c.clone(),
        }
    }

    fn fetch_refspec(&self) -> Option<String> {
        match &self.tracking {
            Tracking::Branch(b) => Some(format!("refs/heads/{}", b)),
            Tracking::Tag(t) => Some(format!("refs/tags/{}", t)),
            Tracking::Commit(_) => None,
        }
    }
}

/// What `import` or `update` did to the working copy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum SyncAction {
    Cloned,
    /// The local branch did not exist and was created at the remote commit.
    Created,
    UpToDate,
    Ahead,
    FastForward { commits: usize },
    Merged,
    Pinned { detached: bool },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImportResult {
    #[serde(flatten)]
    pub action: SyncAction,
    pub patches: PatchOutcome,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub package: String,
    pub dir: PathBuf,
    pub branch: Option<String>,
    pub status: MergeStatus,
    pub head_commit: String,
    pub fetch_commit: String,
    pub common_commit: String,
    pub local_commits: Vec<String>,
    pub remote_commits: Vec<String>,
    pub uncommitted: u32,
}

/// Called when fetching fails; may return a commit to use instead.
pub type Fallback = Arc<dyn Fn(&Package, &PackageError) -> Option<String> + Send + Sync>;

#[derive(Clone)]
pub struct GitImporter {
    repository: RepositoryRef,
    alternates: Vec<String>,
    merge: bool,
    with_submodules: bool,
    patches: Vec<PatchSpec>,
    fallback: Option<Fallback>,
}

impl GitImporter {
    pub fn new(repository: RepositoryRef) -> Self {
        GitImporter {
            repository,
            alternates: Vec::new(),
            merge: false,
            with_submodules: false,
            patches: Vec::new(),
            fallback: None,
        }
    }

    /// Alternates templates; `%s` is replaced by the package name.
    pub fn with_alternates(mut self, templates: Vec<String>) -> Self {
        self.alternates = templates;
        self
    }

    pub fn with_merge(mut self, merge: bool) -> Self {
        self.merge = merge;
        self
    }

    pub fn with_submodules(mut self, flag: bool) -> Self {
        self.with_submodules = flag;
        self
    }

    pub fn with_patches(mut self, patches: Vec<PatchSpec>) -> Self {
        self.patches = patches;
        self
    }

    pub fn with_fallback(
        mut self,
        f: impl Fn(&Package, &PackageError) -> Option<String> + Send + Sync + 'static,
    ) -> Self {
        self.fallback = Some(Arc::new(f));
        self
    }

    /// Falls back to the last fetched state when fetching fails.
    pub fn with_cached_fallback(self, runner: &Runner) -> Self {
        let runner = runner.clone();
        let cached = self.repository.cached_remote_ref();
        self.with_fallback(move |pkg, err| {
            warn!(package = %pkg.name, "fetch failed, using {}: {}", cached, err);
            Git::open(&runner, pkg, Phase::Import, false)
                .ok()?
                .rev_parse(&cached)
                .ok()?
        })
    }

    pub fn repository(&self) -> &RepositoryRef {
        &self.repository
    }

    pub fn merge(&self) -> bool {
        self.merge
    }

    fn alternate_repositories(&self, package: &Package) -> Vec<PathBuf> {
        alternates::expand(&self.alternates, &package.name)
            .into_iter()
            .filter(|p| p != &package.importdir)
            .collect()
    }

    /// Checks out or updates the package, then applies its patches.
    pub fn import(
        &self,
        runner: &Runner,
        package: &Package,
        only_local: bool,
    ) -> Result<ImportResult, PackageError> {
        let action = if package.importdir.exists() {
            self.update(runner, package, only_local)?
        } else {
            match self.checkout(runner, package) {
                Ok(action) => action,
                Err(e) => {
                    if package.importdir.exists()
                        && let Err(rm) = fs::remove_dir_all(&package.importdir)
                    {
                        warn!(
                            package = %package.name,
                            "cannot remove {} after failed checkout: {}",
                            package.importdir.display(),
                            rm
                        );
                    }
                    return Err(e);
                }
            }
        };
        let patches = patch::apply(runner, package, &self.patches)?;
        Ok(ImportResult { action, patches })
    }

    /// Clones into `package.importdir`, which must not exist yet.
    pub fn checkout(&self, runner: &Runner, package: &Package) -> Result<SyncAction, PackageError> {
        let dest = &package.importdir;
        let io_err = |e: std::io::Error| package.error(Phase::Import, e);
        let parent = match dest.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent).map_err(io_err)?;

        let dest_str = dest.to_str().ok_or_else(|| {
            package.error(
                Phase::Import,
                ErrorKind::Config(format!("non-UTF8 import directory {}", dest.display())),
            )
        })?;
        let references: Vec<String> = self
            .alternate_repositories(package)
            .iter()
            .map(|p| p.display().to_string())
            .collect();
        let mut args = vec!["clone", "-o", self.repository.remote_name.as_str()];
        if self.with_submodules {
            args.push("--recurse-submodules");
        }
        for r in &references {
            args.push("--reference");
            args.push(r);
        }
        args.push(&self.repository.url);
        args.push(dest_str);

        runner
            .run(
                &package.name,
                Phase::Import.as_str(),
                "git",
                &args,
                &RunOptions {
                    working_dir: Some(&parent),
                    retry: true,
                },
            )
            .map_err(|e| package.error_in(&parent, Phase::Import, e))?;
        info!(package = %package.name, url = %self.repository.url, "cloned");

        let git = Git::open(runner, package, Phase::Import, true)?;
        self.update_remote_configuration(&git)?;

        let on_target = match (self.repository.remote_branch(), self.repository.local_branch()) {
            (Some(_), Some(local)) => git.current_branch()?.as_deref() == Some(local),
            _ => false,
        };
        if on_target {
            let remote_ref = self.repository.cached_remote_ref();
            git.run(&["reset", "--hard", &remote_ref])?;
            if self.with_submodules {
                self.update_submodules(&git)?;
            }
        } else {
            self.update_with(&git, true)?;
        }
        Ok(SyncAction::Cloned)
    }

    /// Points the remote and branch configuration at the repository. Safe
    /// to call repeatedly.
    pub fn update_remote_configuration(&self, git: &Git<'_>) -> Result<(), PackageError> {
        let repo = &self.repository;
        let remote = &repo.remote_name;
        git.config_replace_all(&format!("remote.{}.url", remote), &repo.url)?;
        git.config_replace_all(&format!("remote.{}.pushurl", remote), repo.push_url())?;
        git.config_replace_all(
            &format!("remote.{}.fetch", remote),
            &format!("+refs/heads/*:refs/remotes/{}/*", remote),
        )?;
        let push = match (repo.local_branch(), repo.remote_branch()) {
            (Some(local), Some(remote_branch)) => {
                format!("refs/heads/{}:refs/heads/{}", local, remote_branch)
            }
            _ => "refs/heads/*:refs/heads/*".to_string(),
        };
        git.config_replace_all(&format!("remote.{}.push", remote), &push)?;

        if let Some(local) = repo.local_branch() {
            git.config_replace_all(&format!("branch.{}.remote", local), remote)?;
            if let Some(remote_branch) = repo.remote_branch() {
                git.config_replace_all(
                    &format!("branch.{}.merge", local),
                    &format!("refs/heads/{}", remote_branch),
                )?;
            }
        }
        Ok(())
    }

    /// Fetches from the repository URL and returns the fetched commit, or
    /// `None` if FETCH_HEAD has no usable entry.
    pub fn fetch_remote(&self, git: &Git<'_>) -> Result<Option<String>, PackageError> {
        let repo = &self.repository;
        let mut args = vec!["fetch", "--tags", repo.url.as_str()];
        let refspec = repo.fetch_refspec();
        if let Some(r) = &refspec {
            args.push(r);
        }
        git.run_bare_with_retry(&args)?;
        self.update_remote_configuration(git)?;

        let fetch_head = git.git_dir().join("FETCH_HEAD");
        let data = fs::read_to_string(&fetch_head).map_err(|e| git.error(e))?;
        let Some(commit) = parse_fetch_head(&data) else {
            return Ok(None);
        };
        if let Some(branch) = repo.remote_branch() {
            let tracking_ref = format!("refs/remotes/{}/{}", repo.remote_name, branch);
            git.run_bare(&["update-ref", "-m", "updated by autobuild", &tracking_ref, &commit])?;
        }
        Ok(Some(commit))
    }

    /// The commit the working copy should be at: the cached ref when
    /// `only_local`, else a fresh fetch (or the fallback if that fails).
    pub fn current_remote_commit(&self, git: &Git<'_>, only_local: bool) -> Result<String, PackageError> {
        if only_local {
            let cached = self.repository.cached_remote_ref();
            return git.rev_parse(&cached)?.ok_or_else(|| {
                git.error(ErrorKind::Failed(format!(
                    "cannot resolve remote HEAD {}; run an import without only-local first",
                    cached
                )))
            });
        }
        let fetched = self.fetch_remote(git).and_then(|c| {
            c.ok_or_else(|| {
                git.error(ErrorKind::Failed(format!(
                    "fetching {} did not return any commit",
                    self.repository.url
                )))
            })
        });
        match fetched {
            Ok(c) => Ok(c),
            Err(e) => match self.fallback.as_ref().and_then(|f| f(git.package(), &e)) {
                Some(c) => Ok(c),
                None => Err(e),
            },
        }
    }

    /// Moves the working copy to `target`, a fixed commit or tag. Refuses if
    /// that would throw away history.
    pub fn commit_pinning(&self, git: &Git<'_>, target: &str) -> Result<SyncAction, PackageError> {
        let st = merge_status(git, target, "HEAD")?;
        if st.status == MergeStatus::NeedsMerge {
            return Err(git.error(ErrorKind::Refused(format!(
                "the current HEAD {} and the pinned commit {} have diverged; \
                 refusing to move the working copy, resolve this manually",
                short(&st.fetch_commit),
                target
            ))));
        }
        let target_commit = st.head_commit;

        let Some(local) = self.repository.local_branch() else {
            if st.fetch_commit == target_commit && git.current_branch()?.is_none() {
                return Ok(SyncAction::UpToDate);
            }
            git.run(&["checkout", "--detach", &target_commit])?;
            return Ok(SyncAction::Pinned { detached: true });
        };

        if !git.has_local_branch(local)? {
            git.run(&["checkout", "-b", local, &target_commit])?;
            return Ok(SyncAction::Pinned { detached: false });
        }
        if git.rev_parse(local)?.as_deref() == Some(target_commit.as_str()) {
            if git.current_branch()?.as_deref() == Some(local) {
                return Ok(SyncAction::UpToDate);
            }
            git.run(&["checkout", local])?;
            return Ok(SyncAction::Pinned { detached: false });
        }
        git.run(&["checkout", "--detach", &target_commit])?;
        warn!(
            package = %git.package().name,
            "local branch {} does not point to {}; the working copy is now detached",
            local,
            target
        );
        Ok(SyncAction::Pinned { detached: true })
    }

    /// Brings an existing working copy up to date.
    pub fn update(
        &self,
        runner: &Runner,
        package: &Package,
        only_local: bool,
    ) -> Result<SyncAction, PackageError> {
        let git = Git::open(runner, package, Phase::Import, true)?;
        self.update_with(&git, only_local)
    }

    fn update_with(&self, git: &Git<'_>, only_local: bool) -> Result<SyncAction, PackageError> {
        let package = git.package();
        if package.imports_into_srcdir() {
            alternates::update(git.git_dir(), &self.alternate_repositories(package))
                .map_err(|e| git.error(e))?;
        }
        self.update_remote_configuration(git)?;

        let fetch_commit = self.current_remote_commit(git, only_local)?;
        let action = match &self.repository.tracking {
            Tracking::Commit(c) => self.commit_pinning(git, c)?,
            Tracking::Tag(_) => self.commit_pinning(git, &fetch_commit)?,
            Tracking::Branch(_) => self.update_branch(git, &fetch_commit)?,
        };
        if self.with_submodules {
            self.update_submodules(git)?;
        }
        info!(package = %package.name, action = ?action, "updated");
        Ok(action)
    }

    fn update_branch(&self, git: &Git<'_>, fetch_commit: &str) -> Result<SyncAction, PackageError> {
        let repo = &self.repository;
        let local = repo.local_branch().unwrap_or(DEFAULT_BRANCH);
        if !git.has_local_branch(local)? {
            git.run(&["checkout", "-b", local, fetch_commit])?;
            return Ok(SyncAction::Created);
        }
        if git.current_branch()?.as_deref() != Some(local) {
            git.run(&["checkout", local])?;
        }

        let st = merge_status(git, "HEAD", fetch_commit)?;
        match st.status {
            MergeStatus::UpToDate => Ok(SyncAction::UpToDate),
            MergeStatus::Advanced => Ok(SyncAction::Ahead),
            MergeStatus::SimpleUpdate => {
                let commits = st.remote_commits(git)?.len();
                git.run(&["merge", "--ff-only", fetch_commit])?;
                Ok(SyncAction::FastForward { commits })
            }
            MergeStatus::NeedsMerge if self.merge => {
                git.run(&["merge", "--no-edit", fetch_commit])?;
                Ok(SyncAction::Merged)
            }
            MergeStatus::NeedsMerge => Err(git.error(ErrorKind::Refused(format!(
                "the local branch {} and the remote branch {}/{} have diverged, \
                 and I therefore refuse to update automatically. Go into {} and \
                 either merge or rebase manually, or enable merge mode",
                local,
                repo.remote_name,
                repo.remote_branch().unwrap_or(local),
                git.package().importdir.display()
            )))),
        }
    }

    fn update_submodules(&self, git: &Git<'_>) -> Result<(), PackageError> {
        git.run(&["submodule", "update", "--init", "--recursive"])?;
        Ok(())
    }

    /// Compares the working copy with the remote without changing it.
    pub fn status(
        &self,
        runner: &Runner,
        package: &Package,
        only_local: bool,
    ) -> Result<StatusReport, PackageError> {
        let git = Git::open(runner, package, Phase::Status, false)?;
        let fetch_commit = self.current_remote_commit(&git, only_local)?;
        let st = merge_status(&git, "HEAD", &fetch_commit)?;
        let local_commits = st.local_commits(&git)?.to_vec();
        let remote_commits = st.remote_commits(&git)?.to_vec();
        let uncommitted = match git.kind() {
            RepoKind::Normal => git.changed_file_count()?,
            RepoKind::Bare => 0,
        };
        Ok(StatusReport {
            package: package.name.clone(),
            dir: package.importdir.clone(),
            branch: git.current_branch()?,
            status: st.status,
            head_commit: st.head_commit,
            fetch_commit: st.fetch_commit,
            common_commit: st.common_commit,
            local_commits,
            remote_commits,
            uncommitted,
        })
    }
}

/// First commit in FETCH_HEAD not marked `not-for-merge`.
fn parse_fetch_head(data: &str) -> Option<String> {
    data.lines()
        .filter(|l| !l.contains("\tnot-for-merge\t"))
        .find_map(|l| l.split_whitespace().next())
        .map(String::from)
}

fn short(commit: &str) -> &str {
    commit.get(..10).unwrap_or(commit)
}
