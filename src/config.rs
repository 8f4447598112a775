use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::importer::{DEFAULT_REMOTE, GitImporter, RepositoryRef, Tracking};
use crate::package::Package;
use crate::patch::PatchSpec;
use crate::subprocess::{RunnerSettings, TailLines};

pub const MANIFEST_FILE: &str = "autobuild.yaml";

fn default_retry_count() -> u32 {
    3
}

fn default_tail_lines() -> usize {
    10
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PackageEntry {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub push_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub srcdir: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub importdir: Option<PathBuf>,
    #[serde(default)]
    pub with_submodules: bool,
    /// Overrides the manifest-wide setting.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merge: Option<bool>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub patches: Vec<PatchSpec>,
}

impl PackageEntry {
    /// Defaults to the master branch when nothing is given.
    pub fn tracking(&self, name: &str) -> Result<Tracking> {
        match (&self.branch, &self.tag, &self.commit) {
            (None, None, None) => Ok(Tracking::Branch(crate::importer::DEFAULT_BRANCH.into())),
            (Some(b), None, None) => Ok(Tracking::Branch(b.clone())),
            (None, Some(t), None) => Ok(Tracking::Tag(t.clone())),
            (None, None, Some(c)) => Ok(Tracking::Commit(c.clone())),
            _ => bail!(
                "package {}: at most one of branch, tag and commit can be set",
                name
            ),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_dir: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_dir: Option<PathBuf>,
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,
    #[serde(default = "default_tail_lines")]
    pub tail_lines: usize,
    #[serde(default)]
    pub merge: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub alternates: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub prefixes: Vec<PathBuf>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub source_before: Vec<PathBuf>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub source_after: Vec<PathBuf>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub packages: BTreeMap<String, PackageEntry>,
}

impl Default for Manifest {
    fn default() -> Self {
        Manifest {
            source_dir: None,
            log_dir: None,
            retry_count: default_retry_count(),
            tail_lines: default_tail_lines(),
            merge: false,
            alternates: Vec::new(),
            prefixes: Vec::new(),
            source_before: Vec::new(),
            source_after: Vec::new(),
            packages: BTreeMap::new(),
        }
    }
}

impl Manifest {
    pub fn load_from(path: &Path) -> Result<Manifest> {
        if !path.exists() {
            return Ok(Manifest::default());
        }

        let data = fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let m: Manifest = serde_yaml_ng::from_str(&data)
            .with_context(|| format!("parsing {}", path.display()))?;
        Ok(m)
    }
}

/// A manifest together with the directory its relative paths are based on.
#[derive(Debug, Clone)]
pub struct Project {
    pub root: PathBuf,
    pub manifest: Manifest,
}

/// A package ready to be imported.
#[derive(Clone)]
pub struct PackageSetup {
    pub package: Package,
    pub importer: GitImporter,
}

impl Project {
    pub fn load(manifest_path: &Path) -> Result<Project> {
        let manifest = Manifest::load_from(manifest_path)?;
        let root = match manifest_path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        Ok(Project { root, manifest })
    }

    pub fn resolve(&self, p: &Path) -> PathBuf {
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.root.join(p)
        }
    }

    pub fn source_dir(&self) -> PathBuf {
        match &self.manifest.source_dir {
            Some(d) => self.resolve(d),
            None => self.root.clone(),
        }
    }

    pub fn log_dir(&self, paths: &Paths) -> PathBuf {
        match &self.manifest.log_dir {
            Some(d) => self.resolve(d),
            None => paths.log_dir.clone(),
        }
    }

    pub fn runner_settings(&self, paths: &Paths) -> RunnerSettings {
        RunnerSettings {
            log_dir: self.log_dir(paths),
            retry_count: self.manifest.retry_count,
            tail: TailLines::from_count(self.manifest.tail_lines),
        }
    }

    /// Builds every package, checking that the manifest is consistent.
    /// `env_alternates` are templates derived from the environment.
    pub fn packages(&self, env_alternates: &[String]) -> Result<Vec<PackageSetup>> {
        let source_dir = self.source_dir();
        let mut alternates = self.manifest.alternates.clone();
        alternates.extend(env_alternates.iter().cloned());

        let mut out: Vec<PackageSetup> = Vec::with_capacity(self.manifest.packages.len());
        let mut importdirs: BTreeMap<PathBuf, &str> = BTreeMap::new();
        for (name, entry) in &self.manifest.packages {
            if entry.url.trim().is_empty() {
                bail!("package {}: url is empty", name);
            }
            let tracking = entry.tracking(name)?;

            let srcdir = match &entry.srcdir {
                Some(d) => self.resolve(d),
                None => source_dir.join(name),
            };
            let mut package = Package::new(name.as_str(), srcdir);
            if let Some(d) = &entry.importdir {
                package = package.with_importdir(self.resolve(d));
            }
            if let Some(other) = importdirs.insert(package.importdir.clone(), name) {
                bail!(
                    "packages {} and {} share the import directory {}",
                    other,
                    name,
                    package.importdir.display()
                );
            }

            let mut repo = RepositoryRef::new(entry.url.as_str())
                .with_remote_name(entry.remote.as_deref().unwrap_or(DEFAULT_REMOTE))
                .with_tracking(tracking);
            if let Some(u) = &entry.push_url {
                repo = repo.with_push_url(u.as_str());
            }
            if let Some(b) = &entry.local_branch {
                repo = repo.with_local_branch(b.as_str());
            }
            let patches = entry
                .patches
                .iter()
                .map(|p| PatchSpec {
                    path: self.resolve(&p.path),
                    level: p.level,
                })
                .collect();

            let importer = GitImporter::new(repo)
                .with_alternates(alternates.clone())
                .with_merge(entry.merge.unwrap_or(self.manifest.merge))
                .with_submodules(entry.with_submodules)
                .with_patches(patches);
            out.push(PackageSetup { package, importer });
        }
        Ok(out)
    }

    /// Packages named in `selected`, or all of them when it is empty.
    pub fn select(&self, env_alternates: &[String], selected: &[String]) -> Result<Vec<PackageSetup>> {
        let all = self.packages(env_alternates)?;
        if selected.is_empty() {
            return Ok(all);
        }
        for name in selected {
            if !self.manifest.packages.contains_key(name) {
                bail!("package {} is not defined in the manifest", name);
            }
        }
        Ok(all
            .into_iter()
            .filter(|s| selected.contains(&s.package.name))
            .collect())
    }
}

pub struct Paths {
    pub data_dir: PathBuf,
    pub log_dir: PathBuf,
}

impl Paths {
    /// Resolve paths from environment (XDG_DATA_HOME / HOME). Called once at startup.
    pub fn resolve() -> Result<Paths> {
        let data = data_dir()?;
        Ok(Paths::from_data_dir(&data))
    }

    pub fn from_data_dir(data_dir: &Path) -> Paths {
        Paths {
            data_dir: data_dir.to_path_buf(),
            log_dir: data_dir.join("logs"),
        }
    }
}

/// Resolves the autobuild data directory. Accepts injectable overrides for testing.
pub fn data_dir_with(xdg_data_home: Option<&str>, home: Option<&Path>) -> Result<PathBuf> {
    if let Some(xdg) = xdg_data_home.filter(|s| !s.is_empty()) {
        return Ok(PathBuf::from(xdg).join("autobuild"));
    }
    let home = home.context("cannot determine home directory")?;
    Ok(home.join(".local").join("share").join("autobuild"))
}

fn data_dir() -> Result<PathBuf> {
    data_dir_with(
        std::env::var("XDG_DATA_HOME").ok().as_deref(),
        dirs::home_dir().as_deref(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r#"
source_dir: src
log_dir: /var/log/autobuild
retry_count: 1
tail_lines: 0
merge: true
alternates: ["/cache/%s"]
prefixes: [install]
source_before: [/etc/profile.d/base.sh]
packages:
  base/types:
    url: https://example.com/types.git
    branch: main
    patches:
      - path: patches/types.patch
      - path: /abs/fix.patch
        level: 0
  tools/pinned:
    url: https://example.com/tools.git
    commit: 0123456789abcdef
    local_branch: pinned
    importdir: /elsewhere/tools
    merge: false
  plain:
    url: https://example.com/plain.git
    remote: upstream
    push_url: ssh://example.com/plain.git
"#;

    fn project(yaml: &str) -> Project {
        Project {
            root: PathBuf::from("/ws"),
            manifest: serde_yaml_ng::from_str(yaml).unwrap(),
        }
    }

    #[test]
    fn test_data_dir_xdg_set() {
        let dir = data_dir_with(Some("/custom/data"), None).unwrap();
        assert_eq!(dir, PathBuf::from("/custom/data/autobuild"));
    }

    #[test]
    fn test_data_dir_xdg_empty_falls_back_to_home() {
        let dir = data_dir_with(Some(""), Some(Path::new("/home/user"))).unwrap();
        assert_eq!(dir, PathBuf::from("/home/user/.local/share/autobuild"));
    }

    #[test]
    fn test_data_dir_no_home_errors() {
        assert!(data_dir_with(None, None).is_err());
    }

    #[test]
    fn test_log_dir_defaults_to_data_dir() {
        let paths = Paths::from_data_dir(Path::new("/data/autobuild"));
        let p = project("packages: {}\n");
        assert_eq!(p.log_dir(&paths), PathBuf::from("/data/autobuild/logs"));
        let settings = p.runner_settings(&paths);
        assert_eq!(settings.retry_count, 3);
        assert_eq!(settings.tail, TailLines::Count(10));
    }

    #[test]
    fn test_load_nonexistent_file() {
        let tmp = tempfile::tempdir().unwrap();
        let p = Project::load(&tmp.path().join(MANIFEST_FILE)).unwrap();
        assert!(p.manifest.packages.is_empty());
        assert_eq!(p.root, tmp.path());
    }

    #[test]
    fn test_load_invalid_yaml_names_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join(MANIFEST_FILE);
        fs::write(&path, "packages: [not, a, map]\n").unwrap();
        let err = Manifest::load_from(&path).unwrap_err();
        assert!(format!("{:#}", err).contains(MANIFEST_FILE));
    }

    #[test]
    fn test_full_manifest() {
        let p = project(FULL);
        let paths = Paths::from_data_dir(Path::new("/data"));
        let settings = p.runner_settings(&paths);
        assert_eq!(settings.log_dir, PathBuf::from("/var/log/autobuild"));
        assert_eq!(settings.retry_count, 1);
        assert_eq!(settings.tail, TailLines::All);

        let setups = p.packages(&["/env-cache/%s".to_string()]).unwrap();
        assert_eq!(setups.len(), 3);
        let by_name: BTreeMap<&str, &PackageSetup> =
            setups.iter().map(|s| (s.package.name.as_str(), s)).collect();

        let types = by_name["base/types"];
        assert_eq!(types.package.srcdir, PathBuf::from("/ws/src/base/types"));
        assert!(types.package.imports_into_srcdir());
        let repo = types.importer.repository();
        assert_eq!(repo.tracking, Tracking::Branch("main".into()));
        assert_eq!(repo.remote_name, "autobuild");
        assert!(types.importer.merge());

        let pinned = by_name["tools/pinned"];
        assert_eq!(pinned.package.importdir, PathBuf::from("/elsewhere/tools"));
        let repo = pinned.importer.repository();
        assert_eq!(repo.tracking, Tracking::Commit("0123456789abcdef".into()));
        assert_eq!(repo.local_branch(), Some("pinned"));
        assert!(!pinned.importer.merge());

        let plain = by_name["plain"];
        let repo = plain.importer.repository();
        assert_eq!(repo.tracking, Tracking::Branch("master".into()));
        assert_eq!(repo.remote_name, "upstream");
        assert_eq!(repo.push_url(), "ssh://example.com/plain.git");
    }

    #[test]
    fn test_patch_levels_and_paths() {
        let m: Manifest = serde_yaml_ng::from_str(FULL).unwrap();
        let patches = &m.packages["base/types"].patches;
        assert_eq!(patches[0].level, 1);
        assert_eq!(patches[1].level, 0);
    }

    #[test]
    fn test_validation_errors() {
        let cases = vec![
            (
                "multiple tracking options",
                "packages:\n  a:\n    url: u\n    branch: main\n    tag: v1\n",
                "at most one of branch, tag and commit",
            ),
            (
                "empty url",
                "packages:\n  a:\n    url: ''\n",
                "url is empty",
            ),
            (
                "shared importdir",
                "packages:\n  a:\n    url: u\n    importdir: /x\n  b:\n    url: v\n    importdir: /x\n",
                "share the import directory",
            ),
        ];
        for (name, yaml, want) in cases {
            let err = project(yaml).packages(&[]).err().unwrap();
            assert!(err.to_string().contains(want), "{}: {}", name, err);
        }
    }

    #[test]
    fn test_select() {
        let p = project(FULL);
        let all = p.select(&[], &[]).unwrap();
        assert_eq!(all.len(), 3);
        let one = p.select(&[], &["plain".to_string()]).unwrap();
        assert_eq!(one.len(), 1);
        assert!(p.select(&[], &["missing".to_string()]).is_err());
    }
}
