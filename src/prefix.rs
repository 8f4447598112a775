//! Discovery of the search paths an installation prefix contributes.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Mutex, MutexGuard};

use regex::Regex;
use tracing::debug;

use crate::environment::Environment;

#[cfg(target_os = "macos")]
pub const LIBRARY_PATH: &str = "DYLD_LIBRARY_PATH";
#[cfg(windows)]
pub const LIBRARY_PATH: &str = "PATH";
#[cfg(not(any(target_os = "macos", windows)))]
pub const LIBRARY_PATH: &str = "LD_LIBRARY_PATH";

#[cfg(target_os = "macos")]
pub const LIBRARY_SUFFIX: &str = "dylib";
#[cfg(windows)]
pub const LIBRARY_SUFFIX: &str = "dll";
#[cfg(not(any(target_os = "macos", windows)))]
pub const LIBRARY_SUFFIX: &str = "so";

const LIBRARY_SEARCH_PATTERNS: &[&str] = &["lib", "lib/ARCH", "libARCHSIZE"];

const DEFAULT_PKGCONFIG_SUFFIXES: &[&str] = &[
    "lib/pkgconfig",
    "lib/ARCH/pkgconfig",
    "libARCHSIZE/pkgconfig",
    "share/pkgconfig",
];

/// What `add_prefix` registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PrefixCategory {
    Path,
    PkgConfig,
    LibraryPath,
    CompilerFlags,
    Python,
}

impl PrefixCategory {
    pub const ALL: [PrefixCategory; 5] = [
        PrefixCategory::Path,
        PrefixCategory::PkgConfig,
        PrefixCategory::LibraryPath,
        PrefixCategory::CompilerFlags,
        PrefixCategory::Python,
    ];
}

/// Host queries the scanner depends on.
pub trait PlatformProbe: Send + Sync {
    /// `KEY=value` lines from `dpkg-architecture`, if available.
    fn dpkg_architecture(&self, target_arch: Option<&str>) -> Option<Vec<String>>;

    /// Combined output of `pkg-config --debug`, if available. `triplet` names
    /// the cross pkg-config to run (`<triplet>-pkg-config`) when building for
    /// another architecture.
    fn pkg_config_debug(&self, triplet: Option<&str>) -> Option<String>;
}

/// Probe backed by the real tools.
pub struct CommandProbe;

impl PlatformProbe for CommandProbe {
    fn dpkg_architecture(&self, target_arch: Option<&str>) -> Option<Vec<String>> {
        let tool = Path::new("/usr/bin/dpkg-architecture");
        if !tool.is_file() {
            return None;
        }
        let mut cmd = Command::new(tool);
        if let Some(arch) = target_arch {
            cmd.args(["-T", arch]);
        }
        let output = cmd.output().ok().filter(|o| o.status.success())?;
        Some(
            String::from_utf8_lossy(&output.stdout)
                .split_whitespace()
                .map(String::from)
                .collect(),
        )
    }

    fn pkg_config_debug(&self, triplet: Option<&str>) -> Option<String> {
        let tool = match triplet {
            Some(t) => format!("{}-pkg-config", t),
            None => "pkg-config".to_string(),
        };
        let output = Command::new(tool)
            .arg("--debug")
            .env("LANG", "C")
            .output()
            .ok()?;
        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        Some(text)
    }
}

/// Finds the architecture-specific directories under installation prefixes.
///
/// Probe results are computed once and cached until the target architecture
/// changes.
pub struct PrefixScanner {
    probe: Box<dyn PlatformProbe>,
    target_arch: Option<String>,
    arch_names: Mutex<Option<Vec<String>>>,
    arch_size: Mutex<Option<u32>>,
    pkgconfig_suffixes: Mutex<Option<Vec<String>>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl PrefixScanner {
    pub fn new() -> Self {
        Self::with_probe(Box::new(CommandProbe))
    }

    pub fn with_probe(probe: Box<dyn PlatformProbe>) -> Self {
        PrefixScanner {
            probe,
            target_arch: None,
            arch_names: Mutex::new(None),
            arch_size: Mutex::new(None),
            pkgconfig_suffixes: Mutex::new(None),
        }
    }

    pub fn target_arch(&self) -> Option<&str> {
        self.target_arch.as_deref()
    }

    /// Changes the architecture being built for and drops the cached probes.
    pub fn set_target_arch(&mut self, arch: Option<String>) {
        self.target_arch = arch;
        *lock(&self.arch_names) = None;
        *lock(&self.arch_size) = None;
        *lock(&self.pkgconfig_suffixes) = None;
    }

    fn dpkg_value(&self, keys: &[&str]) -> Option<String> {
        let lines = self.probe.dpkg_architecture(self.target_arch.as_deref())?;
        keys.iter().find_map(|key| {
            lines
                .iter()
                .find_map(|l| l.strip_prefix(key).and_then(|r| r.strip_prefix('=')))
                .map(String::from)
        })
    }

    /// Multiarch names such as `x86_64-linux-gnu`; empty when unknown.
    pub fn arch_names(&self) -> Vec<String> {
        let mut cached = lock(&self.arch_names);
        if let Some(names) = cached.as_ref() {
            return names.clone();
        }
        let names: Vec<String> = self
            .dpkg_value(&["DEB_TARGET_MULTIARCH", "DEB_BUILD_MULTIARCH"])
            .into_iter()
            .collect();
        debug!(?names, "probed architecture names");
        *cached = Some(names.clone());
        names
    }

    /// Pointer width of the target, 32 or 64.
    pub fn arch_size(&self) -> u32 {
        let mut cached = lock(&self.arch_size);
        if let Some(size) = *cached {
            return size;
        }
        let size = self
            .dpkg_value(&["DEB_TARGET_ARCH_BITS", "DEB_BUILD_ARCH_BITS"])
            .and_then(|s| s.parse().ok())
            .unwrap_or(if cfg!(target_pointer_width = "64") { 64 } else { 32 });
        *cached = Some(size);
        size
    }

    /// Prefix-relative directories pkg-config searches (e.g. `lib/pkgconfig`).
    pub fn pkgconfig_search_suffixes(&self) -> Vec<String> {
        let mut cached = lock(&self.pkgconfig_suffixes);
        if let Some(suffixes) = cached.as_ref() {
            return suffixes.clone();
        }
        let triplet = match self.target_arch {
            Some(_) => self.arch_names().into_iter().next(),
            None => None,
        };
        let mut suffixes = self
            .probe
            .pkg_config_debug(triplet.as_deref())
            .map(|out| parse_pkgconfig_debug(&out))
            .unwrap_or_default();
        if suffixes.is_empty() {
            suffixes = DEFAULT_PKGCONFIG_SUFFIXES
                .iter()
                .map(|s| s.to_string())
                .collect();
        }
        *cached = Some(suffixes.clone());
        suffixes
    }

    /// Expands `ARCH`/`ARCHSIZE` placeholders in `patterns` and returns the
    /// resulting directories that exist under `prefix`, without duplicates.
    pub fn search_paths(&self, prefix: &Path, patterns: &[impl AsRef<str>]) -> Vec<PathBuf> {
        let arch_names = self.arch_names();
        let arch_size = self.arch_size().to_string();
        let mut seen = BTreeSet::new();
        let mut result = Vec::new();
        for pattern in patterns {
            let base = pattern.as_ref().replace("ARCHSIZE", &arch_size);
            let candidates: Vec<String> = if base.contains("ARCH") {
                arch_names.iter().map(|a| base.replace("ARCH", a)).collect()
            } else {
                vec![base]
            };
            for rel in candidates {
                let path = rel.split('/').fold(prefix.to_path_buf(), |p, c| p.join(c));
                if path.is_dir() && seen.insert(path.clone()) {
                    result.push(path);
                }
            }
        }
        result
    }

    pub fn library_dirs(&self, prefix: &Path) -> Vec<PathBuf> {
        self.search_paths(prefix, LIBRARY_SEARCH_PATTERNS)
    }
}

impl Default for PrefixScanner {
    fn default() -> Self {
        Self::new()
    }
}

/// Extracts the prefix-relative search directories from `pkg-config --debug`.
pub fn parse_pkgconfig_debug(output: &str) -> Vec<String> {
    let patterns = [
        r"Scanning directory (?:#\d+ )?'.*/((?:lib|lib64|share)/.*)'$",
        r"Cannot open directory (?:#\d+ )?'.*/((?:lib|lib64|share)/.*)' in package search path:.*",
    ];
    let regexes: Vec<Regex> = patterns.iter().filter_map(|p| Regex::new(p).ok()).collect();
    let mut result: Vec<String> = Vec::new();
    for line in output.lines() {
        for re in &regexes {
            if let Some(suffix) = re.captures(line).and_then(|c| c.get(1)) {
                let suffix = suffix.as_str().trim_end_matches('/').to_string();
                if !result.contains(&suffix) {
                    result.push(suffix);
                }
            }
        }
    }
    result
}

/// `base` with glob metacharacters escaped, followed by the `pattern` components.
fn glob_under(base: &Path, pattern: &[&str]) -> Option<String> {
    let escaped = PathBuf::from(glob::Pattern::escape(base.to_str()?));
    let full = pattern.iter().fold(escaped, |p, c| p.join(c));
    full.to_str().map(String::from)
}

fn has_shared_library(dir: &Path) -> bool {
    let Some(pattern) = glob_under(dir, &[&format!("lib*.{}*", LIBRARY_SUFFIX)]) else {
        return false;
    };
    glob::glob(&pattern)
        .map(|paths| {
            paths
                .flatten()
                .any(|p| p.extension().is_none_or(|e| e != "debug"))
        })
        .unwrap_or(false)
}

fn python_dirs(prefix: &Path) -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    for layout in ["site-packages", "dist-packages"] {
        let Some(pattern) = glob_under(prefix, &["lib*", "python*", layout]) else {
            continue;
        };
        if let Ok(paths) = glob::glob(&pattern) {
            dirs.extend(paths.flatten().filter(|p| p.is_dir()));
        }
    }
    dirs.sort();
    dirs
}

fn path_str(p: &Path) -> Option<&str> {
    p.to_str()
}

impl Environment {
    /// Registers what an installation prefix provides: executables,
    /// pkg-config files, shared libraries, headers and Python modules.
    /// `includes` restricts the categories; `None` means all of them.
    pub fn add_prefix(
        &mut self,
        scanner: &PrefixScanner,
        prefix: &Path,
        includes: Option<&[PrefixCategory]>,
    ) {
        let wanted = |c: PrefixCategory| includes.is_none_or(|list| list.contains(&c));

        if wanted(PrefixCategory::Path) {
            let bin = prefix.join("bin");
            if bin.is_dir()
                && let Some(bin) = path_str(&bin)
            {
                self.add_path("PATH", &[bin]);
            }
        }

        if wanted(PrefixCategory::PkgConfig) {
            let suffixes = scanner.pkgconfig_search_suffixes();
            for dir in scanner.search_paths(prefix, &suffixes) {
                if let Some(dir) = path_str(&dir) {
                    self.add_path("PKG_CONFIG_PATH", &[dir]);
                }
            }
        }

        let library_dirs = scanner.library_dirs(prefix);

        if wanted(PrefixCategory::LibraryPath) {
            for dir in library_dirs.iter().filter(|d| has_shared_library(d)) {
                if let Some(dir) = path_str(dir) {
                    self.add_path(LIBRARY_PATH, &[dir]);
                }
            }
        }

        if wanted(PrefixCategory::CompilerFlags) && !library_dirs.is_empty() {
            let include = prefix.join("include");
            if include.is_dir()
                && let Some(include) = path_str(&include)
            {
                let flag = format!("-I{}", include);
                for name in ["CFLAGS", "CXXFLAGS"] {
                    self.append_flag(name, &flag);
                }
            }
            for dir in &library_dirs {
                if let Some(dir) = path_str(dir) {
                    self.append_flag("LDFLAGS", &format!("-L{}", dir));
                }
            }
        }

        if wanted(PrefixCategory::Python) {
            for dir in python_dirs(prefix) {
                if let Some(dir) = path_str(&dir) {
                    self.add_path("PYTHONPATH", &[dir]);
                }
            }
        }
    }

    fn append_flag(&mut self, name: &str, flag: &str) {
        let present = self
            .value(name, crate::environment::Inheritance::Ignore)
            .is_some_and(|v| v.iter().any(|f| f == flag));
        if !present {
            self.append(name, &[flag]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::Inheritance;
    use crate::shell::ShellFormat;
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedProbe {
        dpkg: Option<Vec<String>>,
        pkg_config: Option<String>,
        calls: Arc<AtomicUsize>,
    }

    impl PlatformProbe for FixedProbe {
        fn dpkg_architecture(&self, target_arch: Option<&str>) -> Option<Vec<String>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match target_arch {
                Some("armhf") => Some(vec![
                    "DEB_TARGET_MULTIARCH=arm-linux-gnueabihf".into(),
                    "DEB_TARGET_ARCH_BITS=32".into(),
                ]),
                _ => self.dpkg.clone(),
            }
        }

        fn pkg_config_debug(&self, triplet: Option<&str>) -> Option<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let triplet = triplet.unwrap_or("x86_64-linux-gnu");
            self.pkg_config
                .as_ref()
                .map(|out| out.replace("TRIPLET", triplet))
        }
    }

    fn scanner(calls: Arc<AtomicUsize>) -> PrefixScanner {
        PrefixScanner::with_probe(Box::new(FixedProbe {
            dpkg: Some(vec![
                "DEB_BUILD_MULTIARCH=x86_64-linux-gnu".into(),
                "DEB_BUILD_ARCH_BITS=64".into(),
            ]),
            pkg_config: None,
            calls,
        }))
    }

    fn env() -> Environment {
        Environment::with_ambient(ShellFormat::Posix, BTreeMap::new())
    }

    fn mkdirs(root: &Path, dirs: &[&str]) {
        for d in dirs {
            std::fs::create_dir_all(root.join(d)).unwrap();
        }
    }

    #[test]
    fn test_arch_probes_are_cached_and_invalidated() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut scanner = scanner(calls.clone());
        assert_eq!(scanner.arch_names(), vec!["x86_64-linux-gnu".to_string()]);
        assert_eq!(scanner.arch_names(), vec!["x86_64-linux-gnu".to_string()]);
        assert_eq!(scanner.arch_size(), 64);
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        scanner.set_target_arch(Some("armhf".into()));
        assert_eq!(scanner.arch_names(), vec!["arm-linux-gnueabihf".to_string()]);
        assert_eq!(scanner.arch_size(), 32);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_pkgconfig_suffixes_follow_target_arch() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut scanner = PrefixScanner::with_probe(Box::new(FixedProbe {
            dpkg: Some(vec!["DEB_BUILD_MULTIARCH=x86_64-linux-gnu".into()]),
            pkg_config: Some("Scanning directory #1 '/usr/lib/TRIPLET/pkgconfig'\n".into()),
            calls: calls.clone(),
        }));
        let host = vec!["lib/x86_64-linux-gnu/pkgconfig".to_string()];
        assert_eq!(scanner.pkgconfig_search_suffixes(), host);
        assert_eq!(scanner.pkgconfig_search_suffixes(), host);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        scanner.set_target_arch(Some("armhf".into()));
        assert_eq!(
            scanner.pkgconfig_search_suffixes(),
            vec!["lib/arm-linux-gnueabihf/pkgconfig".to_string()]
        );
        // arch names for the triplet, then pkg-config again
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_no_dpkg_falls_back_to_pointer_width() {
        let scanner = PrefixScanner::with_probe(Box::new(FixedProbe {
            dpkg: None,
            pkg_config: None,
            calls: Arc::new(AtomicUsize::new(0)),
        }));
        assert!(scanner.arch_names().is_empty());
        let want = if cfg!(target_pointer_width = "64") { 64 } else { 32 };
        assert_eq!(scanner.arch_size(), want);
        assert_eq!(
            scanner.pkgconfig_search_suffixes(),
            DEFAULT_PKGCONFIG_SUFFIXES
                .iter()
                .map(|s| s.to_string())
                .collect::<Vec<_>>()
        );
    }

    #[test]
    fn test_parse_pkgconfig_debug() {
        let out = "\
PKG_CONFIG_PATH is not set
Scanning directory #1 '/usr/local/lib/x86_64-linux-gnu/pkgconfig'
Cannot open directory #2 '/usr/local/lib/pkgconfig' in package search path: No such file or directory
Scanning directory #3 '/usr/lib/x86_64-linux-gnu/pkgconfig'
Scanning directory '/usr/share/pkgconfig/'
Scanning directory #5 '/usr/lib/pkgconfig'
";
        assert_eq!(
            parse_pkgconfig_debug(out),
            vec![
                "lib/x86_64-linux-gnu/pkgconfig".to_string(),
                "lib/pkgconfig".to_string(),
                "share/pkgconfig".to_string(),
            ]
        );
    }

    #[test]
    fn test_search_paths_expand_placeholders() {
        let tmp = tempfile::tempdir().unwrap();
        mkdirs(tmp.path(), &["lib", "lib/x86_64-linux-gnu", "lib64"]);
        let scanner = scanner(Arc::new(AtomicUsize::new(0)));
        let paths = scanner.search_paths(tmp.path(), &["lib", "lib/ARCH", "libARCHSIZE", "lib"]);
        assert_eq!(
            paths,
            vec![
                tmp.path().join("lib"),
                tmp.path().join("lib").join("x86_64-linux-gnu"),
                tmp.path().join("lib64"),
            ]
        );
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_add_prefix() {
        let tmp = tempfile::tempdir().unwrap();
        let prefix = tmp.path();
        mkdirs(
            prefix,
            &[
                "bin",
                "include",
                "lib/pkgconfig",
                "lib/x86_64-linux-gnu",
                "lib64",
                "lib/python3.11/site-packages",
            ],
        );
        std::fs::write(prefix.join("lib/libfoo.so.1"), "").unwrap();
        std::fs::write(prefix.join("lib64/libbar.so.debug"), "").unwrap();

        let scanner = scanner(Arc::new(AtomicUsize::new(0)));
        let mut env = env();
        env.add_prefix(&scanner, prefix, None);
        let p = |rel: &str| prefix.join(rel).to_str().unwrap().to_string();

        assert_eq!(env.value("PATH", Inheritance::Ignore).unwrap(), vec![p("bin")]);
        assert_eq!(
            env.value("PKG_CONFIG_PATH", Inheritance::Ignore).unwrap(),
            vec![p("lib/pkgconfig")]
        );
        assert_eq!(
            env.value("LD_LIBRARY_PATH", Inheritance::Ignore).unwrap(),
            vec![p("lib")],
            "only directories holding a shared library"
        );
        assert_eq!(
            env.value("CFLAGS", Inheritance::Ignore).unwrap(),
            vec![format!("-I{}", p("include"))]
        );
        assert_eq!(
            env.value("LDFLAGS", Inheritance::Ignore).unwrap(),
            vec![
                format!("-L{}", p("lib64")),
                format!("-L{}", p("lib/x86_64-linux-gnu")),
                format!("-L{}", p("lib")),
            ]
        );
        assert_eq!(
            env.value("PYTHONPATH", Inheritance::Ignore).unwrap(),
            vec![p("lib/python3.11/site-packages")]
        );
        assert!(env.is_appended_variable("CXXFLAGS"));

        // A second pass must not duplicate the flags.
        env.add_prefix(&scanner, prefix, None);
        assert_eq!(env.value("CXXFLAGS", Inheritance::Ignore).unwrap().len(), 1);
        assert_eq!(env.value("LDFLAGS", Inheritance::Ignore).unwrap().len(), 3);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_prefix_with_glob_metacharacters() {
        let tmp = tempfile::tempdir().unwrap();
        let prefix = tmp.path().join("opt[1]*?");
        mkdirs(&prefix, &["lib", "lib/python3.12/dist-packages"]);
        std::fs::write(prefix.join("lib/libfoo.so"), "").unwrap();

        let scanner = scanner(Arc::new(AtomicUsize::new(0)));
        let mut env = env();
        env.add_prefix(&scanner, &prefix, None);
        let p = |rel: &str| prefix.join(rel).to_str().unwrap().to_string();
        assert_eq!(
            env.value("LD_LIBRARY_PATH", Inheritance::Ignore).unwrap(),
            vec![p("lib")]
        );
        assert_eq!(
            env.value("PYTHONPATH", Inheritance::Ignore).unwrap(),
            vec![p("lib/python3.12/dist-packages")]
        );
    }

    #[test]
    fn test_add_prefix_restricted_categories() {
        let tmp = tempfile::tempdir().unwrap();
        mkdirs(tmp.path(), &["bin", "lib/pkgconfig"]);
        let scanner = scanner(Arc::new(AtomicUsize::new(0)));
        let mut env = env();
        env.add_prefix(&scanner, tmp.path(), Some(&[PrefixCategory::PkgConfig]));
        assert!(!env.is_declared("PATH"));
        assert!(env.is_declared("PKG_CONFIG_PATH"));
    }
}
