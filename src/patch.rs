//! Applies local patches on top of an imported tree and keeps track of what
//! is applied so the next pass can reverse it.
//!
//! State is kept next to the sources: `autobuild-patches` lists one
//! `<copy-path> <level>` entry per applied patch, in application order, where
//! each copy lives under `.autobuild-patches/`. Reversing always uses the
//! copy, so editing or deleting the original patch file is safe.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{ErrorKind, PackageError, Phase};
use crate::package::{Package, write_atomic};
use crate::subprocess::{RunOptions, Runner};

pub const SIDECAR_FILE: &str = "autobuild-patches";
const COPY_DIR: &str = ".autobuild-patches";

fn default_level() -> u32 {
    1
}

/// A patch to apply, with its `-p` strip level.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchSpec {
    pub path: PathBuf,
    #[serde(default = "default_level")]
    pub level: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PatchOutcome {
    pub removed: usize,
    pub applied: usize,
}

impl PatchOutcome {
    pub fn is_noop(&self) -> bool {
        self.removed == 0 && self.applied == 0
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Applied {
    /// Relative to the source directory.
    copy: PathBuf,
    level: u32,
    content: Vec<u8>,
}

fn parse_sidecar(data: &str) -> Result<Vec<(PathBuf, u32)>, String> {
    let mut out = Vec::new();
    for (lineno, line) in data.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (path, level) = match line.rsplit_once(' ') {
            Some((p, l)) => (p, l),
            None => (line, "0"),
        };
        let level = level
            .parse::<u32>()
            .map_err(|_| format!("{}:{}: invalid patch level {:?}", SIDECAR_FILE, lineno + 1, level))?;
        out.push((PathBuf::from(path), level));
    }
    Ok(out)
}

fn load_state(srcdir: &Path) -> Result<Vec<Applied>, ErrorKind> {
    let data = match fs::read_to_string(srcdir.join(SIDECAR_FILE)) {
        Ok(d) => d,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let entries = parse_sidecar(&data).map_err(ErrorKind::Config)?;
    let mut out = Vec::with_capacity(entries.len());
    for (copy, level) in entries {
        let content = fs::read(srcdir.join(&copy)).map_err(|e| {
            ErrorKind::Config(format!(
                "cannot read applied patch {}: {}",
                srcdir.join(&copy).display(),
                e
            ))
        })?;
        out.push(Applied {
            copy,
            level,
            content,
        });
    }
    Ok(out)
}

fn save_state(srcdir: &Path, state: &[Applied]) -> io::Result<()> {
    let sidecar = srcdir.join(SIDECAR_FILE);
    if state.is_empty() {
        match fs::remove_file(&sidecar) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => return Err(e),
            _ => {}
        }
        match fs::remove_dir_all(srcdir.join(COPY_DIR)) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => return Err(e),
            _ => {}
        }
        return Ok(());
    }
    let mut data = String::new();
    for a in state {
        data.push_str(&format!("{} {}\n", a.copy.display(), a.level));
    }
    write_atomic(&sidecar, data.as_bytes())
}

/// Number of leading entries `current` and `desired` have in common.
fn common_prefix(current: &[Applied], desired: &[(u32, Vec<u8>)]) -> usize {
    current
        .iter()
        .zip(desired)
        .take_while(|(c, (level, content))| c.level == *level && &c.content == content)
        .count()
}

fn run_patch(
    runner: &Runner,
    package: &Package,
    level: u32,
    reverse: bool,
    file: &Path,
) -> Result<(), PackageError> {
    let strip = format!("-p{}", level);
    let file = file
        .to_str()
        .ok_or_else(|| {
            package.error_in(
                &package.srcdir,
                Phase::Patch,
                ErrorKind::Config(format!("non-UTF8 patch path {}", file.display())),
            )
        })?;
    let mode = if reverse { "-R" } else { "-N" };
    runner
        .run(
            &package.name,
            Phase::Patch.as_str(),
            "patch",
            &[&strip, mode, "-i", file],
            &RunOptions {
                working_dir: Some(&package.srcdir),
                retry: false,
            },
        )
        .map_err(|e| package.error_in(&package.srcdir, Phase::Patch, e))?;
    Ok(())
}

/// Brings the patches applied to `package.srcdir` in line with `patches`.
/// Whatever state is reached is recorded, even on failure.
pub fn apply(
    runner: &Runner,
    package: &Package,
    patches: &[PatchSpec],
) -> Result<PatchOutcome, PackageError> {
    let srcdir = &package.srcdir;
    let err = |kind: ErrorKind| package.error_in(srcdir, Phase::Patch, kind);

    let mut desired = Vec::with_capacity(patches.len());
    for p in patches {
        let content = fs::read(&p.path).map_err(|e| {
            err(ErrorKind::Config(format!(
                "cannot read patch {}: {}",
                p.path.display(),
                e
            )))
        })?;
        desired.push((p.level, content));
    }

    let mut state = load_state(srcdir).map_err(err)?;
    let keep = common_prefix(&state, &desired);
    let mut outcome = PatchOutcome::default();
    if keep == state.len() && keep == desired.len() {
        debug!(package = %package.name, "patches up to date");
        return Ok(outcome);
    }

    let result = (|| -> Result<(), PackageError> {
        while state.len() > keep {
            let Some(last) = state.last() else { break };
            run_patch(runner, package, last.level, true, &srcdir.join(&last.copy))?;
            state.pop();
            outcome.removed += 1;
        }
        for (idx, (level, content)) in desired.iter().enumerate().skip(keep) {
            let copy = Path::new(COPY_DIR).join(idx.to_string());
            write_atomic(&srcdir.join(&copy), content).map_err(|e| err(e.into()))?;
            run_patch(runner, package, *level, false, &srcdir.join(&copy))?;
            state.push(Applied {
                copy,
                level: *level,
                content: content.clone(),
            });
            outcome.applied += 1;
        }
        Ok(())
    })();

    save_state(srcdir, &state).map_err(|e| err(e.into()))?;
    result?;
    info!(
        package = %package.name,
        removed = outcome.removed,
        applied = outcome.applied,
        "patches updated"
    );
    Ok(outcome)
}
