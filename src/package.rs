use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use crate::error::{ErrorKind, PackageError, Phase};

/// A package whose sources are kept in sync by an importer.
#[derive(Debug, Clone, PartialEq)]
pub struct Package {
    pub name: String,
    /// Where the package is built from.
    pub srcdir: PathBuf,
    /// Where the repository is checked out. Usually the same as `srcdir`.
    pub importdir: PathBuf,
}

impl Package {
    pub fn new(name: impl Into<String>, srcdir: impl Into<PathBuf>) -> Self {
        let srcdir = srcdir.into();
        Package {
            name: name.into(),
            importdir: srcdir.clone(),
            srcdir,
        }
    }

    pub fn with_importdir(mut self, importdir: impl Into<PathBuf>) -> Self {
        self.importdir = importdir.into();
        self
    }

    pub fn imports_into_srcdir(&self) -> bool {
        self.importdir == self.srcdir
    }

    pub fn error(&self, phase: Phase, kind: impl Into<ErrorKind>) -> PackageError {
        self.error_in(&self.importdir, phase, kind)
    }

    pub fn error_in(&self, dir: &Path, phase: Phase, kind: impl Into<ErrorKind>) -> PackageError {
        PackageError {
            package: self.name.clone(),
            dir: dir.to_path_buf(),
            phase,
            kind: kind.into(),
        }
    }
}

/// Replaces `path` with `data` through a temp file in the same directory.
pub fn write_atomic(path: &Path, data: &[u8]) -> io::Result<()> {
    let dir = match path.parent() {
        Some(d) if !d.as_os_str().is_empty() => d,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(data)?;
    tmp.persist(path)?;
    Ok(())
}
