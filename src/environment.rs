//! Layered description of a process environment.
//!
//! Each declared variable has its own values, a snapshot of what it inherited
//! from the ambient environment when it was first touched, and optional
//! system defaults. Resolution concatenates the three layers in that order and
//! drops duplicates. A variable that was never declared is passed through
//! untouched.

use std::collections::{BTreeMap, BTreeSet};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use crate::shell::{self, ShellFormat};

/// The environment shared between the build coordinator (writer) and the
/// subprocess call sites (readers).
pub type SharedEnvironment = Arc<RwLock<Environment>>;

/// How `value` treats what a variable inherits from the ambient environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inheritance {
    /// Substitute the snapshotted values.
    Expand,
    /// Emit a reference to the variable (`$NAME`) for the shell to resolve.
    Keep,
    /// Leave inherited values out.
    Ignore,
}

#[derive(Debug, Clone, PartialEq)]
enum Entry {
    /// Actively removed from the child environment.
    Unset,
    Values(Vec<String>),
}

#[derive(Debug, Clone)]
enum Ambient {
    Process,
    Fixed(BTreeMap<String, String>),
}

impl Ambient {
    fn get(&self, name: &str) -> Option<String> {
        match self {
            Ambient::Process => std::env::var(name).ok(),
            Ambient::Fixed(map) => map.get(name).cloned(),
        }
    }
}

/// Result of [`Environment::exported_environment`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExportedEnvironment {
    pub unset: Vec<String>,
    /// Variables whose value does not depend on inheritance.
    pub set: BTreeMap<String, Vec<String>>,
    /// `(with inheritance, without inheritance)` pairs, chosen by the shell at load time.
    pub update: BTreeMap<String, (Vec<String>, Vec<String>)>,
    /// Variables among `set`/`update` joined with a space.
    pub appended: BTreeSet<String>,
    /// Variables among `set`/`update` whose entries must exist on disk.
    pub path_variables: BTreeSet<String>,
}

impl ExportedEnvironment {
    pub fn join(&self, name: &str, values: &[String], path_separator: char) -> String {
        if self.appended.contains(name) {
            values.join(" ")
        } else {
            values.join(&path_separator.to_string())
        }
    }

    /// Splits a joined value back into entries.
    pub fn split<'v>(&self, name: &str, value: &'v str, path_separator: char) -> Vec<&'v str> {
        if self.appended.contains(name) {
            value.split_whitespace().collect()
        } else {
            value.split(path_separator).filter(|s| !s.is_empty()).collect()
        }
    }
}

#[derive(Debug, Clone)]
pub struct Environment {
    format: ShellFormat,
    ambient: Ambient,
    own: BTreeMap<String, Entry>,
    inherited: BTreeMap<String, Vec<String>>,
    /// Variables whose inherited part was explicitly dropped by `clear`.
    cleared: BTreeSet<String>,
    system: BTreeMap<String, Vec<String>>,
    isolated: bool,
    inherit_overrides: BTreeMap<String, bool>,
    path_variables: BTreeSet<String>,
    appended_variables: BTreeSet<String>,
    source_before: Vec<PathBuf>,
    source_after: Vec<PathBuf>,
}

impl Environment {
    /// An environment inheriting from this process' environment.
    pub fn new(format: ShellFormat) -> Self {
        Self::build(format, Ambient::Process)
    }

    /// An environment inheriting from a fixed map instead of the process.
    pub fn with_ambient(format: ShellFormat, ambient: BTreeMap<String, String>) -> Self {
        Self::build(format, Ambient::Fixed(ambient))
    }

    fn build(format: ShellFormat, ambient: Ambient) -> Self {
        Environment {
            format,
            ambient,
            own: BTreeMap::new(),
            inherited: BTreeMap::new(),
            cleared: BTreeSet::new(),
            system: BTreeMap::new(),
            isolated: false,
            inherit_overrides: BTreeMap::new(),
            path_variables: BTreeSet::new(),
            appended_variables: BTreeSet::new(),
            source_before: Vec::new(),
            source_after: Vec::new(),
        }
    }

    pub fn into_shared(self) -> SharedEnvironment {
        Arc::new(RwLock::new(self))
    }

    pub fn format(&self) -> ShellFormat {
        self.format
    }

    pub fn is_declared(&self, name: &str) -> bool {
        self.own.contains_key(name)
    }

    // -----------------------------------------------------------------------
    // Inheritance
    // -----------------------------------------------------------------------

    pub fn inherits(&self, name: &str) -> bool {
        self.inherit_overrides
            .get(name)
            .copied()
            .unwrap_or(!self.isolated)
    }

    /// Enables or disables inheritance for `names` and re-snapshots them.
    pub fn inherit(&mut self, names: &[&str], flag: bool) {
        for name in names {
            self.inherit_overrides.insert(name.to_string(), flag);
            self.cleared.remove(*name);
            self.snapshot(name);
        }
    }

    /// Stops inheriting anything from the ambient environment. Names passed
    /// to [`inherit`](Self::inherit) afterwards are inherited again.
    pub fn isolate(&mut self) {
        self.isolated = true;
        self.inherit_overrides.clear();
        let names: Vec<String> = self.inherited.keys().cloned().collect();
        for name in names {
            self.snapshot(&name);
        }
    }

    fn snapshot(&mut self, name: &str) {
        let values = match self.ambient.get(name) {
            Some(v) if self.inherits(name) => self.split(name, &v),
            _ => Vec::new(),
        };
        self.inherited.insert(name.to_string(), values);
    }

    fn touch(&mut self, name: &str) {
        if !self.inherited.contains_key(name) {
            self.snapshot(name);
        }
    }

    fn split(&self, name: &str, value: &str) -> Vec<String> {
        if self.appended_variables.contains(name) {
            value.split_whitespace().map(String::from).collect()
        } else {
            value
                .split(self.format.path_separator())
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect()
        }
    }

    // -----------------------------------------------------------------------
    // Mutation
    // -----------------------------------------------------------------------

    /// Replaces the own values of `name`.
    pub fn set(&mut self, name: &str, values: &[&str]) {
        self.own.remove(name);
        self.add(name, values);
    }

    /// Puts `values` ahead of the existing own values of `name`.
    pub fn add(&mut self, name: &str, values: &[&str]) {
        self.touch(name);
        let mut merged: Vec<String> = values.iter().map(|v| v.to_string()).collect();
        if let Some(Entry::Values(existing)) = self.own.remove(name) {
            merged.extend(existing);
        }
        self.own.insert(name.to_string(), Entry::Values(merged));
    }

    /// Like [`add`](Self::add), but joins the variable with spaces (`CFLAGS`-style).
    pub fn append(&mut self, name: &str, values: &[&str]) {
        if self.appended_variables.insert(name.to_string()) && self.inherited.contains_key(name)
        {
            self.snapshot(name);
        }
        self.add(name, values);
    }

    /// Puts `values` first, moving any of them already present to the front
    /// instead of repeating them.
    pub fn push(&mut self, name: &str, values: &[&str]) {
        let existing = match self.own.get(name) {
            Some(Entry::Values(v)) => v.clone(),
            _ => Vec::new(),
        };
        let kept: Vec<&str> = existing
            .iter()
            .map(|s| s.as_str())
            .filter(|s| !values.contains(s))
            .collect();
        self.set(name, values);
        if let Some(Entry::Values(own)) = self.own.get_mut(name) {
            own.extend(kept.into_iter().map(String::from));
        }
    }

    /// Removes `name` from the child environment.
    pub fn unset(&mut self, name: &str) {
        self.touch(name);
        self.own.insert(name.to_string(), Entry::Unset);
    }

    /// Declares `name` with no value and drops what it inherited.
    pub fn clear(&mut self, name: &str) {
        self.own.insert(name.to_string(), Entry::Values(Vec::new()));
        self.inherited.insert(name.to_string(), Vec::new());
        self.cleared.insert(name.to_string());
    }

    /// Forgets everything declared for `name` and re-snapshots it, so that it
    /// is inherited as-is again.
    pub fn reset(&mut self, name: &str) {
        self.own.remove(name);
        self.inherited.remove(name);
        self.cleared.remove(name);
        self.inherit_overrides.remove(name);
        self.snapshot(name);
    }

    pub fn declare_path_variable(&mut self, name: &str) {
        self.path_variables.insert(name.to_string());
    }

    pub fn is_path_variable(&self, name: &str) -> bool {
        self.path_variables.contains(name)
    }

    pub fn is_appended_variable(&self, name: &str) -> bool {
        self.appended_variables.contains(name)
    }

    pub fn add_path(&mut self, name: &str, paths: &[&str]) {
        self.declare_path_variable(name);
        self.add(name, paths);
    }

    pub fn set_path(&mut self, name: &str, paths: &[&str]) {
        self.declare_path_variable(name);
        self.set(name, paths);
    }

    pub fn push_path(&mut self, name: &str, paths: &[&str]) {
        self.declare_path_variable(name);
        self.push(name, paths);
    }

    pub fn remove_path(&mut self, name: &str, paths: &[&str]) {
        if let Some(Entry::Values(own)) = self.own.get_mut(name) {
            own.retain(|p| !paths.contains(&p.as_str()));
        }
    }

    /// Values appended after own and inherited values, e.g. the platform's
    /// default search directories.
    pub fn add_system_default(&mut self, name: &str, values: &[&str]) {
        let entry = self.system.entry(name.to_string()).or_default();
        for v in values {
            if !entry.iter().any(|e| e == v) {
                entry.push(v.to_string());
            }
        }
    }

    pub fn source_before(&mut self, path: impl Into<PathBuf>) {
        self.source_before.push(path.into());
    }

    pub fn source_after(&mut self, path: impl Into<PathBuf>) {
        self.source_after.push(path.into());
    }

    // -----------------------------------------------------------------------
    // Resolution
    // -----------------------------------------------------------------------

    /// Own, inherited and system values of `name`, deduplicated in that order.
    /// `None` if the variable is not declared, is unset, or has no value left.
    pub fn value(&self, name: &str, mode: Inheritance) -> Option<Vec<String>> {
        let Some(Entry::Values(own)) = self.own.get(name) else {
            return None;
        };
        let inherited: Vec<String> = match mode {
            Inheritance::Expand => self.inherited.get(name).cloned().unwrap_or_default(),
            Inheritance::Keep if self.inherits(name) && !self.cleared.contains(name) => {
                vec![self.format.variable_reference(name)]
            }
            Inheritance::Keep | Inheritance::Ignore => Vec::new(),
        };
        let system = self.system.get(name).map(|v| v.as_slice()).unwrap_or(&[]);

        let mut result: Vec<String> = Vec::new();
        for v in own.iter().chain(inherited.iter()).chain(system.iter()) {
            if !result.contains(v) {
                result.push(v.clone());
            }
        }
        if result.is_empty() {
            return None;
        }
        Some(result)
    }

    fn join(&self, name: &str, values: &[String]) -> String {
        if self.appended_variables.contains(name) {
            values.join(" ")
        } else {
            values.join(&self.format.path_separator().to_string())
        }
    }

    /// The environment to apply to a child process. `None` means "remove".
    ///
    /// Path variables are filtered against the filesystem at call time, so two
    /// calls can disagree if directories appear or disappear in between.
    pub fn resolved_environment(&self) -> BTreeMap<String, Option<String>> {
        let mut resolved = BTreeMap::new();
        for name in self.own.keys() {
            let value = self
                .value(name, Inheritance::Expand)
                .map(|mut values| {
                    if self.is_path_variable(name) {
                        values.retain(|p| Path::new(p).exists());
                    }
                    values
                })
                .filter(|values| !values.is_empty())
                .map(|values| self.join(name, &values));
            resolved.insert(name.clone(), value);
        }
        resolved
    }

    pub fn exported_environment(&self) -> ExportedEnvironment {
        let mut export = ExportedEnvironment::default();
        for name in self.own.keys() {
            let Some(mut with) = self.value(name, Inheritance::Keep) else {
                export.unset.push(name.clone());
                continue;
            };
            let mut without = self.value(name, Inheritance::Ignore).unwrap_or_default();
            if self.is_path_variable(name) {
                for values in [&mut with, &mut without] {
                    values.retain(|p| {
                        self.format.is_variable_reference(p) || Path::new(p).exists()
                    });
                }
                export.path_variables.insert(name.clone());
            }
            if with.is_empty() {
                export.unset.push(name.clone());
                export.path_variables.remove(name);
                continue;
            }
            if self.is_appended_variable(name) {
                export.appended.insert(name.clone());
            }
            if with == without {
                export.set.insert(name.clone(), with);
            } else {
                export.update.insert(name.clone(), (with, without));
            }
        }
        export
    }

    /// Writes a script that reproduces this environment when sourced.
    pub fn export_shell<W: Write>(&self, out: &mut W) -> io::Result<()> {
        shell::write_script(
            out,
            self.format,
            &self.exported_environment(),
            &self.source_before,
            &self.source_after,
        )
    }
}
