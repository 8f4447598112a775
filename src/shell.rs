//! Shell text generation for exported environments.
//!
//! The output syntax is picked once through [`ShellFormat`] and handed to the
//! [`Environment`](crate::environment::Environment) at construction; nothing
//! here probes the host at runtime.

use std::collections::BTreeMap;
use std::io::{self, Write};
use std::path::Path;

use crate::environment::ExportedEnvironment;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ShellFormat {
    /// `sh`-compatible syntax with `:`-separated paths.
    #[default]
    Posix,
    /// `cmd.exe` batch syntax with `;`-separated paths.
    WindowsCmd,
}

impl ShellFormat {
    /// The format matching the platform this binary was built for.
    pub fn host() -> Self {
        if cfg!(windows) {
            ShellFormat::WindowsCmd
        } else {
            ShellFormat::Posix
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "posix" | "sh" => Some(ShellFormat::Posix),
            "cmd" | "windows-cmd" => Some(ShellFormat::WindowsCmd),
            _ => None,
        }
    }

    pub fn path_separator(self) -> char {
        match self {
            ShellFormat::Posix => ':',
            ShellFormat::WindowsCmd => ';',
        }
    }

    /// How the shell spells "the current value of `name`".
    pub fn variable_reference(self, name: &str) -> String {
        match self {
            ShellFormat::Posix => format!("${}", name),
            ShellFormat::WindowsCmd => format!("%{}%", name),
        }
    }

    pub fn is_variable_reference(self, value: &str) -> bool {
        match self {
            ShellFormat::Posix => value.starts_with('$'),
            ShellFormat::WindowsCmd => value.starts_with('%'),
        }
    }

    pub fn source_command(self, path: &Path) -> String {
        match self {
            ShellFormat::Posix => format!(". \"{}\"", path.display()),
            ShellFormat::WindowsCmd => format!("call \"{}\"", path.display()),
        }
    }

    pub fn unset_command(self, name: &str) -> String {
        match self {
            ShellFormat::Posix => format!("unset {}", name),
            ShellFormat::WindowsCmd => format!("set {}=", name),
        }
    }

    /// Unconditional assignment, including the export when the shell needs one.
    pub fn set_command(self, name: &str, value: &str) -> String {
        match self {
            ShellFormat::Posix => {
                format!("{}=\"{}\"\nexport {}", name, escape_posix(value), name)
            }
            ShellFormat::WindowsCmd => format!("set {}={}", name, value),
        }
    }

    /// Assignment that uses `without_inheritance` when the variable is empty in
    /// the calling shell and `with_inheritance` otherwise.
    pub fn conditional_set_command(
        self,
        name: &str,
        with_inheritance: &str,
        without_inheritance: &str,
    ) -> String {
        match self {
            ShellFormat::Posix => format!(
                "if test -z \"${name}\"; then\n  {name}=\"{without}\"\nelse\n  {name}=\"{with}\"\nfi\nexport {name}",
                name = name,
                with = escape_posix(with_inheritance),
                without = escape_posix(without_inheritance),
            ),
            ShellFormat::WindowsCmd => format!(
                "if \"%{name}%\"==\"\" (\n  set {name}={without}\n) else (\n  set {name}={with}\n)",
                name = name,
                with = with_inheritance,
                without = without_inheritance,
            ),
        }
    }
}

/// Escapes a value for use inside double quotes while keeping `$NAME`
/// references live.
fn escape_posix(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '"' | '\\' | '`') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Writes the export script: sourced-before scripts, unsets, unconditional
/// sets, inheritance-aware sets, then sourced-after scripts.
pub fn write_script<W: Write>(
    out: &mut W,
    format: ShellFormat,
    export: &ExportedEnvironment,
    source_before: &[impl AsRef<Path>],
    source_after: &[impl AsRef<Path>],
) -> io::Result<()> {
    let sep = format.path_separator();
    for path in source_before {
        writeln!(out, "{}", format.source_command(path.as_ref()))?;
    }
    for name in &export.unset {
        writeln!(out, "{}", format.unset_command(name))?;
    }
    for (name, values) in &export.set {
        let value = export.join(name, values, sep);
        writeln!(out, "{}", format.set_command(name, &value))?;
    }
    for (name, (with, without)) in &export.update {
        let with = export.join(name, with, sep);
        let without = export.join(name, without, sep);
        writeln!(
            out,
            "{}",
            format.conditional_set_command(name, &with, &without)
        )?;
    }
    for path in source_after {
        writeln!(out, "{}", format.source_command(path.as_ref()))?;
    }
    Ok(())
}

/// Computes the values a child process would get after a shell sources the
/// export script, starting from `base`. Variables the script unsets, or that
/// end up with no entries, map to `None`.
///
/// Entries are deduplicated after references are expanded, and entries of
/// path variables that do not exist on disk are dropped, so the result lines
/// up with [`Environment::resolved_environment`](crate::environment::Environment::resolved_environment).
/// An empty value in `base` counts as unset, matching `test -z`.
pub fn environment_from_export(
    export: &ExportedEnvironment,
    base: &BTreeMap<String, String>,
    format: ShellFormat,
) -> BTreeMap<String, Option<String>> {
    let sep = format.path_separator();
    let mut result = BTreeMap::new();
    for name in &export.unset {
        result.insert(name.clone(), None);
    }
    for (name, values) in &export.set {
        let value = export.join(name, values, sep);
        result.insert(name.clone(), normalize(export, name, &value, sep));
    }
    for (name, (with, without)) in &export.update {
        let inherited = base.get(name).filter(|v| !v.is_empty());
        let value = match inherited {
            Some(_) => expand_references(&export.join(name, with, sep), base, format),
            None => export.join(name, without, sep),
        };
        result.insert(name.clone(), normalize(export, name, &value, sep));
    }
    result
}

fn normalize(export: &ExportedEnvironment, name: &str, value: &str, sep: char) -> Option<String> {
    let mut entries: Vec<String> = Vec::new();
    for entry in export.split(name, value, sep) {
        if export.path_variables.contains(name) && !Path::new(entry).exists() {
            continue;
        }
        if !entries.iter().any(|e| e == entry) {
            entries.push(entry.to_string());
        }
    }
    if entries.is_empty() {
        return None;
    }
    Some(export.join(name, &entries, sep))
}

/// Replaces `$NAME` / `${NAME}` (or `%NAME%`) references with their value in `env`.
/// Unknown variables expand to the empty string.
pub fn expand_references(
    value: &str,
    env: &BTreeMap<String, String>,
    format: ShellFormat,
) -> String {
    match format {
        ShellFormat::Posix => expand_posix(value, env),
        ShellFormat::WindowsCmd => expand_cmd(value, env),
    }
}

fn expand_posix(value: &str, env: &BTreeMap<String, String>) -> String {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;
    while let Some(i) = rest.find('$') {
        out.push_str(&rest[..i]);
        let after = &rest[i + 1..];
        let (name, consumed) = if let Some(braced) = after.strip_prefix('{') {
            match braced.find('}') {
                Some(end) => (&braced[..end], end + 2),
                None => ("", 0),
            }
        } else {
            let end = after
                .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
                .unwrap_or(after.len());
            (&after[..end], end)
        };
        if name.is_empty() {
            out.push('$');
            rest = after;
            continue;
        }
        if let Some(v) = env.get(name) {
            out.push_str(v);
        }
        rest = &after[consumed..];
    }
    out.push_str(rest);
    out
}

fn expand_cmd(value: &str, env: &BTreeMap<String, String>) -> String {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;
    while let Some(i) = rest.find('%') {
        out.push_str(&rest[..i]);
        let after = &rest[i + 1..];
        match after.find('%') {
            Some(end) if end > 0 => {
                if let Some(v) = env.get(&after[..end]) {
                    out.push_str(v);
                }
                rest = &after[end + 1..];
            }
            _ => {
                out.push('%');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}
