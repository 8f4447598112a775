use std::collections::BTreeMap;
use std::io::Write;

use anyhow::{Result, bail};
use serde::Serialize;
use tabwriter::TabWriter;

use crate::importer::{ImportResult, StatusReport, SyncAction};
use crate::patch::PatchOutcome;

// ---------------------------------------------------------------------------
// Table helper
// ---------------------------------------------------------------------------

pub struct Table {
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
    dest: Box<dyn Write>,
}

impl Table {
    pub fn new(w: Box<dyn Write>, headers: Vec<String>) -> Self {
        Table {
            headers,
            rows: Vec::new(),
            dest: w,
        }
    }

    pub fn add_row(&mut self, columns: Vec<String>) -> Result<()> {
        if columns.len() != self.headers.len() {
            bail!(
                "row has {} columns, expected {}",
                columns.len(),
                self.headers.len()
            );
        }
        self.rows.push(columns);
        Ok(())
    }

    pub fn render(&mut self) -> Result<()> {
        if self.headers.is_empty() {
            return Ok(());
        }

        let buf = render_buf(&self.headers, &self.rows)?;
        self.dest.write_all(&buf)?;
        Ok(())
    }
}

fn render_buf(headers: &[String], rows: &[Vec<String>]) -> Result<Vec<u8>> {
    let mut tw = TabWriter::new(Vec::new()).minwidth(0).padding(2);

    let upper: Vec<String> = headers.iter().map(|h| h.to_uppercase()).collect();
    writeln!(tw, "{}", upper.join("\t"))?;

    for row in rows {
        writeln!(tw, "{}", row.join("\t"))?;
    }

    tw.flush()?;
    Ok(tw.into_inner()?)
}

pub fn format_package_status(ahead: usize, behind: usize, modified: u32) -> String {
    if ahead == 0 && behind == 0 && modified == 0 {
        return "up-to-date".to_string();
    }
    let mut parts = Vec::new();
    if ahead > 0 {
        parts.push(format!("{} ahead", ahead));
    }
    if behind > 0 {
        parts.push(format!("{} behind", behind));
    }
    if modified > 0 {
        parts.push(format!("{} modified", modified));
    }
    parts.join(", ")
}

pub fn format_action(action: &SyncAction, patches: &PatchOutcome) -> String {
    let mut s = match action {
        SyncAction::Cloned => "cloned".to_string(),
        SyncAction::Created => "created local branch".to_string(),
        SyncAction::UpToDate => "up-to-date".to_string(),
        SyncAction::Ahead => "local branch is ahead".to_string(),
        SyncAction::FastForward { commits } => format!("fast-forwarded {} commit(s)", commits),
        SyncAction::Merged => "merged".to_string(),
        SyncAction::Pinned { detached: false } => "checked out pinned commit".to_string(),
        SyncAction::Pinned { detached: true } => "detached at pinned commit".to_string(),
    };
    if patches.removed > 0 {
        s.push_str(&format!(", removed {} patch(es)", patches.removed));
    }
    if patches.applied > 0 {
        s.push_str(&format!(", applied {} patch(es)", patches.applied));
    }
    s
}

pub fn format_error(err: &dyn std::fmt::Display) -> String {
    format!("ERROR: {}", err)
}

// ---------------------------------------------------------------------------
// JSON-serializable output types
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct ImportOutput {
    pub packages: Vec<ImportEntry>,
}

#[derive(Serialize)]
pub struct ImportEntry {
    pub package: String,
    pub ok: bool,
    #[serde(flatten)]
    pub result: Option<ImportResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Serialize)]
pub struct StatusOutput {
    pub packages: Vec<StatusEntry>,
}

#[derive(Serialize)]
pub struct StatusEntry {
    pub package: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report: Option<StatusReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Serialize)]
pub struct EnvOutput {
    pub format: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub script: Option<String>,
    /// `None` values are variables the environment removes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved: Option<BTreeMap<String, Option<String>>>,
}

#[derive(Serialize)]
pub struct ErrorOutput {
    pub error: String,
}

// ---------------------------------------------------------------------------
// Output enum returned by all command handlers
// ---------------------------------------------------------------------------

pub enum Output {
    Import(ImportOutput),
    Status(StatusOutput),
    Env(EnvOutput),
    None,
}

// ---------------------------------------------------------------------------
// Central render function
// ---------------------------------------------------------------------------

pub fn render(output: Output, json: bool) -> Result<()> {
    if json {
        return match output {
            Output::None => Ok(()),
            Output::Import(v) => print_json(&v),
            Output::Status(v) => print_json(&v),
            Output::Env(v) => print_json(&v),
        };
    }
    match output {
        Output::None => Ok(()),
        Output::Import(v) => render_import_text(v),
        Output::Status(v) => render_status_table(v),
        Output::Env(v) => render_env_text(v),
    }
}

/// Returns non-zero exit code for batch outputs with failures.
pub fn exit_code(output: &Output) -> i32 {
    match output {
        Output::Import(v) if v.packages.iter().any(|p| !p.ok) => 1,
        Output::Status(v) if v.packages.iter().any(|p| p.error.is_some()) => 1,
        _ => 0,
    }
}

fn print_json(value: &impl Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

// ---------------------------------------------------------------------------
// Text/table renderers
// ---------------------------------------------------------------------------

fn render_import_text(v: ImportOutput) -> Result<()> {
    if v.packages.is_empty() {
        println!("No packages to import.");
        return Ok(());
    }
    let total = v.packages.len();
    let failed: Vec<&ImportEntry> = v.packages.iter().filter(|p| !p.ok).collect();
    for p in &failed {
        if let Some(e) = &p.error {
            eprintln!("{}", format_error(e));
        }
    }
    if failed.is_empty() {
        println!("Imported {} package(s)", total);
    } else {
        println!(
            "Imported {} package(s), {} failed",
            total - failed.len(),
            failed.len()
        );
    }
    Ok(())
}

fn render_status_table(v: StatusOutput) -> Result<()> {
    if v.packages.is_empty() {
        println!("No packages defined.");
        return Ok(());
    }
    let mut table = Table::new(
        Box::new(std::io::stdout()),
        vec![
            "Package".to_string(),
            "Branch".to_string(),
            "Status".to_string(),
        ],
    );
    for entry in &v.packages {
        let (branch, status) = match (&entry.report, &entry.error) {
            (_, Some(e)) => (String::new(), format_error(e)),
            (Some(r), None) => (
                r.branch.clone().unwrap_or_else(|| "(detached)".to_string()),
                format_package_status(
                    r.local_commits.len(),
                    r.remote_commits.len(),
                    r.uncommitted,
                ),
            ),
            (None, None) => (String::new(), String::new()),
        };
        table.add_row(vec![entry.package.clone(), branch, status])?;
    }
    table.render()
}

fn render_env_text(v: EnvOutput) -> Result<()> {
    if let Some(script) = &v.script {
        print!("{}", script);
    }
    if let Some(resolved) = &v.resolved {
        for (name, value) in resolved {
            match value {
                Some(val) => println!("{}={}", name, val),
                None => println!("{} (unset)", name),
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
