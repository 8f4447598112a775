use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};

use chrono::Local;
use tracing::{debug, warn};

use crate::environment::SharedEnvironment;
use crate::error::CommandFailed;

/// How many trailing output lines a [`CommandFailed`] carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TailLines {
    Count(usize),
    All,
}

impl Default for TailLines {
    fn default() -> Self {
        TailLines::Count(10)
    }
}

impl TailLines {
    /// `0` means "everything".
    pub fn from_count(n: usize) -> Self {
        if n == 0 { TailLines::All } else { TailLines::Count(n) }
    }

    fn apply(self, lines: &[String]) -> Vec<String> {
        match self {
            TailLines::All => lines.to_vec(),
            TailLines::Count(n) => lines[lines.len().saturating_sub(n)..].to_vec(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunnerSettings {
    pub log_dir: PathBuf,
    /// Extra attempts for invocations flagged as retryable.
    pub retry_count: u32,
    pub tail: TailLines,
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions<'a> {
    pub working_dir: Option<&'a Path>,
    pub retry: bool,
}

/// Outcome of a command whose exit status 1 is an expected answer.
#[derive(Debug, Clone, PartialEq)]
pub enum Probe {
    Success(Vec<String>),
    /// The command exited with status 1.
    NotFound,
}

/// Runs external commands in the build environment, logging each invocation
/// to a per-package, per-phase log file.
#[derive(Clone)]
pub struct Runner {
    settings: RunnerSettings,
    env: SharedEnvironment,
}

impl Runner {
    pub fn new(settings: RunnerSettings, env: SharedEnvironment) -> Self {
        Runner { settings, env }
    }

    pub fn settings(&self) -> &RunnerSettings {
        &self.settings
    }

    pub fn environment(&self) -> &SharedEnvironment {
        &self.env
    }

    pub fn log_file(&self, package: &str, phase: &str) -> PathBuf {
        self.settings
            .log_dir
            .join(format!("{}-{}.log", package, phase))
    }

    /// Runs `program` and returns its stdout lines, failing on any non-zero exit.
    pub fn run(
        &self,
        package: &str,
        phase: &str,
        program: &str,
        args: &[&str],
        opts: &RunOptions<'_>,
    ) -> Result<Vec<String>, CommandFailed> {
        let attempts = if opts.retry {
            self.settings.retry_count + 1
        } else {
            1
        };
        let mut attempt = 1;
        loop {
            let (output, lines, log_file) = self.execute(package, phase, program, args, opts)?;
            if output.status.success() {
                return Ok(lines);
            }
            let failure = self.failure(program, args, &output, log_file);
            if attempt >= attempts {
                return Err(failure);
            }
            warn!(
                package,
                attempt,
                "{} failed, retrying ({} attempt(s) left)",
                failure.command,
                attempts - attempt
            );
            attempt += 1;
        }
    }

    /// Like [`run`](Self::run), but exit status 1 yields [`Probe::NotFound`]
    /// instead of an error.
    pub fn probe(
        &self,
        package: &str,
        phase: &str,
        program: &str,
        args: &[&str],
        opts: &RunOptions<'_>,
    ) -> Result<Probe, CommandFailed> {
        let (output, lines, log_file) = self.execute(package, phase, program, args, opts)?;
        match output.status.code() {
            Some(0) => Ok(Probe::Success(lines)),
            Some(1) => Ok(Probe::NotFound),
            _ => Err(self.failure(program, args, &output, log_file)),
        }
    }

    fn execute(
        &self,
        package: &str,
        phase: &str,
        program: &str,
        args: &[&str],
        opts: &RunOptions<'_>,
    ) -> Result<(Output, Vec<String>, PathBuf), CommandFailed> {
        let command_line = command_line(program, args);
        let log_file = self.log_file(package, phase);
        debug!(package, phase, dir = ?opts.working_dir, "running {}", command_line);

        let mut cmd = Command::new(program);
        cmd.args(args).stdin(Stdio::null());
        if let Some(dir) = opts.working_dir {
            cmd.current_dir(dir);
        }
        let resolved = self
            .env
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .resolved_environment();
        for (name, value) in &resolved {
            match value {
                Some(v) => cmd.env(name, v),
                None => cmd.env_remove(name),
            };
        }

        let output = cmd.output().map_err(|e| CommandFailed {
            command: command_line.clone(),
            log_file: log_file.clone(),
            status: None,
            tail: vec![format!("cannot start {}: {}", program, e)],
        })?;

        let lines: Vec<String> = String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(String::from)
            .collect();
        if let Err(e) = append_log(&log_file, &command_line, opts.working_dir, &output) {
            warn!(log = %log_file.display(), "cannot write log file: {}", e);
        }
        Ok((output, lines, log_file))
    }

    fn failure(&self, program: &str, args: &[&str], output: &Output, log_file: PathBuf) -> CommandFailed {
        let mut all: Vec<String> = String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(String::from)
            .collect();
        all.extend(
            String::from_utf8_lossy(&output.stderr)
                .lines()
                .map(String::from),
        );
        CommandFailed {
            command: command_line(program, args),
            log_file,
            status: output.status.code(),
            tail: self.settings.tail.apply(&all),
        }
    }
}

fn command_line(program: &str, args: &[&str]) -> String {
    let mut s = program.to_string();
    for a in args {
        s.push(' ');
        s.push_str(a);
    }
    s
}

fn append_log(
    log_file: &Path,
    command_line: &str,
    dir: Option<&Path>,
    output: &Output,
) -> std::io::Result<()> {
    if let Some(parent) = log_file.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut f = OpenOptions::new().create(true).append(true).open(log_file)?;
    writeln!(f, "{}: running", Local::now().format("%Y-%m-%d %H:%M:%S"))?;
    writeln!(f, "    {}", command_line)?;
    if let Some(d) = dir {
        writeln!(f, "in directory {}", d.display())?;
    }
    f.write_all(&output.stdout)?;
    f.write_all(&output.stderr)?;
    writeln!(f, "exited with {}", output.status)?;
    writeln!(f)?;
    Ok(())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::environment::Environment;
    use crate::shell::ShellFormat;
    use std::collections::BTreeMap;

    fn runner(log_dir: &Path, retry_count: u32, tail: TailLines) -> Runner {
        let env = Environment::with_ambient(ShellFormat::Posix, BTreeMap::new()).into_shared();
        Runner::new(
            RunnerSettings {
                log_dir: log_dir.to_path_buf(),
                retry_count,
                tail,
            },
            env,
        )
    }

    #[test]
    fn test_run_returns_stdout_lines_and_logs() {
        let tmp = tempfile::tempdir().unwrap();
        let r = runner(tmp.path(), 0, TailLines::default());
        let lines = r
            .run("pkg", "import", "sh", &["-c", "echo one; echo two"], &RunOptions::default())
            .unwrap();
        assert_eq!(lines, vec!["one".to_string(), "two".to_string()]);

        let log = fs::read_to_string(tmp.path().join("pkg-import.log")).unwrap();
        assert!(log.contains("sh -c echo one; echo two"));
        assert!(log.contains("one\ntwo\n"));
    }

    #[test]
    fn test_log_file_for_nested_package_name() {
        let tmp = tempfile::tempdir().unwrap();
        let r = runner(tmp.path(), 0, TailLines::default());
        r.run("drivers/foo", "patch", "true", &[], &RunOptions::default())
            .unwrap();
        assert!(tmp.path().join("drivers").join("foo-patch.log").is_file());
    }

    #[test]
    fn test_failure_carries_status_and_tail() {
        let tmp = tempfile::tempdir().unwrap();
        let r = runner(tmp.path(), 0, TailLines::Count(2));
        let err = r
            .run(
                "pkg",
                "import",
                "sh",
                &["-c", "echo a; echo b; echo c >&2; exit 3"],
                &RunOptions::default(),
            )
            .unwrap_err();
        assert_eq!(err.status, Some(3));
        assert_eq!(err.tail, vec!["b".to_string(), "c".to_string()]);
        assert_eq!(err.log_file, tmp.path().join("pkg-import.log"));
    }

    #[test]
    fn test_retry_reattempts_until_success() {
        let tmp = tempfile::tempdir().unwrap();
        let counter = tmp.path().join("count");
        let script = format!(
            "echo x >> {0}; test $(wc -l < {0}) -ge 3",
            counter.display()
        );
        let r = runner(tmp.path(), 2, TailLines::default());
        r.run(
            "pkg",
            "import",
            "sh",
            &["-c", &script],
            &RunOptions {
                working_dir: None,
                retry: true,
            },
        )
        .unwrap();
        assert_eq!(fs::read_to_string(&counter).unwrap().lines().count(), 3);

        fs::remove_file(&counter).unwrap();
        let r = runner(tmp.path(), 1, TailLines::default());
        assert!(
            r.run(
                "pkg",
                "import",
                "sh",
                &["-c", &script],
                &RunOptions {
                    working_dir: None,
                    retry: true,
                },
            )
            .is_err()
        );
        assert_eq!(fs::read_to_string(&counter).unwrap().lines().count(), 2);
    }

    #[test]
    fn test_probe_distinguishes_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let r = runner(tmp.path(), 0, TailLines::default());
        let opts = RunOptions::default();
        assert_eq!(
            r.probe("p", "status", "sh", &["-c", "echo hit"], &opts).unwrap(),
            Probe::Success(vec!["hit".to_string()])
        );
        assert_eq!(
            r.probe("p", "status", "sh", &["-c", "exit 1"], &opts).unwrap(),
            Probe::NotFound
        );
        let err = r
            .probe("p", "status", "sh", &["-c", "exit 128"], &opts)
            .unwrap_err();
        assert_eq!(err.status, Some(128));
    }

    #[test]
    fn test_environment_applied_to_child() {
        let tmp = tempfile::tempdir().unwrap();
        let mut ambient = BTreeMap::new();
        ambient.insert("PATH".to_string(), std::env::var("PATH").unwrap_or_default());
        let mut env = Environment::with_ambient(ShellFormat::Posix, ambient);
        env.set("AUTOBUILD_RUNNER_TEST", &["a", "b"]);
        env.unset("HOME");
        let r = Runner::new(
            RunnerSettings {
                log_dir: tmp.path().to_path_buf(),
                retry_count: 0,
                tail: TailLines::default(),
            },
            env.into_shared(),
        );
        let lines = r
            .run(
                "p",
                "import",
                "sh",
                &["-c", "echo \"$AUTOBUILD_RUNNER_TEST|${HOME-unset}\""],
                &RunOptions::default(),
            )
            .unwrap();
        assert_eq!(lines, vec!["a:b|unset".to_string()]);
    }

    #[test]
    fn test_tail_lines() {
        let lines: Vec<String> = (1..=5).map(|i| i.to_string()).collect();
        assert_eq!(TailLines::Count(2).apply(&lines), vec!["4", "5"]);
        assert_eq!(TailLines::Count(10).apply(&lines).len(), 5);
        assert_eq!(TailLines::All.apply(&lines).len(), 5);
        assert_eq!(TailLines::from_count(0), TailLines::All);
    }
}
