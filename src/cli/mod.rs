pub mod completers;
pub mod env;
pub mod import;
pub mod status;

use std::path::PathBuf;

use anyhow::{Result, bail};
use clap::{Arg, ArgAction, ArgMatches, Command, value_parser};

use crate::config::{MANIFEST_FILE, Paths, Project};
use crate::environment::{Environment, SharedEnvironment};
use crate::output::Output;
use crate::prefix::PrefixScanner;
use crate::shell::ShellFormat;
use crate::subprocess::Runner;

pub fn build_cli() -> Command {
    Command::new("autobuild")
        .about("Keep package checkouts in sync and compose their build environment")
        .version(env!("AUTOBUILD_VERSION_STRING"))
        .subcommand_required(true)
        .arg(
            Arg::new("json")
                .long("json")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Output as JSON"),
        )
        .arg(
            Arg::new("config")
                .long("config")
                .global(true)
                .value_name("FILE")
                .value_parser(value_parser!(PathBuf))
                .help("Manifest file (default: ./autobuild.yaml)"),
        )
        .subcommand(import::cmd())
        .subcommand(status::cmd())
        .subcommand(env::cmd())
}

pub fn manifest_path(matches: &ArgMatches) -> PathBuf {
    matches
        .get_one::<PathBuf>("config")
        .cloned()
        .unwrap_or_else(|| PathBuf::from(MANIFEST_FILE))
}

pub fn dispatch(matches: &ArgMatches, paths: &Paths) -> Result<Output> {
    let project = Project::load(&manifest_path(matches))?;
    match matches.subcommand() {
        Some(("import", m)) => import::run(m, &project, paths),
        Some(("status", m)) => status::run(m, &project, paths),
        Some(("env", m)) => env::run(m, &project),
        Some((other, _)) => bail!("unknown command {:?}", other),
        None => bail!("no command given"),
    }
}

/// The build environment: the manifest's prefixes plus `extra_prefixes`,
/// and its scripts to source.
pub(crate) fn build_environment(
    project: &Project,
    format: ShellFormat,
    extra_prefixes: &[PathBuf],
) -> Environment {
    let mut env = Environment::new(format);
    let scanner = PrefixScanner::new();
    let prefixes = project
        .manifest
        .prefixes
        .iter()
        .map(|p| project.resolve(p))
        .chain(extra_prefixes.iter().cloned());
    for prefix in prefixes {
        env.add_prefix(&scanner, &prefix, None);
    }
    for script in &project.manifest.source_before {
        env.source_before(project.resolve(script));
    }
    for script in &project.manifest.source_after {
        env.source_after(project.resolve(script));
    }
    env
}

pub(crate) fn build_runner(project: &Project, paths: &Paths, env: SharedEnvironment) -> Runner {
    Runner::new(project.runner_settings(paths), env)
}

pub(crate) fn selected_packages(matches: &ArgMatches) -> Vec<String> {
    matches
        .get_many::<String>("packages")
        .map(|v| v.cloned().collect())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Manifest;
    use std::fs;

    #[test]
    fn test_global_flags_after_subcommand() {
        let m = build_cli()
            .try_get_matches_from(["autobuild", "status", "--json", "--config", "/x/a.yaml"])
            .unwrap();
        assert!(m.get_flag("json"));
        assert_eq!(manifest_path(&m), PathBuf::from("/x/a.yaml"));

        let m = build_cli().try_get_matches_from(["autobuild", "env"]).unwrap();
        assert_eq!(manifest_path(&m), PathBuf::from(MANIFEST_FILE));
    }

    #[test]
    fn test_subcommand_required() {
        assert!(build_cli().try_get_matches_from(["autobuild"]).is_err());
    }

    #[test]
    fn test_selected_packages() {
        let m = build_cli()
            .try_get_matches_from(["autobuild", "import", "a", "b/c", "--only-local"])
            .unwrap();
        let (_, sub) = m.subcommand().unwrap();
        assert_eq!(selected_packages(sub), vec!["a", "b/c"]);
    }

    #[test]
    fn test_build_environment_uses_manifest_prefixes() {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir_all(tmp.path().join("install").join("bin")).unwrap();
        fs::create_dir_all(tmp.path().join("extra").join("bin")).unwrap();
        let project = Project {
            root: tmp.path().to_path_buf(),
            manifest: Manifest {
                prefixes: vec![PathBuf::from("install")],
                source_after: vec![PathBuf::from("after.sh")],
                ..Manifest::default()
            },
        };
        let env = build_environment(&project, ShellFormat::Posix, &[tmp.path().join("extra")]);
        let path = env.value("PATH", crate::environment::Inheritance::Ignore).unwrap();
        assert_eq!(
            path,
            vec![
                tmp.path().join("extra").join("bin").display().to_string(),
                tmp.path().join("install").join("bin").display().to_string(),
            ]
        );

        let mut script = Vec::new();
        env.export_shell(&mut script).unwrap();
        let script = String::from_utf8(script).unwrap();
        assert!(script.ends_with(&format!(". \"{}\"\n", tmp.path().join("after.sh").display())));
    }
}
