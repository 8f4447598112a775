use anyhow::Result;
use clap::{Arg, ArgAction, ArgMatches, Command};
use clap_complete::engine::ArgValueCandidates;

use super::completers;
use crate::alternates;
use crate::config::{Paths, Project};
use crate::output::{Output, StatusEntry, StatusOutput};
use crate::shell::ShellFormat;

pub fn cmd() -> Command {
    Command::new("status")
        .about("Compare package checkouts with their remotes")
        .arg(
            Arg::new("packages")
                .num_args(0..)
                .help("Packages to inspect (default: all)")
                .add(ArgValueCandidates::new(completers::complete_packages)),
        )
        .arg(
            Arg::new("only-local")
                .long("only-local")
                .action(ArgAction::SetTrue)
                .help("Compare against the last fetched state without fetching"),
        )
}

pub fn run(matches: &ArgMatches, project: &Project, paths: &Paths) -> Result<Output> {
    let only_local = matches.get_flag("only-local");
    let setups = project.select(
        &alternates::templates_from_env(),
        &super::selected_packages(matches),
    )?;
    let env = super::build_environment(project, ShellFormat::host(), &[]).into_shared();
    let runner = super::build_runner(project, paths, env);

    let packages = setups
        .iter()
        .map(|setup| {
            let name = setup.package.name.clone();
            if !setup.package.importdir.exists() {
                return StatusEntry {
                    package: name,
                    report: None,
                    error: Some("not checked out".to_string()),
                };
            }
            match setup.importer.status(&runner, &setup.package, only_local) {
                Ok(report) => StatusEntry {
                    package: name,
                    report: Some(report),
                    error: None,
                },
                Err(e) => StatusEntry {
                    package: name,
                    report: None,
                    error: Some(e.to_string()),
                },
            }
        })
        .collect();

    Ok(Output::Status(StatusOutput { packages }))
}
