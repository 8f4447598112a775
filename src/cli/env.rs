use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::builder::PossibleValuesParser;
use clap::{Arg, ArgAction, ArgMatches, Command, value_parser};

use crate::config::Project;
use crate::output::{EnvOutput, Output};
use crate::shell::ShellFormat;

pub fn cmd() -> Command {
    Command::new("env")
        .about("Print the build environment as a shell script")
        .arg(
            Arg::new("prefix")
                .long("prefix")
                .short('p')
                .action(ArgAction::Append)
                .value_name("DIR")
                .value_parser(value_parser!(PathBuf))
                .help("Additional installation prefix (repeatable)"),
        )
        .arg(
            Arg::new("format")
                .long("format")
                .value_parser(PossibleValuesParser::new(["posix", "sh", "cmd", "windows-cmd"]))
                .help("Shell syntax of the script (default: the host's)"),
        )
        .arg(
            Arg::new("resolved")
                .long("resolved")
                .action(ArgAction::SetTrue)
                .help("Print the values processes would see instead of a script"),
        )
}

fn format_name(format: ShellFormat) -> &'static str {
    match format {
        ShellFormat::Posix => "posix",
        ShellFormat::WindowsCmd => "cmd",
    }
}

pub fn run(matches: &ArgMatches, project: &Project) -> Result<Output> {
    let format = match matches.get_one::<String>("format") {
        Some(name) => match ShellFormat::parse(name) {
            Some(f) => f,
            None => bail!("unknown shell format {:?}", name),
        },
        None => ShellFormat::host(),
    };
    let extra: Vec<PathBuf> = matches
        .get_many::<PathBuf>("prefix")
        .map(|v| v.cloned().collect())
        .unwrap_or_default();

    let env = super::build_environment(project, format, &extra);
    if matches.get_flag("resolved") {
        return Ok(Output::Env(EnvOutput {
            format: format_name(format).to_string(),
            script: None,
            resolved: Some(env.resolved_environment()),
        }));
    }

    let mut buf = Vec::new();
    env.export_shell(&mut buf)
        .context("generating environment script")?;
    let script = String::from_utf8(buf).context("environment script is not valid UTF-8")?;
    Ok(Output::Env(EnvOutput {
        format: format_name(format).to_string(),
        script: Some(script),
        resolved: None,
    }))
}
