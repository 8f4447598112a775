use std::sync::Mutex;

use anyhow::Result;
use clap::{Arg, ArgAction, ArgMatches, Command};
use clap_complete::engine::ArgValueCandidates;

use super::completers;
use crate::alternates;
use crate::config::{PackageSetup, Paths, Project};
use crate::output::{self, ImportEntry, ImportOutput, Output};
use crate::shell::ShellFormat;

pub fn cmd() -> Command {
    Command::new("import")
        .about("Check out or update packages and apply their patches")
        .arg(
            Arg::new("packages")
                .num_args(0..)
                .help("Packages to import (default: all)")
                .add(ArgValueCandidates::new(completers::complete_packages)),
        )
        .arg(
            Arg::new("only-local")
                .long("only-local")
                .action(ArgAction::SetTrue)
                .help("Do not fetch; use the last fetched state"),
        )
        .arg(
            Arg::new("merge")
                .long("merge")
                .action(ArgAction::SetTrue)
                .help("Merge diverged branches instead of refusing"),
        )
        .arg(
            Arg::new("fallback-local")
                .long("fallback-local")
                .action(ArgAction::SetTrue)
                .help("Use the last fetched state when fetching fails"),
        )
}

pub fn run(matches: &ArgMatches, project: &Project, paths: &Paths) -> Result<Output> {
    let only_local = matches.get_flag("only-local");
    let merge = matches.get_flag("merge");
    let fallback = matches.get_flag("fallback-local");

    let setups = project.select(
        &alternates::templates_from_env(),
        &super::selected_packages(matches),
    )?;
    let env = super::build_environment(project, ShellFormat::host(), &[]).into_shared();
    let runner = super::build_runner(project, paths, env);

    let setups: Vec<PackageSetup> = setups
        .into_iter()
        .map(|mut s| {
            if merge {
                s.importer = s.importer.with_merge(true);
            }
            if fallback {
                s.importer = s.importer.with_cached_fallback(&runner);
            }
            s
        })
        .collect();

    if !setups.is_empty() {
        eprintln!("Importing {} package(s)...", setups.len());
    }
    let progress = Mutex::new(());
    let packages: Vec<ImportEntry> = std::thread::scope(|s| {
        let handles: Vec<_> = setups
            .iter()
            .map(|setup| {
                let progress = &progress;
                let runner = &runner;
                s.spawn(move || {
                    let name = setup.package.name.clone();
                    let result = setup.importer.import(runner, &setup.package, only_local);
                    let _lock = progress.lock().unwrap_or_else(|e| e.into_inner());
                    match result {
                        Ok(r) => {
                            eprintln!("  ok    {} ({})", name, output::format_action(&r.action, &r.patches));
                            ImportEntry {
                                package: name,
                                ok: true,
                                result: Some(r),
                                error: None,
                            }
                        }
                        Err(e) => {
                            eprintln!("  FAIL  {}", name);
                            ImportEntry {
                                package: name,
                                ok: false,
                                result: None,
                                error: Some(e.to_string()),
                            }
                        }
                    }
                })
            })
            .collect();

        handles
            .into_iter()
            .zip(&setups)
            .map(|(h, setup)| {
                h.join().unwrap_or_else(|_| ImportEntry {
                    package: setup.package.name.clone(),
                    ok: false,
                    result: None,
                    error: Some("import thread panicked".to_string()),
                })
            })
            .collect()
    });

    Ok(Output::Import(ImportOutput { packages }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::build_cli;
    use crate::config::Manifest;
    use crate::testutil;
    use std::collections::BTreeMap;

    fn project_for(root: &std::path::Path, url: &str, names: &[&str]) -> Project {
        let mut packages = BTreeMap::new();
        for name in names {
            packages.insert(
                name.to_string(),
                crate::config::PackageEntry {
                    url: url.to_string(),
                    branch: Some("main".to_string()),
                    ..Default::default()
                },
            );
        }
        Project {
            root: root.to_path_buf(),
            manifest: Manifest {
                source_dir: Some("src".into()),
                log_dir: Some("logs".into()),
                retry_count: 0,
                packages,
                ..Manifest::default()
            },
        }
    }

    fn sub_matches(args: &[&str]) -> ArgMatches {
        let mut full = vec!["autobuild", "import"];
        full.extend_from_slice(args);
        let m = build_cli().try_get_matches_from(full).unwrap();
        m.subcommand_matches("import").unwrap().clone()
    }

    #[test]
    fn test_imports_all_packages_concurrently() {
        let (source, _st) = testutil::create_source_repo();
        let ws = tempfile::tempdir().unwrap();
        let project = project_for(ws.path(), source.to_str().unwrap(), &["a", "lib/b"]);
        let paths = Paths::from_data_dir(&ws.path().join("data"));

        let out = run(&sub_matches(&[]), &project, &paths).unwrap();
        let Output::Import(v) = out else {
            panic!("expected import output");
        };
        assert_eq!(v.packages.len(), 2);
        assert!(v.packages.iter().all(|p| p.ok), "{:?}", v.packages.iter().map(|p| &p.error).collect::<Vec<_>>());
        assert!(ws.path().join("src/a/.git").is_dir());
        assert!(ws.path().join("src/lib/b/.git").is_dir());
        assert!(ws.path().join("logs/a-import.log").is_file());
    }

    #[test]
    fn test_failure_reported_per_package() {
        let (source, _st) = testutil::create_source_repo();
        let ws = tempfile::tempdir().unwrap();
        let mut project = project_for(ws.path(), source.to_str().unwrap(), &["good"]);
        project.manifest.packages.insert(
            "bad".to_string(),
            crate::config::PackageEntry {
                url: ws.path().join("missing").display().to_string(),
                ..Default::default()
            },
        );
        let paths = Paths::from_data_dir(&ws.path().join("data"));

        let out = run(&sub_matches(&["--only-local"]), &project, &paths).unwrap();
        assert_eq!(output::exit_code(&out), 1);
        let Output::Import(v) = out else {
            panic!("expected import output");
        };
        let bad = v.packages.iter().find(|p| p.package == "bad").unwrap();
        assert!(!bad.ok);
        assert!(bad.error.as_deref().unwrap().contains("failed during import"));
        assert!(v.packages.iter().find(|p| p.package == "good").unwrap().ok);
    }

    #[test]
    fn test_unknown_package_is_an_error() {
        let ws = tempfile::tempdir().unwrap();
        let project = project_for(ws.path(), "u", &["a"]);
        let paths = Paths::from_data_dir(&ws.path().join("data"));
        assert!(run(&sub_matches(&["nope"]), &project, &paths).is_err());
    }
}
