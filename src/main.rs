mod alternates;
mod cli;
mod config;
mod environment;
mod error;
mod git;
mod importer;
mod output;
mod package;
mod patch;
mod prefix;
mod shell;
mod status;
mod subprocess;
#[cfg(test)]
mod testutil;

use std::process;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use clap_complete::CompleteEnv;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::LevelFilter;

fn init_logging() {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::WARN.into())
        .with_env_var("AUTOBUILD_LOG")
        .from_env_lossy();
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .without_time()
        .init();
}

fn main() {
    CompleteEnv::with_factory(cli::build_cli).complete();
    init_logging();

    // Children share the terminal's process group and see SIGINT themselves;
    // the handler only records it so we exit with the conventional code.
    let interrupted = Arc::new(AtomicBool::new(false));
    let i = interrupted.clone();
    let _ = ctrlc::set_handler(move || {
        i.store(true, Ordering::SeqCst);
    });

    let app = cli::build_cli();
    let matches = app.get_matches();
    let json = matches.get_flag("json");

    let paths = match config::Paths::resolve() {
        Ok(p) => p,
        Err(err) => {
            render_error(err, json);
            process::exit(1);
        }
    };

    match cli::dispatch(&matches, &paths) {
        Ok(out) => {
            let code = output::exit_code(&out);
            if let Err(err) = output::render(out, json) {
                render_error(err, json);
                process::exit(1);
            }
            if interrupted.load(Ordering::SeqCst) {
                process::exit(130);
            }
            process::exit(code);
        }
        Err(err) => {
            if interrupted.load(Ordering::SeqCst) {
                process::exit(130);
            }
            render_error(err, json);
            process::exit(1);
        }
    }
}

fn render_error(err: anyhow::Error, json: bool) {
    if json {
        let _ = serde_json::to_string_pretty(&output::ErrorOutput {
            error: format!("{:#}", err),
        })
        .map(|s| println!("{}", s));
    } else {
        eprintln!("Error: {:#}", err);
    }
}
