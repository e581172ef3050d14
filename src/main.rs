use anyhow::{Context, Result};
use clap::CommandFactory;
use clap_complete::generate;
use log::LevelFilter;
use simplelog::{ColorChoice, Config, TermLogger, TerminalMode};

use butaner::args::{self, Action, Options};
use butaner::cli;

fn main() {
    match run() {
        Ok(success) if success => std::process::exit(0),
        Ok(_) => std::process::exit(1),
        Err(e) => {
            display_error(e);
            std::process::exit(1);
        }
    }
}

fn display_error(error: anyhow::Error) {
    let mut chain = error.chain();
    let mut error_message = format!("Failed to {}\nCaused by:\n", chain.next().unwrap());

    for e in chain {
        error_message.push_str(&format!("    {}\n", e));
    }
    // Remove last \n
    error_message.pop();

    log::error!("{}", error_message);
}

/// Returns true if program should exit with success status
fn run() -> Result<bool> {
    let opt = args::get_options();

    let level = if opt.quiet {
        LevelFilter::Error
    } else {
        match opt.verbosity {
            0 => LevelFilter::Info,
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    };
    TermLogger::init(
        level,
        Config::default(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    )
    .context("initialize logging")?;

    log::trace!("Loaded options: {:#?}", opt);

    match opt.action.unwrap_or_default() {
        action @ (Action::Build | Action::Ignition | Action::Reconciler) => {
            cli::run(&opt, action).context("build artifacts")
        }
        Action::GenCompletions { shell } => {
            generate(
                shell,
                &mut Options::command(),
                "butaner",
                &mut std::io::stdout(),
            );
            Ok(true)
        }
    }
}
