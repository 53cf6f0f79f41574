mod cli;
mod commands;
mod config;
mod ui;

use anyhow::Result;
use clap::{CommandFactory, Parser};
use clap_complete::generate;
use cli::{Cli, Command};
use std::io;

/// Global context for the application
pub struct Context {
    pub verbose: u8,
    pub quiet: bool,
    pub json: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging based on verbosity
    let log_level = match cli.verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };

    env_logger::Builder::new()
        .filter_level(if cli.quiet {
            log::LevelFilter::Error
        } else {
            log_level
        })
        .format_timestamp(None)
        .init();

    let ctx = Context {
        verbose: cli.verbose,
        quiet: cli.quiet,
        json: cli.json,
    };

    match cli.command {
        Command::Apply(args) => commands::apply::apply(&ctx, &args),
        Command::Plan(args) => commands::apply::plan(&ctx, &args),
        Command::List => commands::query::list(&ctx),
        Command::Exists { distribution, path } => {
            commands::query::exists(&ctx, &distribution, &path)
        }
        Command::Slurp {
            distribution,
            path,
            raw,
        } => commands::query::slurp(&ctx, &distribution, &path, raw),
        Command::Completions { shell } => {
            let mut cmd = Cli::command();
            generate(shell, &mut cmd, "wslctl", &mut io::stdout());
            Ok(())
        }
    }
}
