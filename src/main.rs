mod bootstrap;
mod cli;
mod commands;
mod config;
mod files;
mod flags;
mod model;
mod runner;
mod systemd;
mod tasks;
mod ui;

use anyhow::Result;
use clap::{CommandFactory, Parser};
use clap_complete::generate;
use cli::{Cli, Command};
use std::io;
use std::path::PathBuf;

/// Global context for the application
pub struct Context {
    pub verbose: u8,
    pub quiet: bool,
    pub config_path: PathBuf,
    pub jobs: Option<usize>,
}

fn main() {
    if let Err(e) = run() {
        ui::error(&format!("{e:#}"));
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();

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
        config_path: cli.config.unwrap_or_else(config::default_config_path),
        jobs: cli.jobs,
    };

    match cli.command {
        Command::Apply => commands::apply::run(&ctx),
        Command::Plan(args) => commands::plan::run(&ctx, &args),
        Command::CloudInit(args) => commands::cloud_init::run(&ctx, &args),
        Command::Flags { component } => commands::flags::run(&ctx, component),
        Command::Completions { shell } => {
            let mut cmd = Cli::command();
            generate(shell, &mut cmd, "nodeup", &mut io::stdout());
            Ok(())
        }
    }
}
