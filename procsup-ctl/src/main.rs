//! procsup-ctl - spawn and supervise child processes from the shell

mod cli;
mod commands;
mod logging;
mod runner;

use clap::Parser;
use cli::{Cli, Commands};
use commands::{check_backend, which};
use console::style;

fn main() {
    let cli = Cli::parse();

    logging::init_logger(cli.verbose);

    match cli.command {
        Commands::Run(args) => match runner::run(args) {
            Ok(code) => std::process::exit(code),
            Err(e) => {
                eprintln!("{} {}", style("error:").red().bold(), e);
                std::process::exit(1);
            }
        },
        Commands::Which { name, all } => {
            if !which(&name, all) {
                std::process::exit(1);
            }
        }
        Commands::Check => check_backend(),
    }
}
