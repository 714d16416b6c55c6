use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "procsup-ctl")]
#[command(version, about = "Spawn and supervise child processes", long_about = None)]
#[command(after_help = "EXAMPLES:
    # Run a program and relay its output
    procsup-ctl run -- ls -l /tmp

    # Feed stdin, stop after 5 seconds, print a JSON report
    procsup-ctl run --input 'hello' --timeout 5 --json -- cat

    # Run on a pseudo-terminal as another user
    sudo procsup-ctl run --pty --uid 1000 --gid 1000 -- sh -c 'tty; id'

    # Resolve a program name, report backend capabilities
    procsup-ctl which python3
    procsup-ctl check
")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Show verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Spawn a program and supervise it until it ends
    Run(RunArgs),

    /// Resolve a program name along PATH
    Which {
        /// Name to look up
        name: String,

        /// Print every match, not just the first
        #[arg(short, long)]
        all: bool,
    },

    /// Print backend capabilities and the current identity
    Check,
}

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Run the program on a pseudo-terminal
    #[arg(long)]
    pub pty: bool,

    /// Working directory of the program
    #[arg(long, value_name = "DIR")]
    pub cwd: Option<PathBuf>,

    /// Run as this user id
    #[arg(long, value_name = "UID")]
    pub uid: Option<u32>,

    /// Run with this group id
    #[arg(long, value_name = "GID")]
    pub gid: Option<u32>,

    /// Set an environment variable (repeatable)
    #[arg(short = 'e', long = "env", value_name = "KEY=VALUE", value_parser = parse_env)]
    pub env: Vec<(String, String)>,

    /// Start from an empty environment instead of this one
    #[arg(long)]
    pub clear_env: bool,

    /// Text written to the program's stdin before it is closed
    #[arg(short, long, value_name = "TEXT")]
    pub input: Option<String>,

    /// Terminate the program after this many seconds
    #[arg(short, long, value_name = "SECONDS")]
    pub timeout: Option<u64>,

    /// Seconds between TERM and KILL once the timeout fires
    #[arg(long, value_name = "SECONDS", default_value_t = 2)]
    pub grace: u64,

    /// Print a JSON report instead of relaying output
    #[arg(long)]
    pub json: bool,

    /// Program and its arguments
    #[arg(
        value_name = "PROGRAM",
        required = true,
        trailing_var_arg = true,
        allow_hyphen_values = true
    )]
    pub command: Vec<String>,
}

fn parse_env(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, _)) if key.is_empty() => Err(format!("empty variable name in {:?}", raw)),
        Some((key, value)) => Ok((key.to_string(), value.to_string())),
        None => Err(format!("expected KEY=VALUE, got {:?}", raw)),
    }
}
