use clap::Parser;
use std::path::PathBuf;

/// Parsed command-line arguments.
#[derive(Parser, Debug)]
#[clap(name = env!("CARGO_PKG_NAME"), version, about)]
pub struct Args {
    /// Execute the provided command and then exit.
    #[arg(short = 'c', value_name = "COMMAND")]
    pub command: Option<String>,

    /// Script to run; with `-c` this becomes `$0`.
    #[clap(allow_hyphen_values = true)]
    pub script: Option<PathBuf>,

    /// Positional parameters for the script or command.
    #[clap(allow_hyphen_values = true, num_args = 1..)]
    pub args: Vec<String>,
}
