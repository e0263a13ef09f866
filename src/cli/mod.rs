//! CLI argument parsing using clap 4.x derive macros

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Compose command/event kernels into routable trees
///
/// Runs code through a composite of demo kernels, optionally placed behind
/// an in-process proxy/host pair, or serves that composite over stdio.
#[derive(Parser, Debug)]
#[command(name = "kernelmesh")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
#[command(disable_version_flag = true)]
pub struct Cli {
    /// The command to execute
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Configuration file (defaults to the user config directory)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log at debug level unless RUST_LOG is set
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Print version information
    #[arg(long)]
    pub version: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Submit code to the kernel tree
    Submit {
        /// Code to run; `#!name` lines select a kernel
        #[arg(num_args = 1.., required = true)]
        code: Vec<String>,

        /// Kernel name or alias to send the code to
        #[arg(short, long)]
        target: Option<String>,

        /// Reach the kernels through a proxy and an in-process host
        #[arg(short, long)]
        remote: bool,

        /// Print routing slips of the command and its events
        #[arg(long)]
        slips: bool,
    },

    /// List the kernels of the tree
    Info {
        /// Reach the kernels through a proxy and an in-process host
        #[arg(short, long)]
        remote: bool,

        /// Print kernel infos as JSON
        #[arg(long)]
        json: bool,
    },

    /// Serve the demo kernels over stdin/stdout, one JSON message per line
    Serve {
        /// Uri the served composite is hosted at
        #[arg(long, default_value = "kernel://remote/")]
        host_uri: String,
    },

    /// Manage configuration
    Config {
        #[command(subcommand)]
        cmd: Option<ConfigCommand>,
    },
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Print the effective configuration
    Show,
    /// Print the configuration file path
    Path,
    /// Write the default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_submit_joins_code_and_reads_flags() {
        let cli = Cli::parse_from(["kernelmesh", "submit", "--target", "sum", "--remote", "1", "+", "2"]);
        match cli.command {
            Some(Commands::Submit {
                code,
                target,
                remote,
                slips,
            }) => {
                assert_eq!(code, vec!["1", "+", "2"]);
                assert_eq!(target.as_deref(), Some("sum"));
                assert!(remote);
                assert!(!slips);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
