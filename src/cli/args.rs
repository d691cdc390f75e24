//! CLI argument definitions using clap derive

use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// blobdir - read-through cache over a remote object store
///
/// Serves remote objects from a local cache that is refreshed when stale,
/// and coordinates writers with remote lease locks.
#[derive(Parser, Debug)]
#[command(name = "blobdir")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Increase verbosity (-v info, -vv debug)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    /// Configuration file path
    #[arg(short, long, global = true, env = "BLOBDIR_CONFIG")]
    pub config: Option<PathBuf>,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Publish a local file to the store
    Put(PutArgs),

    /// Print an object through the cache
    Cat(CatArgs),

    /// Show cache state of an object
    Stat(StatArgs),

    /// Obtain, probe or break a lease lock
    Lock(LockArgs),

    /// Show or edit configuration
    Config(ConfigArgs),
}

/// Arguments for the put command
#[derive(Parser, Debug)]
pub struct PutArgs {
    /// File to publish
    pub file: PathBuf,

    /// Object name (defaults to the file name)
    #[arg(short, long)]
    pub name: Option<String>,
}

/// Arguments for the cat command
#[derive(Parser, Debug)]
pub struct CatArgs {
    /// Object name
    pub name: String,
}

/// Arguments for the stat command
#[derive(Parser, Debug)]
pub struct StatArgs {
    /// Object name
    pub name: String,

    /// Output format
    #[arg(short, long, default_value = "table")]
    pub format: OutputFormat,
}

/// Arguments for the lock command
#[derive(Parser, Debug)]
pub struct LockArgs {
    #[command(subcommand)]
    pub action: LockAction,
}

/// Lock subcommands
#[derive(Subcommand, Debug)]
pub enum LockAction {
    /// Obtain the lock, hold it while renewing, then release
    Obtain {
        /// Lock object name
        name: String,

        /// Seconds to hold the lock
        #[arg(long, default_value = "0")]
        hold: u64,

        /// Keep retrying for up to this many seconds
        #[arg(long, default_value = "0")]
        wait: u64,
    },

    /// Check whether someone holds the lock
    Probe {
        /// Lock object name
        name: String,
    },

    /// Break any lease on the lock
    Break {
        /// Lock object name
        name: String,
    },
}

/// Arguments for the config command
#[derive(Parser, Debug)]
pub struct ConfigArgs {
    /// Subcommand for config
    #[command(subcommand)]
    pub action: Option<ConfigAction>,
}

/// Config subcommands
#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Show current configuration
    Show,

    /// Show configuration file path
    Path,

    /// Initialize default configuration
    Init {
        /// Overwrite existing configuration
        #[arg(short, long)]
        force: bool,
    },

    /// Set a configuration value
    Set {
        /// Configuration key (e.g., cache.chunk_size)
        key: String,
        /// Value to set
        value: String,
    },
}

/// Output format for the stat command
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable table
    Table,
    /// JSON output
    Json,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_put() {
        let cli = Cli::parse_from(["blobdir", "put", "segments.gen", "--name", "seg"]);
        match cli.command {
            Commands::Put(args) => {
                assert_eq!(args.file, PathBuf::from("segments.gen"));
                assert_eq!(args.name.as_deref(), Some("seg"));
            }
            _ => panic!("expected Put command"),
        }
    }

    #[test]
    fn cli_parses_stat_json() {
        let cli = Cli::parse_from(["blobdir", "stat", "_0.cfs", "--format", "json"]);
        match cli.command {
            Commands::Stat(args) => {
                assert_eq!(args.name, "_0.cfs");
                assert!(matches!(args.format, OutputFormat::Json));
            }
            _ => panic!("expected Stat command"),
        }
    }

    #[test]
    fn cli_parses_lock_obtain() {
        let cli = Cli::parse_from(["blobdir", "lock", "obtain", "write.lock", "--hold", "5"]);
        match cli.command {
            Commands::Lock(LockArgs {
                action: LockAction::Obtain { name, hold, wait },
            }) => {
                assert_eq!(name, "write.lock");
                assert_eq!(hold, 5);
                assert_eq!(wait, 0);
            }
            _ => panic!("expected Lock Obtain command"),
        }
    }

    #[test]
    fn cli_parses_config_init_force() {
        let cli = Cli::parse_from(["blobdir", "config", "init", "--force"]);
        match cli.command {
            Commands::Config(ConfigArgs {
                action: Some(ConfigAction::Init { force }),
            }) => assert!(force),
            _ => panic!("expected Config Init command"),
        }
    }

    #[test]
    fn cli_verbose_levels() {
        let cli = Cli::parse_from(["blobdir", "cat", "a"]);
        assert_eq!(cli.verbose, 0);

        let cli = Cli::parse_from(["blobdir", "-v", "cat", "a"]);
        assert_eq!(cli.verbose, 1);

        let cli = Cli::parse_from(["blobdir", "-vv", "cat", "a"]);
        assert_eq!(cli.verbose, 2);
    }
}
