//! CLI argument definitions for tunnelkit
//!
//! Uses clap for argument parsing. This module defines all subcommands
//! and their options.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// tunnelkit - run command-line tools through a shared SSH tunnel
///
/// Starts (or reuses) an `ssh -D` SOCKS tunnel exposed as a local HTTP
/// proxy and runs the target command with HTTP(S)_PROXY pointing at it.
#[derive(Parser, Debug)]
#[command(name = "tunnelkit")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Silent mode - suppress tunnelkit's own status output
    #[arg(long, short = 's', global = true)]
    pub silent: bool,

    /// Config file (default: <config dir>/tunnelkit/config.json)
    #[arg(long, global = true, env = "TUNNELKIT_CONFIG", value_name = "FILE")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a command through the proxy
    #[command(after_help = "EXAMPLES:
    # Run codex through the only saved profile
    tunnelkit run

    # Run a specific command through a named profile
    tunnelkit run work -- curl https://example.com

    # Run without the proxy
    tunnelkit run --no-proxy -- codex
")]
    Run(Box<RunArgs>),

    /// Manage SSH profiles
    Profile(ProfileArgs),

    /// Manage long-running proxy instances
    Proxy(ProxyArgs),
}

#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Profile id or name (optional when exactly one profile exists)
    #[arg(value_name = "PROFILE")]
    pub profile: Option<String>,

    /// Run the command directly, without a proxy
    #[arg(long)]
    pub no_proxy: bool,

    /// Pass the target's approval-skipping flags
    #[arg(long)]
    pub yolo: bool,

    /// Working directory for the command
    #[arg(long, value_name = "DIR")]
    pub cwd: Option<PathBuf>,

    /// Command to run (default: codex)
    #[arg(last = true, value_name = "COMMAND")]
    pub command: Vec<String>,
}

#[derive(Parser, Debug)]
pub struct ProfileArgs {
    #[command(subcommand)]
    pub command: ProfileCommands,
}

#[derive(Subcommand, Debug)]
pub enum ProfileCommands {
    /// Add or replace a profile
    Add(ProfileAddArgs),
    /// List saved profiles
    List,
    /// Remove a profile and its instances
    Remove(ProfileRemoveArgs),
}

#[derive(Parser, Debug)]
pub struct ProfileAddArgs {
    #[arg(long)]
    pub name: String,

    /// SSH host
    #[arg(long)]
    pub host: String,

    /// SSH port
    #[arg(long, default_value = "22")]
    pub port: u16,

    /// SSH user (default: $USER)
    #[arg(long)]
    pub user: Option<String>,

    /// Extra argument passed to ssh (repeatable)
    #[arg(long = "ssh-arg", value_name = "ARG", allow_hyphen_values = true)]
    pub ssh_args: Vec<String>,
}

#[derive(Parser, Debug)]
pub struct ProfileRemoveArgs {
    /// Profile id or name
    pub profile: String,
}

#[derive(Parser, Debug)]
pub struct ProxyArgs {
    #[command(subcommand)]
    pub command: ProxyCommands,
}

#[derive(Subcommand, Debug)]
pub enum ProxyCommands {
    /// Start a proxy daemon for a profile
    Start(ProxyStartArgs),
    /// Run a registered instance in this process (used by `proxy start`)
    #[command(hide = true)]
    Daemon(ProxyDaemonArgs),
    /// List registered instances and their status
    List,
    /// Stop an instance
    Stop(ProxyStopArgs),
    /// Remove dead and unhealthy instances
    Prune,
    /// Check that ssh and the config directory are usable
    Doctor,
}

#[derive(Parser, Debug)]
pub struct ProxyStartArgs {
    /// Profile id or name (optional when exactly one profile exists)
    pub profile: Option<String>,

    /// Stay in the foreground instead of detaching
    #[arg(long)]
    pub foreground: bool,
}

#[derive(Parser, Debug)]
pub struct ProxyDaemonArgs {
    #[arg(long, value_name = "ID")]
    pub instance_id: String,
}

#[derive(Parser, Debug)]
pub struct ProxyStopArgs {
    /// Instance id
    pub instance_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_defaults() {
        let cli = Cli::parse_from(["tunnelkit", "run"]);
        match cli.command {
            Commands::Run(args) => {
                assert!(args.profile.is_none());
                assert!(args.command.is_empty());
                assert!(!args.no_proxy);
            }
            _ => panic!("Expected Run command"),
        }
    }

    #[test]
    fn test_run_with_profile_and_command() {
        let cli = Cli::parse_from([
            "tunnelkit", "run", "work", "--yolo", "--", "codex", "exec", "--help",
        ]);
        match cli.command {
            Commands::Run(args) => {
                assert_eq!(args.profile.as_deref(), Some("work"));
                assert!(args.yolo);
                assert_eq!(args.command, vec!["codex", "exec", "--help"]);
            }
            _ => panic!("Expected Run command"),
        }
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::parse_from(["tunnelkit", "proxy", "list", "-s", "--config", "/tmp/c.json"]);
        assert!(cli.silent);
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/c.json")));
        assert!(matches!(
            cli.command,
            Commands::Proxy(ProxyArgs {
                command: ProxyCommands::List
            })
        ));
    }

    #[test]
    fn test_profile_add() {
        let cli = Cli::parse_from([
            "tunnelkit",
            "profile",
            "add",
            "--name",
            "work",
            "--host",
            "bastion.example",
            "--ssh-arg",
            "-i",
            "--ssh-arg",
            "~/.ssh/work",
        ]);
        match cli.command {
            Commands::Profile(ProfileArgs {
                command: ProfileCommands::Add(args),
            }) => {
                assert_eq!(args.port, 22);
                assert!(args.user.is_none());
                assert_eq!(args.ssh_args, vec!["-i", "~/.ssh/work"]);
            }
            _ => panic!("Expected profile add"),
        }
    }

    #[test]
    fn test_proxy_daemon_hidden_args() {
        let cli = Cli::parse_from(["tunnelkit", "proxy", "daemon", "--instance-id", "abc"]);
        match cli.command {
            Commands::Proxy(ProxyArgs {
                command: ProxyCommands::Daemon(args),
            }) => assert_eq!(args.instance_id, "abc"),
            _ => panic!("Expected proxy daemon"),
        }
    }
}
