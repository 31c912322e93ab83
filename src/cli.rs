use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::args::RunArgs;
use crate::distribute::Selector;

#[derive(Parser, Debug)]
#[command(name = "vmfleet", version, about = "Reconcile small clusters of local development VMs")]
pub struct Cli {
    /// State root (defaults to ~/.vmfleet)
    #[arg(long, global = true, env = "VMFLEET_ROOT")]
    pub root: Option<PathBuf>,

    /// Cluster name
    #[arg(short = 'n', long, global = true, default_value = "default")]
    pub name: String,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Plain line output instead of spinners
    #[arg(long, global = true)]
    pub plain: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create or update the cluster to match the given flags
    Run(RunArgs),

    /// Delete every instance of the cluster and archive its state
    Reset,

    /// Show instances, phase and conditions
    List {
        #[arg(long)]
        json: bool,
    },

    /// Show one instance in detail
    Inspect {
        /// Instance id, e.g. default-node-0
        hostname: String,

        #[arg(long)]
        json: bool,
    },

    /// Run a shell command on selected instances
    Exec {
        command: String,

        #[command(flatten)]
        select: SelectArgs,
    },

    /// Copy a local file to selected instances
    Scp {
        src: PathBuf,
        dst: String,

        #[command(flatten)]
        select: SelectArgs,
    },

    /// Apply action documents from a YAML file
    Action {
        /// Multi-document YAML file
        #[arg(short, long, required_unless_present = "print_default")]
        file: Option<PathBuf>,

        /// Print a sample action document and exit
        #[arg(long)]
        print_default: bool,

        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },

    /// Print the effective settings
    Config,
}

/// Target selection shared by `exec` and `scp`.
#[derive(clap::Args, Debug, Clone, Default)]
pub struct SelectArgs {
    /// Only instances of these roles (comma-separated)
    #[arg(long, value_delimiter = ',')]
    pub roles: Vec<String>,

    /// Explicit addresses (comma-separated); overrides --roles
    #[arg(long, value_delimiter = ',')]
    pub ips: Vec<String>,

    /// Instance ids (comma-separated); overrides --ips and --roles
    #[arg(long, value_delimiter = ',')]
    pub hostnames: Vec<String>,
}

impl From<SelectArgs> for Selector {
    fn from(a: SelectArgs) -> Self {
        Selector {
            roles: a.roles,
            ips: a.ips,
            hostnames: a.hostnames,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn command_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn run_flags_parse() {
        let cli = Cli::parse_from([
            "vmfleet", "-n", "demo", "run", "--nodes", "master:1,node:2", "--mounts",
            "node@/src:/data", "--mounts", "master@/a:/b", "--cpus", "4",
        ]);
        assert_eq!(cli.name, "demo");
        match cli.command {
            Command::Run(args) => {
                assert_eq!(args.nodes.as_deref(), Some("master:1,node:2"));
                assert_eq!(args.mounts.len(), 2);
                assert_eq!(args.cpus.as_deref(), Some("4"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn selectors_split_on_commas() {
        let cli = Cli::parse_from(["vmfleet", "exec", "uptime", "--roles", "master,node"]);
        match cli.command {
            Command::Exec { command, select } => {
                assert_eq!(command, "uptime");
                assert_eq!(select.roles, ["master", "node"]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn action_needs_a_file_unless_printing() {
        assert!(Cli::try_parse_from(["vmfleet", "action"]).is_err());
        assert!(Cli::try_parse_from(["vmfleet", "action", "--print-default"]).is_ok());
    }
}
