use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "drifter",
    about = "Manage local virtual machines cloned from boxcar images"
)]
pub struct Cli {
    /// Config file (falls back to ./.drifter, then ~/.drifter)
    #[arg(long, default_value = ".drifter")]
    pub config_file: PathBuf,

    /// Deadline in seconds applied to address and reachability polling
    /// (0 means unbounded)
    #[arg(long, default_value_t = 0)]
    pub timeout_secs: u64,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Provision the instance if needed, then start it
    Start,

    /// Stop the instance
    Stop {
        /// Aggressively power off instead of a guest-cooperative stop
        #[arg(long)]
        force: bool,
    },

    /// Suspend the instance (hands the terminal to the hypervisor tool)
    Suspend,

    /// Print the instance's current IP address
    IpAddr,

    /// Open a shell in the guest
    Ssh {
        /// Extra arguments appended to the ssh invocation
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },

    /// Print an ssh-config clause for the instance
    SshConfig,

    /// List running VMs
    Ls,

    /// Destroy the instance and permanently remove its data
    Rm,

    /// Fetch and verify the boxcar archive
    Fetch,

    /// Package a VM directory into a boxcar archive
    MakeBoxcar {
        /// Path to a .vmwarevm directory
        path: PathBuf,
    },
}
