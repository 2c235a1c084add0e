use clap::{Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "nodeup")]
#[command(version)]
#[command(about = "Converge a node to its declared configuration", long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Verbosity level
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Node configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Tasks to run in parallel within a wave
    #[arg(short, long, global = true, env = "NODEUP_JOBS")]
    pub jobs: Option<usize>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Apply the configuration to this machine
    Apply,

    /// Show what apply would change without changing anything
    Plan(PlanArgs),

    /// Render the configuration as a cloud-config document
    CloudInit(CloudInitArgs),

    /// Print the command-line flags for a component
    Flags {
        #[arg(value_enum)]
        component: Component,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Parser)]
pub struct PlanArgs {
    /// Also list the execution waves
    #[arg(long)]
    pub waves: bool,
}

#[derive(Parser)]
pub struct CloudInitArgs {
    /// Write to this file instead of stdout
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum Component {
    KubeApiserver,
    Kubelet,
}
