use std::path::PathBuf;

use clap::{ArgAction, Args, Parser, Subcommand};

pub const MLPOOL_HELP_TEMPLATE: &str =
    "{before-help}\nUsage:\n    {usage}\n\nGlobal options:\n{options}\n";

pub const MLPOOL_BEFORE_HELP: &str = concat!(
    "mlpool ",
    env!("CARGO_PKG_VERSION"),
    " – Process pools for model serving\n\n",
    "\x1b[1;36mCommands\x1b[0m\n",
    "  predict          Load models into their pools and run one prediction.\n",
    "  hash             Print the content hash of an environment archive.\n",
    "  envs             List or prune materialized environments.\n",
);

#[derive(Parser, Debug)]
#[command(
    name = "mlpool",
    author,
    version,
    disable_help_subcommand = true,
    before_help = MLPOOL_BEFORE_HELP,
    help_template = MLPOOL_HELP_TEMPLATE
)]
pub struct MlpoolCli {
    #[arg(
        short,
        long,
        help = "Suppress human output (errors still print to stderr)",
        global = true
    )]
    pub quiet: bool,
    #[arg(
        short,
        long,
        action = ArgAction::Count,
        help = "Increase logging (-vv reaches trace)",
        global = true
    )]
    pub verbose: u8,
    #[arg(long, help = "Force trace logging regardless of -v/-q", global = true)]
    pub trace: bool,
    #[arg(
        long,
        help = "Emit {status,message,details} JSON envelopes",
        global = true
    )]
    pub json: bool,
    #[arg(
        long,
        value_name = "N",
        env = "MLPOOL_PARALLEL_WORKERS",
        help = "Workers per pool",
        global = true
    )]
    pub workers: Option<usize>,
    #[arg(
        long,
        value_name = "DIR",
        env = "MLPOOL_ENVIRONMENTS_DIR",
        help = "Root of the environment store",
        global = true
    )]
    pub environments_dir: Option<PathBuf>,
    #[command(subcommand)]
    pub command: CommandKind,
}

#[derive(Subcommand, Debug)]
pub enum CommandKind {
    /// Serve requests on stdin/stdout as a pool worker.
    #[command(hide = true)]
    Worker,
    /// Print the content hash of an environment archive.
    Hash(HashArgs),
    /// Load models and run a single prediction.
    Predict(PredictArgs),
    /// Inspect the environment store.
    #[command(subcommand)]
    Envs(EnvsCommand),
}

#[derive(Args, Debug)]
pub struct HashArgs {
    #[arg(value_name = "ARCHIVE")]
    pub archive: PathBuf,
}

#[derive(Args, Debug)]
pub struct PredictArgs {
    #[arg(
        long = "model",
        value_name = "SETTINGS",
        required = true,
        help = "Model settings JSON file (repeatable)"
    )]
    pub models: Vec<PathBuf>,
    #[arg(long, value_name = "NAME", help = "Model to send the request to")]
    pub target: String,
    #[arg(long, value_name = "VERSION")]
    pub version: Option<String>,
    #[arg(long, value_name = "JSON", default_value = "{}")]
    pub payload: String,
}

#[derive(Subcommand, Debug)]
pub enum EnvsCommand {
    /// List materialized environments.
    List,
    /// Remove materialized environments and stale staging directories.
    Prune(PruneArgs),
}

#[derive(Args, Debug)]
pub struct PruneArgs {
    #[arg(long, help = "Report what would be removed without deleting")]
    pub dry_run: bool,
}

impl CommandKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Worker => "worker",
            Self::Hash(_) => "hash",
            Self::Predict(_) => "predict",
            Self::Envs(EnvsCommand::List) => "envs list",
            Self::Envs(EnvsCommand::Prune(_)) => "envs prune",
        }
    }
}
