use clap::{Args, Parser, Subcommand, ValueEnum};

#[derive(Parser)]
#[command(name = "run-pilot")]
#[command(author, version, about = "Isolated, multi-phase agent runs for change requests", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(short, long, global = true, value_enum, default_value = "text")]
    pub output: OutputFormat,
}

/// Output format for CLI results.
#[derive(Debug, Clone, Copy, Default, ValueEnum, PartialEq, Eq)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Initialize run-pilot in the current repository
    Init,

    /// Start a run for a change request and drive it to completion
    Start(StartArgs),

    /// Show run status
    Status {
        /// Run ID (optional, shows all if not specified)
        run_id: Option<String>,
    },

    /// List runs
    List {
        /// Filter by status
        #[arg(long, value_enum)]
        status: Option<StatusFilterArg>,
    },

    /// Resume an interrupted run from its last persisted phase
    Resume {
        /// Run ID
        run_id: Option<String>,

        /// Resume every unfinished run
        #[arg(long, conflicts_with = "run_id")]
        all: bool,
    },

    /// Cancel a run
    Cancel {
        /// Run ID
        run_id: String,
    },

    /// Remove workspaces no unfinished run owns
    Cleanup,
}

#[derive(Args)]
pub struct StartArgs {
    /// Issue number to fetch the change request from
    #[arg(long, required_unless_present = "title")]
    pub issue: Option<u64>,

    /// Change request title
    #[arg(long)]
    pub title: Option<String>,

    /// Change request description
    #[arg(long, short = 'd')]
    pub description: Option<String>,

    /// Explicit run ID
    #[arg(long)]
    pub run_id: Option<String>,

    /// Upper bound on review/patch iterations
    #[arg(long)]
    pub max_patch_iterations: Option<u32>,

    /// Queue this run belongs to (passed through to completion notifications)
    #[arg(long, env = "PILOT_QUEUE_ID")]
    pub queue_id: Option<String>,

    /// Position of this run within its queue
    #[arg(long, requires = "queue_id")]
    pub phase_number: Option<u32>,

    /// Issue or review request number the previous run in the queue produced
    #[arg(long)]
    pub parent_reference: Option<u64>,
}

#[derive(Clone, ValueEnum)]
pub enum StatusFilterArg {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl From<StatusFilterArg> for crate::run::RunStatus {
    fn from(arg: StatusFilterArg) -> Self {
        match arg {
            StatusFilterArg::Pending => Self::Pending,
            StatusFilterArg::Running => Self::Running,
            StatusFilterArg::Completed => Self::Completed,
            StatusFilterArg::Failed => Self::Failed,
            StatusFilterArg::Cancelled => Self::Cancelled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_requires_issue_or_title() {
        assert!(Cli::try_parse_from(["run-pilot", "start"]).is_err());
        assert!(Cli::try_parse_from(["run-pilot", "start", "--issue", "42"]).is_ok());
        assert!(Cli::try_parse_from(["run-pilot", "start", "--title", "Add login"]).is_ok());
    }

    #[test]
    fn test_resume_all_conflicts_with_id() {
        assert!(Cli::try_parse_from(["run-pilot", "resume", "r-1", "--all"]).is_err());
        let cli = Cli::try_parse_from(["run-pilot", "resume", "--all"]).unwrap();
        assert!(matches!(cli.command, Commands::Resume { all: true, run_id: None }));
    }
}
