use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use serde::Serialize;
use tracing::warn;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use run_pilot::cli::{Cli, Commands, Display, OutputFormat, StartArgs, StatusFilterArg};
use run_pilot::config::{CONFIG_FILE, PilotConfig, ProjectPaths, STATE_DIR};
use run_pilot::error::{PilotError, Result};
use run_pilot::orchestrator::{CancelOutcome, Orchestrator, SubmitOptions};
use run_pilot::run::{ChainInfo, ChangeRequest, Run, RunStatus};

/// Context for command output handling.
struct OutputContext<'a> {
    display: &'a Display,
    format: OutputFormat,
}

impl OutputContext<'_> {
    fn is_text(&self) -> bool {
        self.format == OutputFormat::Text
    }

    fn emit_json<T: Serialize>(&self, value: &T) -> Result<()> {
        println!("{}", serde_json::to_string_pretty(value)?);
        Ok(())
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    init_logging(cli.verbose);

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            Display::new().print_error(&e.to_string());
            ExitCode::FAILURE
        }
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose {
        "run_pilot=debug"
    } else {
        "run_pilot=info"
    };
    let filter = EnvFilter::try_from_env("RUN_PILOT_LOG").unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).without_time())
        .with(filter)
        .init();
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let display = Display::new();
    let out = OutputContext {
        display: &display,
        format: cli.output,
    };

    match cli.command {
        Commands::Init => cmd_init(&out).await,
        Commands::Start(args) => cmd_start(&out, args).await,
        Commands::Status { run_id } => cmd_status(&out, run_id).await,
        Commands::List { status } => cmd_list(&out, status).await,
        Commands::Resume { run_id, all } => cmd_resume(&out, run_id, all).await,
        Commands::Cancel { run_id } => cmd_cancel(&out, &run_id).await,
        Commands::Cleanup => cmd_cleanup(&out).await,
    }
}

fn find_project_root() -> Result<PathBuf> {
    let current = std::env::current_dir()?;

    let mut path = current.as_path();
    loop {
        if path.join(".git").exists() {
            return Ok(path.to_path_buf());
        }
        path = path.parent().ok_or(PilotError::NotInGitRepo)?;
    }
}

async fn open_orchestrator() -> Result<Arc<Orchestrator>> {
    let root = find_project_root()?;
    let state_dir = root.join(STATE_DIR);
    if !state_dir.join(CONFIG_FILE).exists() {
        return Err(PilotError::NotInitialized);
    }

    let config = PilotConfig::load(&state_dir).await?;
    let paths = ProjectPaths::new(root, &config);
    let orchestrator = Arc::new(Orchestrator::new(config, paths)?);
    orchestrator.init().await?;
    Ok(orchestrator)
}

/// Ctrl-C cancels every run this process drives; each still runs its cleanup.
fn interrupt_on_ctrl_c(orchestrator: &Arc<Orchestrator>) {
    let orchestrator = Arc::clone(orchestrator);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling runs");
            orchestrator.interrupt_all();
        }
    });
}

fn exit_code_for(run: &Run) -> ExitCode {
    if run.status == RunStatus::Completed {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

async fn cmd_init(out: &OutputContext<'_>) -> Result<ExitCode> {
    let root = find_project_root()?;
    let config = PilotConfig::default();
    let paths = ProjectPaths::new(root.clone(), &config);

    if paths.state_dir.join(CONFIG_FILE).exists() {
        if out.is_text() {
            out.display
                .print_warning("run-pilot is already initialized in this repository.");
        }
        return Ok(ExitCode::SUCCESS);
    }

    paths.ensure_dirs().await?;
    config.save(&paths.state_dir).await?;
    exclude_from_git(&root, &[STATE_DIR, config.allocator.workspaces_dir.as_str()]).await?;

    if out.is_text() {
        out.display.print_success("Initialized run-pilot.");
        out.display.print_info(&format!(
            "Configuration: {}",
            paths.state_dir.join(CONFIG_FILE).display()
        ));
        out.display
            .print_info(&format!("Workspaces: {}", paths.workspaces_dir.display()));
    } else {
        out.emit_json(&serde_json::json!({ "initialized": paths.state_dir }))?;
    }

    Ok(ExitCode::SUCCESS)
}

/// Keep orchestrator state out of `git status` without touching tracked files.
async fn exclude_from_git(root: &std::path::Path, entries: &[&str]) -> Result<()> {
    let info_dir = root.join(".git").join("info");
    if !info_dir.is_dir() {
        return Ok(());
    }

    let exclude = info_dir.join("exclude");
    let mut content = tokio::fs::read_to_string(&exclude)
        .await
        .unwrap_or_default();
    let mut changed = false;
    for entry in entries {
        let line = format!("/{}/", entry.trim_matches('/'));
        if !content.lines().any(|l| l.trim() == line) {
            if !content.is_empty() && !content.ends_with('\n') {
                content.push('\n');
            }
            content.push_str(&line);
            content.push('\n');
            changed = true;
        }
    }

    if changed {
        tokio::fs::write(&exclude, content).await?;
    }
    Ok(())
}

async fn cmd_start(out: &OutputContext<'_>, args: StartArgs) -> Result<ExitCode> {
    let orchestrator = open_orchestrator().await?;
    interrupt_on_ctrl_c(&orchestrator);

    let request = match (args.issue, args.title) {
        (Some(issue), None) if args.description.is_none() => ChangeRequest::from_issue(issue),
        (issue, title) => {
            let mut request =
                ChangeRequest::from_text(title.unwrap_or_default(), args.description.unwrap_or_default());
            request.issue_number = issue;
            request
        }
    };
    let options = SubmitOptions {
        run_id: args.run_id,
        max_patch_iterations: args.max_patch_iterations,
        chain: ChainInfo {
            queue_id: args.queue_id,
            phase_number: args.phase_number,
            parent_reference: args.parent_reference,
        },
    };

    let run = orchestrator.submit(request, options).await?;
    if out.is_text() {
        out.display.print_success(&format!("Created run: {}", run.id));
        out.display.print_info(&format!("Branch: {}", run.branch_name));
    }

    let run = orchestrator.drive(&run.id).await?;
    report_finished(out, &run)?;
    Ok(exit_code_for(&run))
}

fn report_finished(out: &OutputContext<'_>, run: &Run) -> Result<()> {
    if !out.is_text() {
        return out.emit_json(run);
    }

    match run.status {
        RunStatus::Completed => out
            .display
            .print_success(&format!("Run {} completed!", run.id)),
        RunStatus::Cancelled => out
            .display
            .print_warning(&format!("Run {} cancelled", run.id)),
        _ => out.display.print_error(&format!("Run {} failed", run.id)),
    }
    out.display.print_run_summary(run);
    Ok(())
}

async fn cmd_status(out: &OutputContext<'_>, run_id: Option<String>) -> Result<ExitCode> {
    let orchestrator = open_orchestrator().await?;

    match run_id {
        Some(id) => {
            let run = orchestrator.status(&id).await?;
            if out.is_text() {
                out.display.print_run_detail(&run);
            } else {
                out.emit_json(&run)?;
            }
        }
        None => {
            let runs = orchestrator.list(None).await?;
            if out.is_text() {
                out.display.print_header("run-pilot status");
                out.display.print_runs_table(&runs);
            } else {
                out.emit_json(&runs)?;
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}

async fn cmd_list(out: &OutputContext<'_>, status: Option<StatusFilterArg>) -> Result<ExitCode> {
    let orchestrator = open_orchestrator().await?;
    let filtered = orchestrator.list(status.map(RunStatus::from)).await?;

    if out.is_text() {
        out.display.print_header("Runs");
        out.display.print_runs_table(&filtered);
    } else {
        out.emit_json(&filtered)?;
    }

    Ok(ExitCode::SUCCESS)
}

async fn cmd_resume(out: &OutputContext<'_>, run_id: Option<String>, all: bool) -> Result<ExitCode> {
    let orchestrator = open_orchestrator().await?;
    interrupt_on_ctrl_c(&orchestrator);

    if let Some(id) = run_id {
        let run = orchestrator.drive(&id).await?;
        report_finished(out, &run)?;
        return Ok(exit_code_for(&run));
    }

    if !all {
        if out.is_text() {
            out.display.print_warning("Specify a run ID or use --all");
        }
        return Ok(ExitCode::FAILURE);
    }

    let results = orchestrator.resume_all().await?;
    if results.is_empty() && out.is_text() {
        out.display.print_info("No unfinished runs.");
    }

    let mut all_completed = true;
    let mut finished = Vec::new();
    for (id, result) in results {
        match result {
            Ok(run) => {
                all_completed &= run.status == RunStatus::Completed;
                if out.is_text() {
                    out.display.print_run_summary(&run);
                }
                finished.push(run);
            }
            Err(e) => {
                all_completed = false;
                out.display
                    .print_error(&format!("Failed to resume {}: {}", id, e));
            }
        }
    }
    if !out.is_text() {
        out.emit_json(&finished)?;
    }

    Ok(if all_completed {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

async fn cmd_cancel(out: &OutputContext<'_>, run_id: &str) -> Result<ExitCode> {
    let orchestrator = open_orchestrator().await?;

    let message = match orchestrator.cancel(run_id).await? {
        CancelOutcome::Signalled | CancelOutcome::Requested => {
            format!("Cancellation requested for run {}", run_id)
        }
        CancelOutcome::Cancelled(_) => format!("Cancelled run: {}", run_id),
        CancelOutcome::AlreadyFinished(run) => {
            format!("Run {} already finished ({})", run_id, run.status)
        }
    };

    if out.is_text() {
        out.display.print_success(&message);
    } else {
        out.emit_json(&serde_json::json!({ "run_id": run_id, "message": message }))?;
    }
    Ok(ExitCode::SUCCESS)
}

async fn cmd_cleanup(out: &OutputContext<'_>) -> Result<ExitCode> {
    let orchestrator = open_orchestrator().await?;
    let removed = orchestrator.cleanup_orphaned().await?;

    if out.is_text() {
        if removed.is_empty() {
            out.display.print_info("No orphaned workspaces.");
        }
        for path in &removed {
            out.display
                .print_info(&format!("Removed workspace: {}", path.display()));
        }
    } else {
        out.emit_json(&removed)?;
    }

    Ok(ExitCode::SUCCESS)
}
