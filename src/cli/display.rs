use console::{Style, style};

use crate::run::{Phase, Run, RunStatus};
use crate::utils::truncate_chars;

const PIPELINE: [Phase; 6] = [
    Phase::Plan,
    Phase::Build,
    Phase::Test,
    Phase::Review,
    Phase::Document,
    Phase::Publish,
];

pub struct Display;

impl Display {
    pub fn new() -> Self {
        Self
    }

    pub fn print_header(&self, text: &str) {
        println!();
        println!("{}", style(text).bold().cyan());
        println!("{}", style("═".repeat(60)).dim());
        println!();
    }

    pub fn print_run_summary(&self, run: &Run) {
        println!(
            "{}  {}",
            style(&run.id).bold(),
            style(run.change_request.display_title()).white()
        );
        println!(
            "    Status: {}  Phase: {}",
            self.status_style(run.status).apply_to(run.status.to_string()),
            self.phase_track(run.phase)
        );
        println!("    Branch: {}", style(&run.branch_name).dim());

        if let Some(url) = &run.published.review_url {
            println!("    Review: {}", style(url).underlined());
        }
        if let Some(failure) = &run.failure {
            println!(
                "    {} {} in {}: {}",
                style("Failure:").red(),
                failure.kind,
                failure.phase,
                truncate_chars(&failure.message, 120)
            );
        }

        println!();
    }

    pub fn print_run_detail(&self, run: &Run) {
        self.print_header(&format!("Run: {}", run.id));

        println!(
            "Request:     {}",
            style(run.change_request.display_title()).white().bold()
        );
        println!(
            "Status:      {}",
            self.status_style(run.status).apply_to(run.status.to_string())
        );
        println!("Phase:       {}", self.phase_track(run.phase));
        println!("Branch:      {}", run.branch_name);
        println!("Base:        {}", run.base_branch);

        if let Some(allocation) = run.allocation() {
            println!("Workspace:   {}", allocation.workspace_path.display());
            println!("Ports:       {}", allocation.ports);
        }

        println!(
            "Patches:     {}/{}",
            run.retry_count, run.max_patch_iterations
        );

        if let Some(queue) = &run.chain.queue_id {
            println!(
                "Queue:       {} #{}",
                queue,
                run.chain.phase_number.unwrap_or_default()
            );
        }

        if let Some(url) = &run.published.review_url {
            println!("Review:      {}", url);
        }

        if !run.commits.is_empty() {
            println!();
            println!("{}", style("Commits:").bold());
            for commit in &run.commits {
                let short = commit.id.get(..7).unwrap_or(&commit.id);
                println!("  {} {}", style(short).yellow(), commit.message);
            }
        }

        if let Some(failure) = &run.failure {
            println!();
            println!("{} {} in {}", style("Failure:").red().bold(), failure.kind, failure.phase);
            println!("  {}", failure.message);
            for finding in &failure.findings {
                println!(
                    "  {} [{}] {}",
                    style("→").red(),
                    finding.severity,
                    finding.description
                );
            }
        }

        println!();
        if let Some(started) = run.started_at {
            println!(
                "{}",
                style(format!("Started: {}", started.format("%Y-%m-%d %H:%M:%S"))).dim()
            );
        }
        if let Some(completed) = run.completed_at {
            println!(
                "{}",
                style(format!(
                    "Completed: {}",
                    completed.format("%Y-%m-%d %H:%M:%S")
                ))
                .dim()
            );
        }
    }

    pub fn print_runs_table(&self, runs: &[Run]) {
        if runs.is_empty() {
            println!("{}", style("No runs found.").dim());
            return;
        }

        let count = |status: RunStatus| runs.iter().filter(|r| r.status == status).count();
        println!(
            "Running: {}  Pending: {}  Completed: {}  Failed: {}",
            style(count(RunStatus::Running)).yellow(),
            style(count(RunStatus::Pending)).dim(),
            style(count(RunStatus::Completed)).green(),
            style(count(RunStatus::Failed)).red()
        );
        println!();

        println!(
            "{:<12} {:<32} {:<11} {:<10}",
            style("ID").bold(),
            style("Request").bold(),
            style("Status").bold(),
            style("Phase").bold()
        );
        println!("{}", style("─".repeat(68)).dim());

        for run in runs {
            println!(
                "{:<12} {:<32} {:<11} {:<10}",
                run.id,
                truncate_chars(&run.change_request.display_title(), 30),
                self.status_style(run.status).apply_to(run.status.to_string()),
                run.phase
            );
        }
    }

    pub fn print_success(&self, message: &str) {
        println!("{} {}", style("✓").green().bold(), message);
    }

    pub fn print_error(&self, message: &str) {
        eprintln!("{} {}", style("✗").red().bold(), message);
    }

    pub fn print_warning(&self, message: &str) {
        println!("{} {}", style("!").yellow().bold(), message);
    }

    pub fn print_info(&self, message: &str) {
        println!("{} {}", style("→").cyan(), message);
    }

    fn status_style(&self, status: RunStatus) -> Style {
        match status {
            RunStatus::Pending => Style::new().dim(),
            RunStatus::Running => Style::new().yellow().bold(),
            RunStatus::Completed => Style::new().green(),
            RunStatus::Failed => Style::new().red().bold(),
            RunStatus::Cancelled => Style::new().dim().strikethrough(),
        }
    }

    /// Pipeline with the current phase highlighted; Patch shows as Review.
    fn phase_track(&self, current: Phase) -> String {
        let current = if current == Phase::Patch {
            Phase::Review
        } else {
            current
        };
        let position = PIPELINE.iter().position(|p| *p == current);

        PIPELINE
            .iter()
            .enumerate()
            .map(|(i, phase)| match position {
                Some(pos) if i == pos => style(phase.as_str()).cyan().bold().to_string(),
                Some(pos) if i < pos => style(phase.as_str()).green().to_string(),
                None if current == Phase::Completed => style(phase.as_str()).green().to_string(),
                _ => style(phase.as_str()).dim().to_string(),
            })
            .collect::<Vec<_>>()
            .join(" › ")
    }
}

impl Default for Display {
    fn default() -> Self {
        Self::new()
    }
}
