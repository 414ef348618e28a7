//! Output formatting and terminal rendering
//!
//! Handles colored output for phase checklists, step tallies and records.

use colored::{ColoredString, Colorize};
use watch_client::{
    ConnectionState, ExecutionRecord, PhaseItem, PhaseStatus, Progress, Snapshot, StepStatus,
};

/// Output handler for terminal display
#[derive(Debug, Clone, Copy, Default)]
pub struct OutputHandler {
    pub show_connection: bool,
}

impl OutputHandler {
    pub fn new(show_connection: bool) -> Self {
        Self { show_connection }
    }

    /// Print a section header
    pub fn print_header(&self, text: &str) {
        println!();
        println!("{}", format!("▶ {}", text).bright_yellow().bold());
        println!("{}", "─".repeat(60).dimmed());
    }

    /// Print a success message
    pub fn print_success(&self, text: &str) {
        println!("{} {}", "✓".bright_green(), text.bright_white());
    }

    /// Print an error message
    pub fn print_error(&self, text: &str) {
        println!("{} {}", "✗".bright_red(), text.bright_red());
    }

    /// Print a warning message
    pub fn print_warning(&self, text: &str) {
        println!("{} {}", "⚠".bright_yellow(), text.yellow());
    }

    /// Print an info message
    pub fn print_info(&self, text: &str) {
        println!("{} {}", "ℹ".bright_blue(), text);
    }

    /// One checklist line for a phase
    pub fn print_phase(&self, phase: &PhaseItem) {
        let label = match phase.status {
            PhaseStatus::Pending => phase.label.dimmed(),
            PhaseStatus::Active => phase.label.bright_white().bold(),
            PhaseStatus::Done => phase.label.normal(),
            PhaseStatus::Failed => phase.label.bright_red(),
        };

        match &phase.detail {
            Some(detail) => println!(
                "  {} {} {}",
                phase_glyph(phase.status),
                label,
                format!("({})", detail).dimmed()
            ),
            None => println!("  {} {}", phase_glyph(phase.status), label),
        }
    }

    pub fn print_step(&self, step_id: &str, status: StepStatus, error: Option<&str>) {
        let glyph = match status {
            StepStatus::Running => "▸".bright_blue(),
            StepStatus::Completed => "✓".bright_green(),
            StepStatus::Failed => "✗".bright_red(),
        };

        match error {
            Some(error) => println!(
                "    {} step {} {}",
                glyph,
                step_id.bright_white(),
                error.red()
            ),
            None => println!("    {} step {}", glyph, step_id.bright_white()),
        }
    }

    pub fn print_checkpoint(&self, checkpoint_id: &str) {
        println!("    {} checkpoint {}", "◆".bright_cyan(), checkpoint_id.bright_white());
    }

    pub fn print_connection(&self, state: ConnectionState) {
        if !self.show_connection {
            return;
        }

        let state_colored = match state {
            ConnectionState::Open => state.to_string().green(),
            ConnectionState::Failed => state.to_string().red(),
            ConnectionState::Connecting => state.to_string().yellow(),
            _ => state.to_string().normal(),
        };
        println!("  {} {}", "connection:".dimmed(), state_colored);
    }

    /// Full checklist plus tallies, used for summaries.
    pub fn print_progress(&self, progress: &Progress) {
        for phase in &progress.phases {
            self.print_phase(phase);
        }

        if !progress.steps.is_empty() {
            println!();
            println!(
                "  {} {} running | {} completed | {} failed",
                "Steps:".dimmed(),
                progress.steps_with(StepStatus::Running).to_string().bright_blue(),
                progress
                    .steps_with(StepStatus::Completed)
                    .to_string()
                    .bright_green(),
                progress.steps_with(StepStatus::Failed).to_string().bright_red(),
            );
        }

        if !progress.checkpoints.is_empty() {
            println!(
                "  {} {}",
                "Checkpoints:".dimmed(),
                progress.checkpoints.join(", ")
            );
        }

        if let Some(error) = &progress.error {
            println!();
            self.print_error(error);
        }
    }

    pub fn print_snapshot(&self, snapshot: &Snapshot) {
        println!("  {} {}", "Execution:".dimmed(), snapshot.id.bright_white());
        println!("  {} {}", "Status:".dimmed(), snapshot.status.to_string().bright_cyan());
        if let Some(intent) = &snapshot.intent {
            println!("  {} {}", "Intent:".dimmed(), intent);
        }
        if let Some(updated_at) = snapshot.updated_at {
            println!(
                "  {} {}",
                "Updated:".dimmed(),
                updated_at.format("%Y-%m-%d %H:%M:%S UTC")
            );
        }
    }

    pub fn print_records_table(&self, records: &[ExecutionRecord]) {
        println!(
            "  {:<20} {:<24} {}",
            "TIME".dimmed(),
            "TYPE".dimmed(),
            "MESSAGE".dimmed()
        );
        for record in records {
            println!(
                "  {:<20} {:<24} {}",
                record.created_at.format("%Y-%m-%d %H:%M:%S"),
                record.kind.bright_white(),
                record.message.as_deref().unwrap_or("-")
            );
        }
    }
}

fn phase_glyph(status: PhaseStatus) -> ColoredString {
    match status {
        PhaseStatus::Pending => "○".dimmed(),
        PhaseStatus::Active => "◐".bright_yellow(),
        PhaseStatus::Done => "✓".bright_green(),
        PhaseStatus::Failed => "✗".bright_red(),
    }
}
