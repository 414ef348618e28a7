//! Renders session callbacks as terminal lines

use watch_client::{ConnectionState, Event, ExecutionObserver, PhaseItem, PhaseStatus, StepStatus};

use crate::output::OutputHandler;

pub struct TerminalObserver {
    output: OutputHandler,
}

impl TerminalObserver {
    pub fn new(output: OutputHandler) -> Self {
        Self { output }
    }
}

impl ExecutionObserver for TerminalObserver {
    fn on_step_started(&self, step_id: &str, _event: &Event) {
        self.output.print_step(step_id, StepStatus::Running, None);
    }

    fn on_step_completed(&self, step_id: &str, _event: &Event) {
        self.output.print_step(step_id, StepStatus::Completed, None);
    }

    fn on_step_failed(&self, step_id: &str, error: Option<&str>, _event: &Event) {
        self.output.print_step(step_id, StepStatus::Failed, error);
    }

    fn on_checkpoint_created(&self, checkpoint_id: &str, _event: &Event) {
        self.output.print_checkpoint(checkpoint_id);
    }

    fn on_phase_changed(&self, phase: &PhaseItem) {
        // Pending lines only show up after a reset and add nothing live.
        if phase.status != PhaseStatus::Pending {
            self.output.print_phase(phase);
        }
    }

    fn on_stream_ended(&self) {
        self.output.print_info("Server closed the stream");
    }

    fn on_error(&self, message: &str) {
        self.output.print_error(message);
    }

    fn on_connection_state(&self, state: ConnectionState) {
        self.output.print_connection(state);
    }
}
