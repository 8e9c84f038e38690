//! Pipeline state management

use std::time::Instant;

/// Pipeline state machine
///
/// Represents the lifecycle of a capture pipeline. State transitions are
/// validated so that start and stop always follow the same order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    /// No source, no threads
    Stopped,

    /// First consumer attached, source and threads being brought up
    Starting,

    /// Pipeline is actively decoding and distributing media
    Running {
        /// When the pipeline started running
        started_at: Instant,
    },

    /// Last consumer detached, threads being unwound
    Stopping,
}

impl PipelineState {
    /// Check if this state transition is valid
    pub fn can_transition_to(&self, target: &PipelineState) -> bool {
        use PipelineState::*;

        match (self, target) {
            (Stopped, Starting) => true,

            (Starting, Running { .. }) => true,
            // startup failures unwind through Stopping
            (Starting, Stopping) => true,

            (Running { .. }, Stopping) => true,

            (Stopping, Stopped) => true,

            (a, b) if a == b => true,

            _ => false,
        }
    }

    /// Get a human-readable description of this state
    pub fn description(&self) -> &'static str {
        match self {
            PipelineState::Stopped => "Stopped",
            PipelineState::Starting => "Starting",
            PipelineState::Running { .. } => "Running",
            PipelineState::Stopping => "Stopping",
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self, PipelineState::Running { .. })
    }

    pub fn is_stopped(&self) -> bool {
        matches!(self, PipelineState::Stopped)
    }

    /// Get the duration since the pipeline started (if running)
    pub fn running_duration(&self) -> Option<std::time::Duration> {
        if let PipelineState::Running { started_at } = self {
            Some(started_at.elapsed())
        } else {
            None
        }
    }
}

impl std::fmt::Display for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description())
    }
}
