//! Pipeline state management

use std::time::Instant;

/// Pipeline state machine
///
/// Transitions are validated so every component observes the same lifecycle.
/// `Error` and `Stopped` are terminal: no data flows in either and no
/// transition leaves them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    /// Graph built, nodes instantiated, nothing negotiated yet
    Constructed,

    /// Resources acquired, ready to start data flow
    Ready,

    /// Actively processing media
    Playing {
        /// When the pipeline started playing
        started_at: Instant,
    },

    /// Terminal failure; the error payload travels separately
    Error,

    /// Shut down; all node resources released
    Stopped,
}

impl PipelineState {
    /// Check if this state transition is valid
    pub fn can_transition_to(&self, target: &PipelineState) -> bool {
        use PipelineState::*;

        match (self, target) {
            // Terminal states admit nothing, not even self-transitions;
            // idempotent stop is handled by the lifecycle manager.
            (Error, _) | (Stopped, _) => false,

            (Constructed, Ready) => true,
            (Ready, Playing { .. }) => true,

            // Teardown and failure are reachable from any live state
            (_, Stopped) => true,
            (_, Error) => true,

            // Self-transitions
            (a, b) if a == b => true,

            _ => false,
        }
    }

    /// Get a human-readable description of this state
    pub fn description(&self) -> &'static str {
        match self {
            PipelineState::Constructed => "Constructed",
            PipelineState::Ready => "Ready",
            PipelineState::Playing { .. } => "Playing",
            PipelineState::Error => "Error",
            PipelineState::Stopped => "Stopped",
        }
    }

    /// Check if the pipeline is actively processing media
    pub fn is_playing(&self) -> bool {
        matches!(self, PipelineState::Playing { .. })
    }

    /// Check if no further transitions are possible
    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelineState::Error | PipelineState::Stopped)
    }

    /// Get the duration since the pipeline started playing (if playing)
    pub fn playing_duration(&self) -> Option<std::time::Duration> {
        if let PipelineState::Playing { started_at } = self {
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_transitions() {
        let constructed = PipelineState::Constructed;
        let ready = PipelineState::Ready;
        let playing = PipelineState::Playing {
            started_at: Instant::now(),
        };
        let error = PipelineState::Error;
        let stopped = PipelineState::Stopped;

        assert!(constructed.can_transition_to(&ready));
        assert!(ready.can_transition_to(&playing));
        assert!(playing.can_transition_to(&stopped));
        assert!(playing.can_transition_to(&error));
        assert!(ready.can_transition_to(&stopped));
        assert!(constructed.can_transition_to(&stopped));

        // Self-transitions on live states
        assert!(ready.can_transition_to(&ready));
        assert!(playing.can_transition_to(&playing));
    }

    #[test]
    fn test_invalid_transitions() {
        let constructed = PipelineState::Constructed;
        let playing = PipelineState::Playing {
            started_at: Instant::now(),
        };
        let error = PipelineState::Error;
        let stopped = PipelineState::Stopped;

        // Must go through Ready
        assert!(!constructed.can_transition_to(&playing));

        // Terminal states admit nothing
        assert!(!stopped.can_transition_to(&playing));
        assert!(!stopped.can_transition_to(&constructed));
        assert!(!error.can_transition_to(&PipelineState::Ready));
        assert!(!error.can_transition_to(&stopped));
    }

    #[test]
    fn test_state_checks() {
        let playing = PipelineState::Playing {
            started_at: Instant::now(),
        };

        assert!(playing.is_playing());
        assert!(!playing.is_terminal());
        assert!(playing.playing_duration().is_some());

        assert!(PipelineState::Error.is_terminal());
        assert!(PipelineState::Stopped.is_terminal());
        assert!(!PipelineState::Ready.is_playing());
        assert_eq!(PipelineState::Ready.playing_duration(), None);
    }
}
