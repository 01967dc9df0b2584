//! Asynchronous notifications from the engine.

/// Target states for explicit engine transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetState {
    Ready,
    Playing,
    Stopped,
}

impl std::fmt::Display for TargetState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TargetState::Ready => write!(f, "Ready"),
            TargetState::Playing => write!(f, "Playing"),
            TargetState::Stopped => write!(f, "Stopped"),
        }
    }
}

/// One message observed on the engine bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusEvent {
    /// The engine (or one of its nodes) changed state
    StateChanged {
        node: Option<String>,
        state: TargetState,
    },
    /// Fatal engine-side failure; the pipeline instance is done
    Error { message: String },
    /// The upstream finished cleanly
    EndOfStream,
}
