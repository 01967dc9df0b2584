//! Contract with the external streaming-pipeline engine.
//!
//! Compression, container muxing/demuxing, socket transport and rendering all
//! live behind these traits. The core only asks the engine for four things:
//! graph construction from a declarative description, push/pull of samples
//! with capability metadata, asynchronous bus notifications, and explicit
//! state-transition calls.
//!
//! Engines invoke sink callbacks from their own worker threads; callbacks
//! must stay thin (copy and hand off) and never block on the consumer.

pub mod bus;
pub mod graph;
pub mod loopback;
pub mod sample;

use std::time::Duration;

pub use bus::{BusEvent, TargetState};
pub use graph::{GraphBuilder, GraphSpec, LinkType, NodeKind};
pub use sample::{PixelFormat, Sample, SampleCaps};

use crate::error::StreamError;

/// Callback invoked on an engine worker thread for every sample a sink
/// produces.
pub type SampleHandler = Box<dyn FnMut(Sample) + Send>;

/// Factory for engine pipelines.
pub trait StreamingEngine: Send + Sync {
    /// Instantiate the nodes and links described by `spec`.
    ///
    /// The returned pipeline starts in its constructed state; no data flows
    /// until an explicit transition to `Playing`.
    fn build(&self, spec: &GraphSpec) -> Result<Box<dyn EnginePipeline>, StreamError>;
}

/// A running (or about to run) engine pipeline instance.
pub trait EnginePipeline: Send + Sync {
    /// Request an explicit state transition.
    fn set_state(&self, state: TargetState) -> Result<(), StreamError>;

    /// Push one sample into a named source node.
    fn push_sample(&self, source: &str, sample: Sample) -> Result<(), StreamError>;

    /// Register the sample-ready callback for a named sink node.
    ///
    /// The engine calls the handler from its worker threads, possibly
    /// concurrently across sinks.
    fn connect_sink(&self, sink: &str, handler: SampleHandler) -> Result<(), StreamError>;

    /// Wait up to `timeout` for the next bus event.
    ///
    /// Bounded so a lifecycle loop polling the bus can never be starved away
    /// from shutdown handling.
    fn poll_event(&self, timeout: Duration) -> Option<BusEvent>;
}
