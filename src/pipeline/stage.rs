//! Pipeline stage trait
//!
//! Stages are wired together with channels by a coordinator and each runs in
//! its own task until its input closes or shutdown is requested.

use anyhow::Result;
use async_trait::async_trait;

/// Trait for pipeline stages that process media data
#[async_trait]
pub trait PipelineStage: Send {
    /// Run the stage, processing data until the input channel closes
    async fn run(&mut self) -> Result<()>;

    /// Get the name of this stage for logging
    fn name(&self) -> &'static str;
}
