//! Streaming pipeline: lifecycle, adapters, synchronization and coordinators.
//!
//! The engine owns media processing; everything here runs on the application
//! side of that boundary. Engine callbacks hand samples to channels, adapter
//! stages turn them into owned frames and decoded records, the synchronizer
//! joins the two, and a coordinator per direction wires it all together.

pub mod frame_source;
pub mod health;
pub mod lifecycle;
pub mod meta_source;
pub mod queue;
pub mod receiver;
pub mod sender;
pub mod stage;
pub mod state;
pub mod sync;
pub mod testsrc;
pub mod types;

pub use receiver::ReceiverCoordinator;
pub use sender::SenderCoordinator;
