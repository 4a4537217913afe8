//! Connection resilience and continuity for a single long-lived source.
//!
//! [`CaptureOrchestrator`] is the entry point: it owns the lifecycle state
//! machine and drives reconnection, heartbeat probing, catch-up phases,
//! session correlation and the idempotent ingestion path.

pub mod backoff;
pub mod catchup;
pub mod clock;
pub mod correlator;
pub mod heartbeat;
pub mod identity;
pub mod lifecycle;
pub mod orchestrator;
pub mod pipeline;
pub mod single_flight;
pub mod source_gate;
pub mod status;
#[cfg(any(test, feature = "testkit"))]
pub mod testkit;
pub mod watermark;

pub use backoff::RetryPolicy;
pub use clock::{Clock, ManualClock, SystemClock};
pub use lifecycle::{ConnectionState, Trigger};
pub use orchestrator::CaptureOrchestrator;
pub use status::StatusSnapshot;
