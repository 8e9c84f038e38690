//! Capture pipeline
//!
//! One decode thread reads the source and is the only producer. A scheduler
//! thread owns the session and every track queue; the decode thread reaches it
//! only through posted closures, so queue items keep their production order.
//! [`PipelineLifecycle`] starts both threads on the first attach and stops them
//! on the last detach.

pub mod distributor;
pub mod health;
pub mod lifecycle;
pub mod normalizer;
pub mod pacer;
pub mod queue;
pub mod scheduler;
pub mod state;
pub mod types;
pub mod worker;

pub use distributor::{FrameDistributor, PreviewSink};
pub use health::{HealthSummary, PipelineHealth};
pub use lifecycle::{Consumer, PipelineError, PipelineLifecycle};
pub use queue::{ConsumerId, QueueError, TrackConsumer};
pub use scheduler::{SchedulerContext, SchedulerError, SchedulerHandle};
pub use state::PipelineState;
pub use types::{Frame, Media, MediaKind, Packet};
