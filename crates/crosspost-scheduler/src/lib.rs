//! Posting scheduler for Crosspost.
//!
//! This crate turns one queued submission into per-website work units and
//! drives them to completion:
//! - [`PostPacket`]: the state machine for one (submission, website) pair
//! - [`SubmissionPacket`]: the ordered decomposition of one submission
//! - a per-website limiter enforcing minimum inter-post spacing
//! - [`PostQueue`]: the orchestrator owning the global queue, FIFO
//!   fairness across submissions, and the job lifecycle

mod bucket;
mod error;
mod packet;
mod queue;

pub use error::SchedulerError;
pub use packet::{PacketStatus, PostPacket, SubmissionPacket};
pub use queue::{PostQueue, QueueSnapshot};
