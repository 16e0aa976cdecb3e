//! Core types for Crosspost.
//!
//! This crate provides the building blocks the scheduler operates on:
//! - The [`Submission`] entity with its change-notification stream
//! - The [`WebsiteRegistry`] describing posting destinations
//! - Shared [`Settings`] read by the scheduler
//! - Collaborator contracts ([`Poster`], [`Notifier`], [`SubmissionStore`],
//!   [`PostTimeStore`]) that keep network, notification, and persistence
//!   concerns outside the scheduler

mod error;
mod registry;
mod settings;
mod store;
mod submission;
mod traits;

pub use error::CoreError;
pub use registry::{WebsiteConfig, WebsiteRegistry};
pub use settings::{Settings, SharedSettings};
pub use store::{FilePostTimeStore, MemoryPostTimeStore, PostTimeStore};
pub use submission::{
    Field, FileInfo, FormData, PostOptions, PostStats, Rating, Submission, SubmissionChange,
    SubmissionRecord,
};
pub use traits::{NotificationKind, Notifier, PostFailure, PostSuccess, Poster, SubmissionStore};
