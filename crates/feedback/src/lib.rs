//! Feedback loops between an implementer and a verifier.
//!
//! A loop accepts verification results until one passes or the retry bound
//! is reached. Failure details travel to the implementer over a
//! [`MessageRelay`].

#![warn(missing_docs)]

pub mod controller;
pub mod relay;

pub use controller::{FeedbackController, FeedbackError};
pub use relay::{MessageRelay, RecordingRelay, RelayError, StorageRelay};
