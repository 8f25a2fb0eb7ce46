//! Escalation layer - trigger rules over worker snapshots and the records
//! they raise.

#![warn(missing_docs)]

pub mod service;
pub mod trigger;

pub use service::{EscalationError, EscalationService, Raised};
pub use trigger::{Trigger, TriggerEngine};
