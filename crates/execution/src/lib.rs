//! Execution layer - dependency resolution, pipelines and resource locks.
//!
//! Everything here is a request/response operation over a shared
//! [`Storage`](portline_storage::Storage). Nothing waits on other processes:
//! `can_run` is a snapshot read and lock acquisition fails fast.

#![warn(missing_docs)]

pub mod dependency;
pub mod error;
pub mod lock;
pub mod pipeline;

pub use dependency::{resolve, DependencyResolver, Resolution};
pub use error::{LockError, PipelineError};
pub use lock::{LockManager, SessionProvider};
pub use pipeline::{PipelineDetail, PipelineService, UnitDetail, UnitPlacement};
