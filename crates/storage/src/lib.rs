//! Storage abstraction and implementations for Portline.
//!
//! This crate provides a trait-based storage interface with a SQLite
//! implementation. The database file is the only thing coordinating
//! processes share, so every operation that must be exclusive is a single
//! conditional statement.

#![warn(missing_docs)]

pub mod trait_;
pub mod sqlite_storage;

pub use trait_::{Storage, StorageError, Result, LockAttempt};
pub use sqlite_storage::SqliteStorage;
