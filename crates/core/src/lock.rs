//! Resource lock model.

use serde::{Deserialize, Serialize};
use crate::Time;

/// An advisory exclusive claim on a named resource.
///
/// At most one row per resource exists in the store at any instant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLock {
    /// Resource name (file, module or subsystem)
    pub resource: String,

    /// Identity of the session holding the lock
    pub holder: String,

    /// When the lock was granted
    pub acquired_at: Time,
}
