//! Dependency resolution for pipeline members.

use portline_core::UnitStatus;
use portline_storage::Storage;
use std::collections::HashMap;
use tracing::debug;

use crate::PipelineError;

/// Result of dependency resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// All dependencies complete, ready to execute
    Ready,
    /// Blocked by these units, in edge insertion order
    Blocked(Vec<String>),
}

impl Resolution {
    /// Whether the unit may start.
    pub fn is_ready(&self) -> bool {
        matches!(self, Resolution::Ready)
    }

    /// Prerequisites that are not complete.
    pub fn blocking(&self) -> &[String] {
        match self {
            Resolution::Ready => &[],
            Resolution::Blocked(ids) => ids,
        }
    }
}

/// Decide eligibility from a unit's prerequisites and a status lookup.
///
/// A prerequisite is blocking unless the lookup reports it complete; one
/// the lookup does not know is blocking too.
pub fn resolve<F>(dependencies: &[String], status_of: F) -> Resolution
where
    F: Fn(&str) -> Option<UnitStatus>,
{
    let blocked: Vec<String> = dependencies
        .iter()
        .filter(|dep| status_of(dep.as_str()) != Some(UnitStatus::Complete))
        .cloned()
        .collect();

    if blocked.is_empty() {
        Resolution::Ready
    } else {
        Resolution::Blocked(blocked)
    }
}

/// Resolves unit dependencies against pipeline-scoped statuses.
pub struct DependencyResolver;

impl DependencyResolver {
    /// Create a new resolver.
    pub fn new() -> Self {
        Self
    }

    /// Check whether `unit_id` may start within `pipeline_id`.
    ///
    /// Dependency edges are global; their statuses are read from the
    /// pipeline's membership records.
    pub async fn can_run(
        &self,
        storage: &dyn Storage,
        pipeline_id: &str,
        unit_id: &str,
    ) -> Result<Resolution, PipelineError> {
        if storage.load_pipeline(pipeline_id).await?.is_none() {
            return Err(PipelineError::PipelineNotFound(pipeline_id.to_string()));
        }

        let members = storage.list_members(pipeline_id).await?;
        if !members.iter().any(|m| m.unit_id == unit_id) {
            return Err(PipelineError::MemberNotFound {
                pipeline_id: pipeline_id.to_string(),
                unit_id: unit_id.to_string(),
            });
        }

        let statuses: HashMap<&str, UnitStatus> = members
            .iter()
            .map(|m| (m.unit_id.as_str(), m.status))
            .collect();

        let dependencies = storage.dependencies_of(unit_id).await?;
        let resolution = resolve(&dependencies, |id| statuses.get(id).copied());
        debug!("can_run {}/{}: {:?}", pipeline_id, unit_id, resolution);

        Ok(resolution)
    }

    /// Pending members whose dependencies are all complete, ordered by
    /// group order then unit ID.
    pub async fn ready_units(
        &self,
        storage: &dyn Storage,
        pipeline_id: &str,
    ) -> Result<Vec<String>, PipelineError> {
        if storage.load_pipeline(pipeline_id).await?.is_none() {
            return Err(PipelineError::PipelineNotFound(pipeline_id.to_string()));
        }

        let members = storage.list_members(pipeline_id).await?;
        let statuses: HashMap<&str, UnitStatus> = members
            .iter()
            .map(|m| (m.unit_id.as_str(), m.status))
            .collect();

        let mut ready = Vec::new();
        for member in members.iter().filter(|m| m.status == UnitStatus::Pending) {
            let dependencies = storage.dependencies_of(&member.unit_id).await?;
            if resolve(&dependencies, |id| statuses.get(id).copied()).is_ready() {
                ready.push(member.unit_id.clone());
            }
        }

        Ok(ready)
    }
}

impl Default for DependencyResolver {
    fn default() -> Self {
        Self::new()
    }
}
