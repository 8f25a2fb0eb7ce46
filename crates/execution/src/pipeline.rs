//! Pipeline service - membership, claims and status reports.

use chrono::Utc;
use portline_core::{
    DependencyEdge, Pipeline, PipelineMember, PipelineProgress, PipelineStatus, UnitStatus,
    WorkUnit,
};
use portline_storage::{Storage, StorageError};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::{DependencyResolver, PipelineError, Resolution};

/// Where a unit sits when it joins a pipeline.
#[derive(Debug, Clone, Default)]
pub struct UnitPlacement {
    /// Execution wave
    pub group_order: i64,
    /// Prerequisite units
    pub depends_on: Vec<String>,
}

impl UnitPlacement {
    /// Place a unit in a wave.
    pub fn new(group_order: i64) -> Self {
        Self {
            group_order,
            depends_on: Vec::new(),
        }
    }

    /// Set prerequisites.
    pub fn with_dependencies(mut self, depends_on: Vec<String>) -> Self {
        self.depends_on = depends_on;
        self
    }
}

/// A pipeline with its members and counts.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineDetail {
    /// The pipeline
    pub pipeline: Pipeline,
    /// Members in wave order
    pub members: Vec<PipelineMember>,
    /// Status tallies
    pub progress: PipelineProgress,
}

/// A unit with its prerequisites.
#[derive(Debug, Clone, Serialize)]
pub struct UnitDetail {
    /// The unit and its global status
    #[serde(flatten)]
    pub unit: WorkUnit,
    /// Prerequisite units, in insertion order
    pub depends_on: Vec<String>,
}

/// Manages pipelines over a shared store.
pub struct PipelineService<S: Storage> {
    storage: S,
    resolver: DependencyResolver,
}

impl<S: Storage> PipelineService<S> {
    /// Create a pipeline service.
    pub fn new(storage: S) -> Self {
        Self {
            storage,
            resolver: DependencyResolver::new(),
        }
    }

    /// Create an empty pipeline.
    pub async fn create(&self, id: &str, name: &str) -> Result<Pipeline, PipelineError> {
        require_id("pipeline id", id)?;

        let now = Utc::now();
        let pipeline = Pipeline {
            id: id.to_string(),
            name: if name.trim().is_empty() { id.to_string() } else { name.to_string() },
            status: PipelineStatus::Pending,
            created_at: now,
            updated_at: now,
        };

        self.storage.create_pipeline(&pipeline).await?;
        info!("Created pipeline {}", pipeline.id);
        Ok(pipeline)
    }

    /// All pipelines.
    pub async fn list(&self) -> Result<Vec<Pipeline>, PipelineError> {
        Ok(self.storage.list_pipelines().await?)
    }

    /// Load a pipeline.
    pub async fn get(&self, id: &str) -> Result<Pipeline, PipelineError> {
        self.storage
            .load_pipeline(id)
            .await?
            .ok_or_else(|| PipelineError::PipelineNotFound(id.to_string()))
    }

    /// Load a pipeline with its members and progress.
    pub async fn show(&self, id: &str) -> Result<PipelineDetail, PipelineError> {
        let pipeline = self.get(id).await?;
        let members = self.storage.list_members(id).await?;
        let progress = PipelineProgress::from_members(id, &members);
        Ok(PipelineDetail {
            pipeline,
            members,
            progress,
        })
    }

    /// Delete a pipeline and its memberships. Units and edges are kept.
    pub async fn delete(&self, id: &str) -> Result<(), PipelineError> {
        if !self.storage.delete_pipeline(id).await? {
            return Err(PipelineError::PipelineNotFound(id.to_string()));
        }
        info!("Deleted pipeline {}", id);
        Ok(())
    }

    /// Mark a pipeline cancelled and withdraw its pending members.
    ///
    /// Running members are left alone; their workers report as usual.
    pub async fn cancel(&self, id: &str) -> Result<Pipeline, PipelineError> {
        let pipeline = self.get(id).await?;
        if pipeline.status.is_terminal() {
            return Err(PipelineError::PipelineClosed {
                pipeline_id: id.to_string(),
                status: pipeline.status,
            });
        }

        for member in self.storage.list_members(id).await? {
            if member.status == UnitStatus::Pending {
                self.storage
                    .transition_member(
                        id,
                        &member.unit_id,
                        &[UnitStatus::Pending],
                        UnitStatus::Cancelled,
                    )
                    .await?;
            }
        }

        self.storage
            .set_pipeline_status(id, PipelineStatus::Cancelled)
            .await?;
        warn!("Cancelled pipeline {}", id);
        self.get(id).await
    }

    /// Add a unit to a pipeline, recording its prerequisites.
    ///
    /// Edges that would close a cycle are rejected and nothing is kept.
    pub async fn add_unit(
        &self,
        pipeline_id: &str,
        unit_id: &str,
        placement: UnitPlacement,
    ) -> Result<PipelineMember, PipelineError> {
        require_id("unit id", unit_id)?;
        for dep in &placement.depends_on {
            require_id("dependency id", dep)?;
        }
        self.require_open(pipeline_id).await?;

        let existing = self.storage.dependencies_of(unit_id).await?;
        let mut added = Vec::new();
        for dep in &placement.depends_on {
            let edge = DependencyEdge::new(unit_id, dep.as_str());
            if let Err(e) = self.storage.add_dependency(&edge).await {
                self.forget_edges(&added).await?;
                return Err(e.into());
            }
            if !existing.contains(dep) && !added.contains(&edge) {
                added.push(edge);
            }
        }

        let now = Utc::now();
        let member = PipelineMember {
            pipeline_id: pipeline_id.to_string(),
            unit_id: unit_id.to_string(),
            group_order: placement.group_order,
            status: UnitStatus::Pending,
            added_at: now,
            updated_at: now,
        };

        if let Err(e) = self.storage.add_member(&member).await {
            self.forget_edges(&added).await?;
            return Err(e.into());
        }

        info!(
            "Added {} to pipeline {} (group {}, {} dependencies)",
            unit_id,
            pipeline_id,
            placement.group_order,
            placement.depends_on.len()
        );
        Ok(member)
    }

    /// Remove a unit from a pipeline.
    pub async fn remove_unit(&self, pipeline_id: &str, unit_id: &str) -> Result<(), PipelineError> {
        self.get(pipeline_id).await?;
        if !self.storage.remove_member(pipeline_id, unit_id).await? {
            return Err(member_not_found(pipeline_id, unit_id));
        }
        info!("Removed {} from pipeline {}", unit_id, pipeline_id);
        self.refresh_status(pipeline_id).await?;
        Ok(())
    }

    /// Whether a member's prerequisites are complete.
    pub async fn can_run(
        &self,
        pipeline_id: &str,
        unit_id: &str,
    ) -> Result<Resolution, PipelineError> {
        self.resolver
            .can_run(&self.storage, pipeline_id, unit_id)
            .await
    }

    /// Pending members ready to start.
    pub async fn ready_units(&self, pipeline_id: &str) -> Result<Vec<String>, PipelineError> {
        self.resolver.ready_units(&self.storage, pipeline_id).await
    }

    /// Move a ready member from pending to running.
    ///
    /// Only one of several concurrent claimants succeeds; the rest get
    /// `AlreadyClaimed`.
    pub async fn claim(
        &self,
        pipeline_id: &str,
        unit_id: &str,
    ) -> Result<PipelineMember, PipelineError> {
        self.require_open(pipeline_id).await?;

        if let Resolution::Blocked(blocking) = self.can_run(pipeline_id, unit_id).await? {
            return Err(PipelineError::Blocked {
                unit_id: unit_id.to_string(),
                blocking,
            });
        }

        let claimed = self
            .storage
            .transition_member(
                pipeline_id,
                unit_id,
                &[UnitStatus::Pending],
                UnitStatus::Running,
            )
            .await?;

        let Some(member) = claimed else {
            let current = self
                .storage
                .load_member(pipeline_id, unit_id)
                .await?
                .ok_or_else(|| member_not_found(pipeline_id, unit_id))?;
            warn!("{} in {} already {}", unit_id, pipeline_id, current.status);
            return Err(PipelineError::AlreadyClaimed {
                unit_id: unit_id.to_string(),
                status: current.status,
            });
        };

        self.storage.set_unit_status(unit_id, UnitStatus::Running).await?;
        info!("Claimed {} in pipeline {}", unit_id, pipeline_id);
        self.refresh_status(pipeline_id).await?;
        Ok(member)
    }

    /// Record a member's new status.
    ///
    /// `Running` is only entered through [`claim`](Self::claim), and a unit
    /// must be running before it can complete or fail.
    pub async fn report(
        &self,
        pipeline_id: &str,
        unit_id: &str,
        status: UnitStatus,
    ) -> Result<PipelineMember, PipelineError> {
        if status == UnitStatus::Running {
            return Err(PipelineError::Validation(format!(
                "unit {} must be claimed to start running",
                unit_id
            )));
        }
        self.get(pipeline_id).await?;

        let from = UnitStatus::predecessors(status);
        let updated = self
            .storage
            .transition_member(pipeline_id, unit_id, &from, status)
            .await?;

        let Some(member) = updated else {
            let current = self
                .storage
                .load_member(pipeline_id, unit_id)
                .await?
                .ok_or_else(|| member_not_found(pipeline_id, unit_id))?;
            return Err(PipelineError::InvalidTransition {
                unit_id: unit_id.to_string(),
                from: current.status,
                to: status,
            });
        };

        self.storage.set_unit_status(unit_id, status).await?;
        info!("{} in pipeline {} is now {}", unit_id, pipeline_id, status);
        self.refresh_status(pipeline_id).await?;
        Ok(member)
    }

    /// Status tallies for a pipeline.
    pub async fn progress(&self, pipeline_id: &str) -> Result<PipelineProgress, PipelineError> {
        self.get(pipeline_id).await?;
        let members = self.storage.list_members(pipeline_id).await?;
        Ok(PipelineProgress::from_members(pipeline_id, &members))
    }

    /// A unit's global status and prerequisites.
    pub async fn unit(&self, unit_id: &str) -> Result<UnitDetail, PipelineError> {
        let unit = self
            .storage
            .load_unit(unit_id)
            .await?
            .ok_or_else(|| PipelineError::UnitNotFound(unit_id.to_string()))?;
        let depends_on = self.storage.dependencies_of(unit_id).await?;
        Ok(UnitDetail { unit, depends_on })
    }

    /// Every unit known to the store, by group order then ID.
    pub async fn units(&self) -> Result<Vec<WorkUnit>, PipelineError> {
        Ok(self.storage.list_units().await?)
    }

    /// Recompute the pipeline status from its members.
    ///
    /// The write never replaces `cancelled`, even if a cancel lands after
    /// the members were read.
    async fn refresh_status(&self, pipeline_id: &str) -> Result<(), PipelineError> {
        let progress = self.progress(pipeline_id).await?;
        if let Some(derived) = progress.derived_status() {
            if self
                .storage
                .update_derived_status(pipeline_id, derived)
                .await?
            {
                debug!("Pipeline {} is {}", pipeline_id, derived);
            }
        }
        Ok(())
    }

    async fn require_open(&self, pipeline_id: &str) -> Result<Pipeline, PipelineError> {
        let pipeline = self.get(pipeline_id).await?;
        if pipeline.status == PipelineStatus::Cancelled {
            return Err(PipelineError::PipelineClosed {
                pipeline_id: pipeline_id.to_string(),
                status: pipeline.status,
            });
        }
        Ok(pipeline)
    }

    async fn forget_edges(&self, edges: &[DependencyEdge]) -> Result<(), StorageError> {
        for edge in edges {
            self.storage.remove_dependency(edge).await?;
        }
        Ok(())
    }
}

fn require_id(what: &str, value: &str) -> Result<(), PipelineError> {
    if value.trim().is_empty() {
        return Err(PipelineError::Validation(format!("{} is empty", what)));
    }
    Ok(())
}

fn member_not_found(pipeline_id: &str, unit_id: &str) -> PipelineError {
    PipelineError::MemberNotFound {
        pipeline_id: pipeline_id.to_string(),
        unit_id: unit_id.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use portline_core::ErrorKind;
    use portline_storage::SqliteStorage;
    use std::sync::Arc;

    async fn service() -> PipelineService<SqliteStorage> {
        PipelineService::new(SqliteStorage::in_memory().await.unwrap())
    }

    async fn wave_plan() -> PipelineService<SqliteStorage> {
        let pipelines = service().await;
        pipelines.create("plan", "Wave plan").await.unwrap();
        pipelines.add_unit("plan", "X", UnitPlacement::new(1)).await.unwrap();
        for unit in ["Y", "Z"] {
            pipelines
                .add_unit(
                    "plan",
                    unit,
                    UnitPlacement::new(2).with_dependencies(vec!["X".to_string()]),
                )
                .await
                .unwrap();
        }
        pipelines
    }

    #[tokio::test]
    async fn test_create_and_duplicate() {
        let pipelines = service().await;
        let created = pipelines.create("p1", "").await.unwrap();
        assert_eq!(created.name, "p1");
        assert_eq!(created.status, PipelineStatus::Pending);

        let err = pipelines.create("p1", "again").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);

        let err = pipelines.create(" ", "blank").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[tokio::test]
    async fn test_claim_blocked_until_dependency_complete() {
        let pipelines = wave_plan().await;

        let err = pipelines.claim("plan", "Y").await.unwrap_err();
        match err {
            PipelineError::Blocked { blocking, .. } => assert_eq!(blocking, vec!["X"]),
            other => panic!("expected Blocked, got {:?}", other),
        }

        let claimed = pipelines.claim("plan", "X").await.unwrap();
        assert_eq!(claimed.status, UnitStatus::Running);
        assert_eq!(pipelines.get("plan").await.unwrap().status, PipelineStatus::Running);

        pipelines.report("plan", "X", UnitStatus::Complete).await.unwrap();
        assert_eq!(pipelines.ready_units("plan").await.unwrap(), vec!["Y", "Z"]);
        pipelines.claim("plan", "Y").await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_claims_single_winner() {
        let pipelines = Arc::new(wave_plan().await);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let pipelines = Arc::clone(&pipelines);
            handles.push(tokio::spawn(async move { pipelines.claim("plan", "X").await }));
        }

        let mut wins = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => wins += 1,
                Err(e) => assert!(matches!(e, PipelineError::AlreadyClaimed { .. })),
            }
        }
        assert_eq!(wins, 1);
    }

    #[tokio::test]
    async fn test_report_never_moves_backward() {
        let pipelines = wave_plan().await;
        pipelines.claim("plan", "X").await.unwrap();
        pipelines.report("plan", "X", UnitStatus::Complete).await.unwrap();

        let err = pipelines
            .report("plan", "X", UnitStatus::Failed)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(matches!(
            err,
            PipelineError::InvalidTransition { from: UnitStatus::Complete, .. }
        ));

        let err = pipelines
            .report("plan", "ghost", UnitStatus::Complete)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_report_cannot_bypass_claim() {
        let pipelines = wave_plan().await;

        let err = pipelines.report("plan", "Y", UnitStatus::Running).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);

        let err = pipelines.report("plan", "Y", UnitStatus::Complete).await.unwrap_err();
        assert!(matches!(
            err,
            PipelineError::InvalidTransition { from: UnitStatus::Pending, to: UnitStatus::Complete, .. }
        ));
        let err = pipelines.report("plan", "X", UnitStatus::Failed).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);

        let detail = pipelines.show("plan").await.unwrap();
        assert!(detail.members.iter().all(|m| m.status == UnitStatus::Pending));
        assert_eq!(detail.pipeline.status, PipelineStatus::Pending);
        assert_eq!(
            pipelines.can_run("plan", "Y").await.unwrap(),
            Resolution::Blocked(vec!["X".to_string()])
        );

        // Pending work may still be withdrawn without a claim
        pipelines.report("plan", "Y", UnitStatus::Skipped).await.unwrap();
    }

    #[tokio::test]
    async fn test_pipeline_status_follows_members() {
        let pipelines = wave_plan().await;
        pipelines.claim("plan", "X").await.unwrap();
        pipelines.report("plan", "X", UnitStatus::Complete).await.unwrap();
        pipelines.report("plan", "Y", UnitStatus::Skipped).await.unwrap();
        assert_eq!(pipelines.get("plan").await.unwrap().status, PipelineStatus::Running);

        pipelines.claim("plan", "Z").await.unwrap();
        pipelines.report("plan", "Z", UnitStatus::Failed).await.unwrap();
        assert_eq!(pipelines.get("plan").await.unwrap().status, PipelineStatus::Failed);

        let progress = pipelines.progress("plan").await.unwrap();
        assert_eq!(progress.total, 3);
        assert_eq!(progress.completed, 1);
        assert_eq!(progress.failed, 1);
        assert_eq!(progress.skipped, 1);
    }

    #[tokio::test]
    async fn test_cyclic_dependency_rejected_without_writes() {
        let pipelines = wave_plan().await;

        let err = pipelines
            .add_unit(
                "plan",
                "X",
                UnitPlacement::new(1).with_dependencies(vec!["Y".to_string()]),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);

        let err = pipelines
            .add_unit(
                "plan",
                "W",
                UnitPlacement::new(3).with_dependencies(vec!["Z".to_string(), "W".to_string()]),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);

        // The W -> Z edge added before the self edge failed was rolled back
        let resolver_view = pipelines.show("plan").await.unwrap();
        assert_eq!(resolver_view.members.len(), 3);
        assert!(pipelines.storage.dependencies_of("W").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_withdraws_pending() {
        let pipelines = wave_plan().await;
        pipelines.claim("plan", "X").await.unwrap();

        let cancelled = pipelines.cancel("plan").await.unwrap();
        assert_eq!(cancelled.status, PipelineStatus::Cancelled);

        let detail = pipelines.show("plan").await.unwrap();
        let statuses: Vec<_> = detail.members.iter().map(|m| m.status).collect();
        assert_eq!(
            statuses,
            vec![UnitStatus::Running, UnitStatus::Cancelled, UnitStatus::Cancelled]
        );

        // Running work may still report; the pipeline stays cancelled
        pipelines.report("plan", "X", UnitStatus::Complete).await.unwrap();
        assert_eq!(pipelines.get("plan").await.unwrap().status, PipelineStatus::Cancelled);

        let err = pipelines.add_unit("plan", "Q", UnitPlacement::new(1)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }

    #[tokio::test]
    async fn test_remove_and_delete() {
        let pipelines = wave_plan().await;
        pipelines.remove_unit("plan", "Z").await.unwrap();
        assert_eq!(
            pipelines.remove_unit("plan", "Z").await.unwrap_err().kind(),
            ErrorKind::NotFound
        );

        pipelines.delete("plan").await.unwrap();
        assert_eq!(pipelines.delete("plan").await.unwrap_err().kind(), ErrorKind::NotFound);
        assert!(pipelines.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_status_refresh_keeps_cancellation() {
        let pipelines = wave_plan().await;
        pipelines.claim("plan", "X").await.unwrap();

        // A cancel that commits after the members were read must survive
        // the derived status write.
        pipelines
            .storage
            .set_pipeline_status("plan", PipelineStatus::Cancelled)
            .await
            .unwrap();
        pipelines.refresh_status("plan").await.unwrap();
        assert_eq!(pipelines.get("plan").await.unwrap().status, PipelineStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_unit_global_status() {
        let pipelines = wave_plan().await;
        pipelines.claim("plan", "X").await.unwrap();

        let x = pipelines.unit("X").await.unwrap();
        assert_eq!(x.unit.status, UnitStatus::Running);
        assert!(x.depends_on.is_empty());

        pipelines.report("plan", "X", UnitStatus::Complete).await.unwrap();
        let y = pipelines.unit("Y").await.unwrap();
        assert_eq!(y.unit.status, UnitStatus::Pending);
        assert_eq!(y.depends_on, vec!["X"]);
        assert_eq!(pipelines.unit("X").await.unwrap().unit.status, UnitStatus::Complete);

        let ids: Vec<_> = pipelines.units().await.unwrap().into_iter().map(|u| u.id).collect();
        assert_eq!(ids, vec!["X", "Y", "Z"]);

        let err = pipelines.unit("ghost").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }
}
