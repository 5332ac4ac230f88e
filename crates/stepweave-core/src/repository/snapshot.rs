//! Suspended-run snapshot store.

use dashmap::DashMap;
use stepweave_types::error::RepositoryError;
use stepweave_types::snapshot::{SnapshotSummary, SuspendedExecutionState};
use uuid::Uuid;

/// Durable home for suspended runs.
///
/// `take` loads and deletes in one operation, so a snapshot can be handed
/// to resume at most once.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait SnapshotStore: Send + Sync {
    /// Insert or replace the snapshot for its execution id.
    fn save(
        &self,
        snapshot: &SuspendedExecutionState,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Remove and return a snapshot. `None` if absent or already taken.
    fn take(
        &self,
        execution_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<SuspendedExecutionState>, RepositoryError>> + Send;

    /// List stored snapshots, most recently suspended first.
    fn list(&self) -> impl std::future::Future<Output = Result<Vec<SnapshotSummary>, RepositoryError>> + Send;
}

/// Process-local store, used by tests and single-process embedding.
#[derive(Debug, Default)]
pub struct InMemorySnapshotStore {
    snapshots: DashMap<Uuid, SuspendedExecutionState>,
}

impl InMemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }
}

impl SnapshotStore for InMemorySnapshotStore {
    async fn save(&self, snapshot: &SuspendedExecutionState) -> Result<(), RepositoryError> {
        self.snapshots.insert(snapshot.execution_id, snapshot.clone());
        Ok(())
    }

    async fn take(&self, execution_id: &Uuid) -> Result<Option<SuspendedExecutionState>, RepositoryError> {
        Ok(self.snapshots.remove(execution_id).map(|(_, snapshot)| snapshot))
    }

    async fn list(&self) -> Result<Vec<SnapshotSummary>, RepositoryError> {
        let mut rows: Vec<SnapshotSummary> = self
            .snapshots
            .iter()
            .map(|entry| SnapshotSummary::from(entry.value()))
            .collect();
        rows.sort_by(|a, b| b.suspended_at.cmp(&a.suspended_at));
        Ok(rows)
    }
}
