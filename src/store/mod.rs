//! Durable entity storage for projects, builds, buckets and their logs.
//!
//! The worker engine only talks to storage through [`EntityStore`]. Two
//! implementations ship with the crate:
//!
//! - [`MemoryStore`]: process-local, with fault injection for tests
//! - [`SqliteStore`]: a SQLite file shared by every node on one host
//!
//! Every process owns exactly one storage connection. Before a build task is
//! spawned the connection is released and re-established right after, see
//! [`ConnectionRelease`].

pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use crate::error::StoreError;
use crate::model::{Bucket, BucketId, Build, BuildId, NewBuild, Project};

pub type StoreResult<T> = std::result::Result<T, StoreError>;

pub trait EntityStore: Send + Sync {
    /// Drop the current connection handle.
    fn disconnect(&self);

    /// Establish a fresh connection handle.
    fn reconnect(&self) -> StoreResult<()>;

    fn projects(&self) -> StoreResult<Vec<Project>>;
    fn project(&self, name: &str) -> StoreResult<Project>;
    /// Insert or replace a project.
    fn save_project(&self, project: &Project) -> StoreResult<()>;

    fn create_build(&self, build: NewBuild) -> StoreResult<Build>;
    fn build(&self, id: BuildId) -> StoreResult<Build>;
    fn save_build(&self, build: &Build) -> StoreResult<()>;
    /// Build with the highest number of the project.
    fn last_build(&self, project: &str) -> StoreResult<Option<Build>>;
    /// Most recent build of the project ordered before `build`.
    fn last_build_before(&self, project: &str, build: BuildId) -> StoreResult<Option<Build>>;

    /// Create a pending bucket.
    fn create_bucket(&self, build: BuildId, name: &str) -> StoreResult<Bucket>;
    fn bucket(&self, id: BucketId) -> StoreResult<Bucket>;
    fn save_bucket(&self, bucket: &Bucket) -> StoreResult<()>;
    fn buckets(&self, build: BuildId) -> StoreResult<Vec<Bucket>>;

    fn append_log(&self, bucket: BucketId, chunk: &str) -> StoreResult<()>;
    /// Log fragments of a bucket in append order.
    fn logs(&self, bucket: BucketId) -> StoreResult<Vec<String>>;
    fn clear_logs(&self, bucket: BucketId) -> StoreResult<()>;

    /// Store a project definition, keeping the runtime state of a project
    /// that is already known.
    fn register_project(&self, definition: &Project) -> StoreResult<Project> {
        let project = match self.project(&definition.name) {
            Ok(mut existing) => {
                existing.repository = definition.repository.clone();
                existing.tasks = definition.tasks.clone();
                existing
            }
            Err(StoreError::NotFound { .. }) => definition.clone(),
            Err(e) => return Err(e),
        };
        self.save_project(&project)?;
        Ok(project)
    }

    fn next_build_number(&self, project: &str) -> StoreResult<i64> {
        Ok(self.last_build(project)?.map(|b| b.number + 1).unwrap_or(1))
    }
}

/// Releases the store connection for the lifetime of the guard.
///
/// The connection is re-established when the guard drops, on every exit path.
pub struct ConnectionRelease<'a> {
    store: &'a dyn EntityStore,
}

impl<'a> ConnectionRelease<'a> {
    pub fn new(store: &'a dyn EntityStore) -> Self {
        store.disconnect();
        Self { store }
    }
}

impl Drop for ConnectionRelease<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.store.reconnect() {
            // The next storage call reports the lost connection and is retried
            tracing::warn!(error = %e, "Failed to re-establish storage connection");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Repository, TaskDefinition};

    #[test]
    fn connection_release_reconnects_on_drop() {
        let store = MemoryStore::new();
        {
            let _released = ConnectionRelease::new(&store);
            assert_eq!(store.disconnects(), 1);
            assert_eq!(store.reconnects(), 0);
        }
        assert_eq!(store.reconnects(), 1);
    }

    #[test]
    fn register_project_keeps_runtime_state() {
        let store = MemoryStore::new();
        let mut project = Project::new("p", Repository::default(), TaskDefinition::default());
        store.register_project(&project).unwrap();

        let mut stored = store.project("p").unwrap();
        stored.last_revision = Some("abc".into());
        stored.build_requested = true;
        store.save_project(&stored).unwrap();

        project.repository.url = "git://new".into();
        let registered = store.register_project(&project).unwrap();
        assert_eq!(registered.repository.url, "git://new");
        assert_eq!(registered.last_revision.as_deref(), Some("abc"));
        assert!(registered.build_requested);
    }
}
