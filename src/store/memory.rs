use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard};

use crate::error::StoreError;
use crate::model::{Bucket, BucketId, Build, BuildId, NewBuild, Project};
use crate::store::{EntityStore, StoreResult};

#[derive(Debug, Default)]
struct MemoryState {
    projects: BTreeMap<String, Project>,
    builds: BTreeMap<BuildId, Build>,
    buckets: BTreeMap<BucketId, Bucket>,
    logs: HashMap<BucketId, Vec<String>>,
    last_build_id: BuildId,
    last_bucket_id: BucketId,
}

/// In-memory entity store.
///
/// Connection handling is only accounted for, operations never block on it.
/// [`MemoryStore::fail_next`] makes the following operations fail with a lost
/// connection.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    injected_failures: AtomicU32,
    disconnects: AtomicU32,
    reconnects: AtomicU32,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` operations with [`StoreError::ConnectionLost`].
    pub fn fail_next(&self, n: u32) {
        self.injected_failures.store(n, Ordering::SeqCst);
    }

    pub fn disconnects(&self) -> u32 {
        self.disconnects.load(Ordering::SeqCst)
    }

    pub fn reconnects(&self) -> u32 {
        self.reconnects.load(Ordering::SeqCst)
    }

    fn state(&self) -> StoreResult<MutexGuard<'_, MemoryState>> {
        let injected = self
            .injected_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if injected.is_ok() {
            return Err(StoreError::ConnectionLost(
                "server has gone away (injected)".to_string(),
            ));
        }
        self.state
            .lock()
            .map_err(|_| StoreError::Backend("memory store lock poisoned".to_string()))
    }
}

fn builds_of<'a>(state: &'a MemoryState, project: &'a str) -> impl Iterator<Item = &'a Build> {
    state.builds.values().filter(move |b| b.project == project)
}

impl EntityStore for MemoryStore {
    fn disconnect(&self) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
    }

    fn reconnect(&self) -> StoreResult<()> {
        self.reconnects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn projects(&self) -> StoreResult<Vec<Project>> {
        Ok(self.state()?.projects.values().cloned().collect())
    }

    fn project(&self, name: &str) -> StoreResult<Project> {
        self.state()?
            .projects
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::not_found("project", name))
    }

    fn save_project(&self, project: &Project) -> StoreResult<()> {
        self.state()?
            .projects
            .insert(project.name.clone(), project.clone());
        Ok(())
    }

    fn create_build(&self, build: NewBuild) -> StoreResult<Build> {
        let mut state = self.state()?;
        if !state.projects.contains_key(&build.project) {
            return Err(StoreError::not_found("project", &build.project));
        }
        state.last_build_id += 1;
        let build = Build {
            id: state.last_build_id,
            project: build.project,
            revision: build.revision,
            number: build.number,
            leader_uri: build.leader_uri,
            started_at: None,
            finished_at: None,
        };
        state.builds.insert(build.id, build.clone());
        Ok(build)
    }

    fn build(&self, id: BuildId) -> StoreResult<Build> {
        self.state()?
            .builds
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("build", id))
    }

    fn save_build(&self, build: &Build) -> StoreResult<()> {
        let mut state = self.state()?;
        match state.builds.get_mut(&build.id) {
            Some(existing) => {
                *existing = build.clone();
                Ok(())
            }
            None => Err(StoreError::not_found("build", build.id)),
        }
    }

    fn last_build(&self, project: &str) -> StoreResult<Option<Build>> {
        let state = self.state()?;
        Ok(builds_of(&state, project).max_by_key(|b| b.number).cloned())
    }

    fn last_build_before(&self, project: &str, build: BuildId) -> StoreResult<Option<Build>> {
        let state = self.state()?;
        let number = state
            .builds
            .get(&build)
            .map(|b| b.number)
            .ok_or_else(|| StoreError::not_found("build", build))?;
        Ok(builds_of(&state, project)
            .filter(|b| b.number < number)
            .max_by_key(|b| b.number)
            .cloned())
    }

    fn create_bucket(&self, build: BuildId, name: &str) -> StoreResult<Bucket> {
        let mut state = self.state()?;
        if !state.builds.contains_key(&build) {
            return Err(StoreError::not_found("build", build));
        }
        state.last_bucket_id += 1;
        let bucket = Bucket::new(state.last_bucket_id, build, name);
        state.buckets.insert(bucket.id, bucket.clone());
        Ok(bucket)
    }

    fn bucket(&self, id: BucketId) -> StoreResult<Bucket> {
        self.state()?
            .buckets
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("bucket", id))
    }

    fn save_bucket(&self, bucket: &Bucket) -> StoreResult<()> {
        let mut state = self.state()?;
        match state.buckets.get_mut(&bucket.id) {
            Some(existing) => {
                *existing = bucket.clone();
                Ok(())
            }
            None => Err(StoreError::not_found("bucket", bucket.id)),
        }
    }

    fn buckets(&self, build: BuildId) -> StoreResult<Vec<Bucket>> {
        Ok(self
            .state()?
            .buckets
            .values()
            .filter(|b| b.build_id == build)
            .cloned()
            .collect())
    }

    fn append_log(&self, bucket: BucketId, chunk: &str) -> StoreResult<()> {
        let mut state = self.state()?;
        if !state.buckets.contains_key(&bucket) {
            return Err(StoreError::not_found("bucket", bucket));
        }
        state.logs.entry(bucket).or_default().push(chunk.to_string());
        Ok(())
    }

    fn logs(&self, bucket: BucketId) -> StoreResult<Vec<String>> {
        Ok(self
            .state()?
            .logs
            .get(&bucket)
            .cloned()
            .unwrap_or_default())
    }

    fn clear_logs(&self, bucket: BucketId) -> StoreResult<()> {
        self.state()?.logs.remove(&bucket);
        Ok(())
    }
}
