use std::collections::HashMap;

use crate::model::BucketId;

/// Pending work and active assignments of one project.
#[derive(Debug, Default, Clone)]
struct ProjectQueue {
    /// Popped from the back.
    pending: Vec<BucketId>,
    active: usize,
}

/// Fair-share dispatcher handing out buckets across projects.
///
/// Every call to [`next`](Self::next) first releases the slot the requestor
/// held so far, then picks the project with the fewest active assignments
/// among those with pending buckets. Ties go to the project published first.
/// A requestor therefore stays on its project for as long as that project
/// remains among the least loaded ones.
#[derive(Debug, Default)]
pub struct BucketDispatcher {
    projects: HashMap<String, ProjectQueue>,
    /// Project names in order of their first publication.
    registration: Vec<String>,
    /// Project each requestor is currently counted against.
    assignments: HashMap<String, String>,
}

impl BucketDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the pending buckets of a project.
    ///
    /// The last id is dispatched first. The project's active count restarts
    /// at zero and requestors counted against it are forgotten.
    pub fn publish(&mut self, project: &str, bucket_ids: impl IntoIterator<Item = BucketId>) {
        if !self.projects.contains_key(project) {
            self.registration.push(project.to_string());
        }
        self.projects.insert(
            project.to_string(),
            ProjectQueue {
                pending: bucket_ids.into_iter().collect(),
                active: 0,
            },
        );
        self.assignments.retain(|_, assigned| assigned != project);
        tracing::debug!(
            project,
            pending = self.projects[project].pending.len(),
            "Buckets published"
        );
    }

    /// Next bucket to run on behalf of `requestor`.
    pub fn next(&mut self, requestor: &str) -> Option<BucketId> {
        if let Some(previous) = self.assignments.remove(requestor) {
            if let Some(queue) = self.projects.get_mut(&previous) {
                queue.active = queue.active.saturating_sub(1);
            }
        }

        let selected = self
            .registration
            .iter()
            .filter(|name| {
                self.projects
                    .get(*name)
                    .is_some_and(|q| !q.pending.is_empty())
            })
            .min_by_key(|name| self.projects.get(*name).map(|q| q.active).unwrap_or(usize::MAX))?
            .clone();

        let queue = self.projects.get_mut(&selected)?;
        let bucket_id = queue.pending.pop()?;
        queue.active += 1;
        tracing::debug!(
            project = %selected,
            requestor,
            bucket_id,
            active = queue.active,
            "Bucket dispatched"
        );
        self.assignments.insert(requestor.to_string(), selected);
        Some(bucket_id)
    }

    /// Undo a [`next`](Self::next) whose bucket could not be delivered.
    ///
    /// The bucket goes back on top of the project `requestor` was counted
    /// against, and the requestor no longer counts against it.
    pub fn give_back(&mut self, requestor: &str, bucket_id: BucketId) {
        let Some(project) = self.assignments.remove(requestor) else {
            return;
        };
        if let Some(queue) = self.projects.get_mut(&project) {
            queue.active = queue.active.saturating_sub(1);
            queue.pending.push(bucket_id);
        }
    }

    /// Whether `project` (or every project when `None`) has nothing pending.
    ///
    /// Unknown projects count as empty.
    pub fn is_empty(&self, project: Option<&str>) -> bool {
        match project {
            Some(name) => self
                .projects
                .get(name)
                .map_or(true, |q| q.pending.is_empty()),
            None => self.projects.values().all(|q| q.pending.is_empty()),
        }
    }

    /// Number of requestors currently counted against `project`.
    pub fn active(&self, project: &str) -> usize {
        self.projects.get(project).map_or(0, |q| q.active)
    }

    pub fn pending(&self, project: &str) -> Vec<BucketId> {
        self.projects
            .get(project)
            .map(|q| q.pending.clone())
            .unwrap_or_default()
    }

    /// Forget all projects and assignments.
    pub fn clear(&mut self) {
        self.projects.clear();
        self.registration.clear();
        self.assignments.clear();
    }
}
