use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use tokio::sync::Mutex;

use crate::boundary::{FailureBoundary, FailureScope};
use crate::checkout::SourceCheckout;
use crate::error::Result;
use crate::model::{Bucket, BucketId, BucketStatus, NewBuild, Project};
use crate::scheduler::dispatcher::BucketDispatcher;
use crate::store::EntityStore;

/// Buckets dispatched more recently than this count as being processed.
const DISPATCH_GRACE_SECS: i64 = 10;

/// Asks a worker whether it is still processing a bucket.
#[async_trait]
pub trait LivenessProbe: Send + Sync {
    /// `false` whenever the worker cannot be reached.
    async fn is_processing(&self, worker_uri: &str, bucket_id: BucketId) -> bool;
}

/// Work only the elected leader does: computing builds and buckets, and
/// handing buckets out to requestors.
pub struct LeaderDuties {
    store: Arc<dyn EntityStore>,
    checkout: Arc<dyn SourceCheckout>,
    dispatcher: Mutex<BucketDispatcher>,
    node_uri: String,
    max_dispatches: u32,
}

impl LeaderDuties {
    pub fn new(
        store: Arc<dyn EntityStore>,
        checkout: Arc<dyn SourceCheckout>,
        node_uri: impl Into<String>,
        max_dispatches: u32,
    ) -> Self {
        Self {
            store,
            checkout,
            dispatcher: Mutex::new(BucketDispatcher::new()),
            node_uri: node_uri.into(),
            max_dispatches,
        }
    }

    /// Forget all pending work, e.g. after leadership changed hands.
    pub async fn reset(&self) {
        self.dispatcher.lock().await.clear();
    }

    pub async fn pending(&self, project: &str) -> Vec<BucketId> {
        self.dispatcher.lock().await.pending(project)
    }

    /// Hand the next bucket to `requestor_uri` and mark it in work.
    ///
    /// The dispatcher stays locked until the bucket is stored as in work. A
    /// bucket that cannot be stored goes back to the dispatcher.
    pub async fn assign_next_bucket(&self, requestor_uri: &str) -> Result<Option<BucketId>> {
        let mut dispatcher = self.dispatcher.lock().await;
        let bucket_id = match dispatcher.next(requestor_uri) {
            Some(id) => id,
            None => return Ok(None),
        };

        match self.mark_in_work(bucket_id, requestor_uri) {
            Ok(bucket) => {
                tracing::info!(bucket_id, bucket = %bucket.name, requestor = requestor_uri, "Delivering bucket");
                Ok(Some(bucket_id))
            }
            Err(e) => {
                tracing::warn!(bucket_id, requestor = requestor_uri, error = %e, "Returning undeliverable bucket");
                dispatcher.give_back(requestor_uri, bucket_id);
                Err(e)
            }
        }
    }

    /// The bucket is saved last, so a failure leaves it pending.
    fn mark_in_work(&self, bucket_id: BucketId, requestor_uri: &str) -> Result<Bucket> {
        let now = Utc::now();
        let mut bucket = self.store.bucket(bucket_id)?;
        let mut build = self.store.build(bucket.build_id)?;
        if build.started_at.is_none() {
            build.started_at = Some(now);
            self.store.save_build(&build)?;
        }

        bucket.status = BucketStatus::InWork;
        bucket.worker_uri = Some(requestor_uri.to_string());
        bucket.started_at = Some(now);
        bucket.dispatch_count += 1;
        self.store.save_bucket(&bucket)?;
        Ok(bucket)
    }

    /// Recompute the pending buckets of every project not currently in build.
    ///
    /// Each project is handled inside `boundary`, a failing project only
    /// records its error and does not hold up the others.
    pub async fn update_buckets(
        &self,
        probe: &dyn LivenessProbe,
        boundary: &FailureBoundary,
    ) -> Result<()> {
        tracing::debug!("Updating buckets");
        for project in self.store.projects()? {
            let name = project.name;
            boundary
                .protect("reading buckets failed", FailureScope::Project(name.clone()), || {
                    self.update_project(&name, probe)
                })
                .await;
        }
        Ok(())
    }

    async fn update_project(&self, name: &str, probe: &dyn LivenessProbe) -> Result<()> {
        let project = self.store.project(name)?;
        {
            // bucket statuses of the project only change together with its queue
            let mut dispatcher = self.dispatcher.lock().await;
            if self.in_build(&dispatcher, &project, probe).await? {
                tracing::debug!(project = %name, "Project in build");
                return Ok(());
            }

            let requeued = self.requeue_stalled(&project)?;
            if !requeued.is_empty() {
                tracing::info!(project = %name, buckets = ?requeued, "Requeueing stalled buckets");
                dispatcher.publish(name, requeued);
                return Ok(());
            }
        }

        // the queue is empty and only this loop publishes to it
        self.finish_last_build(&project)?;
        let bucket_ids = self.read_buckets(project).await?;
        self.dispatcher.lock().await.publish(name, bucket_ids);
        Ok(())
    }

    /// Whether the project still has work queued or being processed.
    ///
    /// Open buckets of the last build that no worker confirms are marked
    /// `processing_failed`. Liveness of all buckets is collected before any
    /// status changes.
    async fn in_build(
        &self,
        dispatcher: &BucketDispatcher,
        project: &Project,
        probe: &dyn LivenessProbe,
    ) -> Result<bool> {
        if !dispatcher.is_empty(Some(&project.name)) {
            return Ok(true);
        }
        let build = match self.store.last_build(&project.name)? {
            Some(build) => build,
            None => return Ok(false),
        };

        let grace_start = Utc::now() - ChronoDuration::seconds(DISPATCH_GRACE_SECS);
        let mut checked: Vec<(Bucket, bool)> = Vec::new();
        for bucket in self.store.buckets(build.id)? {
            if bucket.status.is_terminal() {
                continue;
            }
            let processing = match (bucket.status, bucket.worker_uri.as_deref()) {
                (BucketStatus::InWork, Some(_)) if bucket.started_at.is_some_and(|t| t > grace_start) => true,
                (BucketStatus::InWork, Some(worker_uri)) => {
                    probe.is_processing(worker_uri, bucket.id).await
                }
                _ => false,
            };
            checked.push((bucket, processing));
        }

        let mut in_build = false;
        for (mut bucket, processing) in checked {
            if processing {
                in_build = true;
                continue;
            }
            tracing::info!(
                bucket_id = bucket.id,
                bucket = %bucket.name,
                status = %bucket.status,
                worker = ?bucket.worker_uri,
                "Setting bucket to processing failed"
            );
            bucket.status = BucketStatus::ProcessingFailed;
            self.store.save_bucket(&bucket)?;
        }
        Ok(in_build)
    }

    /// Put stalled buckets of an unfinished last build back to pending.
    fn requeue_stalled(&self, project: &Project) -> Result<Vec<BucketId>> {
        let build = match self.store.last_build(&project.name)? {
            Some(build) if build.finished_at.is_none() => build,
            _ => return Ok(Vec::new()),
        };
        let mut requeued = Vec::new();
        for mut bucket in self.store.buckets(build.id)? {
            if bucket.status == BucketStatus::ProcessingFailed
                && bucket.dispatch_count < self.max_dispatches
            {
                bucket.status = BucketStatus::Pending;
                bucket.worker_uri = None;
                self.store.save_bucket(&bucket)?;
                requeued.push(bucket.id);
            }
        }
        Ok(requeued)
    }

    fn finish_last_build(&self, project: &Project) -> Result<()> {
        if let Some(mut build) = self.store.last_build(&project.name)? {
            if build.finished_at.is_none() {
                tracing::info!(project = %project.name, build = build.number, "Marking build as finished");
                build.finished_at = Some(Utc::now());
                self.store.save_build(&build)?;
            }
        }
        Ok(())
    }

    /// Create a build with one pending bucket per bucket name if the project
    /// is due, returning the new bucket ids.
    async fn read_buckets(&self, mut project: Project) -> Result<Vec<BucketId>> {
        if let Some(revision) = self.checkout.upstream_revision(&project).await? {
            project.current_revision = Some(revision);
        }

        let mut bucket_ids = Vec::new();
        if project.wants_build() {
            let number = self.store.next_build_number(&project.name)?;
            let build = self.store.create_build(NewBuild {
                project: project.name.clone(),
                revision: project
                    .current_revision
                    .clone()
                    .unwrap_or_else(|| "HEAD".to_string()),
                number,
                leader_uri: self.node_uri.clone(),
            })?;
            for name in project.tasks.bucket_names() {
                bucket_ids.push(self.store.create_bucket(build.id, &name)?.id);
            }
            project.mark_built();
            tracing::info!(
                project = %project.name,
                build = build.number,
                revision = %build.revision,
                buckets = bucket_ids.len(),
                "Created build"
            );
        }
        project.last_system_error = None;
        self.store.save_project(&project)?;
        Ok(bucket_ids)
    }
}
