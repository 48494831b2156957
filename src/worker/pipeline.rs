use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;

use crate::checkout::SourceCheckout;
use crate::error::{FarmError, Result};
use crate::model::{Bucket, BucketId, BucketStatus, BuildId};
use crate::notify::Notifier;
use crate::store::EntityStore;
use crate::worker::runner::{BucketLogSink, LogSink, TaskOutcome, TaskRunner};

/// Lines of log output quoted in a failure report.
const REPORT_LOG_LINES: usize = 40;

/// What a worker remembers between the buckets of one build.
#[derive(Debug, Default)]
pub struct PipelineMemo {
    last_handled_build: Option<BuildId>,
    prepared_groups: HashSet<String>,
    succeeded_before_all: Vec<String>,
}

impl PipelineMemo {
    /// Switch to `build`, forgetting everything learned about another build.
    pub fn enter_build(&mut self, build: BuildId) {
        if self.last_handled_build != Some(build) {
            self.prepared_groups.clear();
            self.succeeded_before_all.clear();
            self.last_handled_build = Some(build);
        }
    }

    pub fn last_handled_build(&self) -> Option<BuildId> {
        self.last_handled_build
    }

    pub fn is_prepared(&self, group: &str) -> bool {
        self.prepared_groups.contains(group)
    }

    /// Tasks of `tasks` that have not succeeded yet in this build.
    pub fn pending_before_all(&self, tasks: &[String]) -> Vec<String> {
        tasks
            .iter()
            .filter(|task| !self.succeeded_before_all.contains(task))
            .cloned()
            .collect()
    }
}

/// Runs the task groups of a bucket and records the result.
pub struct TaskPipeline {
    store: Arc<dyn EntityStore>,
    checkout: Arc<dyn SourceCheckout>,
    notifier: Arc<dyn Notifier>,
    runner: TaskRunner,
    memo: Mutex<PipelineMemo>,
}

impl TaskPipeline {
    pub fn new(
        store: Arc<dyn EntityStore>,
        checkout: Arc<dyn SourceCheckout>,
        notifier: Arc<dyn Notifier>,
        runner: TaskRunner,
    ) -> Self {
        Self {
            store,
            checkout,
            notifier,
            runner,
            memo: Mutex::new(PipelineMemo::default()),
        }
    }

    /// Process one bucket to a terminal status.
    ///
    /// Errors leave the bucket as it is; failing tasks do not count as errors
    /// but end in [`BucketStatus::Failed`].
    pub async fn perform(&self, bucket_id: BucketId) -> Result<BucketStatus> {
        let mut bucket = self.store.bucket(bucket_id)?;
        let build = self.store.build(bucket.build_id)?;
        let project = self.store.project(&build.project)?;
        tracing::info!(bucket_id, bucket = %bucket.name, project = %project.name, build = build.number, "Performing bucket");

        let tasks = &project.tasks;
        let group = tasks
            .bucket_group(&bucket.name)
            .ok_or_else(|| FarmError::UnknownBucket(bucket.name.clone()))?;

        self.store.clear_logs(bucket_id)?;
        let workdir = self.checkout.update_to(&project, &build.revision).await?;
        let sink = BucketLogSink::new(self.store.clone(), bucket_id);
        let mut failures = Vec::new();

        let mut memo = self.memo.lock().await;
        memo.enter_build(build.id);

        if !memo.is_prepared(&group.name) {
            if !tasks.before_each_bucket_group.is_empty() {
                let prepared = self
                    .run_tasks(&workdir, &tasks.before_each_bucket_group, &sink, &mut failures)
                    .await?;
                if !prepared {
                    return Err(FarmError::HookFailed(format!(
                        "preparing bucket group {}: {}",
                        group.name,
                        failures.join(", ")
                    )));
                }
            }
            memo.prepared_groups.insert(group.name.clone());
        }

        let mut succeeded = true;
        let before_all = memo.pending_before_all(&tasks.before_all_tasks(&bucket.name));
        if !before_all.is_empty() {
            succeeded = self
                .run_tasks(&workdir, &before_all, &sink, &mut failures)
                .await?;
            if succeeded {
                memo.succeeded_before_all.extend(before_all);
            }
        }
        drop(memo);

        if succeeded {
            succeeded = self
                .run_tasks(&workdir, &tasks.before_bucket_tasks(&bucket.name), &sink, &mut failures)
                .await?;
            if succeeded {
                succeeded = self
                    .run_tasks(&workdir, &tasks.bucket_tasks(&bucket.name), &sink, &mut failures)
                    .await?;
            }
            // cleanup runs whatever happened before
            let cleaned_up = self
                .run_tasks(&workdir, &tasks.after_bucket_tasks(&bucket.name), &sink, &mut failures)
                .await?;
            succeeded = cleaned_up && succeeded;
        }

        bucket.log = self.store.logs(bucket_id)?.concat();
        bucket.status = if succeeded {
            BucketStatus::Done
        } else {
            BucketStatus::Failed
        };
        bucket.finished_at = Some(Utc::now());
        bucket.error_log = if succeeded {
            None
        } else {
            Some(failure_report(&bucket, &failures))
        };
        self.store.save_bucket(&bucket)?;
        self.store.clear_logs(bucket_id)?;
        tracing::info!(bucket_id, bucket = %bucket.name, status = %bucket.status, "Bucket finished");

        if !succeeded {
            self.notifier.send_failure(&project, &build, &bucket);
        } else if let Some(previous) = self.store.last_build_before(&project.name, build.id)? {
            let was_broken = self
                .store
                .buckets(previous.id)?
                .iter()
                .any(|b| b.name == bucket.name && b.status != BucketStatus::Done);
            if was_broken {
                self.notifier.send_fixed(&project, &build, &bucket);
            }
        }

        Ok(bucket.status)
    }

    /// Run every task of `tasks`, reporting whether all of them succeeded.
    async fn run_tasks(
        &self,
        workdir: &Path,
        tasks: &[String],
        sink: &dyn LogSink,
        failures: &mut Vec<String>,
    ) -> Result<bool> {
        let mut succeeded = true;
        for task in tasks {
            match self.runner.run(workdir, task, sink).await? {
                TaskOutcome::Succeeded => {}
                TaskOutcome::Failed(termination) => {
                    failures.push(format!("{} ({})", task, termination));
                    succeeded = false;
                }
            }
        }
        Ok(succeeded)
    }
}

fn failure_report(bucket: &Bucket, failures: &[String]) -> String {
    let mut report = format!("Bucket {} failed.\n\nFailed tasks:\n", bucket.name);
    for failure in failures {
        report.push_str(&format!("  - {}\n", failure));
    }
    let lines: Vec<&str> = bucket.log.lines().collect();
    let tail = &lines[lines.len().saturating_sub(REPORT_LOG_LINES)..];
    if !tail.is_empty() {
        report.push_str("\nEnd of log:\n\n");
        report.push_str(&tail.join("\n"));
        report.push('\n');
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memo_resets_on_build_change() {
        let mut memo = PipelineMemo::default();
        memo.enter_build(1);
        memo.prepared_groups.insert("unit".into());
        memo.succeeded_before_all.push("setup".into());

        memo.enter_build(1);
        assert!(memo.is_prepared("unit"));
        assert_eq!(
            memo.pending_before_all(&["setup".into(), "db".into()]),
            vec!["db"]
        );

        memo.enter_build(2);
        assert_eq!(memo.last_handled_build(), Some(2));
        assert!(!memo.is_prepared("unit"));
        assert_eq!(memo.pending_before_all(&["setup".into()]), vec!["setup"]);
    }

    #[test]
    fn report_lists_failures_and_log_tail() {
        let mut bucket = Bucket::new(1, 1, "unit");
        bucket.log = (1..=100).map(|i| format!("line {}\n", i)).collect();
        let report = failure_report(&bucket, &["spec (exit code 1)".to_string()]);

        assert!(report.contains("  - spec (exit code 1)"));
        assert!(report.contains("line 100"));
        assert!(report.contains("line 61"));
        assert!(!report.contains("line 60\n"));
    }
}
