use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;

use crate::election::ElectionStrategy;
use crate::error::{FarmError, Result};
use crate::model::{BucketId, BucketStatus};
use crate::notify::Notifier;
use crate::store::EntityStore;

/// Attempts for an operation failing with transient storage errors: a retry
/// nested in a retry.
pub const MAX_ATTEMPTS: u32 = 4;

/// Where diagnostics of an escalated failure are recorded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureScope {
    Bucket(BucketId),
    Project(String),
    General,
}

/// Runs units of work so that no failure escapes to the caller.
///
/// Transient storage errors are retried after reconnecting. Every other error,
/// and any panic, is recorded on the scope's entity and swallowed. Only
/// general failures are mailed to the admin address.
pub struct FailureBoundary {
    store: Arc<dyn EntityStore>,
    notifier: Arc<dyn Notifier>,
    election: Arc<dyn ElectionStrategy>,
    node_uri: String,
    admin_email: Option<String>,
    retry_delay: Duration,
}

impl FailureBoundary {
    pub fn new(
        store: Arc<dyn EntityStore>,
        notifier: Arc<dyn Notifier>,
        election: Arc<dyn ElectionStrategy>,
        node_uri: impl Into<String>,
    ) -> Self {
        Self {
            store,
            notifier,
            election,
            node_uri: node_uri.into(),
            admin_email: None,
            retry_delay: Duration::from_secs(3),
        }
    }

    pub fn with_admin_email(mut self, admin_email: Option<String>) -> Self {
        self.admin_email = admin_email;
        self
    }

    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    /// Run `operation`, returning `None` when it failed for good.
    pub async fn protect<T, F, Fut>(
        &self,
        subject: &str,
        scope: FailureScope,
        mut operation: F,
    ) -> Option<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 1;
        let error = loop {
            let result = AssertUnwindSafe(operation())
                .catch_unwind()
                .await
                .unwrap_or_else(|payload| Err(FarmError::Panic(panic_message(payload.as_ref()))));
            match result {
                Ok(value) => return Some(value),
                Err(e) if e.is_transient() && attempt < MAX_ATTEMPTS => {
                    tracing::warn!(subject, attempt, error = %e, "Storage connection lost, retrying with new connection");
                    self.store.disconnect();
                    if let Err(e) = self.store.reconnect() {
                        tracing::warn!(subject, error = %e, "Reconnect failed");
                    }
                    tokio::time::sleep(self.retry_delay).await;
                    attempt += 1;
                }
                Err(e) => break e,
            }
        };

        self.escalate(subject, &scope, &error).await;
        None
    }

    async fn escalate(&self, subject: &str, scope: &FailureScope, error: &FarmError) {
        let leader_uri = self
            .election
            .leader_uri()
            .await
            .unwrap_or_else(|| "<unknown>".to_string());
        let message = format!(
            "uri: {}\nleader_uri: {}\n\n{}\n\n{}",
            self.node_uri,
            leader_uri,
            error,
            source_chain(error)
        );
        tracing::error!(subject, scope = ?scope, error = %error, "{}", message);

        let recorded = match scope {
            FailureScope::Bucket(id) => self.record_on_bucket(*id, subject, &message),
            FailureScope::Project(name) => self.record_on_project(name, subject, &message),
            FailureScope::General => Ok(()),
        };
        if let Err(e) = recorded {
            tracing::error!(subject, error = %e, "Failed to record failure");
        }

        if let (FailureScope::General, Some(address)) = (scope, &self.admin_email) {
            self.notifier.send_general(subject, &message, address);
        }
    }

    /// Output streamed so far is moved into the bucket log ahead of the failure.
    fn record_on_bucket(&self, id: BucketId, subject: &str, message: &str) -> Result<()> {
        let mut bucket = self.store.bucket(id)?;
        let streamed = self.store.logs(id)?.concat();
        bucket.status = BucketStatus::ProcessingFailed;
        bucket.log = format!(
            "{}{}\n\n------ Processing failed ------\n\n{}\n\n{}",
            bucket.log, streamed, subject, message
        );
        self.store.save_bucket(&bucket)?;
        self.store.clear_logs(id)?;
        Ok(())
    }

    fn record_on_project(&self, name: &str, subject: &str, message: &str) -> Result<()> {
        let mut project = self.store.project(name)?;
        project.last_system_error = Some(format!("{}\n\n{}", subject, message));
        self.store.save_project(&project)?;
        Ok(())
    }
}

fn source_chain(error: &FarmError) -> String {
    let mut lines = Vec::new();
    let mut source = std::error::Error::source(error);
    while let Some(cause) = source {
        lines.push(format!("caused by: {}", cause));
        source = cause.source();
    }
    lines.join("\n")
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    use crate::election::StaticElection;
    use crate::error::StoreError;
    use crate::model::{Bucket, Build, NewBuild, Project, Repository, TaskDefinition};
    use crate::store::MemoryStore;

    #[derive(Default)]
    struct Mails(Mutex<Vec<(String, String, String)>>);

    impl Notifier for Mails {
        fn send_failure(&self, _: &Project, _: &Build, _: &Bucket) {}
        fn send_fixed(&self, _: &Project, _: &Build, _: &Bucket) {}
        fn send_general(&self, subject: &str, body: &str, recipient: &str) {
            self.0
                .lock()
                .unwrap()
                .push((subject.into(), body.into(), recipient.into()));
        }
    }

    fn setup() -> (Arc<MemoryStore>, Arc<Mails>, FailureBoundary) {
        let store = Arc::new(MemoryStore::new());
        store
            .save_project(&Project::new("p", Repository::default(), TaskDefinition::default()))
            .unwrap();
        let mails = Arc::new(Mails::default());
        let boundary = FailureBoundary::new(
            store.clone(),
            mails.clone(),
            Arc::new(StaticElection::leader("http://leader:1")),
            "http://worker:2",
        )
        .with_retry_delay(Duration::ZERO);
        (store, mails, boundary)
    }

    fn bucket(store: &MemoryStore) -> Bucket {
        let build = store
            .create_build(NewBuild {
                project: "p".into(),
                revision: "r1".into(),
                number: 1,
                leader_uri: "http://leader:1".into(),
            })
            .unwrap();
        store.create_bucket(build.id, "unit").unwrap()
    }

    #[tokio::test]
    async fn transient_errors_are_retried() {
        let (store, _, boundary) = setup();
        store.fail_next(3);
        let attempts = AtomicU32::new(0);

        let result = boundary
            .protect("reading project", FailureScope::General, || async {
                attempts.fetch_add(1, Ordering::SeqCst);
                Ok::<_, FarmError>(store.project("p")?.name)
            })
            .await;

        assert_eq!(result.as_deref(), Some("p"));
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
        assert_eq!(store.reconnects(), 3);
    }

    #[tokio::test]
    async fn gives_up_after_four_attempts() {
        let (store, _, boundary) = setup();
        store.fail_next(4);
        let attempts = AtomicU32::new(0);

        let result = boundary
            .protect("reading buckets", FailureScope::Project("p".into()), || async {
                attempts.fetch_add(1, Ordering::SeqCst);
                Ok::<_, FarmError>(store.project("p")?.name)
            })
            .await;

        assert_eq!(result, None);
        assert_eq!(attempts.load(Ordering::SeqCst), MAX_ATTEMPTS);
        let error = store.project("p").unwrap().last_system_error.unwrap();
        assert!(error.starts_with("reading buckets\n\nuri: http://worker:2\nleader_uri: http://leader:1"));
        assert!(error.contains("server has gone away"));
    }

    #[tokio::test]
    async fn other_errors_mark_bucket_processing_failed() {
        let (store, mails, boundary) = setup();
        let bucket = bucket(&store);

        let result: Option<()> = boundary
            .protect("processing bucket failed", FailureScope::Bucket(bucket.id), || async {
                Err::<(), _>(FarmError::HookFailed("db:prepare".into()))
            })
            .await;

        assert_eq!(result, None);
        let stored = store.bucket(bucket.id).unwrap();
        assert_eq!(stored.status, BucketStatus::ProcessingFailed);
        assert!(stored.log.contains("------ Processing failed ------"));
        assert!(stored.log.contains("Task hook failed: db:prepare"));
        // no admin address configured
        assert!(mails.0.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn streamed_output_survives_bucket_failure() {
        let (store, _, boundary) = setup();
        let bucket = bucket(&store);
        store.append_log(bucket.id, "compiling\n").unwrap();
        store.append_log(bucket.id, "step 2 of 5\n").unwrap();

        let result: Option<()> = boundary
            .protect("processing bucket failed", FailureScope::Bucket(bucket.id), || async {
                Err::<(), _>(FarmError::HookFailed("db:prepare".into()))
            })
            .await;

        assert_eq!(result, None);
        let stored = store.bucket(bucket.id).unwrap();
        let output = stored.log.find("compiling\nstep 2 of 5\n").unwrap();
        let failure = stored.log.find("------ Processing failed ------").unwrap();
        assert!(output < failure);
        assert!(store.logs(bucket.id).unwrap().is_empty());
    }

    #[tokio::test]
    async fn only_general_failures_are_mailed() {
        let (store, mails, boundary) = setup();
        let boundary = boundary.with_admin_email(Some("admin@example.com".into()));
        let bucket = bucket(&store);

        let _: Option<()> = boundary
            .protect("reading buckets failed", FailureScope::Project("p".into()), || async {
                Err::<(), _>(FarmError::Checkout("unreachable".into()))
            })
            .await;
        let _: Option<()> = boundary
            .protect("processing bucket failed", FailureScope::Bucket(bucket.id), || async {
                Err::<(), _>(FarmError::HookFailed("db:prepare".into()))
            })
            .await;
        assert!(mails.0.lock().unwrap().is_empty());
        assert!(store.project("p").unwrap().last_system_error.is_some());

        let _: Option<()> = boundary
            .protect("updating buckets failed", FailureScope::General, || async {
                Err::<(), _>(FarmError::Checkout("unreachable".into()))
            })
            .await;
        assert_eq!(mails.0.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn not_found_is_not_retried() {
        let (_, _, boundary) = setup();
        let attempts = AtomicU32::new(0);

        let result: Option<()> = boundary
            .protect("lookup", FailureScope::General, || async {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err::<(), FarmError>(StoreError::not_found("bucket", 99).into())
            })
            .await;

        assert_eq!(result, None);
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    async fn explode() -> Result<()> {
        panic!("worker exploded");
    }

    #[tokio::test]
    async fn panics_are_contained_and_mailed() {
        let (_, mails, boundary) = setup();
        let boundary = boundary.with_admin_email(Some("admin@example.com".into()));

        let result: Option<()> = boundary
            .protect("running worker failed", FailureScope::General, explode)
            .await;

        assert_eq!(result, None);
        let mails = mails.0.lock().unwrap();
        assert_eq!(mails.len(), 1);
        assert_eq!(mails[0].0, "running worker failed");
        assert!(mails[0].1.contains("worker exploded"));
        assert_eq!(mails[0].2, "admin@example.com");
    }
}
