//! Shared fixtures for the build farm integration tests.

#![allow(dead_code)]

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use buildfarm::boundary::FailureBoundary;
use buildfarm::checkout::{LocalCheckout, SourceCheckout};
use buildfarm::election::StaticElection;
use buildfarm::error::{FarmError, Result};
use buildfarm::model::{
    Bucket, BucketGroup, BucketId, BucketTasks, Build, NewBuild, Project, Repository,
    TaskDefinition,
};
use buildfarm::notify::Notifier;
use buildfarm::scheduler::LivenessProbe;
use buildfarm::store::memory::MemoryStore;
use buildfarm::store::EntityStore;
use buildfarm::worker::{BuildTool, TaskPipeline, TaskRunner};

pub const NODE_URI: &str = "http://127.0.0.1:50051";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    Failure { bucket: String, build: i64 },
    Fixed { bucket: String, build: i64 },
    General { subject: String, recipient: String },
}

/// Notifier that remembers everything it was asked to send.
#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().unwrap().clone()
    }

    pub fn failures(&self) -> usize {
        self.sent()
            .iter()
            .filter(|n| matches!(n, Notification::Failure { .. }))
            .count()
    }

    pub fn fixes(&self) -> usize {
        self.sent()
            .iter()
            .filter(|n| matches!(n, Notification::Fixed { .. }))
            .count()
    }
}

impl Notifier for RecordingNotifier {
    fn send_failure(&self, _project: &Project, build: &Build, bucket: &Bucket) {
        self.sent.lock().unwrap().push(Notification::Failure {
            bucket: bucket.name.clone(),
            build: build.number,
        });
    }

    fn send_fixed(&self, _project: &Project, build: &Build, bucket: &Bucket) {
        self.sent.lock().unwrap().push(Notification::Fixed {
            bucket: bucket.name.clone(),
            build: build.number,
        });
    }

    fn send_general(&self, subject: &str, _body: &str, recipient: &str) {
        self.sent.lock().unwrap().push(Notification::General {
            subject: subject.to_string(),
            recipient: recipient.to_string(),
        });
    }
}

/// Liveness probe answering from a fixed set of buckets.
#[derive(Default)]
pub struct ScriptedProbe {
    processing: Mutex<HashSet<BucketId>>,
    asked: Mutex<Vec<(String, BucketId)>>,
}

impl ScriptedProbe {
    pub fn set_processing(&self, ids: &[BucketId]) {
        *self.processing.lock().unwrap() = ids.iter().copied().collect();
    }

    pub fn asked(&self) -> Vec<(String, BucketId)> {
        self.asked.lock().unwrap().clone()
    }
}

#[async_trait]
impl LivenessProbe for ScriptedProbe {
    async fn is_processing(&self, worker_uri: &str, bucket_id: BucketId) -> bool {
        self.asked
            .lock()
            .unwrap()
            .push((worker_uri.to_string(), bucket_id));
        self.processing.lock().unwrap().contains(&bucket_id)
    }
}

/// Checkout reporting a settable upstream revision, or failing on demand.
pub struct ScriptedCheckout {
    local: LocalCheckout,
    revision: Mutex<Option<String>>,
    broken: Mutex<HashSet<String>>,
}

impl ScriptedCheckout {
    pub fn new(root: &Path) -> Self {
        Self {
            local: LocalCheckout::new(root),
            revision: Mutex::new(None),
            broken: Mutex::new(HashSet::new()),
        }
    }

    pub fn set_revision(&self, revision: &str) {
        *self.revision.lock().unwrap() = Some(revision.to_string());
    }

    pub fn break_project(&self, name: &str) {
        self.broken.lock().unwrap().insert(name.to_string());
    }
}

#[async_trait]
impl SourceCheckout for ScriptedCheckout {
    async fn update_to(&self, project: &Project, revision: &str) -> Result<PathBuf> {
        self.local.update_to(project, revision).await
    }

    async fn upstream_revision(&self, project: &Project) -> Result<Option<String>> {
        if self.broken.lock().unwrap().contains(&project.name) {
            return Err(FarmError::Checkout(format!(
                "repository of {} unreachable",
                project.name
            )));
        }
        Ok(self.revision.lock().unwrap().clone())
    }
}

/// A project with a single bucket group named `main`.
pub fn shell_project(name: &str, buckets: &[(&str, &[&str])]) -> Project {
    Project::new(
        name,
        Repository::default(),
        TaskDefinition {
            groups: vec![BucketGroup {
                name: "main".into(),
                buckets: buckets
                    .iter()
                    .map(|(bucket, tasks)| BucketTasks {
                        name: bucket.to_string(),
                        tasks: tasks.iter().map(|t| t.to_string()).collect(),
                    })
                    .collect(),
                ..Default::default()
            }],
            ..Default::default()
        },
    )
}

pub fn memory_store() -> Arc<MemoryStore> {
    Arc::new(MemoryStore::new())
}

/// Create the next build of `project` with one pending bucket per name.
pub fn create_build(store: &dyn EntityStore, project: &str, names: &[&str]) -> (Build, Vec<Bucket>) {
    let number = store.next_build_number(project).unwrap();
    let build = store
        .create_build(NewBuild {
            project: project.to_string(),
            revision: format!("r{}", number),
            number,
            leader_uri: NODE_URI.to_string(),
        })
        .unwrap();
    let buckets = names
        .iter()
        .map(|name| store.create_bucket(build.id, name).unwrap())
        .collect();
    (build, buckets)
}

pub fn shell_pipeline(
    store: Arc<MemoryStore>,
    root: &Path,
    notifier: Arc<RecordingNotifier>,
) -> TaskPipeline {
    let runner = TaskRunner::new(store.clone(), BuildTool::shell(), Duration::from_millis(50));
    TaskPipeline::new(store, Arc::new(LocalCheckout::new(root)), notifier, runner)
}

pub fn leader_boundary(
    store: Arc<MemoryStore>,
    notifier: Arc<RecordingNotifier>,
    admin_email: Option<&str>,
) -> FailureBoundary {
    FailureBoundary::new(
        store,
        notifier,
        Arc::new(StaticElection::leader(NODE_URI)),
        NODE_URI,
    )
    .with_admin_email(admin_email.map(str::to_string))
    .with_retry_delay(Duration::from_millis(10))
}
