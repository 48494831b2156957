use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type BuildId = i64;
pub type BucketId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BucketStatus {
    Pending,
    InWork,
    ProcessingFailed,
    Done,
    Failed,
}

impl BucketStatus {
    /// Storage code of the status.
    pub fn code(self) -> i64 {
        match self {
            BucketStatus::Done => 10,
            BucketStatus::Pending => 20,
            BucketStatus::InWork => 30,
            BucketStatus::ProcessingFailed => 35,
            BucketStatus::Failed => 40,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            10 => Some(BucketStatus::Done),
            20 => Some(BucketStatus::Pending),
            30 => Some(BucketStatus::InWork),
            35 => Some(BucketStatus::ProcessingFailed),
            40 => Some(BucketStatus::Failed),
            _ => None,
        }
    }

    /// Pending and in-work buckets still need a worker.
    pub fn is_terminal(self) -> bool {
        !matches!(self, BucketStatus::Pending | BucketStatus::InWork)
    }
}

impl std::fmt::Display for BucketStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BucketStatus::Pending => write!(f, "pending"),
            BucketStatus::InWork => write!(f, "in_work"),
            BucketStatus::ProcessingFailed => write!(f, "processing_failed"),
            BucketStatus::Done => write!(f, "done"),
            BucketStatus::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Repository {
    pub url: String,
    #[serde(default = "default_branch")]
    pub branch: String,
}

fn default_branch() -> String {
    "master".to_string()
}

/// The tasks of one bucket.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketTasks {
    pub name: String,
    pub tasks: Vec<String>,
}

/// Buckets sharing the same preparation and cleanup tasks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketGroup {
    pub name: String,
    #[serde(default)]
    pub before_all: Vec<String>,
    #[serde(default)]
    pub before_bucket: Vec<String>,
    #[serde(default)]
    pub after_bucket: Vec<String>,
    pub buckets: Vec<BucketTasks>,
}

/// Ordered task definition of a project.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskDefinition {
    /// Run once per worker and build before the first bucket.
    #[serde(default)]
    pub before_all: Vec<String>,
    /// Run whenever a worker starts on a bucket group it has not prepared yet.
    #[serde(default)]
    pub before_each_bucket_group: Vec<String>,
    pub groups: Vec<BucketGroup>,
}

impl TaskDefinition {
    pub fn bucket_group(&self, bucket: &str) -> Option<&BucketGroup> {
        self.groups
            .iter()
            .find(|g| g.buckets.iter().any(|b| b.name == bucket))
    }

    pub fn bucket_names(&self) -> Vec<String> {
        self.groups
            .iter()
            .flat_map(|g| g.buckets.iter().map(|b| b.name.clone()))
            .collect()
    }

    pub fn before_all_tasks(&self, bucket: &str) -> Vec<String> {
        let mut tasks = self.before_all.clone();
        if let Some(group) = self.bucket_group(bucket) {
            tasks.extend(group.before_all.iter().cloned());
        }
        tasks
    }

    pub fn before_bucket_tasks(&self, bucket: &str) -> Vec<String> {
        self.bucket_group(bucket)
            .map(|g| g.before_bucket.clone())
            .unwrap_or_default()
    }

    pub fn bucket_tasks(&self, bucket: &str) -> Vec<String> {
        self.bucket_group(bucket)
            .and_then(|g| g.buckets.iter().find(|b| b.name == bucket))
            .map(|b| b.tasks.clone())
            .unwrap_or_default()
    }

    pub fn after_bucket_tasks(&self, bucket: &str) -> Vec<String> {
        self.bucket_group(bucket)
            .map(|g| g.after_bucket.clone())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    pub name: String,
    pub repository: Repository,
    /// Latest known upstream revision.
    #[serde(default)]
    pub current_revision: Option<String>,
    /// Revision of the most recently created build.
    #[serde(default)]
    pub last_revision: Option<String>,
    #[serde(default)]
    pub build_requested: bool,
    #[serde(default)]
    pub last_system_error: Option<String>,
    pub tasks: TaskDefinition,
}

impl Project {
    pub fn new(name: impl Into<String>, repository: Repository, tasks: TaskDefinition) -> Self {
        Self {
            name: name.into(),
            repository,
            current_revision: None,
            last_revision: None,
            build_requested: false,
            last_system_error: None,
            tasks,
        }
    }

    /// A build is due on explicit request or when upstream moved on.
    pub fn wants_build(&self) -> bool {
        self.build_requested
            || (self.current_revision.is_some() && self.current_revision != self.last_revision)
    }

    pub fn mark_built(&mut self) {
        self.last_revision = self.current_revision.clone();
        self.build_requested = false;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Build {
    pub id: BuildId,
    pub project: String,
    pub revision: String,
    pub number: i64,
    pub leader_uri: String,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Fields of a build about to be created.
#[derive(Debug, Clone)]
pub struct NewBuild {
    pub project: String,
    pub revision: String,
    pub number: i64,
    pub leader_uri: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bucket {
    pub id: BucketId,
    pub build_id: BuildId,
    pub name: String,
    pub status: BucketStatus,
    pub worker_uri: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub log: String,
    pub error_log: Option<String>,
    pub dispatch_count: u32,
}

impl Bucket {
    pub fn new(id: BucketId, build_id: BuildId, name: impl Into<String>) -> Self {
        Self {
            id,
            build_id,
            name: name.into(),
            status: BucketStatus::Pending,
            worker_uri: None,
            started_at: None,
            finished_at: None,
            log: String::new(),
            error_log: None,
            dispatch_count: 0,
        }
    }
}

impl std::fmt::Display for Bucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{} ({})", self.name, self.id, self.status)
    }
}
