use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::error::StoreError;
use crate::model::{
    Bucket, BucketId, BucketStatus, Build, BuildId, NewBuild, Project, Repository,
};
use crate::store::{EntityStore, StoreResult};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS projects (
    name TEXT PRIMARY KEY,
    repository_url TEXT NOT NULL,
    branch TEXT NOT NULL,
    current_revision TEXT,
    last_revision TEXT,
    build_requested INTEGER NOT NULL DEFAULT 0,
    last_system_error TEXT,
    tasks_json TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS builds (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    project TEXT NOT NULL REFERENCES projects(name),
    revision TEXT NOT NULL,
    number INTEGER NOT NULL,
    leader_uri TEXT NOT NULL,
    started_at TEXT,
    finished_at TEXT,
    UNIQUE (project, number)
);
CREATE TABLE IF NOT EXISTS buckets (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    build_id INTEGER NOT NULL REFERENCES builds(id),
    name TEXT NOT NULL,
    status INTEGER NOT NULL,
    worker_uri TEXT,
    started_at TEXT,
    finished_at TEXT,
    log TEXT NOT NULL DEFAULT '',
    error_log TEXT,
    dispatch_count INTEGER NOT NULL DEFAULT 0
);
CREATE TABLE IF NOT EXISTS logs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    bucket_id INTEGER NOT NULL REFERENCES buckets(id),
    log TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS buckets_by_build ON buckets(build_id);
CREATE INDEX IF NOT EXISTS logs_by_bucket ON logs(bucket_id);
";

const BUILD_COLUMNS: &str =
    "id, project, revision, number, leader_uri, started_at, finished_at";
const BUCKET_COLUMNS: &str =
    "id, build_id, name, status, worker_uri, started_at, finished_at, log, error_log, dispatch_count";

/// Entity store backed by a SQLite database file.
///
/// All worker processes of one host may open the same file.
pub struct SqliteStore {
    path: PathBuf,
    conn: Mutex<Option<Connection>>,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StoreError::Backend(format!("create {}: {}", parent.display(), e)))?;
            }
        }
        let conn = Self::connect(&path)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            path,
            conn: Mutex::new(Some(conn)),
        })
    }

    fn connect(path: &Path) -> StoreResult<Connection> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.query_row("PRAGMA journal_mode=WAL", [], |_| Ok(()))?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Ok(conn)
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> StoreResult<T>) -> StoreResult<T> {
        let guard: MutexGuard<'_, Option<Connection>> = self
            .conn
            .lock()
            .map_err(|_| StoreError::Backend("sqlite connection lock poisoned".to_string()))?;
        match guard.as_ref() {
            Some(conn) => f(conn),
            None => Err(StoreError::ConnectionLost(
                "connection has been released".to_string(),
            )),
        }
    }
}

fn timestamp(value: Option<DateTime<Utc>>) -> Option<String> {
    value.map(|t| t.to_rfc3339())
}

fn parse_timestamp(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
    })
    .transpose()
}

fn build_from_row(row: &Row<'_>) -> rusqlite::Result<Build> {
    Ok(Build {
        id: row.get(0)?,
        project: row.get(1)?,
        revision: row.get(2)?,
        number: row.get(3)?,
        leader_uri: row.get(4)?,
        started_at: parse_timestamp(row, 5)?,
        finished_at: parse_timestamp(row, 6)?,
    })
}

fn bucket_from_row(row: &Row<'_>) -> rusqlite::Result<Bucket> {
    let code: i64 = row.get(3)?;
    let status = BucketStatus::from_code(code).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            3,
            Type::Integer,
            format!("unknown bucket status {}", code).into(),
        )
    })?;
    Ok(Bucket {
        id: row.get(0)?,
        build_id: row.get(1)?,
        name: row.get(2)?,
        status,
        worker_uri: row.get(4)?,
        started_at: parse_timestamp(row, 5)?,
        finished_at: parse_timestamp(row, 6)?,
        log: row.get(7)?,
        error_log: row.get(8)?,
        dispatch_count: row.get(9)?,
    })
}

fn project_from_row(row: &Row<'_>) -> rusqlite::Result<(Project, String)> {
    let project = Project {
        name: row.get(0)?,
        repository: Repository {
            url: row.get(1)?,
            branch: row.get(2)?,
        },
        current_revision: row.get(3)?,
        last_revision: row.get(4)?,
        build_requested: row.get(5)?,
        last_system_error: row.get(6)?,
        tasks: Default::default(),
    };
    Ok((project, row.get(7)?))
}

fn with_tasks((mut project, tasks_json): (Project, String)) -> StoreResult<Project> {
    project.tasks = serde_json::from_str(&tasks_json)?;
    Ok(project)
}

impl EntityStore for SqliteStore {
    fn disconnect(&self) {
        match self.conn.lock() {
            Ok(mut guard) => {
                guard.take();
            }
            Err(_) => tracing::warn!("sqlite connection lock poisoned on disconnect"),
        }
    }

    fn reconnect(&self) -> StoreResult<()> {
        let conn = Self::connect(&self.path)?;
        let mut guard = self
            .conn
            .lock()
            .map_err(|_| StoreError::Backend("sqlite connection lock poisoned".to_string()))?;
        *guard = Some(conn);
        tracing::debug!(path = %self.path.display(), "Storage connection established");
        Ok(())
    }

    fn projects(&self) -> StoreResult<Vec<Project>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT name, repository_url, branch, current_revision, last_revision,
                        build_requested, last_system_error, tasks_json
                 FROM projects ORDER BY name",
            )?;
            let rows = stmt.query_map([], project_from_row)?;
            let mut projects = Vec::new();
            for row in rows {
                projects.push(with_tasks(row?)?);
            }
            Ok(projects)
        })
    }

    fn project(&self, name: &str) -> StoreResult<Project> {
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT name, repository_url, branch, current_revision, last_revision,
                            build_requested, last_system_error, tasks_json
                     FROM projects WHERE name = ?1",
                    [name],
                    project_from_row,
                )
                .optional()?
                .ok_or_else(|| StoreError::not_found("project", name))?;
            with_tasks(row)
        })
    }

    fn save_project(&self, project: &Project) -> StoreResult<()> {
        let tasks_json = serde_json::to_string(&project.tasks)?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO projects (name, repository_url, branch, current_revision,
                        last_revision, build_requested, last_system_error, tasks_json)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(name) DO UPDATE SET
                    repository_url = excluded.repository_url,
                    branch = excluded.branch,
                    current_revision = excluded.current_revision,
                    last_revision = excluded.last_revision,
                    build_requested = excluded.build_requested,
                    last_system_error = excluded.last_system_error,
                    tasks_json = excluded.tasks_json",
                params![
                    project.name,
                    project.repository.url,
                    project.repository.branch,
                    project.current_revision,
                    project.last_revision,
                    project.build_requested,
                    project.last_system_error,
                    tasks_json,
                ],
            )?;
            Ok(())
        })
    }

    fn create_build(&self, build: NewBuild) -> StoreResult<Build> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO builds (project, revision, number, leader_uri) VALUES (?1, ?2, ?3, ?4)",
                params![build.project, build.revision, build.number, build.leader_uri],
            )?;
            Ok(Build {
                id: conn.last_insert_rowid(),
                project: build.project,
                revision: build.revision,
                number: build.number,
                leader_uri: build.leader_uri,
                started_at: None,
                finished_at: None,
            })
        })
    }

    fn build(&self, id: BuildId) -> StoreResult<Build> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {} FROM builds WHERE id = ?1", BUILD_COLUMNS),
                [id],
                build_from_row,
            )
            .optional()?
            .ok_or_else(|| StoreError::not_found("build", id))
        })
    }

    fn save_build(&self, build: &Build) -> StoreResult<()> {
        self.with_conn(|conn| {
            let updated = conn.execute(
                "UPDATE builds SET revision = ?2, number = ?3, leader_uri = ?4,
                        started_at = ?5, finished_at = ?6
                 WHERE id = ?1",
                params![
                    build.id,
                    build.revision,
                    build.number,
                    build.leader_uri,
                    timestamp(build.started_at),
                    timestamp(build.finished_at),
                ],
            )?;
            if updated == 0 {
                return Err(StoreError::not_found("build", build.id));
            }
            Ok(())
        })
    }

    fn last_build(&self, project: &str) -> StoreResult<Option<Build>> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    &format!(
                        "SELECT {} FROM builds WHERE project = ?1 ORDER BY number DESC LIMIT 1",
                        BUILD_COLUMNS
                    ),
                    [project],
                    build_from_row,
                )
                .optional()?)
        })
    }

    fn last_build_before(&self, project: &str, build: BuildId) -> StoreResult<Option<Build>> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    &format!(
                        "SELECT {} FROM builds
                         WHERE project = ?1
                           AND number < (SELECT number FROM builds WHERE id = ?2)
                         ORDER BY number DESC LIMIT 1",
                        BUILD_COLUMNS
                    ),
                    params![project, build],
                    build_from_row,
                )
                .optional()?)
        })
    }

    fn create_bucket(&self, build: BuildId, name: &str) -> StoreResult<Bucket> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO buckets (build_id, name, status) VALUES (?1, ?2, ?3)",
                params![build, name, BucketStatus::Pending.code()],
            )?;
            Ok(Bucket::new(conn.last_insert_rowid(), build, name))
        })
    }

    fn bucket(&self, id: BucketId) -> StoreResult<Bucket> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {} FROM buckets WHERE id = ?1", BUCKET_COLUMNS),
                [id],
                bucket_from_row,
            )
            .optional()?
            .ok_or_else(|| StoreError::not_found("bucket", id))
        })
    }

    fn save_bucket(&self, bucket: &Bucket) -> StoreResult<()> {
        self.with_conn(|conn| {
            let updated = conn.execute(
                "UPDATE buckets SET name = ?2, status = ?3, worker_uri = ?4, started_at = ?5,
                        finished_at = ?6, log = ?7, error_log = ?8, dispatch_count = ?9
                 WHERE id = ?1",
                params![
                    bucket.id,
                    bucket.name,
                    bucket.status.code(),
                    bucket.worker_uri,
                    timestamp(bucket.started_at),
                    timestamp(bucket.finished_at),
                    bucket.log,
                    bucket.error_log,
                    bucket.dispatch_count,
                ],
            )?;
            if updated == 0 {
                return Err(StoreError::not_found("bucket", bucket.id));
            }
            Ok(())
        })
    }

    fn buckets(&self, build: BuildId) -> StoreResult<Vec<Bucket>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM buckets WHERE build_id = ?1 ORDER BY id",
                BUCKET_COLUMNS
            ))?;
            let rows = stmt.query_map([build], bucket_from_row)?;
            let mut buckets = Vec::new();
            for row in rows {
                buckets.push(row?);
            }
            Ok(buckets)
        })
    }

    fn append_log(&self, bucket: BucketId, chunk: &str) -> StoreResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO logs (bucket_id, log) VALUES (?1, ?2)",
                params![bucket, chunk],
            )?;
            Ok(())
        })
    }

    fn logs(&self, bucket: BucketId) -> StoreResult<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT log FROM logs WHERE bucket_id = ?1 ORDER BY id")?;
            let rows = stmt.query_map([bucket], |row| row.get::<_, String>(0))?;
            let mut logs = Vec::new();
            for row in rows {
                logs.push(row?);
            }
            Ok(logs)
        })
    }

    fn clear_logs(&self, bucket: BucketId) -> StoreResult<()> {
        self.with_conn(|conn| {
            conn.execute("DELETE FROM logs WHERE bucket_id = ?1", [bucket])?;
            Ok(())
        })
    }
}
