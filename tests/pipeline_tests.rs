mod common;

use std::sync::Arc;

use buildfarm::error::FarmError;
use buildfarm::model::{BucketGroup, BucketStatus, BucketTasks, Project, Repository, TaskDefinition};
use buildfarm::store::EntityStore;
use common::{create_build, memory_store, shell_pipeline, shell_project, RecordingNotifier};

#[tokio::test]
async fn failing_then_fixed_bucket_notifies_once_each() {
    let root = tempfile::tempdir().unwrap();
    let store = memory_store();
    let notifier = Arc::new(RecordingNotifier::default());
    store
        .register_project(&shell_project(
            "app",
            &[("check", &["test -f fixed || { echo broken; exit 1; }"])],
        ))
        .unwrap();
    let pipeline = shell_pipeline(store.clone(), root.path(), notifier.clone());

    let (_, buckets) = create_build(store.as_ref(), "app", &["check"]);
    let status = pipeline.perform(buckets[0].id).await.unwrap();
    assert_eq!(status, BucketStatus::Failed);

    let failed = store.bucket(buckets[0].id).unwrap();
    assert_eq!(failed.status, BucketStatus::Failed);
    assert!(failed.log.contains("broken"));
    assert!(failed.finished_at.is_some());
    let report = failed.error_log.unwrap();
    assert!(report.contains("exit code 1"));
    assert!(store.logs(buckets[0].id).unwrap().is_empty());
    assert_eq!(notifier.failures(), 1);
    assert_eq!(notifier.fixes(), 0);

    std::fs::write(root.path().join("app").join("fixed"), "").unwrap();
    let (_, buckets) = create_build(store.as_ref(), "app", &["check"]);
    let status = pipeline.perform(buckets[0].id).await.unwrap();
    assert_eq!(status, BucketStatus::Done);
    assert!(store.bucket(buckets[0].id).unwrap().error_log.is_none());
    assert_eq!(notifier.failures(), 1);
    assert_eq!(notifier.fixes(), 1);

    // still passing, nothing to report
    let (_, buckets) = create_build(store.as_ref(), "app", &["check"]);
    pipeline.perform(buckets[0].id).await.unwrap();
    assert_eq!(notifier.failures(), 1);
    assert_eq!(notifier.fixes(), 1);
}

#[tokio::test]
async fn every_task_of_a_list_runs() {
    let root = tempfile::tempdir().unwrap();
    let store = memory_store();
    let notifier = Arc::new(RecordingNotifier::default());
    store
        .register_project(&shell_project("app", &[("check", &["exit 1", "touch second"])]))
        .unwrap();
    let pipeline = shell_pipeline(store.clone(), root.path(), notifier);

    let (_, buckets) = create_build(store.as_ref(), "app", &["check"]);
    assert_eq!(
        pipeline.perform(buckets[0].id).await.unwrap(),
        BucketStatus::Failed
    );
    assert!(root.path().join("app").join("second").exists());
}

fn grouped_project(before_bucket: &str) -> Project {
    Project::new(
        "app",
        Repository::default(),
        TaskDefinition {
            before_all: vec!["echo run >> before_all.txt".into()],
            before_each_bucket_group: vec![],
            groups: vec![BucketGroup {
                name: "unit".into(),
                before_all: vec![],
                before_bucket: vec![before_bucket.into()],
                after_bucket: vec!["echo cleanup >> cleanup.txt".into()],
                buckets: vec![
                    BucketTasks {
                        name: "unit:a".into(),
                        tasks: vec!["echo a >> ran.txt".into()],
                    },
                    BucketTasks {
                        name: "unit:b".into(),
                        tasks: vec!["echo b >> ran.txt".into()],
                    },
                ],
            }],
        },
    )
}

fn lines(path: std::path::PathBuf) -> Vec<String> {
    std::fs::read_to_string(path)
        .unwrap_or_default()
        .lines()
        .map(str::to_string)
        .collect()
}

#[tokio::test]
async fn failed_preparation_skips_bucket_but_cleans_up() {
    let root = tempfile::tempdir().unwrap();
    let store = memory_store();
    let notifier = Arc::new(RecordingNotifier::default());
    store.register_project(&grouped_project("exit 1")).unwrap();
    let pipeline = shell_pipeline(store.clone(), root.path(), notifier.clone());

    let (_, buckets) = create_build(store.as_ref(), "app", &["unit:a"]);
    assert_eq!(
        pipeline.perform(buckets[0].id).await.unwrap(),
        BucketStatus::Failed
    );

    let workdir = root.path().join("app");
    assert!(lines(workdir.join("ran.txt")).is_empty());
    assert_eq!(lines(workdir.join("cleanup.txt")), vec!["cleanup"]);
    assert_eq!(notifier.failures(), 1);
}

#[tokio::test]
async fn before_all_runs_once_per_build() {
    let root = tempfile::tempdir().unwrap();
    let store = memory_store();
    let notifier = Arc::new(RecordingNotifier::default());
    store.register_project(&grouped_project("true")).unwrap();
    let pipeline = shell_pipeline(store.clone(), root.path(), notifier);
    let workdir = root.path().join("app");

    let (_, buckets) = create_build(store.as_ref(), "app", &["unit:a", "unit:b"]);
    for bucket in &buckets {
        assert_eq!(
            pipeline.perform(bucket.id).await.unwrap(),
            BucketStatus::Done
        );
    }
    assert_eq!(lines(workdir.join("before_all.txt")).len(), 1);
    assert_eq!(lines(workdir.join("ran.txt")), vec!["a", "b"]);
    assert_eq!(lines(workdir.join("cleanup.txt")).len(), 2);

    let (_, buckets) = create_build(store.as_ref(), "app", &["unit:a"]);
    pipeline.perform(buckets[0].id).await.unwrap();
    assert_eq!(lines(workdir.join("before_all.txt")).len(), 2);
}

#[tokio::test]
async fn failed_group_hook_is_an_error() {
    let root = tempfile::tempdir().unwrap();
    let store = memory_store();
    let notifier = Arc::new(RecordingNotifier::default());
    let mut project = grouped_project("true");
    project.tasks.before_each_bucket_group = vec!["exit 2".into()];
    store.register_project(&project).unwrap();
    let pipeline = shell_pipeline(store.clone(), root.path(), notifier.clone());

    let (_, buckets) = create_build(store.as_ref(), "app", &["unit:a"]);
    let err = pipeline.perform(buckets[0].id).await.unwrap_err();
    assert!(matches!(err, FarmError::HookFailed(_)));
    assert_eq!(store.bucket(buckets[0].id).unwrap().status, BucketStatus::Pending);
    assert_eq!(notifier.failures(), 0);
}

#[tokio::test]
async fn bucket_outside_the_definition_is_an_error() {
    let root = tempfile::tempdir().unwrap();
    let store = memory_store();
    let notifier = Arc::new(RecordingNotifier::default());
    store.register_project(&grouped_project("true")).unwrap();
    let pipeline = shell_pipeline(store.clone(), root.path(), notifier);

    let (_, buckets) = create_build(store.as_ref(), "app", &["unit:gone"]);
    let err = pipeline.perform(buckets[0].id).await.unwrap_err();
    assert!(matches!(err, FarmError::UnknownBucket(name) if name == "unit:gone"));
}
