use crate::model::{Bucket, Build, Project};

/// Outbound notifications about bucket state changes and system errors.
pub trait Notifier: Send + Sync {
    /// A bucket finished in `failed` state.
    fn send_failure(&self, project: &Project, build: &Build, bucket: &Bucket);

    /// A bucket passed whose predecessor in the previous build did not.
    fn send_fixed(&self, project: &Project, build: &Build, bucket: &Bucket);

    fn send_general(&self, subject: &str, body: &str, recipient: &str);
}

/// Writes notifications to the tracing log instead of delivering mail.
#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn send_failure(&self, project: &Project, build: &Build, bucket: &Bucket) {
        tracing::warn!(
            project = %project.name,
            build = build.number,
            revision = %build.revision,
            bucket = %bucket.name,
            "Bucket failed"
        );
    }

    fn send_fixed(&self, project: &Project, build: &Build, bucket: &Bucket) {
        tracing::info!(
            project = %project.name,
            build = build.number,
            revision = %build.revision,
            bucket = %bucket.name,
            "Bucket fixed"
        );
    }

    fn send_general(&self, subject: &str, body: &str, recipient: &str) {
        tracing::error!(recipient, subject, body, "System notification");
    }
}
