use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::process::Command;

use crate::error::{FarmError, Result};
use crate::model::Project;

/// Working copies of project sources.
#[async_trait]
pub trait SourceCheckout: Send + Sync {
    /// Bring the project's working copy to `revision`, returning its path.
    async fn update_to(&self, project: &Project, revision: &str) -> Result<PathBuf>;

    /// Latest revision of the tracked branch, if it can be determined.
    async fn upstream_revision(&self, project: &Project) -> Result<Option<String>>;
}

/// Git working copies below a common root, one directory per project.
#[derive(Debug, Clone)]
pub struct GitCheckout {
    root: PathBuf,
}

impl GitCheckout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path(&self, project: &Project) -> PathBuf {
        self.root.join(&project.name)
    }

    async fn git(dir: &Path, args: &[&str]) -> Result<String> {
        let output = Command::new("git")
            .args(args)
            .current_dir(dir)
            .output()
            .await?;
        if !output.status.success() {
            return Err(FarmError::Checkout(format!(
                "git {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

#[async_trait]
impl SourceCheckout for GitCheckout {
    async fn update_to(&self, project: &Project, revision: &str) -> Result<PathBuf> {
        let path = self.path(project);
        if !path.join(".git").exists() {
            tokio::fs::create_dir_all(&self.root).await?;
            let target = path.to_string_lossy().to_string();
            tracing::info!(project = %project.name, url = %project.repository.url, "Cloning repository");
            Self::git(&self.root, &["clone", &project.repository.url, &target]).await?;
        }
        Self::git(&path, &["fetch", "origin"]).await?;
        let target = if revision == "HEAD" {
            format!("origin/{}", project.repository.branch)
        } else {
            revision.to_string()
        };
        Self::git(&path, &["checkout", "--force", &target]).await?;
        tracing::debug!(project = %project.name, revision = %target, "Checkout updated");
        Ok(path)
    }

    async fn upstream_revision(&self, project: &Project) -> Result<Option<String>> {
        let head = format!("refs/heads/{}", project.repository.branch);
        tokio::fs::create_dir_all(&self.root).await?;
        let listing = Self::git(&self.root, &["ls-remote", &project.repository.url, &head]).await?;
        Ok(listing
            .split_whitespace()
            .next()
            .map(|revision| revision.to_string()))
    }
}

/// Fixed directories used as they are, one per project.
///
/// The upstream revision is whatever the project record carries.
#[derive(Debug, Clone)]
pub struct LocalCheckout {
    root: PathBuf,
}

impl LocalCheckout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl SourceCheckout for LocalCheckout {
    async fn update_to(&self, project: &Project, _revision: &str) -> Result<PathBuf> {
        let path = self.root.join(&project.name);
        tokio::fs::create_dir_all(&path).await?;
        Ok(path)
    }

    async fn upstream_revision(&self, project: &Project) -> Result<Option<String>> {
        Ok(project.current_revision.clone())
    }
}
