use std::path::Path;

/// How a named build task is turned into a process invocation.
///
/// A task runs as `program args... task` inside the project checkout. When
/// `manifest` exists in the checkout, `manifest_prefix` is put in front, e.g.
/// `bundle exec rake <task>` next to a `Gemfile`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildTool {
    pub program: String,
    pub args: Vec<String>,
    pub manifest: Option<String>,
    pub manifest_prefix: Vec<String>,
    /// Scratch file receiving stdout and stderr, relative to the checkout.
    pub log_file: String,
}

impl Default for BuildTool {
    fn default() -> Self {
        Self {
            program: "rake".to_string(),
            args: Vec::new(),
            manifest: Some("Gemfile".to_string()),
            manifest_prefix: vec!["bundle".to_string(), "exec".to_string()],
            log_file: "rake.log".to_string(),
        }
    }
}

impl BuildTool {
    /// Run every task as a shell snippet: `sh -c <task>`.
    pub fn shell() -> Self {
        Self {
            program: "sh".to_string(),
            args: vec!["-c".to_string()],
            manifest: None,
            manifest_prefix: Vec::new(),
            log_file: "task.log".to_string(),
        }
    }

    /// Full argument vector for `task` in `workdir`, program first.
    pub fn command_line(&self, workdir: &Path, task: &str) -> Vec<String> {
        let mut command = Vec::new();
        if let Some(manifest) = &self.manifest {
            if workdir.join(manifest).exists() {
                command.extend(self.manifest_prefix.iter().cloned());
            }
        }
        command.push(self.program.clone());
        command.extend(self.args.iter().cloned());
        command.push(task.to_string());
        command
    }

    pub fn log_path(&self, workdir: &Path) -> std::path::PathBuf {
        workdir.join(&self.log_file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_invocation_without_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let tool = BuildTool::default();
        assert_eq!(tool.command_line(dir.path(), "test"), vec!["rake", "test"]);
    }

    #[test]
    fn manifest_adds_prefix() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Gemfile"), "source 'https://rubygems.org'\n").unwrap();
        let tool = BuildTool::default();
        assert_eq!(
            tool.command_line(dir.path(), "spec:models"),
            vec!["bundle", "exec", "rake", "spec:models"]
        );
    }

    #[test]
    fn shell_tool_passes_task_as_script() {
        let dir = tempfile::tempdir().unwrap();
        let tool = BuildTool::shell();
        assert_eq!(
            tool.command_line(dir.path(), "echo hi && exit 3"),
            vec!["sh", "-c", "echo hi && exit 3"]
        );
        assert_eq!(tool.log_path(dir.path()), dir.path().join("task.log"));
    }
}
