//! Git subprocess client
//!
//! All version-control work goes through this narrow command set, invoked
//! in the project directory with explicit argument arrays (no shell
//! strings). Non-zero exit codes surface the subprocess stderr as the
//! error cause. A failure to spawn the binary at all is treated as
//! transient and retried once.

use crate::{NocturnalError, Result};
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, warn};

#[derive(Clone)]
pub struct GitClient {
    project_path: PathBuf,
}

impl GitClient {
    pub fn new(project_path: impl Into<PathBuf>) -> Self {
        Self {
            project_path: project_path.into(),
        }
    }

    pub fn project_path(&self) -> &Path {
        &self.project_path
    }

    /// Verify the binary exists and the project is a repository.
    pub fn verify_available(&self) -> Result<()> {
        self.run(&["rev-parse", "--git-dir"]).map(|_| ())
    }

    pub fn current_branch(&self) -> Result<String> {
        self.run(&["branch", "--show-current"])
    }

    pub fn head_commit(&self) -> Result<String> {
        self.run(&["rev-parse", "HEAD"])
    }

    pub fn rev_parse(&self, reference: &str) -> Result<String> {
        Self::validate_ref(reference)?;
        self.run(&["rev-parse", reference])
    }

    pub fn checkout(&self, branch: &str) -> Result<()> {
        Self::validate_ref(branch)?;
        self.run(&["checkout", branch]).map(|_| ())
    }

    pub fn create_branch(&self, name: &str, base: &str) -> Result<()> {
        Self::validate_ref(name)?;
        Self::validate_ref(base)?;
        self.run(&["checkout", "-b", name, base]).map(|_| ())
    }

    pub fn delete_branch(&self, name: &str) -> Result<()> {
        Self::validate_ref(name)?;
        self.run(&["branch", "-D", name]).map(|_| ())
    }

    /// Stage the listed paths, or every change when the list is empty.
    pub fn add(&self, paths: &[String]) -> Result<()> {
        if paths.is_empty() {
            self.run(&["add", "-A"]).map(|_| ())
        } else {
            let mut args = vec!["add"];
            args.extend(paths.iter().map(String::as_str));
            self.run(&args).map(|_| ())
        }
    }

    pub fn commit(&self, message: &str) -> Result<()> {
        self.run(&["commit", "-m", message]).map(|_| ())
    }

    pub fn merge_no_ff(&self, branch: &str, message: &str) -> Result<()> {
        Self::validate_ref(branch)?;
        self.run(&["merge", "--no-ff", branch, "-m", message])
            .map(|_| ())
    }

    pub fn reset_hard(&self, reference: &str) -> Result<()> {
        Self::validate_ref(reference)?;
        self.run(&["reset", "--hard", reference]).map(|_| ())
    }

    pub fn clean_untracked(&self) -> Result<()> {
        self.run(&["clean", "-fd"]).map(|_| ())
    }

    /// Dry-run three-way merge; non-empty output indicates conflicts.
    pub fn merge_tree(&self, target_commit: &str, source_commit: &str) -> Result<String> {
        Self::validate_ref(target_commit)?;
        Self::validate_ref(source_commit)?;
        self.run(&["merge-tree", target_commit, source_commit])
    }

    pub fn bundle_create(&self, bundle_file: &Path) -> Result<()> {
        let file = bundle_file.to_string_lossy();
        self.run(&["bundle", "create", file.as_ref(), "--all"])
            .map(|_| ())
    }

    pub fn bundle_verify(&self, bundle_file: &Path) -> Result<()> {
        let file = bundle_file.to_string_lossy();
        self.run(&["bundle", "verify", file.as_ref()]).map(|_| ())
    }

    pub fn diff_name_only(&self, from: &str, to: &str) -> Result<Vec<String>> {
        Self::validate_ref(from)?;
        Self::validate_ref(to)?;
        let output = self.run(&["diff", "--name-only", from, to])?;
        Ok(output.lines().map(str::to_string).collect())
    }

    pub fn status_porcelain(&self) -> Result<String> {
        self.run(&["status", "--porcelain"])
    }

    pub fn has_uncommitted_changes(&self) -> Result<bool> {
        Ok(!self.status_porcelain()?.is_empty())
    }

    fn run(&self, args: &[&str]) -> Result<String> {
        let output = match self.spawn(args) {
            Ok(output) => output,
            Err(e) => {
                // One retry for transient spawn failures (binary busy,
                // interrupted), then convert to an operational error.
                warn!("[GitOps] Spawn failed, retrying once: {}", e);
                self.spawn(args).map_err(|e| NocturnalError::Git {
                    message: format!("failed to invoke git {}: {e}", args.join(" ")),
                })?
            }
        };

        if output.status.success() {
            let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
            debug!("[GitOps] git {} ok", args.join(" "));
            Ok(stdout)
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            Err(NocturnalError::Git {
                message: format!("git {} failed: {stderr}", args.join(" ")),
            })
        }
    }

    fn spawn(&self, args: &[&str]) -> std::io::Result<std::process::Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.project_path)
            .output()
    }

    /// Refs come from our own branch naming plus recorded commit hashes;
    /// reject anything that could smuggle flags or shell metacharacters.
    fn validate_ref(reference: &str) -> Result<()> {
        if reference.is_empty() || reference.starts_with('-') {
            return Err(NocturnalError::Validation(format!(
                "invalid git ref: {reference:?}"
            )));
        }
        let ok = reference
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '/' | '-' | '_' | '.' | '~' | '^'));
        if !ok {
            return Err(NocturnalError::Validation(format!(
                "invalid characters in git ref: {reference:?}"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::process::Command;
    use tempfile::TempDir;

    /// Initialize a scratch repository with one commit.
    pub(crate) fn init_repo() -> (TempDir, GitClient) {
        let dir = TempDir::new().unwrap();
        let run = |args: &[&str]| {
            let status = Command::new("git")
                .args(args)
                .current_dir(dir.path())
                .status()
                .unwrap();
            assert!(status.success(), "git {args:?} failed");
        };
        run(&["init", "-b", "main"]);
        run(&["config", "user.email", "night@localhost"]);
        run(&["config", "user.name", "Nocturnal"]);
        std::fs::write(dir.path().join("README.md"), "# scratch\n").unwrap();
        run(&["add", "-A"]);
        run(&["commit", "-m", "initial"]);

        let client = GitClient::new(dir.path());
        (dir, client)
    }

    #[test]
    fn reports_current_branch_and_head() {
        let (_dir, git) = init_repo();
        assert_eq!(git.current_branch().unwrap(), "main");
        let head = git.head_commit().unwrap();
        assert_eq!(head.len(), 40);
        assert_eq!(git.rev_parse("main").unwrap(), head);
    }

    #[test]
    fn branch_create_checkout_delete() {
        let (_dir, git) = init_repo();
        git.create_branch("feature/x", "HEAD").unwrap();
        assert_eq!(git.current_branch().unwrap(), "feature/x");

        git.checkout("main").unwrap();
        git.delete_branch("feature/x").unwrap();
        assert!(git.checkout("feature/x").is_err());
    }

    #[test]
    fn commit_and_diff_names() {
        let (dir, git) = init_repo();
        let base = git.head_commit().unwrap();

        std::fs::write(dir.path().join("lib.rs"), "pub fn f() {}\n").unwrap();
        git.add(&[]).unwrap();
        git.commit("add lib").unwrap();

        let changed = git.diff_name_only(&base, "HEAD").unwrap();
        assert_eq!(changed, vec!["lib.rs".to_string()]);
    }

    #[test]
    fn rejects_flag_like_refs() {
        let (_dir, git) = init_repo();
        assert!(git.checkout("--force").is_err());
        assert!(git.rev_parse("$(reboot)").is_err());
        assert!(git.delete_branch("a;b").is_err());
    }

    #[test]
    fn reset_hard_returns_to_commit() {
        let (dir, git) = init_repo();
        let base = git.head_commit().unwrap();

        std::fs::write(dir.path().join("junk.txt"), "junk\n").unwrap();
        git.add(&[]).unwrap();
        git.commit("junk").unwrap();
        assert_ne!(git.head_commit().unwrap(), base);

        git.reset_hard(&base).unwrap();
        assert_eq!(git.head_commit().unwrap(), base);
    }
}
