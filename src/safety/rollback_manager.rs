//! Rollback points and recovery operations
//!
//! A rollback point captures the git commit/branch, an optional full
//! backup, and a file-hash snapshot of the project. Rollback operations
//! restore one of those representations; verification requires the
//! current commit to equal the target's and at least 95% of snapshot
//! hashes to match. Only one rollback runs at a time per project.

use crate::config::RollbackConfig;
use crate::constants::ROLLBACK_VERIFICATION_RATE;
use crate::safety::backup_manager::{BackupManager, BackupType};
use crate::storage::JsonStore;
use crate::vcs::GitClient;
use crate::{NocturnalError, Result};
use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Directories never included in file-hash snapshots
const SNAPSHOT_EXCLUDED_DIRS: [&str; 7] = [
    ".git",
    ".nocturnal",
    "target",
    "node_modules",
    ".venv",
    "build",
    "dist",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackType {
    GitReset,
    FileRestore,
    FullRestore,
    Selective,
    Incremental,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Verified,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackPoint {
    pub rollback_id: String,
    pub timestamp: DateTime<Utc>,
    pub git_commit: Option<String>,
    pub git_branch: String,
    pub backup_id: Option<String>,
    pub description: String,
    /// Relative file path -> SHA-256 content hash
    pub files_snapshot: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationReport {
    pub git_commit_match: bool,
    pub file_match_rate: f64,
    pub overall_success: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackOperation {
    pub operation_id: String,
    pub rollback_type: RollbackType,
    pub target_rollback_id: String,
    pub status: RollbackStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub files_affected: Vec<String>,
    pub errors: Vec<String>,
    pub verification: Option<VerificationReport>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RollbackManagerStatus {
    pub rollback_points_count: usize,
    pub operations_count: usize,
    pub recent_success_rate: f64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RollbackState {
    points: Vec<RollbackPoint>,
    history: Vec<RollbackOperation>,
}

pub struct RollbackManager {
    project_path: PathBuf,
    backup_manager: Arc<BackupManager>,
    max_rollback_points: usize,
    max_history: usize,
    auto_verify: bool,
    create_rollback_backup: bool,
    git: GitClient,
    points_store: JsonStore,
    history_store: JsonStore,
    state: Mutex<RollbackState>,
    /// Held for the duration of one rollback; a second concurrent
    /// rollback is refused.
    in_progress: Mutex<()>,
}

impl RollbackManager {
    pub fn new(
        project_path: &Path,
        backup_manager: Arc<BackupManager>,
        config: &RollbackConfig,
    ) -> Self {
        let rollback_dir = project_path.join(".nocturnal/rollbacks");
        Self {
            project_path: project_path.to_path_buf(),
            backup_manager,
            max_rollback_points: config.max_rollback_points,
            max_history: config.max_rollback_history,
            auto_verify: config.auto_verify_rollbacks,
            create_rollback_backup: config.create_rollback_backup,
            git: GitClient::new(project_path),
            points_store: JsonStore::new(rollback_dir.join("rollback_points.json")),
            history_store: JsonStore::new(rollback_dir.join("rollback_history.json")),
            state: Mutex::new(RollbackState::default()),
            in_progress: Mutex::new(()),
        }
    }

    pub async fn load(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(points) = self.points_store.load::<Vec<RollbackPoint>>().await? {
            state.points = points;
        }
        if let Some(history) = self.history_store.load::<Vec<RollbackOperation>>().await? {
            state.history = history;
        }
        if !state.points.is_empty() {
            info!("Loaded {} rollback points", state.points.len());
        }
        Ok(())
    }

    /// Capture the current state as a restoration target.
    pub async fn create_rollback_point(&self, description: &str) -> Result<RollbackPoint> {
        let rollback_id = format!("rp_{}", Local::now().format("%Y%m%d_%H%M%S_%f"));
        info!("Creating rollback point: {}", rollback_id);

        let (git_commit, git_branch) = match (self.git.head_commit(), self.git.current_branch()) {
            (Ok(commit), Ok(branch)) => (Some(commit), branch),
            _ => {
                warn!("No git state available - rollback point may be incomplete");
                (None, "unknown".to_string())
            }
        };

        let backup_id = if self.create_rollback_backup {
            match self
                .backup_manager
                .create_backup(
                    BackupType::Full,
                    Some(format!("rb_{rollback_id}")),
                    &format!("Rollback point backup: {description}"),
                )
                .await
            {
                Ok(backup) => Some(backup.backup_id),
                Err(e) => {
                    warn!("Rollback point backup failed: {}", e);
                    None
                }
            }
        } else {
            None
        };

        let point = RollbackPoint {
            rollback_id: rollback_id.clone(),
            timestamp: Utc::now(),
            git_commit,
            git_branch,
            backup_id,
            description: description.to_string(),
            files_snapshot: snapshot_file_hashes(&self.project_path)?,
        };

        {
            let mut state = self.state.lock().await;
            state.points.push(point.clone());
            if state.points.len() > self.max_rollback_points {
                let excess = state.points.len() - self.max_rollback_points;
                state.points.drain(..excess);
            }
        }
        self.persist().await?;

        info!("Rollback point created: {}", rollback_id);
        Ok(point)
    }

    /// Execute a rollback to the named point. Selective delegates to
    /// FileRestore and Incremental to GitReset.
    pub async fn rollback_to_point(
        &self,
        rollback_id: &str,
        rollback_type: RollbackType,
        verify_after: bool,
    ) -> Result<RollbackOperation> {
        let _guard = self.in_progress.try_lock().map_err(|_| {
            NocturnalError::Rollback {
                message: "another rollback is already in progress".to_string(),
            }
        })?;

        let point = self
            .find_point(rollback_id)
            .await
            .ok_or_else(|| NocturnalError::NotFound(format!("rollback point {rollback_id}")))?;

        let operation_id = format!("rb_{}", Local::now().format("%Y%m%d_%H%M%S_%f"));
        info!(
            "Starting rollback operation {} to point {}",
            operation_id, rollback_id
        );

        let mut operation = RollbackOperation {
            operation_id,
            rollback_type,
            target_rollback_id: rollback_id.to_string(),
            status: RollbackStatus::InProgress,
            started_at: Utc::now(),
            completed_at: None,
            files_affected: Vec::new(),
            errors: Vec::new(),
            verification: None,
        };

        if self.create_rollback_backup {
            if let Err(e) = self
                .backup_manager
                .create_backup(
                    BackupType::Full,
                    Some(format!("pre_rollback_{}", operation.operation_id)),
                    "Pre-rollback safety backup",
                )
                .await
            {
                warn!("Pre-rollback backup failed: {}", e);
            }
        }

        let outcome = match rollback_type {
            RollbackType::GitReset | RollbackType::Incremental => {
                self.perform_git_reset(&mut operation, &point)
            }
            RollbackType::FileRestore | RollbackType::Selective => {
                self.perform_file_restore(&mut operation, &point).await
            }
            RollbackType::FullRestore => {
                let reset = self.perform_git_reset(&mut operation, &point);
                match reset {
                    Ok(()) => self.perform_file_restore(&mut operation, &point).await,
                    err => err,
                }
            }
        };

        operation.completed_at = Some(Utc::now());
        match outcome {
            Ok(()) => {
                operation.status = RollbackStatus::Completed;
                if verify_after && self.auto_verify {
                    let report = self.verify_rollback(&point)?;
                    if report.overall_success {
                        operation.status = RollbackStatus::Verified;
                    } else {
                        operation.status = RollbackStatus::Failed;
                        operation
                            .errors
                            .push("rollback verification failed".to_string());
                    }
                    operation.verification = Some(report);
                }
                info!("Rollback operation completed: {}", operation.operation_id);
            }
            Err(e) => {
                operation.status = RollbackStatus::Failed;
                operation.errors.push(e.to_string());
                warn!("Rollback operation failed: {}", e);
            }
        }

        {
            let mut state = self.state.lock().await;
            state.history.push(operation.clone());
            if state.history.len() > self.max_history {
                let excess = state.history.len() - self.max_history;
                state.history.drain(..excess);
            }
        }
        self.persist().await?;

        Ok(operation)
    }

    pub async fn find_point(&self, rollback_id: &str) -> Option<RollbackPoint> {
        let state = self.state.lock().await;
        state
            .points
            .iter()
            .find(|p| p.rollback_id == rollback_id)
            .cloned()
    }

    pub async fn latest_point(&self) -> Option<RollbackPoint> {
        self.state.lock().await.points.last().cloned()
    }

    pub async fn list_points(&self, limit: usize) -> Vec<RollbackPoint> {
        let state = self.state.lock().await;
        state.points.iter().rev().take(limit).cloned().collect()
    }

    pub async fn list_operations(&self, limit: usize) -> Vec<RollbackOperation> {
        let state = self.state.lock().await;
        state.history.iter().rev().take(limit).cloned().collect()
    }

    pub async fn status(&self) -> RollbackManagerStatus {
        let state = self.state.lock().await;
        let recent: Vec<&RollbackOperation> = state.history.iter().rev().take(10).collect();
        let successes = recent
            .iter()
            .filter(|op| {
                matches!(op.status, RollbackStatus::Completed | RollbackStatus::Verified)
            })
            .count();

        RollbackManagerStatus {
            rollback_points_count: state.points.len(),
            operations_count: state.history.len(),
            recent_success_rate: if recent.is_empty() {
                1.0
            } else {
                successes as f64 / recent.len() as f64
            },
        }
    }

    /// Verify the working tree against the rollback point: commit
    /// equality plus the snapshot hash match rate.
    pub fn verify_rollback(&self, point: &RollbackPoint) -> Result<VerificationReport> {
        let git_commit_match = match &point.git_commit {
            Some(expected) => self
                .git
                .head_commit()
                .map(|current| current == *expected)
                .unwrap_or(false),
            None => true,
        };

        let current_snapshot = snapshot_file_hashes(&self.project_path)?;
        let total = point.files_snapshot.len();
        let matched = point
            .files_snapshot
            .iter()
            .filter(|(path, hash)| current_snapshot.get(*path) == Some(*hash))
            .count();
        let file_match_rate = if total > 0 {
            matched as f64 / total as f64
        } else {
            1.0
        };

        let overall_success =
            git_commit_match && file_match_rate >= ROLLBACK_VERIFICATION_RATE;

        info!(
            "Rollback verification: {} (files {:.1}%, commit match {})",
            overall_success,
            file_match_rate * 100.0,
            git_commit_match
        );

        Ok(VerificationReport {
            git_commit_match,
            file_match_rate,
            overall_success,
        })
    }

    fn perform_git_reset(
        &self,
        operation: &mut RollbackOperation,
        point: &RollbackPoint,
    ) -> Result<()> {
        let commit = point.git_commit.as_ref().ok_or_else(|| {
            NocturnalError::Rollback {
                message: "rollback point has no git commit".to_string(),
            }
        })?;

        info!("Git reset to commit: {:.8}", commit);
        let before = self.git.head_commit().ok();

        self.git.reset_hard(commit)?;
        if let Err(e) = self.git.clean_untracked() {
            warn!("Untracked cleanup had issues: {}", e);
        }

        if let Some(before_commit) = before {
            if let Ok(changed) = self.git.diff_name_only(commit, &before_commit) {
                operation.files_affected.extend(changed);
            }
        }
        Ok(())
    }

    async fn perform_file_restore(
        &self,
        operation: &mut RollbackOperation,
        point: &RollbackPoint,
    ) -> Result<()> {
        let backup_id = point.backup_id.as_ref().ok_or_else(|| {
            NocturnalError::Rollback {
                message: "rollback point has no backup".to_string(),
            }
        })?;

        let backup = self
            .backup_manager
            .find_backup(backup_id)
            .await
            .ok_or_else(|| NocturnalError::NotFound(format!("backup {backup_id}")))?;

        info!("Restoring files from backup: {}", backup_id);

        for entry in WalkDir::new(&backup.backup_path)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            if !entry.file_type().is_file() {
                continue;
            }
            let Ok(rel) = entry.path().strip_prefix(&backup.backup_path) else {
                continue;
            };
            let target = self.project_path.join(rel);
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            match std::fs::copy(entry.path(), &target) {
                Ok(_) => operation
                    .files_affected
                    .push(rel.to_string_lossy().into_owned()),
                Err(e) => operation
                    .errors
                    .push(format!("failed to restore {}: {e}", rel.display())),
            }
        }

        debug!("Restored {} files", operation.files_affected.len());
        Ok(())
    }

    /// Copy every file of a named backup over the project; used for
    /// emergency recovery when no usable rollback point remains.
    pub async fn restore_from_backup(&self, backup_id: &str) -> Result<Vec<String>> {
        let backup = self
            .backup_manager
            .find_backup(backup_id)
            .await
            .ok_or_else(|| NocturnalError::NotFound(format!("backup {backup_id}")))?;

        info!("Restoring project from backup: {}", backup_id);
        let mut restored = Vec::new();

        for entry in WalkDir::new(&backup.backup_path)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            if !entry.file_type().is_file() {
                continue;
            }
            let Ok(rel) = entry.path().strip_prefix(&backup.backup_path) else {
                continue;
            };
            let target = self.project_path.join(rel);
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(entry.path(), &target)?;
            restored.push(rel.to_string_lossy().into_owned());
        }

        Ok(restored)
    }

    async fn persist(&self) -> Result<()> {
        let state = self.state.lock().await;
        self.points_store.save(&state.points).await?;
        self.history_store.save(&state.history).await?;
        Ok(())
    }
}

/// Hash every project file outside the excluded directories.
pub fn snapshot_file_hashes(project_path: &Path) -> Result<HashMap<String, String>> {
    let mut snapshot = HashMap::new();

    for entry in WalkDir::new(project_path)
        .into_iter()
        .filter_entry(|e| {
            e.path()
                .file_name()
                .map(|name| {
                    !SNAPSHOT_EXCLUDED_DIRS
                        .iter()
                        .any(|excluded| name.to_string_lossy() == *excluded)
                })
                .unwrap_or(true)
        })
        .filter_map(|e| e.ok())
    {
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(rel) = entry.path().strip_prefix(project_path) else {
            continue;
        };

        let mut hasher = Sha256::new();
        let mut file = std::fs::File::open(entry.path())?;
        let mut buffer = [0u8; 8192];
        loop {
            let read = file.read(&mut buffer)?;
            if read == 0 {
                break;
            }
            hasher.update(&buffer[..read]);
        }

        snapshot.insert(
            rel.to_string_lossy().into_owned(),
            format!("{:x}", hasher.finalize()),
        );
    }

    Ok(snapshot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackupConfig;
    use crate::vcs::tests::init_repo;

    async fn rollback_stack(
        project: &Path,
        backup_root: &Path,
    ) -> (Arc<BackupManager>, RollbackManager) {
        let backup_config = BackupConfig {
            backup_root: Some(backup_root.to_path_buf()),
            ..BackupConfig::default()
        };
        let backups = Arc::new(BackupManager::new(project, &backup_config).unwrap());
        let rollbacks =
            RollbackManager::new(project, Arc::clone(&backups), &RollbackConfig::default());
        (backups, rollbacks)
    }

    #[tokio::test]
    async fn rollback_point_captures_state() {
        let (dir, git) = init_repo();
        let backup_root = tempfile::tempdir().unwrap();
        let (_backups, rollbacks) = rollback_stack(dir.path(), backup_root.path()).await;

        let point = rollbacks.create_rollback_point("before work").await.unwrap();

        assert_eq!(point.git_commit.as_deref(), Some(git.head_commit().unwrap().as_str()));
        assert_eq!(point.git_branch, "main");
        assert!(point.backup_id.is_some());
        assert!(point.files_snapshot.contains_key("README.md"));
    }

    #[tokio::test]
    async fn git_reset_rollback_restores_commit() {
        let (dir, git) = init_repo();
        let backup_root = tempfile::tempdir().unwrap();
        let (_backups, rollbacks) = rollback_stack(dir.path(), backup_root.path()).await;

        let point = rollbacks.create_rollback_point("clean state").await.unwrap();
        let target_commit = point.git_commit.clone().unwrap();

        // Mutate and commit past the point
        std::fs::write(dir.path().join("drift.rs"), "pub fn drift() {}\n").unwrap();
        git.add(&[]).unwrap();
        git.commit("drift").unwrap();
        assert_ne!(git.head_commit().unwrap(), target_commit);

        let operation = rollbacks
            .rollback_to_point(&point.rollback_id, RollbackType::GitReset, true)
            .await
            .unwrap();

        assert_eq!(operation.status, RollbackStatus::Verified);
        assert_eq!(git.head_commit().unwrap(), target_commit);
        assert!(!dir.path().join("drift.rs").exists());
    }

    #[tokio::test]
    async fn full_restore_matches_snapshot() {
        let (dir, git) = init_repo();
        let backup_root = tempfile::tempdir().unwrap();
        let (_backups, rollbacks) = rollback_stack(dir.path(), backup_root.path()).await;

        std::fs::write(dir.path().join("kept.rs"), "pub fn kept() {}\n").unwrap();
        git.add(&[]).unwrap();
        git.commit("kept").unwrap();

        let point = rollbacks.create_rollback_point("snapshot").await.unwrap();
        let expected_snapshot = point.files_snapshot.clone();

        // Mutate files without committing
        std::fs::write(dir.path().join("kept.rs"), "pub fn mutated() {}\n").unwrap();
        std::fs::write(dir.path().join("junk.tmp"), "junk").unwrap();

        let operation = rollbacks
            .rollback_to_point(&point.rollback_id, RollbackType::FullRestore, true)
            .await
            .unwrap();

        assert_eq!(operation.status, RollbackStatus::Verified);
        let report = operation.verification.unwrap();
        assert!(report.git_commit_match);
        assert!(report.file_match_rate >= 0.95);

        let current = snapshot_file_hashes(dir.path()).unwrap();
        for (path, hash) in &expected_snapshot {
            assert_eq!(current.get(path), Some(hash), "mismatch for {path}");
        }
    }

    #[tokio::test]
    async fn unknown_point_is_not_found() {
        let (dir, _git) = init_repo();
        let backup_root = tempfile::tempdir().unwrap();
        let (_backups, rollbacks) = rollback_stack(dir.path(), backup_root.path()).await;

        let result = rollbacks
            .rollback_to_point("rp_missing", RollbackType::GitReset, false)
            .await;
        assert!(matches!(result, Err(NocturnalError::NotFound(_))));
    }

    #[tokio::test]
    async fn point_limit_prunes_oldest() {
        let (dir, _git) = init_repo();
        let backup_root = tempfile::tempdir().unwrap();
        let backup_config = BackupConfig {
            backup_root: Some(backup_root.path().to_path_buf()),
            ..BackupConfig::default()
        };
        let backups = Arc::new(BackupManager::new(dir.path(), &backup_config).unwrap());
        let config = RollbackConfig {
            max_rollback_points: 2,
            create_rollback_backup: false,
            ..RollbackConfig::default()
        };
        let rollbacks = RollbackManager::new(dir.path(), backups, &config);

        let p1 = rollbacks.create_rollback_point("first").await.unwrap();
        rollbacks.create_rollback_point("second").await.unwrap();
        rollbacks.create_rollback_point("third").await.unwrap();

        let status = rollbacks.status().await;
        assert_eq!(status.rollback_points_count, 2);
        assert!(rollbacks.find_point(&p1.rollback_id).await.is_none());
    }

    #[tokio::test]
    async fn selective_delegates_to_file_restore() {
        let (dir, _git) = init_repo();
        let backup_root = tempfile::tempdir().unwrap();
        let (_backups, rollbacks) = rollback_stack(dir.path(), backup_root.path()).await;

        let point = rollbacks.create_rollback_point("selective base").await.unwrap();

        std::fs::write(dir.path().join("README.md"), "# clobbered\n").unwrap();

        let operation = rollbacks
            .rollback_to_point(&point.rollback_id, RollbackType::Selective, false)
            .await
            .unwrap();
        assert_eq!(operation.status, RollbackStatus::Completed);
        assert!(operation
            .files_affected
            .contains(&"README.md".to_string()));

        let content = std::fs::read_to_string(dir.path().join("README.md")).unwrap();
        assert_eq!(content, "# scratch\n");
    }

    #[tokio::test]
    async fn history_persists_across_reload() {
        let (dir, _git) = init_repo();
        let backup_root = tempfile::tempdir().unwrap();

        let point_id = {
            let (_backups, rollbacks) = rollback_stack(dir.path(), backup_root.path()).await;
            let point = rollbacks.create_rollback_point("persisted").await.unwrap();
            rollbacks
                .rollback_to_point(&point.rollback_id, RollbackType::GitReset, false)
                .await
                .unwrap();
            point.rollback_id
        };

        let (_backups, rollbacks) = rollback_stack(dir.path(), backup_root.path()).await;
        rollbacks.load().await.unwrap();

        assert!(rollbacks.find_point(&point_id).await.is_some());
        assert_eq!(rollbacks.list_operations(10).await.len(), 1);
    }
}
