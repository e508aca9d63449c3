//! Automatic backups for safe autonomous operation
//!
//! Four backup flavors: full project copies, git bundles, incremental
//! (changed since the latest backup), and critical-path-only. Every
//! backup gets a SHA-256 integrity hash over its sorted relative paths
//! and contents; verification recomputes it, and git backups additionally
//! validate the bundle.

use crate::config::BackupConfig;
use crate::storage::JsonStore;
use crate::vcs::GitClient;
use crate::{NocturnalError, Result};
use chrono::{DateTime, Duration as ChronoDuration, Local, Utc};
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupType {
    Full,
    Git,
    Incremental,
    Critical,
}

impl BackupType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupType::Full => "full",
            BackupType::Git => "git",
            BackupType::Incremental => "incremental",
            BackupType::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerificationStatus {
    Pending,
    Verified,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupInfo {
    pub backup_id: String,
    pub backup_type: BackupType,
    pub timestamp: DateTime<Utc>,
    pub backup_path: PathBuf,
    pub file_count: usize,
    pub size_bytes: u64,
    pub git_commit: Option<String>,
    pub git_branch: Option<String>,
    pub integrity_hash: String,
    pub verification_status: VerificationStatus,
    pub description: String,
}

pub struct BackupManager {
    project_path: PathBuf,
    backup_root: PathBuf,
    max_backups: usize,
    retention_days: i64,
    auto_verify: bool,
    critical_paths: Vec<String>,
    exclude_dirs: Vec<String>,
    exclude_exact: Vec<String>,
    exclude_globs: GlobSet,
    git: GitClient,
    index: JsonStore,
    history: Mutex<Vec<BackupInfo>>,
}

impl BackupManager {
    pub fn new(project_path: &Path, config: &BackupConfig) -> Result<Self> {
        let backup_root = config.backup_root.clone().unwrap_or_else(|| {
            project_path
                .parent()
                .unwrap_or(project_path)
                .join(".nocturnal_backups")
        });

        let mut exclude_dirs = Vec::new();
        let mut exclude_exact = Vec::new();
        let mut glob_builder = GlobSetBuilder::new();
        for pattern in &config.exclude_patterns {
            if let Some(dir) = pattern.strip_suffix('/') {
                exclude_dirs.push(dir.to_string());
            } else if pattern.contains('*') {
                let glob = Glob::new(pattern).map_err(|e| {
                    NocturnalError::Validation(format!("bad exclude pattern {pattern:?}: {e}"))
                })?;
                glob_builder.add(glob);
            } else {
                exclude_exact.push(pattern.clone());
            }
        }
        let exclude_globs = glob_builder.build().map_err(|e| {
            NocturnalError::Validation(format!("exclude pattern set does not build: {e}"))
        })?;

        let index = JsonStore::new(backup_root.join("backups_index.json"));

        Ok(Self {
            project_path: project_path.to_path_buf(),
            backup_root,
            max_backups: config.max_backups,
            retention_days: config.retention_days,
            auto_verify: config.auto_verify,
            critical_paths: config.critical_paths.clone(),
            exclude_dirs,
            exclude_exact,
            exclude_globs,
            git: GitClient::new(project_path),
            index,
            history: Mutex::new(Vec::new()),
        })
    }

    /// Restore the persisted backup index.
    pub async fn load(&self) -> Result<()> {
        if let Some(history) = self.index.load::<Vec<BackupInfo>>().await? {
            info!("Loaded {} backup records", history.len());
            *self.history.lock().await = history;
        }
        Ok(())
    }

    /// Full backup taken before any night execution; must verify.
    pub async fn create_pre_execution_backup(&self) -> Result<BackupInfo> {
        info!("Creating pre-execution backup");
        let backup_id = format!("pre_exec_{}", Local::now().format("%Y%m%d_%H%M%S"));
        let backup = self
            .create_backup(BackupType::Full, Some(backup_id), "Pre-execution safety backup")
            .await?;

        if backup.verification_status != VerificationStatus::Verified {
            return Err(NocturnalError::Backup {
                message: "pre-execution backup failed verification".to_string(),
            });
        }
        info!("Pre-execution backup created: {}", backup.backup_id);
        Ok(backup)
    }

    pub async fn create_backup(
        &self,
        backup_type: BackupType,
        backup_id: Option<String>,
        description: &str,
    ) -> Result<BackupInfo> {
        let backup_id = backup_id.unwrap_or_else(|| {
            format!(
                "{}_{}",
                backup_type.as_str(),
                Local::now().format("%Y%m%d_%H%M%S")
            )
        });
        info!("Creating {} backup: {}", backup_type.as_str(), backup_id);

        let backup_dir = self.backup_root.join(&backup_id);
        std::fs::create_dir_all(&backup_dir)?;

        let (git_commit, git_branch) = self.git_state();

        let (file_count, size_bytes) = match backup_type {
            BackupType::Full => self.copy_full(&backup_dir)?,
            BackupType::Git => self.copy_git(&backup_dir)?,
            BackupType::Incremental => self.copy_incremental(&backup_dir).await?,
            BackupType::Critical => self.copy_critical(&backup_dir)?,
        };

        let integrity_hash = hash_backup_dir(&backup_dir)?;

        let mut backup = BackupInfo {
            backup_id,
            backup_type,
            timestamp: Utc::now(),
            backup_path: backup_dir,
            file_count,
            size_bytes,
            git_commit,
            git_branch,
            integrity_hash,
            verification_status: VerificationStatus::Pending,
            description: description.to_string(),
        };

        if self.auto_verify {
            backup.verification_status = if self.verify_backup(&backup).await {
                VerificationStatus::Verified
            } else {
                VerificationStatus::Failed
            };
        }

        {
            let mut history = self.history.lock().await;
            history.push(backup.clone());
        }
        self.cleanup_old_backups().await?;
        self.save_index().await?;

        info!(
            "Backup created: {} ({} files, {} bytes)",
            backup.backup_id, file_count, size_bytes
        );
        Ok(backup)
    }

    /// Recompute the integrity hash; for git backups also verify the
    /// bundle.
    pub async fn verify_backup(&self, backup: &BackupInfo) -> bool {
        debug!("Verifying backup: {}", backup.backup_id);

        if !backup.backup_path.exists() {
            warn!("Backup directory missing: {}", backup.backup_path.display());
            return false;
        }

        let recomputed = match hash_backup_dir(&backup.backup_path) {
            Ok(hash) => hash,
            Err(e) => {
                warn!("Backup hash recomputation failed: {}", e);
                return false;
            }
        };
        if recomputed != backup.integrity_hash {
            warn!("Backup integrity mismatch: {}", backup.backup_id);
            return false;
        }

        if backup.backup_type == BackupType::Git {
            let bundle = backup.backup_path.join("repository.bundle");
            if !bundle.exists() || self.git.bundle_verify(&bundle).is_err() {
                warn!("Git bundle verification failed: {}", backup.backup_id);
                return false;
            }
        }

        true
    }

    pub async fn latest_backup(&self) -> Option<BackupInfo> {
        let history = self.history.lock().await;
        history.iter().max_by_key(|b| b.timestamp).cloned()
    }

    pub async fn latest_verified_backup(&self) -> Option<BackupInfo> {
        let history = self.history.lock().await;
        history
            .iter()
            .filter(|b| b.verification_status == VerificationStatus::Verified)
            .max_by_key(|b| b.timestamp)
            .cloned()
    }

    pub async fn find_backup(&self, backup_id: &str) -> Option<BackupInfo> {
        let history = self.history.lock().await;
        history.iter().find(|b| b.backup_id == backup_id).cloned()
    }

    pub async fn list_backups(&self, limit: usize) -> Vec<BackupInfo> {
        let history = self.history.lock().await;
        let mut recent: Vec<BackupInfo> = history.clone();
        recent.sort_by_key(|b| std::cmp::Reverse(b.timestamp));
        recent.truncate(limit);
        recent
    }

    pub async fn backup_count(&self) -> usize {
        self.history.lock().await.len()
    }

    pub async fn verified_backup_count(&self) -> usize {
        self.history
            .lock()
            .await
            .iter()
            .filter(|b| b.verification_status == VerificationStatus::Verified)
            .count()
    }

    fn copy_full(&self, backup_dir: &Path) -> Result<(usize, u64)> {
        let mut file_count = 0;
        let mut total_size = 0;

        for entry in WalkDir::new(&self.project_path)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            let Ok(rel_path) = entry.path().strip_prefix(&self.project_path) else {
                continue;
            };
            if rel_path.as_os_str().is_empty() || self.should_exclude(rel_path) {
                continue;
            }

            let target = backup_dir.join(rel_path);
            if entry.file_type().is_dir() {
                std::fs::create_dir_all(&target)?;
            } else if entry.file_type().is_file() {
                if let Some(parent) = target.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                match std::fs::copy(entry.path(), &target) {
                    Ok(size) => {
                        file_count += 1;
                        total_size += size;
                    }
                    Err(e) => warn!("Failed to back up {}: {}", entry.path().display(), e),
                }
            }
        }

        Ok((file_count, total_size))
    }

    fn copy_git(&self, backup_dir: &Path) -> Result<(usize, u64)> {
        let bundle_file = backup_dir.join("repository.bundle");
        self.git.bundle_create(&bundle_file)?;

        let mut file_count = 1;
        let mut total_size = std::fs::metadata(&bundle_file)?.len();

        let git_dir = self.project_path.join(".git");
        for item in ["config", "HEAD", "refs", "hooks"] {
            let src = git_dir.join(item);
            if !src.exists() {
                continue;
            }
            let dst = backup_dir.join(".git").join(item);

            if src.is_file() {
                if let Some(parent) = dst.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                total_size += std::fs::copy(&src, &dst)?;
                file_count += 1;
            } else {
                for entry in WalkDir::new(&src).into_iter().filter_map(|e| e.ok()) {
                    if !entry.file_type().is_file() {
                        continue;
                    }
                    let Ok(rel) = entry.path().strip_prefix(&git_dir) else {
                        continue;
                    };
                    let target = backup_dir.join(".git").join(rel);
                    if let Some(parent) = target.parent() {
                        std::fs::create_dir_all(parent)?;
                    }
                    total_size += std::fs::copy(entry.path(), &target)?;
                    file_count += 1;
                }
            }
        }

        Ok((file_count, total_size))
    }

    /// Copy only files modified since the most recent backup; falls back
    /// to a full copy when no prior backup exists.
    async fn copy_incremental(&self, backup_dir: &Path) -> Result<(usize, u64)> {
        let Some(last) = self.latest_backup().await else {
            return self.copy_full(backup_dir);
        };

        let cutoff = last.timestamp;
        let mut file_count = 0;
        let mut total_size = 0;

        for entry in WalkDir::new(&self.project_path)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            if !entry.file_type().is_file() {
                continue;
            }
            let Ok(rel_path) = entry.path().strip_prefix(&self.project_path) else {
                continue;
            };
            if self.should_exclude(rel_path) {
                continue;
            }

            let modified: DateTime<Utc> = match entry.metadata().ok().and_then(|m| m.modified().ok()) {
                Some(mtime) => mtime.into(),
                None => continue,
            };
            if modified <= cutoff {
                continue;
            }

            let target = backup_dir.join(rel_path);
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            match std::fs::copy(entry.path(), &target) {
                Ok(size) => {
                    file_count += 1;
                    total_size += size;
                }
                Err(e) => warn!("Failed to back up {}: {}", entry.path().display(), e),
            }
        }

        Ok((file_count, total_size))
    }

    fn copy_critical(&self, backup_dir: &Path) -> Result<(usize, u64)> {
        let mut file_count = 0;
        let mut total_size = 0;

        for critical in &self.critical_paths {
            let src = self.project_path.join(critical.trim_end_matches('/'));
            if !src.exists() {
                continue;
            }

            if src.is_file() {
                let target = backup_dir.join(critical.trim_end_matches('/'));
                if let Some(parent) = target.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                total_size += std::fs::copy(&src, &target)?;
                file_count += 1;
            } else {
                for entry in WalkDir::new(&src).into_iter().filter_map(|e| e.ok()) {
                    if !entry.file_type().is_file() {
                        continue;
                    }
                    let Ok(rel) = entry.path().strip_prefix(&self.project_path) else {
                        continue;
                    };
                    if self.should_exclude(rel) {
                        continue;
                    }
                    let target = backup_dir.join(rel);
                    if let Some(parent) = target.parent() {
                        std::fs::create_dir_all(parent)?;
                    }
                    total_size += std::fs::copy(entry.path(), &target)?;
                    file_count += 1;
                }
            }
        }

        Ok((file_count, total_size))
    }

    fn should_exclude(&self, rel_path: &Path) -> bool {
        let rel_str = rel_path.to_string_lossy();

        for dir in &self.exclude_dirs {
            if rel_str == *dir || rel_str.starts_with(&format!("{dir}/")) {
                return true;
            }
        }
        for exact in &self.exclude_exact {
            if rel_str == *exact
                || rel_path
                    .file_name()
                    .map(|name| name.to_string_lossy() == *exact)
                    .unwrap_or(false)
            {
                return true;
            }
        }
        self.exclude_globs.is_match(rel_path)
    }

    fn git_state(&self) -> (Option<String>, Option<String>) {
        match (self.git.head_commit(), self.git.current_branch()) {
            (Ok(commit), Ok(branch)) => (Some(commit), Some(branch)),
            _ => {
                warn!("Failed to read git state; backup recorded without it");
                (None, None)
            }
        }
    }

    /// Enforce max-backups, then expire backups past the retention
    /// window.
    async fn cleanup_old_backups(&self) -> Result<()> {
        let mut history = self.history.lock().await;

        if history.len() > self.max_backups {
            history.sort_by_key(|b| b.timestamp);
            let excess_count = history.len() - self.max_backups;
            let excess: Vec<BackupInfo> = history.drain(..excess_count).collect();
            for backup in excess {
                remove_backup_dir(&backup);
                info!("Removed old backup: {}", backup.backup_id);
            }
        }

        let cutoff = Utc::now() - ChronoDuration::days(self.retention_days);
        let expired: Vec<BackupInfo> = history
            .iter()
            .filter(|b| b.timestamp < cutoff)
            .cloned()
            .collect();
        history.retain(|b| b.timestamp >= cutoff);
        for backup in expired {
            remove_backup_dir(&backup);
            info!("Removed expired backup: {}", backup.backup_id);
        }

        Ok(())
    }

    async fn save_index(&self) -> Result<()> {
        let history = self.history.lock().await;
        self.index.save(&*history).await
    }
}

fn remove_backup_dir(backup: &BackupInfo) {
    if backup.backup_path.exists() {
        if let Err(e) = std::fs::remove_dir_all(&backup.backup_path) {
            warn!("Failed to remove backup {}: {}", backup.backup_id, e);
        }
    }
}

/// SHA-256 over the sorted relative paths and contents of every file in
/// the backup directory.
pub fn hash_backup_dir(backup_dir: &Path) -> Result<String> {
    let mut files: Vec<PathBuf> = WalkDir::new(backup_dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .collect();
    files.sort();

    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];

    for file_path in files {
        let Ok(rel) = file_path.strip_prefix(backup_dir) else {
            continue;
        };
        hasher.update(rel.to_string_lossy().as_bytes());

        let mut file = std::fs::File::open(&file_path)?;
        loop {
            let read = file.read(&mut buffer)?;
            if read == 0 {
                break;
            }
            hasher.update(&buffer[..read]);
        }
    }

    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vcs::tests::init_repo;

    fn backup_config(root: &Path) -> BackupConfig {
        BackupConfig {
            backup_root: Some(root.to_path_buf()),
            ..BackupConfig::default()
        }
    }

    #[tokio::test]
    async fn full_backup_copies_and_verifies() {
        let (dir, _git) = init_repo();
        let backup_root = tempfile::tempdir().unwrap();
        let manager =
            BackupManager::new(dir.path(), &backup_config(backup_root.path())).unwrap();

        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("src/lib.rs"), "pub fn f() {}\n").unwrap();

        let backup = manager
            .create_backup(BackupType::Full, None, "test")
            .await
            .unwrap();

        assert_eq!(backup.verification_status, VerificationStatus::Verified);
        assert!(backup.file_count >= 2); // README.md + src/lib.rs
        assert!(backup.backup_path.join("src/lib.rs").exists());
        assert!(backup.git_commit.is_some());
    }

    #[tokio::test]
    async fn excluded_directories_are_skipped() {
        let (dir, _git) = init_repo();
        let backup_root = tempfile::tempdir().unwrap();
        let manager =
            BackupManager::new(dir.path(), &backup_config(backup_root.path())).unwrap();

        std::fs::create_dir_all(dir.path().join("target/debug")).unwrap();
        std::fs::write(dir.path().join("target/debug/junk.o"), "junk").unwrap();
        std::fs::write(dir.path().join("trace.log"), "log line").unwrap();

        let backup = manager
            .create_backup(BackupType::Full, None, "")
            .await
            .unwrap();

        assert!(!backup.backup_path.join("target").exists());
        assert!(!backup.backup_path.join("trace.log").exists());
        assert!(backup.backup_path.join("README.md").exists());
    }

    #[tokio::test]
    async fn incremental_after_full_copies_nothing() {
        let (dir, _git) = init_repo();
        let backup_root = tempfile::tempdir().unwrap();
        let manager =
            BackupManager::new(dir.path(), &backup_config(backup_root.path())).unwrap();

        manager
            .create_backup(BackupType::Full, None, "")
            .await
            .unwrap();

        let incremental = manager
            .create_backup(BackupType::Incremental, None, "")
            .await
            .unwrap();
        assert_eq!(incremental.file_count, 0);
    }

    #[tokio::test]
    async fn incremental_picks_up_new_files() {
        let (dir, _git) = init_repo();
        let backup_root = tempfile::tempdir().unwrap();
        let manager =
            BackupManager::new(dir.path(), &backup_config(backup_root.path())).unwrap();

        manager
            .create_backup(BackupType::Full, None, "")
            .await
            .unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
        std::fs::write(dir.path().join("fresh.rs"), "pub fn fresh() {}\n").unwrap();

        let incremental = manager
            .create_backup(BackupType::Incremental, None, "")
            .await
            .unwrap();
        assert_eq!(incremental.file_count, 1);
        assert!(incremental.backup_path.join("fresh.rs").exists());
    }

    #[tokio::test]
    async fn git_backup_bundles_and_validates() {
        let (dir, _git) = init_repo();
        let backup_root = tempfile::tempdir().unwrap();
        let manager =
            BackupManager::new(dir.path(), &backup_config(backup_root.path())).unwrap();

        let backup = manager
            .create_backup(BackupType::Git, None, "")
            .await
            .unwrap();
        assert_eq!(backup.verification_status, VerificationStatus::Verified);
        assert!(backup.backup_path.join("repository.bundle").exists());
    }

    #[tokio::test]
    async fn tampering_fails_verification() {
        let (dir, _git) = init_repo();
        let backup_root = tempfile::tempdir().unwrap();
        let manager =
            BackupManager::new(dir.path(), &backup_config(backup_root.path())).unwrap();

        let backup = manager
            .create_backup(BackupType::Full, None, "")
            .await
            .unwrap();
        assert_eq!(backup.verification_status, VerificationStatus::Verified);

        std::fs::write(backup.backup_path.join("README.md"), "tampered").unwrap();
        assert!(!manager.verify_backup(&backup).await);
    }

    #[tokio::test]
    async fn max_backups_retention() {
        let (dir, _git) = init_repo();
        let backup_root = tempfile::tempdir().unwrap();
        let config = BackupConfig {
            backup_root: Some(backup_root.path().to_path_buf()),
            max_backups: 2,
            ..BackupConfig::default()
        };
        let manager = BackupManager::new(dir.path(), &config).unwrap();

        for i in 0..3 {
            manager
                .create_backup(BackupType::Critical, Some(format!("b{i}")), "")
                .await
                .unwrap();
        }

        assert_eq!(manager.backup_count().await, 2);
        assert!(manager.find_backup("b0").await.is_none());
        assert!(manager.find_backup("b2").await.is_some());
    }

    #[tokio::test]
    async fn index_round_trips() {
        let (dir, _git) = init_repo();
        let backup_root = tempfile::tempdir().unwrap();
        let config = backup_config(backup_root.path());

        {
            let manager = BackupManager::new(dir.path(), &config).unwrap();
            manager
                .create_backup(BackupType::Full, Some("persisted".to_string()), "")
                .await
                .unwrap();
        }

        let manager = BackupManager::new(dir.path(), &config).unwrap();
        manager.load().await.unwrap();
        let found = manager.find_backup("persisted").await.unwrap();
        assert_eq!(found.verification_status, VerificationStatus::Verified);
        assert!(manager.verify_backup(&found).await);
    }
}
