//! Safety coordination around every task
//!
//! Strict layering: the backup manager knows nothing of rollback, the
//! rollback manager owns a backup-manager handle, and the coordinator
//! owns both plus the danger detector. The coordinator wraps each task in
//! a pre-execution danger gate and a post-execution recovery assessment,
//! and drives three-stage emergency recovery.

pub mod backup_manager;
pub mod danger_detector;
pub mod rollback_manager;

use crate::config::SafetyConfig;
use crate::constants::{INCREMENTAL_BACKUP_FILE_THRESHOLD, ROLLBACK_QUALITY_FLOOR};
use crate::events::{EventBus, SystemEvent};
use crate::models::{ExecutionResult, Task};
use crate::vcs::GitClient;
use crate::Result;
use backup_manager::{BackupInfo, BackupManager, BackupType};
use chrono::{DateTime, Local, Utc};
use danger_detector::{DangerDetector, DangerLevel};
use rollback_manager::{RollbackManager, RollbackPoint, RollbackType};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Serialize)]
pub struct SafetyViolation {
    pub task_id: String,
    pub timestamp: DateTime<Utc>,
    pub danger_level: DangerLevel,
    pub patterns: Vec<String>,
    pub blocked: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SafetyCheckResult {
    pub safe_to_execute: bool,
    pub danger_level: DangerLevel,
    pub warnings: Vec<String>,
    pub blocking_issues: Vec<String>,
    pub recommendations: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PostTaskSafety {
    pub task_completed_safely: bool,
    pub recovery_needed: bool,
    pub rollback_recommended: bool,
    pub backup_created: bool,
    pub rollback_point_created: Option<String>,
    pub actions_taken: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RecoveryResult {
    pub recovery_attempted: bool,
    pub recovery_successful: bool,
    pub method_used: Option<String>,
    pub recovered_to: Option<String>,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SafetyStats {
    pub backups_created: u64,
    pub rollback_points_created: u64,
    pub dangers_detected: u64,
    pub operations_blocked: u64,
    pub emergency_rollbacks: u64,
    pub successful_recoveries: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SafetyHealth {
    pub overall_healthy: bool,
    pub backup_manager_healthy: bool,
    pub rollback_manager_healthy: bool,
    pub danger_detector_healthy: bool,
    pub issues: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SafetySessionReport {
    pub session_duration_secs: i64,
    pub stats: SafetyStats,
    pub violations: Vec<SafetyViolation>,
    pub session_backup_id: Option<String>,
    pub final_backup_id: Option<String>,
}

#[derive(Default)]
struct SessionState {
    active: bool,
    started_at: Option<DateTime<Utc>>,
    session_backup: Option<BackupInfo>,
    current_rollback_point: Option<RollbackPoint>,
    violations: Vec<SafetyViolation>,
    stats: SafetyStats,
}

pub struct SafetyCoordinator {
    backup_manager: Arc<BackupManager>,
    danger_detector: Arc<DangerDetector>,
    rollback_manager: Arc<RollbackManager>,
    git: GitClient,
    events: EventBus,
    block_dangerous_operations: bool,
    session: Mutex<SessionState>,
}

impl SafetyCoordinator {
    pub fn new(project_path: &Path, config: &SafetyConfig, events: EventBus) -> Result<Self> {
        let backup_manager = Arc::new(BackupManager::new(project_path, &config.backup)?);
        let danger_detector = Arc::new(DangerDetector::new(&config.danger)?);
        let rollback_manager = Arc::new(RollbackManager::new(
            project_path,
            Arc::clone(&backup_manager),
            &config.rollback,
        ));

        Ok(Self {
            backup_manager,
            danger_detector,
            rollback_manager,
            git: GitClient::new(project_path),
            events,
            block_dangerous_operations: config.block_dangerous_operations,
            session: Mutex::new(SessionState::default()),
        })
    }

    pub fn backup_manager(&self) -> &Arc<BackupManager> {
        &self.backup_manager
    }

    pub fn danger_detector(&self) -> &Arc<DangerDetector> {
        &self.danger_detector
    }

    pub fn rollback_manager(&self) -> &Arc<RollbackManager> {
        &self.rollback_manager
    }

    /// Restore persisted indexes for all owned subsystems.
    pub async fn load(&self) -> Result<()> {
        self.backup_manager.load().await?;
        self.rollback_manager.load().await?;
        Ok(())
    }

    /// Open a safety session: a verified pre-execution backup plus an
    /// initial rollback point, both kept as the home for emergency
    /// recovery.
    pub async fn initialize_safety_session(&self) -> Result<()> {
        info!("Initializing safety session");

        let backup = self.backup_manager.create_pre_execution_backup().await?;
        let rollback_point = self
            .rollback_manager
            .create_rollback_point("Session start - pre-execution state")
            .await?;

        let mut session = self.session.lock().await;
        session.active = true;
        session.started_at = Some(Utc::now());
        session.session_backup = Some(backup);
        session.current_rollback_point = Some(rollback_point);
        session.stats.backups_created += 1;
        session.stats.rollback_points_created += 1;

        info!("Safety session initialized");
        Ok(())
    }

    /// Gate a task on the danger detector before anything executes.
    pub async fn pre_task_safety_check(
        &self,
        task: &Task,
        planned_code: &str,
    ) -> SafetyCheckResult {
        debug!("Pre-task safety check: {}", task.id);

        let mut result = SafetyCheckResult {
            safe_to_execute: true,
            danger_level: DangerLevel::Safe,
            warnings: Vec::new(),
            blocking_issues: Vec::new(),
            recommendations: Vec::new(),
        };

        if !planned_code.is_empty() {
            let detection = self.danger_detector.analyze_code(planned_code);

            if detection.is_dangerous {
                let blocked = !detection.blocked_operations.is_empty();
                let violation = SafetyViolation {
                    task_id: task.id.clone(),
                    timestamp: Utc::now(),
                    danger_level: detection.danger_level,
                    patterns: detection.detected_patterns.clone(),
                    blocked,
                };

                {
                    let mut session = self.session.lock().await;
                    session.stats.dangers_detected += 1;
                    session.violations.push(violation);
                }

                self.events.publish(SystemEvent::DangerDetected {
                    task_id: task.id.clone(),
                    danger_level: format!("{:?}", detection.danger_level).to_lowercase(),
                    blocked,
                });

                if blocked && self.block_dangerous_operations {
                    result.safe_to_execute = false;
                    result
                        .blocking_issues
                        .extend(detection.blocked_operations.clone());
                    self.session.lock().await.stats.operations_blocked += 1;
                }

                result.danger_level = detection.danger_level;
                result.warnings.push(detection.risk_description.clone());
                result
                    .recommendations
                    .push(detection.recommended_action.clone());
            }
        }

        if self.backup_manager.latest_verified_backup().await.is_none() {
            result
                .warnings
                .push("No verified backup available for recovery".to_string());
            result
                .recommendations
                .push("Create a verified backup before proceeding".to_string());
        }

        result
    }

    /// Assess an execution's aftermath: rollback points on success,
    /// rollback recommendations on failure or very low quality, and an
    /// incremental backup after large change sets.
    pub async fn post_task_safety_check(
        &self,
        task: &Task,
        result: &ExecutionResult,
    ) -> PostTaskSafety {
        debug!("Post-task safety check: {}", task.id);

        let mut status = PostTaskSafety {
            task_completed_safely: result.success,
            ..PostTaskSafety::default()
        };

        if result.success && result.has_changes() {
            match self
                .rollback_manager
                .create_rollback_point(&format!("After task {}: {:.50}", task.id, task.description))
                .await
            {
                Ok(point) => {
                    status.rollback_point_created = Some(point.rollback_id.clone());
                    status.actions_taken.push("Created rollback point".to_string());
                    let mut session = self.session.lock().await;
                    session.current_rollback_point = Some(point);
                    session.stats.rollback_points_created += 1;
                }
                Err(e) => error!("Post-task rollback point failed: {}", e),
            }
        }

        if !result.success || result.quality_score.overall < ROLLBACK_QUALITY_FLOOR {
            status.rollback_recommended = true;
            status.recovery_needed = true;
            status
                .actions_taken
                .push("Flagged for potential rollback".to_string());
            warn!("Task {} may need rollback due to quality issues", task.id);
        }

        if result.files_modified.len() > INCREMENTAL_BACKUP_FILE_THRESHOLD {
            match self
                .backup_manager
                .create_backup(
                    BackupType::Incremental,
                    Some(format!("post_task_{}", task.id)),
                    &format!("Backup after task {}", task.id),
                )
                .await
            {
                Ok(_) => {
                    status.backup_created = true;
                    status
                        .actions_taken
                        .push("Created incremental backup".to_string());
                    self.session.lock().await.stats.backups_created += 1;
                }
                Err(e) => error!("Post-task backup failed: {}", e),
            }
        }

        status
    }

    /// Recover to the last safe state. Stages, in order: rollback to the
    /// current rollback point, restore files from the session backup, git
    /// reset to the session backup's commit.
    pub async fn emergency_recovery(&self, reason: &str) -> RecoveryResult {
        error!("EMERGENCY RECOVERY: {}", reason);

        let (rollback_point, session_backup) = {
            let mut session = self.session.lock().await;
            session.stats.emergency_rollbacks += 1;
            (
                session.current_rollback_point.clone(),
                session.session_backup.clone(),
            )
        };

        let mut recovery = RecoveryResult {
            recovery_attempted: true,
            ..RecoveryResult::default()
        };

        if let Some(point) = &rollback_point {
            info!("Attempting rollback to current rollback point");
            match self
                .rollback_manager
                .rollback_to_point(&point.rollback_id, RollbackType::FullRestore, true)
                .await
            {
                Ok(op)
                    if matches!(
                        op.status,
                        rollback_manager::RollbackStatus::Completed
                            | rollback_manager::RollbackStatus::Verified
                    ) =>
                {
                    recovery.recovery_successful = true;
                    recovery.method_used = Some("rollback_point".to_string());
                    recovery.recovered_to = Some(point.rollback_id.clone());
                }
                Ok(op) => recovery.errors.extend(op.errors),
                Err(e) => recovery.errors.push(e.to_string()),
            }
        }

        if !recovery.recovery_successful {
            if let Some(backup) = &session_backup {
                info!("Attempting session backup restore");
                match self
                    .rollback_manager
                    .restore_from_backup(&backup.backup_id)
                    .await
                {
                    Ok(_) => {
                        recovery.recovery_successful = true;
                        recovery.method_used = Some("backup_restore".to_string());
                        recovery.recovered_to = Some(backup.backup_id.clone());
                    }
                    Err(e) => recovery.errors.push(e.to_string()),
                }
            }
        }

        if !recovery.recovery_successful {
            if let Some(commit) = session_backup.as_ref().and_then(|b| b.git_commit.clone()) {
                info!("Attempting git reset to session backup commit");
                match self.git.reset_hard(&commit) {
                    Ok(()) => {
                        recovery.recovery_successful = true;
                        recovery.method_used = Some("git_reset".to_string());
                        recovery.recovered_to = Some(commit);
                    }
                    Err(e) => recovery.errors.push(e.to_string()),
                }
            }
        }

        if recovery.recovery_successful {
            self.session.lock().await.stats.successful_recoveries += 1;
            info!("Emergency recovery completed successfully");
        } else {
            error!("Emergency recovery failed - manual intervention required");
        }

        self.events.publish(SystemEvent::EmergencyRecovery {
            reason: reason.to_string(),
            successful: recovery.recovery_successful,
            method: recovery.method_used.clone(),
        });

        recovery
    }

    pub async fn safety_health_check(&self) -> SafetyHealth {
        let mut issues = Vec::new();

        let backup_healthy = self.backup_manager.verified_backup_count().await > 0;
        if !backup_healthy {
            issues.push("No verified backups available".to_string());
        }

        let rollback_status = self.rollback_manager.status().await;
        let rollback_healthy = rollback_status.rollback_points_count > 0
            && rollback_status.recent_success_rate >= 0.8;
        if !rollback_healthy {
            issues.push("Rollback system has no points or poor success rate".to_string());
        }

        let danger_healthy = self.danger_detector.enabled_pattern_count() > 0;
        if !danger_healthy {
            issues.push("Danger detection has no enabled patterns".to_string());
        }

        let session = self.session.lock().await;
        let mut overall = backup_healthy && rollback_healthy && danger_healthy;
        if session.active && session.session_backup.is_none() {
            issues.push("Safety session active but no session backup".to_string());
            overall = false;
        }

        SafetyHealth {
            overall_healthy: overall,
            backup_manager_healthy: backup_healthy,
            rollback_manager_healthy: rollback_healthy,
            danger_detector_healthy: danger_healthy,
            issues,
        }
    }

    pub async fn violations_count(&self) -> usize {
        self.session.lock().await.violations.len()
    }

    pub async fn stats(&self) -> SafetyStats {
        self.session.lock().await.stats.clone()
    }

    /// Close the session; a final incremental backup is taken when the
    /// session produced substantial changes.
    pub async fn finalize_safety_session(&self) -> SafetySessionReport {
        info!("Finalizing safety session");

        let (started_at, stats, violations, session_backup_id) = {
            let session = self.session.lock().await;
            (
                session.started_at,
                session.stats.clone(),
                session.violations.clone(),
                session.session_backup.as_ref().map(|b| b.backup_id.clone()),
            )
        };

        let substantial_changes =
            stats.backups_created > 1 || stats.rollback_points_created > 1;
        let final_backup_id = if substantial_changes {
            match self
                .backup_manager
                .create_backup(
                    BackupType::Incremental,
                    Some(format!("session_end_{}", Local::now().format("%Y%m%d_%H%M%S"))),
                    "End of safety session backup",
                )
                .await
            {
                Ok(backup) => Some(backup.backup_id),
                Err(e) => {
                    error!("Final session backup failed: {}", e);
                    None
                }
            }
        } else {
            None
        };

        self.session.lock().await.active = false;

        SafetySessionReport {
            session_duration_secs: started_at
                .map(|start| (Utc::now() - start).num_seconds())
                .unwrap_or(0),
            stats,
            violations,
            session_backup_id,
            final_backup_id,
        }
    }
}
