//! Branch strategy for parallel night execution
//!
//! Every session gets one night-main branch; every task attempt lands on
//! its own quality-tier branch. Auto-merges into night-main pass through a
//! quality gate and a conflict check, and the working tree is only ever
//! touched while holding the working-tree lock.

use crate::config::{BranchConfig, QualityConfig};
use crate::vcs::GitClient;
use crate::{NocturnalError, Result};
use chrono::{DateTime, Duration as ChronoDuration, Local, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BranchType {
    NightMain,
    HighQuality,
    MediumQuality,
    Experimental,
    Emergency,
}

impl BranchType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BranchType::NightMain => "night_main",
            BranchType::HighQuality => "high_quality",
            BranchType::MediumQuality => "medium_quality",
            BranchType::Experimental => "experimental",
            BranchType::Emergency => "emergency",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BranchStatus {
    Active,
    Merged,
    Abandoned,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BranchInfo {
    pub name: String,
    pub branch_type: BranchType,
    pub base_commit: String,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub quality_threshold: f64,
    pub associated_tasks: Vec<String>,
    pub status: BranchStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictSeverity {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Serialize)]
pub struct MergeConflict {
    pub source_branch: String,
    pub target_branch: String,
    pub conflicting_files: Vec<String>,
    pub severity: ConflictSeverity,
    pub auto_resolvable: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct MergeOutcome {
    pub success: bool,
    pub commit_hash: Option<String>,
    pub conflicting_files: Vec<String>,
    pub strategy_used: String,
    pub manual_intervention_required: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BranchStats {
    pub branches_created: u64,
    pub branches_merged: u64,
    pub conflicts_detected: u64,
    pub auto_merges_successful: u64,
    pub manual_interventions: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PendingBranch {
    pub name: String,
    pub branch_type: BranchType,
    pub tasks: Vec<String>,
    pub requires_review: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionBranchSummary {
    pub night_main: Option<String>,
    pub branches_created: u64,
    pub branches_merged: u64,
    pub pending_branches: Vec<PendingBranch>,
    pub cleaned_up: Vec<String>,
}

struct BranchState {
    active_branches: HashMap<String, BranchInfo>,
    night_main: Option<String>,
    original_branch: Option<String>,
    stats: BranchStats,
}

pub struct BranchManager {
    git: GitClient,
    branch_prefix: String,
    max_branch_age_hours: i64,
    high_quality_threshold: f64,
    medium_quality_threshold: f64,
    state: Mutex<BranchState>,
    /// The working directory is shared; checkout/commit/merge sequences
    /// hold this lock so only one task touches the tree at a time.
    working_tree: Arc<Mutex<()>>,
}

impl BranchManager {
    pub fn new(git: GitClient, branches: &BranchConfig, quality: &QualityConfig) -> Self {
        Self {
            git,
            branch_prefix: branches.branch_prefix.clone(),
            max_branch_age_hours: branches.max_branch_age_hours,
            high_quality_threshold: quality.high_quality_threshold,
            medium_quality_threshold: quality.medium_quality_threshold,
            state: Mutex::new(BranchState {
                active_branches: HashMap::new(),
                night_main: None,
                original_branch: None,
                stats: BranchStats::default(),
            }),
            working_tree: Arc::new(Mutex::new(())),
        }
    }

    /// Serialize all working-tree phases (checkout, commit, merge) behind
    /// one guard.
    pub async fn lock_working_tree(&self) -> OwnedMutexGuard<()> {
        Arc::clone(&self.working_tree).lock_owned().await
    }

    pub async fn night_main_branch(&self) -> Option<String> {
        self.state.lock().await.night_main.clone()
    }

    /// Snapshot the current branch/commit and create the per-session
    /// integration branch off HEAD.
    pub async fn initialize_night_session(&self) -> Result<String> {
        info!("Initializing night session branch environment");

        let current_branch = self.git.current_branch()?;
        let current_commit = self.git.head_commit()?;

        let session_id = Local::now().format("%Y%m%d").to_string();
        let night_main = format!("{}/night-{}", self.branch_prefix, session_id);

        self.git.create_branch(&night_main, &current_commit)?;

        let mut state = self.state.lock().await;
        let now = Utc::now();
        state.active_branches.insert(
            night_main.clone(),
            BranchInfo {
                name: night_main.clone(),
                branch_type: BranchType::NightMain,
                base_commit: current_commit,
                created_at: now,
                last_activity: now,
                quality_threshold: 0.0,
                associated_tasks: Vec::new(),
                status: BranchStatus::Active,
            },
        );
        state.night_main = Some(night_main.clone());
        state.original_branch = Some(current_branch);
        state.stats.branches_created += 1;

        info!("Night main branch created: {}", night_main);
        Ok(night_main)
    }

    /// Create a quality-tier isolation branch for a task. High-quality
    /// branches base off night-main; the rest base off HEAD.
    pub async fn create_quality_branch(
        &self,
        quality_score: f64,
        task_id: &str,
        task_description: &str,
    ) -> Result<String> {
        debug!(
            "Creating quality branch: task {} (quality {:.2})",
            task_id, quality_score
        );

        let branch_type = self.classify_branch_type(quality_score);
        let timestamp = Local::now().format("%H%M%S");
        let branch_name = format!(
            "{}/{}-{}-{}",
            self.branch_prefix,
            branch_type.as_str(),
            task_id,
            timestamp
        );

        let base_commit = if branch_type == BranchType::HighQuality {
            let night_main = self.night_main_branch().await.ok_or_else(|| {
                NocturnalError::SessionState {
                    message: "night session not initialized".to_string(),
                }
            })?;
            self.git.rev_parse(&night_main)?
        } else {
            self.git.head_commit()?
        };

        self.git.create_branch(&branch_name, &base_commit)?;

        let mut state = self.state.lock().await;
        let now = Utc::now();
        state.active_branches.insert(
            branch_name.clone(),
            BranchInfo {
                name: branch_name.clone(),
                branch_type,
                base_commit,
                created_at: now,
                last_activity: now,
                quality_threshold: self.quality_threshold_for(branch_type),
                associated_tasks: vec![task_id.to_string()],
                status: BranchStatus::Active,
            },
        );
        state.stats.branches_created += 1;

        info!(
            "Quality branch created: {} ({}, quality {:.2}) for {:.40}",
            branch_name,
            branch_type.as_str(),
            quality_score,
            task_description
        );
        Ok(branch_name)
    }

    pub async fn switch_to_branch(&self, branch_name: &str) -> Result<()> {
        self.git.checkout(branch_name)?;
        let mut state = self.state.lock().await;
        if let Some(info) = state.active_branches.get_mut(branch_name) {
            info.last_activity = Utc::now();
        }
        debug!("Switched to branch: {}", branch_name);
        Ok(())
    }

    /// Stage the listed files (or everything when none are given) and
    /// commit with a canonical message that embeds the task id.
    pub async fn commit_task_result(
        &self,
        task_id: &str,
        commit_message: &str,
        files_changed: &[String],
    ) -> Result<String> {
        self.git.add(files_changed)?;

        let full_message =
            format!("{commit_message}\n\nTask-ID: {task_id}\nNocturnal-Agent: automated-commit");
        self.git.commit(&full_message)?;
        let commit_hash = self.git.head_commit()?;

        let current_branch = self.git.current_branch()?;
        let mut state = self.state.lock().await;
        if let Some(info) = state.active_branches.get_mut(&current_branch) {
            info.last_activity = Utc::now();
            if !info.associated_tasks.iter().any(|t| t == task_id) {
                info.associated_tasks.push(task_id.to_string());
            }
        }

        debug!("Task result committed: {} -> {:.8}", task_id, commit_hash);
        Ok(commit_hash)
    }

    /// Dry-run three-way merge and classify the conflicting files.
    pub async fn detect_merge_conflicts(
        &self,
        source_branch: &str,
        target_branch: &str,
    ) -> Result<Vec<MergeConflict>> {
        let target_commit = self.git.rev_parse(target_branch)?;
        let source_commit = self.git.rev_parse(source_branch)?;

        let output = self.git.merge_tree(&target_commit, &source_commit)?;
        if !output_has_conflicts(&output) {
            return Ok(Vec::new());
        }

        let files = parse_conflicting_files(&output);
        let conflict = MergeConflict {
            source_branch: source_branch.to_string(),
            target_branch: target_branch.to_string(),
            severity: assess_conflict_severity(&files),
            auto_resolvable: files.len() <= 2,
            conflicting_files: files,
        };

        let mut state = self.state.lock().await;
        state.stats.conflicts_detected += 1;
        warn!(
            "Merge conflict detected: {} -> {} ({} files)",
            source_branch,
            target_branch,
            conflict.conflicting_files.len()
        );
        Ok(vec![conflict])
    }

    /// Attempt a non-fast-forward merge. Refuses below the quality gate
    /// for night-main targets and when conflicts are not auto-resolvable;
    /// the working tree returns to the original branch either way.
    pub async fn attempt_auto_merge(
        &self,
        source_branch: &str,
        target_branch: &str,
        quality_score: f64,
    ) -> Result<MergeOutcome> {
        debug!("Auto-merge attempt: {} -> {}", source_branch, target_branch);

        let night_main = self.night_main_branch().await;
        if night_main.as_deref() == Some(target_branch)
            && quality_score < self.high_quality_threshold
        {
            warn!(
                "Quality gate rejected merge: quality {:.2} < {:.2}",
                quality_score, self.high_quality_threshold
            );
            self.state.lock().await.stats.manual_interventions += 1;
            return Ok(MergeOutcome {
                success: false,
                commit_hash: None,
                conflicting_files: Vec::new(),
                strategy_used: "quality_gate_rejected".to_string(),
                manual_intervention_required: true,
            });
        }

        let conflicts = self
            .detect_merge_conflicts(source_branch, target_branch)
            .await?;
        let conflicting_files: Vec<String> = conflicts
            .iter()
            .flat_map(|c| c.conflicting_files.iter().cloned())
            .collect();

        if conflicts.iter().any(|c| !c.auto_resolvable) {
            self.state.lock().await.stats.manual_interventions += 1;
            return Ok(MergeOutcome {
                success: false,
                commit_hash: None,
                conflicting_files,
                strategy_used: "manual_intervention_required".to_string(),
                manual_intervention_required: true,
            });
        }

        let original_branch = self.git.current_branch()?;
        self.git.checkout(target_branch)?;

        let merge_message = format!(
            "Auto-merge: {source_branch} (quality: {quality_score:.2})"
        );
        let merge_result = self.git.merge_no_ff(source_branch, &merge_message);

        let outcome = match merge_result {
            Ok(()) => {
                let commit_hash = self.git.head_commit()?;
                let mut state = self.state.lock().await;
                state.stats.branches_merged += 1;
                state.stats.auto_merges_successful += 1;
                if let Some(info) = state.active_branches.get_mut(source_branch) {
                    info.status = BranchStatus::Merged;
                    info.last_activity = Utc::now();
                }
                info!("Auto-merge completed: {} -> {}", source_branch, target_branch);
                MergeOutcome {
                    success: true,
                    commit_hash: Some(commit_hash),
                    conflicting_files,
                    strategy_used: "no_ff_merge".to_string(),
                    manual_intervention_required: false,
                }
            }
            Err(e) => {
                warn!("Merge execution failed: {}", e);
                MergeOutcome {
                    success: false,
                    commit_hash: None,
                    conflicting_files,
                    strategy_used: "merge_failed".to_string(),
                    manual_intervention_required: true,
                }
            }
        };

        if original_branch != target_branch {
            if let Err(e) = self.git.checkout(&original_branch) {
                warn!("Failed to return to {}: {}", original_branch, e);
            }
        }

        Ok(outcome)
    }

    pub async fn mark_abandoned(&self, branch_name: &str) {
        let mut state = self.state.lock().await;
        if let Some(info) = state.active_branches.get_mut(branch_name) {
            info.status = BranchStatus::Abandoned;
            info.last_activity = Utc::now();
        }
    }

    /// Delete the branch from the repository and forget it entirely; used
    /// by the experimental rollback strategy.
    pub async fn discard_branch(&self, branch_name: &str) -> Result<()> {
        let night_main = self.night_main_branch().await.ok_or_else(|| {
            NocturnalError::SessionState {
                message: "night session not initialized".to_string(),
            }
        })?;
        self.git.checkout(&night_main)?;
        self.git.delete_branch(branch_name)?;
        self.state.lock().await.active_branches.remove(branch_name);
        info!("Discarded branch: {}", branch_name);
        Ok(())
    }

    /// Delete merged/abandoned non-night-main branches older than the
    /// cutoff.
    pub async fn cleanup_inactive_branches(&self, max_age_hours: i64) -> Vec<String> {
        let cutoff = Utc::now() - ChronoDuration::hours(max_age_hours);
        let mut deleted = Vec::new();

        let candidates: Vec<String> = {
            let state = self.state.lock().await;
            state
                .active_branches
                .values()
                .filter(|info| {
                    matches!(info.status, BranchStatus::Merged | BranchStatus::Abandoned)
                        && info.last_activity < cutoff
                        && info.branch_type != BranchType::NightMain
                })
                .map(|info| info.name.clone())
                .collect()
        };

        for branch_name in candidates {
            // A checked-out branch cannot be deleted; step off it first.
            if self.git.current_branch().ok().as_deref() == Some(branch_name.as_str()) {
                if let Some(night_main) = self.night_main_branch().await {
                    if let Err(e) = self.git.checkout(&night_main) {
                        warn!("Could not leave {} before deletion: {}", branch_name, e);
                        continue;
                    }
                }
            }
            match self.git.delete_branch(&branch_name) {
                Ok(()) => {
                    self.state.lock().await.active_branches.remove(&branch_name);
                    debug!("Deleted inactive branch: {}", branch_name);
                    deleted.push(branch_name);
                }
                Err(e) => warn!("Branch deletion failed ({}): {}", branch_name, e),
            }
        }

        deleted
    }

    pub async fn branch_info(&self, branch_name: &str) -> Option<BranchInfo> {
        self.state.lock().await.active_branches.get(branch_name).cloned()
    }

    pub async fn active_branch_count(&self) -> usize {
        self.state
            .lock()
            .await
            .active_branches
            .values()
            .filter(|info| info.status == BranchStatus::Active)
            .count()
    }

    pub async fn stats(&self) -> BranchStats {
        self.state.lock().await.stats.clone()
    }

    /// Report branches still active and pending manual review, pruning
    /// stale ones first.
    pub async fn finalize_night_session(&self) -> SessionBranchSummary {
        info!("Finalizing night session branches");

        let cleaned_up = self.cleanup_inactive_branches(self.max_branch_age_hours).await;

        let state = self.state.lock().await;
        let pending_branches: Vec<PendingBranch> = state
            .active_branches
            .values()
            .filter(|info| info.status == BranchStatus::Active)
            .map(|info| PendingBranch {
                name: info.name.clone(),
                branch_type: info.branch_type,
                tasks: info.associated_tasks.clone(),
                requires_review: info.branch_type != BranchType::HighQuality
                    && info.branch_type != BranchType::NightMain,
            })
            .collect();

        info!(
            "Night session finalized: {} branches pending review",
            pending_branches.len()
        );

        SessionBranchSummary {
            night_main: state.night_main.clone(),
            branches_created: state.stats.branches_created,
            branches_merged: state.stats.branches_merged,
            pending_branches,
            cleaned_up,
        }
    }

    fn classify_branch_type(&self, quality_score: f64) -> BranchType {
        if quality_score >= self.high_quality_threshold {
            BranchType::HighQuality
        } else if quality_score >= self.medium_quality_threshold {
            BranchType::MediumQuality
        } else {
            BranchType::Experimental
        }
    }

    fn quality_threshold_for(&self, branch_type: BranchType) -> f64 {
        match branch_type {
            BranchType::HighQuality => self.high_quality_threshold,
            BranchType::MediumQuality => self.medium_quality_threshold,
            _ => 0.0,
        }
    }
}

fn output_has_conflicts(merge_tree_output: &str) -> bool {
    !merge_tree_output.trim().is_empty()
        && (merge_tree_output.contains("<<<<<<<")
            || merge_tree_output.contains("changed in both")
            || merge_tree_output.contains("CONFLICT"))
}

/// Pull path-like tokens out of the conflict sections of merge-tree
/// output; deduplicated, order preserved.
fn parse_conflicting_files(output: &str) -> Vec<String> {
    let Ok(path_re) = Regex::new(r"(?:^|\s)([\w./-]+\.[A-Za-z]\w*)") else {
        return Vec::new();
    };
    let mut files = Vec::new();

    let mut in_conflict_section = false;
    for line in output.lines() {
        if line.contains("changed in both") || line.contains("CONFLICT") {
            in_conflict_section = true;
        }
        if in_conflict_section || line.contains("<<<<<<<") {
            for capture in path_re.captures_iter(line) {
                let file = capture[1].to_string();
                if !files.contains(&file) {
                    files.push(file);
                }
            }
        }
    }
    files
}

/// Count-only heuristic; consumers treat the value as opaque.
fn assess_conflict_severity(files: &[String]) -> ConflictSeverity {
    match files.len() {
        0 => ConflictSeverity::Low,
        1 | 2 => ConflictSeverity::Medium,
        _ => ConflictSeverity::High,
    }
}
