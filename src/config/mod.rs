use crate::{NocturnalError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level configuration document
///
/// Defaults come from the `Default` impls below; an optional TOML file and
/// `NOCTURNAL_`-prefixed environment variables overlay them in that order.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct NocturnalConfig {
    pub scheduler: SchedulerConfig,
    pub queue: QueueConfig,
    pub resources: ResourceConfig,
    pub parallel: ParallelConfig,
    pub branches: BranchConfig,
    pub quality: QualityConfig,
    pub cost: CostConfig,
    pub safety: SafetyConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Local hour at which the night window opens (inclusive)
    pub night_start_hour: u32,
    /// Local hour at which the night window closes (exclusive)
    pub night_end_hour: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            night_start_hour: 22,
            night_end_hour: 6,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub max_concurrent_tasks: usize,
    pub max_queue_size: usize,
    pub max_retries: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 1,
            max_queue_size: 100,
            max_retries: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceConfig {
    pub monitor_interval_secs: u64,
    pub max_history_size: usize,
    pub cpu_warning_percent: f64,
    pub cpu_critical_percent: f64,
    pub memory_warning_percent: f64,
    pub memory_critical_percent: f64,
    /// Hard memory cap in GB; crossing it is an emergency
    pub memory_absolute_gb: f64,
    pub disk_warning_percent: f64,
    pub disk_critical_percent: f64,
    pub min_free_disk_gb: f64,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            monitor_interval_secs: 30,
            max_history_size: 1000,
            cpu_warning_percent: 70.0,
            cpu_critical_percent: 90.0,
            memory_warning_percent: 80.0,
            memory_critical_percent: 97.0,
            memory_absolute_gb: 8.0,
            disk_warning_percent: 85.0,
            disk_critical_percent: 95.0,
            min_free_disk_gb: 5.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ParallelConfig {
    pub max_parallel_executions: usize,
    pub execution_timeout_secs: u64,
}

impl Default for ParallelConfig {
    fn default() -> Self {
        Self {
            max_parallel_executions: 3,
            execution_timeout_secs: 1800,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BranchConfig {
    pub branch_prefix: String,
    /// Merged/abandoned branches older than this are pruned
    pub max_branch_age_hours: i64,
}

impl Default for BranchConfig {
    fn default() -> Self {
        Self {
            branch_prefix: "nocturnal".to_string(),
            max_branch_age_hours: 24,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityConfig {
    pub high_quality_threshold: f64,
    pub medium_quality_threshold: f64,
    pub auto_apply_threshold: f64,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            high_quality_threshold: 0.85,
            medium_quality_threshold: 0.70,
            auto_apply_threshold: 0.90,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CostConfig {
    pub monthly_budget: f64,
    pub free_tool_target_rate: f64,
    pub alert_thresholds: Vec<f64>,
    /// Where daily_*.json / monthly_*.json aggregates live; relative paths
    /// are resolved against the project root
    pub storage_path: PathBuf,
}

impl Default for CostConfig {
    fn default() -> Self {
        Self {
            monthly_budget: 10.0,
            free_tool_target_rate: 0.9,
            alert_thresholds: vec![0.5, 0.8, 0.9, 0.95],
            storage_path: PathBuf::from(".nocturnal/cost"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyConfig {
    pub backup: BackupConfig,
    pub danger: DangerConfig,
    pub rollback: RollbackConfig,
    pub block_dangerous_operations: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    /// Defaults to `<project>/../.nocturnal_backups` when empty
    pub backup_root: Option<PathBuf>,
    pub max_backups: usize,
    pub retention_days: i64,
    pub auto_verify: bool,
    pub critical_paths: Vec<String>,
    pub exclude_patterns: Vec<String>,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            backup_root: None,
            max_backups: 50,
            retention_days: 30,
            auto_verify: true,
            critical_paths: vec![
                "src/".to_string(),
                "tests/".to_string(),
                "Cargo.toml".to_string(),
                "package.json".to_string(),
                "pyproject.toml".to_string(),
                "requirements.txt".to_string(),
                ".gitignore".to_string(),
                "README.md".to_string(),
            ],
            exclude_patterns: vec![
                "node_modules/".to_string(),
                "__pycache__/".to_string(),
                ".git/".to_string(),
                ".venv/".to_string(),
                "venv/".to_string(),
                "target/".to_string(),
                "build/".to_string(),
                "dist/".to_string(),
                ".nocturnal/".to_string(),
                ".DS_Store".to_string(),
                "*.pyc".to_string(),
                "*.log".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DangerConfig {
    pub block_on_high_danger: bool,
    pub block_on_critical_danger: bool,
    pub protected_paths: Vec<String>,
    pub critical_system_paths: Vec<String>,
    /// User-supplied patterns appended to the built-in set
    pub custom_patterns: Vec<CustomPattern>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomPattern {
    pub name: String,
    pub pattern: String,
    pub danger_level: String,
    #[serde(default)]
    pub category: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

impl Default for DangerConfig {
    fn default() -> Self {
        Self {
            block_on_high_danger: true,
            block_on_critical_danger: true,
            protected_paths: vec![
                ".git/".to_string(),
                ".env".to_string(),
                "Cargo.toml".to_string(),
                "package.json".to_string(),
                "pyproject.toml".to_string(),
                "requirements.txt".to_string(),
                "config/".to_string(),
                "secrets/".to_string(),
                "certificates/".to_string(),
            ],
            critical_system_paths: vec![
                "/etc/".to_string(),
                "/bin/".to_string(),
                "/sbin/".to_string(),
                "/usr/bin/".to_string(),
                "/usr/sbin/".to_string(),
                "/System/".to_string(),
                "/Library/".to_string(),
                "C:\\Windows\\".to_string(),
                "C:\\Program Files\\".to_string(),
            ],
            custom_patterns: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RollbackConfig {
    pub max_rollback_points: usize,
    pub max_rollback_history: usize,
    pub auto_verify_rollbacks: bool,
    /// Trigger a full backup when a rollback point is created
    pub create_rollback_backup: bool,
}

impl Default for RollbackConfig {
    fn default() -> Self {
        Self {
            max_rollback_points: 10,
            max_rollback_history: 100,
            auto_verify_rollbacks: true,
            create_rollback_backup: true,
        }
    }
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            backup: BackupConfig::default(),
            danger: DangerConfig::default(),
            rollback: RollbackConfig::default(),
            block_dangerous_operations: true,
        }
    }
}

impl NocturnalConfig {
    /// Load configuration: defaults, overlaid by an optional TOML file,
    /// overlaid by `NOCTURNAL_`-prefixed environment variables.
    pub fn load(config_file: Option<&Path>) -> Result<Self> {
        if let Ok(path) = dotenvy::dotenv() {
            tracing::debug!("Loaded .env file from {:?}", path);
        }

        let defaults = config::Config::try_from(&NocturnalConfig::default())?;
        let mut builder = config::Config::builder().add_source(defaults);

        if let Some(path) = config_file {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        let settings = builder
            .add_source(
                config::Environment::with_prefix("NOCTURNAL")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let loaded: NocturnalConfig = settings.try_deserialize()?;
        loaded.validate()?;
        Ok(loaded)
    }

    /// Reject configurations that cannot be scheduled or gated sanely.
    pub fn validate(&self) -> Result<()> {
        if self.scheduler.night_start_hour > 23 || self.scheduler.night_end_hour > 23 {
            return Err(NocturnalError::Validation(
                "night window hours must be in 0..=23".to_string(),
            ));
        }
        if self.scheduler.night_start_hour == self.scheduler.night_end_hour {
            return Err(NocturnalError::Validation(
                "night window must be non-empty".to_string(),
            ));
        }
        if self.queue.max_queue_size == 0 || self.queue.max_concurrent_tasks == 0 {
            return Err(NocturnalError::Validation(
                "queue limits must be positive".to_string(),
            ));
        }
        if self.parallel.max_parallel_executions == 0 {
            return Err(NocturnalError::Validation(
                "max_parallel_executions must be positive".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.quality.medium_quality_threshold)
            || !(0.0..=1.0).contains(&self.quality.high_quality_threshold)
            || !(0.0..=1.0).contains(&self.quality.auto_apply_threshold)
        {
            return Err(NocturnalError::Validation(
                "quality thresholds must be in [0, 1]".to_string(),
            ));
        }
        if self.quality.medium_quality_threshold > self.quality.high_quality_threshold {
            return Err(NocturnalError::Validation(
                "medium quality threshold exceeds high threshold".to_string(),
            ));
        }
        if self.cost.monthly_budget <= 0.0 {
            return Err(NocturnalError::Validation(
                "monthly budget must be positive".to_string(),
            ));
        }
        for threshold in &self.cost.alert_thresholds {
            if !(0.0..=1.0).contains(threshold) {
                return Err(NocturnalError::Validation(format!(
                    "alert threshold {threshold} out of [0, 1]"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = NocturnalConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.scheduler.night_start_hour, 22);
        assert_eq!(config.scheduler.night_end_hour, 6);
        assert_eq!(config.queue.max_queue_size, 100);
        assert_eq!(config.parallel.max_parallel_executions, 3);
        assert_eq!(config.parallel.execution_timeout_secs, 1800);
        assert!((config.cost.monthly_budget - 10.0).abs() < f64::EPSILON);
        assert_eq!(config.cost.alert_thresholds, vec![0.5, 0.8, 0.9, 0.95]);
        assert!((config.quality.high_quality_threshold - 0.85).abs() < f64::EPSILON);
    }

    #[test]
    fn rejects_empty_window() {
        let mut config = NocturnalConfig::default();
        config.scheduler.night_start_hour = 6;
        config.scheduler.night_end_hour = 6;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_inverted_quality_thresholds() {
        let mut config = NocturnalConfig::default();
        config.quality.medium_quality_threshold = 0.9;
        config.quality.high_quality_threshold = 0.8;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_zero_budget() {
        let mut config = NocturnalConfig::default();
        config.cost.monthly_budget = 0.0;
        assert!(config.validate().is_err());
    }
}
