//! System-wide tuning constants

/// Scheduler sleep while the execution window or resources gate work
pub const GATED_SLEEP_SECS: u64 = 60;

/// Scheduler sleep when the queue has no executable task
pub const IDLE_SLEEP_SECS: u64 = 30;

/// Wall-clock sampling cadence for the time controller
pub const TIME_MONITOR_INTERVAL_SECS: u64 = 60;

/// Safety margin added to a task's estimated duration when checking the
/// remaining night window
pub const WINDOW_SAFETY_MARGIN_SECS: u64 = 5 * 60;

/// Residual-task wait when finalizing a parallel session
pub const SESSION_FINALIZE_TIMEOUT_SECS: u64 = 300;

/// Priority score floor; scores never drop below this
pub const MIN_PRIORITY_SCORE: f64 = 0.1;

/// Age bonus applied per queued hour, capped at `MAX_AGE_BONUS`
pub const AGE_BONUS_PER_HOUR: f64 = 0.1;
pub const MAX_AGE_BONUS: f64 = 1.0;

/// Priority promotion applied when a failed task is re-queued
pub const RETRY_PROMOTION: f64 = 0.5;

/// Priority demotion applied when a task is deferred on dependencies
pub const DEPENDENCY_DEMOTION: f64 = 0.1;

/// Quality score below which a completed task is flagged for rollback
pub const ROLLBACK_QUALITY_FLOOR: f64 = 0.3;

/// Modified-file count above which a post-task incremental backup is taken
pub const INCREMENTAL_BACKUP_FILE_THRESHOLD: usize = 5;

/// Fraction of snapshot file hashes that must match for a rollback to verify
pub const ROLLBACK_VERIFICATION_RATE: f64 = 0.95;

/// Budget utilization that activates / deactivates emergency mode
pub const BUDGET_EMERGENCY_ON: f64 = 0.98;
pub const BUDGET_EMERGENCY_OFF: f64 = 0.95;
