use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use uuid::Uuid;

/// A unit of work for the night scheduler
///
/// Tasks are created by the caller (CLI, approval queue, or another
/// system) and flow through the queue, the executor, and the quality
/// gate. Dependencies are expressed by task id, never by reference.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub description: String,
    pub priority: TaskPriority,
    pub status: TaskStatus,
    #[serde(default)]
    pub requirements: Vec<String>,
    #[serde(default)]
    pub constraints: Vec<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Estimated execution duration in seconds
    pub estimated_duration_secs: u64,
    /// Pre-execution quality estimate in [0, 1]; 0 means unknown
    #[serde(default)]
    pub estimated_quality: f64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(description: impl Into<String>, priority: TaskPriority) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            description: description.into(),
            priority,
            status: TaskStatus::Pending,
            requirements: Vec::new(),
            constraints: Vec::new(),
            dependencies: Vec::new(),
            estimated_duration_secs: 15 * 60,
            estimated_quality: 0.0,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_estimated_duration_secs(mut self, secs: u64) -> Self {
        self.estimated_duration_secs = secs;
        self
    }

    pub fn with_estimated_quality(mut self, quality: f64) -> Self {
        self.estimated_quality = quality;
        self
    }

    pub fn with_dependencies(mut self, dependencies: Vec<String>) -> Self {
        self.dependencies = dependencies;
        self
    }

    pub fn start_execution(&mut self) {
        self.status = TaskStatus::Running;
        self.started_at = Some(Utc::now());
    }

    pub fn complete_execution(&mut self, success: bool) {
        self.status = if success {
            TaskStatus::Completed
        } else {
            TaskStatus::Failed
        };
        self.completed_at = Some(Utc::now());
    }
}

/// Task priority levels
///
/// A sum type rather than a string; scheduling weight comes from the
/// single `weight()` mapping.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    Critical,
    High,
    Medium,
    Low,
}

impl TaskPriority {
    /// Base scheduling weight; lower weight dequeues sooner.
    pub fn weight(&self) -> f64 {
        match self {
            TaskPriority::Critical => 1.0,
            TaskPriority::High => 2.0,
            TaskPriority::Medium => 3.0,
            TaskPriority::Low => 4.0,
        }
    }
}

impl FromStr for TaskPriority {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "critical" => Ok(TaskPriority::Critical),
            "high" => Ok(TaskPriority::High),
            "medium" => Ok(TaskPriority::Medium),
            "low" => Ok(TaskPriority::Low),
            _ => Err(format!("Unknown priority: {s}")),
        }
    }
}

/// Task lifecycle status; monotonic except Pending <-> Running on retry
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

/// External code-generating agents the optimizer can route to
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AgentType {
    LocalLlm,
    ClaudeCode,
    OpenAiCodex,
}

/// Quality assessment produced once per execution attempt
///
/// `overall` is a deterministic weighted mean of the sub-scores when they
/// are supplied; a score built through `QualityScore::from_components`
/// always satisfies that invariant.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QualityScore {
    pub overall: f64,
    pub code_quality: f64,
    pub consistency: f64,
    pub test_coverage: f64,
    pub security: f64,
    pub performance: f64,
}

impl QualityScore {
    const WEIGHTS: [(f64, fn(&QualityScore) -> f64); 5] = [
        (0.30, |s| s.code_quality),
        (0.25, |s| s.consistency),
        (0.20, |s| s.test_coverage),
        (0.15, |s| s.security),
        (0.10, |s| s.performance),
    ];

    /// Build a score whose overall is the weighted mean of the sub-scores.
    pub fn from_components(
        code_quality: f64,
        consistency: f64,
        test_coverage: f64,
        security: f64,
        performance: f64,
    ) -> Self {
        let mut score = Self {
            overall: 0.0,
            code_quality,
            consistency,
            test_coverage,
            security,
            performance,
        };
        score.overall = Self::WEIGHTS
            .iter()
            .map(|(w, get)| w * get(&score).clamp(0.0, 1.0))
            .sum();
        score
    }

    /// Score for a failed or rejected execution.
    pub fn failed() -> Self {
        Self {
            overall: 0.0,
            code_quality: 0.0,
            consistency: 0.0,
            test_coverage: 0.0,
            security: 0.0,
            performance: 0.0,
        }
    }
}

/// Result of one execution attempt by an external agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub task_id: String,
    pub success: bool,
    pub quality_score: QualityScore,
    pub generated_code: String,
    /// Paths relative to the project root
    #[serde(default)]
    pub files_modified: Vec<String>,
    #[serde(default)]
    pub files_created: Vec<String>,
    #[serde(default)]
    pub errors: Vec<String>,
    pub execution_time_secs: f64,
    pub agent_used: AgentType,
    pub cost_incurred: f64,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl ExecutionResult {
    /// Synthetic failure result used for executor errors and timeouts.
    pub fn failure(task_id: impl Into<String>, agent: AgentType, error: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            success: false,
            quality_score: QualityScore::failed(),
            generated_code: String::new(),
            files_modified: Vec::new(),
            files_created: Vec::new(),
            errors: vec![error.into()],
            execution_time_secs: 0.0,
            agent_used: agent,
            cost_incurred: 0.0,
            metadata: HashMap::new(),
        }
    }

    pub fn has_changes(&self) -> bool {
        !self.files_modified.is_empty() || !self.files_created.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_weight_ordering() {
        assert!(TaskPriority::Critical.weight() < TaskPriority::High.weight());
        assert!(TaskPriority::High.weight() < TaskPriority::Medium.weight());
        assert!(TaskPriority::Medium.weight() < TaskPriority::Low.weight());
    }

    #[test]
    fn quality_score_weighted_mean() {
        let score = QualityScore::from_components(1.0, 1.0, 1.0, 1.0, 1.0);
        assert!((score.overall - 1.0).abs() < 1e-9);

        let score = QualityScore::from_components(0.8, 0.6, 0.4, 0.9, 0.5);
        let expected = 0.30 * 0.8 + 0.25 * 0.6 + 0.20 * 0.4 + 0.15 * 0.9 + 0.10 * 0.5;
        assert!((score.overall - expected).abs() < 1e-9);
        assert!(score.overall >= 0.0 && score.overall <= 1.0);
    }

    #[test]
    fn quality_score_clamps_out_of_range_components() {
        let score = QualityScore::from_components(2.0, -1.0, 1.0, 1.0, 1.0);
        assert!(score.overall <= 1.0);
    }

    #[test]
    fn task_lifecycle_transitions() {
        let mut task = Task::new("add logging", TaskPriority::Medium);
        assert_eq!(task.status, TaskStatus::Pending);

        task.start_execution();
        assert_eq!(task.status, TaskStatus::Running);
        assert!(task.started_at.is_some());

        task.complete_execution(true);
        assert_eq!(task.status, TaskStatus::Completed);
        assert!(task.completed_at.is_some());
    }

    #[test]
    fn enums_serialize_lowercase() {
        assert_eq!(
            serde_json::to_string(&TaskPriority::Critical).unwrap(),
            "\"critical\""
        );
        assert_eq!(
            serde_json::to_string(&TaskStatus::Pending).unwrap(),
            "\"pending\""
        );
        assert_eq!(
            serde_json::to_string(&AgentType::LocalLlm).unwrap(),
            "\"local_llm\""
        );
    }
}
