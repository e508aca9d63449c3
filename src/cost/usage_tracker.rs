//! Usage tracking with per-day and per-month JSON aggregates
//!
//! Every recorded usage updates the day file, recomputes the monthly
//! totals and free-tool rate, and evaluates the budget alert thresholds.
//! Each threshold fires at most once per month.

use crate::events::{EventBus, SystemEvent};
use crate::models::AgentType;
use crate::storage::JsonStore;
use crate::Result;
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use tokio::sync::Mutex;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceType {
    LocalLlm,
    ClaudeApi,
    OpenAiApi,
    GithubApi,
    ObsidianApi,
    Other,
}

impl ServiceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceType::LocalLlm => "local_llm",
            ServiceType::ClaudeApi => "claude_api",
            ServiceType::OpenAiApi => "openai_api",
            ServiceType::GithubApi => "github_api",
            ServiceType::ObsidianApi => "obsidian_api",
            ServiceType::Other => "other",
        }
    }

    pub fn for_agent(agent: AgentType) -> Self {
        match agent {
            AgentType::LocalLlm => ServiceType::LocalLlm,
            AgentType::ClaudeCode => ServiceType::ClaudeApi,
            AgentType::OpenAiCodex => ServiceType::OpenAiApi,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageRecord {
    pub timestamp: DateTime<Utc>,
    pub service_type: ServiceType,
    pub operation_type: String,
    /// USD; never negative
    pub cost: f64,
    pub tokens_used: u64,
    pub request_count: u64,
    pub task_id: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DayUsage {
    pub date: NaiveDate,
    pub total_cost: f64,
    pub total_tokens: u64,
    pub total_requests: u64,
    pub service_breakdown: HashMap<String, f64>,
    pub operation_breakdown: HashMap<String, f64>,
    pub records: Vec<UsageRecord>,
}

impl DayUsage {
    fn new(date: NaiveDate) -> Self {
        Self {
            date,
            total_cost: 0.0,
            total_tokens: 0,
            total_requests: 0,
            service_breakdown: HashMap::new(),
            operation_breakdown: HashMap::new(),
            records: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonthUsage {
    pub year: i32,
    pub month: u32,
    pub total_cost: f64,
    pub total_tokens: u64,
    pub total_requests: u64,
    pub free_requests: u64,
    pub service_breakdown: HashMap<String, f64>,
    pub free_tool_usage_rate: f64,
    pub budget_utilization: f64,
    /// Alert thresholds already fired this month (one-shot each)
    pub triggered_thresholds: Vec<f64>,
}

impl MonthUsage {
    fn new(year: i32, month: u32) -> Self {
        Self {
            year,
            month,
            total_cost: 0.0,
            total_tokens: 0,
            total_requests: 0,
            free_requests: 0,
            service_breakdown: HashMap::new(),
            free_tool_usage_rate: 0.0,
            budget_utilization: 0.0,
            triggered_thresholds: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BudgetStatus {
    pub monthly_budget: f64,
    pub current_spend: f64,
    pub remaining_budget: f64,
    pub budget_utilization: f64,
    pub days_remaining: i64,
    pub daily_budget_remaining: f64,
    pub free_tool_usage_rate: f64,
    pub on_track: bool,
    pub alert_status: String,
}

#[derive(Debug, Default)]
struct TrackerCache {
    day: Option<DayUsage>,
    month: Option<MonthUsage>,
}

pub struct UsageTracker {
    storage_path: PathBuf,
    monthly_budget: f64,
    alert_thresholds: Vec<f64>,
    free_tools: HashSet<ServiceType>,
    events: EventBus,
    cache: Mutex<TrackerCache>,
}

impl UsageTracker {
    pub fn new(
        storage_path: PathBuf,
        monthly_budget: f64,
        alert_thresholds: Vec<f64>,
        events: EventBus,
    ) -> Self {
        let mut sorted_thresholds = alert_thresholds;
        sorted_thresholds.sort_by(f64::total_cmp);

        Self {
            storage_path,
            monthly_budget,
            alert_thresholds: sorted_thresholds,
            free_tools: HashSet::from([ServiceType::LocalLlm, ServiceType::GithubApi]),
            events,
            cache: Mutex::new(TrackerCache::default()),
        }
    }

    pub fn is_free_service(&self, service: ServiceType) -> bool {
        self.free_tools.contains(&service)
    }

    /// Append a usage record and recompute the day and month aggregates.
    pub async fn record_usage(
        &self,
        service_type: ServiceType,
        operation_type: &str,
        cost: f64,
        tokens_used: u64,
        task_id: Option<String>,
    ) -> Result<()> {
        if cost < 0.0 {
            return Err(crate::NocturnalError::Validation(
                "usage cost cannot be negative".to_string(),
            ));
        }

        let now = Utc::now();
        let record = UsageRecord {
            timestamp: now,
            service_type,
            operation_type: operation_type.to_string(),
            cost,
            tokens_used,
            request_count: 1,
            task_id,
            metadata: HashMap::new(),
        };

        let mut cache = self.cache.lock().await;

        let mut day = self.day_usage_for(&mut cache, now.date_naive()).await?;
        day.total_cost += cost;
        day.total_tokens += tokens_used;
        day.total_requests += 1;
        *day
            .service_breakdown
            .entry(service_type.as_str().to_string())
            .or_insert(0.0) += cost;
        *day
            .operation_breakdown
            .entry(operation_type.to_string())
            .or_insert(0.0) += cost;
        day.records.push(record);

        let mut month = self
            .month_usage_for(&mut cache, now.year(), now.month())
            .await?;
        month.total_cost += cost;
        month.total_tokens += tokens_used;
        month.total_requests += 1;
        if self.is_free_service(service_type) {
            month.free_requests += 1;
        }
        *month
            .service_breakdown
            .entry(service_type.as_str().to_string())
            .or_insert(0.0) += cost;
        month.free_tool_usage_rate = if month.total_requests > 0 {
            month.free_requests as f64 / month.total_requests as f64
        } else {
            0.0
        };
        month.budget_utilization = month.total_cost / self.monthly_budget;

        self.check_alerts(&mut month);

        self.day_store(day.date).save(&day).await?;
        self.month_store(month.year, month.month).save(&month).await?;

        cache.day = Some(day);
        cache.month = Some(month);

        debug!(
            "Usage recorded: {} - ${:.4}",
            service_type.as_str(),
            cost
        );
        Ok(())
    }

    pub async fn current_month_usage(&self) -> Result<MonthUsage> {
        let now = Utc::now();
        let mut cache = self.cache.lock().await;
        self.month_usage_for(&mut cache, now.year(), now.month()).await
    }

    pub async fn current_day_usage(&self) -> Result<DayUsage> {
        let mut cache = self.cache.lock().await;
        self.day_usage_for(&mut cache, Utc::now().date_naive()).await
    }

    pub async fn monthly_report(&self, year: i32, month: u32) -> Result<Option<MonthUsage>> {
        self.month_store(year, month).load().await
    }

    /// Budget posture derived from the current month aggregate.
    pub async fn get_budget_status(&self) -> Result<BudgetStatus> {
        let month = self.current_month_usage().await?;
        let today = Utc::now().date_naive();

        let days_in_month = days_in_month(today.year(), today.month());
        let days_remaining = (days_in_month - today.day()) as i64 + 1;
        let remaining_budget = self.monthly_budget - month.total_cost;

        Ok(BudgetStatus {
            monthly_budget: self.monthly_budget,
            current_spend: month.total_cost,
            remaining_budget,
            budget_utilization: month.budget_utilization,
            days_remaining,
            daily_budget_remaining: if days_remaining > 0 {
                remaining_budget / days_remaining as f64
            } else {
                0.0
            },
            free_tool_usage_rate: month.free_tool_usage_rate,
            on_track: month.budget_utilization
                <= today.day() as f64 / days_in_month as f64,
            alert_status: alert_status(month.budget_utilization),
        })
    }

    /// Per-service cost totals over the trailing `days`.
    pub async fn service_breakdown(&self, days: i64) -> Result<HashMap<String, f64>> {
        let end = Utc::now().date_naive();
        let mut totals: HashMap<String, f64> = HashMap::new();

        for offset in 0..days {
            let date = end - chrono::Duration::days(offset);
            if let Some(day) = self.day_store(date).load::<DayUsage>().await? {
                for (service, cost) in day.service_breakdown {
                    *totals.entry(service).or_insert(0.0) += cost;
                }
            }
        }
        Ok(totals)
    }

    /// Daily cost/token/request series over the trailing `days`, oldest
    /// first.
    pub async fn usage_trends(&self, days: i64) -> Result<Vec<(NaiveDate, f64, u64, u64)>> {
        let end = Utc::now().date_naive();
        let mut series = Vec::new();

        for offset in (0..days).rev() {
            let date = end - chrono::Duration::days(offset);
            let entry = self
                .day_store(date)
                .load::<DayUsage>()
                .await?
                .map(|d| (date, d.total_cost, d.total_tokens, d.total_requests))
                .unwrap_or((date, 0.0, 0, 0));
            series.push(entry);
        }
        Ok(series)
    }

    fn check_alerts(&self, month: &mut MonthUsage) {
        for &threshold in &self.alert_thresholds {
            let already_fired = month
                .triggered_thresholds
                .iter()
                .any(|t| (t - threshold).abs() < f64::EPSILON);
            if month.budget_utilization >= threshold && !already_fired {
                month.triggered_thresholds.push(threshold);
                warn!(
                    "Budget alert: {:.0}% threshold crossed (utilization {:.1}%)",
                    threshold * 100.0,
                    month.budget_utilization * 100.0
                );
                self.events.publish(SystemEvent::BudgetAlert {
                    threshold,
                    utilization: month.budget_utilization,
                    emergency: false,
                });
            }
        }
    }

    async fn day_usage_for(
        &self,
        cache: &mut TrackerCache,
        date: NaiveDate,
    ) -> Result<DayUsage> {
        if let Some(day) = &cache.day {
            if day.date == date {
                return Ok(day.clone());
            }
        }
        let loaded = self
            .day_store(date)
            .load::<DayUsage>()
            .await?
            .unwrap_or_else(|| DayUsage::new(date));
        cache.day = Some(loaded.clone());
        Ok(loaded)
    }

    async fn month_usage_for(
        &self,
        cache: &mut TrackerCache,
        year: i32,
        month: u32,
    ) -> Result<MonthUsage> {
        if let Some(cached) = &cache.month {
            if cached.year == year && cached.month == month {
                return Ok(cached.clone());
            }
        }
        let loaded = self
            .month_store(year, month)
            .load::<MonthUsage>()
            .await?
            .unwrap_or_else(|| MonthUsage::new(year, month));
        cache.month = Some(loaded.clone());
        Ok(loaded)
    }

    fn day_store(&self, date: NaiveDate) -> JsonStore {
        JsonStore::new(
            self.storage_path
                .join(format!("daily_{}.json", date.format("%Y-%m-%d"))),
        )
    }

    fn month_store(&self, year: i32, month: u32) -> JsonStore {
        JsonStore::new(
            self.storage_path
                .join(format!("monthly_{year}_{month:02}.json")),
        )
    }
}

fn alert_status(utilization: f64) -> String {
    if utilization >= 0.95 {
        "critical"
    } else if utilization >= 0.8 {
        "warning"
    } else if utilization >= 0.5 {
        "attention"
    } else {
        "normal"
    }
    .to_string()
}

fn days_in_month(year: i32, month: u32) -> u32 {
    let (next_year, next_month) = if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    };
    let first_of_next = NaiveDate::from_ymd_opt(next_year, next_month, 1);
    let first = NaiveDate::from_ymd_opt(year, month, 1);
    match (first, first_of_next) {
        (Some(a), Some(b)) => (b - a).num_days() as u32,
        _ => 30,
    }
}
