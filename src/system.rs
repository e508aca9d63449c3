//! System assembly
//!
//! Builds the one-instance-per-project subsystem graph and hands back the
//! scheduler plus the handles a caller needs for status queries and
//! reports.

use crate::agents::TaskExecutor;
use crate::config::NocturnalConfig;
use crate::cost::CostManager;
use crate::events::EventBus;
use crate::parallel::branch_manager::BranchManager;
use crate::parallel::quality_controller::QualityController;
use crate::parallel::ParallelExecutor;
use crate::safety::SafetyCoordinator;
use crate::scheduler::resource_monitor::ResourceMonitor;
use crate::scheduler::task_queue::TaskQueue;
use crate::scheduler::time_controller::TimeController;
use crate::scheduler::NightScheduler;
use crate::vcs::GitClient;
use crate::Result;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

pub struct NocturnalSystem {
    pub scheduler: Arc<NightScheduler>,
    pub events: EventBus,
    pub cost_manager: Arc<CostManager>,
    pub safety_coordinator: Arc<SafetyCoordinator>,
    pub task_queue: Arc<TaskQueue>,
}

impl NocturnalSystem {
    /// Wire every subsystem for one project. The caller supplies the
    /// external agent that actually produces code.
    pub fn build(
        project_path: &Path,
        config: &NocturnalConfig,
        agent: Arc<dyn TaskExecutor>,
    ) -> Result<Self> {
        config.validate()?;
        info!("Assembling nocturnal system for {}", project_path.display());

        let events = EventBus::default();
        let git = GitClient::new(project_path);
        git.verify_available()?;

        let time_controller = Arc::new(TimeController::new(&config.scheduler, events.clone()));
        let task_queue = Arc::new(TaskQueue::new(project_path, &config.queue));
        let resource_monitor = Arc::new(ResourceMonitor::new(&config.resources, events.clone()));

        let branch_manager = Arc::new(BranchManager::new(
            git,
            &config.branches,
            &config.quality,
        ));
        let quality_controller = Arc::new(QualityController::new(
            Arc::clone(&branch_manager),
            &config.quality,
            config.parallel.max_parallel_executions,
        ));
        let parallel_executor = Arc::new(ParallelExecutor::new(
            branch_manager,
            quality_controller,
            &config.parallel,
        ));

        let cost_manager = Arc::new(CostManager::new(project_path, &config.cost, events.clone()));
        let safety_coordinator = Arc::new(SafetyCoordinator::new(
            project_path,
            &config.safety,
            events.clone(),
        )?);

        let scheduler = Arc::new(NightScheduler::new(
            time_controller,
            Arc::clone(&task_queue),
            resource_monitor,
            parallel_executor,
            Arc::clone(&cost_manager),
            Arc::clone(&safety_coordinator),
            agent,
            events.clone(),
        ));

        Ok(Self {
            scheduler,
            events,
            cost_manager,
            safety_coordinator,
            task_queue,
        })
    }
}
