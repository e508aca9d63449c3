use super::test_helpers::*;
use crate::agents::TaskExecutor;
use crate::models::{AgentType, ExecutionResult, QualityScore, Task, TaskPriority};
use crate::safety::rollback_manager::RollbackType;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn happy_path_high_quality_task_lands_on_night_main() {
    let stack = build_stack_with(
        |project| file_writing_agent(project.to_path_buf(), "night_feature.rs", 0.92),
        |_| {},
    )
    .await;

    let task = Task::new("implement feature", TaskPriority::High)
        .with_id("T1")
        .with_estimated_duration_secs(600)
        .with_estimated_quality(0.92);
    stack.scheduler.add_task(task, None).await.unwrap();

    stack.scheduler.start().await.unwrap();

    let finished = wait_until!(
        Duration::from_secs(30),
        stack.scheduler.get_status().await.stats.tasks_completed >= 1
    );
    assert!(finished, "task did not complete in time");

    stack.scheduler.stop().await.unwrap();

    // Queue accounting: 1 completed, 0 failed
    let snapshot = stack.queue.snapshot().await;
    assert_eq!(snapshot.completed_tasks, 1);
    assert_eq!(snapshot.failed_tasks, 0);
    assert_eq!(snapshot.pending_tasks, 0);

    // Immediate-apply put the commit on night-main
    let night_main = stack.branches.night_main_branch().await.unwrap();
    stack.git.checkout(&night_main).unwrap();
    assert!(stack.project_dir.path().join("night_feature.rs").exists());

    // Session summary reports a perfect success rate
    let report = stack.scheduler.generate_night_report().await;
    assert!((report.success_rate - 1.0).abs() < f64::EPSILON);
    let parallel = report.parallel_session.expect("session summary");
    assert_eq!(parallel.completed_tasks, 1);
    assert_eq!(parallel.failed_tasks, 0);
}

#[tokio::test]
async fn quality_gate_keeps_medium_work_off_night_main() {
    let stack = build_stack_with(
        |project| file_writing_agent(project.to_path_buf(), "medium_change.rs", 0.72),
        |_| {},
    )
    .await;

    let task = Task::new("medium quality tweak", TaskPriority::Medium)
        .with_id("T2")
        .with_estimated_duration_secs(600)
        .with_estimated_quality(0.72);
    stack.scheduler.add_task(task, None).await.unwrap();

    stack.scheduler.start().await.unwrap();

    let finished = wait_until!(Duration::from_secs(30), {
        let stats = stack.scheduler.get_status().await.stats;
        stats.tasks_completed + stats.tasks_failed >= 1
    });
    assert!(finished, "task did not finish in time");

    // The change sits on a medium-quality branch pending review
    let pending = stack.quality.pending_reviews().await;
    assert_eq!(pending.len(), 1);
    assert!(pending[0].contains("medium_quality-T2"));

    // Night-main never received the change
    let night_main = stack.branches.night_main_branch().await.unwrap();
    stack.git.checkout(&night_main).unwrap();
    assert!(!stack.project_dir.path().join("medium_change.rs").exists());

    stack.scheduler.stop().await.unwrap();
}

#[tokio::test]
async fn danger_block_stops_task_before_execution() {
    let invoked = Arc::new(AtomicBool::new(false));
    let invoked_probe = Arc::clone(&invoked);

    let stack = build_stack_with(
        move |_| {
            let executor: Arc<dyn TaskExecutor> = Arc::new(move |task: Task| {
                let invoked = Arc::clone(&invoked_probe);
                async move {
                    invoked.store(true, Ordering::SeqCst);
                    Ok(ExecutionResult {
                        task_id: task.id,
                        success: true,
                        quality_score: QualityScore::from_components(0.9, 0.9, 0.9, 0.9, 0.9),
                        generated_code: String::new(),
                        files_modified: Vec::new(),
                        files_created: Vec::new(),
                        errors: Vec::new(),
                        execution_time_secs: 0.0,
                        agent_used: AgentType::LocalLlm,
                        cost_incurred: 0.0,
                        metadata: Default::default(),
                    })
                }
            });
            executor
        },
        |config| {
            // One shot: no retries, so the blocked task archives at once
            config.queue.max_retries = 0;
        },
    )
    .await;

    let task = Task::new("cleanup: run rm -rf / to reclaim space", TaskPriority::High)
        .with_id("T3")
        .with_estimated_quality(0.9);
    stack.scheduler.add_task(task, None).await.unwrap();

    stack.scheduler.start().await.unwrap();

    let blocked = wait_until!(
        Duration::from_secs(30),
        stack.queue.snapshot().await.failed_tasks >= 1
    );
    assert!(blocked, "dangerous task was not blocked");

    stack.scheduler.stop().await.unwrap();

    // The executor never ran and the violation was recorded
    assert!(!invoked.load(Ordering::SeqCst));
    assert_eq!(stack.safety.violations_count().await, 1);

    let status = stack.scheduler.get_status().await;
    assert_eq!(status.stats.safety_blocked, 1);
    assert_eq!(status.stats.tasks_completed, 0);
}

#[tokio::test]
async fn resource_emergency_requeues_running_task() {
    let stack = build_stack_with(
        |_| slow_agent(Duration::from_secs(3)),
        |_| {},
    )
    .await;

    let task = Task::new("long running work", TaskPriority::Medium)
        .with_id("T-slow")
        .with_estimated_quality(0.9);
    stack.scheduler.add_task(task, None).await.unwrap();

    stack.scheduler.start().await.unwrap();

    let running = wait_until!(
        Duration::from_secs(10),
        stack.queue.running_count().await == 1
    );
    assert!(running, "task never started");

    // Inject a snapshot over the hard memory threshold
    stack.monitor.ingest_snapshot(emergency_snapshot()).await;

    let emergency = wait_until!(
        Duration::from_secs(10),
        stack.scheduler.is_emergency_shutdown()
    );
    assert!(emergency, "emergency shutdown did not trigger");

    let requeued = wait_until!(
        Duration::from_secs(10),
        stack.queue.running_count().await == 0 && stack.queue.pending_count().await == 1
    );
    assert!(requeued, "running task was not moved back to pending");

    stack.scheduler.stop().await.unwrap();
    assert!(stack.scheduler.get_status().await.stats.emergency_stops >= 1);
}

#[tokio::test]
async fn rollback_after_failed_task_restores_session_state() {
    let stack = build_stack_with(
        |_| slow_agent(Duration::from_millis(1)),
        |config| {
            config.queue.max_retries = 0;
        },
    )
    .await;

    // Open the safety session directly so the initial rollback point P0
    // is observable
    stack.safety.initialize_safety_session().await.unwrap();
    let p0 = stack
        .safety
        .rollback_manager()
        .latest_point()
        .await
        .expect("initial rollback point");
    let p0_commit = p0.git_commit.clone().unwrap();

    let task = Task::new("doomed refactor", TaskPriority::Medium)
        .with_id("T3-fail")
        .with_estimated_quality(0.6);

    // Run the failing work and assess it
    let pre = stack
        .safety
        .pre_task_safety_check(&task, "refactor the parser")
        .await;
    assert!(pre.safe_to_execute);

    let execution = ExecutionResult {
        task_id: task.id.clone(),
        success: false,
        quality_score: QualityScore::failed(),
        generated_code: String::new(),
        files_modified: vec!["a.rs".to_string(), "b.rs".to_string(), "c.rs".to_string()],
        files_created: Vec::new(),
        errors: vec!["generation failed".to_string()],
        execution_time_secs: 0.1,
        agent_used: AgentType::LocalLlm,
        cost_incurred: 0.0,
        metadata: Default::default(),
    };
    for name in ["a.rs", "b.rs", "c.rs"] {
        std::fs::write(stack.project_dir.path().join(name), "broken\n").unwrap();
    }

    let post = stack.safety.post_task_safety_check(&task, &execution).await;
    assert!(post.rollback_recommended);

    // Roll back to P0 and verify the tree matches it again
    let operation = stack
        .safety
        .rollback_manager()
        .rollback_to_point(&p0.rollback_id, RollbackType::FullRestore, true)
        .await
        .unwrap();
    assert_eq!(
        operation.status,
        crate::safety::rollback_manager::RollbackStatus::Verified
    );

    assert_eq!(stack.git.head_commit().unwrap(), p0_commit);
    assert!(!stack.project_dir.path().join("a.rs").exists());

    let report = operation.verification.unwrap();
    assert!(report.git_commit_match);
    assert!(report.file_match_rate >= 0.95);
}

#[tokio::test]
async fn graceful_stop_finalizes_session() {
    let stack = build_stack_with(|_| slow_agent(Duration::from_millis(10)), |_| {}).await;

    stack.scheduler.start().await.unwrap();
    stack.scheduler.stop().await.unwrap();

    let report = stack.scheduler.generate_night_report().await;
    assert_eq!(report.session_summary.tasks_attempted, 0);
    assert!(report.parallel_session.is_some());
}
