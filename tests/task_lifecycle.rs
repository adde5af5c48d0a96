//! Job control through the public controller against a scripted browser.

use std::time::Duration;

use qa_harvester_lib::domain::{JobStatus, NewAccount, NewJob, NewJobParameters, TaskError};
use qa_harvester_lib::test_utils::{ScriptedBrowserEngine, TestContext, VisitOutcome, wait_for_status};

const WAIT: Duration = Duration::from_secs(5);

async fn collection_job(ctx: &TestContext, max_exceptions: u32) -> i64 {
    let params = ctx
        .app
        .parameters
        .create(&NewJobParameters {
            interval: Duration::from_millis(10),
            max_exceptions,
            ..NewJobParameters::for_target("https://www.zhihu.com/question/314")
        })
        .await
        .unwrap();
    ctx.app
        .jobs
        .create(&NewJob::collection("lifecycle", Some(params.id)))
        .await
        .unwrap()
        .id
}

async fn wait_until_registered(ctx: &TestContext, job_id: i64) {
    for _ in 0..500 {
        if ctx.app.registry.is_registered(job_id) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("worker for job {job_id} never registered");
}

async fn wait_until_released(ctx: &TestContext, job_id: i64) {
    for _ in 0..500 {
        if !ctx.app.registry.is_registered(job_id) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("worker for job {job_id} never released");
}

#[tokio::test]
async fn start_pause_resume_stop() {
    let ctx = TestContext::new(ScriptedBrowserEngine::new(VisitOutcome::Success)).await.unwrap();
    let job_id = collection_job(&ctx, 3).await;
    let controller = &ctx.app.controller;

    let started = controller.start(job_id).await.unwrap();
    assert_eq!(started.status, JobStatus::Running);
    assert!(started.start_time.is_some());
    wait_until_registered(&ctx, job_id).await;

    let paused = controller.pause(job_id).await.unwrap();
    assert_eq!(paused.status, JobStatus::Paused);
    wait_until_released(&ctx, job_id).await;
    assert_eq!(ctx.app.jobs.status(job_id).await.unwrap(), Some(JobStatus::Paused));

    let resumed = controller.resume(job_id).await.unwrap();
    assert_eq!(resumed.status, JobStatus::Running);
    assert_eq!(resumed.start_time, started.start_time);
    wait_until_registered(&ctx, job_id).await;

    let stopped = controller.stop(job_id).await.unwrap();
    assert_eq!(stopped.status, JobStatus::Paused);
    assert!(stopped.end_time.is_some());
    wait_until_released(&ctx, job_id).await;

    let stats = ctx.engine.stats();
    assert_eq!(stats.launches, 2);
    assert_eq!(stats.launches, stats.closes);
}

#[tokio::test]
async fn invalid_transitions_are_rejected() {
    let ctx = TestContext::new(ScriptedBrowserEngine::new(VisitOutcome::Success)).await.unwrap();
    let job_id = collection_job(&ctx, 3).await;
    let controller = &ctx.app.controller;

    assert!(matches!(
        controller.pause(job_id).await,
        Err(TaskError::InvalidTransition {
            from: JobStatus::Waiting,
            action: "pause",
            ..
        })
    ));
    assert!(matches!(
        controller.resume(job_id).await,
        Err(TaskError::InvalidTransition { .. })
    ));

    controller.start(job_id).await.unwrap();
    assert!(matches!(
        controller.start(job_id).await,
        Err(TaskError::InvalidTransition {
            from: JobStatus::Running,
            ..
        })
    ));
    assert!(matches!(
        controller.delete(job_id).await,
        Err(TaskError::PreconditionFailed(_))
    ));

    controller.stop(job_id).await.unwrap();
    wait_until_released(&ctx, job_id).await;
}

#[tokio::test]
async fn stop_is_idempotent_at_rest() {
    let ctx = TestContext::new(ScriptedBrowserEngine::new(VisitOutcome::Success)).await.unwrap();
    let job_id = collection_job(&ctx, 3).await;

    let first = ctx.app.controller.stop(job_id).await.unwrap();
    let second = ctx.app.controller.stop(job_id).await.unwrap();
    assert_eq!(first.status, JobStatus::Paused);
    assert_eq!(second.status, JobStatus::Paused);
    assert_eq!(first.end_time, second.end_time);
}

#[tokio::test]
async fn repeated_failures_fail_the_job() {
    let ctx = TestContext::new(ScriptedBrowserEngine::new(VisitOutcome::Failure("blocked".into())))
        .await
        .unwrap();
    let job_id = collection_job(&ctx, 3).await;

    ctx.app.controller.start(job_id).await.unwrap();
    let status = wait_for_status(&ctx.app.jobs, job_id, JobStatus::Failed, WAIT).await.unwrap();

    assert_eq!(status, Some(JobStatus::Failed));
    let job = ctx.app.jobs.require(job_id).await.unwrap();
    assert_eq!(job.retry_count, 1);
    assert!(job.error_message.unwrap().contains("3 consecutive failures"));
    wait_until_released(&ctx, job_id).await;
    assert_eq!(ctx.engine.stats().visits, 3);
}

#[tokio::test]
async fn failed_job_can_be_restarted() {
    let engine = ScriptedBrowserEngine::new(VisitOutcome::Success).failing_launches(1);
    let ctx = TestContext::new(engine).await.unwrap();
    let job_id = collection_job(&ctx, 3).await;

    ctx.app.controller.start(job_id).await.unwrap();
    wait_for_status(&ctx.app.jobs, job_id, JobStatus::Failed, WAIT).await.unwrap();
    wait_until_released(&ctx, job_id).await;

    let restarted = ctx.app.controller.start(job_id).await.unwrap();
    assert_eq!(restarted.status, JobStatus::Running);
    wait_until_registered(&ctx, job_id).await;

    ctx.app.shutdown().await;
    assert!(ctx.app.registry.is_empty());
}

#[tokio::test]
async fn collection_job_requires_parameters() {
    let ctx = TestContext::new(ScriptedBrowserEngine::new(VisitOutcome::Success)).await.unwrap();
    let job = ctx.app.jobs.create(&NewJob::collection("bare", None)).await.unwrap();

    assert!(matches!(
        ctx.app.controller.start(job.id).await,
        Err(TaskError::PreconditionFailed(_))
    ));
    assert_eq!(ctx.app.jobs.status(job.id).await.unwrap(), Some(JobStatus::Waiting));
}

#[tokio::test]
async fn delete_and_unknown_jobs() {
    let ctx = TestContext::new(ScriptedBrowserEngine::new(VisitOutcome::Success)).await.unwrap();
    let job_id = collection_job(&ctx, 3).await;

    assert!(matches!(
        ctx.app.controller.start(9_999).await,
        Err(TaskError::NotFound { id: 9_999, .. })
    ));

    let deleted = ctx.app.controller.delete(job_id).await.unwrap();
    assert_eq!(deleted.id, job_id);
    assert!(ctx.app.jobs.get(job_id).await.unwrap().is_none());
    assert!(matches!(
        ctx.app.controller.delete(job_id).await,
        Err(TaskError::NotFound { .. })
    ));
}

#[tokio::test]
async fn disabled_account_fails_the_job_without_a_session() {
    let ctx = TestContext::new(ScriptedBrowserEngine::new(VisitOutcome::Success)).await.unwrap();
    let account = ctx
        .app
        .accounts
        .create(&NewAccount {
            name: "retired".into(),
            cookies: r#"{"z_c0": "token"}"#.into(),
        })
        .await
        .unwrap();
    ctx.app.accounts.set_active(account.id, false).await.unwrap();
    let params = ctx
        .app
        .parameters
        .create(&NewJobParameters::for_target("https://www.zhihu.com/question/271"))
        .await
        .unwrap();
    let job = ctx
        .app
        .jobs
        .create(&NewJob::collection("retired account", params.id).with_account(account.id))
        .await
        .unwrap();

    ctx.app.controller.start(job.id).await.unwrap();
    wait_for_status(&ctx.app.jobs, job.id, JobStatus::Failed, WAIT).await.unwrap();

    let failed = ctx.app.jobs.require(job.id).await.unwrap();
    assert_eq!(
        failed.error_message.as_deref(),
        Some("Resource initialization failed: account retired is disabled")
    );
    assert_eq!(ctx.engine.stats().launches, 0);
}
