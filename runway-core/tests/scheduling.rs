mod support;

use anyhow::Result;
use chrono::{Duration, Utc};

use runway_core::{
    RunwayError,
    persistence::{AgentRepository, JobRepository, RunRepository, WorkspaceRepository},
    runs::RunProgress,
};
use runway_model::{JobStatus, Phase, RunId, RunStatus, WorkspaceId};
use support::Harness;

async fn active_runs(harness: &Harness, runs: &[RunId]) -> Result<usize> {
    let mut active = 0;
    for run in runs {
        if harness.store.get_run(*run).await?.status.is_active() {
            active += 1;
        }
    }
    Ok(active)
}

#[tokio::test]
async fn oldest_run_is_promoted_and_the_next_waits_its_turn() -> Result<()> {
    let harness = Harness::new();
    let workspace = harness.workspace("network").await?;
    let first = harness.runs.create_run(workspace.id, false).await?;
    let second = harness.runs.create_run(workspace.id, false).await?;
    let t0 = Utc::now() - Duration::minutes(5);
    harness.store.set_run_created_at(first.id, t0).await?;
    harness
        .store
        .set_run_created_at(second.id, t0 + Duration::seconds(1))
        .await?;

    let report = harness.scheduler.reconcile_all().await?;
    assert_eq!(report.promoted, vec![first.id]);
    assert_eq!(harness.store.get_run(first.id).await?.status, RunStatus::Planning);
    assert_eq!(harness.store.get_run(second.id).await?.status, RunStatus::Queued);

    // Run the plan to completion on an agent, then discard it.
    let agent = harness.agent("runner-1", 1).await?;
    harness.settle().await?;
    let plan = harness.job(first.id, Phase::Plan).await?;
    assert_eq!(plan.agent_id, Some(agent.id));
    harness.agents.start_job(agent.id, plan.id).await?;
    let completion = harness
        .agents
        .finish_job(agent.id, plan.id, JobStatus::Finished)
        .await?;
    assert_eq!(completion.run.status, RunStatus::Planned);

    // A planned run still holds the workspace.
    harness.scheduler.reconcile_all().await?;
    assert_eq!(harness.store.get_run(second.id).await?.status, RunStatus::Queued);

    harness.runs.discard(first.id).await?;
    let report = harness.scheduler.reconcile_all().await?;
    assert_eq!(report.promoted, vec![second.id]);
    assert_eq!(harness.store.get_run(second.id).await?.status, RunStatus::Planning);
    assert_eq!(
        harness.store.get_workspace(workspace.id).await?.current_run_id,
        Some(second.id)
    );
    Ok(())
}

#[tokio::test]
async fn discarding_a_planning_run_frees_its_agent_and_promotes_the_next() -> Result<()> {
    let harness = Harness::new();
    let workspace = harness.workspace("dns").await?;
    let first = harness.runs.create_run(workspace.id, false).await?;
    let second = harness.runs.create_run(workspace.id, false).await?;
    let t0 = Utc::now() - Duration::minutes(5);
    harness.store.set_run_created_at(first.id, t0).await?;
    harness
        .store
        .set_run_created_at(second.id, t0 + Duration::seconds(1))
        .await?;

    let agent = harness.agent("runner-1", 1).await?;
    harness.settle().await?;
    let plan = harness.job(first.id, Phase::Plan).await?;
    harness.agents.start_job(agent.id, plan.id).await?;
    assert_eq!(harness.store.get_run(first.id).await?.status, RunStatus::Planning);

    let discarded = harness.runs.discard(first.id).await?;
    assert_eq!(discarded.status, RunStatus::Discarded);
    assert_eq!(harness.store.get_job(plan.id).await?.status, JobStatus::Canceled);
    assert_eq!(harness.store.get_agent(agent.id).await?.load, 0);

    let report = harness.scheduler.reconcile_all().await?;
    assert_eq!(report.promoted, vec![second.id]);
    assert_eq!(harness.store.get_run(second.id).await?.status, RunStatus::Planning);
    Ok(())
}

#[tokio::test]
async fn applying_runs_can_be_discarded() -> Result<()> {
    let harness = Harness::new();
    let workspace = harness.workspace("edge").await?;
    let run = harness.runs.create_run(workspace.id, true).await?;
    let agent = harness.agent("runner-1", 1).await?;
    harness.settle().await?;
    let plan = harness.job(run.id, Phase::Plan).await?;
    harness.agents.start_job(agent.id, plan.id).await?;
    harness
        .agents
        .finish_job(agent.id, plan.id, JobStatus::Finished)
        .await?;
    assert_eq!(harness.store.get_run(run.id).await?.status, RunStatus::Applying);

    harness.runs.discard(run.id).await?;
    let apply = harness.job(run.id, Phase::Apply).await?;
    assert_eq!(apply.status, JobStatus::Canceled);
    assert_eq!(
        harness.store.get_workspace(workspace.id).await?.current_run_id,
        None
    );
    Ok(())
}

#[tokio::test]
async fn a_workspace_never_has_two_active_runs() -> Result<()> {
    let harness = Harness::new();
    let workspace = harness.workspace("storage").await?;
    let mut runs = Vec::new();
    for _ in 0..5 {
        runs.push(harness.runs.create_run(workspace.id, false).await?.id);
    }

    for _ in 0..runs.len() {
        harness.scheduler.reconcile_all().await?;
        harness.scheduler.reconcile_all().await?;
        assert_eq!(active_runs(&harness, &runs).await?, 1);

        let current = harness
            .store
            .get_workspace(workspace.id)
            .await?
            .current_run_id
            .expect("a run holds the workspace");
        harness.runs.cancel(current).await?;
        assert_eq!(active_runs(&harness, &runs).await?, 0);
    }

    harness.scheduler.reconcile_all().await?;
    assert_eq!(
        harness.store.get_workspace(workspace.id).await?.current_run_id,
        None
    );
    Ok(())
}

#[tokio::test]
async fn a_settled_system_reconciles_without_writing() -> Result<()> {
    let harness = Harness::new();
    let busy = harness.workspace("busy").await?;
    let idle = harness.workspace("idle").await?;
    harness.runs.create_run(busy.id, false).await?;
    harness.runs.create_run(busy.id, false).await?;
    harness.agent("runner-1", 2).await?;
    harness.settle().await?;

    let report = harness.scheduler.reconcile_all().await?;
    assert_eq!(report.workspaces, 2);
    assert_eq!(report.writes, 0);
    assert!(report.promoted.is_empty());
    assert_eq!(harness.scheduler.reconcile_workspace(idle.id).await?.writes(), 0);
    Ok(())
}

#[tokio::test]
async fn a_corrupt_workspace_does_not_stall_the_others() -> Result<()> {
    let harness = Harness::new();
    let broken = harness.workspace("broken").await?;
    let healthy = harness.workspace("healthy").await?;
    harness
        .store
        .force_current_run(broken.id, Some(RunId::new()))
        .await?;
    let run = harness.runs.create_run(healthy.id, false).await?;

    let report = harness.scheduler.reconcile_all().await?;
    assert_eq!(report.failed, vec![broken.id]);
    assert_eq!(report.promoted, vec![run.id]);

    let err = harness
        .scheduler
        .reconcile_workspace(broken.id)
        .await
        .unwrap_err();
    assert!(matches!(err, RunwayError::InvariantViolation(_)));
    Ok(())
}

#[tokio::test]
async fn a_failed_promotion_is_retried_on_the_next_pass() -> Result<()> {
    let harness = Harness::new();
    let workspace = harness.workspace("flaky").await?;
    let run = harness.runs.create_run(workspace.id, false).await?;

    harness.store.fail_next_writes(1);
    let report = harness.scheduler.reconcile_all().await?;
    assert_eq!(report.failed, vec![workspace.id]);
    assert_eq!(harness.store.get_run(run.id).await?.status, RunStatus::Pending);

    let report = harness.scheduler.reconcile_all().await?;
    assert!(report.failed.is_empty());
    assert_eq!(report.promoted, vec![run.id]);
    Ok(())
}

#[tokio::test]
async fn unknown_workspace_is_not_found() {
    let harness = Harness::new();
    let err = harness
        .scheduler
        .reconcile_workspace(WorkspaceId::new())
        .await
        .unwrap_err();
    assert!(matches!(err, RunwayError::NotFound(_)));
}

#[tokio::test]
async fn auto_apply_runs_plan_then_apply_without_a_confirmation() -> Result<()> {
    let harness = Harness::new();
    let workspace = harness.workspace("dns").await?;
    let agent = harness.agent("runner-1", 1).await?;
    let run = harness.runs.create_run(workspace.id, true).await?;
    harness.settle().await?;

    let plan = harness.job(run.id, Phase::Plan).await?;
    harness.agents.start_job(agent.id, plan.id).await?;
    let completion = harness
        .agents
        .finish_job(agent.id, plan.id, JobStatus::Finished)
        .await?;
    assert_eq!(completion.run.status, RunStatus::Applying);
    let apply = completion.next_job.expect("apply job created");
    assert_eq!(apply.status, JobStatus::Unscheduled);

    harness.settle().await?;
    let apply = harness.store.get_job(apply.id).await?;
    assert_eq!(apply.agent_id, Some(agent.id));
    harness.agents.start_job(agent.id, apply.id).await?;
    let completion = harness
        .agents
        .finish_job(agent.id, apply.id, JobStatus::Finished)
        .await?;
    assert_eq!(completion.run.status, RunStatus::Applied);
    assert!(completion.next_job.is_none());

    harness.settle().await?;
    assert_eq!(
        harness.runs.progress(run.id).await?,
        RunProgress::Finished {
            status: RunStatus::Applied
        }
    );
    assert_eq!(harness.store.get_agent(agent.id).await?.load, 0);
    assert_eq!(
        harness.store.get_workspace(workspace.id).await?.current_run_id,
        None
    );
    Ok(())
}

#[tokio::test]
async fn manual_apply_waits_for_confirmation() -> Result<()> {
    let harness = Harness::new();
    let workspace = harness.workspace("compute").await?;
    let agent = harness.agent("runner-1", 1).await?;
    let run = harness.runs.create_run(workspace.id, false).await?;
    harness.settle().await?;

    let plan = harness.job(run.id, Phase::Plan).await?;
    harness.agents.start_job(agent.id, plan.id).await?;
    harness
        .agents
        .finish_job(agent.id, plan.id, JobStatus::Finished)
        .await?;
    assert_eq!(harness.runs.progress(run.id).await?, RunProgress::AwaitingApply);

    let apply = harness.runs.apply(run.id).await?;
    assert_eq!(apply.phase, Phase::Apply);
    assert_eq!(harness.store.get_run(run.id).await?.status, RunStatus::Applying);

    // Applying twice is a state error, not a second job.
    assert!(harness.runs.apply(run.id).await.is_err());
    assert_eq!(harness.store.jobs_for_run(run.id).await?.len(), 2);
    Ok(())
}

#[tokio::test]
async fn progress_explains_a_run_stuck_without_capacity() -> Result<()> {
    let harness = Harness::new();
    let workspace = harness.workspace("edge").await?;
    let run = harness.runs.create_run(workspace.id, false).await?;
    assert_eq!(
        harness.runs.progress(run.id).await?,
        RunProgress::Waiting {
            status: RunStatus::Pending
        }
    );

    harness.settle().await?;
    let progress = harness.runs.progress(run.id).await?;
    assert!(matches!(progress, RunProgress::NoCapacity { .. }));
    assert_eq!(progress.to_string(), "queued, no capacity");

    let agent = harness.agent("runner-1", 1).await?;
    assert!(matches!(
        harness.runs.progress(run.id).await?,
        RunProgress::Scheduling { .. }
    ));

    harness.settle().await?;
    match harness.runs.progress(run.id).await? {
        RunProgress::Executing {
            agent: assigned,
            status,
            ..
        } => {
            assert_eq!(assigned, agent.id);
            assert_eq!(status, JobStatus::Allocated);
        }
        other => panic!("unexpected progress {other:?}"),
    }
    Ok(())
}
