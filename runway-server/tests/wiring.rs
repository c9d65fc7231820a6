use std::{sync::Arc, time::Duration};

use tokio_util::sync::CancellationToken;

use runway_core::{
    events::{EventStream, InProcEventBus},
    lock::InMemoryLockProvider,
    persistence::{InMemoryStore, JobRepository, RunRepository},
    supervisor::Supervisor,
};
use runway_model::{
    AgentRegistration, AgentStatus, DaemonConfig, JobStatus, LockConfig, RunStatus,
    SupervisorConfig,
};
use runway_server::infra::{
    daemon::{assemble, start_subsystems},
    shutdown,
};

fn fast_config() -> DaemonConfig {
    let mut config = DaemonConfig::default();
    config.supervisor = SupervisorConfig {
        backoff_base_ms: 1,
        backoff_max_ms: 20,
        jitter_ratio: 0.0,
        lock_probe_interval_ms: 10,
    };
    config.scheduler.resync_interval_ms = 20;
    config.allocator.resync_interval_ms = 20;
    config
}

async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..400 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn subsystems_carry_a_run_from_creation_to_an_agent() {
    let config = fast_config();
    let bus = InProcEventBus::new(1024);
    let store = Arc::new(InMemoryStore::new(bus.clone()));
    let events: Arc<dyn EventStream> = Arc::new(bus.clone());
    let assembly = assemble(Arc::clone(&store), events, &config, None);
    assert_eq!(assembly.subsystems.len(), 4);

    let supervisor = Supervisor::new(
        Arc::new(InMemoryLockProvider::new()),
        LockConfig::default(),
        config.supervisor.clone(),
    );
    let cancel = CancellationToken::new();
    let handles = start_subsystems(&supervisor, &assembly.subsystems, &cancel).unwrap();

    let plane = &assembly.control_plane;
    let agent = plane
        .agents
        .register(AgentRegistration {
            name: "runner-1".into(),
            pool_id: None,
            capacity: 1,
            version: None,
        })
        .await
        .unwrap();
    plane
        .agents
        .heartbeat(agent.id, AgentStatus::Idle, 0)
        .await
        .unwrap();

    let workspace = plane.runs.create_workspace("network", None).await.unwrap();
    let run = plane.runs.create_run(workspace.id, false).await.unwrap();

    // The agent's long-poll sees the plan job once scheduler and allocator
    // have both reacted.
    let offered = plane
        .agents
        .await_jobs(agent.id, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(offered.len(), 1);
    let job = offered[0].clone();
    assert_eq!(job.run_id, run.id);

    plane.agents.start_job(agent.id, job.id).await.unwrap();
    plane.logs.append(job.id, b"plan output\n").await.unwrap();
    plane.logs.close(job.id).await.unwrap();
    plane
        .agents
        .finish_job(agent.id, job.id, JobStatus::Finished)
        .await
        .unwrap();
    assert_eq!(
        store.get_run(run.id).await.unwrap().status,
        RunStatus::Planned
    );

    let apply = plane.runs.apply(run.id).await.unwrap().id;
    eventually(|| {
        let store = Arc::clone(&store);
        async move {
            matches!(
                store.get_job(apply).await,
                Ok(job) if job.status == JobStatus::Allocated
            )
        }
    })
    .await;

    cancel.cancel();
    assert_eq!(shutdown::drain(handles, Duration::from_secs(5)).await, 0);
}

#[tokio::test]
async fn missing_lock_ids_stop_startup() {
    let config = fast_config();
    let bus = InProcEventBus::new(16);
    let store = Arc::new(InMemoryStore::new(bus.clone()));
    let assembly = assemble(store, Arc::new(bus), &config, None);

    let mut locks = LockConfig::default();
    locks.ids.remove("notifier");
    let supervisor = Supervisor::new(
        Arc::new(InMemoryLockProvider::new()),
        locks,
        config.supervisor.clone(),
    );
    let err = start_subsystems(&supervisor, &assembly.subsystems, &CancellationToken::new())
        .unwrap_err();
    assert!(format!("{err:#}").contains("notifier"));
}
