//! Postgres implementation of the persistence ports.
//!
//! Composite operations run in one transaction and announce their events
//! through `pg_notify` inside it, so listeners only hear about committed
//! state. Row locks are taken agent → job → run → workspace.

use std::{collections::HashSet, fmt};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgConnection, PgPool};
use tracing::{debug, info};
use uuid::Uuid;

use runway_model::{
    Agent, AgentId, AgentPool, AgentPoolId, AgentStatus, END_OF_STREAM, Event,
    Job, JobId, JobStatus, LogSlice, Phase, Run, RunId, RunStatus, Workspace,
    WorkspaceId,
};

use super::{
    AgentRepository, JobCompletion, JobRepository, LogRepository, NewAgent,
    NewRun, NewWorkspace, Promotion, Retirement, RunRepository, WorkspaceQueue,
    WorkspaceRepository, check_job_transition, check_run_transition,
    read_window, run_steps_after, stitch,
};
use crate::error::{Result, RunwayError};

const TERMINATE_ATTEMPTS: u32 = 3;

// Decrements one agent's load; the CASE sees the pre-update row.
const RELEASE_SLOT: &str = r#"
    UPDATE agents
    SET load = GREATEST(load - 1, 0),
        status = CASE
            WHEN load - 1 > 0 THEN 'busy'
            WHEN status = 'pending' THEN 'pending'
            ELSE 'idle'
        END
    WHERE id = $1 AND status IN ('pending', 'idle', 'busy')
"#;

#[derive(sqlx::FromRow)]
struct PoolRow {
    id: Uuid,
    name: String,
    created_at: DateTime<Utc>,
}

impl From<PoolRow> for AgentPool {
    fn from(row: PoolRow) -> Self {
        AgentPool {
            id: row.id.into(),
            name: row.name,
            created_at: row.created_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct WorkspaceRow {
    id: Uuid,
    name: String,
    pool_id: Uuid,
    current_run_id: Option<Uuid>,
    created_at: DateTime<Utc>,
}

impl From<WorkspaceRow> for Workspace {
    fn from(row: WorkspaceRow) -> Self {
        Workspace {
            id: row.id.into(),
            name: row.name,
            pool_id: row.pool_id.into(),
            current_run_id: row.current_run_id.map(RunId::from),
            created_at: row.created_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct RunRow {
    id: Uuid,
    workspace_id: Uuid,
    status: String,
    auto_apply: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<RunRow> for Run {
    type Error = RunwayError;

    fn try_from(row: RunRow) -> Result<Self> {
        Ok(Run {
            id: row.id.into(),
            workspace_id: row.workspace_id.into(),
            status: row.status.parse()?,
            auto_apply: row.auto_apply,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct JobRow {
    id: Uuid,
    run_id: Uuid,
    phase: String,
    pool_id: Uuid,
    status: String,
    agent_id: Option<Uuid>,
    version: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<JobRow> for Job {
    type Error = RunwayError;

    fn try_from(row: JobRow) -> Result<Self> {
        Ok(Job {
            id: row.id.into(),
            run_id: row.run_id.into(),
            phase: row.phase.parse()?,
            pool_id: row.pool_id.into(),
            status: row.status.parse()?,
            agent_id: row.agent_id.map(AgentId::from),
            version: row.version,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct AgentRow {
    id: Uuid,
    pool_id: Uuid,
    name: String,
    version: Option<String>,
    status: String,
    capacity: i32,
    load: i32,
    reported_load: i32,
    registered_at: DateTime<Utc>,
    last_seen_at: DateTime<Utc>,
}

impl TryFrom<AgentRow> for Agent {
    type Error = RunwayError;

    fn try_from(row: AgentRow) -> Result<Self> {
        Ok(Agent {
            id: row.id.into(),
            pool_id: row.pool_id.into(),
            name: row.name,
            version: row.version,
            status: row.status.parse()?,
            capacity: to_count("capacity", row.capacity)?,
            load: to_count("load", row.load)?,
            reported_load: to_count("reported_load", row.reported_load)?,
            registered_at: row.registered_at,
            last_seen_at: row.last_seen_at,
        })
    }
}

fn to_count(column: &str, value: i32) -> Result<u32> {
    u32::try_from(value).map_err(|_| {
        RunwayError::InvariantViolation(format!("agents.{column} is negative: {value}"))
    })
}

fn to_i32(value: u32) -> Result<i32> {
    i32::try_from(value)
        .map_err(|_| RunwayError::InvariantViolation(format!("{value} does not fit a counter")))
}

fn to_i64(value: u64) -> Result<i64> {
    i64::try_from(value)
        .map_err(|_| RunwayError::InvariantViolation(format!("{value} does not fit an offset")))
}

fn collect<R, T>(rows: Vec<R>) -> Result<Vec<T>>
where
    T: TryFrom<R, Error = RunwayError>,
{
    rows.into_iter().map(T::try_from).collect()
}

/// Postgres-backed store shared by every daemon replica.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
    channel: String,
}

impl fmt::Debug for PostgresStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostgresStore")
            .field("pool_size", &self.pool.size())
            .field("idle_connections", &self.pool.num_idle())
            .field("channel", &self.channel)
            .finish()
    }
}

impl PostgresStore {
    pub fn new(pool: PgPool, channel: impl Into<String>) -> Self {
        Self {
            pool,
            channel: channel.into(),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Fails unless every bundled migration has been applied successfully.
    pub async fn verify_schema(&self) -> Result<()> {
        sqlx::query_scalar::<_, i32>("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .map_err(|err| RunwayError::store("health check", err))?;

        let applied: HashSet<i64> = sqlx::query_scalar::<_, i64>(
            "SELECT version FROM _sqlx_migrations WHERE success",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|err| RunwayError::store("read applied migrations", err))?
        .into_iter()
        .collect();

        let missing: Vec<String> = crate::MIGRATOR
            .iter()
            .filter(|migration| !applied.contains(&migration.version))
            .map(|migration| format!("{} {}", migration.version, migration.description))
            .collect();
        if !missing.is_empty() {
            return Err(RunwayError::InvariantViolation(format!(
                "database is missing migrations: {}; run `runwayd db migrate`",
                missing.join(", ")
            )));
        }
        info!(target: "runway::store", "schema verified");
        Ok(())
    }

    async fn notify(&self, conn: &mut PgConnection, events: &[Event]) -> Result<()> {
        for event in events {
            let payload = serde_json::to_string(event)?;
            sqlx::query("SELECT pg_notify($1, $2)")
                .bind(&self.channel)
                .bind(payload)
                .execute(&mut *conn)
                .await
                .map_err(|err| RunwayError::store("pg_notify", err))?;
        }
        debug!(target: "runway::store", count = events.len(), "events queued for commit");
        Ok(())
    }

    async fn begin(&self, op: &str) -> Result<sqlx::Transaction<'static, sqlx::Postgres>> {
        self.pool
            .begin()
            .await
            .map_err(|err| RunwayError::store(op, err))
    }

    async fn lock_run(conn: &mut PgConnection, id: RunId) -> Result<Run> {
        sqlx::query_as::<_, RunRow>(
            "SELECT id, workspace_id, status, auto_apply, created_at, updated_at \
             FROM runs WHERE id = $1 FOR UPDATE",
        )
        .bind(id.to_uuid())
        .fetch_optional(&mut *conn)
        .await
        .map_err(|err| RunwayError::store("lock run", err))?
        .ok_or_else(|| RunwayError::NotFound(format!("run {id}")))?
        .try_into()
    }

    async fn lock_agent(conn: &mut PgConnection, id: AgentId) -> Result<Option<Agent>> {
        sqlx::query_as::<_, AgentRow>(
            "SELECT id, pool_id, name, version, status, capacity, load, reported_load, \
                    registered_at, last_seen_at \
             FROM agents WHERE id = $1 FOR UPDATE",
        )
        .bind(id.to_uuid())
        .fetch_optional(&mut *conn)
        .await
        .map_err(|err| RunwayError::store("lock agent", err))?
        .map(Agent::try_from)
        .transpose()
    }

    async fn lock_job(conn: &mut PgConnection, id: JobId) -> Result<Job> {
        sqlx::query_as::<_, JobRow>(
            "SELECT id, run_id, phase, pool_id, status, agent_id, version, created_at, updated_at \
             FROM jobs WHERE id = $1 FOR UPDATE",
        )
        .bind(id.to_uuid())
        .fetch_optional(&mut *conn)
        .await
        .map_err(|err| RunwayError::store("lock job", err))?
        .ok_or_else(|| RunwayError::NotFound(format!("job {id}")))?
        .try_into()
    }

    async fn insert_job(
        conn: &mut PgConnection,
        run: RunId,
        phase: Phase,
        pool: AgentPoolId,
    ) -> Result<Job> {
        sqlx::query_as::<_, JobRow>(
            "INSERT INTO jobs (id, run_id, phase, pool_id, status, agent_id, version, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, 'unscheduled', NULL, 0, NOW(), NOW()) \
             RETURNING id, run_id, phase, pool_id, status, agent_id, version, created_at, updated_at",
        )
        .bind(JobId::new().to_uuid())
        .bind(run.to_uuid())
        .bind(phase.as_str())
        .bind(pool.to_uuid())
        .fetch_one(&mut *conn)
        .await
        .map_err(|err| RunwayError::store("insert job", err))?
        .try_into()
    }

    async fn set_run_status(
        conn: &mut PgConnection,
        run: &Run,
        status: RunStatus,
    ) -> Result<Run> {
        let updated: Run = sqlx::query_as::<_, RunRow>(
            "UPDATE runs SET status = $2, updated_at = NOW() WHERE id = $1 \
             RETURNING id, workspace_id, status, auto_apply, created_at, updated_at",
        )
        .bind(run.id.to_uuid())
        .bind(status.as_str())
        .fetch_one(&mut *conn)
        .await
        .map_err(|err| RunwayError::store("update run status", err))?
        .try_into()?;

        if status.is_terminal() {
            sqlx::query(
                "UPDATE workspaces SET current_run_id = NULL \
                 WHERE id = $1 AND current_run_id = $2",
            )
            .bind(run.workspace_id.to_uuid())
            .bind(run.id.to_uuid())
            .execute(&mut *conn)
            .await
            .map_err(|err| RunwayError::store("release workspace", err))?;
        }
        Ok(updated)
    }

    async fn release_slot(conn: &mut PgConnection, agent: AgentId) -> Result<()> {
        sqlx::query(RELEASE_SLOT)
            .bind(agent.to_uuid())
            .execute(&mut *conn)
            .await
            .map_err(|err| RunwayError::store("release agent slot", err))?;
        Ok(())
    }

    /// Retires an agent whose row the caller has locked and hands its jobs
    /// back as `unscheduled`.
    async fn retire_locked(
        conn: &mut PgConnection,
        id: AgentId,
        status: AgentStatus,
    ) -> Result<Retirement> {
        let agent: Agent = sqlx::query_as::<_, AgentRow>(
            "UPDATE agents SET status = $2, load = 0 WHERE id = $1 \
             RETURNING id, pool_id, name, version, status, capacity, load, reported_load, \
                       registered_at, last_seen_at",
        )
        .bind(id.to_uuid())
        .bind(status.as_str())
        .fetch_one(&mut *conn)
        .await
        .map_err(|err| RunwayError::store("retire agent", err))?
        .try_into()?;

        let released = sqlx::query_as::<_, JobRow>(
            "UPDATE jobs \
             SET status = 'unscheduled', agent_id = NULL, version = version + 1, updated_at = NOW() \
             WHERE agent_id = $1 AND status IN ('allocated', 'running') \
             RETURNING id, run_id, phase, pool_id, status, agent_id, version, created_at, updated_at",
        )
        .bind(id.to_uuid())
        .fetch_all(&mut *conn)
        .await
        .map_err(|err| RunwayError::store("release agent jobs", err))?;
        let mut released_jobs: Vec<Job> = collect(released)?;
        released_jobs.sort_by_key(Job::queue_key);
        Ok(Retirement {
            agent,
            released_jobs,
        })
    }

    /// One attempt at terminating a run. `None` when a live job moved to an
    /// agent that was not locked up front; the transaction is rolled back.
    async fn try_terminate_run(&self, run: RunId, status: RunStatus) -> Result<Option<Run>> {
        let mut tx = self.begin("terminate run").await?;
        let agents: HashSet<Uuid> = sqlx::query_scalar::<_, Uuid>(
            "SELECT id FROM agents \
             WHERE id IN (SELECT agent_id FROM jobs \
                          WHERE run_id = $1 AND status IN ('allocated', 'running')) \
             ORDER BY id FOR UPDATE",
        )
        .bind(run.to_uuid())
        .fetch_all(&mut *tx)
        .await
        .map_err(|err| RunwayError::store("lock run agents", err))?
        .into_iter()
        .collect();

        let live = sqlx::query_as::<_, (Uuid, Uuid, Option<Uuid>, String)>(
            "SELECT id, pool_id, agent_id, status FROM jobs \
             WHERE run_id = $1 AND status IN ('unscheduled', 'allocated', 'running') \
             ORDER BY id FOR UPDATE",
        )
        .bind(run.to_uuid())
        .fetch_all(&mut *tx)
        .await
        .map_err(|err| RunwayError::store("lock run jobs", err))?;
        let mut jobs = Vec::with_capacity(live.len());
        for (job, pool, agent, prior) in live {
            let prior: JobStatus = prior.parse()?;
            let held = agent.filter(|_| prior.holds_agent());
            if held.is_some_and(|agent| !agents.contains(&agent)) {
                return Ok(None);
            }
            jobs.push((job, pool, agent, held));
        }

        let record = Self::lock_run(&mut tx, run).await?;
        check_run_transition(&record, status)?;

        let ids: Vec<Uuid> = jobs.iter().map(|(job, ..)| *job).collect();
        sqlx::query(
            "UPDATE jobs SET status = 'canceled', version = version + 1, updated_at = NOW() \
             WHERE id = ANY($1)",
        )
        .bind(&ids)
        .execute(&mut *tx)
        .await
        .map_err(|err| RunwayError::store("cancel run jobs", err))?;

        let mut events = vec![Event::RunStatusChanged {
            run_id: run,
            workspace_id: record.workspace_id,
            status,
        }];
        for (job, pool, agent, held) in jobs {
            if let Some(held) = held {
                Self::release_slot(&mut tx, held.into()).await?;
            }
            events.push(Event::JobFinished {
                job_id: job.into(),
                run_id: run,
                pool_id: pool.into(),
                agent_id: agent.map(AgentId::from),
                status: JobStatus::Canceled,
            });
        }
        let updated = Self::set_run_status(&mut tx, &record, status).await?;
        self.notify(&mut tx, &events).await?;
        tx.commit()
            .await
            .map_err(|err| RunwayError::store("terminate run commit", err))?;
        Ok(Some(updated))
    }

    async fn job_exists(&self, id: JobId) -> Result<bool> {
        let found = sqlx::query_scalar::<_, i32>("SELECT 1 FROM jobs WHERE id = $1")
            .bind(id.to_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(|err| RunwayError::store("job lookup", err))?;
        Ok(found.is_some())
    }
}

#[async_trait]
impl WorkspaceRepository for PostgresStore {
    async fn create_workspace(&self, workspace: NewWorkspace) -> Result<Workspace> {
        self.get_pool(workspace.pool_id).await?;
        let row = sqlx::query_as::<_, WorkspaceRow>(
            "INSERT INTO workspaces (id, name, pool_id, current_run_id, created_at) \
             VALUES ($1, $2, $3, NULL, NOW()) \
             RETURNING id, name, pool_id, current_run_id, created_at",
        )
        .bind(WorkspaceId::new().to_uuid())
        .bind(&workspace.name)
        .bind(workspace.pool_id.to_uuid())
        .fetch_one(&self.pool)
        .await
        .map_err(|err| RunwayError::store("create workspace", err))?;
        Ok(row.into())
    }

    async fn get_workspace(&self, id: WorkspaceId) -> Result<Workspace> {
        sqlx::query_as::<_, WorkspaceRow>(
            "SELECT id, name, pool_id, current_run_id, created_at FROM workspaces WHERE id = $1",
        )
        .bind(id.to_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(|err| RunwayError::store("get workspace", err))?
        .map(Workspace::from)
        .ok_or_else(|| RunwayError::NotFound(format!("workspace {id}")))
    }

    async fn list_workspace_ids(&self) -> Result<Vec<WorkspaceId>> {
        let ids = sqlx::query_scalar::<_, Uuid>("SELECT id FROM workspaces ORDER BY id")
            .fetch_all(&self.pool)
            .await
            .map_err(|err| RunwayError::store("list workspaces", err))?;
        Ok(ids.into_iter().map(WorkspaceId::from).collect())
    }
}

#[async_trait]
impl RunRepository for PostgresStore {
    async fn create_run(&self, run: NewRun) -> Result<Run> {
        let mut tx = self.begin("create run").await?;
        let exists = sqlx::query_scalar::<_, i32>("SELECT 1 FROM workspaces WHERE id = $1")
            .bind(run.workspace_id.to_uuid())
            .fetch_optional(&mut *tx)
            .await
            .map_err(|err| RunwayError::store("create run", err))?;
        if exists.is_none() {
            return Err(RunwayError::NotFound(format!("workspace {}", run.workspace_id)));
        }
        let record: Run = sqlx::query_as::<_, RunRow>(
            "INSERT INTO runs (id, workspace_id, status, auto_apply, created_at, updated_at) \
             VALUES ($1, $2, 'pending', $3, $4, NOW()) \
             RETURNING id, workspace_id, status, auto_apply, created_at, updated_at",
        )
        .bind(RunId::new().to_uuid())
        .bind(run.workspace_id.to_uuid())
        .bind(run.auto_apply)
        .bind(run.created_at)
        .fetch_one(&mut *tx)
        .await
        .map_err(|err| RunwayError::store("create run", err))?
        .try_into()?;

        self.notify(
            &mut tx,
            &[Event::RunCreated {
                run_id: record.id,
                workspace_id: record.workspace_id,
            }],
        )
        .await?;
        tx.commit()
            .await
            .map_err(|err| RunwayError::store("create run commit", err))?;
        Ok(record)
    }

    async fn get_run(&self, id: RunId) -> Result<Run> {
        sqlx::query_as::<_, RunRow>(
            "SELECT id, workspace_id, status, auto_apply, created_at, updated_at \
             FROM runs WHERE id = $1",
        )
        .bind(id.to_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(|err| RunwayError::store("get run", err))?
        .ok_or_else(|| RunwayError::NotFound(format!("run {id}")))?
        .try_into()
    }

    async fn workspace_queue(&self, id: WorkspaceId) -> Result<WorkspaceQueue> {
        let mut tx = self.begin("workspace queue").await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ READ ONLY")
            .execute(&mut *tx)
            .await
            .map_err(|err| RunwayError::store("workspace queue", err))?;

        let workspace: Workspace = sqlx::query_as::<_, WorkspaceRow>(
            "SELECT id, name, pool_id, current_run_id, created_at FROM workspaces WHERE id = $1",
        )
        .bind(id.to_uuid())
        .fetch_optional(&mut *tx)
        .await
        .map_err(|err| RunwayError::store("workspace queue", err))?
        .map(Workspace::from)
        .ok_or_else(|| RunwayError::NotFound(format!("workspace {id}")))?;

        let current = match workspace.current_run_id {
            Some(run) => sqlx::query_as::<_, RunRow>(
                "SELECT id, workspace_id, status, auto_apply, created_at, updated_at \
                 FROM runs WHERE id = $1",
            )
            .bind(run.to_uuid())
            .fetch_optional(&mut *tx)
            .await
            .map_err(|err| RunwayError::store("workspace queue", err))?
            .map(Run::try_from)
            .transpose()?,
            None => None,
        };

        let waiting = sqlx::query_as::<_, RunRow>(
            "SELECT id, workspace_id, status, auto_apply, created_at, updated_at \
             FROM runs WHERE workspace_id = $1 AND status IN ('pending', 'queued') \
             ORDER BY created_at, id",
        )
        .bind(id.to_uuid())
        .fetch_all(&mut *tx)
        .await
        .map_err(|err| RunwayError::store("workspace queue", err))?;
        tx.commit()
            .await
            .map_err(|err| RunwayError::store("workspace queue", err))?;

        Ok(WorkspaceQueue {
            workspace,
            current,
            waiting: collect(waiting)?,
        })
    }

    async fn mark_queued(&self, workspace: WorkspaceId, runs: &[RunId]) -> Result<u64> {
        if runs.is_empty() {
            return Ok(0);
        }
        let ids: Vec<Uuid> = runs.iter().map(RunId::to_uuid).collect();
        let mut tx = self.begin("mark queued").await?;
        let moved = sqlx::query_scalar::<_, Uuid>(
            "UPDATE runs SET status = 'queued', updated_at = NOW() \
             WHERE workspace_id = $1 AND id = ANY($2) AND status = 'pending' \
             RETURNING id",
        )
        .bind(workspace.to_uuid())
        .bind(&ids)
        .fetch_all(&mut *tx)
        .await
        .map_err(|err| RunwayError::store("mark queued", err))?;

        let events: Vec<Event> = moved
            .iter()
            .map(|id| Event::RunStatusChanged {
                run_id: (*id).into(),
                workspace_id: workspace,
                status: RunStatus::Queued,
            })
            .collect();
        self.notify(&mut tx, &events).await?;
        tx.commit()
            .await
            .map_err(|err| RunwayError::store("mark queued commit", err))?;
        Ok(moved.len() as u64)
    }

    async fn release_current(&self, workspace: WorkspaceId, expected: RunId) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE workspaces SET current_run_id = NULL WHERE id = $1 AND current_run_id = $2",
        )
        .bind(workspace.to_uuid())
        .bind(expected.to_uuid())
        .execute(&self.pool)
        .await
        .map_err(|err| RunwayError::store("release workspace", err))?;
        if result.rows_affected() == 0 {
            self.get_workspace(workspace).await?;
            return Ok(false);
        }
        Ok(true)
    }

    async fn promote_run(&self, workspace: WorkspaceId, run: RunId) -> Result<Promotion> {
        let mut tx = self.begin("promote run").await?;
        let record = Self::lock_run(&mut tx, run).await?;
        if record.workspace_id != workspace {
            return Err(RunwayError::InvariantViolation(format!(
                "run {run} does not belong to workspace {workspace}"
            )));
        }
        let (pool, current) = sqlx::query_as::<_, (Uuid, Option<Uuid>)>(
            "SELECT pool_id, current_run_id FROM workspaces WHERE id = $1 FOR UPDATE",
        )
        .bind(workspace.to_uuid())
        .fetch_optional(&mut *tx)
        .await
        .map_err(|err| RunwayError::store("promote run", err))?
        .ok_or_else(|| RunwayError::NotFound(format!("workspace {workspace}")))?;

        match current.map(RunId::from) {
            Some(current) if current == run => return Ok(Promotion::AlreadyCurrent),
            Some(current) => {
                return Err(RunwayError::Conflict(format!(
                    "workspace {workspace} is held by run {current}"
                )));
            }
            None => {}
        }

        if record.status != RunStatus::Queued {
            return Err(RunwayError::Conflict(format!(
                "run {run} is {}, not queued",
                record.status
            )));
        }
        check_run_transition(&record, RunStatus::Planning)?;

        let pool = AgentPoolId::from(pool);
        let job = Self::insert_job(&mut tx, run, Phase::Plan, pool).await?;
        Self::set_run_status(&mut tx, &record, RunStatus::Planning).await?;
        sqlx::query("UPDATE workspaces SET current_run_id = $2 WHERE id = $1")
            .bind(workspace.to_uuid())
            .bind(run.to_uuid())
            .execute(&mut *tx)
            .await
            .map_err(|err| RunwayError::store("promote run", err))?;

        self.notify(
            &mut tx,
            &[
                Event::RunStatusChanged {
                    run_id: run,
                    workspace_id: workspace,
                    status: RunStatus::Planning,
                },
                Event::JobRunnable {
                    job_id: job.id,
                    pool_id: pool,
                },
            ],
        )
        .await?;
        tx.commit()
            .await
            .map_err(|err| RunwayError::store("promote run commit", err))?;
        Ok(Promotion::Promoted(job))
    }

    async fn start_apply(&self, run: RunId) -> Result<Job> {
        let mut tx = self.begin("start apply").await?;
        let record = Self::lock_run(&mut tx, run).await?;
        check_run_transition(&record, RunStatus::Applying)?;
        let pool: Uuid = sqlx::query_scalar("SELECT pool_id FROM workspaces WHERE id = $1")
            .bind(record.workspace_id.to_uuid())
            .fetch_one(&mut *tx)
            .await
            .map_err(|err| RunwayError::store("start apply", err))?;
        let pool = AgentPoolId::from(pool);

        let job = Self::insert_job(&mut tx, run, Phase::Apply, pool).await?;
        Self::set_run_status(&mut tx, &record, RunStatus::Applying).await?;
        self.notify(
            &mut tx,
            &[
                Event::RunStatusChanged {
                    run_id: run,
                    workspace_id: record.workspace_id,
                    status: RunStatus::Applying,
                },
                Event::JobRunnable {
                    job_id: job.id,
                    pool_id: pool,
                },
            ],
        )
        .await?;
        tx.commit()
            .await
            .map_err(|err| RunwayError::store("start apply commit", err))?;
        Ok(job)
    }

    async fn terminate_run(&self, run: RunId, status: RunStatus) -> Result<Run> {
        if !status.is_terminal() {
            return Err(RunwayError::InvariantViolation(format!(
                "{status} is not a terminal run status"
            )));
        }
        for attempt in 1..=TERMINATE_ATTEMPTS {
            if let Some(updated) = self.try_terminate_run(run, status).await? {
                return Ok(updated);
            }
            debug!(target: "runway::store", %run, attempt, "run jobs changed agents; retrying");
        }
        Err(RunwayError::Conflict(format!(
            "jobs of run {run} kept moving between agents"
        )))
    }

    async fn jobs_for_run(&self, run: RunId) -> Result<Vec<Job>> {
        let rows = sqlx::query_as::<_, JobRow>(
            "SELECT id, run_id, phase, pool_id, status, agent_id, version, created_at, updated_at \
             FROM jobs WHERE run_id = $1 ORDER BY created_at, id",
        )
        .bind(run.to_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(|err| RunwayError::store("jobs for run", err))?;
        collect(rows)
    }
}

#[async_trait]
impl AgentRepository for PostgresStore {
    async fn ensure_pool(&self, name: &str) -> Result<AgentPool> {
        sqlx::query(
            "INSERT INTO agent_pools (id, name, created_at) VALUES ($1, $2, NOW()) \
             ON CONFLICT (name) DO NOTHING",
        )
        .bind(AgentPoolId::new().to_uuid())
        .bind(name)
        .execute(&self.pool)
        .await
        .map_err(|err| RunwayError::store("ensure pool", err))?;
        let row = sqlx::query_as::<_, PoolRow>(
            "SELECT id, name, created_at FROM agent_pools WHERE name = $1",
        )
        .bind(name)
        .fetch_one(&self.pool)
        .await
        .map_err(|err| RunwayError::store("ensure pool", err))?;
        Ok(row.into())
    }

    async fn get_pool(&self, id: AgentPoolId) -> Result<AgentPool> {
        sqlx::query_as::<_, PoolRow>("SELECT id, name, created_at FROM agent_pools WHERE id = $1")
            .bind(id.to_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(|err| RunwayError::store("get pool", err))?
            .map(AgentPool::from)
            .ok_or_else(|| RunwayError::NotFound(format!("agent pool {id}")))
    }

    async fn insert_agent(&self, agent: NewAgent) -> Result<Agent> {
        self.get_pool(agent.pool_id).await?;
        let mut tx = self.begin("register agent").await?;
        let record: Agent = sqlx::query_as::<_, AgentRow>(
            "INSERT INTO agents (id, pool_id, name, version, status, capacity, load, \
                                 reported_load, registered_at, last_seen_at) \
             VALUES ($1, $2, $3, $4, 'pending', $5, 0, 0, $6, $6) \
             RETURNING id, pool_id, name, version, status, capacity, load, reported_load, \
                       registered_at, last_seen_at",
        )
        .bind(AgentId::new().to_uuid())
        .bind(agent.pool_id.to_uuid())
        .bind(&agent.name)
        .bind(agent.version.as_deref())
        .bind(to_i32(agent.capacity)?)
        .bind(agent.registered_at)
        .fetch_one(&mut *tx)
        .await
        .map_err(|err| RunwayError::store("register agent", err))?
        .try_into()?;

        self.notify(
            &mut tx,
            &[Event::AgentRegistered {
                agent_id: record.id,
                pool_id: record.pool_id,
            }],
        )
        .await?;
        tx.commit()
            .await
            .map_err(|err| RunwayError::store("register agent commit", err))?;
        Ok(record)
    }

    async fn get_agent(&self, id: AgentId) -> Result<Agent> {
        sqlx::query_as::<_, AgentRow>(
            "SELECT id, pool_id, name, version, status, capacity, load, reported_load, \
                    registered_at, last_seen_at \
             FROM agents WHERE id = $1",
        )
        .bind(id.to_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(|err| RunwayError::store("get agent", err))?
        .ok_or_else(|| RunwayError::NotFound(format!("agent {id}")))?
        .try_into()
    }

    async fn list_agents(&self, pool: Option<AgentPoolId>) -> Result<Vec<Agent>> {
        let rows = sqlx::query_as::<_, AgentRow>(
            "SELECT id, pool_id, name, version, status, capacity, load, reported_load, \
                    registered_at, last_seen_at \
             FROM agents \
             WHERE status IN ('pending', 'idle', 'busy') \
               AND ($1::uuid IS NULL OR pool_id = $1) \
             ORDER BY registered_at, id",
        )
        .bind(pool.map(|pool| pool.to_uuid()))
        .fetch_all(&self.pool)
        .await
        .map_err(|err| RunwayError::store("list agents", err))?;
        collect(rows)
    }

    async fn record_heartbeat(
        &self,
        id: AgentId,
        reported_load: u32,
        seen_at: DateTime<Utc>,
    ) -> Result<Agent> {
        let mut tx = self.begin("heartbeat").await?;
        let agent: Agent = sqlx::query_as::<_, AgentRow>(
            "UPDATE agents \
             SET reported_load = $2, last_seen_at = $3, \
                 status = CASE WHEN load > 0 THEN 'busy' ELSE 'idle' END \
             WHERE id = $1 AND status IN ('pending', 'idle', 'busy') \
             RETURNING id, pool_id, name, version, status, capacity, load, reported_load, \
                       registered_at, last_seen_at",
        )
        .bind(id.to_uuid())
        .bind(to_i32(reported_load)?)
        .bind(seen_at)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|err| RunwayError::store("heartbeat", err))?
        .ok_or_else(|| RunwayError::NotFound(format!("agent {id}")))?
        .try_into()?;

        self.notify(
            &mut tx,
            &[Event::AgentHeartbeat {
                agent_id: agent.id,
                pool_id: agent.pool_id,
                status: agent.status,
                load: agent.load,
            }],
        )
        .await?;
        tx.commit()
            .await
            .map_err(|err| RunwayError::store("heartbeat commit", err))?;
        Ok(agent)
    }

    async fn retire_agent(
        &self,
        id: AgentId,
        status: AgentStatus,
        evicted: bool,
    ) -> Result<Retirement> {
        if !status.is_retired() {
            return Err(RunwayError::InvariantViolation(format!(
                "{status} does not retire an agent"
            )));
        }
        let mut tx = self.begin("retire agent").await?;
        let agent = Self::lock_agent(&mut tx, id)
            .await?
            .ok_or_else(|| RunwayError::NotFound(format!("agent {id}")))?;
        if agent.status.is_retired() {
            return Ok(Retirement {
                agent,
                released_jobs: Vec::new(),
            });
        }
        let retirement = Self::retire_locked(&mut tx, id, status).await?;
        self.notify(&mut tx, &retirement.events(evicted)).await?;
        tx.commit()
            .await
            .map_err(|err| RunwayError::store("retire agent commit", err))?;
        Ok(retirement)
    }

    async fn evict_agent(
        &self,
        id: AgentId,
        seen_before: DateTime<Utc>,
    ) -> Result<Option<Retirement>> {
        let mut tx = self.begin("evict agent").await?;
        let agent = Self::lock_agent(&mut tx, id)
            .await?
            .ok_or_else(|| RunwayError::NotFound(format!("agent {id}")))?;
        if !agent.is_stale(seen_before) {
            return Ok(None);
        }
        let retirement = Self::retire_locked(&mut tx, id, AgentStatus::Exited).await?;
        self.notify(&mut tx, &retirement.events(true)).await?;
        tx.commit()
            .await
            .map_err(|err| RunwayError::store("evict agent commit", err))?;
        Ok(Some(retirement))
    }

    async fn stale_agents(&self, seen_before: DateTime<Utc>) -> Result<Vec<Agent>> {
        let rows = sqlx::query_as::<_, AgentRow>(
            "SELECT id, pool_id, name, version, status, capacity, load, reported_load, \
                    registered_at, last_seen_at \
             FROM agents \
             WHERE status IN ('pending', 'idle', 'busy') AND last_seen_at < $1 \
             ORDER BY last_seen_at, id",
        )
        .bind(seen_before)
        .fetch_all(&self.pool)
        .await
        .map_err(|err| RunwayError::store("stale agents", err))?;
        collect(rows)
    }
}

#[async_trait]
impl JobRepository for PostgresStore {
    async fn get_job(&self, id: JobId) -> Result<Job> {
        sqlx::query_as::<_, JobRow>(
            "SELECT id, run_id, phase, pool_id, status, agent_id, version, created_at, updated_at \
             FROM jobs WHERE id = $1",
        )
        .bind(id.to_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(|err| RunwayError::store("get job", err))?
        .ok_or_else(|| RunwayError::NotFound(format!("job {id}")))?
        .try_into()
    }

    async fn unscheduled_jobs(&self) -> Result<Vec<Job>> {
        let rows = sqlx::query_as::<_, JobRow>(
            "SELECT id, run_id, phase, pool_id, status, agent_id, version, created_at, updated_at \
             FROM jobs WHERE status = 'unscheduled' ORDER BY created_at, id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|err| RunwayError::store("unscheduled jobs", err))?;
        collect(rows)
    }

    async fn allocate_job(
        &self,
        job: JobId,
        expected_version: i64,
        agent: AgentId,
    ) -> Result<Job> {
        let mut tx = self.begin("allocate job").await?;
        let worker = Self::lock_agent(&mut tx, agent)
            .await?
            .ok_or_else(|| RunwayError::NotFound(format!("agent {agent}")))?;
        if worker.status.is_retired() {
            return Err(RunwayError::Conflict(format!("agent {agent} has departed")));
        }
        if worker.load >= worker.capacity {
            return Err(RunwayError::Conflict(format!(
                "agent {agent} is at capacity {}",
                worker.capacity
            )));
        }

        let record = Self::lock_job(&mut tx, job).await?;
        if record.version != expected_version || record.status != JobStatus::Unscheduled {
            return Err(RunwayError::Conflict(format!(
                "job {job} changed since version {expected_version}"
            )));
        }
        if worker.pool_id != record.pool_id {
            return Err(RunwayError::InvariantViolation(format!(
                "agent {agent} is not in pool {}",
                record.pool_id
            )));
        }

        let allocated: Job = sqlx::query_as::<_, JobRow>(
            "UPDATE jobs \
             SET status = 'allocated', agent_id = $2, version = version + 1, updated_at = NOW() \
             WHERE id = $1 \
             RETURNING id, run_id, phase, pool_id, status, agent_id, version, created_at, updated_at",
        )
        .bind(job.to_uuid())
        .bind(agent.to_uuid())
        .fetch_one(&mut *tx)
        .await
        .map_err(|err| RunwayError::store("allocate job", err))?
        .try_into()?;
        sqlx::query("UPDATE agents SET load = load + 1, status = 'busy' WHERE id = $1")
            .bind(agent.to_uuid())
            .execute(&mut *tx)
            .await
            .map_err(|err| RunwayError::store("allocate job", err))?;

        self.notify(
            &mut tx,
            &[Event::JobAllocated {
                job_id: job,
                agent_id: agent,
                pool_id: allocated.pool_id,
            }],
        )
        .await?;
        tx.commit()
            .await
            .map_err(|err| RunwayError::store("allocate job commit", err))?;
        Ok(allocated)
    }

    async fn assigned_jobs(&self, agent: AgentId) -> Result<Vec<Job>> {
        let rows = sqlx::query_as::<_, JobRow>(
            "SELECT id, run_id, phase, pool_id, status, agent_id, version, created_at, updated_at \
             FROM jobs WHERE agent_id = $1 AND status IN ('allocated', 'running') \
             ORDER BY created_at, id",
        )
        .bind(agent.to_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(|err| RunwayError::store("assigned jobs", err))?;
        collect(rows)
    }

    async fn start_job(&self, job: JobId, agent: AgentId) -> Result<Job> {
        let started = sqlx::query_as::<_, JobRow>(
            "UPDATE jobs SET status = 'running', version = version + 1, updated_at = NOW() \
             WHERE id = $1 AND agent_id = $2 AND status = 'allocated' \
             RETURNING id, run_id, phase, pool_id, status, agent_id, version, created_at, updated_at",
        )
        .bind(job.to_uuid())
        .bind(agent.to_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(|err| RunwayError::store("start job", err))?;
        match started {
            Some(row) => row.try_into(),
            None if self.job_exists(job).await? => Err(RunwayError::Conflict(format!(
                "job {job} is not allocated to agent {agent}"
            ))),
            None => Err(RunwayError::NotFound(format!("job {job}"))),
        }
    }

    async fn finish_job(
        &self,
        job: JobId,
        agent: AgentId,
        outcome: JobStatus,
    ) -> Result<JobCompletion> {
        if !outcome.is_terminal() {
            return Err(RunwayError::InvariantViolation(format!(
                "{outcome} is not a terminal job status"
            )));
        }
        let mut tx = self.begin("finish job").await?;
        Self::lock_agent(&mut tx, agent).await?;
        let record = Self::lock_job(&mut tx, job).await?;
        if record.agent_id != Some(agent) || !record.status.holds_agent() {
            return Err(RunwayError::Conflict(format!(
                "job {job} is not assigned to agent {agent}"
            )));
        }
        check_job_transition(&record, outcome)?;
        let run = match Self::lock_run(&mut tx, record.run_id).await {
            Ok(run) => run,
            Err(RunwayError::NotFound(_)) => {
                return Err(RunwayError::InvariantViolation(format!(
                    "job {job} references missing run {}",
                    record.run_id
                )));
            }
            Err(err) => return Err(err),
        };
        let steps = run_steps_after(&run, record.phase, outcome)?;

        let finished: Job = sqlx::query_as::<_, JobRow>(
            "UPDATE jobs SET status = $2, version = version + 1, updated_at = NOW() WHERE id = $1 \
             RETURNING id, run_id, phase, pool_id, status, agent_id, version, created_at, updated_at",
        )
        .bind(job.to_uuid())
        .bind(outcome.as_str())
        .fetch_one(&mut *tx)
        .await
        .map_err(|err| RunwayError::store("finish job", err))?
        .try_into()?;
        Self::release_slot(&mut tx, agent).await?;

        let mut events = vec![Event::JobFinished {
            job_id: job,
            run_id: run.id,
            pool_id: finished.pool_id,
            agent_id: Some(agent),
            status: outcome,
        }];
        let mut next_job = None;
        let mut updated = run.clone();
        for step in steps {
            if step == RunStatus::Applying {
                next_job =
                    Some(Self::insert_job(&mut tx, run.id, Phase::Apply, finished.pool_id).await?);
            }
            updated = Self::set_run_status(&mut tx, &run, step).await?;
            events.push(Event::RunStatusChanged {
                run_id: run.id,
                workspace_id: run.workspace_id,
                status: step,
            });
        }
        if let Some(apply) = &next_job {
            events.push(Event::JobRunnable {
                job_id: apply.id,
                pool_id: apply.pool_id,
            });
        }
        self.notify(&mut tx, &events).await?;
        tx.commit()
            .await
            .map_err(|err| RunwayError::store("finish job commit", err))?;
        Ok(JobCompletion {
            job: finished,
            run: updated,
            next_job,
        })
    }
}

#[async_trait]
impl LogRepository for PostgresStore {
    async fn append_log(&self, job: JobId, data: &[u8]) -> Result<u64> {
        if !self.job_exists(job).await? {
            return Err(RunwayError::NotFound(format!("job {job}")));
        }
        let mut tx = self.begin("append log").await?;
        sqlx::query(
            "INSERT INTO log_streams (job_id, length, closed, updated_at) \
             VALUES ($1, 0, FALSE, NOW()) ON CONFLICT (job_id) DO NOTHING",
        )
        .bind(job.to_uuid())
        .execute(&mut *tx)
        .await
        .map_err(|err| RunwayError::store("append log", err))?;

        let (length, closed) = sqlx::query_as::<_, (i64, bool)>(
            "SELECT length, closed FROM log_streams WHERE job_id = $1 FOR UPDATE",
        )
        .bind(job.to_uuid())
        .fetch_one(&mut *tx)
        .await
        .map_err(|err| RunwayError::store("append log", err))?;
        if closed {
            return Err(RunwayError::InvariantViolation(format!(
                "log stream for job {job} is closed"
            )));
        }
        if data.is_empty() {
            return Ok(length as u64);
        }

        sqlx::query("INSERT INTO log_chunks (job_id, start_offset, data) VALUES ($1, $2, $3)")
            .bind(job.to_uuid())
            .bind(length)
            .bind(data)
            .execute(&mut *tx)
            .await
            .map_err(|err| RunwayError::store("append log chunk", err))?;
        let new_length = length + to_i64(data.len() as u64)?;
        sqlx::query(
            "UPDATE log_streams SET length = $2, closed = $3, updated_at = NOW() WHERE job_id = $1",
        )
        .bind(job.to_uuid())
        .bind(new_length)
        .bind(data.contains(&END_OF_STREAM))
        .execute(&mut *tx)
        .await
        .map_err(|err| RunwayError::store("append log", err))?;
        tx.commit()
            .await
            .map_err(|err| RunwayError::store("append log commit", err))?;
        Ok(new_length as u64)
    }

    async fn read_log(&self, job: JobId, offset: u64, limit: Option<u64>) -> Result<LogSlice> {
        let (length, closed) = self.log_length(job).await?;
        let (from, to) = read_window(length, offset, limit)?;
        let data = if from < to {
            let chunks = sqlx::query_as::<_, (i64, Vec<u8>)>(
                "SELECT start_offset, data FROM log_chunks \
                 WHERE job_id = $1 AND start_offset < $3 \
                   AND start_offset + octet_length(data) > $2 \
                 ORDER BY start_offset",
            )
            .bind(job.to_uuid())
            .bind(to_i64(from)?)
            .bind(to_i64(to)?)
            .fetch_all(&self.pool)
            .await
            .map_err(|err| RunwayError::store("read log", err))?;
            stitch(
                chunks
                    .iter()
                    .map(|(start, bytes)| (*start as u64, bytes.as_slice())),
                from,
                to,
            )
        } else {
            Vec::new()
        };
        Ok(LogSlice {
            job_id: job,
            offset,
            data,
            stream_length: length,
            closed,
        })
    }

    async fn log_length(&self, job: JobId) -> Result<(u64, bool)> {
        let header = sqlx::query_as::<_, (i64, bool)>(
            "SELECT length, closed FROM log_streams WHERE job_id = $1",
        )
        .bind(job.to_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(|err| RunwayError::store("log length", err))?;
        match header {
            Some((length, closed)) => Ok((length as u64, closed)),
            None if self.job_exists(job).await? => Ok((0, false)),
            None => Err(RunwayError::NotFound(format!("job {job}"))),
        }
    }
}
