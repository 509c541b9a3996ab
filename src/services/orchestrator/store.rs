use anyhow::{Context, Result};
use sqlx::types::Json as SqlJson;
use sqlx::PgPool;
use uuid::Uuid;

use super::action::ProgressSink;
use super::types::{
    ActionKind, DeploymentRow, DeploymentStatus, EntityRow, EntityStatus, OrchestrationJobRow,
    ProgressEventRow, ServerRow,
};

pub struct NewJob<'a> {
    pub job_type: &'a str,
    pub server_id: Uuid,
    pub entity_id: Option<Uuid>,
    pub params: serde_json::Value,
    pub max_attempts: i32,
    pub timeout_seconds: i64,
}

pub async fn enqueue_job(db: &PgPool, new: NewJob<'_>) -> Result<OrchestrationJobRow, sqlx::Error> {
    sqlx::query_as(
        r#"
        INSERT INTO orchestration_jobs (
            id, job_type, server_id, entity_id, params, status, max_attempts,
            timeout_seconds, run_after, created_at, updated_at
        ) VALUES ($1, $2, $3, $4, $5, 'pending', $6, $7, now(), now(), now())
        RETURNING
            id, job_type, server_id, entity_id, params, status, attempts, max_attempts,
            timeout_seconds, error, run_after, created_at, updated_at, started_at, finished_at
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(new.job_type)
    .bind(new.server_id)
    .bind(new.entity_id)
    .bind(SqlJson(new.params))
    .bind(new.max_attempts)
    .bind(new.timeout_seconds)
    .fetch_one(db)
    .await
}

pub async fn get_job(db: &PgPool, job_id: Uuid) -> Result<Option<OrchestrationJobRow>, sqlx::Error> {
    sqlx::query_as(
        r#"
        SELECT id, job_type, server_id, entity_id, params, status, attempts, max_attempts,
               timeout_seconds, error, run_after, created_at, updated_at, started_at, finished_at
        FROM orchestration_jobs
        WHERE id = $1
        LIMIT 1
        "#,
    )
    .bind(job_id)
    .fetch_optional(db)
    .await
}

/// Claims the oldest due job whose server is not currently leased. The lease
/// check here only reduces churn; the runner still acquires the lock itself
/// and defers when it loses the race.
pub async fn claim_due_job(db: &PgPool) -> Result<Option<OrchestrationJobRow>, sqlx::Error> {
    let mut tx = db.begin().await?;
    let claimed: Option<OrchestrationJobRow> = sqlx::query_as(
        r#"
        WITH next AS (
            SELECT j.id
            FROM orchestration_jobs j
            WHERE j.status = 'pending'
              AND j.run_after <= now()
              AND NOT EXISTS (
                  SELECT 1 FROM server_locks l
                  WHERE l.server_id = j.server_id AND l.expires_at > now()
              )
            ORDER BY j.created_at ASC
            LIMIT 1
            FOR UPDATE SKIP LOCKED
        )
        UPDATE orchestration_jobs
        SET status = 'running',
            updated_at = now()
        WHERE id IN (SELECT id FROM next)
        RETURNING
            id, job_type, server_id, entity_id, params, status, attempts, max_attempts,
            timeout_seconds, error, run_after, created_at, updated_at, started_at, finished_at
        "#,
    )
    .fetch_optional(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(claimed)
}

/// Releases a claimed job back to the queue without burning an attempt. Used
/// when the server lock is held by someone else.
pub async fn defer_job(db: &PgPool, job_id: Uuid, delay_seconds: u64) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE orchestration_jobs
        SET status = 'pending',
            run_after = now() + make_interval(secs => $2),
            updated_at = now()
        WHERE id = $1
        "#,
    )
    .bind(job_id)
    .bind(delay_seconds as f64)
    .execute(db)
    .await?;
    Ok(())
}

/// Records that the run actually started; this is the point an attempt is
/// spent, not the claim.
pub async fn mark_job_started(db: &PgPool, job_id: Uuid) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE orchestration_jobs
        SET attempts = attempts + 1,
            started_at = COALESCE(started_at, now()),
            updated_at = now()
        WHERE id = $1
        "#,
    )
    .bind(job_id)
    .execute(db)
    .await?;
    Ok(())
}

pub async fn mark_job_succeeded(db: &PgPool, job_id: Uuid) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE orchestration_jobs
        SET status = 'success',
            error = NULL,
            finished_at = now(),
            updated_at = now()
        WHERE id = $1
        "#,
    )
    .bind(job_id)
    .execute(db)
    .await?;
    Ok(())
}

/// Persists the failure and either schedules a retry or goes terminal when
/// attempts are exhausted. Safe to call more than once. Returns the resulting
/// job status string.
pub async fn mark_job_failed(
    db: &PgPool,
    job_id: Uuid,
    error: &str,
    retry_delay_seconds: u64,
) -> Result<String, sqlx::Error> {
    let (status,): (String,) = sqlx::query_as(
        r#"
        UPDATE orchestration_jobs
        SET status = CASE WHEN attempts >= max_attempts THEN 'failed' ELSE 'pending' END,
            run_after = CASE WHEN attempts >= max_attempts
                             THEN run_after
                             ELSE now() + make_interval(secs => $3) END,
            finished_at = CASE WHEN attempts >= max_attempts THEN now() ELSE finished_at END,
            error = $2,
            updated_at = now()
        WHERE id = $1
        RETURNING status
        "#,
    )
    .bind(job_id)
    .bind(error)
    .bind(retry_delay_seconds as f64)
    .fetch_one(db)
    .await?;
    Ok(status)
}

pub async fn get_server(db: &PgPool, server_id: Uuid) -> Result<Option<ServerRow>, sqlx::Error> {
    sqlx::query_as(
        r#"
        SELECT id, name, address, ssh_port, provision_status, monitor_status,
               services, error_log, created_at, updated_at
        FROM servers
        WHERE id = $1
        LIMIT 1
        "#,
    )
    .bind(server_id)
    .fetch_optional(db)
    .await
}

pub async fn get_entity(db: &PgPool, entity_id: Uuid) -> Result<Option<EntityRow>, sqlx::Error> {
    sqlx::query_as(
        r#"
        SELECT id, server_id, kind, name, config, status, error_log,
               install_steps, active_deployment_id, created_at, updated_at
        FROM entities
        WHERE id = $1
        LIMIT 1
        "#,
    )
    .bind(entity_id)
    .fetch_optional(db)
    .await
}

pub async fn get_deployment(
    db: &PgPool,
    deployment_id: Uuid,
) -> Result<Option<DeploymentRow>, sqlx::Error> {
    sqlx::query_as(
        r#"
        SELECT id, site_id, server_id, status, script, output, exit_code,
               commit_sha, release_path, started_at, finished_at, created_at
        FROM deployments
        WHERE id = $1
        LIMIT 1
        "#,
    )
    .bind(deployment_id)
    .fetch_optional(db)
    .await
}

/// The one guarded status write for entities: re-reads nothing, validates the
/// allowed-from set inside the UPDATE, and loses cleanly when someone else
/// already moved the row. `error` replaces `error_log` (None clears it).
pub async fn transition_entity(
    db: &PgPool,
    entity_id: Uuid,
    from: &[EntityStatus],
    to: EntityStatus,
    error: Option<&str>,
) -> Result<bool, sqlx::Error> {
    let from: Vec<&str> = from.iter().map(EntityStatus::as_str).collect();
    let updated: Option<(Uuid,)> = sqlx::query_as(
        r#"
        UPDATE entities
        SET status = $2,
            error_log = $4,
            updated_at = now()
        WHERE id = $1 AND status = ANY($3)
        RETURNING id
        "#,
    )
    .bind(entity_id)
    .bind(to.as_str())
    .bind(&from)
    .bind(error)
    .fetch_optional(db)
    .await?;
    Ok(updated.is_some())
}

pub async fn delete_entity(db: &PgPool, entity_id: Uuid) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM entities WHERE id = $1")
        .bind(entity_id)
        .execute(db)
        .await?;
    Ok(())
}

/// Guarded status write for the server's provisioning field.
pub async fn transition_server_provision(
    db: &PgPool,
    server_id: Uuid,
    from: &[&str],
    to: &str,
    error: Option<&str>,
) -> Result<bool, sqlx::Error> {
    let updated: Option<(Uuid,)> = sqlx::query_as(
        r#"
        UPDATE servers
        SET provision_status = $2,
            error_log = $4,
            updated_at = now()
        WHERE id = $1 AND provision_status = ANY($3)
        RETURNING id
        "#,
    )
    .bind(server_id)
    .bind(to)
    .bind(from)
    .bind(error)
    .fetch_optional(db)
    .await?;
    Ok(updated.is_some())
}

/// Guarded status write for the server's monitoring field.
pub async fn transition_server_monitor(
    db: &PgPool,
    server_id: Uuid,
    from: &[&str],
    to: &str,
) -> Result<bool, sqlx::Error> {
    let updated: Option<(Uuid,)> = sqlx::query_as(
        r#"
        UPDATE servers
        SET monitor_status = $2,
            updated_at = now()
        WHERE id = $1 AND monitor_status = ANY($3)
        RETURNING id
        "#,
    )
    .bind(server_id)
    .bind(to)
    .bind(from)
    .fetch_optional(db)
    .await?;
    Ok(updated.is_some())
}

/// Merges one entry into the server's installed-services registry.
pub async fn merge_server_service(
    db: &PgPool,
    server_id: Uuid,
    name: &str,
    entry: serde_json::Value,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE servers
        SET services = services || $2,
            updated_at = now()
        WHERE id = $1
        "#,
    )
    .bind(server_id)
    .bind(SqlJson(serde_json::json!({ name: entry })))
    .execute(db)
    .await?;
    Ok(())
}

pub async fn remove_server_service(
    db: &PgPool,
    server_id: Uuid,
    name: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE servers
        SET services = services - $2,
            updated_at = now()
        WHERE id = $1
        "#,
    )
    .bind(server_id)
    .bind(name)
    .execute(db)
    .await?;
    Ok(())
}

pub async fn append_progress_event(
    db: &PgPool,
    server_id: Uuid,
    entity_id: Option<Uuid>,
    run_id: Uuid,
    action_kind: ActionKind,
    milestone: &str,
    label: &str,
    step_index: i32,
    total_steps: i32,
    detail: Option<&str>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO progress_events (
            server_id, entity_id, run_id, action_kind, milestone, label,
            step_index, total_steps, detail, created_at
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, now())
        "#,
    )
    .bind(server_id)
    .bind(entity_id)
    .bind(run_id)
    .bind(action_kind.as_str())
    .bind(milestone)
    .bind(label)
    .bind(step_index)
    .bind(total_steps)
    .bind(detail)
    .execute(db)
    .await?;
    Ok(())
}

/// Most recent run id for an entity, or for server-level actions when
/// `entity_id` is None.
pub async fn latest_run_id(
    db: &PgPool,
    server_id: Uuid,
    entity_id: Option<Uuid>,
) -> Result<Option<Uuid>, sqlx::Error> {
    let row: Option<(Uuid,)> = match entity_id {
        Some(entity_id) => {
            sqlx::query_as(
                r#"
                SELECT run_id FROM progress_events
                WHERE entity_id = $1
                ORDER BY id DESC
                LIMIT 1
                "#,
            )
            .bind(entity_id)
            .fetch_optional(db)
            .await?
        }
        None => {
            sqlx::query_as(
                r#"
                SELECT run_id FROM progress_events
                WHERE server_id = $1 AND entity_id IS NULL
                ORDER BY id DESC
                LIMIT 1
                "#,
            )
            .bind(server_id)
            .fetch_optional(db)
            .await?
        }
    };
    Ok(row.map(|(run_id,)| run_id))
}

pub async fn list_run_events(
    db: &PgPool,
    run_id: Uuid,
) -> Result<Vec<ProgressEventRow>, sqlx::Error> {
    sqlx::query_as(
        r#"
        SELECT id, server_id, entity_id, run_id, action_kind, milestone, label,
               step_index, total_steps, detail, created_at
        FROM progress_events
        WHERE run_id = $1
        ORDER BY id ASC
        "#,
    )
    .bind(run_id)
    .fetch_all(db)
    .await
}

pub async fn prune_progress_events(db: &PgPool, retention_days: u32) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        "DELETE FROM progress_events WHERE created_at < now() - make_interval(days => $1)",
    )
    .bind(retention_days as i32)
    .execute(db)
    .await?;
    Ok(result.rows_affected())
}

pub async fn mark_deployment_started(
    db: &PgPool,
    deployment_id: Uuid,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE deployments
        SET status = 'deploying',
            started_at = now()
        WHERE id = $1
        "#,
    )
    .bind(deployment_id)
    .execute(db)
    .await?;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
pub async fn finish_deployment(
    db: &PgPool,
    deployment_id: Uuid,
    status: DeploymentStatus,
    output: Option<&str>,
    exit_code: Option<i32>,
    commit_sha: Option<&str>,
    release_path: Option<&str>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE deployments
        SET status = $2,
            output = $3,
            exit_code = $4,
            commit_sha = COALESCE($5, commit_sha),
            release_path = COALESCE($6, release_path),
            finished_at = now()
        WHERE id = $1
        "#,
    )
    .bind(deployment_id)
    .bind(status.as_str())
    .bind(output)
    .bind(exit_code)
    .bind(commit_sha)
    .bind(release_path)
    .execute(db)
    .await?;
    Ok(())
}

/// Marks a deployment failed only while it is still pending or mid-deploy, so
/// a late failure writer cannot clobber a finished row.
pub async fn fail_deployment_if_running(
    db: &PgPool,
    deployment_id: Uuid,
    output: Option<&str>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE deployments
        SET status = 'failed',
            output = COALESCE($2, output),
            finished_at = COALESCE(finished_at, now())
        WHERE id = $1 AND status IN ('pending', 'deploying')
        "#,
    )
    .bind(deployment_id)
    .bind(output)
    .execute(db)
    .await?;
    Ok(())
}

/// Atomic switch of the site's active deployment pointer.
pub async fn set_active_deployment(
    db: &PgPool,
    site_id: Uuid,
    deployment_id: Uuid,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE entities
        SET active_deployment_id = $2,
            updated_at = now()
        WHERE id = $1
        "#,
    )
    .bind(site_id)
    .bind(deployment_id)
    .execute(db)
    .await?;
    Ok(())
}

/// Records one framework install step's status in the site's per-step state.
pub async fn set_site_install_step(
    db: &PgPool,
    site_id: Uuid,
    step_number: u32,
    status: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE entities
        SET install_steps = jsonb_set(
                COALESCE(install_steps, '{}'::jsonb),
                ARRAY[$2::text],
                to_jsonb($3::text),
                true
            ),
            updated_at = now()
        WHERE id = $1
        "#,
    )
    .bind(site_id)
    .bind(step_number.to_string())
    .bind(status)
    .execute(db)
    .await?;
    Ok(())
}

/// Marks whichever framework step was mid-install as failed, leaving the
/// completed steps' records untouched.
pub async fn fail_installing_site_steps(db: &PgPool, site_id: Uuid) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE entities
        SET install_steps = (
                SELECT COALESCE(
                    jsonb_object_agg(
                        key,
                        CASE WHEN value = '"installing"'::jsonb
                             THEN '"failed"'::jsonb
                             ELSE value END
                    ),
                    '{}'::jsonb
                )
                FROM jsonb_each(COALESCE(install_steps, '{}'::jsonb))
            ),
            updated_at = now()
        WHERE id = $1 AND install_steps IS NOT NULL
        "#,
    )
    .bind(site_id)
    .execute(db)
    .await?;
    Ok(())
}

/// Production progress sink: appends events from the blocking action thread
/// through the async pool.
pub struct PgProgressSink {
    db: PgPool,
    handle: tokio::runtime::Handle,
    server_id: Uuid,
    entity_id: Option<Uuid>,
    run_id: Uuid,
    action_kind: ActionKind,
}

impl PgProgressSink {
    pub fn new(
        db: PgPool,
        handle: tokio::runtime::Handle,
        server_id: Uuid,
        entity_id: Option<Uuid>,
        run_id: Uuid,
        action_kind: ActionKind,
    ) -> Self {
        Self {
            db,
            handle,
            server_id,
            entity_id,
            run_id,
            action_kind,
        }
    }
}

impl ProgressSink for PgProgressSink {
    fn record(
        &mut self,
        milestone: &'static str,
        label: &str,
        step_index: u32,
        total_steps: u32,
    ) -> Result<()> {
        self.handle
            .block_on(append_progress_event(
                &self.db,
                self.server_id,
                self.entity_id,
                self.run_id,
                self.action_kind,
                milestone,
                label,
                step_index as i32,
                total_steps as i32,
                None,
            ))
            .context("failed to persist progress event")
    }
}
