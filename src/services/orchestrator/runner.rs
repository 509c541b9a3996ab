use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use sqlx::PgPool;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use crate::config::PanelConfig;
use crate::services::packages::{self, RecipeDeps};

use super::action;
use super::credentials::CredentialProvider;
use super::locks::LockKeeper;
use super::ssh::{self, shell_quote, CommandRunner};
use super::store;
use super::types::{
    job_types, ActionError, ActionReport, CredentialRole, DeploymentStatus, EntityKind, EntityRow,
    EntityStatus, OrchestrationJobRow, PackageAction, ServerRow,
};

/// Delay before a failed job's next attempt becomes due.
const RETRY_DELAY_SECONDS: u64 = 30;

/// How often aged progress events are swept out.
const EVENT_PRUNE_INTERVAL: Duration = Duration::from_secs(3600);

/// Retry budget and wall-clock window per job type. Destructive removes get a
/// single attempt so a half-torn-down host is never dismantled twice blindly;
/// deployments get the short window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobPolicy {
    pub max_attempts: i32,
    pub timeout_seconds: i64,
}

impl JobPolicy {
    pub fn for_job_type(job_type: &str) -> JobPolicy {
        match job_type {
            job_types::PROVISION_SERVER => JobPolicy {
                max_attempts: 2,
                timeout_seconds: 900,
            },
            job_types::INSTALL_MONITOR | job_types::INSTALL_ENTITY => JobPolicy {
                max_attempts: 3,
                timeout_seconds: 600,
            },
            job_types::REMOVE_MONITOR | job_types::REMOVE_ENTITY => JobPolicy {
                max_attempts: 1,
                timeout_seconds: 600,
            },
            job_types::RUN_DEPLOYMENT | job_types::ROLLBACK_DEPLOYMENT => JobPolicy {
                max_attempts: 1,
                timeout_seconds: 300,
            },
            _ => JobPolicy {
                max_attempts: 1,
                timeout_seconds: 600,
            },
        }
    }
}

struct JobContext<'a> {
    job: &'a OrchestrationJobRow,
    server: ServerRow,
    entity: Option<EntityRow>,
}

enum RunFailure {
    Action(ActionError),
    Window(u64),
}

impl RunFailure {
    fn message(&self, job_type: &str) -> String {
        match self {
            RunFailure::Action(err) => err.to_string(),
            RunFailure::Window(seconds) => {
                format!("{job_type} exceeded its {seconds}s execution window")
            }
        }
    }

    /// Remote output worth keeping on the deployment row, when there is any.
    fn remote_output(&self) -> Option<String> {
        match self {
            RunFailure::Action(ActionError::RemoteCommandFailed { stdout, stderr, .. }) => {
                let mut out = stdout.clone();
                if !stderr.is_empty() {
                    if !out.is_empty() {
                        out.push('\n');
                    }
                    out.push_str(stderr);
                }
                Some(out)
            }
            _ => None,
        }
    }
}

fn db_err(err: sqlx::Error) -> ActionError {
    ActionError::Other(anyhow::Error::new(err))
}

fn deployment_id_param(job: &OrchestrationJobRow) -> Option<Uuid> {
    job.params
        .0
        .get("deployment_id")
        .and_then(|value| value.as_str())
        .and_then(|value| Uuid::parse_str(value).ok())
}

/// Checks the release directory still exists before a rollback touches the
/// live symlink. A pruned release must fail the job with the link unchanged.
fn probe_release(
    runner: &mut dyn CommandRunner,
    path: &str,
    timeout: Duration,
) -> Result<(), ActionError> {
    match runner.run(&format!("test -d {}", shell_quote(path)), timeout) {
        Ok(_) => Ok(()),
        Err(ActionError::RemoteCommandFailed { .. }) => Err(ActionError::PreconditionNotMet(
            format!("release path {path} no longer exists on the server"),
        )),
        Err(other) => Err(other),
    }
}

pub struct OrchestratorService {
    db: PgPool,
    credentials: Arc<CredentialProvider>,
    locks: Arc<dyn LockKeeper>,
    semaphore: Arc<Semaphore>,
    poll_interval: Duration,
    defer_delay_seconds: u64,
    lock_lease: Duration,
    connect_timeout: Duration,
    command_timeout: Duration,
    deploy_timeout: Duration,
    event_retention_days: u32,
}

impl OrchestratorService {
    pub fn new(
        db: PgPool,
        config: &PanelConfig,
        credentials: Arc<CredentialProvider>,
        locks: Arc<dyn LockKeeper>,
    ) -> Self {
        Self {
            db,
            credentials,
            locks,
            semaphore: Arc::new(Semaphore::new(config.max_concurrent_jobs.max(1))),
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            defer_delay_seconds: config.defer_delay_seconds,
            lock_lease: Duration::from_secs(config.lock_lease_seconds),
            connect_timeout: Duration::from_secs(config.ssh_connect_timeout_seconds),
            command_timeout: Duration::from_secs(config.command_timeout_seconds),
            deploy_timeout: Duration::from_secs(config.deploy_timeout_seconds),
            event_retention_days: config.event_retention_days,
        }
    }

    /// Queues a job with the retry budget and window its type calls for.
    pub async fn enqueue(
        &self,
        job_type: &str,
        server_id: Uuid,
        entity_id: Option<Uuid>,
        params: serde_json::Value,
    ) -> Result<OrchestrationJobRow, sqlx::Error> {
        let policy = JobPolicy::for_job_type(job_type);
        store::enqueue_job(
            &self.db,
            store::NewJob {
                job_type,
                server_id,
                entity_id,
                params,
                max_attempts: policy.max_attempts,
                timeout_seconds: policy.timeout_seconds,
            },
        )
        .await
    }

    pub async fn get_job(&self, job_id: Uuid) -> Result<Option<OrchestrationJobRow>, sqlx::Error> {
        store::get_job(&self.db, job_id).await
    }

    pub fn start(self: Arc<Self>, cancel: CancellationToken) {
        tokio::spawn(async move {
            let mut last_prune = Instant::now();
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(self.poll_interval) => {}
                }

                if last_prune.elapsed() >= EVENT_PRUNE_INTERVAL {
                    last_prune = Instant::now();
                    match store::prune_progress_events(&self.db, self.event_retention_days).await {
                        Ok(0) => {}
                        Ok(pruned) => tracing::info!(pruned, "pruned aged progress events"),
                        Err(err) => tracing::warn!(error = %err, "progress event pruning failed"),
                    }
                }

                while let Ok(permit) = self.semaphore.clone().try_acquire_owned() {
                    let job = match store::claim_due_job(&self.db).await {
                        Ok(job) => job,
                        Err(err) => {
                            tracing::warn!(error = %err, "orchestration poller failed to claim job");
                            drop(permit);
                            break;
                        }
                    };

                    let Some(job) = job else {
                        drop(permit);
                        break;
                    };

                    // The claim pre-filter cannot see leases taken after it
                    // ran, so the lease is acquired here. Losing the race is
                    // not a failure: the job goes back to the queue and
                    // another attempt is made after the defer delay.
                    let acquired = match self
                        .locks
                        .acquire(job.server_id, job.id, self.lock_lease)
                        .await
                    {
                        Ok(acquired) => acquired,
                        Err(err) => {
                            tracing::warn!(error = %err, job_id = %job.id, "server lock acquisition errored");
                            false
                        }
                    };
                    if !acquired {
                        tracing::debug!(
                            job_id = %job.id,
                            server_id = %job.server_id,
                            "server busy; job deferred"
                        );
                        if let Err(err) =
                            store::defer_job(&self.db, job.id, self.defer_delay_seconds).await
                        {
                            tracing::warn!(error = %err, job_id = %job.id, "failed to defer job");
                        }
                        drop(permit);
                        continue;
                    }

                    let service = self.clone();
                    let span = tracing::info_span!(
                        "orchestration_job",
                        job_id = %job.id,
                        job_type = %job.job_type,
                        server_id = %job.server_id,
                        entity_id = ?job.entity_id,
                        attempt = job.attempts + 1,
                    );
                    tokio::spawn(async move {
                        let _permit = permit;
                        if let Err(err) = service.run_one(job).instrument(span).await {
                            tracing::warn!(error = %err, "orchestration job runner error");
                        }
                    });
                }
            }
        });
    }

    async fn run_one(self: Arc<Self>, job: OrchestrationJobRow) -> Result<()> {
        let result = self.run_locked(&job).await;
        if let Err(err) = self.locks.release(job.server_id, job.id).await {
            tracing::warn!(error = %err, job_id = %job.id, "failed to release server lock");
        }
        result
    }

    async fn run_locked(&self, job: &OrchestrationJobRow) -> Result<()> {
        let started = Instant::now();
        store::mark_job_started(&self.db, job.id)
            .await
            .context("Failed to record job start")?;

        let Some(server) = store::get_server(&self.db, job.server_id).await? else {
            store::mark_job_failed(&self.db, job.id, "server no longer exists", RETRY_DELAY_SECONDS)
                .await?;
            return Ok(());
        };
        let entity = match job.entity_id {
            Some(entity_id) => store::get_entity(&self.db, entity_id).await?,
            None => None,
        };
        if job.entity_id.is_some() && entity.is_none() {
            store::mark_job_failed(&self.db, job.id, "entity no longer exists", RETRY_DELAY_SECONDS)
                .await?;
            return Ok(());
        }

        // The pre-run snapshot doubles as the rollback target: a failed
        // remove puts the row back to the status captured here.
        let ctx = JobContext {
            job,
            server,
            entity,
        };

        let cancel = CancellationToken::new();
        let window = Duration::from_secs(job.timeout_seconds.max(1) as u64);
        tracing::info!(window_seconds = window.as_secs(), "orchestration job started");

        let outcome = match tokio::time::timeout(window, self.execute_job(&ctx, &cancel)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(RunFailure::Action(err)),
            Err(_) => {
                // The blocking action keeps running until its next step
                // boundary; the token stops it there, and guarded status
                // writes keep whatever it still emits from landing.
                cancel.cancel();
                Err(RunFailure::Window(window.as_secs()))
            }
        };

        let duration_ms = started.elapsed().as_millis() as u64;
        match outcome {
            Ok(()) => {
                store::mark_job_succeeded(&self.db, job.id).await?;
                tracing::info!(duration_ms, "orchestration job finished");
            }
            Err(failure) => {
                let error_text = failure.message(&job.job_type);
                self.settle_failure(&ctx, &failure, &error_text).await;
                let status =
                    store::mark_job_failed(&self.db, job.id, &error_text, RETRY_DELAY_SECONDS)
                        .await?;
                if status == "pending" {
                    tracing::info!(duration_ms, error = %error_text, "orchestration job failed; retry scheduled");
                } else {
                    tracing::warn!(duration_ms, error = %error_text, "orchestration job failed");
                }
            }
        }
        Ok(())
    }

    async fn execute_job(
        &self,
        ctx: &JobContext<'_>,
        cancel: &CancellationToken,
    ) -> Result<(), ActionError> {
        match ctx.job.job_type.as_str() {
            job_types::PROVISION_SERVER => self.provision_server(ctx, cancel).await,
            job_types::INSTALL_MONITOR => self.install_monitor(ctx, cancel).await,
            job_types::REMOVE_MONITOR => self.remove_monitor(ctx, cancel).await,
            job_types::INSTALL_ENTITY => self.install_entity(ctx, cancel).await,
            job_types::REMOVE_ENTITY => self.remove_entity(ctx, cancel).await,
            job_types::RUN_DEPLOYMENT => self.run_deployment(ctx, cancel).await,
            job_types::ROLLBACK_DEPLOYMENT => self.rollback_deployment(ctx, cancel).await,
            other => Err(ActionError::InvalidConfiguration(format!(
                "unsupported job type: {other}"
            ))),
        }
    }

    /// Writes the terminal state each job type calls for after a failed or
    /// timed-out run. Every write is guarded, so repeating this after a
    /// partial earlier settle is harmless.
    async fn settle_failure(&self, ctx: &JobContext<'_>, failure: &RunFailure, error_text: &str) {
        let result: Result<(), sqlx::Error> = async {
            match ctx.job.job_type.as_str() {
                job_types::PROVISION_SERVER => {
                    store::transition_server_provision(
                        &self.db,
                        ctx.server.id,
                        &["provisioning"],
                        "failed",
                        Some(error_text),
                    )
                    .await?;
                }
                job_types::INSTALL_MONITOR => {
                    store::transition_server_monitor(
                        &self.db,
                        ctx.server.id,
                        &["installing"],
                        "failed",
                    )
                    .await?;
                }
                job_types::REMOVE_MONITOR => {
                    // A failed removal puts the flag back where it was; the
                    // agent is presumed still present.
                    store::transition_server_monitor(
                        &self.db,
                        ctx.server.id,
                        &["removing"],
                        ctx.server.monitor_status.as_str(),
                    )
                    .await?;
                }
                job_types::INSTALL_ENTITY => {
                    if let Some(entity) = &ctx.entity {
                        store::transition_entity(
                            &self.db,
                            entity.id,
                            &[EntityStatus::Installing, EntityStatus::Updating],
                            EntityStatus::Failed,
                            Some(error_text),
                        )
                        .await?;
                        if entity.entity_kind() == Some(EntityKind::Site) {
                            store::fail_installing_site_steps(&self.db, entity.id).await?;
                        }
                    }
                }
                job_types::REMOVE_ENTITY => {
                    if let Some(entity) = &ctx.entity {
                        let prior = entity.entity_status().unwrap_or(EntityStatus::Failed);
                        store::transition_entity(
                            &self.db,
                            entity.id,
                            &[EntityStatus::Removing],
                            prior,
                            Some(error_text),
                        )
                        .await?;
                    }
                }
                job_types::RUN_DEPLOYMENT => {
                    if let Some(deployment_id) = deployment_id_param(ctx.job) {
                        store::fail_deployment_if_running(
                            &self.db,
                            deployment_id,
                            failure.remote_output().as_deref(),
                        )
                        .await?;
                    }
                }
                _ => {}
            }
            Ok(())
        }
        .await;
        if let Err(err) = result {
            tracing::warn!(error = %err, job_id = %ctx.job.id, "failed to persist failure state");
        }
    }

    fn recipe_deps(&self) -> RecipeDeps {
        RecipeDeps {
            db: self.db.clone(),
            handle: tokio::runtime::Handle::current(),
        }
    }

    /// Connects with the role the action names and drives it to completion on
    /// a blocking thread, streaming milestones into progress_events.
    async fn run_action_over_ssh(
        &self,
        ctx: &JobContext<'_>,
        cancel: &CancellationToken,
        mut action: PackageAction,
    ) -> Result<ActionReport, ActionError> {
        if action.command_timeout.is_zero() {
            action.command_timeout = self.command_timeout;
        }
        let credential = self
            .credentials
            .resolve(ctx.server.id, action.role)
            .await?;
        let address = ctx.server.address.clone();
        let port = ctx.server.ssh_port as u16;
        let connect_timeout = self.connect_timeout;
        let db = self.db.clone();
        let handle = tokio::runtime::Handle::current();
        let server_id = ctx.server.id;
        let entity_id = ctx.job.entity_id;
        let run_id = Uuid::new_v4();
        let kind = action.kind;
        let cancel = cancel.clone();

        tokio::task::spawn_blocking(move || {
            let mut session = ssh::connect(&address, port, &credential, connect_timeout)?;
            let mut sink = store::PgProgressSink::new(db, handle, server_id, entity_id, run_id, kind);
            action::run(&mut session, &mut sink, &cancel, action)
        })
        .await
        .map_err(|err| ActionError::Other(anyhow::anyhow!("action thread panicked: {err}")))?
    }

    async fn provision_server(
        &self,
        ctx: &JobContext<'_>,
        cancel: &CancellationToken,
    ) -> Result<(), ActionError> {
        let moved = store::transition_server_provision(
            &self.db,
            ctx.server.id,
            &["pending", "failed"],
            "provisioning",
            None,
        )
        .await
        .map_err(db_err)?;
        if !moved {
            return Err(ActionError::PreconditionNotMet(format!(
                "server {} is not awaiting provisioning",
                ctx.server.name
            )));
        }

        // Application and worker keys are minted here so provisioning can
        // push them into the accounts it creates.
        let application = self
            .credentials
            .resolve(ctx.server.id, CredentialRole::Application)
            .await?;
        let worker = self
            .credentials
            .resolve(ctx.server.id, CredentialRole::Worker)
            .await?;

        let action = packages::base::provision_action(&application, &worker);
        self.run_action_over_ssh(ctx, cancel, action).await?;

        let moved = store::transition_server_provision(
            &self.db,
            ctx.server.id,
            &["provisioning"],
            "active",
            None,
        )
        .await
        .map_err(db_err)?;
        if !moved {
            tracing::warn!(server_id = %ctx.server.id, "provision finished but the server had already left the provisioning state");
        }
        Ok(())
    }

    async fn install_monitor(
        &self,
        ctx: &JobContext<'_>,
        cancel: &CancellationToken,
    ) -> Result<(), ActionError> {
        self.require_provisioned(ctx)?;
        let moved = store::transition_server_monitor(
            &self.db,
            ctx.server.id,
            &["none", "failed"],
            "installing",
        )
        .await
        .map_err(db_err)?;
        if !moved {
            return Err(ActionError::PreconditionNotMet(format!(
                "monitoring on {} is not installable from its current state",
                ctx.server.name
            )));
        }

        let action = packages::monitor::install_action();
        self.run_action_over_ssh(ctx, cancel, action).await?;

        store::transition_server_monitor(&self.db, ctx.server.id, &["installing"], "enabled")
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn remove_monitor(
        &self,
        ctx: &JobContext<'_>,
        cancel: &CancellationToken,
    ) -> Result<(), ActionError> {
        self.require_provisioned(ctx)?;
        let moved = store::transition_server_monitor(
            &self.db,
            ctx.server.id,
            &["enabled", "failed"],
            "removing",
        )
        .await
        .map_err(db_err)?;
        if !moved {
            return Err(ActionError::PreconditionNotMet(format!(
                "monitoring on {} is not in a removable state",
                ctx.server.name
            )));
        }

        let action = packages::monitor::remove_action();
        self.run_action_over_ssh(ctx, cancel, action).await?;

        store::transition_server_monitor(&self.db, ctx.server.id, &["removing"], "none")
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn install_entity(
        &self,
        ctx: &JobContext<'_>,
        cancel: &CancellationToken,
    ) -> Result<(), ActionError> {
        self.require_provisioned(ctx)?;
        let entity = self.require_entity(ctx)?;
        let moved = store::transition_entity(
            &self.db,
            entity.id,
            &[EntityStatus::Pending, EntityStatus::Failed],
            EntityStatus::Installing,
            None,
        )
        .await
        .map_err(db_err)?;
        if !moved {
            return Err(ActionError::PreconditionNotMet(format!(
                "{} {} is not awaiting installation",
                entity.kind, entity.name
            )));
        }

        let action = packages::install_action(&self.recipe_deps(), &ctx.server, entity).await?;
        self.run_action_over_ssh(ctx, cancel, action).await?;

        let moved = store::transition_entity(
            &self.db,
            entity.id,
            &[EntityStatus::Installing],
            EntityStatus::Active,
            None,
        )
        .await
        .map_err(db_err)?;
        if !moved {
            tracing::warn!(entity_id = %entity.id, "install finished but the entity had already left the installing state");
        }
        Ok(())
    }

    async fn remove_entity(
        &self,
        ctx: &JobContext<'_>,
        cancel: &CancellationToken,
    ) -> Result<(), ActionError> {
        self.require_provisioned(ctx)?;
        let entity = self.require_entity(ctx)?;
        let moved = store::transition_entity(
            &self.db,
            entity.id,
            &[EntityStatus::Active, EntityStatus::Failed],
            EntityStatus::Removing,
            None,
        )
        .await
        .map_err(db_err)?;
        if !moved {
            return Err(ActionError::PreconditionNotMet(format!(
                "{} {} is not in a removable state",
                entity.kind, entity.name
            )));
        }

        let action = packages::remove_action(&self.recipe_deps(), &ctx.server, entity).await?;
        self.run_action_over_ssh(ctx, cancel, action).await?;

        store::delete_entity(&self.db, entity.id)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn run_deployment(
        &self,
        ctx: &JobContext<'_>,
        cancel: &CancellationToken,
    ) -> Result<(), ActionError> {
        self.require_provisioned(ctx)?;
        let site = self.require_entity(ctx)?;
        if site.entity_kind() != Some(EntityKind::Site) {
            return Err(ActionError::InvalidConfiguration(format!(
                "deployments target sites, not {}",
                site.kind
            )));
        }
        let deployment_id = deployment_id_param(ctx.job).ok_or_else(|| {
            ActionError::InvalidConfiguration("job params carry no deployment_id".to_string())
        })?;
        let Some(deployment) = store::get_deployment(&self.db, deployment_id)
            .await
            .map_err(db_err)?
        else {
            return Err(ActionError::InvalidConfiguration(format!(
                "deployment {deployment_id} no longer exists"
            )));
        };
        if deployment.status != DeploymentStatus::Pending.as_str() {
            return Err(ActionError::PreconditionNotMet(format!(
                "deployment {} was already picked up ({})",
                deployment.id, deployment.status
            )));
        }

        store::mark_deployment_started(&self.db, deployment.id)
            .await
            .map_err(db_err)?;

        let prepared = packages::deploy::run_action(site, &deployment)?;
        let mut action = prepared.action;
        action.command_timeout = self.deploy_timeout;

        let credential = self
            .credentials
            .resolve(ctx.server.id, action.role)
            .await?;
        let address = ctx.server.address.clone();
        let port = ctx.server.ssh_port as u16;
        let connect_timeout = self.connect_timeout;
        let command_timeout = self.command_timeout;
        let db = self.db.clone();
        let handle = tokio::runtime::Handle::current();
        let server_id = ctx.server.id;
        let entity_id = ctx.job.entity_id;
        let run_id = Uuid::new_v4();
        let kind = action.kind;
        let cancel = cancel.clone();
        let followups = prepared.followups.clone();

        let (report, followup_outputs) = tokio::task::spawn_blocking(move || {
            let mut session = ssh::connect(&address, port, &credential, connect_timeout)?;
            let mut sink =
                store::PgProgressSink::new(db, handle, server_id, entity_id, run_id, kind);
            let report = action::run(&mut session, &mut sink, &cancel, action)?;
            // Release metadata comes off the same session once the script is
            // done, so it never shows up in the recorded deploy output.
            let outputs = session.run_batch(&followups, command_timeout)?;
            Ok::<_, ActionError>((report, outputs))
        })
        .await
        .map_err(|err| ActionError::Other(anyhow::anyhow!("action thread panicked: {err}")))??;

        let commit_sha = followup_outputs
            .first()
            .map(|output| output.stdout.trim().to_string())
            .filter(|sha| !sha.is_empty());
        if let Some(live) = followup_outputs.get(1) {
            let live = live.stdout.trim();
            if live != prepared.release_path {
                tracing::warn!(
                    deployment_id = %deployment.id,
                    live,
                    release = %prepared.release_path,
                    "deploy script re-pointed the live link"
                );
            }
        }
        store::finish_deployment(
            &self.db,
            deployment.id,
            DeploymentStatus::Success,
            Some(report.transcript().as_str()),
            Some(0),
            commit_sha.as_deref(),
            Some(prepared.release_path.as_str()),
        )
        .await
        .map_err(db_err)?;
        store::set_active_deployment(&self.db, site.id, deployment.id)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn rollback_deployment(
        &self,
        ctx: &JobContext<'_>,
        cancel: &CancellationToken,
    ) -> Result<(), ActionError> {
        self.require_provisioned(ctx)?;
        let site = self.require_entity(ctx)?;
        let deployment_id = deployment_id_param(ctx.job).ok_or_else(|| {
            ActionError::InvalidConfiguration("job params carry no deployment_id".to_string())
        })?;
        let Some(target) = store::get_deployment(&self.db, deployment_id)
            .await
            .map_err(db_err)?
        else {
            return Err(ActionError::InvalidConfiguration(format!(
                "deployment {deployment_id} no longer exists"
            )));
        };
        if target.status != DeploymentStatus::Success.as_str() {
            return Err(ActionError::PreconditionNotMet(format!(
                "deployment {} never succeeded; only successful deployments can be restored",
                target.id
            )));
        }
        let release_path = target.release_path.clone().ok_or_else(|| {
            ActionError::PreconditionNotMet(format!(
                "deployment {} has no recorded release path",
                target.id
            ))
        })?;

        let mut action = packages::deploy::rollback_action(site, &release_path)?;
        action.command_timeout = self.command_timeout;
        let credential = self
            .credentials
            .resolve(ctx.server.id, action.role)
            .await?;
        let address = ctx.server.address.clone();
        let port = ctx.server.ssh_port as u16;
        let connect_timeout = self.connect_timeout;
        let command_timeout = self.command_timeout;
        let db = self.db.clone();
        let handle = tokio::runtime::Handle::current();
        let server_id = ctx.server.id;
        let entity_id = ctx.job.entity_id;
        let run_id = Uuid::new_v4();
        let kind = action.kind;
        let cancel = cancel.clone();
        let probe_path = release_path.clone();

        tokio::task::spawn_blocking(move || {
            let mut session = ssh::connect(&address, port, &credential, connect_timeout)?;
            probe_release(&mut session, &probe_path, command_timeout)?;
            let mut sink = store::PgProgressSink::new(db, handle, server_id, entity_id, run_id, kind);
            action::run(&mut session, &mut sink, &cancel, action)
        })
        .await
        .map_err(|err| ActionError::Other(anyhow::anyhow!("action thread panicked: {err}")))??;

        store::set_active_deployment(&self.db, site.id, target.id)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    fn require_provisioned(&self, ctx: &JobContext<'_>) -> Result<(), ActionError> {
        if ctx.server.provision_status != "active" {
            return Err(ActionError::PreconditionNotMet(format!(
                "server {} is not provisioned ({})",
                ctx.server.name, ctx.server.provision_status
            )));
        }
        Ok(())
    }

    fn require_entity<'a>(&self, ctx: &'a JobContext<'_>) -> Result<&'a EntityRow, ActionError> {
        ctx.entity.as_ref().ok_or_else(|| {
            ActionError::InvalidConfiguration(format!(
                "{} job {} has no entity attached",
                ctx.job.job_type, ctx.job.id
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::types::Json as SqlJson;

    #[test]
    fn destructive_jobs_never_retry() {
        assert_eq!(JobPolicy::for_job_type(job_types::REMOVE_ENTITY).max_attempts, 1);
        assert_eq!(JobPolicy::for_job_type(job_types::REMOVE_MONITOR).max_attempts, 1);
        assert_eq!(JobPolicy::for_job_type(job_types::ROLLBACK_DEPLOYMENT).max_attempts, 1);
    }

    #[test]
    fn installs_retry_and_deploys_get_the_short_window() {
        assert_eq!(JobPolicy::for_job_type(job_types::INSTALL_ENTITY).max_attempts, 3);
        assert_eq!(JobPolicy::for_job_type(job_types::PROVISION_SERVER).timeout_seconds, 900);
        assert_eq!(JobPolicy::for_job_type(job_types::RUN_DEPLOYMENT).timeout_seconds, 300);
        assert_eq!(JobPolicy::for_job_type("someday_maybe").max_attempts, 1);
    }

    #[test]
    fn window_failures_name_the_job_type_and_budget() {
        let failure = RunFailure::Window(300);
        assert_eq!(
            failure.message("run_deployment"),
            "run_deployment exceeded its 300s execution window"
        );
        assert!(failure.remote_output().is_none());
    }

    #[test]
    fn command_failures_keep_remote_output_for_the_deployment_row() {
        let failure = RunFailure::Action(ActionError::RemoteCommandFailed {
            command: "bash deploy.sh".to_string(),
            exit_code: 2,
            stdout: "building".to_string(),
            stderr: "out of disk".to_string(),
        });
        assert_eq!(failure.remote_output().as_deref(), Some("building\nout of disk"));
    }

    #[test]
    fn missing_release_becomes_a_precondition_failure() {
        let mut runner = crate::test_support::ScriptedRunner::new()
            .fail_on(1, "test: No such file or directory");
        let err = probe_release(
            &mut runner,
            "/home/panel/sites/app.example.com/releases/20240101",
            Duration::from_secs(5),
        )
        .unwrap_err();
        assert!(matches!(err, ActionError::PreconditionNotMet(_)));
        assert!(err.to_string().contains("/releases/20240101"));
        assert_eq!(
            runner.commands,
            vec!["test -d '/home/panel/sites/app.example.com/releases/20240101'".to_string()]
        );
    }

    #[test]
    fn probe_passes_other_failures_through_unchanged() {
        let mut runner = crate::test_support::ScriptedRunner::new().time_out_on(1);
        let err = probe_release(&mut runner, "/srv/x", Duration::from_secs(5)).unwrap_err();
        assert!(matches!(err, ActionError::RemoteCommandTimedOut { .. }));
    }

    #[test]
    fn deployment_id_comes_from_job_params() {
        let id = Uuid::new_v4();
        let mut job = sample_job();
        job.params = SqlJson(serde_json::json!({ "deployment_id": id.to_string() }));
        assert_eq!(deployment_id_param(&job), Some(id));

        job.params = SqlJson(serde_json::json!({}));
        assert_eq!(deployment_id_param(&job), None);
    }

    fn sample_job() -> OrchestrationJobRow {
        OrchestrationJobRow {
            id: Uuid::new_v4(),
            job_type: job_types::RUN_DEPLOYMENT.to_string(),
            server_id: Uuid::new_v4(),
            entity_id: Some(Uuid::new_v4()),
            params: SqlJson(serde_json::json!({})),
            status: "pending".to_string(),
            attempts: 0,
            max_attempts: 1,
            timeout_seconds: 300,
            error: None,
            run_after: chrono::Utc::now(),
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }
}
