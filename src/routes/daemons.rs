use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{delete, get, post};
use axum::{Json, Router};

use crate::error::map_db_error;
use crate::services::orchestrator::types::{EntityKind, EntityPublic, EntityRow, OrchestrationJobPublic};
use crate::services::packages::daemon::DaemonConfig;
use crate::state::AppState;

use super::firewall::{
    enqueue_install, enqueue_removal, fetch_entity, insert_entity, require_name_free,
    require_provisioned, strip_nulls, EntityWithJob,
};
use super::servers::fetch_server;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, serde::Deserialize, utoipa::ToSchema)]
pub(crate) struct CreateDaemonRequest {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub directory: Option<String>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub autorestart: Option<bool>,
    #[serde(default)]
    pub numprocs: Option<u32>,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

#[utoipa::path(
    get,
    path = "/api/servers/{id}/daemons",
    tag = "daemons",
    params(("id" = String, Path, description = "Server id")),
    responses((status = 200, description = "Supervised daemons", body = Vec<EntityPublic>))
)]
pub(crate) async fn list_daemons(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<EntityPublic>>, (StatusCode, String)> {
    let server = fetch_server(&state, &id).await?;
    let rows: Vec<EntityRow> = sqlx::query_as(
        r#"
        SELECT id, server_id, kind, name, config, status, error_log,
               install_steps, active_deployment_id, created_at, updated_at
        FROM entities
        WHERE server_id = $1 AND kind = $2
        ORDER BY created_at ASC
        "#,
    )
    .bind(server.id)
    .bind(EntityKind::Daemon.as_str())
    .fetch_all(&state.db)
    .await
    .map_err(map_db_error)?;
    Ok(Json(rows.iter().map(EntityRow::to_public).collect()))
}

#[utoipa::path(
    post,
    path = "/api/servers/{id}/daemons",
    tag = "daemons",
    request_body = CreateDaemonRequest,
    params(("id" = String, Path, description = "Server id")),
    responses(
        (status = 200, description = "Daemon install queued", body = EntityWithJob),
        (status = 400, description = "Invalid configuration"),
        (status = 409, description = "Daemon name taken")
    )
)]
pub(crate) async fn create_daemon(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(payload): Json<CreateDaemonRequest>,
) -> Result<Json<EntityWithJob>, (StatusCode, String)> {
    let server = fetch_server(&state, &id).await?;
    require_provisioned(&server.provision_status)?;
    crate::services::packages::validate_slug(&payload.name, "Daemon")
        .map_err(|err| (StatusCode::BAD_REQUEST, err.to_string()))?;

    let config = serde_json::json!({
        "command": payload.command,
        "directory": payload.directory,
        "user": payload.user,
        "autorestart": payload.autorestart,
        "numprocs": payload.numprocs,
    });
    let config = strip_nulls(config);
    serde_json::from_value::<DaemonConfig>(config.clone())
        .map_err(|err| (StatusCode::BAD_REQUEST, format!("Invalid configuration: {err}")))?;

    require_name_free(&state, server.id, EntityKind::Daemon, &payload.name).await?;

    let entity = insert_entity(&state, server.id, EntityKind::Daemon, &payload.name, config).await?;
    let job = enqueue_install(&state, &entity).await?;
    Ok(Json(EntityWithJob {
        entity: entity.to_public(),
        job: job.to_public(),
    }))
}

#[utoipa::path(
    delete,
    path = "/api/daemons/{id}",
    tag = "daemons",
    params(("id" = String, Path, description = "Daemon entity id")),
    responses(
        (status = 200, description = "Daemon removal queued", body = OrchestrationJobPublic),
        (status = 404, description = "Daemon not found"),
        (status = 409, description = "Daemon is not in a removable state")
    )
)]
pub(crate) async fn remove_daemon(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<OrchestrationJobPublic>, (StatusCode, String)> {
    let entity = fetch_entity(&state, &id).await?;
    if entity.entity_kind() != Some(EntityKind::Daemon) {
        return Err((StatusCode::NOT_FOUND, "Daemon not found".to_string()));
    }
    let job = enqueue_removal(&state, &entity).await?;
    Ok(Json(job.to_public()))
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/servers/{id}/daemons", get(list_daemons))
        .route("/servers/{id}/daemons", post(create_daemon))
        .route("/daemons/{id}", delete(remove_daemon))
}
