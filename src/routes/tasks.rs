use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{delete, get, post};
use axum::{Json, Router};

use crate::error::map_db_error;
use crate::services::orchestrator::types::{EntityKind, EntityPublic, EntityRow, OrchestrationJobPublic};
use crate::services::packages::cron::CronConfig;
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
pub(crate) struct CreateTaskRequest {
    pub name: String,
    pub schedule: String,
    pub command: String,
    #[serde(default)]
    pub user: Option<String>,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

#[utoipa::path(
    get,
    path = "/api/servers/{id}/tasks",
    tag = "tasks",
    params(("id" = String, Path, description = "Server id")),
    responses((status = 200, description = "Scheduled tasks", body = Vec<EntityPublic>))
)]
pub(crate) async fn list_tasks(
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
    .bind(EntityKind::ScheduledTask.as_str())
    .fetch_all(&state.db)
    .await
    .map_err(map_db_error)?;
    Ok(Json(rows.iter().map(EntityRow::to_public).collect()))
}

#[utoipa::path(
    post,
    path = "/api/servers/{id}/tasks",
    tag = "tasks",
    request_body = CreateTaskRequest,
    params(("id" = String, Path, description = "Server id")),
    responses(
        (status = 200, description = "Task install queued", body = EntityWithJob),
        (status = 400, description = "Invalid configuration"),
        (status = 409, description = "Task name taken")
    )
)]
pub(crate) async fn create_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(payload): Json<CreateTaskRequest>,
) -> Result<Json<EntityWithJob>, (StatusCode, String)> {
    let server = fetch_server(&state, &id).await?;
    require_provisioned(&server.provision_status)?;
    crate::services::packages::validate_slug(&payload.name, "Task")
        .map_err(|err| (StatusCode::BAD_REQUEST, err.to_string()))?;

    let config = strip_nulls(serde_json::json!({
        "schedule": payload.schedule,
        "command": payload.command,
        "user": payload.user,
    }));
    serde_json::from_value::<CronConfig>(config.clone())
        .map_err(|err| (StatusCode::BAD_REQUEST, format!("Invalid configuration: {err}")))?;

    require_name_free(&state, server.id, EntityKind::ScheduledTask, &payload.name).await?;

    let entity = insert_entity(
        &state,
        server.id,
        EntityKind::ScheduledTask,
        &payload.name,
        config,
    )
    .await?;
    let job = enqueue_install(&state, &entity).await?;
    Ok(Json(EntityWithJob {
        entity: entity.to_public(),
        job: job.to_public(),
    }))
}

#[utoipa::path(
    delete,
    path = "/api/tasks/{id}",
    tag = "tasks",
    params(("id" = String, Path, description = "Task entity id")),
    responses(
        (status = 200, description = "Task removal queued", body = OrchestrationJobPublic),
        (status = 404, description = "Task not found"),
        (status = 409, description = "Task is not in a removable state")
    )
)]
pub(crate) async fn remove_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<OrchestrationJobPublic>, (StatusCode, String)> {
    let entity = fetch_entity(&state, &id).await?;
    if entity.entity_kind() != Some(EntityKind::ScheduledTask) {
        return Err((StatusCode::NOT_FOUND, "Task not found".to_string()));
    }
    let job = enqueue_removal(&state, &entity).await?;
    Ok(Json(job.to_public()))
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/servers/{id}/tasks", get(list_tasks))
        .route("/servers/{id}/tasks", post(create_task))
        .route("/tasks/{id}", delete(remove_task))
}
