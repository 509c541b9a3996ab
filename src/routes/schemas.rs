use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{delete, get, post};
use axum::{Json, Router};

use crate::error::map_db_error;
use crate::services::orchestrator::types::{EntityKind, EntityPublic, EntityRow, OrchestrationJobPublic};
use crate::services::packages::database::SchemaConfig;
use crate::state::AppState;

use super::firewall::{
    enqueue_install, enqueue_removal, fetch_entity, find_kind_entity, insert_entity,
    require_name_free, require_provisioned, strip_nulls, EntityWithJob,
};
use super::servers::fetch_server;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, serde::Deserialize, utoipa::ToSchema)]
pub(crate) struct CreateSchemaRequest {
    pub name: String,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub host: Option<String>,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

#[utoipa::path(
    get,
    path = "/api/servers/{id}/schemas",
    tag = "schemas",
    params(("id" = String, Path, description = "Server id")),
    responses((status = 200, description = "Database schemas", body = Vec<EntityPublic>))
)]
pub(crate) async fn list_schemas(
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
    .bind(EntityKind::DatabaseSchema.as_str())
    .fetch_all(&state.db)
    .await
    .map_err(map_db_error)?;
    Ok(Json(rows.iter().map(EntityRow::to_public).collect()))
}

#[utoipa::path(
    post,
    path = "/api/servers/{id}/schemas",
    tag = "schemas",
    request_body = CreateSchemaRequest,
    params(("id" = String, Path, description = "Server id")),
    responses(
        (status = 200, description = "Schema creation queued", body = EntityWithJob),
        (status = 400, description = "Invalid configuration"),
        (status = 409, description = "No active database engine, or schema name taken")
    )
)]
pub(crate) async fn create_schema(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(payload): Json<CreateSchemaRequest>,
) -> Result<Json<EntityWithJob>, (StatusCode, String)> {
    let server = fetch_server(&state, &id).await?;
    require_provisioned(&server.provision_status)?;
    crate::services::packages::validate_slug(&payload.name, "Schema")
        .map_err(|err| (StatusCode::BAD_REQUEST, err.to_string()))?;

    let engine = find_kind_entity(&state, server.id, EntityKind::Database).await?;
    if !engine.is_some_and(|e| e.status == "active") {
        return Err((
            StatusCode::CONFLICT,
            "No active database engine on this server".to_string(),
        ));
    }

    let config = strip_nulls(serde_json::json!({
        "user": payload.user,
        "password": payload.password,
        "host": payload.host,
    }));
    serde_json::from_value::<SchemaConfig>(config.clone())
        .map_err(|err| (StatusCode::BAD_REQUEST, format!("Invalid configuration: {err}")))?;

    require_name_free(&state, server.id, EntityKind::DatabaseSchema, &payload.name).await?;

    let entity = insert_entity(
        &state,
        server.id,
        EntityKind::DatabaseSchema,
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
    path = "/api/schemas/{id}",
    tag = "schemas",
    params(("id" = String, Path, description = "Schema entity id")),
    responses(
        (status = 200, description = "Schema drop queued", body = OrchestrationJobPublic),
        (status = 404, description = "Schema not found"),
        (status = 409, description = "Schema is not in a removable state")
    )
)]
pub(crate) async fn remove_schema(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<OrchestrationJobPublic>, (StatusCode, String)> {
    let entity = fetch_entity(&state, &id).await?;
    if entity.entity_kind() != Some(EntityKind::DatabaseSchema) {
        return Err((StatusCode::NOT_FOUND, "Schema not found".to_string()));
    }
    let job = enqueue_removal(&state, &entity).await?;
    Ok(Json(job.to_public()))
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/servers/{id}/schemas", get(list_schemas))
        .route("/servers/{id}/schemas", post(create_schema))
        .route("/schemas/{id}", delete(remove_schema))
}
