use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde_json::Value as JsonValue;

use crate::services::orchestrator::types::{EntityKind, EntityPublic, OrchestrationJobPublic};
use crate::services::packages::{database::DatabaseConfig, nginx::NginxConfig, php::PhpConfig};
use crate::state::AppState;

use super::firewall::{
    enqueue_install, enqueue_removal, find_kind_entity, insert_entity, require_provisioned,
    EntityWithJob,
};
use super::servers::fetch_server;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, serde::Deserialize, utoipa::ToSchema)]
pub(crate) struct CreateEngineRequest {
    #[serde(default)]
    pub config: Option<JsonValue>,
}

// ---------------------------------------------------------------------------
// Shared engine plumbing
// ---------------------------------------------------------------------------

async fn get_engine(
    state: &AppState,
    server_id: &str,
    kind: EntityKind,
    label: &str,
) -> Result<Json<EntityPublic>, (StatusCode, String)> {
    let server = fetch_server(state, server_id).await?;
    let entity = find_kind_entity(state, server.id, kind)
        .await?
        .ok_or((StatusCode::NOT_FOUND, format!("No {label} on this server")))?;
    Ok(Json(entity.to_public()))
}

async fn install_engine(
    state: &AppState,
    server_id: &str,
    kind: EntityKind,
    label: &str,
    config: JsonValue,
) -> Result<Json<EntityWithJob>, (StatusCode, String)> {
    let server = fetch_server(state, server_id).await?;
    require_provisioned(&server.provision_status)?;
    if find_kind_entity(state, server.id, kind).await?.is_some() {
        return Err((
            StatusCode::CONFLICT,
            format!("{label} already configured on this server"),
        ));
    }
    let entity = insert_entity(state, server.id, kind, kind.as_str(), config).await?;
    let job = enqueue_install(state, &entity).await?;
    Ok(Json(EntityWithJob {
        entity: entity.to_public(),
        job: job.to_public(),
    }))
}

async fn remove_engine(
    state: &AppState,
    server_id: &str,
    kind: EntityKind,
    label: &str,
) -> Result<Json<OrchestrationJobPublic>, (StatusCode, String)> {
    let server = fetch_server(state, server_id).await?;
    let entity = find_kind_entity(state, server.id, kind)
        .await?
        .ok_or((StatusCode::NOT_FOUND, format!("No {label} on this server")))?;
    let job = enqueue_removal(state, &entity).await?;
    Ok(Json(job.to_public()))
}

fn validate_config<T: serde::de::DeserializeOwned>(
    config: &Option<JsonValue>,
) -> Result<JsonValue, (StatusCode, String)> {
    let value = config.clone().unwrap_or_else(|| serde_json::json!({}));
    serde_json::from_value::<T>(value.clone())
        .map_err(|err| (StatusCode::BAD_REQUEST, format!("Invalid configuration: {err}")))?;
    Ok(value)
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

#[utoipa::path(
    get,
    path = "/api/servers/{id}/nginx",
    tag = "engines",
    params(("id" = String, Path, description = "Server id")),
    responses(
        (status = 200, description = "Web server entity", body = EntityPublic),
        (status = 404, description = "No web server on this server")
    )
)]
pub(crate) async fn get_nginx(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<EntityPublic>, (StatusCode, String)> {
    get_engine(&state, &id, EntityKind::Nginx, "web server").await
}

#[utoipa::path(
    post,
    path = "/api/servers/{id}/nginx",
    tag = "engines",
    request_body = CreateEngineRequest,
    params(("id" = String, Path, description = "Server id")),
    responses(
        (status = 200, description = "Web server install queued", body = EntityWithJob),
        (status = 409, description = "Web server already configured")
    )
)]
pub(crate) async fn install_nginx(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(payload): Json<CreateEngineRequest>,
) -> Result<Json<EntityWithJob>, (StatusCode, String)> {
    let config = validate_config::<NginxConfig>(&payload.config)?;
    install_engine(&state, &id, EntityKind::Nginx, "Web server", config).await
}

#[utoipa::path(
    delete,
    path = "/api/servers/{id}/nginx",
    tag = "engines",
    params(("id" = String, Path, description = "Server id")),
    responses(
        (status = 200, description = "Web server removal queued", body = OrchestrationJobPublic),
        (status = 404, description = "No web server on this server"),
        (status = 409, description = "Web server still hosts sites")
    )
)]
pub(crate) async fn remove_nginx(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<OrchestrationJobPublic>, (StatusCode, String)> {
    let server = fetch_server(&state, &id).await?;
    // Site removal reloads nginx, so the engine has to outlive its sites.
    let sites = count_kind(&state, server.id, EntityKind::Site).await?;
    if sites > 0 {
        return Err((
            StatusCode::CONFLICT,
            "Web server still hosts sites; remove them first".to_string(),
        ));
    }
    remove_engine(&state, &id, EntityKind::Nginx, "web server").await
}

#[utoipa::path(
    get,
    path = "/api/servers/{id}/php",
    tag = "engines",
    params(("id" = String, Path, description = "Server id")),
    responses(
        (status = 200, description = "PHP runtime entity", body = EntityPublic),
        (status = 404, description = "No PHP runtime on this server")
    )
)]
pub(crate) async fn get_php(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<EntityPublic>, (StatusCode, String)> {
    get_engine(&state, &id, EntityKind::Php, "PHP runtime").await
}

#[utoipa::path(
    post,
    path = "/api/servers/{id}/php",
    tag = "engines",
    request_body = CreateEngineRequest,
    params(("id" = String, Path, description = "Server id")),
    responses(
        (status = 200, description = "PHP install queued", body = EntityWithJob),
        (status = 409, description = "PHP already configured")
    )
)]
pub(crate) async fn install_php(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(payload): Json<CreateEngineRequest>,
) -> Result<Json<EntityWithJob>, (StatusCode, String)> {
    let config = validate_config::<PhpConfig>(&payload.config)?;
    install_engine(&state, &id, EntityKind::Php, "PHP runtime", config).await
}

#[utoipa::path(
    delete,
    path = "/api/servers/{id}/php",
    tag = "engines",
    params(("id" = String, Path, description = "Server id")),
    responses(
        (status = 200, description = "PHP removal queued", body = OrchestrationJobPublic),
        (status = 404, description = "No PHP runtime on this server")
    )
)]
pub(crate) async fn remove_php(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<OrchestrationJobPublic>, (StatusCode, String)> {
    remove_engine(&state, &id, EntityKind::Php, "PHP runtime").await
}

#[utoipa::path(
    get,
    path = "/api/servers/{id}/database",
    tag = "engines",
    params(("id" = String, Path, description = "Server id")),
    responses(
        (status = 200, description = "Database engine entity", body = EntityPublic),
        (status = 404, description = "No database engine on this server")
    )
)]
pub(crate) async fn get_database(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<EntityPublic>, (StatusCode, String)> {
    get_engine(&state, &id, EntityKind::Database, "database engine").await
}

#[utoipa::path(
    post,
    path = "/api/servers/{id}/database",
    tag = "engines",
    request_body = CreateEngineRequest,
    params(("id" = String, Path, description = "Server id")),
    responses(
        (status = 200, description = "Database install queued", body = EntityWithJob),
        (status = 409, description = "Database already configured")
    )
)]
pub(crate) async fn install_database(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(payload): Json<CreateEngineRequest>,
) -> Result<Json<EntityWithJob>, (StatusCode, String)> {
    let config = validate_config::<DatabaseConfig>(&payload.config)?;
    install_engine(&state, &id, EntityKind::Database, "Database engine", config).await
}

#[utoipa::path(
    delete,
    path = "/api/servers/{id}/database",
    tag = "engines",
    params(("id" = String, Path, description = "Server id")),
    responses(
        (status = 200, description = "Database removal queued", body = OrchestrationJobPublic),
        (status = 404, description = "No database engine on this server"),
        (status = 409, description = "Database engine still has schemas")
    )
)]
pub(crate) async fn remove_database(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<OrchestrationJobPublic>, (StatusCode, String)> {
    let server = fetch_server(&state, &id).await?;
    // Dropping a schema talks to the running engine, so schemas go first.
    let schemas = count_kind(&state, server.id, EntityKind::DatabaseSchema).await?;
    if schemas > 0 {
        return Err((
            StatusCode::CONFLICT,
            "Database engine still has schemas; remove them first".to_string(),
        ));
    }
    remove_engine(&state, &id, EntityKind::Database, "database engine").await
}

async fn count_kind(
    state: &AppState,
    server_id: uuid::Uuid,
    kind: EntityKind,
) -> Result<i64, (StatusCode, String)> {
    sqlx::query_scalar("SELECT COUNT(*) FROM entities WHERE server_id = $1 AND kind = $2")
        .bind(server_id)
        .bind(kind.as_str())
        .fetch_one(&state.db)
        .await
        .map_err(crate::error::map_db_error)
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/servers/{id}/nginx", get(get_nginx))
        .route("/servers/{id}/nginx", post(install_nginx))
        .route("/servers/{id}/nginx", delete(remove_nginx))
        .route("/servers/{id}/php", get(get_php))
        .route("/servers/{id}/php", post(install_php))
        .route("/servers/{id}/php", delete(remove_php))
        .route("/servers/{id}/database", get(get_database))
        .route("/servers/{id}/database", post(install_database))
        .route("/servers/{id}/database", delete(remove_database))
}
