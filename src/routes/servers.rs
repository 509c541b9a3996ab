use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use uuid::Uuid;

use crate::error::map_db_error;
use crate::services::orchestrator::types::{
    job_types, OrchestrationJobPublic, ServerPublic, ServerRow,
};
use crate::state::AppState;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, serde::Deserialize, utoipa::ToSchema)]
pub(crate) struct CreateServerRequest {
    pub name: String,
    pub address: String,
    pub ssh_port: Option<u16>,
}

#[derive(Debug, Clone, serde::Serialize, utoipa::ToSchema)]
pub(crate) struct CreateServerResponse {
    pub server: ServerPublic,
    pub job: OrchestrationJobPublic,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

#[utoipa::path(
    get,
    path = "/api/servers",
    tag = "servers",
    responses((status = 200, description = "List servers", body = Vec<ServerPublic>))
)]
pub(crate) async fn list_servers(
    State(state): State<AppState>,
) -> Result<Json<Vec<ServerPublic>>, (StatusCode, String)> {
    let rows: Vec<ServerRow> = sqlx::query_as(
        r#"
        SELECT id, name, address, ssh_port, provision_status, monitor_status,
               services, error_log, created_at, updated_at
        FROM servers
        ORDER BY created_at DESC
        LIMIT 500
        "#,
    )
    .fetch_all(&state.db)
    .await
    .map_err(map_db_error)?;

    Ok(Json(rows.iter().map(ServerRow::to_public).collect()))
}

#[utoipa::path(
    get,
    path = "/api/servers/{id}",
    tag = "servers",
    params(("id" = String, Path, description = "Server id")),
    responses(
        (status = 200, description = "Server", body = ServerPublic),
        (status = 404, description = "Server not found")
    )
)]
pub(crate) async fn get_server(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ServerPublic>, (StatusCode, String)> {
    let server = fetch_server(&state, &id).await?;
    Ok(Json(server.to_public()))
}

#[utoipa::path(
    post,
    path = "/api/servers",
    tag = "servers",
    request_body = CreateServerRequest,
    responses(
        (status = 200, description = "Server registered, provisioning queued", body = CreateServerResponse),
        (status = 400, description = "Invalid request")
    )
)]
pub(crate) async fn create_server(
    State(state): State<AppState>,
    Json(payload): Json<CreateServerRequest>,
) -> Result<Json<CreateServerResponse>, (StatusCode, String)> {
    let name = payload.name.trim();
    let address = payload.address.trim();
    if name.is_empty() || name.len() > 100 {
        return Err((
            StatusCode::BAD_REQUEST,
            "Server name must be 1-100 characters".to_string(),
        ));
    }
    if address.is_empty() || address.chars().any(char::is_whitespace) {
        return Err((
            StatusCode::BAD_REQUEST,
            "Server address must be a hostname or IP".to_string(),
        ));
    }
    let ssh_port = i32::from(payload.ssh_port.unwrap_or(22));

    let server: ServerRow = sqlx::query_as(
        r#"
        INSERT INTO servers (id, name, address, ssh_port)
        VALUES ($1, $2, $3, $4)
        RETURNING id, name, address, ssh_port, provision_status, monitor_status,
                  services, error_log, created_at, updated_at
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(name)
    .bind(address)
    .bind(ssh_port)
    .fetch_one(&state.db)
    .await
    .map_err(map_db_error)?;

    let job = state
        .orchestrator
        .enqueue(
            job_types::PROVISION_SERVER,
            server.id,
            None,
            serde_json::json!({}),
        )
        .await
        .map_err(map_db_error)?;
    tracing::info!(server_id = %server.id, job_id = %job.id, "server registered, provisioning queued");

    Ok(Json(CreateServerResponse {
        server: server.to_public(),
        job: job.to_public(),
    }))
}

#[utoipa::path(
    post,
    path = "/api/servers/{id}/provision",
    tag = "servers",
    params(("id" = String, Path, description = "Server id")),
    responses(
        (status = 200, description = "Provisioning queued", body = OrchestrationJobPublic),
        (status = 404, description = "Server not found"),
        (status = 409, description = "Server is not in a provisionable state")
    )
)]
pub(crate) async fn provision_server(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<OrchestrationJobPublic>, (StatusCode, String)> {
    let server = fetch_server(&state, &id).await?;
    if !matches!(server.provision_status.as_str(), "pending" | "failed") {
        return Err((
            StatusCode::CONFLICT,
            format!("Server is {}", server.provision_status),
        ));
    }

    let job = state
        .orchestrator
        .enqueue(
            job_types::PROVISION_SERVER,
            server.id,
            None,
            serde_json::json!({}),
        )
        .await
        .map_err(map_db_error)?;
    Ok(Json(job.to_public()))
}

#[utoipa::path(
    post,
    path = "/api/servers/{id}/monitoring",
    tag = "servers",
    params(("id" = String, Path, description = "Server id")),
    responses(
        (status = 200, description = "Monitoring install queued", body = OrchestrationJobPublic),
        (status = 404, description = "Server not found"),
        (status = 409, description = "Monitoring already present or in flight")
    )
)]
pub(crate) async fn install_monitoring(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<OrchestrationJobPublic>, (StatusCode, String)> {
    let server = fetch_server(&state, &id).await?;
    if matches!(
        server.monitor_status.as_str(),
        "enabled" | "installing" | "removing"
    ) {
        return Err((
            StatusCode::CONFLICT,
            format!("Monitoring is {}", server.monitor_status),
        ));
    }

    let job = state
        .orchestrator
        .enqueue(
            job_types::INSTALL_MONITOR,
            server.id,
            None,
            serde_json::json!({}),
        )
        .await
        .map_err(map_db_error)?;
    Ok(Json(job.to_public()))
}

#[utoipa::path(
    delete,
    path = "/api/servers/{id}/monitoring",
    tag = "servers",
    params(("id" = String, Path, description = "Server id")),
    responses(
        (status = 200, description = "Monitoring removal queued", body = OrchestrationJobPublic),
        (status = 404, description = "Server not found"),
        (status = 409, description = "No monitoring to remove")
    )
)]
pub(crate) async fn remove_monitoring(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<OrchestrationJobPublic>, (StatusCode, String)> {
    let server = fetch_server(&state, &id).await?;
    if matches!(server.monitor_status.as_str(), "none" | "removing") {
        return Err((
            StatusCode::CONFLICT,
            format!("Monitoring is {}", server.monitor_status),
        ));
    }

    let job = state
        .orchestrator
        .enqueue(
            job_types::REMOVE_MONITOR,
            server.id,
            None,
            serde_json::json!({}),
        )
        .await
        .map_err(map_db_error)?;
    Ok(Json(job.to_public()))
}

pub(crate) async fn fetch_server(
    state: &AppState,
    id: &str,
) -> Result<ServerRow, (StatusCode, String)> {
    let id = Uuid::parse_str(id.trim())
        .map_err(|_| (StatusCode::BAD_REQUEST, "Invalid ID format".to_string()))?;
    let server: Option<ServerRow> = sqlx::query_as(
        r#"
        SELECT id, name, address, ssh_port, provision_status, monitor_status,
               services, error_log, created_at, updated_at
        FROM servers
        WHERE id = $1
        LIMIT 1
        "#,
    )
    .bind(id)
    .fetch_optional(&state.db)
    .await
    .map_err(map_db_error)?;
    server.ok_or((StatusCode::NOT_FOUND, "Server not found".to_string()))
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/servers", get(list_servers))
        .route("/servers", post(create_server))
        .route("/servers/{id}", get(get_server))
        .route("/servers/{id}/provision", post(provision_server))
        .route("/servers/{id}/monitoring", post(install_monitoring))
        .route("/servers/{id}/monitoring", delete(remove_monitoring))
}
