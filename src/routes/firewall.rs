use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde_json::Value as JsonValue;
use sqlx::types::Json as SqlJson;
use uuid::Uuid;

use crate::error::map_db_error;
use crate::services::packages::firewall::{FirewallConfig, FirewallRuleConfig};
use crate::services::orchestrator::types::{
    job_types, EntityKind, EntityPublic, EntityRow, OrchestrationJobPublic,
};
use crate::state::AppState;

use super::servers::fetch_server;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, serde::Deserialize, utoipa::ToSchema)]
pub(crate) struct CreateFirewallRequest {
    #[serde(default)]
    pub config: Option<JsonValue>,
}

#[derive(Debug, Clone, serde::Deserialize, utoipa::ToSchema)]
pub(crate) struct CreateFirewallRuleRequest {
    pub port: u16,
    #[serde(default)]
    pub protocol: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, serde::Serialize, utoipa::ToSchema)]
pub(crate) struct EntityWithJob {
    pub entity: EntityPublic,
    pub job: OrchestrationJobPublic,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

#[utoipa::path(
    get,
    path = "/api/servers/{id}/firewall",
    tag = "firewall",
    params(("id" = String, Path, description = "Server id")),
    responses(
        (status = 200, description = "Firewall entity", body = EntityPublic),
        (status = 404, description = "No firewall on this server")
    )
)]
pub(crate) async fn get_firewall(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<EntityPublic>, (StatusCode, String)> {
    let server = fetch_server(&state, &id).await?;
    let entity = find_kind_entity(&state, server.id, EntityKind::Firewall)
        .await?
        .ok_or((
            StatusCode::NOT_FOUND,
            "No firewall on this server".to_string(),
        ))?;
    Ok(Json(entity.to_public()))
}

#[utoipa::path(
    post,
    path = "/api/servers/{id}/firewall",
    tag = "firewall",
    request_body = CreateFirewallRequest,
    params(("id" = String, Path, description = "Server id")),
    responses(
        (status = 200, description = "Firewall install queued", body = EntityWithJob),
        (status = 400, description = "Invalid configuration"),
        (status = 404, description = "Server not found"),
        (status = 409, description = "Firewall already present")
    )
)]
pub(crate) async fn install_firewall(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(payload): Json<CreateFirewallRequest>,
) -> Result<Json<EntityWithJob>, (StatusCode, String)> {
    let server = fetch_server(&state, &id).await?;
    require_provisioned(&server.provision_status)?;
    let config = payload.config.unwrap_or_else(|| serde_json::json!({}));
    serde_json::from_value::<FirewallConfig>(config.clone())
        .map_err(|err| (StatusCode::BAD_REQUEST, format!("Invalid configuration: {err}")))?;

    if find_kind_entity(&state, server.id, EntityKind::Firewall)
        .await?
        .is_some()
    {
        return Err((
            StatusCode::CONFLICT,
            "Firewall already present on this server".to_string(),
        ));
    }

    let entity = insert_entity(&state, server.id, EntityKind::Firewall, "firewall", config).await?;
    let job = enqueue_install(&state, &entity).await?;
    Ok(Json(EntityWithJob {
        entity: entity.to_public(),
        job: job.to_public(),
    }))
}

#[utoipa::path(
    delete,
    path = "/api/servers/{id}/firewall",
    tag = "firewall",
    params(("id" = String, Path, description = "Server id")),
    responses(
        (status = 200, description = "Firewall removal queued", body = OrchestrationJobPublic),
        (status = 404, description = "No firewall on this server"),
        (status = 409, description = "Firewall is not in a removable state")
    )
)]
pub(crate) async fn remove_firewall(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<OrchestrationJobPublic>, (StatusCode, String)> {
    let server = fetch_server(&state, &id).await?;
    let entity = find_kind_entity(&state, server.id, EntityKind::Firewall)
        .await?
        .ok_or((
            StatusCode::NOT_FOUND,
            "No firewall on this server".to_string(),
        ))?;
    let job = enqueue_removal(&state, &entity).await?;
    Ok(Json(job.to_public()))
}

#[utoipa::path(
    get,
    path = "/api/servers/{id}/firewall/rules",
    tag = "firewall",
    params(("id" = String, Path, description = "Server id")),
    responses((status = 200, description = "Firewall rules", body = Vec<EntityPublic>))
)]
pub(crate) async fn list_firewall_rules(
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
    .bind(EntityKind::FirewallRule.as_str())
    .fetch_all(&state.db)
    .await
    .map_err(map_db_error)?;
    Ok(Json(rows.iter().map(EntityRow::to_public).collect()))
}

#[utoipa::path(
    post,
    path = "/api/servers/{id}/firewall/rules",
    tag = "firewall",
    request_body = CreateFirewallRuleRequest,
    params(("id" = String, Path, description = "Server id")),
    responses(
        (status = 200, description = "Rule install queued", body = EntityWithJob),
        (status = 400, description = "Invalid configuration"),
        (status = 404, description = "Server not found")
    )
)]
pub(crate) async fn create_firewall_rule(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(payload): Json<CreateFirewallRuleRequest>,
) -> Result<Json<EntityWithJob>, (StatusCode, String)> {
    let server = fetch_server(&state, &id).await?;
    require_provisioned(&server.provision_status)?;

    let protocol = payload.protocol.unwrap_or_else(|| "tcp".to_string());
    let config = serde_json::json!({
        "port": payload.port,
        "protocol": protocol,
        "source": payload.source,
    });
    serde_json::from_value::<FirewallRuleConfig>(config.clone())
        .map_err(|err| (StatusCode::BAD_REQUEST, format!("Invalid configuration: {err}")))?;
    let name = payload
        .name
        .unwrap_or_else(|| format!("rule-{}-{protocol}", payload.port));

    let entity =
        insert_entity(&state, server.id, EntityKind::FirewallRule, &name, config).await?;
    let job = enqueue_install(&state, &entity).await?;
    Ok(Json(EntityWithJob {
        entity: entity.to_public(),
        job: job.to_public(),
    }))
}

#[utoipa::path(
    delete,
    path = "/api/servers/{id}/firewall/rules/{rule_id}",
    tag = "firewall",
    params(
        ("id" = String, Path, description = "Server id"),
        ("rule_id" = String, Path, description = "Rule id")
    ),
    responses(
        (status = 200, description = "Rule removal queued", body = OrchestrationJobPublic),
        (status = 404, description = "Rule not found"),
        (status = 409, description = "Rule is not in a removable state")
    )
)]
pub(crate) async fn remove_firewall_rule(
    State(state): State<AppState>,
    Path((id, rule_id)): Path<(String, String)>,
) -> Result<Json<OrchestrationJobPublic>, (StatusCode, String)> {
    let server = fetch_server(&state, &id).await?;
    let entity = fetch_entity(&state, &rule_id).await?;
    if entity.server_id != server.id || entity.entity_kind() != Some(EntityKind::FirewallRule) {
        return Err((StatusCode::NOT_FOUND, "Rule not found".to_string()));
    }
    let job = enqueue_removal(&state, &entity).await?;
    Ok(Json(job.to_public()))
}

// ---------------------------------------------------------------------------
// Shared entity plumbing, used by every entity-backed resource route.
// ---------------------------------------------------------------------------

pub(crate) fn require_provisioned(provision_status: &str) -> Result<(), (StatusCode, String)> {
    if provision_status != "active" {
        return Err((
            StatusCode::CONFLICT,
            format!("Server is not provisioned ({provision_status})"),
        ));
    }
    Ok(())
}

pub(crate) async fn find_kind_entity(
    state: &AppState,
    server_id: Uuid,
    kind: EntityKind,
) -> Result<Option<EntityRow>, (StatusCode, String)> {
    sqlx::query_as(
        r#"
        SELECT id, server_id, kind, name, config, status, error_log,
               install_steps, active_deployment_id, created_at, updated_at
        FROM entities
        WHERE server_id = $1 AND kind = $2
        ORDER BY created_at DESC
        LIMIT 1
        "#,
    )
    .bind(server_id)
    .bind(kind.as_str())
    .fetch_optional(&state.db)
    .await
    .map_err(map_db_error)
}

pub(crate) async fn fetch_entity(
    state: &AppState,
    id: &str,
) -> Result<EntityRow, (StatusCode, String)> {
    let id = Uuid::parse_str(id.trim())
        .map_err(|_| (StatusCode::BAD_REQUEST, "Invalid ID format".to_string()))?;
    let entity: Option<EntityRow> = sqlx::query_as(
        r#"
        SELECT id, server_id, kind, name, config, status, error_log,
               install_steps, active_deployment_id, created_at, updated_at
        FROM entities
        WHERE id = $1
        LIMIT 1
        "#,
    )
    .bind(id)
    .fetch_optional(&state.db)
    .await
    .map_err(map_db_error)?;
    entity.ok_or((StatusCode::NOT_FOUND, "Entity not found".to_string()))
}

pub(crate) async fn insert_entity(
    state: &AppState,
    server_id: Uuid,
    kind: EntityKind,
    name: &str,
    config: JsonValue,
) -> Result<EntityRow, (StatusCode, String)> {
    sqlx::query_as(
        r#"
        INSERT INTO entities (id, server_id, kind, name, config)
        VALUES ($1, $2, $3, $4, $5)
        RETURNING id, server_id, kind, name, config, status, error_log,
                  install_steps, active_deployment_id, created_at, updated_at
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(server_id)
    .bind(kind.as_str())
    .bind(name)
    .bind(SqlJson(config))
    .fetch_one(&state.db)
    .await
    .map_err(map_db_error)
}

pub(crate) async fn enqueue_install(
    state: &AppState,
    entity: &EntityRow,
) -> Result<crate::services::orchestrator::types::OrchestrationJobRow, (StatusCode, String)> {
    let job = state
        .orchestrator
        .enqueue(
            job_types::INSTALL_ENTITY,
            entity.server_id,
            Some(entity.id),
            serde_json::json!({}),
        )
        .await
        .map_err(map_db_error)?;
    tracing::info!(entity_id = %entity.id, kind = %entity.kind, job_id = %job.id, "install queued");
    Ok(job)
}

/// Drops null members so serde defaults apply instead of failing on
/// explicit nulls for non-Option config fields.
pub(crate) fn strip_nulls(value: JsonValue) -> JsonValue {
    match value {
        JsonValue::Object(map) => {
            JsonValue::Object(map.into_iter().filter(|(_, v)| !v.is_null()).collect())
        }
        other => other,
    }
}

pub(crate) async fn require_name_free(
    state: &AppState,
    server_id: Uuid,
    kind: EntityKind,
    name: &str,
) -> Result<(), (StatusCode, String)> {
    let taken: Option<(Uuid,)> = sqlx::query_as(
        "SELECT id FROM entities WHERE server_id = $1 AND kind = $2 AND name = $3 LIMIT 1",
    )
    .bind(server_id)
    .bind(kind.as_str())
    .bind(name)
    .fetch_optional(&state.db)
    .await
    .map_err(map_db_error)?;
    if taken.is_some() {
        return Err((
            StatusCode::CONFLICT,
            format!("{name} already exists on this server"),
        ));
    }
    Ok(())
}

pub(crate) async fn enqueue_removal(
    state: &AppState,
    entity: &EntityRow,
) -> Result<crate::services::orchestrator::types::OrchestrationJobRow, (StatusCode, String)> {
    if !matches!(entity.status.as_str(), "active" | "failed") {
        return Err((
            StatusCode::CONFLICT,
            format!("{} is {}", entity.name, entity.status),
        ));
    }
    let job = state
        .orchestrator
        .enqueue(
            job_types::REMOVE_ENTITY,
            entity.server_id,
            Some(entity.id),
            serde_json::json!({}),
        )
        .await
        .map_err(map_db_error)?;
    tracing::info!(entity_id = %entity.id, kind = %entity.kind, job_id = %job.id, "removal queued");
    Ok(job)
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/servers/{id}/firewall", get(get_firewall))
        .route("/servers/{id}/firewall", post(install_firewall))
        .route("/servers/{id}/firewall", delete(remove_firewall))
        .route("/servers/{id}/firewall/rules", get(list_firewall_rules))
        .route("/servers/{id}/firewall/rules", post(create_firewall_rule))
        .route(
            "/servers/{id}/firewall/rules/{rule_id}",
            delete(remove_firewall_rule),
        )
}
