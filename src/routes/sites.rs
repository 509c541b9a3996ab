use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{delete, get, post};
use axum::{Json, Router};

use crate::error::map_db_error;
use crate::services::orchestrator::types::{EntityKind, EntityPublic, EntityRow, OrchestrationJobPublic};
use crate::services::packages::{frameworks, site};
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
pub(crate) struct CreateSiteRequest {
    pub domain: String,
    #[serde(default)]
    pub framework: Option<String>,
    #[serde(default)]
    pub php_version: Option<String>,
    #[serde(default)]
    pub repo_url: Option<String>,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

#[utoipa::path(
    get,
    path = "/api/servers/{id}/sites",
    tag = "sites",
    params(("id" = String, Path, description = "Server id")),
    responses((status = 200, description = "Hosted sites", body = Vec<EntityPublic>))
)]
pub(crate) async fn list_sites(
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
    .bind(EntityKind::Site.as_str())
    .fetch_all(&state.db)
    .await
    .map_err(map_db_error)?;
    Ok(Json(rows.iter().map(EntityRow::to_public).collect()))
}

#[utoipa::path(
    post,
    path = "/api/servers/{id}/sites",
    tag = "sites",
    request_body = CreateSiteRequest,
    params(("id" = String, Path, description = "Server id")),
    responses(
        (status = 200, description = "Site install queued", body = EntityWithJob),
        (status = 400, description = "Invalid configuration"),
        (status = 409, description = "Missing web stack or domain taken")
    )
)]
pub(crate) async fn create_site(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(payload): Json<CreateSiteRequest>,
) -> Result<Json<EntityWithJob>, (StatusCode, String)> {
    let server = fetch_server(&state, &id).await?;
    require_provisioned(&server.provision_status)?;
    site::validate_domain(&payload.domain)
        .map_err(|err| (StatusCode::BAD_REQUEST, err.to_string()))?;

    let framework = payload.framework.unwrap_or_else(|| "static".to_string());
    let installer = frameworks::resolve(&framework).ok_or((
        StatusCode::BAD_REQUEST,
        format!("Unsupported framework {framework:?}"),
    ))?;
    let needs_php = installer.public_path() != "current";
    if needs_php && payload.php_version.is_none() {
        return Err((
            StatusCode::BAD_REQUEST,
            format!("Framework {framework:?} requires php_version"),
        ));
    }

    let nginx = find_kind_entity(&state, server.id, EntityKind::Nginx).await?;
    if !nginx.is_some_and(|e| e.status == "active") {
        return Err((
            StatusCode::CONFLICT,
            "No active web server on this server".to_string(),
        ));
    }
    if needs_php {
        let php = find_kind_entity(&state, server.id, EntityKind::Php).await?;
        if !php.is_some_and(|e| e.status == "active") {
            return Err((
                StatusCode::CONFLICT,
                "No active PHP runtime on this server".to_string(),
            ));
        }
    }

    let config = strip_nulls(serde_json::json!({
        "domain": payload.domain,
        "framework": framework,
        "php_version": payload.php_version,
        "repo_url": payload.repo_url,
    }));
    serde_json::from_value::<site::SiteConfig>(config.clone())
        .map_err(|err| (StatusCode::BAD_REQUEST, format!("Invalid configuration: {err}")))?;

    require_name_free(&state, server.id, EntityKind::Site, &payload.domain).await?;

    let entity =
        insert_entity(&state, server.id, EntityKind::Site, &payload.domain, config).await?;
    let job = enqueue_install(&state, &entity).await?;
    Ok(Json(EntityWithJob {
        entity: entity.to_public(),
        job: job.to_public(),
    }))
}

#[utoipa::path(
    delete,
    path = "/api/sites/{id}",
    tag = "sites",
    params(("id" = String, Path, description = "Site entity id")),
    responses(
        (status = 200, description = "Site removal queued", body = OrchestrationJobPublic),
        (status = 404, description = "Site not found"),
        (status = 409, description = "Site is not in a removable state")
    )
)]
pub(crate) async fn remove_site(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<OrchestrationJobPublic>, (StatusCode, String)> {
    let entity = fetch_entity(&state, &id).await?;
    if entity.entity_kind() != Some(EntityKind::Site) {
        return Err((StatusCode::NOT_FOUND, "Site not found".to_string()));
    }
    let job = enqueue_removal(&state, &entity).await?;
    Ok(Json(job.to_public()))
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/servers/{id}/sites", get(list_sites))
        .route("/servers/{id}/sites", post(create_site))
        .route("/sites/{id}", delete(remove_site))
}
