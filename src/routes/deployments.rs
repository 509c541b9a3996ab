use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::map_db_error;
use crate::services::orchestrator::types::{
    job_types, DeploymentPublic, DeploymentRow, EntityKind, EntityRow, OrchestrationJobPublic,
};
use crate::state::AppState;

use super::firewall::fetch_entity;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, serde::Deserialize, utoipa::ToSchema)]
pub(crate) struct CreateDeploymentRequest {
    pub script: String,
}

#[derive(Debug, Clone, serde::Serialize, utoipa::ToSchema)]
pub(crate) struct DeploymentWithJob {
    pub deployment: DeploymentPublic,
    pub job: OrchestrationJobPublic,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

#[utoipa::path(
    get,
    path = "/api/sites/{id}/deployments",
    tag = "deployments",
    params(("id" = String, Path, description = "Site entity id")),
    responses(
        (status = 200, description = "Deployments, newest first", body = Vec<DeploymentPublic>),
        (status = 404, description = "Site not found")
    )
)]
pub(crate) async fn list_deployments(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<DeploymentPublic>>, (StatusCode, String)> {
    let site = fetch_site(&state, &id).await?;
    let rows: Vec<DeploymentRow> = sqlx::query_as(
        r#"
        SELECT id, site_id, server_id, status, script, output, exit_code,
               commit_sha, release_path, started_at, finished_at, created_at
        FROM deployments
        WHERE site_id = $1
        ORDER BY created_at DESC
        LIMIT 500
        "#,
    )
    .bind(site.id)
    .fetch_all(&state.db)
    .await
    .map_err(map_db_error)?;
    Ok(Json(rows.iter().map(DeploymentRow::to_public).collect()))
}

#[utoipa::path(
    post,
    path = "/api/sites/{id}/deployments",
    tag = "deployments",
    request_body = CreateDeploymentRequest,
    params(("id" = String, Path, description = "Site entity id")),
    responses(
        (status = 200, description = "Deployment queued", body = DeploymentWithJob),
        (status = 404, description = "Site not found"),
        (status = 409, description = "Site is not active")
    )
)]
pub(crate) async fn create_deployment(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(payload): Json<CreateDeploymentRequest>,
) -> Result<Json<DeploymentWithJob>, (StatusCode, String)> {
    let site = fetch_site(&state, &id).await?;
    if site.status != "active" {
        return Err((
            StatusCode::CONFLICT,
            format!("Site {} is {}", site.name, site.status),
        ));
    }

    let deployment: DeploymentRow = sqlx::query_as(
        r#"
        INSERT INTO deployments (id, site_id, server_id, script)
        VALUES ($1, $2, $3, $4)
        RETURNING id, site_id, server_id, status, script, output, exit_code,
                  commit_sha, release_path, started_at, finished_at, created_at
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(site.id)
    .bind(site.server_id)
    .bind(&payload.script)
    .fetch_one(&state.db)
    .await
    .map_err(map_db_error)?;

    // The digest travels with the job so the run that executes the script can
    // be matched to the exact script text that was submitted.
    let script_sha256 = format!("{:x}", Sha256::digest(payload.script.as_bytes()));
    let job = state
        .orchestrator
        .enqueue(
            job_types::RUN_DEPLOYMENT,
            site.server_id,
            Some(site.id),
            serde_json::json!({
                "deployment_id": deployment.id.to_string(),
                "script_sha256": script_sha256,
            }),
        )
        .await
        .map_err(map_db_error)?;
    tracing::info!(
        site_id = %site.id,
        deployment_id = %deployment.id,
        job_id = %job.id,
        script_sha256 = %script_sha256,
        "deployment queued"
    );
    Ok(Json(DeploymentWithJob {
        deployment: deployment.to_public(),
        job: job.to_public(),
    }))
}

#[utoipa::path(
    get,
    path = "/api/sites/{id}/deployments/active",
    tag = "deployments",
    params(("id" = String, Path, description = "Site entity id")),
    responses(
        (status = 200, description = "Deployment currently serving traffic", body = DeploymentPublic),
        (status = 404, description = "Site not found or nothing deployed yet")
    )
)]
pub(crate) async fn get_active_deployment(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<DeploymentPublic>, (StatusCode, String)> {
    let site = fetch_site(&state, &id).await?;
    let active_id = site.active_deployment_id.ok_or((
        StatusCode::NOT_FOUND,
        "Nothing deployed yet".to_string(),
    ))?;
    let deployment = fetch_deployment(&state, active_id).await?;
    Ok(Json(deployment.to_public()))
}

#[utoipa::path(
    post,
    path = "/api/sites/{id}/deployments/{deployment_id}/rollback",
    tag = "deployments",
    params(
        ("id" = String, Path, description = "Site entity id"),
        ("deployment_id" = String, Path, description = "Deployment to restore")
    ),
    responses(
        (status = 200, description = "Rollback queued", body = OrchestrationJobPublic),
        (status = 404, description = "Site or deployment not found"),
        (status = 409, description = "Deployment cannot be restored")
    )
)]
pub(crate) async fn rollback_deployment(
    State(state): State<AppState>,
    Path((site_id, deployment_id)): Path<(String, String)>,
) -> Result<Json<OrchestrationJobPublic>, (StatusCode, String)> {
    let site = fetch_site(&state, &site_id).await?;
    let deployment_id = Uuid::parse_str(deployment_id.trim())
        .map_err(|_| (StatusCode::BAD_REQUEST, "Invalid ID format".to_string()))?;
    let target = fetch_deployment(&state, deployment_id).await?;
    if target.site_id != site.id {
        return Err((StatusCode::NOT_FOUND, "Deployment not found".to_string()));
    }
    if target.status != "success" || target.release_path.is_none() {
        return Err((
            StatusCode::CONFLICT,
            format!("Deployment {} never went live", target.id),
        ));
    }

    let job = state
        .orchestrator
        .enqueue(
            job_types::ROLLBACK_DEPLOYMENT,
            site.server_id,
            Some(site.id),
            serde_json::json!({ "deployment_id": target.id.to_string() }),
        )
        .await
        .map_err(map_db_error)?;
    tracing::info!(
        site_id = %site.id,
        deployment_id = %target.id,
        job_id = %job.id,
        "rollback queued"
    );
    Ok(Json(job.to_public()))
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

async fn fetch_site(state: &AppState, id: &str) -> Result<EntityRow, (StatusCode, String)> {
    let entity = fetch_entity(state, id).await?;
    if entity.entity_kind() != Some(EntityKind::Site) {
        return Err((StatusCode::NOT_FOUND, "Site not found".to_string()));
    }
    Ok(entity)
}

async fn fetch_deployment(
    state: &AppState,
    id: Uuid,
) -> Result<DeploymentRow, (StatusCode, String)> {
    let row: Option<DeploymentRow> = sqlx::query_as(
        r#"
        SELECT id, site_id, server_id, status, script, output, exit_code,
               commit_sha, release_path, started_at, finished_at, created_at
        FROM deployments
        WHERE id = $1
        LIMIT 1
        "#,
    )
    .bind(id)
    .fetch_optional(&state.db)
    .await
    .map_err(map_db_error)?;
    row.ok_or((StatusCode::NOT_FOUND, "Deployment not found".to_string()))
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/sites/{id}/deployments", get(list_deployments))
        .route("/sites/{id}/deployments", post(create_deployment))
        .route("/sites/{id}/deployments/active", get(get_active_deployment))
        .route(
            "/sites/{id}/deployments/{deployment_id}/rollback",
            post(rollback_deployment),
        )
}
