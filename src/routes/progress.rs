use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};

use crate::error::map_db_error;
use crate::services::orchestrator::status::{self, ProgressView, RunPhase};
use crate::services::orchestrator::store;
use crate::services::orchestrator::types::{ActionKind, EntityKind, EntityRow};
use crate::services::packages::{self, frameworks, site};
use crate::state::AppState;

use super::firewall::fetch_entity;
use super::servers::fetch_server;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, serde::Serialize, utoipa::ToSchema)]
pub(crate) struct ServerProgressResponse {
    pub server_id: String,
    pub provision_status: String,
    pub monitor_status: String,
    pub run: ProgressView,
}

#[derive(Debug, Clone, serde::Serialize, utoipa::ToSchema)]
pub(crate) struct EntityProgressResponse {
    pub entity_id: String,
    pub kind: String,
    pub name: String,
    pub status: String,
    pub run: ProgressView,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub framework_steps: Option<Vec<FrameworkStepView>>,
}

#[derive(Debug, Clone, serde::Serialize, utoipa::ToSchema)]
pub(crate) struct FrameworkStepView {
    pub position: u32,
    pub title: String,
    pub status: String,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

#[utoipa::path(
    get,
    path = "/api/servers/{id}/progress",
    tag = "progress",
    params(("id" = String, Path, description = "Server id")),
    responses(
        (status = 200, description = "Latest server-level run", body = ServerProgressResponse),
        (status = 404, description = "Server not found")
    )
)]
pub(crate) async fn server_progress(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ServerProgressResponse>, (StatusCode, String)> {
    let server = fetch_server(&state, &id).await?;
    let run_id = store::latest_run_id(&state.db, server.id, None)
        .await
        .map_err(map_db_error)?;

    let run = match run_id {
        Some(run_id) => {
            let events = store::list_run_events(&state.db, run_id)
                .await
                .map_err(map_db_error)?;
            let action = events
                .first()
                .and_then(|event| ActionKind::parse(&event.action_kind))
                .unwrap_or(ActionKind::Provision);
            let phase = if action == ActionKind::Provision {
                RunPhase::from_server_status(&server.provision_status)
            } else {
                RunPhase::from_server_status(&server.monitor_status)
            };
            let ledger = packages::server_ledger(action);
            ProgressView {
                run_id: Some(run_id),
                action_kind: Some(action.as_str().to_string()),
                percent: status::percent_complete(ledger, &events),
                milestones: status::annotate(ledger, &events, phase),
            }
        }
        None => {
            // Nothing recorded yet, so the projection shows the provisioning
            // ledger that the first run will report against.
            let ledger = packages::server_ledger(ActionKind::Provision);
            let phase = RunPhase::from_server_status(&server.provision_status);
            ProgressView {
                run_id: None,
                action_kind: None,
                percent: 0,
                milestones: status::annotate(ledger, &[], phase),
            }
        }
    };

    Ok(Json(ServerProgressResponse {
        server_id: server.id.to_string(),
        provision_status: server.provision_status,
        monitor_status: server.monitor_status,
        run,
    }))
}

#[utoipa::path(
    get,
    path = "/api/entities/{id}/progress",
    tag = "progress",
    params(("id" = String, Path, description = "Entity id")),
    responses(
        (status = 200, description = "Latest run for this entity", body = EntityProgressResponse),
        (status = 404, description = "Entity not found")
    )
)]
pub(crate) async fn entity_progress(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<EntityProgressResponse>, (StatusCode, String)> {
    let entity = fetch_entity(&state, &id).await?;
    let kind = entity.entity_kind().ok_or((
        StatusCode::INTERNAL_SERVER_ERROR,
        format!("Unknown entity kind {:?}", entity.kind),
    ))?;
    let phase = entity
        .entity_status()
        .map(RunPhase::from_entity)
        .unwrap_or(RunPhase::Settled);
    let run_id = store::latest_run_id(&state.db, entity.server_id, Some(entity.id))
        .await
        .map_err(map_db_error)?;

    let run = match run_id {
        Some(run_id) => {
            let events = store::list_run_events(&state.db, run_id)
                .await
                .map_err(map_db_error)?;
            let action = events
                .first()
                .and_then(|event| ActionKind::parse(&event.action_kind))
                .unwrap_or(ActionKind::Install);
            let ledger = packages::entity_ledger(kind, action);
            ProgressView {
                run_id: Some(run_id),
                action_kind: Some(action.as_str().to_string()),
                percent: status::percent_complete(ledger, &events),
                milestones: status::annotate(ledger, &events, phase),
            }
        }
        None => {
            let ledger = packages::entity_ledger(kind, ActionKind::Install);
            ProgressView {
                run_id: None,
                action_kind: None,
                percent: 0,
                milestones: status::annotate(ledger, &[], phase),
            }
        }
    };

    Ok(Json(EntityProgressResponse {
        entity_id: entity.id.to_string(),
        kind: entity.kind.clone(),
        name: entity.name.clone(),
        status: entity.status.clone(),
        run,
        framework_steps: framework_steps(&entity, kind),
    }))
}

// ---------------------------------------------------------------------------
// Site framework steps
// ---------------------------------------------------------------------------

/// Rebuilds the titled step list for a site from its framework definition.
/// Only statuses are persisted on the entity; titles come from the installer
/// so renames show up without touching stored rows.
fn framework_steps(entity: &EntityRow, kind: EntityKind) -> Option<Vec<FrameworkStepView>> {
    if kind != EntityKind::Site {
        return None;
    }
    let config: site::SiteConfig = serde_json::from_value(entity.config.0.clone()).ok()?;
    let installer = frameworks::resolve(&config.framework)?;
    let site_root = site::site_root(&config.domain);
    let ctx = frameworks::SiteContext {
        domain: &config.domain,
        site_root: &site_root,
        php_version: config.php_version.as_deref(),
    };
    let recorded = entity.install_steps.as_ref().map(|steps| &steps.0);
    let steps = installer
        .steps(&ctx)
        .iter()
        .enumerate()
        .map(|(index, step)| {
            let position = index as u32 + 1;
            let status = recorded
                .and_then(|map| map.get(position.to_string()))
                .and_then(|value| value.as_str())
                .unwrap_or("pending");
            FrameworkStepView {
                position,
                title: step.title.to_string(),
                status: status.to_string(),
            }
        })
        .collect();
    Some(steps)
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/servers/{id}/progress", get(server_progress))
        .route("/entities/{id}/progress", get(entity_progress))
}
