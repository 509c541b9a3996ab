//! OpenAPI document assembled from the route annotations, served at
//! `/api/openapi.json` and printable with `--print-openapi` for client
//! generation without a running server.

use axum::routing::get;
use axum::{Json, Router};
use utoipa::OpenApi;

use crate::routes;
use crate::services::orchestrator::status::{AnnotatedMilestone, ProgressView};
use crate::services::orchestrator::types::{
    DeploymentPublic, EntityPublic, OrchestrationJobPublic, ProgressEventPublic, ServerPublic,
};

#[derive(OpenApi)]
#[openapi(
    info(
        title = "panel-server API",
        description = "Remote provisioning orchestration for managed server fleets"
    ),
    paths(
        routes::health::healthz_handler,
        routes::servers::list_servers,
        routes::servers::get_server,
        routes::servers::create_server,
        routes::servers::provision_server,
        routes::servers::install_monitoring,
        routes::servers::remove_monitoring,
        routes::firewall::get_firewall,
        routes::firewall::install_firewall,
        routes::firewall::remove_firewall,
        routes::firewall::list_firewall_rules,
        routes::firewall::create_firewall_rule,
        routes::firewall::remove_firewall_rule,
        routes::engines::get_nginx,
        routes::engines::install_nginx,
        routes::engines::remove_nginx,
        routes::engines::get_php,
        routes::engines::install_php,
        routes::engines::remove_php,
        routes::engines::get_database,
        routes::engines::install_database,
        routes::engines::remove_database,
        routes::schemas::list_schemas,
        routes::schemas::create_schema,
        routes::schemas::remove_schema,
        routes::daemons::list_daemons,
        routes::daemons::create_daemon,
        routes::daemons::remove_daemon,
        routes::tasks::list_tasks,
        routes::tasks::create_task,
        routes::tasks::remove_task,
        routes::sites::list_sites,
        routes::sites::create_site,
        routes::sites::remove_site,
        routes::deployments::list_deployments,
        routes::deployments::create_deployment,
        routes::deployments::get_active_deployment,
        routes::deployments::rollback_deployment,
        routes::progress::server_progress,
        routes::progress::entity_progress,
        routes::jobs::get_job,
    ),
    components(schemas(
        routes::health::HealthResponse,
        routes::servers::CreateServerRequest,
        routes::servers::CreateServerResponse,
        routes::firewall::CreateFirewallRequest,
        routes::firewall::CreateFirewallRuleRequest,
        routes::firewall::EntityWithJob,
        routes::engines::CreateEngineRequest,
        routes::schemas::CreateSchemaRequest,
        routes::daemons::CreateDaemonRequest,
        routes::tasks::CreateTaskRequest,
        routes::sites::CreateSiteRequest,
        routes::deployments::CreateDeploymentRequest,
        routes::deployments::DeploymentWithJob,
        routes::progress::ServerProgressResponse,
        routes::progress::EntityProgressResponse,
        routes::progress::FrameworkStepView,
        ServerPublic,
        EntityPublic,
        DeploymentPublic,
        OrchestrationJobPublic,
        ProgressEventPublic,
        ProgressView,
        AnnotatedMilestone,
    )),
    tags(
        (name = "servers", description = "Fleet membership and provisioning"),
        (name = "firewall", description = "UFW policy and rules"),
        (name = "engines", description = "nginx, PHP-FPM and MariaDB engines"),
        (name = "schemas", description = "Database schemas and grants"),
        (name = "daemons", description = "Supervisor-managed programs"),
        (name = "tasks", description = "Scheduled cron tasks"),
        (name = "sites", description = "Hosted sites and frameworks"),
        (name = "deployments", description = "Release deployments and rollback"),
        (name = "progress", description = "Milestone progress projections"),
        (name = "jobs", description = "Orchestration job status"),
    )
)]
pub struct ApiDoc;

pub fn openapi_json() -> serde_json::Value {
    serde_json::to_value(ApiDoc::openapi()).unwrap_or_default()
}

async fn serve_openapi() -> Json<serde_json::Value> {
    Json(openapi_json())
}

pub fn router() -> Router<crate::state::AppState> {
    Router::new().route("/openapi.json", get(serve_openapi))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn document_lists_every_surface() {
        let doc = openapi_json();
        let paths = doc
            .get("paths")
            .and_then(|paths| paths.as_object())
            .map(|paths| paths.keys().cloned().collect::<Vec<_>>())
            .unwrap_or_default();
        for expected in [
            "/healthz",
            "/api/servers",
            "/api/servers/{id}",
            "/api/servers/{id}/provision",
            "/api/servers/{id}/monitoring",
            "/api/servers/{id}/firewall",
            "/api/servers/{id}/firewall/rules",
            "/api/servers/{id}/firewall/rules/{rule_id}",
            "/api/servers/{id}/nginx",
            "/api/servers/{id}/php",
            "/api/servers/{id}/database",
            "/api/servers/{id}/schemas",
            "/api/schemas/{id}",
            "/api/servers/{id}/daemons",
            "/api/daemons/{id}",
            "/api/servers/{id}/tasks",
            "/api/tasks/{id}",
            "/api/servers/{id}/sites",
            "/api/sites/{id}",
            "/api/sites/{id}/deployments",
            "/api/sites/{id}/deployments/active",
            "/api/sites/{id}/deployments/{deployment_id}/rollback",
            "/api/servers/{id}/progress",
            "/api/entities/{id}/progress",
            "/api/jobs/{id}",
        ] {
            assert!(paths.iter().any(|path| path == expected), "missing {expected}");
        }
    }

    #[test]
    fn document_carries_component_schemas() {
        let doc = openapi_json();
        let schemas = doc
            .pointer("/components/schemas")
            .and_then(|schemas| schemas.as_object())
            .map(|schemas| schemas.keys().cloned().collect::<Vec<_>>())
            .unwrap_or_default();
        for expected in ["ServerPublic", "EntityPublic", "DeploymentPublic", "ProgressView"] {
            assert!(schemas.iter().any(|name| name == expected), "missing {expected}");
        }
    }
}
