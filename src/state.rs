use crate::config::PanelConfig;
use crate::services::orchestrator::{CredentialProvider, OrchestratorService};
use axum::extract::FromRef;
use sqlx::PgPool;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub config: PanelConfig,
    pub db: PgPool,
    pub credentials: Arc<CredentialProvider>,
    pub orchestrator: Arc<OrchestratorService>,
}

impl FromRef<AppState> for PgPool {
    fn from_ref(state: &AppState) -> PgPool {
        state.db.clone()
    }
}
