//! Recipes that turn an entity row into a runnable package action. Each
//! recipe declares its milestone ledger up front and composes the remote
//! commands, tracked checkpoints, and local bookkeeping effects the
//! orchestrator drives over one SSH session.

pub mod base;
pub mod cron;
pub mod daemon;
pub mod database;
pub mod deploy;
pub mod firewall;
pub mod frameworks;
pub mod monitor;
pub mod nginx;
pub mod php;
pub mod site;

use anyhow::Context;
use serde::de::DeserializeOwned;
use sqlx::PgPool;
use uuid::Uuid;

use crate::services::orchestrator::milestones::MilestoneLedger;
use crate::services::orchestrator::store;
use crate::services::orchestrator::types::{
    ActionError, ActionKind, EntityKind, EntityRow, PackageAction, ServerRow, Step,
};

/// Handles recipes need for bookkeeping effects and precondition checks.
/// Effects run on the action's blocking thread and reach the pool through
/// the runtime handle.
pub struct RecipeDeps {
    pub db: PgPool,
    pub handle: tokio::runtime::Handle,
}

pub async fn install_action(
    deps: &RecipeDeps,
    server: &ServerRow,
    entity: &EntityRow,
) -> Result<PackageAction, ActionError> {
    match require_kind(entity)? {
        EntityKind::Firewall => Ok(firewall::install(deps, server, entity)?),
        EntityKind::FirewallRule => firewall::install_rule(deps, server, entity).await,
        EntityKind::Nginx => Ok(nginx::install(deps, server, entity)?),
        EntityKind::Php => Ok(php::install(deps, server, entity)?),
        EntityKind::Database => Ok(database::install(deps, server, entity)?),
        EntityKind::DatabaseSchema => database::install_schema(deps, server, entity).await,
        EntityKind::Daemon => Ok(daemon::install(entity)?),
        EntityKind::ScheduledTask => Ok(cron::install(entity)?),
        EntityKind::Site => site::install(deps, server, entity).await,
    }
}

pub async fn remove_action(
    deps: &RecipeDeps,
    server: &ServerRow,
    entity: &EntityRow,
) -> Result<PackageAction, ActionError> {
    match require_kind(entity)? {
        EntityKind::Firewall => Ok(firewall::remove(deps, server)),
        EntityKind::FirewallRule => Ok(firewall::remove_rule(entity)?),
        EntityKind::Nginx => Ok(nginx::remove(deps, server)),
        EntityKind::Php => Ok(php::remove(deps, server, entity)?),
        EntityKind::Database => Ok(database::remove(deps, server)),
        EntityKind::DatabaseSchema => Ok(database::remove_schema(entity)?),
        EntityKind::Daemon => Ok(daemon::remove(entity)?),
        EntityKind::ScheduledTask => Ok(cron::remove(entity)?),
        EntityKind::Site => Ok(site::remove(entity)?),
    }
}

fn require_kind(entity: &EntityRow) -> Result<EntityKind, ActionError> {
    entity.entity_kind().ok_or_else(|| {
        ActionError::InvalidConfiguration(format!("unknown entity kind: {}", entity.kind))
    })
}

/// Ledger an entity-level run of the given kind reports against. The read
/// side uses this to annotate recorded events with the full milestone list.
pub fn entity_ledger(kind: EntityKind, action: ActionKind) -> &'static MilestoneLedger {
    match (kind, action) {
        (EntityKind::Site, ActionKind::Deploy) => &deploy::DEPLOY_LEDGER,
        (EntityKind::Site, ActionKind::Rollback) => &deploy::ROLLBACK_LEDGER,
        (EntityKind::Firewall, ActionKind::Remove) => &firewall::REMOVE_LEDGER,
        (EntityKind::Firewall, _) => &firewall::INSTALL_LEDGER,
        (EntityKind::FirewallRule, ActionKind::Remove) => &firewall::RULE_REMOVE_LEDGER,
        (EntityKind::FirewallRule, _) => &firewall::RULE_INSTALL_LEDGER,
        (EntityKind::Nginx, ActionKind::Remove) => &nginx::REMOVE_LEDGER,
        (EntityKind::Nginx, _) => &nginx::INSTALL_LEDGER,
        (EntityKind::Php, ActionKind::Remove) => &php::REMOVE_LEDGER,
        (EntityKind::Php, _) => &php::INSTALL_LEDGER,
        (EntityKind::Database, ActionKind::Remove) => &database::REMOVE_LEDGER,
        (EntityKind::Database, _) => &database::INSTALL_LEDGER,
        (EntityKind::DatabaseSchema, ActionKind::Remove) => &database::SCHEMA_REMOVE_LEDGER,
        (EntityKind::DatabaseSchema, _) => &database::SCHEMA_INSTALL_LEDGER,
        (EntityKind::Daemon, ActionKind::Remove) => &daemon::REMOVE_LEDGER,
        (EntityKind::Daemon, _) => &daemon::INSTALL_LEDGER,
        (EntityKind::ScheduledTask, ActionKind::Remove) => &cron::REMOVE_LEDGER,
        (EntityKind::ScheduledTask, _) => &cron::INSTALL_LEDGER,
        (EntityKind::Site, ActionKind::Remove) => &site::REMOVE_LEDGER,
        (EntityKind::Site, _) => &site::INSTALL_LEDGER,
    }
}

/// Ledger for server-level runs (provisioning and the monitoring agent).
pub fn server_ledger(action: ActionKind) -> &'static MilestoneLedger {
    match action {
        ActionKind::Provision => &base::PROVISION_LEDGER,
        ActionKind::Remove => &monitor::REMOVE_LEDGER,
        _ => &monitor::INSTALL_LEDGER,
    }
}

/// Deserializes the entity's JSON configuration into the recipe's shape,
/// surfacing configuration problems before anything touches the host.
pub(crate) fn parse_config<T: DeserializeOwned>(entity: &EntityRow) -> Result<T, ActionError> {
    serde_json::from_value(entity.config.0.clone()).map_err(|err| {
        ActionError::InvalidConfiguration(format!(
            "{} {} has invalid configuration: {err}",
            entity.kind, entity.name
        ))
    })
}

pub(crate) fn apt_install(packages: &str) -> String {
    format!("DEBIAN_FRONTEND=noninteractive apt-get install -y {packages}")
}

/// Writes a file over the session with a quoted heredoc, so the contents
/// arrive byte for byte without shell expansion.
pub(crate) fn write_file_command(path: &str, contents: &str) -> String {
    let mut body = contents.to_string();
    if !body.ends_with('\n') {
        body.push('\n');
    }
    format!(
        "cat > {} <<'PANEL_EOF'\n{}PANEL_EOF",
        crate::services::orchestrator::ssh::shell_quote(path),
        body
    )
}

/// Wraps a command so it runs under the application account instead of root.
pub(crate) fn as_application(command: &str) -> String {
    format!(
        "runuser -u panel -- bash -lc {}",
        crate::services::orchestrator::ssh::shell_quote(command)
    )
}

/// Bookkeeping step that records the service in the server's registry once
/// the remote work before it has succeeded.
pub(crate) fn register_service(
    deps: &RecipeDeps,
    server_id: Uuid,
    name: &'static str,
    entry: serde_json::Value,
) -> Step {
    let db = deps.db.clone();
    let handle = deps.handle.clone();
    Step::effect(move || {
        handle
            .block_on(store::merge_server_service(&db, server_id, name, entry))
            .context("failed to record service registry entry")?;
        Ok(())
    })
}

pub(crate) fn unregister_service(deps: &RecipeDeps, server_id: Uuid, name: &'static str) -> Step {
    let db = deps.db.clone();
    let handle = deps.handle.clone();
    Step::effect(move || {
        handle
            .block_on(store::remove_server_service(&db, server_id, name))
            .context("failed to clear service registry entry")?;
        Ok(())
    })
}

/// Fails with a precondition error unless the server has an active entity of
/// the given kind. Used by recipes that layer on top of another service.
pub(crate) async fn require_active_entity(
    db: &PgPool,
    server_id: Uuid,
    kind: EntityKind,
    what: &str,
) -> Result<(), ActionError> {
    let found: Option<(Uuid,)> = sqlx::query_as(
        r#"
        SELECT id FROM entities
        WHERE server_id = $1 AND kind = $2 AND status = 'active'
        LIMIT 1
        "#,
    )
    .bind(server_id)
    .bind(kind.as_str())
    .fetch_optional(db)
    .await
    .map_err(|err| ActionError::Other(anyhow::Error::new(err)))?;
    if found.is_none() {
        return Err(ActionError::PreconditionNotMet(format!(
            "no active {what} on this server"
        )));
    }
    Ok(())
}

/// Validates a name that ends up in file paths and unit names.
pub(crate) fn validate_slug(name: &str, what: &str) -> Result<(), ActionError> {
    let ok = !name.is_empty()
        && name.len() <= 64
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_');
    if !ok {
        return Err(ActionError::InvalidConfiguration(format!(
            "{what} name {name:?} must be lowercase alphanumeric with dashes or underscores"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heredoc_keeps_contents_verbatim() {
        let command = write_file_command("/etc/demo.conf", "alpha=1\nbeta=$HOME");
        assert!(command.starts_with("cat > '/etc/demo.conf' <<'PANEL_EOF'\n"));
        assert!(command.contains("beta=$HOME\n"));
        assert!(command.ends_with("PANEL_EOF"));
    }

    #[test]
    fn application_wrapper_quotes_the_inner_command() {
        let command = as_application("composer install --no-dev");
        assert_eq!(
            command,
            "runuser -u panel -- bash -lc 'composer install --no-dev'"
        );
    }

    #[test]
    fn slug_validation_rejects_path_traversal() {
        assert!(validate_slug("queue-worker", "daemon").is_ok());
        assert!(validate_slug("a_b2", "daemon").is_ok());
        assert!(validate_slug("../etc", "daemon").is_err());
        assert!(validate_slug("Queue", "daemon").is_err());
        assert!(validate_slug("", "daemon").is_err());
    }
}
