//! MariaDB engine and per-application schemas with their users.

use std::time::Duration;

use serde::Deserialize;

use crate::services::orchestrator::milestones::{Milestone, MilestoneLedger};
use crate::services::orchestrator::ssh::shell_quote;
use crate::services::orchestrator::types::{
    ActionError, ActionKind, CredentialRole, EntityKind, EntityRow, PackageAction, ServerRow, Step,
};

use super::{
    apt_install, parse_config, register_service, require_active_entity, unregister_service,
    validate_slug, RecipeDeps,
};

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DatabaseConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SchemaConfig {
    /// Account granted full access to the schema; defaults to the schema name.
    #[serde(default)]
    pub user: Option<String>,
    /// When absent, only the schema is created and no user is provisioned.
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_grant_host")]
    pub host: String,
}

fn default_grant_host() -> String {
    "localhost".to_string()
}

pub const INSTALL_LEDGER: MilestoneLedger = MilestoneLedger::new(
    "database_install",
    &[
        Milestone {
            id: "preflight",
            label: "Checking package sources",
        },
        Milestone {
            id: "installed",
            label: "Installing MariaDB",
        },
        Milestone {
            id: "secured",
            label: "Tightening default access",
        },
        Milestone {
            id: "enabled",
            label: "Enabling service",
        },
        Milestone {
            id: "registered",
            label: "Recording service state",
        },
    ],
);

pub const REMOVE_LEDGER: MilestoneLedger = MilestoneLedger::new(
    "database_remove",
    &[
        Milestone {
            id: "stopped",
            label: "Stopping service",
        },
        Milestone {
            id: "purged",
            label: "Removing packages",
        },
        Milestone {
            id: "unregistered",
            label: "Clearing service record",
        },
    ],
);

pub const SCHEMA_INSTALL_LEDGER: MilestoneLedger = MilestoneLedger::new(
    "database_schema_install",
    &[
        Milestone {
            id: "validated",
            label: "Verifying database engine",
        },
        Milestone {
            id: "created",
            label: "Creating schema",
        },
        Milestone {
            id: "granted",
            label: "Provisioning access",
        },
    ],
);

pub const SCHEMA_REMOVE_LEDGER: MilestoneLedger = MilestoneLedger::new(
    "database_schema_remove",
    &[
        Milestone {
            id: "dropped",
            label: "Dropping schema",
        },
        Milestone {
            id: "revoked",
            label: "Removing access",
        },
    ],
);

pub fn install(
    deps: &RecipeDeps,
    server: &ServerRow,
    entity: &EntityRow,
) -> Result<PackageAction, ActionError> {
    let config: DatabaseConfig = parse_config(entity)?;
    if !config
        .bind_address
        .chars()
        .all(|c| c.is_ascii_hexdigit() || c == '.' || c == ':')
    {
        return Err(ActionError::InvalidConfiguration(format!(
            "bind_address {:?} is not an address",
            config.bind_address
        )));
    }

    let bind_override = format!("[mysqld]\nbind-address = {}\n", config.bind_address);
    let steps = vec![
        Step::Command("test -x /usr/bin/apt-get".to_string()),
        Step::Track("preflight"),
        Step::Command(apt_install("mariadb-server")),
        Step::Track("installed"),
        Step::Command(super::write_file_command(
            "/etc/mysql/mariadb.conf.d/99-panel.cnf",
            &bind_override,
        )),
        Step::Command(mysql_exec("DROP DATABASE IF EXISTS test")),
        Step::Command(mysql_exec(
            "DELETE FROM mysql.global_priv WHERE User='root' AND Host NOT IN ('localhost','127.0.0.1','::1')",
        )),
        Step::Command(mysql_exec("FLUSH PRIVILEGES")),
        Step::Track("secured"),
        Step::Command("systemctl enable --now mariadb".to_string()),
        Step::Command("systemctl restart mariadb".to_string()),
        Step::Track("enabled"),
        register_service(
            deps,
            server.id,
            "database",
            serde_json::json!({
                "engine": "mariadb",
                "bind_address": config.bind_address,
            }),
        ),
        Step::Track("registered"),
    ];

    Ok(PackageAction {
        kind: ActionKind::Install,
        role: CredentialRole::Root,
        ledger: INSTALL_LEDGER,
        steps,
        command_timeout: Duration::ZERO,
    })
}

pub fn remove(deps: &RecipeDeps, server: &ServerRow) -> PackageAction {
    let steps = vec![
        Step::Command("systemctl disable --now mariadb || true".to_string()),
        Step::Track("stopped"),
        // Data files under /var/lib/mysql stay on disk.
        Step::Command(
            "DEBIAN_FRONTEND=noninteractive apt-get purge -y mariadb-server".to_string(),
        ),
        Step::Track("purged"),
        unregister_service(deps, server.id, "database"),
        Step::Track("unregistered"),
    ];
    PackageAction {
        kind: ActionKind::Remove,
        role: CredentialRole::Root,
        ledger: REMOVE_LEDGER,
        steps,
        command_timeout: Duration::ZERO,
    }
}

pub async fn install_schema(
    deps: &RecipeDeps,
    server: &ServerRow,
    entity: &EntityRow,
) -> Result<PackageAction, ActionError> {
    let config: SchemaConfig = parse_config(entity)?;
    validate_slug(&entity.name, "schema")?;
    let user = config.user.clone().unwrap_or_else(|| entity.name.clone());
    validate_slug(&user, "database user")?;
    if let Some(password) = &config.password {
        validate_password(password)?;
    }
    validate_grant_host(&config.host)?;
    require_active_entity(&deps.db, server.id, EntityKind::Database, "database engine").await?;

    let schema = &entity.name;
    let mut steps = vec![
        Step::Command("systemctl is-active mariadb".to_string()),
        Step::Track("validated"),
        Step::Command(mysql_exec(&format!(
            "CREATE DATABASE IF NOT EXISTS {schema} CHARACTER SET utf8mb4 COLLATE utf8mb4_unicode_ci"
        ))),
        Step::Track("created"),
    ];
    if let Some(password) = &config.password {
        steps.push(Step::Command(mysql_exec(&format!(
            "CREATE USER IF NOT EXISTS '{user}'@'{host}' IDENTIFIED BY '{password}'",
            host = config.host
        ))));
        steps.push(Step::Command(mysql_exec(&format!(
            "GRANT ALL PRIVILEGES ON {schema}.* TO '{user}'@'{host}'",
            host = config.host
        ))));
        steps.push(Step::Command(mysql_exec("FLUSH PRIVILEGES")));
    }
    steps.push(Step::Track("granted"));

    Ok(PackageAction {
        kind: ActionKind::Install,
        role: CredentialRole::Root,
        ledger: SCHEMA_INSTALL_LEDGER,
        steps,
        command_timeout: Duration::ZERO,
    })
}

pub fn remove_schema(entity: &EntityRow) -> Result<PackageAction, ActionError> {
    let config: SchemaConfig = parse_config(entity)?;
    validate_slug(&entity.name, "schema")?;
    let user = config.user.clone().unwrap_or_else(|| entity.name.clone());
    validate_slug(&user, "database user")?;
    validate_grant_host(&config.host)?;

    let schema = &entity.name;
    let steps = vec![
        Step::Command(mysql_exec(&format!("DROP DATABASE IF EXISTS {schema}"))),
        Step::Track("dropped"),
        Step::Command(mysql_exec(&format!(
            "DROP USER IF EXISTS '{user}'@'{host}'",
            host = config.host
        ))),
        Step::Command(mysql_exec("FLUSH PRIVILEGES")),
        Step::Track("revoked"),
    ];
    Ok(PackageAction {
        kind: ActionKind::Remove,
        role: CredentialRole::Root,
        ledger: SCHEMA_REMOVE_LEDGER,
        steps,
        command_timeout: Duration::ZERO,
    })
}

fn mysql_exec(sql: &str) -> String {
    format!("mysql -e {}", shell_quote(sql))
}

/// Passwords are spliced into SQL literals, so quoting characters stay out.
fn validate_password(password: &str) -> Result<(), ActionError> {
    let ok = (8..=128).contains(&password.len())
        && password
            .chars()
            .all(|c| c.is_ascii_graphic() && !matches!(c, '\'' | '"' | '\\' | '`'));
    if !ok {
        return Err(ActionError::InvalidConfiguration(
            "database password must be 8-128 printable characters without quotes or backslashes"
                .to_string(),
        ));
    }
    Ok(())
}

fn validate_grant_host(host: &str) -> Result<(), ActionError> {
    let ok = !host.is_empty()
        && host
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | ':' | '%' | '-' | '_'));
    if !ok {
        return Err(ActionError::InvalidConfiguration(format!(
            "grant host {host:?} contains unsupported characters"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{action_commands, entity_row, tracked_count};

    #[test]
    fn password_validation_blocks_sql_quoting() {
        assert!(validate_password("s3cure-pass").is_ok());
        assert!(validate_password("short").is_err());
        assert!(validate_password("it's-a-pass").is_err());
        assert!(validate_password("back\\slash1").is_err());
    }

    #[test]
    fn schema_removal_is_tolerant_and_tracks_its_ledger() {
        let entity = entity_row(
            EntityKind::DatabaseSchema,
            "app_production",
            serde_json::json!({ "password": "s3cure-pass" }),
        );
        let action = remove_schema(&entity).unwrap();
        let commands = action_commands(&action);
        assert!(commands[0].contains("DROP DATABASE IF EXISTS app_production"));
        assert!(commands
            .iter()
            .any(|c| c.contains("DROP USER IF EXISTS 'app_production'@'localhost'")));
        assert_eq!(tracked_count(&action), SCHEMA_REMOVE_LEDGER.total());
    }

    #[test]
    fn mysql_statements_are_shell_quoted() {
        let command = mysql_exec("CREATE USER 'app'@'localhost' IDENTIFIED BY 'pw'");
        assert!(command.starts_with("mysql -e '"));
        assert!(command.contains("'\"'\"'"));
    }
}
