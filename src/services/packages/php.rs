//! PHP-FPM runtime engine, versioned.

use std::time::Duration;

use serde::Deserialize;

use crate::services::orchestrator::milestones::{Milestone, MilestoneLedger};
use crate::services::orchestrator::types::{
    ActionError, ActionKind, CredentialRole, EntityRow, PackageAction, ServerRow, Step,
};

use super::{
    apt_install, parse_config, register_service, unregister_service, write_file_command, RecipeDeps,
};

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PhpConfig {
    pub version: String,
    #[serde(default = "default_memory_limit")]
    pub memory_limit: String,
    #[serde(default = "default_upload_max_filesize")]
    pub upload_max_filesize: String,
}

fn default_memory_limit() -> String {
    "256M".to_string()
}

fn default_upload_max_filesize() -> String {
    "32M".to_string()
}

pub const INSTALL_LEDGER: MilestoneLedger = MilestoneLedger::new(
    "php_install",
    &[
        Milestone {
            id: "preflight",
            label: "Checking package sources",
        },
        Milestone {
            id: "installed",
            label: "Installing PHP runtime",
        },
        Milestone {
            id: "configured",
            label: "Applying runtime overrides",
        },
        Milestone {
            id: "enabled",
            label: "Enabling PHP-FPM",
        },
        Milestone {
            id: "registered",
            label: "Recording service state",
        },
    ],
);

pub const REMOVE_LEDGER: MilestoneLedger = MilestoneLedger::new(
    "php_remove",
    &[
        Milestone {
            id: "stopped",
            label: "Stopping PHP-FPM",
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

pub fn install(
    deps: &RecipeDeps,
    server: &ServerRow,
    entity: &EntityRow,
) -> Result<PackageAction, ActionError> {
    let config: PhpConfig = parse_config(entity)?;
    validate_version(&config.version)?;
    let version = &config.version;

    let overrides = format!(
        "memory_limit = {}\nupload_max_filesize = {}\npost_max_size = {}\nexpose_php = Off\n",
        config.memory_limit, config.upload_max_filesize, config.upload_max_filesize
    );

    let steps = vec![
        Step::Command("test -x /usr/bin/apt-get".to_string()),
        Step::Track("preflight"),
        Step::Command(apt_install(&format!(
            "php{version}-fpm php{version}-cli php{version}-mysql php{version}-xml php{version}-curl php{version}-mbstring php{version}-zip"
        ))),
        Step::Track("installed"),
        Step::Command(write_file_command(
            &format!("/etc/php/{version}/fpm/conf.d/99-panel.ini"),
            &overrides,
        )),
        Step::Command(format!("php-fpm{version} -t")),
        Step::Track("configured"),
        Step::Command(format!("systemctl enable --now php{version}-fpm")),
        Step::Track("enabled"),
        register_service(
            deps,
            server.id,
            "php",
            serde_json::json!({
                "version": version,
                "memory_limit": config.memory_limit,
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

pub fn remove(
    deps: &RecipeDeps,
    server: &ServerRow,
    entity: &EntityRow,
) -> Result<PackageAction, ActionError> {
    let config: PhpConfig = parse_config(entity)?;
    validate_version(&config.version)?;
    let version = &config.version;

    let steps = vec![
        Step::Command(format!("systemctl disable --now php{version}-fpm || true")),
        Step::Track("stopped"),
        Step::Command(format!(
            "DEBIAN_FRONTEND=noninteractive apt-get purge -y 'php{version}-*'"
        )),
        Step::Track("purged"),
        unregister_service(deps, server.id, "php"),
        Step::Track("unregistered"),
    ];
    Ok(PackageAction {
        kind: ActionKind::Remove,
        role: CredentialRole::Root,
        ledger: REMOVE_LEDGER,
        steps,
        command_timeout: Duration::ZERO,
    })
}

/// Versions reach shell commands and paths, so only digits and one dot pass.
pub(super) fn validate_version(version: &str) -> Result<(), ActionError> {
    let mut parts = version.split('.');
    let major = parts.next().unwrap_or_default();
    let minor = parts.next().unwrap_or_default();
    let shape_ok = parts.next().is_none()
        && !major.is_empty()
        && !minor.is_empty()
        && major.chars().all(|c| c.is_ascii_digit())
        && minor.chars().all(|c| c.is_ascii_digit());
    if !shape_ok {
        return Err(ActionError::InvalidConfiguration(format!(
            "php version must look like 8.3, got {version:?}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::orchestrator::types::EntityKind;
    use crate::test_support::{action_commands, entity_row, recipe_deps, server_row, tracked_count};

    #[test]
    fn version_shapes() {
        assert!(validate_version("8.3").is_ok());
        assert!(validate_version("7.4").is_ok());
        assert!(validate_version("8").is_err());
        assert!(validate_version("8.3.1").is_err());
        assert!(validate_version("8.3; rm -rf /").is_err());
    }

    #[tokio::test]
    async fn install_uses_the_requested_version_everywhere() {
        let deps = recipe_deps();
        let server = server_row();
        let entity = entity_row(
            EntityKind::Php,
            "php",
            serde_json::json!({ "version": "8.3", "memory_limit": "512M" }),
        );

        let action = install(&deps, &server, &entity).unwrap();
        let commands = action_commands(&action);

        assert!(commands.iter().any(|c| c.contains("php8.3-fpm php8.3-cli")));
        assert!(commands
            .iter()
            .any(|c| c.contains("/etc/php/8.3/fpm/conf.d/99-panel.ini")));
        assert!(commands.iter().any(|c| c.contains("memory_limit = 512M")));
        assert_eq!(tracked_count(&action), INSTALL_LEDGER.total());
    }

    #[tokio::test]
    async fn missing_version_is_invalid_configuration() {
        let deps = recipe_deps();
        let server = server_row();
        let entity = entity_row(EntityKind::Php, "php", serde_json::json!({}));
        assert!(matches!(
            install(&deps, &server, &entity),
            Err(ActionError::InvalidConfiguration(_))
        ));
    }
}
