//! Nginx web server engine.

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
pub struct NginxConfig {
    #[serde(default = "default_worker_processes")]
    pub worker_processes: String,
    #[serde(default = "default_worker_connections")]
    pub worker_connections: u32,
    #[serde(default = "default_client_max_body_size")]
    pub client_max_body_size: String,
}

fn default_worker_processes() -> String {
    "auto".to_string()
}

fn default_worker_connections() -> u32 {
    1024
}

fn default_client_max_body_size() -> String {
    "32m".to_string()
}

pub const INSTALL_LEDGER: MilestoneLedger = MilestoneLedger::new(
    "nginx_install",
    &[
        Milestone {
            id: "preflight",
            label: "Checking package sources",
        },
        Milestone {
            id: "installed",
            label: "Installing nginx",
        },
        Milestone {
            id: "configured",
            label: "Writing base configuration",
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
    "nginx_remove",
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

pub fn install(
    deps: &RecipeDeps,
    server: &ServerRow,
    entity: &EntityRow,
) -> Result<PackageAction, ActionError> {
    let config: NginxConfig = parse_config(entity)?;
    if config.worker_processes != "auto"
        && !config.worker_processes.chars().all(|c| c.is_ascii_digit())
    {
        return Err(ActionError::InvalidConfiguration(format!(
            "worker_processes must be auto or a number, got {:?}",
            config.worker_processes
        )));
    }

    let tuning = format!(
        "server_tokens off;\nclient_max_body_size {};\n",
        config.client_max_body_size
    );

    let steps = vec![
        Step::Command("test -x /usr/bin/apt-get".to_string()),
        Step::Track("preflight"),
        Step::Command(apt_install("nginx")),
        Step::Track("installed"),
        // http-scoped tuning lives in conf.d so package upgrades never
        // collide with our edits; worker settings are patched in place.
        Step::Command(write_file_command("/etc/nginx/conf.d/panel.conf", &tuning)),
        Step::Command(format!(
            "sed -i 's/^worker_processes .*/worker_processes {};/' /etc/nginx/nginx.conf",
            config.worker_processes
        )),
        Step::Command(format!(
            "sed -i 's/worker_connections [0-9]*;/worker_connections {};/' /etc/nginx/nginx.conf",
            config.worker_connections
        )),
        Step::Command("nginx -t".to_string()),
        Step::Track("configured"),
        Step::Command("systemctl enable --now nginx".to_string()),
        Step::Command("systemctl reload nginx".to_string()),
        Step::Track("enabled"),
        register_service(
            deps,
            server.id,
            "nginx",
            serde_json::json!({
                "client_max_body_size": config.client_max_body_size,
                "worker_connections": config.worker_connections,
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
        Step::Command("systemctl disable --now nginx || true".to_string()),
        Step::Track("stopped"),
        Step::Command("DEBIAN_FRONTEND=noninteractive apt-get purge -y nginx nginx-common".to_string()),
        Step::Command("rm -f /etc/nginx/conf.d/panel.conf".to_string()),
        Step::Track("purged"),
        unregister_service(deps, server.id, "nginx"),
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::orchestrator::types::EntityKind;
    use crate::test_support::{action_commands, entity_row, recipe_deps, server_row, tracked_count};

    #[tokio::test]
    async fn install_validates_config_before_enabling() {
        let deps = recipe_deps();
        let server = server_row();
        let entity = entity_row(
            EntityKind::Nginx,
            "web",
            serde_json::json!({ "client_max_body_size": "64m" }),
        );

        let action = install(&deps, &server, &entity).unwrap();

        let commands = action_commands(&action);
        let test_index = commands.iter().position(|c| c == "nginx -t");
        let enable_index = commands
            .iter()
            .position(|c| c == "systemctl enable --now nginx");
        assert!(test_index.is_some());
        assert!(test_index < enable_index);
        assert!(commands
            .iter()
            .any(|c| c.contains("client_max_body_size 64m;")));
        assert_eq!(tracked_count(&action), INSTALL_LEDGER.total());
    }

    #[tokio::test]
    async fn unknown_config_keys_are_rejected() {
        let deps = recipe_deps();
        let server = server_row();
        let entity = entity_row(
            EntityKind::Nginx,
            "web",
            serde_json::json!({ "worker_conections": 4096 }),
        );
        assert!(matches!(
            install(&deps, &server, &entity),
            Err(ActionError::InvalidConfiguration(_))
        ));
    }
}
