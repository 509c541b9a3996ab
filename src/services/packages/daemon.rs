//! Long-running worker processes under supervisor.

use std::time::Duration;

use serde::Deserialize;

use crate::services::orchestrator::milestones::{Milestone, MilestoneLedger};
use crate::services::orchestrator::types::{
    ActionError, ActionKind, CredentialRole, EntityRow, PackageAction, Step,
};

use super::{apt_install, parse_config, validate_slug, write_file_command};

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DaemonConfig {
    pub command: String,
    #[serde(default)]
    pub directory: Option<String>,
    #[serde(default = "default_user")]
    pub user: String,
    #[serde(default = "default_autorestart")]
    pub autorestart: bool,
    #[serde(default = "default_numprocs")]
    pub numprocs: u32,
}

fn default_user() -> String {
    "panel-worker".to_string()
}

fn default_autorestart() -> bool {
    true
}

fn default_numprocs() -> u32 {
    1
}

pub const INSTALL_LEDGER: MilestoneLedger = MilestoneLedger::new(
    "daemon_install",
    &[
        Milestone {
            id: "preflight",
            label: "Preparing supervisor",
        },
        Milestone {
            id: "configured",
            label: "Writing program definition",
        },
        Milestone {
            id: "started",
            label: "Starting program",
        },
    ],
);

pub const REMOVE_LEDGER: MilestoneLedger = MilestoneLedger::new(
    "daemon_remove",
    &[
        Milestone {
            id: "stopped",
            label: "Stopping program",
        },
        Milestone {
            id: "purged",
            label: "Removing program definition",
        },
    ],
);

pub fn install(entity: &EntityRow) -> Result<PackageAction, ActionError> {
    let config: DaemonConfig = parse_config(entity)?;
    validate_slug(&entity.name, "daemon")?;
    validate_config(&config)?;

    let name = &entity.name;
    let program = supervisor_program(name, &config);
    let steps = vec![
        Step::Command(apt_install("supervisor")),
        Step::Command("systemctl enable --now supervisor".to_string()),
        Step::Track("preflight"),
        Step::Command(write_file_command(
            &format!("/etc/supervisor/conf.d/{name}.conf"),
            &program,
        )),
        Step::Track("configured"),
        Step::Command("supervisorctl reread && supervisorctl update".to_string()),
        Step::Command(format!("supervisorctl restart {name}:*")),
        Step::Track("started"),
    ];

    Ok(PackageAction {
        kind: ActionKind::Install,
        role: CredentialRole::Root,
        ledger: INSTALL_LEDGER,
        steps,
        command_timeout: Duration::ZERO,
    })
}

pub fn remove(entity: &EntityRow) -> Result<PackageAction, ActionError> {
    validate_slug(&entity.name, "daemon")?;
    let name = &entity.name;
    let steps = vec![
        // Stopping a program supervisor no longer knows about must not fail the removal.
        Step::Command(format!("supervisorctl stop {name}:* || true")),
        Step::Track("stopped"),
        Step::Command(format!("rm -f /etc/supervisor/conf.d/{name}.conf")),
        Step::Command("supervisorctl reread && supervisorctl update".to_string()),
        Step::Track("purged"),
    ];
    Ok(PackageAction {
        kind: ActionKind::Remove,
        role: CredentialRole::Root,
        ledger: REMOVE_LEDGER,
        steps,
        command_timeout: Duration::ZERO,
    })
}

fn validate_config(config: &DaemonConfig) -> Result<(), ActionError> {
    if config.command.trim().is_empty() || config.command.contains('\n') {
        return Err(ActionError::InvalidConfiguration(
            "daemon command must be a single non-empty line".to_string(),
        ));
    }
    validate_slug(&config.user, "daemon user")?;
    if let Some(directory) = &config.directory {
        if !directory.starts_with('/') || directory.contains('\n') {
            return Err(ActionError::InvalidConfiguration(format!(
                "daemon directory {directory:?} must be an absolute path"
            )));
        }
    }
    if !(1..=32).contains(&config.numprocs) {
        return Err(ActionError::InvalidConfiguration(
            "daemon numprocs must be between 1 and 32".to_string(),
        ));
    }
    Ok(())
}

fn supervisor_program(name: &str, config: &DaemonConfig) -> String {
    let mut body = format!(
        "[program:{name}]\ncommand={command}\nuser={user}\n",
        command = config.command,
        user = config.user,
    );
    if let Some(directory) = &config.directory {
        body.push_str(&format!("directory={directory}\n"));
    }
    body.push_str(&format!(
        "autostart=true\nautorestart={autorestart}\nnumprocs={numprocs}\n",
        autorestart = config.autorestart,
        numprocs = config.numprocs,
    ));
    if config.numprocs > 1 {
        body.push_str("process_name=%(program_name)s_%(process_num)02d\n");
    }
    body.push_str(&format!(
        "stdout_logfile=/var/log/supervisor/{name}.log\nredirect_stderr=true\nstopwaitsecs=30\n"
    ));
    body
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::orchestrator::types::EntityKind;
    use crate::test_support::{action_commands, entity_row, tracked_count};

    fn config(command: &str) -> DaemonConfig {
        DaemonConfig {
            command: command.to_string(),
            directory: None,
            user: default_user(),
            autorestart: true,
            numprocs: 1,
        }
    }

    #[test]
    fn program_definition_covers_the_worker_defaults() {
        let body = supervisor_program("queue-worker", &config("php artisan queue:work"));
        assert!(body.starts_with("[program:queue-worker]\n"));
        assert!(body.contains("command=php artisan queue:work\n"));
        assert!(body.contains("user=panel-worker\n"));
        assert!(body.contains("autorestart=true\n"));
        assert!(!body.contains("process_name="));
    }

    #[test]
    fn multi_process_programs_get_numbered_names() {
        let mut cfg = config("php artisan horizon");
        cfg.numprocs = 4;
        let body = supervisor_program("horizon", &cfg);
        assert!(body.contains("numprocs=4\n"));
        assert!(body.contains("process_name=%(program_name)s_%(process_num)02d\n"));
    }

    #[test]
    fn install_restarts_after_supervisor_rereads() {
        let entity = entity_row(
            EntityKind::Daemon,
            "queue-worker",
            serde_json::json!({ "command": "php artisan queue:work" }),
        );
        let action = install(&entity).unwrap();
        let commands = action_commands(&action);
        let reread = commands
            .iter()
            .position(|c| c.contains("supervisorctl reread"))
            .unwrap();
        let restart = commands
            .iter()
            .position(|c| c.contains("supervisorctl restart queue-worker:*"))
            .unwrap();
        assert!(reread < restart);
        assert_eq!(tracked_count(&action), INSTALL_LEDGER.total());
    }

    #[test]
    fn multi_line_commands_are_rejected() {
        let entity = entity_row(
            EntityKind::Daemon,
            "queue-worker",
            serde_json::json!({ "command": "php artisan queue:work\nrm -rf /" }),
        );
        assert!(matches!(
            install(&entity),
            Err(ActionError::InvalidConfiguration(_))
        ));
    }
}
