//! Scheduled tasks dropped into /etc/cron.d.

use std::time::Duration;

use serde::Deserialize;

use crate::services::orchestrator::milestones::{Milestone, MilestoneLedger};
use crate::services::orchestrator::types::{
    ActionError, ActionKind, CredentialRole, EntityRow, PackageAction, Step,
};

use super::{parse_config, validate_slug, write_file_command};

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CronConfig {
    pub schedule: String,
    pub command: String,
    #[serde(default = "default_user")]
    pub user: String,
}

fn default_user() -> String {
    "panel-worker".to_string()
}

pub const INSTALL_LEDGER: MilestoneLedger = MilestoneLedger::new(
    "cron_install",
    &[
        Milestone {
            id: "written",
            label: "Writing schedule entry",
        },
        Milestone {
            id: "verified",
            label: "Verifying cron pickup",
        },
    ],
);

pub const REMOVE_LEDGER: MilestoneLedger = MilestoneLedger::new(
    "cron_remove",
    &[Milestone {
        id: "removed",
        label: "Removing schedule entry",
    }],
);

pub fn install(entity: &EntityRow) -> Result<PackageAction, ActionError> {
    let config: CronConfig = parse_config(entity)?;
    validate_slug(&entity.name, "scheduled task")?;
    validate_slug(&config.user, "task user")?;
    validate_schedule(&config.schedule)?;
    if config.command.trim().is_empty() || config.command.contains('\n') {
        return Err(ActionError::InvalidConfiguration(
            "task command must be a single non-empty line".to_string(),
        ));
    }

    let name = &entity.name;
    let path = format!("/etc/cron.d/panel-{name}");
    let entry = format!(
        "SHELL=/bin/sh\n{schedule} {user} {command}\n",
        schedule = config.schedule,
        user = config.user,
        command = config.command,
    );
    let steps = vec![
        Step::Command(write_file_command(&path, &entry)),
        Step::Command(format!("chmod 644 {path} && chown root:root {path}")),
        Step::Track("written"),
        // cron.d entries need no daemon reload, only a readable file with sane ownership.
        Step::Command(format!("test -f {path}")),
        Step::Track("verified"),
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
    validate_slug(&entity.name, "scheduled task")?;
    let name = &entity.name;
    let steps = vec![
        Step::Command(format!("rm -f /etc/cron.d/panel-{name}")),
        Step::Track("removed"),
    ];
    Ok(PackageAction {
        kind: ActionKind::Remove,
        role: CredentialRole::Root,
        ledger: REMOVE_LEDGER,
        steps,
        command_timeout: Duration::ZERO,
    })
}

/// Five whitespace-separated fields from the classic crontab charset.
fn validate_schedule(schedule: &str) -> Result<(), ActionError> {
    let fields: Vec<&str> = schedule.split_whitespace().collect();
    let well_formed = fields.len() == 5
        && fields.iter().all(|field| {
            !field.is_empty()
                && field
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '*' | '/' | ',' | '-'))
        });
    if !well_formed {
        return Err(ActionError::InvalidConfiguration(format!(
            "schedule {schedule:?} is not a five-field cron expression"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::orchestrator::types::EntityKind;
    use crate::test_support::{action_commands, entity_row, tracked_count};

    #[test]
    fn schedule_validation_accepts_cron_shapes() {
        assert!(validate_schedule("* * * * *").is_ok());
        assert!(validate_schedule("*/5 0-6 1,15 * mon-fri").is_ok());
        assert!(validate_schedule("* * * *").is_err());
        assert!(validate_schedule("* * * * *; rm -rf /").is_err());
    }

    #[test]
    fn entry_lands_in_cron_d_with_the_task_user() {
        let entity = entity_row(
            EntityKind::ScheduledTask,
            "artisan-schedule",
            serde_json::json!({
                "schedule": "* * * * *",
                "command": "cd /home/panel/sites/app.example.com/current && php artisan schedule:run",
            }),
        );
        let action = install(&entity).unwrap();
        let commands = action_commands(&action);
        assert!(commands[0].contains("/etc/cron.d/panel-artisan-schedule"));
        assert!(commands[0].contains("* * * * * panel-worker cd /home/panel"));
        assert!(commands[1].contains("chmod 644"));
        assert_eq!(tracked_count(&action), INSTALL_LEDGER.total());
    }

    #[test]
    fn removal_only_touches_the_panel_owned_entry() {
        let entity = entity_row(EntityKind::ScheduledTask, "artisan-schedule", serde_json::json!({}));
        let action = remove(&entity).unwrap();
        let commands = action_commands(&action);
        assert_eq!(commands, vec!["rm -f /etc/cron.d/panel-artisan-schedule".to_string()]);
    }
}
