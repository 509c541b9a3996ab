//! Release-based deployments and rollbacks for sites.
//!
//! Every deployment builds a fresh directory under `releases/`, runs the
//! site's deploy script inside it and only then repoints the `current`
//! symlink. Rollback repoints the symlink at a previous release after
//! probing that it still exists.

use std::time::Duration;

use crate::services::orchestrator::milestones::{Milestone, MilestoneLedger};
use crate::services::orchestrator::types::{
    ActionError, ActionKind, CredentialRole, DeploymentRow, EntityRow, PackageAction, Step,
};

use super::site::{site_root, SiteConfig};
use super::{parse_config, write_file_command};

pub const DEPLOY_LEDGER: MilestoneLedger = MilestoneLedger::new(
    "deployment",
    &[
        Milestone {
            id: "prepared",
            label: "Preparing release directory",
        },
        Milestone {
            id: "fetched",
            label: "Fetching application code",
        },
        Milestone {
            id: "executed",
            label: "Running deploy script",
        },
        Milestone {
            id: "released",
            label: "Activating release",
        },
    ],
);

pub const ROLLBACK_LEDGER: MilestoneLedger = MilestoneLedger::new(
    "rollback",
    &[
        Milestone {
            id: "verified",
            label: "Verifying target release",
        },
        Milestone {
            id: "restored",
            label: "Restoring previous release",
        },
    ],
);

pub struct PreparedDeployment {
    pub action: PackageAction,
    pub release_path: String,
    /// Batch run on the same session after the action succeeds: first the
    /// released commit, then the live symlink target. Kept out of the action
    /// so the recorded deploy output is the script's alone.
    pub followups: Vec<String>,
}

pub fn run_action(
    site: &EntityRow,
    deployment: &DeploymentRow,
) -> Result<PreparedDeployment, ActionError> {
    let config: SiteConfig = parse_config(site)?;
    let root = site_root(&config.domain);
    let release = format!("{root}/releases/{}", deployment.id.simple());

    let mut steps = vec![
        Step::Command(format!("mkdir -p {release}")),
        Step::Track("prepared"),
    ];
    match &config.repo_url {
        Some(repo) => steps.push(Step::Command(format!("git clone --depth 1 {repo} {release}"))),
        // Without a repository the new release starts from the live one.
        None => steps.push(Step::Command(format!("cp -a {root}/current/. {release}/"))),
    }
    steps.push(Step::Track("fetched"));

    if deployment.script.trim().is_empty() {
        steps.push(Step::Command("true".to_string()));
    } else {
        // The script lands as a file first so multi-line scripts run intact.
        steps.push(Step::Command(write_file_command(
            &format!("{release}/.panel-deploy.sh"),
            &deployment.script,
        )));
        steps.push(Step::Command(format!("cd {release} && bash .panel-deploy.sh")));
    }
    steps.push(Step::Track("executed"));

    steps.push(Step::Command(format!("ln -sfn {release} {root}/current")));
    steps.push(Step::Track("released"));

    let followups = vec![
        format!("cd {release} && git rev-parse HEAD 2>/dev/null || echo ''"),
        format!("readlink {root}/current"),
    ];

    Ok(PreparedDeployment {
        action: PackageAction {
            kind: ActionKind::Deploy,
            role: CredentialRole::Application,
            ledger: DEPLOY_LEDGER,
            steps,
            command_timeout: Duration::ZERO,
        },
        release_path: release,
        followups,
    })
}

pub fn rollback_action(site: &EntityRow, release_path: &str) -> Result<PackageAction, ActionError> {
    let config: SiteConfig = parse_config(site)?;
    let root = site_root(&config.domain);
    if !release_path.starts_with(&format!("{root}/releases/")) {
        return Err(ActionError::InvalidConfiguration(format!(
            "release path {release_path:?} does not belong to {}",
            config.domain
        )));
    }

    let steps = vec![
        Step::Command(format!("test -d {release_path}")),
        Step::Track("verified"),
        Step::Command(format!("ln -sfn {release_path} {root}/current")),
        Step::Track("restored"),
    ];
    Ok(PackageAction {
        kind: ActionKind::Rollback,
        role: CredentialRole::Application,
        ledger: ROLLBACK_LEDGER,
        steps,
        command_timeout: Duration::ZERO,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    use crate::services::orchestrator::types::EntityKind;
    use crate::test_support::{action_commands, entity_row, tracked_count};

    fn site() -> EntityRow {
        entity_row(
            EntityKind::Site,
            "app",
            serde_json::json!({
                "domain": "app.example.com",
                "framework": "laravel",
                "php_version": "8.3",
                "repo_url": "https://github.com/acme/app.git",
            }),
        )
    }

    fn deployment(site_id: Uuid, script: &str) -> DeploymentRow {
        DeploymentRow {
            id: Uuid::new_v4(),
            site_id,
            server_id: Uuid::new_v4(),
            status: "pending".to_string(),
            script: script.to_string(),
            output: None,
            exit_code: None,
            commit_sha: None,
            release_path: None,
            started_at: None,
            finished_at: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn symlink_flips_only_after_the_script_succeeds() {
        let site = site();
        let deployment = deployment(site.id, "composer install --no-dev");
        let prepared = run_action(&site, &deployment).unwrap();
        let commands = action_commands(&prepared.action);

        let script = commands
            .iter()
            .position(|c| c.contains("composer install --no-dev"))
            .unwrap();
        let flip = commands
            .iter()
            .position(|c| c.contains("ln -sfn") && c.ends_with("/current"))
            .unwrap();
        assert!(script < flip);
        assert!(prepared
            .release_path
            .starts_with("/home/panel/sites/app.example.com/releases/"));
        assert_eq!(tracked_count(&prepared.action), DEPLOY_LEDGER.total());
    }

    #[test]
    fn followups_probe_the_commit_and_the_live_link() {
        let site = site();
        let deployment = deployment(site.id, "");
        let prepared = run_action(&site, &deployment).unwrap();
        assert!(prepared.followups[0].contains("git rev-parse HEAD"));
        assert!(prepared.followups[1]
            .contains("readlink /home/panel/sites/app.example.com/current"));

        // An empty script still produces a step so the ledger count holds.
        let commands = action_commands(&prepared.action);
        assert!(commands.iter().any(|c| c == "true"));
        assert!(!commands.iter().any(|c| c.contains("git rev-parse")));
    }

    #[test]
    fn rollback_refuses_paths_outside_the_site() {
        let site = site();
        let err = rollback_action(&site, "/home/panel/sites/other.example.com/releases/x")
            .unwrap_err();
        assert!(matches!(err, ActionError::InvalidConfiguration(_)));

        let action = rollback_action(
            &site,
            "/home/panel/sites/app.example.com/releases/0f2e7a31c04d4d2c8f4f2a0f8f0c1d2e",
        )
        .unwrap();
        let commands = action_commands(&action);
        assert!(commands[0].starts_with("test -d "));
        assert_eq!(tracked_count(&action), ROLLBACK_LEDGER.total());
    }
}
