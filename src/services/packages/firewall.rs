//! Firewall engine (ufw) and individual allow rules.

use std::time::Duration;

use serde::Deserialize;

use crate::services::orchestrator::milestones::{Milestone, MilestoneLedger};
use crate::services::orchestrator::types::{
    ActionError, ActionKind, CredentialRole, EntityKind, EntityRow, PackageAction, ServerRow, Step,
};

use super::{
    apt_install, parse_config, register_service, require_active_entity, unregister_service,
    RecipeDeps,
};

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FirewallConfig {
    #[serde(default = "default_incoming")]
    pub default_incoming: String,
    #[serde(default = "default_outgoing")]
    pub default_outgoing: String,
}

fn default_incoming() -> String {
    "deny".to_string()
}

fn default_outgoing() -> String {
    "allow".to_string()
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FirewallRuleConfig {
    pub port: u16,
    #[serde(default = "default_protocol")]
    pub protocol: String,
    #[serde(default)]
    pub source: Option<String>,
}

fn default_protocol() -> String {
    "tcp".to_string()
}

pub const INSTALL_LEDGER: MilestoneLedger = MilestoneLedger::new(
    "firewall_install",
    &[
        Milestone {
            id: "preflight",
            label: "Checking package sources",
        },
        Milestone {
            id: "installed",
            label: "Installing ufw",
        },
        Milestone {
            id: "policies",
            label: "Applying default policies",
        },
        Milestone {
            id: "ssh_allowed",
            label: "Keeping SSH reachable",
        },
        Milestone {
            id: "registered",
            label: "Recording service state",
        },
    ],
);

pub const REMOVE_LEDGER: MilestoneLedger = MilestoneLedger::new(
    "firewall_remove",
    &[
        Milestone {
            id: "disabled",
            label: "Disabling firewall",
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

pub const RULE_INSTALL_LEDGER: MilestoneLedger = MilestoneLedger::new(
    "firewall_rule_install",
    &[
        Milestone {
            id: "validated",
            label: "Verifying firewall engine",
        },
        Milestone {
            id: "applied",
            label: "Applying firewall rule",
        },
    ],
);

pub const RULE_REMOVE_LEDGER: MilestoneLedger = MilestoneLedger::new(
    "firewall_rule_remove",
    &[Milestone {
        id: "removed",
        label: "Removing firewall rule",
    }],
);

pub fn install(
    deps: &RecipeDeps,
    server: &ServerRow,
    entity: &EntityRow,
) -> Result<PackageAction, ActionError> {
    let config: FirewallConfig = parse_config(entity)?;
    for policy in [&config.default_incoming, &config.default_outgoing] {
        if policy != "allow" && policy != "deny" {
            return Err(ActionError::InvalidConfiguration(format!(
                "firewall policy must be allow or deny, got {policy:?}"
            )));
        }
    }

    let steps = vec![
        Step::Command("test -x /usr/bin/apt-get".to_string()),
        Step::Track("preflight"),
        Step::Command(apt_install("ufw")),
        Step::Track("installed"),
        Step::Command(format!("ufw default {} incoming", config.default_incoming)),
        Step::Command(format!("ufw default {} outgoing", config.default_outgoing)),
        Step::Track("policies"),
        // The SSH allowance goes in before enabling; otherwise a deny-default
        // firewall cuts off the session driving this install.
        Step::Command("ufw allow 22/tcp".to_string()),
        Step::Command("ufw --force enable".to_string()),
        Step::Track("ssh_allowed"),
        register_service(
            deps,
            server.id,
            "firewall",
            serde_json::json!({
                "engine": "ufw",
                "default_incoming": config.default_incoming,
                "default_outgoing": config.default_outgoing,
                "allow": ["22/tcp"],
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
        Step::Command("ufw --force disable".to_string()),
        Step::Track("disabled"),
        Step::Command("DEBIAN_FRONTEND=noninteractive apt-get purge -y ufw".to_string()),
        Step::Track("purged"),
        unregister_service(deps, server.id, "firewall"),
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

pub async fn install_rule(
    deps: &RecipeDeps,
    server: &ServerRow,
    entity: &EntityRow,
) -> Result<PackageAction, ActionError> {
    let config: FirewallRuleConfig = parse_config(entity)?;
    require_active_entity(&deps.db, server.id, EntityKind::Firewall, "firewall").await?;

    let steps = vec![
        Step::Command("ufw status | grep -q 'Status: active'".to_string()),
        Step::Track("validated"),
        Step::Command(format!("ufw allow {}", rule_spec(&config))),
        Step::Track("applied"),
    ];

    Ok(PackageAction {
        kind: ActionKind::Install,
        role: CredentialRole::Root,
        ledger: RULE_INSTALL_LEDGER,
        steps,
        command_timeout: Duration::ZERO,
    })
}

pub fn remove_rule(entity: &EntityRow) -> Result<PackageAction, ActionError> {
    let config: FirewallRuleConfig = parse_config(entity)?;
    let steps = vec![
        // Deleting a rule that is already gone must not fail the removal.
        Step::Command(format!("ufw delete allow {} || true", rule_spec(&config))),
        Step::Track("removed"),
    ];
    Ok(PackageAction {
        kind: ActionKind::Remove,
        role: CredentialRole::Root,
        ledger: RULE_REMOVE_LEDGER,
        steps,
        command_timeout: Duration::ZERO,
    })
}

/// Builds the ufw rule arguments shared by allow and delete.
fn rule_spec(config: &FirewallRuleConfig) -> String {
    match &config.source {
        Some(source) => format!(
            "from {} to any port {} proto {}",
            source, config.port, config.protocol
        ),
        None => format!("{}/{}", config.port, config.protocol),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{action_commands, entity_row, recipe_deps, server_row, tracked_count};

    #[test]
    fn rule_spec_covers_both_shapes() {
        let simple = FirewallRuleConfig {
            port: 8080,
            protocol: "tcp".to_string(),
            source: None,
        };
        assert_eq!(rule_spec(&simple), "8080/tcp");

        let scoped = FirewallRuleConfig {
            port: 5432,
            protocol: "tcp".to_string(),
            source: Some("10.0.0.0/8".to_string()),
        };
        assert_eq!(rule_spec(&scoped), "from 10.0.0.0/8 to any port 5432 proto tcp");
    }

    #[tokio::test]
    async fn ssh_stays_reachable_before_the_firewall_arms() {
        let deps = recipe_deps();
        let server = server_row();
        let entity = entity_row(EntityKind::Firewall, "firewall", serde_json::json!({}));

        let action = install(&deps, &server, &entity).unwrap();

        let commands = action_commands(&action);
        let allow_index = commands.iter().position(|c| c == "ufw allow 22/tcp");
        let enable_index = commands.iter().position(|c| c == "ufw --force enable");
        assert!(allow_index.is_some());
        assert!(allow_index < enable_index);
        assert_eq!(tracked_count(&action), INSTALL_LEDGER.total());
    }

    #[tokio::test]
    async fn bad_policy_fails_before_any_remote_work() {
        let deps = recipe_deps();
        let server = server_row();
        let entity = entity_row(
            EntityKind::Firewall,
            "firewall",
            serde_json::json!({ "default_incoming": "reject" }),
        );

        let err = install(&deps, &server, &entity).unwrap_err();
        assert!(matches!(err, ActionError::InvalidConfiguration(_)));
    }

    #[test]
    fn rule_removal_tolerates_a_rule_that_is_already_gone() {
        let entity = entity_row(
            EntityKind::FirewallRule,
            "http",
            serde_json::json!({ "port": 80 }),
        );
        let action = remove_rule(&entity).unwrap();
        let commands = action_commands(&action);
        assert_eq!(commands, vec!["ufw delete allow 80/tcp || true".to_string()]);
        assert_eq!(tracked_count(&action), RULE_REMOVE_LEDGER.total());
    }
}
