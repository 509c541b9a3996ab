//! Host metrics agent, a stock prometheus node exporter.

use std::time::Duration;

use crate::services::orchestrator::milestones::{Milestone, MilestoneLedger};
use crate::services::orchestrator::types::{ActionKind, CredentialRole, PackageAction, Step};

use super::apt_install;

pub const INSTALL_LEDGER: MilestoneLedger = MilestoneLedger::new(
    "monitor_install",
    &[
        Milestone {
            id: "preflight",
            label: "Checking package sources",
        },
        Milestone {
            id: "installed",
            label: "Installing metrics agent",
        },
        Milestone {
            id: "enabled",
            label: "Enabling metrics agent",
        },
    ],
);

pub const REMOVE_LEDGER: MilestoneLedger = MilestoneLedger::new(
    "monitor_remove",
    &[
        Milestone {
            id: "stopped",
            label: "Stopping metrics agent",
        },
        Milestone {
            id: "purged",
            label: "Removing metrics agent",
        },
    ],
);

pub fn install_action() -> PackageAction {
    let steps = vec![
        Step::Command("test -x /usr/bin/apt-get".to_string()),
        Step::Track("preflight"),
        Step::Command(apt_install("prometheus-node-exporter")),
        Step::Track("installed"),
        Step::Command("systemctl enable --now prometheus-node-exporter".to_string()),
        Step::Command("systemctl is-active prometheus-node-exporter".to_string()),
        Step::Track("enabled"),
    ];
    PackageAction {
        kind: ActionKind::Install,
        role: CredentialRole::Root,
        ledger: INSTALL_LEDGER,
        steps,
        command_timeout: Duration::ZERO,
    }
}

pub fn remove_action() -> PackageAction {
    let steps = vec![
        Step::Command("systemctl disable --now prometheus-node-exporter || true".to_string()),
        Step::Track("stopped"),
        Step::Command(
            "DEBIAN_FRONTEND=noninteractive apt-get purge -y prometheus-node-exporter".to_string(),
        ),
        Step::Track("purged"),
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
    use crate::test_support::{action_commands, tracked_count};

    #[test]
    fn install_enables_the_exporter_and_tracks_every_milestone() {
        let action = install_action();
        let commands = action_commands(&action);
        assert!(commands
            .iter()
            .any(|c| c == "systemctl enable --now prometheus-node-exporter"));
        assert_eq!(tracked_count(&action), INSTALL_LEDGER.total());
    }

    #[test]
    fn remove_tolerates_an_agent_that_never_started() {
        let action = remove_action();
        let commands = action_commands(&action);
        assert!(commands[0].ends_with("|| true"));
        assert_eq!(tracked_count(&action), REMOVE_LEDGER.total());
    }
}
