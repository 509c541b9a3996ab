use anyhow::Result;
use tokio_util::sync::CancellationToken;

use super::ssh::CommandRunner;
use super::types::{ActionError, ActionReport, PackageAction, Step};

/// Receives one progress event per Track step. Postgres-backed in production,
/// in-memory in tests.
pub trait ProgressSink: Send {
    fn record(
        &mut self,
        milestone: &'static str,
        label: &str,
        step_index: u32,
        total_steps: u32,
    ) -> Result<()>;
}

/// Runs one Package Action: steps in declaration order, first failure aborts
/// and propagates untouched. Install and remove both come through here; there
/// is no other execution path.
///
/// The step index counts emitted Track steps, so a ledger whose declared
/// total is wrong skews the percentage without breaking the run.
pub fn run(
    runner: &mut dyn CommandRunner,
    sink: &mut dyn ProgressSink,
    cancel: &CancellationToken,
    action: PackageAction,
) -> Result<ActionReport, ActionError> {
    let total = action.ledger.total();
    let mut report = ActionReport::default();

    for step in action.steps {
        if cancel.is_cancelled() {
            return Err(ActionError::Interrupted);
        }
        match step {
            Step::Command(command) => {
                let output = runner.run(&command, action.command_timeout)?;
                report.outputs.push(output);
            }
            Step::Track(milestone) => {
                report.tracked += 1;
                let label = action.ledger.label(milestone).unwrap_or(milestone);
                sink.record(milestone, label, report.tracked, total)?;
            }
            Step::Effect(effect) => {
                effect()?;
            }
        }
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::orchestrator::milestones::{Milestone, MilestoneLedger};
    use crate::services::orchestrator::types::{ActionKind, CredentialRole};
    use crate::test_support::{MemorySink, ScriptedRunner};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    const LEDGER: MilestoneLedger = MilestoneLedger::new(
        "test_action",
        &[
            Milestone {
                id: "preflight",
                label: "Verifying prerequisites",
            },
            Milestone {
                id: "packages",
                label: "Installing packages",
            },
            Milestone {
                id: "configured",
                label: "Applying configuration",
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

    fn five_phase_action() -> PackageAction {
        PackageAction {
            kind: ActionKind::Install,
            role: CredentialRole::Root,
            ledger: LEDGER,
            steps: vec![
                Step::Command("test -x /usr/bin/apt-get".to_string()),
                Step::Track("preflight"),
                Step::Command("apt-get install -y demo".to_string()),
                Step::Track("packages"),
                Step::Command("demo configure".to_string()),
                Step::Track("configured"),
                Step::Command("systemctl enable --now demo".to_string()),
                Step::Track("enabled"),
                Step::Track("registered"),
            ],
            command_timeout: Duration::from_secs(120),
        }
    }

    #[test]
    fn successful_run_emits_every_track_in_order() {
        let mut runner = ScriptedRunner::new();
        let mut sink = MemorySink::default();
        let cancel = CancellationToken::new();

        let report = run(&mut runner, &mut sink, &cancel, five_phase_action()).unwrap();

        assert_eq!(report.tracked, 5);
        assert_eq!(report.outputs.len(), 4);
        assert_eq!(sink.events.len(), 5);
        let indices: Vec<u32> = sink.events.iter().map(|event| event.step_index).collect();
        assert_eq!(indices, vec![1, 2, 3, 4, 5]);
        assert!(sink
            .events
            .iter()
            .all(|event| event.total_steps == LEDGER.total()));
        assert_eq!(sink.events[0].label, "Verifying prerequisites");
        assert_eq!(runner.commands.len(), 4);
    }

    #[test]
    fn failure_mid_run_stops_and_keeps_past_events_only() {
        // Third remote command fails; two milestones were crossed before it.
        let mut runner = ScriptedRunner::new().fail_on(3, "demo: unknown option");
        let mut sink = MemorySink::default();
        let cancel = CancellationToken::new();

        let err = run(&mut runner, &mut sink, &cancel, five_phase_action()).unwrap_err();

        match err {
            ActionError::RemoteCommandFailed {
                command, stderr, ..
            } => {
                assert_eq!(command, "demo configure");
                assert_eq!(stderr, "demo: unknown option");
            }
            other => panic!("expected RemoteCommandFailed, got {other:?}"),
        }
        assert_eq!(sink.events.len(), 2);
        assert!(sink.events.iter().all(|event| event.step_index <= 2));
        // Nothing past the failing step ran.
        assert_eq!(runner.commands.len(), 3);
    }

    #[test]
    fn effect_failure_aborts_like_a_failed_command() {
        let ran_later_effect = Arc::new(AtomicBool::new(false));
        let later = ran_later_effect.clone();
        let action = PackageAction {
            kind: ActionKind::Install,
            role: CredentialRole::Root,
            ledger: LEDGER,
            steps: vec![
                Step::Track("preflight"),
                Step::effect(|| Err(anyhow::anyhow!("bookkeeping failed"))),
                Step::Command("never runs".to_string()),
                Step::effect(move || {
                    later.store(true, Ordering::SeqCst);
                    Ok(())
                }),
            ],
            command_timeout: Duration::from_secs(120),
        };

        let mut runner = ScriptedRunner::new();
        let mut sink = MemorySink::default();
        let cancel = CancellationToken::new();
        let err = run(&mut runner, &mut sink, &cancel, action).unwrap_err();

        assert!(matches!(err, ActionError::Other(_)));
        assert!(err.to_string().contains("bookkeeping failed"));
        assert!(runner.commands.is_empty());
        assert!(!ran_later_effect.load(Ordering::SeqCst));
        assert_eq!(sink.events.len(), 1);
    }

    #[test]
    fn wrong_ledger_total_is_tolerated() {
        const SHORT: MilestoneLedger = MilestoneLedger::new(
            "short",
            &[Milestone {
                id: "only",
                label: "Only milestone",
            }],
        );
        // Two tracks against a ledger that declares one.
        let action = PackageAction {
            kind: ActionKind::Install,
            role: CredentialRole::Root,
            ledger: SHORT,
            steps: vec![Step::Track("only"), Step::Track("extra")],
            command_timeout: Duration::from_secs(120),
        };

        let mut runner = ScriptedRunner::new();
        let mut sink = MemorySink::default();
        let cancel = CancellationToken::new();
        let report = run(&mut runner, &mut sink, &cancel, action).unwrap();

        assert_eq!(report.tracked, 2);
        assert_eq!(sink.events[1].step_index, 2);
        assert_eq!(sink.events[1].total_steps, 1);
        // Unknown milestone falls back to its id for the label.
        assert_eq!(sink.events[1].label, "extra");
    }

    #[test]
    fn cancellation_stops_at_the_next_step_boundary() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        let mut runner = ScriptedRunner::new();
        let mut sink = MemorySink::default();
        let err = run(&mut runner, &mut sink, &cancel, five_phase_action()).unwrap_err();

        assert!(matches!(err, ActionError::Interrupted));
        assert!(runner.commands.is_empty());
        assert!(sink.events.is_empty());
    }
}
