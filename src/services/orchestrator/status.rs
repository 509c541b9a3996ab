use chrono::{DateTime, Utc};
use serde::Serialize;
use utoipa::ToSchema;

use super::milestones::MilestoneLedger;
use super::types::{EntityStatus, ProgressEventRow};

/// Where the run stands from the caller's point of view. Drives which
/// annotation the first unreached milestone gets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    InFlight,
    Failed,
    Settled,
}

impl RunPhase {
    pub fn from_entity(status: EntityStatus) -> Self {
        if status.is_in_flight() {
            RunPhase::InFlight
        } else if status == EntityStatus::Failed {
            RunPhase::Failed
        } else {
            RunPhase::Settled
        }
    }

    pub fn from_server_status(status: &str) -> Self {
        match status {
            "provisioning" | "installing" | "removing" => RunPhase::InFlight,
            "failed" => RunPhase::Failed,
            _ => RunPhase::Settled,
        }
    }
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct AnnotatedMilestone {
    pub milestone: String,
    pub label: String,
    pub position: u32,
    pub is_completed: bool,
    pub is_installing: bool,
    pub is_pending: bool,
    pub is_failed: bool,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ProgressView {
    pub run_id: Option<uuid::Uuid>,
    pub action_kind: Option<String>,
    pub percent: u32,
    pub milestones: Vec<AnnotatedMilestone>,
}

/// Annotates every ledger milestone against the recorded events of one run.
/// Reads only; never writes state back. Completed milestones are those with a
/// recorded event. The first unreached milestone is shown as installing while
/// the run is in flight, or as the failure point when the run failed; the
/// rest stay pending. Events whose milestone id is not in the ledger are
/// ignored here and only show up in the percentage.
pub fn annotate(
    ledger: &MilestoneLedger,
    events: &[ProgressEventRow],
    phase: RunPhase,
) -> Vec<AnnotatedMilestone> {
    let mut out = Vec::with_capacity(ledger.total() as usize);
    let mut frontier_seen = false;
    for (index, milestone) in ledger.milestones().iter().enumerate() {
        let event = events.iter().find(|event| event.milestone == milestone.id);
        let is_completed = event.is_some();
        let at_frontier = !is_completed && !frontier_seen;
        if at_frontier {
            frontier_seen = true;
        }
        let is_installing = at_frontier && phase == RunPhase::InFlight;
        let is_failed = at_frontier && phase == RunPhase::Failed;
        out.push(AnnotatedMilestone {
            milestone: milestone.id.to_string(),
            label: milestone.label.to_string(),
            position: index as u32 + 1,
            is_completed,
            is_installing,
            is_pending: !is_completed && !is_installing && !is_failed,
            is_failed,
            completed_at: event.map(|event| event.created_at),
        });
    }
    out
}

/// Emitted-over-total percentage. A ledger with a wrong total can push this
/// past 100; callers render it as-is rather than clamping.
pub fn percent_complete(ledger: &MilestoneLedger, events: &[ProgressEventRow]) -> u32 {
    let total = ledger.total().max(1);
    (events.len() as u32).saturating_mul(100) / total
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::orchestrator::milestones::Milestone;
    use uuid::Uuid;

    const LEDGER: MilestoneLedger = MilestoneLedger::new(
        "demo",
        &[
            Milestone { id: "one", label: "First" },
            Milestone { id: "two", label: "Second" },
            Milestone { id: "three", label: "Third" },
            Milestone { id: "four", label: "Fourth" },
            Milestone { id: "five", label: "Fifth" },
        ],
    );

    fn event(milestone: &str) -> ProgressEventRow {
        ProgressEventRow {
            id: 1,
            server_id: Uuid::new_v4(),
            entity_id: None,
            run_id: Uuid::new_v4(),
            action_kind: "install".to_string(),
            milestone: milestone.to_string(),
            label: milestone.to_string(),
            step_index: 1,
            total_steps: 5,
            detail: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn annotates_run_in_flight() {
        let events = vec![event("one"), event("two")];
        let rows = annotate(&LEDGER, &events, RunPhase::InFlight);
        assert!(rows[0].is_completed);
        assert!(rows[1].is_completed);
        assert!(rows[1].completed_at.is_some());
        assert!(rows[2].is_installing);
        assert!(!rows[2].is_pending);
        assert!(rows[3].is_pending);
        assert!(rows[4].is_pending);
        assert_eq!(percent_complete(&LEDGER, &events), 40);
    }

    #[test]
    fn marks_the_frontier_milestone_failed() {
        let events = vec![event("one"), event("two")];
        let rows = annotate(&LEDGER, &events, RunPhase::Failed);
        assert!(rows[2].is_failed);
        assert!(!rows[2].is_installing);
        assert!(rows[3].is_pending);
        assert!(rows[4].is_pending);
    }

    #[test]
    fn settled_run_reports_all_completed() {
        let events = vec![
            event("one"),
            event("two"),
            event("three"),
            event("four"),
            event("five"),
        ];
        let rows = annotate(&LEDGER, &events, RunPhase::Settled);
        assert!(rows.iter().all(|row| row.is_completed));
        assert!(rows.iter().all(|row| !row.is_installing && !row.is_failed));
        assert_eq!(percent_complete(&LEDGER, &events), 100);
    }

    #[test]
    fn nothing_recorded_yet_points_at_the_first_milestone() {
        let rows = annotate(&LEDGER, &[], RunPhase::InFlight);
        assert!(rows[0].is_installing);
        assert!(rows.iter().skip(1).all(|row| row.is_pending));
        assert_eq!(percent_complete(&LEDGER, &[]), 0);
    }

    #[test]
    fn overcounting_ledger_exceeds_one_hundred_percent() {
        const SHORT: MilestoneLedger = MilestoneLedger::new(
            "short",
            &[
                Milestone { id: "one", label: "First" },
                Milestone { id: "two", label: "Second" },
            ],
        );
        let events = vec![event("one"), event("two"), event("extra")];
        assert_eq!(percent_complete(&SHORT, &events), 150);
        let rows = annotate(&SHORT, &events, RunPhase::Settled);
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|row| row.is_completed));
    }
}
