/// One named progress checkpoint within an action's step list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Milestone {
    pub id: &'static str,
    pub label: &'static str,
}

/// Static ordered checkpoint table for one action type.
///
/// The declared total feeds percentage math; recipes are tested so the number
/// of Track steps they emit matches it. A mismatched total must never crash
/// the job layer, it only skews the percentage.
#[derive(Debug, Clone, Copy)]
pub struct MilestoneLedger {
    name: &'static str,
    milestones: &'static [Milestone],
}

impl MilestoneLedger {
    pub const fn new(name: &'static str, milestones: &'static [Milestone]) -> Self {
        Self { name, milestones }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn total(&self) -> u32 {
        self.milestones.len() as u32
    }

    pub fn milestones(&self) -> &'static [Milestone] {
        self.milestones
    }

    pub fn label(&self, id: &str) -> Option<&'static str> {
        self.milestones
            .iter()
            .find(|milestone| milestone.id == id)
            .map(|milestone| milestone.label)
    }

    /// 1-based position of a milestone in ledger order.
    pub fn position(&self, id: &str) -> Option<u32> {
        self.milestones
            .iter()
            .position(|milestone| milestone.id == id)
            .map(|index| index as u32 + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: MilestoneLedger = MilestoneLedger::new(
        "sample",
        &[
            Milestone {
                id: "preflight",
                label: "Verifying prerequisites",
            },
            Milestone {
                id: "applied",
                label: "Applying changes",
            },
            Milestone {
                id: "registered",
                label: "Recording state",
            },
        ],
    );

    #[test]
    fn total_counts_milestones() {
        assert_eq!(SAMPLE.total(), 3);
    }

    #[test]
    fn label_and_position_lookups() {
        assert_eq!(SAMPLE.label("applied"), Some("Applying changes"));
        assert_eq!(SAMPLE.label("missing"), None);
        assert_eq!(SAMPLE.position("preflight"), Some(1));
        assert_eq!(SAMPLE.position("registered"), Some(3));
        assert_eq!(SAMPLE.position("missing"), None);
    }
}
