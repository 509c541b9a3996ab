pub mod action;
pub mod credentials;
pub mod locks;
pub mod milestones;
pub mod runner;
pub mod ssh;
pub mod status;
pub mod store;
pub mod types;

pub use action::ProgressSink;
pub use credentials::{CredentialProvider, CredentialStore, MemoryCredentialStore, PgCredentialStore};
pub use locks::{LockKeeper, MemoryLockKeeper, PgLockKeeper};
pub use milestones::{Milestone, MilestoneLedger};
pub use runner::OrchestratorService;
pub use ssh::CommandRunner;
pub use types::{
    ActionError, ActionKind, ActionReport, CommandOutput, Credential, CredentialRole, EntityKind,
    EntityStatus, JobStatus, PackageAction, Step,
};
