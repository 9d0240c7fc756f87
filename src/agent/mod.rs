//! Issue resolution: a bounded state machine that retrieves graph context,
//! asks a completion backend for an answer or patch, applies it to a working
//! checkout and verifies it with the repository's own build and tests.

pub mod completion;
pub mod history;
pub mod locks;
pub mod machine;
pub mod outcome;
pub mod prompt;
pub mod review;
pub mod session;

pub use completion::{CommandCompletionClient, CompletionClient};
pub use history::{Action, EntryStatus, HistoryEntry, SessionHistory};
pub use locks::RepositoryLocks;
pub use machine::{AgentStateMachine, Collaborators};
pub use outcome::{OutcomeStatus, ResolutionOutcome, ResolutionRequest, StepLog, Verification};
pub use review::{ReviewFinding, Severity};
pub use session::{Goal, ResolutionSession, SessionState};
