//! Patch parsing, working checkouts and external command execution.

pub mod checkout;
pub mod patch;
pub mod runner;

pub use checkout::{PatchApplier, WorkingCheckout};
pub use patch::UnifiedDiff;
pub use runner::{CommandRunner, RunOutput, ShellCommandRunner, VerifyCommands, VerifyStep};
