use crate::agent::history::{EntryStatus, HistoryEntry};
use crate::agent::review::ReviewFinding;
use crate::agent::session::{Goal, ResolutionSession, SessionState};
use crate::error::FailureReason;
use crate::exec::runner::{RunOutput, VerifyCommands, VerifyStep};
use crate::model::RepositoryRef;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

/// Input to one resolution session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolutionRequest {
    pub goal: Goal,
    pub repository: RepositoryRef,
    pub content: String,
    #[serde(default)]
    pub verify: VerifyCommands,
    /// Falls back to `retrieval.token_budget`.
    #[serde(default)]
    pub token_budget: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Succeeded,
    /// Finished without build/test verification.
    Partial,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verification {
    Verified,
    Skipped,
    NotApplicable,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepLog {
    pub step: VerifyStep,
    pub attempt: u32,
    pub command: String,
    pub exit_code: Option<i32>,
    pub success: bool,
    pub timed_out: bool,
    pub duration_ms: u64,
    pub output: String,
}

impl StepLog {
    pub fn new(step: VerifyStep, attempt: u32, command: &str, run: &RunOutput, max_bytes: usize) -> Self {
        Self {
            step,
            attempt,
            command: command.to_string(),
            exit_code: run.exit_code,
            success: run.success(),
            timed_out: run.timed_out,
            duration_ms: run.duration_ms,
            output: run.log_tail(max_bytes),
        }
    }
}

/// What a resolution request returns, whatever happened.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolutionOutcome {
    pub session_id: Uuid,
    pub goal: Goal,
    pub state: SessionState,
    pub status: OutcomeStatus,
    pub reason: Option<FailureReason>,
    pub patch: Option<String>,
    pub answer: Option<String>,
    pub findings: Vec<ReviewFinding>,
    pub logs: Vec<StepLog>,
    pub verification: Verification,
    pub summary: String,
    pub attempts: u32,
    pub history: Vec<HistoryEntry>,
    pub warnings: Vec<String>,
    pub working_checkout: Option<PathBuf>,
}

pub(crate) struct OutcomeParts {
    pub patch: Option<String>,
    pub patch_stats: Option<(Vec<String>, usize, usize)>,
    pub answer: Option<String>,
    pub findings: Vec<ReviewFinding>,
    pub logs: Vec<StepLog>,
    pub verification: Verification,
    pub warnings: Vec<String>,
}

impl ResolutionOutcome {
    pub(crate) fn from_session(session: ResolutionSession, parts: OutcomeParts) -> Self {
        let reason = session.state.failure();
        let status = match (session.state, parts.verification) {
            (SessionState::Failed(_), _) => OutcomeStatus::Failed,
            (_, Verification::Verified) => OutcomeStatus::Succeeded,
            _ => OutcomeStatus::Partial,
        };
        let summary = summarize(&session, &parts, status);
        Self {
            session_id: session.session_id,
            goal: session.goal,
            state: session.state,
            status,
            reason,
            patch: parts.patch,
            answer: parts.answer,
            findings: parts.findings,
            logs: parts.logs,
            verification: parts.verification,
            summary,
            attempts: session.attempt_count,
            history: session.history.entries().to_vec(),
            warnings: parts.warnings,
            working_checkout: session.working_checkout_path,
        }
    }
}

fn plural(count: usize, word: &str) -> String {
    if count == 1 {
        format!("{count} {word}")
    } else {
        format!("{count} {word}s")
    }
}

fn summarize(session: &ResolutionSession, parts: &OutcomeParts, status: OutcomeStatus) -> String {
    let mut sentences = Vec::new();
    let head = match session.state {
        SessionState::Failed(reason) => format!("{} session failed ({reason})", session.goal),
        _ => format!(
            "{} session {}",
            session.goal,
            if status == OutcomeStatus::Partial {
                "finished without verification"
            } else {
                "succeeded"
            }
        ),
    };
    sentences.push(format!(
        "{head} after {}.",
        plural(session.attempt_count as usize, "generation attempt")
    ));

    if let Some((paths, added, removed)) = &parts.patch_stats {
        sentences.push(format!(
            "Patch touches {} (+{added} -{removed}).",
            paths.join(", ")
        ));
    }
    if session.goal != Goal::Issue && parts.answer.is_some() {
        sentences.push("An answer was produced.".to_string());
    }
    if session.goal == Goal::Review {
        sentences.push(format!("{}.", plural(parts.findings.len(), "graph finding")));
    }
    for step in [VerifyStep::Build, VerifyStep::Test] {
        let runs: Vec<&StepLog> = parts.logs.iter().filter(|log| log.step == step).collect();
        if let Some(last) = runs.last() {
            sentences.push(format!(
                "{} ran {}, last {}.",
                step.as_str(),
                plural(runs.len(), "time"),
                if last.success { "passed" } else { "failed" }
            ));
        }
    }
    if parts.verification == Verification::Skipped {
        sentences.push("Build and test were skipped.".to_string());
    }
    if session.state.failure().is_some()
        && let Some(entry) = session
            .history
            .entries()
            .iter()
            .rev()
            .find(|entry| entry.status != EntryStatus::Ok)
    {
        let first_line = entry.result.lines().next().unwrap_or_default();
        sentences.push(format!("Last failure: {} {first_line}.", entry.action));
    }
    sentences.join(" ")
}
