use crate::agent::history::SessionHistory;
use crate::error::FailureReason;
use crate::model::RepositoryRef;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Goal {
    Question,
    Issue,
    Review,
}

impl Goal {
    pub fn as_str(&self) -> &'static str {
        match self {
            Goal::Question => "question",
            Goal::Issue => "issue",
            Goal::Review => "review",
        }
    }
}

impl fmt::Display for Goal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Goal {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "question" => Ok(Goal::Question),
            "issue" => Ok(Goal::Issue),
            "review" => Ok(Goal::Review),
            other => Err(format!("unknown goal: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Retrieving,
    Generating,
    Applying,
    Building,
    Testing,
    Reviewing,
    Succeeded,
    Failed(FailureReason),
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Retrieving => "retrieving",
            SessionState::Generating => "generating",
            SessionState::Applying => "applying",
            SessionState::Building => "building",
            SessionState::Testing => "testing",
            SessionState::Reviewing => "reviewing",
            SessionState::Succeeded => "succeeded",
            SessionState::Failed(_) => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Succeeded | SessionState::Failed(_))
    }

    pub fn failure(&self) -> Option<FailureReason> {
        match self {
            SessionState::Failed(reason) => Some(*reason),
            _ => None,
        }
    }

    /// Edges of the session state graph. Any live state may fail.
    pub fn can_transition_to(&self, next: SessionState) -> bool {
        use SessionState::*;
        if self.is_terminal() {
            return false;
        }
        if matches!(next, Failed(_)) {
            return true;
        }
        match self {
            Retrieving => matches!(next, Generating),
            Generating => matches!(next, Generating | Applying | Reviewing | Succeeded),
            Applying => matches!(next, Generating | Building | Testing | Succeeded),
            Building => matches!(next, Generating | Testing | Succeeded),
            Testing => matches!(next, Generating | Succeeded),
            Reviewing => matches!(next, Succeeded),
            Succeeded | Failed(_) => false,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Failed(reason) => write!(f, "failed({reason})"),
            other => f.write_str(other.as_str()),
        }
    }
}

/// One question, issue or review request, from receipt to a terminal state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolutionSession {
    pub session_id: Uuid,
    pub repository: RepositoryRef,
    pub goal: Goal,
    pub content: String,
    pub state: SessionState,
    /// Generation attempts so far, across all loops.
    pub attempt_count: u32,
    pub history: SessionHistory,
    pub working_checkout_path: Option<PathBuf>,
    pub started_at: DateTime<Utc>,
}

impl ResolutionSession {
    pub fn new(goal: Goal, repository: RepositoryRef, content: impl Into<String>) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            repository,
            goal,
            content: content.into(),
            state: SessionState::Retrieving,
            attempt_count: 0,
            history: SessionHistory::new(),
            working_checkout_path: None,
            started_at: Utc::now(),
        }
    }

    pub fn advance(&mut self, next: SessionState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "invalid transition {} -> {}",
            self.state,
            next
        );
        tracing::info!(
            session_id = %self.session_id,
            goal = %self.goal,
            from = %self.state,
            to = %next,
            attempt = self.attempt_count,
            "session.transition"
        );
        self.state = next;
    }

    pub fn fail(&mut self, reason: FailureReason) {
        if self.state.is_terminal() {
            return;
        }
        let from = self.state;
        self.advance(SessionState::Failed(reason));
        tracing::warn!(
            session_id = %self.session_id,
            goal = %self.goal,
            state = %from,
            reason = %reason,
            attempt = self.attempt_count,
            "session.failed"
        );
    }
}
