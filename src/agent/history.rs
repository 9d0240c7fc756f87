use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Retrieve,
    Generate,
    Apply,
    Build,
    Test,
    Review,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Retrieve => "retrieve",
            Action::Generate => "generate",
            Action::Apply => "apply",
            Action::Build => "build",
            Action::Test => "test",
            Action::Review => "review",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    Ok,
    /// The step ran and its result was wrong (bad diff, failing build).
    Failed,
    /// The step could not run (backend rate limited or unavailable).
    Transient,
}

impl EntryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryStatus::Ok => "ok",
            EntryStatus::Failed => "failed",
            EntryStatus::Transient => "unavailable",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub seq: u32,
    pub action: Action,
    pub status: EntryStatus,
    pub result: String,
    pub timestamp: DateTime<Utc>,
}

impl HistoryEntry {
    pub fn render(&self) -> String {
        format!(
            "#{} {} [{}]\n{}",
            self.seq,
            self.action,
            self.status.as_str(),
            self.result.trim_end()
        )
    }
}

/// Append-only record of what a session did.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionHistory {
    entries: Vec<HistoryEntry>,
}

impl SessionHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, action: Action, status: EntryStatus, result: impl Into<String>) -> &HistoryEntry {
        let seq = self.entries.len() as u32 + 1;
        self.entries.push(HistoryEntry {
            seq,
            action,
            status,
            result: result.into(),
            timestamp: Utc::now(),
        });
        &self.entries[self.entries.len() - 1]
    }

    pub fn entries(&self) -> &[HistoryEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn last(&self) -> Option<&HistoryEntry> {
        self.entries.last()
    }

    /// The most recent `max_entries` entries verbatim. Older entries are
    /// replaced by one marker line counting them per action.
    pub fn render(&self, max_entries: usize) -> String {
        if self.entries.is_empty() {
            return String::new();
        }
        let keep = max_entries.min(self.entries.len());
        let dropped = &self.entries[..self.entries.len() - keep];
        let mut parts = Vec::new();
        if !dropped.is_empty() {
            parts.push(summarize(dropped));
        }
        for entry in &self.entries[self.entries.len() - keep..] {
            parts.push(entry.render());
        }
        parts.join("\n\n")
    }
}

fn summarize(dropped: &[HistoryEntry]) -> String {
    let mut counts: BTreeMap<Action, (usize, usize)> = BTreeMap::new();
    for entry in dropped {
        let slot = counts.entry(entry.action).or_default();
        slot.0 += 1;
        if entry.status != EntryStatus::Ok {
            slot.1 += 1;
        }
    }
    let detail: Vec<String> = counts
        .iter()
        .map(|(action, (total, failed))| format!("{action} x{total} ({failed} failed)"))
        .collect();
    format!(
        "[... {} earlier entries summarized: {}]",
        dropped.len(),
        detail.join(", ")
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_numbers_are_monotonic() {
        let mut history = SessionHistory::new();
        history.push(Action::Retrieve, EntryStatus::Ok, "3 fragments");
        history.push(Action::Generate, EntryStatus::Transient, "rate limited");
        let seqs: Vec<u32> = history.entries().iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![1, 2]);
        assert!(history.entries()[0].timestamp <= history.entries()[1].timestamp);
    }

    #[test]
    fn render_keeps_everything_under_the_cap() {
        let mut history = SessionHistory::new();
        history.push(Action::Generate, EntryStatus::Ok, "diff for app.py");
        history.push(Action::Apply, EntryStatus::Failed, "context mismatch");
        let text = history.render(5);
        assert_eq!(
            text,
            "#1 generate [ok]\ndiff for app.py\n\n#2 apply [failed]\ncontext mismatch"
        );
    }

    #[test]
    fn overflow_is_marked_never_silently_dropped() {
        let mut history = SessionHistory::new();
        history.push(Action::Retrieve, EntryStatus::Ok, "r");
        history.push(Action::Generate, EntryStatus::Ok, "g1");
        history.push(Action::Apply, EntryStatus::Failed, "a1");
        history.push(Action::Generate, EntryStatus::Ok, "g2");
        history.push(Action::Apply, EntryStatus::Ok, "a2");
        let text = history.render(2);
        assert!(text.starts_with(
            "[... 3 earlier entries summarized: retrieve x1 (0 failed), generate x1 (0 failed), apply x1 (1 failed)]"
        ));
        assert!(text.contains("#4 generate"));
        assert!(text.contains("#5 apply"));
        assert!(!text.contains("#3 apply"));
        assert_eq!(history.len(), 5);
    }

    #[test]
    fn zero_cap_still_reports_the_count() {
        let mut history = SessionHistory::new();
        history.push(Action::Build, EntryStatus::Failed, "error[E0308]");
        assert_eq!(
            history.render(0),
            "[... 1 earlier entries summarized: build x1 (1 failed)]"
        );
    }
}
