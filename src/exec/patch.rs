//! Unified diffs as produced by a completion backend.
//!
//! Generated diffs are parsed strictly (hunk line counts must agree with their
//! headers) and re-rendered in the canonical `diff --git` form git applies.

use crate::error::PatchError;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;

const NULL_PATH: &str = "/dev/null";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HunkLine {
    Context(String),
    Added(String),
    Removed(String),
    /// `\ No newline at end of file`, attached to the preceding line.
    NoNewline,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hunk {
    pub old_start: usize,
    pub old_lines: usize,
    pub new_start: usize,
    pub new_lines: usize,
    pub lines: Vec<HunkLine>,
}

impl Hunk {
    /// Old-side line range this hunk rewrites, ignoring leading and trailing context.
    pub fn changed_old_range(&self) -> (usize, usize) {
        let mut line = self.old_start;
        let mut first = None;
        let mut last = self.old_start;
        for entry in &self.lines {
            match entry {
                HunkLine::Context(_) => line += 1,
                HunkLine::Removed(_) => {
                    first.get_or_insert(line);
                    last = line;
                    line += 1;
                }
                HunkLine::Added(_) => {
                    first.get_or_insert(line);
                    last = last.max(line.saturating_sub(1));
                }
                HunkLine::NoNewline => {}
            }
        }
        let first = first.unwrap_or(self.old_start).max(1);
        (first, last.max(first))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilePatch {
    /// `None` for a created file.
    pub old_path: Option<String>,
    /// `None` for a deleted file.
    pub new_path: Option<String>,
    pub hunks: Vec<Hunk>,
}

impl FilePatch {
    pub fn path(&self) -> &str {
        self.new_path
            .as_deref()
            .or(self.old_path.as_deref())
            .unwrap_or_default()
    }

    pub fn is_new(&self) -> bool {
        self.old_path.is_none()
    }

    pub fn is_deleted(&self) -> bool {
        self.new_path.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnifiedDiff {
    pub files: Vec<FilePatch>,
}

impl UnifiedDiff {
    pub fn parse(text: &str) -> Result<Self, PatchError> {
        Parser::new(text).parse()
    }

    /// Locate a diff in free-form completion text and parse it.
    pub fn from_completion(text: &str) -> Result<Self, PatchError> {
        let body = extract_diff(text)
            .ok_or_else(|| PatchError::Malformed("no diff found in completion".to_string()))?;
        Self::parse(&body)
    }

    pub fn touched_paths(&self) -> Vec<&str> {
        let mut paths: Vec<&str> = self.files.iter().map(FilePatch::path).collect();
        paths.sort();
        paths.dedup();
        paths
    }

    pub fn lines_changed(&self) -> (usize, usize) {
        let mut added = 0;
        let mut removed = 0;
        for line in self.files.iter().flat_map(|f| &f.hunks).flat_map(|h| &h.lines) {
            match line {
                HunkLine::Added(_) => added += 1,
                HunkLine::Removed(_) => removed += 1,
                _ => {}
            }
        }
        (added, removed)
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for file in &self.files {
            let old = file.old_path.as_deref().unwrap_or_else(|| file.path());
            let new = file.new_path.as_deref().unwrap_or_else(|| file.path());
            let _ = writeln!(out, "diff --git a/{old} b/{new}");
            if file.is_new() {
                out.push_str("new file mode 100644\n");
            } else if file.is_deleted() {
                out.push_str("deleted file mode 100644\n");
            }
            match &file.old_path {
                Some(path) => {
                    let _ = writeln!(out, "--- a/{path}");
                }
                None => {
                    let _ = writeln!(out, "--- {NULL_PATH}");
                }
            }
            match &file.new_path {
                Some(path) => {
                    let _ = writeln!(out, "+++ b/{path}");
                }
                None => {
                    let _ = writeln!(out, "+++ {NULL_PATH}");
                }
            }
            for hunk in &file.hunks {
                let _ = writeln!(
                    out,
                    "@@ -{},{} +{},{} @@",
                    hunk.old_start, hunk.old_lines, hunk.new_start, hunk.new_lines
                );
                for line in &hunk.lines {
                    match line {
                        HunkLine::Context(text) => {
                            let _ = writeln!(out, " {text}");
                        }
                        HunkLine::Added(text) => {
                            let _ = writeln!(out, "+{text}");
                        }
                        HunkLine::Removed(text) => {
                            let _ = writeln!(out, "-{text}");
                        }
                        HunkLine::NoNewline => out.push_str("\\ No newline at end of file\n"),
                    }
                }
            }
        }
        out
    }
}

/// Body of the first ```diff (or ```patch) fence, else the text from the first
/// diff header onwards.
pub fn extract_diff(text: &str) -> Option<String> {
    let mut in_fence = false;
    let mut fenced = Vec::new();
    for line in text.lines() {
        let trimmed = line.trim_start();
        if !in_fence {
            if let Some(lang) = trimmed.strip_prefix("```") {
                let lang = lang.trim();
                if lang == "diff" || lang == "patch" || lang == "udiff" {
                    in_fence = true;
                }
            }
            continue;
        }
        if trimmed.starts_with("```") {
            break;
        }
        fenced.push(line);
    }
    if !fenced.is_empty() {
        return Some(join_lines(&fenced));
    }

    let lines: Vec<&str> = text.lines().collect();
    let start = lines
        .iter()
        .position(|line| line.starts_with("diff --git ") || line.starts_with("--- "))?;
    let mut body: Vec<&str> = lines[start..].to_vec();
    if let Some(end) = body.iter().position(|line| line.trim_start().starts_with("```")) {
        body.truncate(end);
    }
    Some(join_lines(&body))
}

fn join_lines(lines: &[&str]) -> String {
    let mut out = lines.join("\n");
    out.push('\n');
    out
}

struct Parser<'a> {
    lines: Vec<&'a str>,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(text: &'a str) -> Self {
        Self {
            lines: text.lines().collect(),
            pos: 0,
        }
    }

    fn peek(&self) -> Option<&'a str> {
        self.lines.get(self.pos).copied()
    }

    fn parse(mut self) -> Result<UnifiedDiff, PatchError> {
        let mut files = Vec::new();
        while let Some(line) = self.peek() {
            if line.starts_with("diff --git ") || line.starts_with("--- ") {
                files.push(self.file()?);
            } else {
                self.pos += 1;
            }
        }
        if files.is_empty() {
            return Err(PatchError::Malformed("no file headers".to_string()));
        }
        Ok(UnifiedDiff { files })
    }

    fn file(&mut self) -> Result<FilePatch, PatchError> {
        let mut git_paths = None;
        if let Some(line) = self.peek()
            && let Some(rest) = line.strip_prefix("diff --git ")
        {
            git_paths = parse_git_header(rest);
            self.pos += 1;
        }

        // Extended headers (index, mode, similarity) carry nothing we need.
        while let Some(line) = self.peek() {
            if line.starts_with("--- ") || line.starts_with("diff --git ") || line.starts_with("@@") {
                break;
            }
            self.pos += 1;
        }

        let (old_path, new_path) = match self.peek() {
            Some(line) if line.starts_with("--- ") => {
                let old = header_path(&line[4..], "a/")?;
                self.pos += 1;
                let new = match self.peek() {
                    Some(next) if next.starts_with("+++ ") => header_path(&next[4..], "b/")?,
                    _ => return Err(PatchError::Malformed(format!("missing +++ after {line}"))),
                };
                self.pos += 1;
                (old, new)
            }
            _ => match git_paths {
                Some((old, new)) => (Some(old), Some(new)),
                None => return Err(PatchError::Malformed("missing file header".to_string())),
            },
        };
        if old_path.is_none() && new_path.is_none() {
            return Err(PatchError::Malformed("both sides are /dev/null".to_string()));
        }

        let mut hunks = Vec::new();
        while let Some(line) = self.peek() {
            if !line.starts_with("@@") {
                break;
            }
            hunks.push(self.hunk()?);
        }
        let display = new_path.as_deref().or(old_path.as_deref()).unwrap_or_default();
        if hunks.is_empty() {
            return Err(PatchError::Malformed(format!("no hunks for {display}")));
        }
        Ok(FilePatch {
            old_path,
            new_path,
            hunks,
        })
    }

    fn hunk(&mut self) -> Result<Hunk, PatchError> {
        let header = self.peek().unwrap_or_default();
        let (old_start, old_lines, new_start, new_lines) = parse_hunk_header(header)
            .ok_or_else(|| PatchError::Malformed(format!("bad hunk header: {header}")))?;
        self.pos += 1;

        let mut lines = Vec::new();
        let mut old_seen = 0;
        let mut new_seen = 0;
        while old_seen < old_lines || new_seen < new_lines {
            let Some(line) = self.peek() else {
                return Err(PatchError::Malformed(format!(
                    "hunk {header} ends early: expected -{old_lines} +{new_lines}, got -{old_seen} +{new_seen}"
                )));
            };
            if let Some(text) = line.strip_prefix('+') {
                lines.push(HunkLine::Added(text.to_string()));
                new_seen += 1;
            } else if let Some(text) = line.strip_prefix('-') {
                lines.push(HunkLine::Removed(text.to_string()));
                old_seen += 1;
            } else if let Some(text) = line.strip_prefix(' ') {
                lines.push(HunkLine::Context(text.to_string()));
                old_seen += 1;
                new_seen += 1;
            } else if line.is_empty() {
                // Blank context lines often lose their leading space.
                lines.push(HunkLine::Context(String::new()));
                old_seen += 1;
                new_seen += 1;
            } else if line.starts_with('\\') {
                lines.push(HunkLine::NoNewline);
            } else {
                return Err(PatchError::Malformed(format!(
                    "hunk {header} ends early at: {line}"
                )));
            }
            self.pos += 1;
            if old_seen > old_lines || new_seen > new_lines {
                return Err(PatchError::Malformed(format!(
                    "hunk {header} has more lines than its header declares"
                )));
            }
        }
        if let Some(line) = self.peek()
            && line.starts_with('\\')
        {
            lines.push(HunkLine::NoNewline);
            self.pos += 1;
        }
        if let Some(line) = self.peek()
            && (line.starts_with('+') || line.starts_with('-') || line.starts_with(' '))
            && !line.starts_with("--- ")
            && !line.starts_with("+++ ")
        {
            return Err(PatchError::Malformed(format!(
                "hunk {header} has more lines than its header declares"
            )));
        }
        Ok(Hunk {
            old_start,
            old_lines,
            new_start,
            new_lines,
            lines,
        })
    }
}

fn parse_git_header(rest: &str) -> Option<(String, String)> {
    let (old, new) = rest.split_once(" b/")?;
    let old = old.strip_prefix("a/")?;
    Some((old.to_string(), new.to_string()))
}

fn header_path(raw: &str, prefix: &str) -> Result<Option<String>, PatchError> {
    // Drop a trailing timestamp (`--- a/x\t2024-01-01 ...`).
    let raw = raw.split('\t').next().unwrap_or_default().trim();
    if raw == NULL_PATH {
        return Ok(None);
    }
    let path = raw.strip_prefix(prefix).unwrap_or(raw);
    validate_path(path)?;
    Ok(Some(path.to_string()))
}

fn validate_path(path: &str) -> Result<(), PatchError> {
    if path.is_empty()
        || path.starts_with('/')
        || path.split('/').any(|part| part == "..")
        || path.split('/').next() == Some(".git")
    {
        return Err(PatchError::Malformed(format!("path escapes checkout: {path}")));
    }
    Ok(())
}

fn parse_hunk_header(line: &str) -> Option<(usize, usize, usize, usize)> {
    let rest = line.strip_prefix("@@ ")?;
    let (ranges, _) = rest.split_once(" @@")?;
    let (old, new) = ranges.split_once(' ')?;
    let (old_start, old_lines) = parse_range(old.strip_prefix('-')?)?;
    let (new_start, new_lines) = parse_range(new.strip_prefix('+')?)?;
    Some((old_start, old_lines, new_start, new_lines))
}

fn parse_range(range: &str) -> Option<(usize, usize)> {
    match range.split_once(',') {
        Some((start, count)) => Some((start.parse().ok()?, count.parse().ok()?)),
        None => Some((range.parse().ok()?, 1)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIMPLE: &str = "\
--- a/app.py
+++ b/app.py
@@ -1,3 +1,3 @@
 def helper():
-    return 1
+    return 2

";

    #[test]
    fn parses_and_renders_canonically() {
        let diff = UnifiedDiff::parse(SIMPLE).unwrap();
        assert_eq!(diff.touched_paths(), vec!["app.py"]);
        assert_eq!(diff.lines_changed(), (1, 1));
        let rendered = diff.render();
        assert!(rendered.starts_with("diff --git a/app.py b/app.py\n--- a/app.py\n+++ b/app.py\n"));
        assert!(rendered.contains("@@ -1,3 +1,3 @@\n def helper():\n-    return 1\n+    return 2\n \n"));
        assert_eq!(UnifiedDiff::parse(&rendered).unwrap(), diff);
    }

    #[test]
    fn hunk_counts_must_match() {
        let short = "--- a/x.py\n+++ b/x.py\n@@ -1,3 +1,3 @@\n a\n-b\n+c\n";
        assert!(matches!(
            UnifiedDiff::parse(short),
            Err(PatchError::Malformed(_))
        ));
        let long = "--- a/x.py\n+++ b/x.py\n@@ -1,1 +1,1 @@\n-b\n+c\n+d\n";
        assert!(matches!(
            UnifiedDiff::parse(long),
            Err(PatchError::Malformed(_))
        ));
    }

    #[test]
    fn prose_without_a_diff_is_malformed() {
        assert!(UnifiedDiff::from_completion("I think you should rename it.").is_err());
        assert!(UnifiedDiff::parse("--- a/x.py\n+++ b/x.py\n").is_err());
    }

    #[test]
    fn new_and_deleted_files() {
        let text = "\
diff --git a/new.py b/new.py
new file mode 100644
--- /dev/null
+++ b/new.py
@@ -0,0 +1,1 @@
+print('hi')
diff --git a/old.py b/old.py
deleted file mode 100644
--- a/old.py
+++ /dev/null
@@ -1 +0,0 @@
-x = 1
";
        let diff = UnifiedDiff::parse(text).unwrap();
        assert!(diff.files[0].is_new());
        assert!(diff.files[1].is_deleted());
        assert_eq!(diff.touched_paths(), vec!["new.py", "old.py"]);
        let rendered = diff.render();
        assert!(rendered.contains("new file mode 100644\n--- /dev/null\n+++ b/new.py\n"));
        assert!(rendered.contains("--- a/old.py\n+++ /dev/null\n@@ -1,1 +0,0 @@\n"));
    }

    #[test]
    fn extracts_fenced_diff_from_prose() {
        let completion = format!("Here is the fix:\n\n```diff\n{SIMPLE}```\n\nThis changes the value.");
        let diff = UnifiedDiff::from_completion(&completion).unwrap();
        assert_eq!(diff.files.len(), 1);
    }

    #[test]
    fn extracts_bare_diff_after_preamble() {
        let completion = format!("Patch follows.\n{SIMPLE}");
        assert_eq!(extract_diff(&completion).unwrap(), SIMPLE);
    }

    #[test]
    fn rejects_paths_outside_the_checkout() {
        let text = "--- a/../etc/passwd\n+++ b/../etc/passwd\n@@ -1 +1 @@\n-a\n+b\n";
        assert!(UnifiedDiff::parse(text).is_err());
    }

    #[test]
    fn changed_range_skips_context() {
        let diff = UnifiedDiff::parse(SIMPLE).unwrap();
        assert_eq!(diff.files[0].hunks[0].changed_old_range(), (2, 2));
    }
}
