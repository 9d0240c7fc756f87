//! Read-only analysis of a pull-request diff against the repository graph.

use crate::error::StoreError;
use crate::exec::patch::UnifiedDiff;
use crate::model::{EdgeKind, GraphNode, GraphScope, NodeId, NodeKind};
use crate::store::GraphStore;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FindingKind {
    /// The diff touches a file the graph has no record of.
    UnknownFile,
    /// A function whose span overlaps a changed hunk.
    ChangedFunction,
    /// A caller of a changed function that the diff leaves alone.
    ExternalCaller,
    /// A deleted file that other files still import.
    BrokenImport,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewFinding {
    pub kind: FindingKind,
    pub severity: Severity,
    pub file: String,
    pub line: Option<i64>,
    pub symbol: Option<String>,
    pub message: String,
}

impl fmt::Display for ReviewFinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.line {
            Some(line) => write!(f, "[{}] {}:{} {}", self.severity.as_str(), self.file, line, self.message),
            None => write!(f, "[{}] {} {}", self.severity.as_str(), self.file, self.message),
        }
    }
}

pub fn review_diff(
    store: &dyn GraphStore,
    scope: &GraphScope,
    diff: &UnifiedDiff,
) -> Result<Vec<ReviewFinding>, StoreError> {
    let touched: BTreeSet<&str> = diff.touched_paths().into_iter().collect();
    let mut findings = Vec::new();
    let mut changed: BTreeMap<NodeId, GraphNode> = BTreeMap::new();

    for file in &diff.files {
        let Some(old_path) = file.old_path.as_deref() else {
            continue;
        };
        let nodes = store.nodes_in_file(scope, old_path)?;
        let Some(file_node) = nodes.iter().find(|node| node.kind == NodeKind::File) else {
            findings.push(ReviewFinding {
                kind: FindingKind::UnknownFile,
                severity: Severity::Info,
                file: old_path.to_string(),
                line: None,
                symbol: None,
                message: "not in the repository graph; changes here were not analyzed".to_string(),
            });
            continue;
        };

        if file.is_deleted() {
            let importers = store.edges_touching(std::slice::from_ref(&file_node.id), &[EdgeKind::Imports])?;
            let sources: Vec<NodeId> = importers
                .into_iter()
                .filter(|edge| edge.target == file_node.id)
                .map(|edge| edge.source)
                .collect();
            for importer in store.get_nodes(&sources)? {
                if touched.contains(importer.file_path()) {
                    continue;
                }
                findings.push(ReviewFinding {
                    kind: FindingKind::BrokenImport,
                    severity: Severity::Error,
                    file: importer.file_path().to_string(),
                    line: None,
                    symbol: None,
                    message: format!("imports {old_path}, which this diff deletes"),
                });
            }
            continue;
        }

        let ranges: Vec<(i64, i64)> = file
            .hunks
            .iter()
            .map(|hunk| {
                let (start, end) = hunk.changed_old_range();
                (start as i64, end as i64)
            })
            .collect();
        for node in nodes.iter().filter(|node| node.kind == NodeKind::Function) {
            let (start, end) = (node.start_line(), node.end_line());
            if ranges.iter().any(|&(s, e)| s <= end && start <= e) {
                changed.insert(node.id.clone(), node.clone());
            }
        }
    }

    for function in changed.values() {
        findings.push(ReviewFinding {
            kind: FindingKind::ChangedFunction,
            severity: Severity::Info,
            file: function.file_path().to_string(),
            line: Some(function.start_line()),
            symbol: Some(function.qualname.clone()),
            message: format!("changes {}", function.qualname),
        });
    }

    if !changed.is_empty() {
        let ids: Vec<NodeId> = changed.keys().cloned().collect();
        let calls = store.edges_touching(&ids, &[EdgeKind::Calls])?;
        let mut callers: BTreeMap<NodeId, BTreeSet<NodeId>> = BTreeMap::new();
        for edge in calls {
            if changed.contains_key(&edge.target) && !changed.contains_key(&edge.source) {
                callers.entry(edge.source).or_default().insert(edge.target);
            }
        }
        let caller_ids: Vec<NodeId> = callers.keys().cloned().collect();
        for caller in store.get_nodes(&caller_ids)? {
            if touched.contains(caller.file_path()) {
                continue;
            }
            let Some(targets) = callers.get(&caller.id) else {
                continue;
            };
            for target in targets {
                let Some(callee) = changed.get(target) else {
                    continue;
                };
                findings.push(ReviewFinding {
                    kind: FindingKind::ExternalCaller,
                    severity: Severity::Warning,
                    file: caller.file_path().to_string(),
                    line: Some(caller.start_line()),
                    symbol: Some(caller.qualname.clone()),
                    message: format!(
                        "{} calls changed {} and is not part of this diff",
                        caller.qualname, callee.qualname
                    ),
                });
            }
        }
    }

    findings.sort_by(|a, b| {
        (&a.file, a.line, a.kind, &a.message).cmp(&(&b.file, b.line, b.kind, &b.message))
    });
    findings.dedup();
    Ok(findings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryGraphStore;
    use crate::store::tests_support::{edge, file_node, scope, symbol_node};

    fn graph() -> MemoryGraphStore {
        let store = MemoryGraphStore::new();
        let scope = scope("v1");
        let util = file_node(&scope, "util.py");
        let main = file_node(&scope, "main.py");
        let helper = symbol_node(&scope, "util.py", "helper", NodeKind::Function, 1);
        let other = symbol_node(&scope, "util.py", "other", NodeKind::Function, 10);
        let run = symbol_node(&scope, "main.py", "run", NodeKind::Function, 3);
        let edges = vec![
            edge(&util, &helper, EdgeKind::Contains),
            edge(&util, &other, EdgeKind::Contains),
            edge(&main, &run, EdgeKind::Contains),
            edge(&run, &helper, EdgeKind::Calls),
            edge(&main, &util, EdgeKind::Imports),
        ];
        store
            .write_batch(&[util, main, helper, other, run], &edges)
            .unwrap();
        store
    }

    #[test]
    fn reports_changed_functions_and_outside_callers() {
        let store = graph();
        let diff = UnifiedDiff::parse(
            "--- a/util.py\n+++ b/util.py\n@@ -1,3 +1,3 @@\n def helper():\n-    return 1\n+    return 2\n \n",
        )
        .unwrap();
        let findings = review_diff(&store, &scope("v1"), &diff).unwrap();
        let kinds: Vec<FindingKind> = findings.iter().map(|f| f.kind).collect();
        assert_eq!(kinds, vec![FindingKind::ExternalCaller, FindingKind::ChangedFunction]);
        assert_eq!(findings[0].file, "main.py");
        assert_eq!(findings[1].symbol.as_deref(), Some("util.helper"));
    }

    #[test]
    fn deleted_imported_file_is_an_error() {
        let store = graph();
        let diff = UnifiedDiff::parse(
            "--- a/util.py\n+++ /dev/null\n@@ -1,1 +0,0 @@\n-def helper():\n",
        )
        .unwrap();
        let findings = review_diff(&store, &scope("v1"), &diff).unwrap();
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].kind, FindingKind::BrokenImport);
        assert_eq!(findings[0].severity, Severity::Error);
        assert_eq!(findings[0].to_string(), "[error] main.py imports util.py, which this diff deletes");
    }

    #[test]
    fn unknown_files_are_flagged() {
        let store = graph();
        let diff =
            UnifiedDiff::parse("--- a/docs.md\n+++ b/docs.md\n@@ -1 +1 @@\n-a\n+b\n").unwrap();
        let findings = review_diff(&store, &scope("v1"), &diff).unwrap();
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].kind, FindingKind::UnknownFile);
    }
}
