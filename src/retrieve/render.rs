use crate::model::{ContextFragment, GraphNode};
use crate::util;
use std::collections::HashMap;

pub fn estimate_tokens(text: &str, chars_per_token: usize) -> usize {
    text.chars().count().div_ceil(chars_per_token.max(1))
}

/// Renders graph nodes as header plus source excerpt. Sources are the file
/// texts stored with the graph, handed in by path.
pub struct FragmentRenderer {
    max_lines: usize,
    chars_per_token: usize,
    sources: HashMap<String, String>,
    /// path -> rendered (start, end) line ranges
    emitted: HashMap<String, Vec<(i64, i64)>>,
}

impl FragmentRenderer {
    pub fn new(max_lines: usize, chars_per_token: usize) -> Self {
        Self {
            max_lines: max_lines.max(1),
            chars_per_token,
            sources: HashMap::new(),
            emitted: HashMap::new(),
        }
    }

    pub fn add_source(&mut self, path: &str, text: String) {
        self.sources.insert(path.to_string(), text);
    }

    /// True when an already accepted fragment shows every line of `node`.
    pub fn is_covered(&self, node: &GraphNode) -> bool {
        let (start, end) = self.visible_range(node);
        self.emitted
            .get(node.file_path())
            .is_some_and(|ranges| ranges.iter().any(|&(s, e)| start >= s && end <= e))
    }

    pub fn mark_emitted(&mut self, fragment: &ContextFragment) {
        let shown_end = fragment
            .end_line
            .min(fragment.start_line + self.max_lines as i64 - 1);
        self.emitted
            .entry(fragment.file_path.clone())
            .or_default()
            .push((fragment.start_line, shown_end));
    }

    pub fn render(&mut self, node: &GraphNode, distance: u32, score: f64) -> ContextFragment {
        let path = node.file_path().to_string();
        let start = node.start_line().max(1);
        let end = node.end_line().max(start);
        let (_, shown_end) = self.visible_range(node);

        let mut text = format!("{path}:{start}-{end} {} {}", node.kind, node.qualname);
        if let Some(source) = self.sources.get(&path) {
            let body = util::slice_lines(source, start, shown_end);
            if !body.is_empty() {
                text.push('\n');
                text.push_str(&body);
            }
            if shown_end < end {
                text.push_str(&format!("\n... ({} more lines)", end - shown_end));
            }
        }
        let estimated_tokens = estimate_tokens(&text, self.chars_per_token);
        ContextFragment {
            node_id: node.id.clone(),
            kind: node.kind,
            qualname: node.qualname.clone(),
            file_path: path,
            start_line: start,
            end_line: end,
            distance,
            score,
            estimated_tokens,
            text,
        }
    }

    fn visible_range(&self, node: &GraphNode) -> (i64, i64) {
        let start = node.start_line().max(1);
        let end = node.end_line().max(start);
        (start, end.min(start + self.max_lines as i64 - 1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{NodeId, NodeKind, SourceSpan};

    fn node(path: &str, start: i64, end: i64) -> GraphNode {
        GraphNode {
            id: NodeId::from("n_1"),
            kind: NodeKind::Function,
            name: "helper".to_string(),
            qualname: "util.helper".to_string(),
            span: Some(SourceSpan {
                file: path.to_string(),
                start_line: start,
                start_col: 1,
                end_line: end,
                end_col: 1,
            }),
            language: Some("python".to_string()),
            depth: 1,
            signature: None,
            repository: "/repo".to_string(),
            revision: "v1".to_string(),
            text: None,
        }
    }

    #[test]
    fn tokens_round_up() {
        assert_eq!(estimate_tokens("", 4), 0);
        assert_eq!(estimate_tokens("abcde", 4), 2);
        assert_eq!(estimate_tokens("abcd", 0), 4);
    }

    #[test]
    fn renders_header_and_capped_body() {
        let mut renderer = FragmentRenderer::new(2, 4);
        renderer.add_source("util.py", "a\nb\nc\nd\ne\n".to_string());
        let fragment = renderer.render(&node("util.py", 2, 5), 0, 1.0);
        assert_eq!(
            fragment.text,
            "util.py:2-5 function util.helper\nb\nc\n... (2 more lines)"
        );
        assert_eq!(fragment.estimated_tokens, fragment.text.chars().count().div_ceil(4));
    }

    #[test]
    fn missing_source_renders_header_only() {
        let mut renderer = FragmentRenderer::new(10, 4);
        let fragment = renderer.render(&node("gone.py", 1, 3), 1, 0.5);
        assert_eq!(fragment.text, "gone.py:1-3 function util.helper");
    }

    #[test]
    fn nested_ranges_are_covered() {
        let mut renderer = FragmentRenderer::new(80, 4);
        let outer = renderer.render(&node("util.py", 1, 30), 0, 1.0);
        renderer.mark_emitted(&outer);
        assert!(renderer.is_covered(&node("util.py", 3, 9)));
        assert!(!renderer.is_covered(&node("util.py", 25, 40)));
        assert!(!renderer.is_covered(&node("other.py", 3, 9)));
    }
}
