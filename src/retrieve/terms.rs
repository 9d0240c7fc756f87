use crate::indexer::scan::language_specs;
use std::collections::BTreeSet;

const STOP_WORDS: &[&str] = &[
    "a", "about", "after", "all", "also", "an", "and", "any", "are", "as", "at", "be", "because",
    "been", "before", "bug", "but", "by", "call", "called", "calls", "can", "class", "code",
    "could", "does", "doesn", "error", "file", "files", "fix", "for", "from", "function", "get",
    "has", "have", "how", "if", "in", "into", "is", "issue", "it", "its", "make", "method", "more",
    "not", "of", "on", "or", "please", "return", "returns", "should", "so", "some", "that", "the",
    "their", "then", "there", "this", "to", "use", "used", "uses", "using", "was", "what", "when",
    "where", "which", "while", "why", "will", "with", "would", "wrong",
];

const TRIM_CHARS: &[char] = &[
    '"', '\'', '(', ')', ',', '.', ':', ';', '!', '?', '[', ']', '{', '}', '<', '>',
];

const MIN_PHRASE_CHARS: usize = 4;

// A leading `.` belongs to relative paths such as `./src/lib.rs`.
const LEAD_CHARS: &[char] = &['"', '\'', '(', '[', '{', '<'];

/// Query decomposed into what can be looked up in the graph.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryTerms {
    /// Repository-relative path fragments, matched against File nodes.
    pub paths: Vec<String>,
    /// Symbol names, matched against Function, Type and Module nodes.
    pub identifiers: Vec<String>,
    /// Quoted text, matched verbatim against ingested file contents.
    pub phrases: Vec<String>,
}

impl QueryTerms {
    pub fn is_empty(&self) -> bool {
        self.paths.is_empty() && self.identifiers.is_empty() && self.phrases.is_empty()
    }
}

pub fn extract_terms(query: &str) -> QueryTerms {
    let mut terms = QueryTerms::default();
    let mut seen_paths = BTreeSet::new();
    let mut seen_idents = BTreeSet::new();

    let mut seen_phrases = BTreeSet::new();

    let (quoted, rest) = split_backticks(query);
    for token in quoted {
        if token.contains(char::is_whitespace) {
            add_phrase(&token, &mut terms, &mut seen_phrases);
        } else {
            classify(&token, true, &mut terms, &mut seen_paths, &mut seen_idents);
        }
    }
    for span in spans_between(&rest, '"', '"')
        .into_iter()
        .chain(spans_between(&rest, '\u{201c}', '\u{201d}'))
    {
        add_phrase(span, &mut terms, &mut seen_phrases);
    }
    for token in rest.split_whitespace() {
        classify(token, false, &mut terms, &mut seen_paths, &mut seen_idents);
    }
    terms
}

fn add_phrase(raw: &str, terms: &mut QueryTerms, seen: &mut BTreeSet<String>) {
    let phrase = raw.trim();
    if phrase.chars().count() < MIN_PHRASE_CHARS || !phrase.chars().any(char::is_alphanumeric) {
        return;
    }
    if seen.insert(phrase.to_ascii_lowercase()) {
        terms.phrases.push(phrase.to_string());
    }
}

/// Text between each `open` and the next `close`. An unclosed span is dropped.
fn spans_between(text: &str, open: char, close: char) -> Vec<&str> {
    let mut spans = Vec::new();
    let mut rest = text;
    while let Some(start) = rest.find(open) {
        let after = &rest[start + open.len_utf8()..];
        let Some(len) = after.find(close) else {
            break;
        };
        spans.push(&after[..len]);
        rest = &after[len + close.len_utf8()..];
    }
    spans
}

/// Backticked spans are taken whole; the remaining text is returned for
/// whitespace tokenizing.
fn split_backticks(query: &str) -> (Vec<String>, String) {
    let mut quoted = Vec::new();
    let mut rest = String::with_capacity(query.len());
    let mut parts = query.split('`');
    if let Some(first) = parts.next() {
        rest.push_str(first);
    }
    let mut inside = true;
    for part in parts {
        if inside {
            let trimmed = part.trim();
            if !trimmed.is_empty() {
                quoted.push(trimmed.to_string());
            }
        } else {
            rest.push(' ');
            rest.push_str(part);
        }
        inside = !inside;
    }
    (quoted, rest)
}

fn classify(
    raw: &str,
    quoted: bool,
    terms: &mut QueryTerms,
    seen_paths: &mut BTreeSet<String>,
    seen_idents: &mut BTreeSet<String>,
) {
    let called = raw.contains("()");
    let token = raw.replace("()", "");
    let token = token
        .trim_end_matches(TRIM_CHARS)
        .trim_start_matches(LEAD_CHARS);
    if token.is_empty() {
        return;
    }

    if looks_like_path(token) {
        let path = token.trim_start_matches("./").to_string();
        if !path.is_empty() && seen_paths.insert(path.clone()) {
            terms.paths.push(path);
        }
        return;
    }

    // Qualified names contribute their last segment.
    let name = token
        .rsplit("::")
        .next()
        .and_then(|tail| tail.rsplit('.').next())
        .unwrap_or(token)
        .trim_matches(TRIM_CHARS);
    if !is_identifier(name) {
        return;
    }
    let explicit = quoted || called || is_snake_case(name) || is_camel_case(name);
    if !explicit {
        let lowered = name.to_ascii_lowercase();
        if name.len() < 3 || STOP_WORDS.contains(&lowered.as_str()) {
            return;
        }
    }
    if seen_idents.insert(name.to_string()) {
        terms.identifiers.push(name.to_string());
    }
}

fn looks_like_path(token: &str) -> bool {
    if token.contains("::") {
        return false;
    }
    if token.contains('/') {
        return token.chars().any(|ch| ch.is_ascii_alphanumeric());
    }
    match token.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => language_specs()
            .iter()
            .any(|spec| spec.extensions.contains(&ext)),
        _ => false,
    }
}

fn is_identifier(token: &str) -> bool {
    let mut chars = token.chars();
    match chars.next() {
        Some(first) if first.is_alphabetic() || first == '_' => {}
        _ => return false,
    }
    chars.all(|ch| ch.is_alphanumeric() || ch == '_')
}

fn is_snake_case(token: &str) -> bool {
    let trimmed = token.trim_matches('_');
    trimmed.contains('_')
}

fn is_camel_case(token: &str) -> bool {
    token.chars().skip(1).any(|ch| ch.is_uppercase())
        && token.chars().any(|ch| ch.is_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_and_identifiers_are_separated() {
        let terms = extract_terms("src/util.py: `parse_config` calls LoadSettings()");
        assert_eq!(terms.paths, vec!["src/util.py"]);
        assert_eq!(terms.identifiers, vec!["parse_config", "LoadSettings"]);
    }

    #[test]
    fn stop_words_and_short_words_are_dropped() {
        let terms = extract_terms("Please fix the bug in it");
        assert!(terms.is_empty());
    }

    #[test]
    fn plain_words_are_kept_as_identifiers() {
        let terms = extract_terms("why does helper return None?");
        assert_eq!(terms.identifiers, vec!["helper", "None"]);
    }

    #[test]
    fn qualified_names_use_last_segment() {
        let terms = extract_terms("see store::sqlite::open and app.models.User");
        assert!(terms.identifiers.contains(&"open".to_string()));
        assert!(terms.identifiers.contains(&"User".to_string()));
        assert!(terms.paths.is_empty());
    }

    #[test]
    fn bare_file_names_with_known_extensions_are_paths() {
        let terms = extract_terms("look at main.rs and ./lib/index.js, not v1.2");
        assert_eq!(terms.paths, vec!["main.rs", "lib/index.js"]);
        assert!(!terms.identifiers.iter().any(|ident| ident.contains('.')));
    }

    #[test]
    fn quoted_text_becomes_phrases() {
        let terms = extract_terms(
            r#"it fails with "connection refused by peer" and `retry budget exhausted`, also "ok""#,
        );
        assert_eq!(
            terms.phrases,
            vec!["retry budget exhausted", "connection refused by peer"]
        );
        assert!(terms.identifiers.contains(&"connection".to_string()));

        let curly = extract_terms("see \u{201c}Getting started\u{201d} and \"unclosed");
        assert_eq!(curly.phrases, vec!["Getting started"]);
    }

    #[test]
    fn duplicates_are_removed_in_order() {
        let terms = extract_terms("`helper` helper helper() other_thing");
        assert_eq!(terms.identifiers, vec!["helper", "other_thing"]);
    }
}
