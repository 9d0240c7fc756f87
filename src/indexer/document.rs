//! Prose files are not parsed. They are cut into line-aligned chunks that
//! become Chunk nodes, chained in reading order by NextChunk edges.

const MAX_TITLE_CHARS: usize = 80;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocChunk {
    /// 1-based position in the document.
    pub index: usize,
    pub start_line: i64,
    pub end_line: i64,
    /// First non-blank line, without heading markup.
    pub title: String,
}

/// Chunks of at most `max_chars` characters, counting one newline per line.
/// A single longer line is a chunk of its own. When a chunk has to be cut,
/// the cut goes at its last blank line so paragraphs stay whole.
pub fn chunk_lines(source: &str, max_chars: usize) -> Vec<DocChunk> {
    let lines: Vec<&str> = source.lines().collect();
    let max_chars = max_chars.max(1);
    let mut chunks = Vec::new();
    let mut start = 0;

    while start < lines.len() {
        if is_blank(lines[start]) {
            start += 1;
            continue;
        }
        let mut end = start;
        let mut size = 0;
        let mut last_blank = None;
        while end < lines.len() {
            let cost = lines[end].chars().count() + 1;
            if size > 0 && size + cost > max_chars {
                break;
            }
            if is_blank(lines[end]) {
                last_blank = Some(end);
            }
            size += cost;
            end += 1;
        }
        if end < lines.len() {
            if let Some(blank) = last_blank.filter(|&blank| blank > start) {
                end = blank;
            }
        }

        let mut last = end - 1;
        while last > start && is_blank(lines[last]) {
            last -= 1;
        }
        chunks.push(DocChunk {
            index: chunks.len() + 1,
            start_line: start as i64 + 1,
            end_line: last as i64 + 1,
            title: title(lines[start]),
        });
        start = end;
    }
    chunks
}

fn is_blank(line: &str) -> bool {
    line.trim().is_empty()
}

fn title(line: &str) -> String {
    let text = line.trim().trim_start_matches(['#', '=', '-', '*', ' ']).trim();
    let text = if text.is_empty() { line.trim() } else { text };
    text.chars().take(MAX_TITLE_CHARS).collect()
}
