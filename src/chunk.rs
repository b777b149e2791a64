//! Markdown-aware text chunker.
//!
//! Splits a document into [`Chunk`]s of at most `max_tokens` (approximated
//! as four characters per token). A heading line always starts a new chunk
//! so each chunk stays within one section; inside a section, paragraphs
//! (`\n\n`) are packed greedily. A paragraph longer than the limit is hard
//! split on the last newline or space before the boundary.
//!
//! Chunk indices are contiguous from 0 and every document yields at least
//! one chunk, so an empty file still has an index row.

use uuid::Uuid;

use crate::hasher;
use crate::models::Chunk;

const CHARS_PER_TOKEN: usize = 4;

pub fn chunk_markdown(document_id: &str, text: &str, max_tokens: usize) -> Vec<Chunk> {
    let max_chars = (max_tokens * CHARS_PER_TOKEN).max(1);
    let mut builder = ChunkBuilder::new(document_id);

    for section in sections(text) {
        for para in section.split("\n\n") {
            let trimmed = para.trim();
            if trimmed.is_empty() {
                continue;
            }
            if trimmed.len() > max_chars {
                builder.flush();
                for piece in hard_split(trimmed, max_chars) {
                    builder.push_whole(piece);
                }
            } else {
                builder.append(trimmed, max_chars);
            }
        }
        builder.flush();
    }

    builder.finish(text)
}

/// First ATX heading (`# Title`) of the document, if any.
pub fn document_title(text: &str) -> Option<String> {
    text.lines()
        .map(str::trim_start)
        .find(|line| is_heading(line))
        .map(|line| line.trim_start_matches('#').trim().to_string())
        .filter(|title| !title.is_empty())
}

fn is_heading(line: &str) -> bool {
    let hashes = line.chars().take_while(|c| *c == '#').count();
    (1..=6).contains(&hashes) && line[hashes..].starts_with(' ')
}

/// Split on heading lines, keeping each heading with the text under it.
/// Fenced code blocks are never split.
fn sections(text: &str) -> Vec<String> {
    let mut sections = Vec::new();
    let mut current = String::new();
    let mut in_fence = false;

    for line in text.lines() {
        let trimmed = line.trim_start();
        if trimmed.starts_with("```") || trimmed.starts_with("~~~") {
            in_fence = !in_fence;
        }
        if !in_fence && is_heading(trimmed) && !current.trim().is_empty() {
            sections.push(std::mem::take(&mut current));
        }
        current.push_str(line);
        current.push('\n');
    }
    if !current.trim().is_empty() {
        sections.push(current);
    }
    sections
}

fn hard_split(text: &str, max_chars: usize) -> Vec<&str> {
    let mut pieces = Vec::new();
    let mut remaining = text;
    while !remaining.is_empty() {
        let mut split_at = remaining.len().min(max_chars);
        while !remaining.is_char_boundary(split_at) {
            split_at -= 1;
        }
        if split_at == 0 {
            // A single char wider than the limit.
            split_at = remaining
                .char_indices()
                .nth(1)
                .map_or(remaining.len(), |(i, _)| i);
        }
        let actual_split = if split_at < remaining.len() {
            remaining[..split_at]
                .rfind('\n')
                .or_else(|| remaining[..split_at].rfind(' '))
                .filter(|pos| *pos > 0)
                .map(|pos| pos + 1)
                .unwrap_or(split_at)
        } else {
            split_at
        };
        let piece = remaining[..actual_split].trim();
        if !piece.is_empty() {
            pieces.push(piece);
        }
        remaining = &remaining[actual_split..];
    }
    pieces
}

struct ChunkBuilder<'a> {
    document_id: &'a str,
    chunks: Vec<Chunk>,
    buf: String,
}

impl<'a> ChunkBuilder<'a> {
    fn new(document_id: &'a str) -> Self {
        Self {
            document_id,
            chunks: Vec::new(),
            buf: String::new(),
        }
    }

    fn append(&mut self, para: &str, max_chars: usize) {
        if !self.buf.is_empty() && self.buf.len() + 2 + para.len() > max_chars {
            self.flush();
        }
        if !self.buf.is_empty() {
            self.buf.push_str("\n\n");
        }
        self.buf.push_str(para);
    }

    fn push_whole(&mut self, text: &str) {
        let index = self.chunks.len() as i64;
        self.chunks.push(make_chunk(self.document_id, index, text));
    }

    fn flush(&mut self) {
        if !self.buf.is_empty() {
            let text = std::mem::take(&mut self.buf);
            self.push_whole(&text);
        }
    }

    fn finish(mut self, original: &str) -> Vec<Chunk> {
        self.flush();
        if self.chunks.is_empty() {
            self.push_whole(original.trim());
        }
        self.chunks
    }
}

fn make_chunk(document_id: &str, index: i64, text: &str) -> Chunk {
    Chunk {
        id: Uuid::new_v4().to_string(),
        document_id: document_id.to_string(),
        chunk_index: index,
        text: text.to_string(),
        hash: hasher::hash_bytes(text.as_bytes()),
    }
}
