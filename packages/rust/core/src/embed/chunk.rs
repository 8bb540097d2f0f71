//! Paragraph-boundary text chunker.
//!
//! Splits content into chunks of at most `size` characters, packing whole
//! paragraphs (`\n\n`-separated) where possible. Oversized paragraphs are
//! hard-split on a line or word boundary. Consecutive chunks share up to
//! `overlap` trailing characters of context.

/// Split text into chunks. Empty or whitespace-only text yields no chunks.
pub fn chunk_text(text: &str, size: usize, overlap: usize) -> Vec<String> {
    let size = size.max(1);
    let overlap = overlap.min(size / 2);

    let mut pieces = Vec::new();
    let mut current = String::new();

    for para in text.split("\n\n") {
        let para = para.trim();
        if para.is_empty() {
            continue;
        }

        let would_be = if current.is_empty() {
            char_len(para)
        } else {
            char_len(&current) + 2 + char_len(para)
        };
        if would_be > size && !current.is_empty() {
            pieces.push(std::mem::take(&mut current));
        }

        if char_len(para) > size {
            pieces.extend(hard_split(para, size));
        } else {
            if !current.is_empty() {
                current.push_str("\n\n");
            }
            current.push_str(para);
        }
    }
    if !current.is_empty() {
        pieces.push(current);
    }

    if overlap == 0 || pieces.len() < 2 {
        return pieces;
    }

    let mut chunks = Vec::with_capacity(pieces.len());
    chunks.push(pieces[0].clone());
    for pair in pieces.windows(2) {
        let tail = tail_chars(&pair[0], overlap);
        chunks.push(format!("{}{}", tail, pair[1]));
    }
    chunks
}

/// Split at `size`-char boundaries, preferring the last newline or space.
fn hard_split(text: &str, size: usize) -> Vec<String> {
    let mut out = Vec::new();
    let mut remaining = text;
    while !remaining.is_empty() {
        let limit = byte_offset(remaining, size);
        let split_at = if limit < remaining.len() {
            remaining[..limit]
                .rfind('\n')
                .or_else(|| remaining[..limit].rfind(' '))
                .filter(|pos| *pos > 0)
                .map(|pos| pos + 1)
                .unwrap_or(limit)
        } else {
            limit
        };
        let piece = remaining[..split_at].trim();
        if !piece.is_empty() {
            out.push(piece.to_string());
        }
        remaining = &remaining[split_at..];
    }
    out
}

/// Last `n` characters of `text`, starting on a word boundary when one exists.
fn tail_chars(text: &str, n: usize) -> String {
    let total = char_len(text);
    if total <= n {
        return format!("{text}\n");
    }
    let start = byte_offset(text, total - n);
    let tail = &text[start..];
    let word_start = tail
        .char_indices()
        .find(|(_, c)| c.is_whitespace())
        .map(|(i, c)| i + c.len_utf8())
        .filter(|start| *start < tail.len());
    let tail = match word_start {
        Some(start) => &tail[start..],
        None => tail,
    };
    format!("{}\n", tail.trim_start())
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

/// Byte offset of the `n`th char, or the string length.
fn byte_offset(s: &str, n: usize) -> usize {
    s.char_indices().nth(n).map(|(i, _)| i).unwrap_or(s.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_text_single_chunk() {
        assert_eq!(chunk_text("Hello, world!", 100, 10), vec!["Hello, world!"]);
    }

    #[test]
    fn empty_text_has_no_chunks() {
        assert!(chunk_text("", 100, 10).is_empty());
        assert!(chunk_text("  \n\n  ", 100, 10).is_empty());
    }

    #[test]
    fn paragraphs_are_packed_under_limit() {
        let text = "First paragraph.\n\nSecond paragraph.\n\nThird paragraph.";
        let chunks = chunk_text(text, 1000, 0);
        assert_eq!(chunks, vec![text.to_string()]);
    }

    #[test]
    fn paragraphs_split_when_over_limit() {
        let text = "This is paragraph one.\n\nThis is paragraph two.\n\nThis is paragraph three.";
        let chunks = chunk_text(text, 30, 0);
        assert_eq!(
            chunks,
            vec![
                "This is paragraph one.",
                "This is paragraph two.",
                "This is paragraph three.",
            ]
        );
    }

    #[test]
    fn long_paragraph_is_hard_split_on_words() {
        let text = "word ".repeat(40);
        let chunks = chunk_text(&text, 32, 0);
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(chunk.chars().count() <= 32);
            assert!(!chunk.starts_with(' '));
            assert!(chunk.split(' ').all(|w| w == "word"));
        }
    }

    #[test]
    fn overlap_carries_previous_tail() {
        let text = "alpha beta gamma\n\ndelta epsilon zeta";
        let chunks = chunk_text(text, 20, 6);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0], "alpha beta gamma");
        assert!(chunks[1].starts_with("gamma\n"));
        assert!(chunks[1].ends_with("delta epsilon zeta"));
    }

    #[test]
    fn multibyte_text_does_not_panic() {
        let text = "ünïcödé ".repeat(30);
        let chunks = chunk_text(&text, 17, 5);
        assert!(!chunks.is_empty());
    }
}
