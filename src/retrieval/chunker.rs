//! Transcript chunking for indexing.
//!
//! Text is split into chunks of at most `max_chars` characters. Breaks
//! happen at sentence terminators when possible; a single sentence longer
//! than the limit is cut at the character boundary.

/// Default chunk size in characters.
pub const DEFAULT_CHUNK_SIZE: usize = 500;

const TERMINATORS: [char; 7] = ['。', '！', '？', '.', '!', '?', '\n'];

/// Split `text` into sentences, each keeping its terminator.
fn sentences(text: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut start = 0;
    for (i, c) in text.char_indices() {
        if TERMINATORS.contains(&c) {
            let end = i + c.len_utf8();
            out.push(&text[start..end]);
            start = end;
        }
    }
    if start < text.len() {
        out.push(&text[start..]);
    }
    out
}

fn hard_split(sentence: &str, max_chars: usize) -> Vec<String> {
    let chars: Vec<char> = sentence.chars().collect();
    chars
        .chunks(max_chars)
        .map(|c| c.iter().collect::<String>())
        .collect()
}

/// Split a transcript into chunks of at most `max_chars` characters.
///
/// Empty or whitespace-only input yields no chunks.
pub fn chunk_text(text: &str, max_chars: usize) -> Vec<String> {
    let max_chars = max_chars.max(1);
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_len = 0;

    let mut flush = |current: &mut String, current_len: &mut usize| {
        let trimmed = current.trim();
        if !trimmed.is_empty() {
            chunks.push(trimmed.to_string());
        }
        current.clear();
        *current_len = 0;
    };

    for sentence in sentences(text) {
        let len = sentence.chars().count();

        if len > max_chars {
            flush(&mut current, &mut current_len);
            for piece in hard_split(sentence, max_chars) {
                current_len = piece.chars().count();
                current = piece;
                flush(&mut current, &mut current_len);
            }
            continue;
        }

        if current_len + len > max_chars {
            flush(&mut current, &mut current_len);
        }
        current.push_str(sentence);
        current_len += len;
    }
    flush(&mut current, &mut current_len);

    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_text() {
        assert!(chunk_text("", 500).is_empty());
        assert!(chunk_text("   \n  ", 500).is_empty());
    }

    #[test]
    fn test_short_text_single_chunk() {
        let chunks = chunk_text("Rust is fast. It is also safe.", 500);
        assert_eq!(chunks, vec!["Rust is fast. It is also safe."]);
    }

    #[test]
    fn test_breaks_at_sentence_boundaries() {
        let text = "aaaa. bbbb. cccc.";
        let chunks = chunk_text(text, 12);
        assert_eq!(chunks, vec!["aaaa. bbbb.", "cccc."]);
    }

    #[test]
    fn test_cjk_terminators() {
        let text = "第一句话。第二句话！第三句话？";
        let chunks = chunk_text(text, 10);
        assert_eq!(chunks, vec!["第一句话。第二句话！", "第三句话？"]);
    }

    #[test]
    fn test_long_sentence_is_hard_split() {
        let text = "x".repeat(1200);
        let chunks = chunk_text(&text, 500);
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|c| c.chars().count() <= 500));
    }

    #[test]
    fn test_every_chunk_within_limit() {
        let text = "One sentence here. ".repeat(200);
        for chunk in chunk_text(&text, 100) {
            assert!(chunk.chars().count() <= 100);
        }
    }
}
