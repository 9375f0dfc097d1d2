//! Post-processing of generated text before egress.
//!
//! The chat network accepts a single line of at most 500 bytes with no
//! formatting markers. Post-processing is idempotent: running it on its own
//! output changes nothing.

use super::GeneratorError;

/// Characters the egress channel cannot render; dropped outright.
fn is_marker(ch: char) -> bool {
    matches!(ch, '*' | '`' | '~') || ch.is_control()
}

/// Clean a raw generation and enforce the byte limit.
///
/// Returns `Invalid` when nothing usable remains.
pub fn postprocess(raw: &str, byte_limit: usize) -> Result<String, GeneratorError> {
    let mut cleaned = String::with_capacity(raw.len());
    let mut last_was_space = true;
    for ch in raw.chars() {
        // Newlines become spaces; markers vanish; whitespace runs collapse.
        let ch = if ch == '\n' || ch == '\r' { ' ' } else { ch };
        if is_marker(ch) {
            continue;
        }
        if ch == ' ' {
            if !last_was_space {
                cleaned.push(' ');
            }
            last_was_space = true;
        } else {
            cleaned.push(ch);
            last_was_space = false;
        }
    }
    let cleaned = cleaned.trim().to_string();

    if cleaned.is_empty() {
        return Err(GeneratorError::Invalid);
    }

    Ok(truncate_at_word(&cleaned, byte_limit))
}

/// Truncate to at most `byte_limit` bytes on the last word boundary below the
/// limit. No ellipsis is appended. Falls back to the largest char boundary
/// when a single word exceeds the limit.
fn truncate_at_word(text: &str, byte_limit: usize) -> String {
    if text.len() <= byte_limit {
        return text.to_string();
    }

    let mut last_space = None;
    let mut last_boundary = 0;
    for (idx, ch) in text.char_indices() {
        if idx + ch.len_utf8() > byte_limit {
            break;
        }
        last_boundary = idx + ch.len_utf8();
        if ch == ' ' {
            last_space = Some(idx);
        }
    }

    let cut = last_space.unwrap_or(last_boundary);
    text[..cut].trim_end().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trims_and_collapses_whitespace() {
        assert_eq!(postprocess("  hello   there  ", 500).unwrap(), "hello there");
    }

    #[test]
    fn newlines_become_spaces() {
        assert_eq!(postprocess("one\ntwo\r\nthree", 500).unwrap(), "one two three");
    }

    #[test]
    fn markdown_markers_are_stripped() {
        assert_eq!(
            postprocess("**bold** and *italic* and `code` and ~~gone~~", 500).unwrap(),
            "bold and italic and code and gone"
        );
    }

    #[test]
    fn empty_and_whitespace_only_are_invalid() {
        assert!(matches!(postprocess("", 500), Err(GeneratorError::Invalid)));
        assert!(matches!(postprocess("   \n\t ", 500), Err(GeneratorError::Invalid)));
        assert!(matches!(postprocess("***", 500), Err(GeneratorError::Invalid)));
    }

    #[test]
    fn exactly_at_limit_is_unchanged() {
        let text = "a".repeat(500);
        assert_eq!(postprocess(&text, 500).unwrap(), text);
    }

    #[test]
    fn over_limit_cuts_on_word_boundary_without_ellipsis() {
        // 501 bytes: 498 a's, a space, then "bb".
        let text = format!("{} bb", "a".repeat(498));
        assert_eq!(text.len(), 501);
        let out = postprocess(&text, 500).unwrap();
        assert_eq!(out, "a".repeat(498));
        assert!(!out.ends_with("..."));
    }

    #[test]
    fn single_long_word_cuts_on_char_boundary() {
        let text = "é".repeat(300); // 600 bytes, no spaces
        let out = postprocess(&text, 500).unwrap();
        assert!(out.len() <= 500);
        assert!(out.chars().all(|c| c == 'é'));
    }

    #[test]
    fn postprocess_is_idempotent() {
        let inputs = [
            "  hello **world**\nnew line  ",
            &format!("{} tail", "word ".repeat(200)),
            "plain",
        ];
        for input in inputs {
            let once = postprocess(input, 500).unwrap();
            let twice = postprocess(&once, 500).unwrap();
            assert_eq!(once, twice);
        }
    }
}
