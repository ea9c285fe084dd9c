//! Text tokenizing and lenient number parsing.
//!
//! The tokenizer walks entity text, config scripts and command lines:
//! whitespace-separated words, `"quoted strings"` (which may contain
//! whitespace), `//` line comments and `/* */` block comments.

use crate::limits::MAX_TOKEN_CHARS;

/// Cursor over a text buffer producing tokens.
#[derive(Debug, Clone)]
pub struct Tokenizer<'a> {
    text: &'a str,
    pos: usize,
    line: usize,
}

impl<'a> Tokenizer<'a> {
    pub fn new(text: &'a str) -> Self {
        Self {
            text,
            pos: 0,
            line: 1,
        }
    }

    /// Current byte offset into the text.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Line of the last token returned (1-based).
    pub fn line(&self) -> usize {
        self.line
    }

    /// Returns the next token, or `None` at end of text.
    ///
    /// Quoted tokens are returned without their quotes; an empty quoted string
    /// is a valid (empty) token. Tokens longer than `MAX_TOKEN_CHARS - 1`
    /// bytes are truncated.
    pub fn next_token(&mut self) -> Option<String> {
        let bytes = self.text.as_bytes();
        loop {
            while self.pos < bytes.len() && bytes[self.pos].is_ascii_whitespace() {
                if bytes[self.pos] == b'\n' {
                    self.line += 1;
                }
                self.pos += 1;
            }
            if self.pos >= bytes.len() {
                return None;
            }
            if bytes[self.pos..].starts_with(b"//") {
                while self.pos < bytes.len() && bytes[self.pos] != b'\n' {
                    self.pos += 1;
                }
                continue;
            }
            if bytes[self.pos..].starts_with(b"/*") {
                self.pos += 2;
                while self.pos < bytes.len() && !bytes[self.pos..].starts_with(b"*/") {
                    if bytes[self.pos] == b'\n' {
                        self.line += 1;
                    }
                    self.pos += 1;
                }
                self.pos = (self.pos + 2).min(bytes.len());
                continue;
            }
            break;
        }

        let start;
        let end;
        if bytes[self.pos] == b'"' {
            self.pos += 1;
            start = self.pos;
            while self.pos < bytes.len() && bytes[self.pos] != b'"' {
                if bytes[self.pos] == b'\n' {
                    self.line += 1;
                }
                self.pos += 1;
            }
            end = self.pos;
            if self.pos < bytes.len() {
                self.pos += 1;
            }
        } else {
            start = self.pos;
            while self.pos < bytes.len() && !bytes[self.pos].is_ascii_whitespace() {
                self.pos += 1;
            }
            end = self.pos;
        }

        Some(truncate_token(&self.text[start..end]).to_string())
    }
}

fn truncate_token(s: &str) -> &str {
    if s.len() < MAX_TOKEN_CHARS {
        return s;
    }
    let mut cut = MAX_TOKEN_CHARS - 1;
    while !s.is_char_boundary(cut) {
        cut -= 1;
    }
    &s[..cut]
}

/// Splits a command line into arguments, respecting quotes and stripping
/// `//` comments.
pub fn tokenize_line(line: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut tok = Tokenizer::new(line);
    while let Some(t) = tok.next_token() {
        tokens.push(t);
    }
    tokens
}

/// `atoi`: parses the leading integer, yielding 0 when there is none.
pub fn atoi(s: &str) -> i32 {
    let s = s.trim_start();
    let end = numeric_prefix_len(s, false);
    s[..end].parse::<i64>().map(|v| v as i32).unwrap_or(0)
}

/// `atof`: parses the leading float, yielding 0.0 when there is none.
pub fn atof(s: &str) -> f32 {
    let s = s.trim_start();
    let mut end = numeric_prefix_len(s, true);
    while end > 0 {
        if let Ok(v) = s[..end].parse::<f32>() {
            return v;
        }
        end -= 1;
    }
    0.0
}

fn numeric_prefix_len(s: &str, float: bool) -> usize {
    let bytes = s.as_bytes();
    let mut i = 0;
    if i < bytes.len() && (bytes[i] == b'-' || bytes[i] == b'+') {
        i += 1;
    }
    let mut seen_dot = false;
    let mut seen_exp = false;
    while i < bytes.len() {
        let c = bytes[i];
        if c.is_ascii_digit() {
            i += 1;
        } else if float && c == b'.' && !seen_dot && !seen_exp {
            seen_dot = true;
            i += 1;
        } else if float && (c == b'e' || c == b'E') && !seen_exp && i > 0 {
            seen_exp = true;
            i += 1;
            if i < bytes.len() && (bytes[i] == b'-' || bytes[i] == b'+') {
                i += 1;
            }
        } else {
            break;
        }
    }
    i
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_skip_comments_and_keep_quotes() {
        let text = "{ // comment\n \"classname\" \"info null\" /* block\n */ }";
        let mut t = Tokenizer::new(text);
        assert_eq!(t.next_token().as_deref(), Some("{"));
        assert_eq!(t.next_token().as_deref(), Some("classname"));
        assert_eq!(t.next_token().as_deref(), Some("info null"));
        assert_eq!(t.next_token().as_deref(), Some("}"));
        assert_eq!(t.next_token(), None);
        assert_eq!(t.line(), 3);
    }

    #[test]
    fn empty_quoted_string_is_a_token() {
        let mut t = Tokenizer::new("\"\" x");
        assert_eq!(t.next_token().as_deref(), Some(""));
        assert_eq!(t.next_token().as_deref(), Some("x"));
    }

    #[test]
    fn lenient_numbers() {
        assert_eq!(atoi("42abc"), 42);
        assert_eq!(atoi("  -7"), -7);
        assert_eq!(atoi("abc"), 0);
        assert_eq!(atof("1.5e2x"), 150.0);
        assert_eq!(atof("3."), 3.0);
        assert_eq!(atof("-"), 0.0);
        assert_eq!(atof("2e"), 2.0);
    }

    #[test]
    fn line_tokenizer() {
        assert_eq!(
            tokenize_line(r#"say "hello world" test"#),
            vec!["say", "hello world", "test"]
        );
    }
}
