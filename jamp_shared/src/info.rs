//! Info strings: `\key\value\key\value` maps used for userinfo, serverinfo
//! and systeminfo.

use thiserror::Error;

use crate::limits::MAX_INFO_STRING;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InfoError {
    #[error("info keys and values may not contain '\\', ';' or '\"' ({0})")]
    IllegalChar(String),
    #[error("info string length exceeded")]
    TooLong,
}

/// Looks up `key` (case-insensitive). Missing keys yield `""`.
pub fn value_for_key<'a>(info: &'a str, key: &str) -> &'a str {
    pairs(info)
        .find(|(k, _)| k.eq_ignore_ascii_case(key))
        .map(|(_, v)| v)
        .unwrap_or("")
}

/// Iterates `(key, value)` pairs.
pub fn pairs(info: &str) -> impl Iterator<Item = (&str, &str)> {
    let mut parts = info.strip_prefix('\\').unwrap_or(info).split('\\');
    std::iter::from_fn(move || {
        let k = parts.next()?;
        let v = parts.next().unwrap_or("");
        Some((k, v))
    })
    .filter(|(k, _)| !k.is_empty())
}

/// Sets (or with an empty value, removes) `key`, rejecting illegal characters
/// and results longer than `MAX_INFO_STRING`.
pub fn set_value_for_key(info: &str, key: &str, value: &str) -> Result<String, InfoError> {
    for s in [key, value] {
        if s.contains(['\\', ';', '"']) {
            return Err(InfoError::IllegalChar(s.to_string()));
        }
    }
    let mut out = String::with_capacity(info.len() + key.len() + value.len() + 2);
    for (k, v) in pairs(info).filter(|(k, _)| !k.eq_ignore_ascii_case(key)) {
        out.push('\\');
        out.push_str(k);
        out.push('\\');
        out.push_str(v);
    }
    if !value.is_empty() {
        out.push('\\');
        out.push_str(key);
        out.push('\\');
        out.push_str(value);
    }
    if out.len() >= MAX_INFO_STRING {
        return Err(InfoError::TooLong);
    }
    Ok(out)
}

/// Strips `^N` color escapes and non-printable/high-bit characters.
pub fn clean_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut chars = name.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '^' && chars.peek().is_some_and(|n| n.is_ascii_alphanumeric()) {
            chars.next();
            continue;
        }
        if c.is_ascii_graphic() || c == ' ' {
            out.push(c);
        }
    }
    out.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_and_get() {
        let s = set_value_for_key("", "name", "Kyle").unwrap();
        let s = set_value_for_key(&s, "rate", "25000").unwrap();
        let s = set_value_for_key(&s, "NAME", "Jan").unwrap();
        assert_eq!(value_for_key(&s, "name"), "Jan");
        assert_eq!(value_for_key(&s, "rate"), "25000");
        assert_eq!(value_for_key(&s, "missing"), "");
    }

    #[test]
    fn illegal_characters_rejected() {
        assert!(set_value_for_key("", "name", "a\\b").is_err());
        assert!(set_value_for_key("", "na;me", "x").is_err());
    }

    #[test]
    fn names_lose_colors() {
        assert_eq!(clean_name("^1Red^7Kyle\u{7f}"), "RedKyle");
    }
}
