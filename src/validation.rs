//! Name validation for towns and residences, plus log sanitizing helpers.

use std::collections::HashSet;

use crate::claims::types::MAX_NAME_LEN;

/// Name validation errors with helpful messages
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NameError {
    #[error("name is too short (minimum {min} characters)")]
    TooShort { min: usize },

    #[error("name is too long (maximum {max} characters)")]
    TooLong { max: usize },

    #[error("name cannot start or end with whitespace")]
    InvalidWhitespace,

    #[error("name contains invalid characters: {chars}")]
    InvalidCharacters { chars: String },

    #[error("name is reserved")]
    Reserved,
}

/// Name validation rules configuration
#[derive(Debug, Clone)]
pub struct NameRules {
    pub min_length: usize,
    pub max_length: usize,
    pub allow_spaces: bool,
    pub allow_unicode: bool,
}

impl NameRules {
    /// Rules shared by towns and residences.
    pub fn claims() -> Self {
        NameRules {
            min_length: 2,
            max_length: MAX_NAME_LEN,
            allow_spaces: true,
            allow_unicode: true,
        }
    }
}

/// Names that would read as a territory keyword in chat and commands.
fn reserved_names() -> HashSet<&'static str> {
    [
        "wildness", "wilderness", "none", "null", "all", "here", "public", "local", "hidden",
        "admin", "server", "console",
    ]
    .iter()
    .copied()
    .collect()
}

/// Validate a claim name according to the given rules
pub fn validate_name(name: &str, rules: &NameRules) -> Result<String, NameError> {
    let trimmed = name.trim();

    // Length checks count characters, not bytes.
    let len = trimmed.chars().count();
    if len < rules.min_length {
        return Err(NameError::TooShort { min: rules.min_length });
    }
    if len > rules.max_length {
        return Err(NameError::TooLong { max: rules.max_length });
    }

    if trimmed != name {
        return Err(NameError::InvalidWhitespace);
    }

    if reserved_names().contains(trimmed.to_lowercase().as_str()) {
        return Err(NameError::Reserved);
    }

    let mut invalid_chars = Vec::new();
    for ch in trimmed.chars() {
        let valid = if ch.is_ascii_alphanumeric() || ch == '_' || ch == '-' || ch == '\'' {
            true
        } else if ch == ' ' {
            rules.allow_spaces
        } else if ch.is_control() {
            false
        } else if (ch.is_alphabetic() || ch.is_numeric()) && !ch.is_ascii() {
            rules.allow_unicode
        } else {
            false
        };

        if !valid {
            invalid_chars.push(ch);
        }
    }

    if !invalid_chars.is_empty() {
        let mut seen = HashSet::new();
        let chars_str: String = invalid_chars
            .into_iter()
            .filter(|c| seen.insert(*c))
            .map(|c| {
                if c.is_control() {
                    format!("\\u{{{:04x}}}", c as u32)
                } else {
                    c.to_string()
                }
            })
            .collect();
        return Err(NameError::InvalidCharacters { chars: chars_str });
    }

    Ok(trimmed.to_string())
}

/// Validate a town or residence name.
pub fn validate_claim_name(name: &str) -> Result<String, NameError> {
    validate_name(name, &NameRules::claims())
}

/// Escape a string for single-line logging:
/// - `\n` => `\\n`
/// - `\r` => `\\r`
/// - `\t` => `\\t`
/// - backslash => `\\\\`
///   Truncates very long strings with an ellipsis to cap log noise.
pub fn escape_log(s: &str) -> String {
    const MAX_PREVIEW: usize = 120;
    let mut out = String::with_capacity(s.len().min(MAX_PREVIEW) + 8);
    for (count, ch) in s.chars().enumerate() {
        if count >= MAX_PREVIEW {
            out.push('…');
            break;
        }
        match ch {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c.is_control() => {
                use std::fmt::Write;
                let _ = write!(&mut out, "\\x{:02X}", c as u32);
            }
            c => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_ordinary_names() {
        assert_eq!(validate_claim_name("Riverside").unwrap(), "Riverside");
        assert_eq!(validate_claim_name("Old Mill 2").unwrap(), "Old Mill 2");
        assert_eq!(validate_claim_name("Baker's_Row-3").unwrap(), "Baker's_Row-3");
        assert!(validate_claim_name("Zürich").is_ok());
    }

    #[test]
    fn enforces_length_limits() {
        assert_eq!(validate_claim_name("a"), Err(NameError::TooShort { min: 2 }));
        let long = "x".repeat(MAX_NAME_LEN + 1);
        assert_eq!(
            validate_claim_name(&long),
            Err(NameError::TooLong { max: MAX_NAME_LEN })
        );
        assert!(validate_claim_name(&"x".repeat(MAX_NAME_LEN)).is_ok());
    }

    #[test]
    fn rejects_whitespace_reserved_and_symbols() {
        assert_eq!(validate_claim_name(" Town"), Err(NameError::InvalidWhitespace));
        assert_eq!(validate_claim_name("Wildness"), Err(NameError::Reserved));
        assert!(matches!(
            validate_claim_name("bad:name"),
            Err(NameError::InvalidCharacters { .. })
        ));
        assert!(matches!(
            validate_claim_name("tab\there"),
            Err(NameError::InvalidCharacters { .. })
        ));
    }

    #[test]
    fn escapes_newlines_and_truncates() {
        assert_eq!(escape_log("Line1\nLine2\r\tEnd"), "Line1\\nLine2\\r\\tEnd");
        let long = "y".repeat(500);
        assert!(escape_log(&long).ends_with('…'));
    }
}
