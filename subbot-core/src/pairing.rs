//! Structural rules for pairing codes.
//!
//! These checks cover length and charset only. Whether a code was ever issued
//! by the remote network is not something this module can know.

use serde::Deserialize;

use crate::error::SubbotError;

pub const PAIRING_CODE_LEN: usize = 8;
pub const DISPLAY_GROUP_LEN: usize = 4;
pub const DISPLAY_SEPARATOR: char = '-';

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CodeCharset {
    Numeric,
    Alphanumeric,
}

impl CodeCharset {
    pub fn accepts(&self, c: char) -> bool {
        match self {
            CodeCharset::Numeric => c.is_ascii_digit(),
            CodeCharset::Alphanumeric => c.is_ascii_digit() || c.is_ascii_uppercase(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            CodeCharset::Numeric => "numeric",
            CodeCharset::Alphanumeric => "alphanumeric",
        }
    }
}

/// Upper-cases and strips display separators and whitespace.
pub fn normalize(raw: &str) -> String {
    raw.chars()
        .filter(|c| !c.is_whitespace() && *c != DISPLAY_SEPARATOR)
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

/// `true` when the normalized code has exactly eight characters of `charset`.
pub fn validate(raw: &str, charset: CodeCharset) -> bool {
    let code = normalize(raw);
    code.chars().count() == PAIRING_CODE_LEN && code.chars().all(|c| charset.accepts(c))
}

/// Normalizes and validates, returning the canonical form.
pub fn parse(raw: &str, charset: CodeCharset) -> Result<String, SubbotError> {
    let code = normalize(raw);
    if code.chars().count() != PAIRING_CODE_LEN {
        return Err(SubbotError::InvalidCode(format!(
            "expected {} characters, got {}",
            PAIRING_CODE_LEN,
            code.chars().count()
        )));
    }
    if let Some(bad) = code.chars().find(|c| !charset.accepts(*c)) {
        return Err(SubbotError::InvalidCode(format!(
            "character '{}' is not {}",
            bad,
            charset.name()
        )));
    }
    Ok(code)
}

/// `"ABCD1234"` -> `"ABCD-1234"`.
pub fn format_for_display(code: &str) -> String {
    let chars: Vec<char> = code.chars().collect();
    chars
        .chunks(DISPLAY_GROUP_LEN)
        .map(|group| group.iter().collect::<String>())
        .collect::<Vec<_>>()
        .join(&DISPLAY_SEPARATOR.to_string())
}
