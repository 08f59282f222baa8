//! Conversion between local (`07XXXXXXXX`) and canonical (`2547XXXXXXXX`)
//! Kenyan phone number formats.
//!
//! Every payment request and every stored profile uses the canonical
//! 12-digit form; the local form is for display only.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, TaskPayError};

const COUNTRY_CODE: &str = "254";
const SUBSCRIBER_DIGITS: usize = 9;

/// A phone number in canonical `254XXXXXXXXX` form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CanonicalPhone(String);

impl CanonicalPhone {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for CanonicalPhone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CanonicalPhone {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Normalise `0XXXXXXXXX`, `254XXXXXXXXX` or `+254XXXXXXXXX` to the canonical form.
pub fn to_canonical(phone: &str) -> Result<CanonicalPhone> {
    let trimmed = phone.trim();

    let subscriber = if let Some(rest) = trimmed.strip_prefix('+') {
        rest.strip_prefix(COUNTRY_CODE)
    } else if let Some(rest) = trimmed.strip_prefix(COUNTRY_CODE) {
        Some(rest)
    } else {
        trimmed.strip_prefix('0')
    };

    match subscriber {
        Some(digits) if is_subscriber_number(digits) => {
            Ok(CanonicalPhone(format!("{COUNTRY_CODE}{digits}")))
        }
        _ => Err(TaskPayError::InvalidPhoneFormat(phone.to_string())),
    }
}

/// Render a canonical number in local `0XXXXXXXXX` form.
///
/// Unrecognised input is returned unchanged.
pub fn to_display(phone: &str) -> String {
    let digits = phone.strip_prefix('+').unwrap_or(phone);
    match digits.strip_prefix(COUNTRY_CODE) {
        Some(rest) if is_subscriber_number(rest) => format!("0{rest}"),
        _ => phone.to_string(),
    }
}

fn is_subscriber_number(s: &str) -> bool {
    s.len() == SUBSCRIBER_DIGITS && s.bytes().all(|b| b.is_ascii_digit())
}
