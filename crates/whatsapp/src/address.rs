//! Recipient address normalization.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::SessionError;

/// Domain appended to bare user identifiers.
pub const USER_DOMAIN: &str = "c.us";

/// A canonical transport address such as `15551234567@c.us`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChatId(String);

impl ChatId {
    /// Canonicalize `raw`.
    ///
    /// Bare identifiers get `@c.us`; anything already carrying a domain is kept
    /// as-is, so parsing a `ChatId`'s own string yields the same id.
    pub fn parse(raw: &str) -> Result<Self, SessionError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed.starts_with('@') || trimmed.ends_with('@') {
            return Err(SessionError::InvalidRecipient(raw.to_string()));
        }
        if trimmed.contains('@') {
            return Ok(Self(trimmed.to_string()));
        }
        Ok(Self(format!("{trimmed}@{USER_DOMAIN}")))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The part before the domain.
    pub fn user(&self) -> &str {
        self.0.split_once('@').map_or(self.0.as_str(), |(user, _)| user)
    }
}

impl fmt::Display for ChatId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Shorthand for [`ChatId::parse`].
pub fn normalize(raw: &str) -> Result<ChatId, SessionError> {
    ChatId::parse(raw)
}
