use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::ChatError;

const MAX_USERNAME_LEN: usize = 64;

/// A validated marketplace username.
///
/// Usernames are the only participant identity the chat core knows about, so
/// they must never contain the conversation id separator.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Username(String);

impl Username {
    pub fn parse(raw: impl Into<String>) -> Result<Self, ChatError> {
        let raw = raw.into();
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(ChatError::Validation("username must not be empty".into()));
        }
        if trimmed.len() > MAX_USERNAME_LEN {
            return Err(ChatError::Validation(format!(
                "username longer than {} characters",
                MAX_USERNAME_LEN
            )));
        }
        if trimmed.contains(crate::chat::CONVERSATION_ID_SEPARATOR) || trimmed.contains(char::is_whitespace) {
            return Err(ChatError::Validation(format!(
                "username '{}' contains a reserved character",
                trimmed
            )));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Username {
    type Error = ChatError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<Username> for String {
    fn from(value: Username) -> Self {
        value.0
    }
}

impl fmt::Display for Username {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl PartialEq<str> for Username {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

/// The authenticated caller, as handed out by the session collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurrentUser {
    pub username: Username,
    pub email: String,
}

impl fmt::Display for CurrentUser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} <{}>", self.username, self.email)
    }
}

/// A book listing. Chat only cares about who sells it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Listing {
    pub id: i64,
    pub title: String,
    pub author: String,
    pub price: f64,
    pub seller: Username,
    pub created_at: DateTime<Utc>,
}
