//! Transaction references.
//!
//! A reference is the externally shareable name of a transaction and doubles
//! as its idempotency key. Generated references are UUID v7 based: 48 bits of
//! millisecond timestamp followed by 74 random bits, so they sort by creation
//! time and never need a storage round trip to be unique.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Maximum length of a reference, generated or caller supplied.
pub const MAX_REFERENCE_LEN: usize = 64;

/// Default prefix for generated references.
pub const DEFAULT_PREFIX: &str = "TXN";

/// Reasons a caller-supplied reference is rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReferenceError {
    #[error("reference is empty")]
    Empty,

    #[error("reference exceeds {MAX_REFERENCE_LEN} characters")]
    TooLong,

    #[error("reference contains invalid character {0:?}")]
    InvalidCharacter(char),
}

/// Unique transaction reference.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Reference(String);

impl Reference {
    /// Validate a caller-supplied reference.
    pub fn parse(s: impl Into<String>) -> Result<Self, ReferenceError> {
        let s = s.into();
        if s.is_empty() {
            return Err(ReferenceError::Empty);
        }
        if s.len() > MAX_REFERENCE_LEN {
            return Err(ReferenceError::TooLong);
        }
        if let Some(c) = s
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || *c == '-' || *c == '_'))
        {
            return Err(ReferenceError::InvalidCharacter(c));
        }
        Ok(Self(s))
    }

    /// Get the reference as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Reference {
    type Error = ReferenceError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(s)
    }
}

impl From<Reference> for String {
    fn from(r: Reference) -> Self {
        r.0
    }
}

/// Produces time-ordered, collision-resistant references.
#[derive(Debug, Clone)]
pub struct ReferenceGenerator {
    prefix: String,
}

impl ReferenceGenerator {
    /// Create a generator with the given prefix.
    ///
    /// The prefix is upper-cased and must itself be a valid reference
    /// fragment short enough to leave room for the UUID.
    pub fn new(prefix: impl Into<String>) -> Result<Self, ReferenceError> {
        let prefix = prefix.into().to_uppercase();
        // prefix + '-' + 32 hex digits
        if prefix.len() + 33 > MAX_REFERENCE_LEN {
            return Err(ReferenceError::TooLong);
        }
        Reference::parse(prefix.clone())?;
        Ok(Self { prefix })
    }

    /// Generate the next reference.
    pub fn next_reference(&self) -> Reference {
        let id = Uuid::now_v7();
        Reference(format!(
            "{}-{}",
            self.prefix,
            id.simple().encode_upper(&mut Uuid::encode_buffer())
        ))
    }

    /// Get the prefix.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }
}

impl Default for ReferenceGenerator {
    fn default() -> Self {
        Self {
            prefix: DEFAULT_PREFIX.to_string(),
        }
    }
}
