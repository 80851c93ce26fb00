//! Topic names.
//!
//! A topic is a logical queue (e.g. `document-translation`). It is a
//! partition key on jobs, never a physical table, so the only rules are the
//! ones that keep it safe inside SQL values and Redis key names.

use core::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};

const MAX_TOPIC_LEN: usize = 128;

/// Validated topic name: 1-128 chars of `[a-z0-9._-]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Topic(String);

impl Topic {
    pub fn new(name: impl Into<String>) -> DomainResult<Self> {
        let name = name.into();
        if name.is_empty() {
            return Err(DomainError::validation("topic name must not be empty"));
        }
        if name.len() > MAX_TOPIC_LEN {
            return Err(DomainError::validation(format!(
                "topic name longer than {MAX_TOPIC_LEN} characters"
            )));
        }
        if let Some(c) = name
            .chars()
            .find(|c| !(c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '-' | '_' | '.')))
        {
            return Err(DomainError::validation(format!(
                "topic name '{name}' contains invalid character '{c}'"
            )));
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for Topic {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Topic {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl FromStr for Topic {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for Topic {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Topic> for String {
    fn from(value: Topic) -> Self {
        value.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn accepts_queue_names() {
        for name in ["document-translation", "text-translation", "improvement", "a.b_c-1"] {
            assert_eq!(Topic::new(name).unwrap().as_str(), name);
        }
    }

    #[test]
    fn rejects_empty_and_unsafe_names() {
        assert!(Topic::new("").is_err());
        assert!(Topic::new("Upper").is_err());
        assert!(Topic::new("has space").is_err());
        assert!(Topic::new("colon:key").is_err());
        assert!(Topic::new("x".repeat(129)).is_err());
    }

    #[test]
    fn deserialization_validates() {
        let ok: Topic = serde_json::from_str("\"improvement\"").unwrap();
        assert_eq!(ok.as_str(), "improvement");
        assert!(serde_json::from_str::<Topic>("\"Bad Topic\"").is_err());
    }

    proptest! {
        #[test]
        fn every_valid_name_round_trips(name in "[a-z0-9._-]{1,128}") {
            let topic = Topic::new(name.clone()).unwrap();
            prop_assert_eq!(topic.to_string(), name);
        }
    }
}
