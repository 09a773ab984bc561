//! Validated identifiers that take part in queue names.
//!
//! Queue names are built by joining identifiers with `.`, so an identifier
//! that contained the separator, or that differed from another one only by
//! case, could make two conversations share a queue. The newtypes here reject
//! such values at construction time, which is what keeps
//! [`queue_name`](crate::addressing::queue_name) injective.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

fn validate(kind: &'static str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(Error::InvalidIdentifier {
            kind,
            value: value.to_string(),
            reason: "must not be empty",
        });
    }
    if !value
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
    {
        return Err(Error::InvalidIdentifier {
            kind,
            value: value.to_string(),
            reason: "only lowercase ascii letters, digits, '_' and '-' are allowed",
        });
    }
    Ok(())
}

macro_rules! identifier {
    ($(#[$meta:meta])* $name:ident, $kind:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            /// Validates and wraps an identifier.
            ///
            /// # Errors
            ///
            /// Returns [`Error::InvalidIdentifier`] for empty values or values
            /// containing anything besides `[a-z0-9_-]`.
            pub fn new(value: impl Into<String>) -> Result<Self> {
                let value = value.into();
                validate($kind, &value)?;
                Ok(Self(value))
            }

            /// The identifier as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self> {
                Self::new(s)
            }
        }

        impl TryFrom<String> for $name {
            type Error = Error;

            fn try_from(value: String) -> Result<Self> {
                Self::new(value)
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

identifier!(
    /// Identifier of a logical action, e.g. `products_today`.
    ///
    /// # Examples
    ///
    /// ```
    /// use aide::ActionId;
    ///
    /// let id = ActionId::new("products_today").unwrap();
    /// assert_eq!(id.as_str(), "products_today");
    /// assert!(ActionId::new("Products").is_err());
    /// assert!(ActionId::new("a.b").is_err());
    /// ```
    ActionId,
    "action id"
);

identifier!(
    /// Identifier of the agent a deployment belongs to.
    ///
    /// Every queue name ends with the agent id, so two agents sharing a
    /// broker never see each other's traffic.
    AgentId,
    "agent id"
);

/// Unique identifier of one task, generated by the public-facing side.
///
/// Serialized as a bare string. Any string is accepted on the way in so that
/// lookups for foreign or malformed uids answer "not found" instead of
/// failing to decode.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskUid(String);

impl TaskUid {
    /// Generates a fresh UUIDv4 uid.
    ///
    /// # Examples
    ///
    /// ```
    /// use aide::TaskUid;
    ///
    /// let a = TaskUid::generate();
    /// let b = TaskUid::generate();
    /// assert_ne!(a, b);
    /// assert_eq!(a.as_str().len(), 36);
    /// ```
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// The uid as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for TaskUid {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for TaskUid {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn accepts_snake_and_kebab_case() {
        assert!(ActionId::new("products_today").is_ok());
        assert!(ActionId::new("products-today-v2").is_ok());
        assert!(AgentId::new("buy_on_ebay").is_ok());
    }

    #[test]
    fn rejects_separator_case_and_empty() {
        for bad in ["", "a.b", "Echo", "with space", "ü"] {
            let err = ActionId::new(bad).unwrap_err();
            assert!(
                matches!(err, Error::InvalidIdentifier { kind: "action id", .. }),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn serde_validates_on_the_way_in() {
        let ok: ActionId = serde_json::from_str("\"echo\"").unwrap();
        assert_eq!(ok.as_str(), "echo");
        assert!(serde_json::from_str::<ActionId>("\"no.dots\"").is_err());
        assert_eq!(serde_json::to_string(&ok).unwrap(), "\"echo\"");
    }

    #[test]
    fn task_uid_is_transparent_string() {
        let uid = TaskUid::from("abc");
        assert_eq!(serde_json::to_string(&uid).unwrap(), "\"abc\"");
        let back: TaskUid = serde_json::from_str("\"abc\"").unwrap();
        assert_eq!(back, uid);
    }

    #[test]
    fn generated_uids_are_unique() {
        let uids: HashSet<TaskUid> = (0..1000).map(|_| TaskUid::generate()).collect();
        assert_eq!(uids.len(), 1000);
    }
}
