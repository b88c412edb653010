use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

macro_rules! branded_id {
    ($name:ident, $prefix:expr) => {
        #[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new() -> Self {
                Self(format!("{}_{}", $prefix, Uuid::now_v7()))
            }

            pub fn from_raw(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = std::convert::Infallible;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(s.to_owned()))
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }
    };
}

// Task ids are normally assigned by the caller; `new()` is for blank rows and tools.
branded_id!(TaskId, "task");
branded_id!(EventId, "evt");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_id_has_prefix() {
        let id = TaskId::new();
        assert!(id.as_str().starts_with("task_"), "got: {id}");
    }

    #[test]
    fn event_id_has_prefix() {
        let id = EventId::new();
        assert!(id.as_str().starts_with("evt_"), "got: {id}");
    }

    #[test]
    fn caller_assigned_ids_are_kept_verbatim() {
        let id = TaskId::from_raw("A");
        assert_eq!(id.as_str(), "A");
        assert_eq!(TaskId::from("A"), id);
    }

    #[test]
    fn event_ids_are_monotonic() {
        let ids: Vec<EventId> = (0..100).map(|_| EventId::new()).collect();
        for w in ids.windows(2) {
            assert!(w[0] < w[1], "not monotonic: {} >= {}", w[0], w[1]);
        }
    }

    #[test]
    fn serializes_as_plain_string() {
        let id = TaskId::from_raw("task-7");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"task-7\"");
        let parsed: TaskId = serde_json::from_str("\"task-7\"").unwrap();
        assert_eq!(parsed, id);
    }
}
