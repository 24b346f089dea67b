use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! string_id {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_owned())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
                formatter.write_str(&self.0)
            }
        }
    };
}

string_id!(TicketId);
string_id!(Environment);

pub const DEFAULT_ENVIRONMENT: &str = "PRD";

impl Default for Environment {
    fn default() -> Self {
        Self::new(DEFAULT_ENVIRONMENT)
    }
}

/// Stable, 1-based, oldest-first position of a persisted history item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StorageIndex(u32);

impl StorageIndex {
    /// Returns `None` for zero; storage indices start at one.
    pub fn new(value: u32) -> Option<Self> {
        (value > 0).then_some(Self(value))
    }

    pub fn get(self) -> u32 {
        self.0
    }

    /// Maps a 0-based position in a newest-first list of length `len` onto
    /// its oldest-first storage index (`len - position`).
    pub fn from_source_position(len: usize, position: usize) -> Option<Self> {
        if position >= len {
            return None;
        }
        u32::try_from(len - position).ok().and_then(Self::new)
    }
}

impl fmt::Display for StorageIndex {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{}", self.0)
    }
}
