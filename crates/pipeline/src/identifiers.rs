//! Newtype domain identifiers.
//!
//! Every domain concept that has an identity is represented as a distinct newtype
//! wrapping a primitive. This prevents accidentally interchanging, for example,
//! a [`PipelineId`] with a [`RunId`] even though both are strings under the hood.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Macro for String-wrapped newtypes.
// Generates: struct, new() returning Option<Self>, as_str(), Display.
// ---------------------------------------------------------------------------
macro_rules! string_id {
    (
        $(#[$attr:meta])*
        $name:ident
    ) => {
        $(#[$attr])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            /// Creates a new identifier, returning `None` if the value is empty
            /// or consists only of whitespace.
            pub fn new(value: impl Into<String>) -> Option<Self> {
                let v = value.into();
                if v.trim().is_empty() { None } else { Some(Self(v)) }
            }

            /// Returns the identifier as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl TryFrom<String> for $name {
            type Error = String;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::new(value).ok_or_else(|| concat!(stringify!($name), " must not be empty").to_string())
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> String {
                id.0
            }
        }
    };
}

// ---------------------------------------------------------------------------
// Identifiers supplied by the upstream CI/CD system
// ---------------------------------------------------------------------------

string_id! {
    /// Identifies an external CI/CD pipeline (a Jenkins job, a GitHub Actions
    /// workflow, ...). Stable across runs.
    PipelineId
}

string_id! {
    /// Identifies one execution of a pipeline.
    ///
    /// Upstream systems assign these; numeric build numbers are carried in
    /// their decimal string form.
    RunId
}

// ---------------------------------------------------------------------------
// Configuration-assigned identifiers
// ---------------------------------------------------------------------------

string_id! {
    /// Identifies a subscriber (a person, room, or automation) that receives
    /// notifications. Match results are ordered by this identifier.
    SubscriberId
}

string_id! {
    /// Opaque reference to a configured delivery sink (the key of a
    /// `[sinks.<name>]` table).
    SinkRef
}

// ---------------------------------------------------------------------------
// Attempt sequence
// ---------------------------------------------------------------------------

/// Retry counter for a single run, as reported by the upstream system.
///
/// Increases each time the same run is retried; a higher sequence always
/// supersedes a lower one in the status cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AttemptSequence(u64);

impl AttemptSequence {
    /// The sequence assumed when an upstream payload does not report one.
    pub const FIRST: Self = Self(1);

    /// Creates an [`AttemptSequence`] from a raw integer.
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    /// Returns the underlying integer value.
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for AttemptSequence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
