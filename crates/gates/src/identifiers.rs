//! Newtype domain identifiers.
//!
//! Every domain concept that has an identity is represented as a distinct newtype
//! wrapping a primitive. This prevents accidentally interchanging, for example, a
//! [`GateId`] with a [`SectionCode`] even though both are strings under the hood.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Macro for String-wrapped newtypes.
// Generates: struct, new() returning Option<Self>, as_str(), Display.
// An optional validator narrows the accepted values beyond "not blank".
// ---------------------------------------------------------------------------
macro_rules! string_id {
    (
        $(#[$attr:meta])*
        $name:ident
    ) => {
        string_id! {
            $(#[$attr])*
            $name where |_: &str| true, "must not be empty"
        }
    };
    (
        $(#[$attr:meta])*
        $name:ident where $valid:expr, $rule:literal
    ) => {
        $(#[$attr])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            /// Creates a new identifier, returning `None` if the value is blank
            /// or otherwise not a valid identifier of this kind.
            pub fn new(value: impl Into<String>) -> Option<Self> {
                let v = value.into();
                let valid: fn(&str) -> bool = $valid;
                if v.trim().is_empty() || !valid(&v) { None } else { Some(Self(v)) }
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
                Self::new(value).ok_or_else(|| format!("{} {}", stringify!($name), $rule))
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> Self {
                value.0
            }
        }
    };
}

/// Gate ids name files (recorded evidence, report entries), so they are
/// restricted to a single safe path component.
fn is_file_safe(value: &str) -> bool {
    !value.contains("..")
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

// ---------------------------------------------------------------------------
// Identifiers — UUID-backed (internally generated)
// ---------------------------------------------------------------------------

/// Identifies a single promotion evaluation.
///
/// Generated fresh for every evaluation; threaded through every gate result,
/// every tracing span, and the final report so activity can be cross-referenced
/// with external logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CorrelationId(Uuid);

impl CorrelationId {
    /// Generates a new random correlation identifier.
    pub fn new_random() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates a [`CorrelationId`] from an existing UUID (e.g. when replaying an evaluation).
    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    /// Returns the underlying [`Uuid`].
    pub fn as_uuid(self) -> Uuid {
        self.0
    }
}

impl std::fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Identifiers — String-backed (configuration / VCS names)
// ---------------------------------------------------------------------------

string_id! {
    /// Identifies a gate. Unique within a registry and stable across versions:
    /// an inherited gate keeps its id for as long as the floor exists.
    /// Only ASCII letters, digits, `.`, `_` and `-` are allowed, and never `..`.
    GateId where is_file_safe, "must use only ASCII letters, digits, '.', '_' or '-' and must not contain '..'"
}

string_id! {
    /// Short section identifier in the score ledger (e.g. `"A"`).
    SectionCode
}

string_id! {
    /// The release candidate under evaluation (a commit SHA or tag).
    CandidateId
}

string_id! {
    /// A Git branch name (e.g. `"release"`).
    BranchName
}

string_id! {
    /// Names a configured collaborator that gates reference.
    CollaboratorName
}

string_id! {
    /// Names an explicit promotion criterion (e.g. `"release-bundle-hash-present"`).
    CriterionName
}
