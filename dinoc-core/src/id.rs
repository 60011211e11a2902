//! 128-bit identifiers for agents, tasks and listeners.
//!
//! Both [`AgentId`] and [`TaskId`] wrap a [`Uuid`] so that a lookup with the
//! wrong kind of identifier is a compile error rather than a logic bug: the
//! registry and the task engine each index by their own id type and nothing
//! forces them to agree by accident.

use std::fmt::Display;
use uuid::Uuid;

macro_rules! uuid_id {
    ($name:ident, $doc:literal) => {
        #[doc = $doc]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(Uuid);

        impl $name {
            /// Generates a new, randomly assigned identifier.
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Wraps an existing UUID, e.g. one round-tripped over the wire.
            pub const fn from_uuid(id: Uuid) -> Self {
                Self(id)
            }

            /// Returns the underlying UUID.
            pub const fn as_uuid(&self) -> Uuid {
                self.0
            }

            /// The identifier as raw bytes, as carried on the wire.
            pub fn to_bytes(self) -> [u8; 16] {
                *self.0.as_bytes()
            }

            /// Reconstructs an identifier from wire bytes.
            pub fn from_bytes(bytes: [u8; 16]) -> Self {
                Self(Uuid::from_bytes(bytes))
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                Display::fmt(&self.0, f)
            }
        }
    };
}

uuid_id!(
    AgentId,
    "Identifies one agent (session) for the lifetime of the server process."
);
uuid_id!(TaskId, "Identifies one task targeted at exactly one agent.");

/// Identifies a running listener so agents can reference their owning
/// listener by id instead of holding a pointer back to it, breaking the
/// listener-agent ownership cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ListenerId(Uuid);

impl ListenerId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ListenerId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for ListenerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self.0, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique() {
        assert_ne!(AgentId::new(), AgentId::new());
        assert_ne!(TaskId::new(), TaskId::new());
    }

    #[test]
    fn round_trips_through_bytes() {
        let id = AgentId::new();
        assert_eq!(AgentId::from_bytes(id.to_bytes()), id);
    }
}
