//! Identifier generation for claims, events, contests, and handoffs.
//!
//! Identifiers are UUIDv4 strings with a short kind prefix so that a bare id
//! in a log line or an event payload is self-describing. All characters are
//! printable and url-safe.

use uuid::Uuid;

/// Generator for the coordinator's identifier families.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdGen;

impl IdGen {
    /// Create a new generator.
    pub fn new() -> Self {
        Self
    }

    /// Unique claim identifier (`claim-<uuid>`).
    pub fn claim_id(&self) -> String {
        format!("claim-{}", Uuid::new_v4())
    }

    /// Unique event identifier (`evt-<uuid>`).
    pub fn event_id(&self) -> String {
        format!("evt-{}", Uuid::new_v4())
    }

    /// Unique contest identifier (`contest-<uuid>`).
    pub fn contest_id(&self) -> String {
        format!("contest-{}", Uuid::new_v4())
    }

    /// Unique handoff identifier (`handoff-<uuid>`).
    pub fn handoff_id(&self) -> String {
        format!("handoff-{}", Uuid::new_v4())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique() {
        let ids = IdGen::new();
        let a = ids.claim_id();
        let b = ids.claim_id();
        assert_ne!(a, b);
    }

    #[test]
    fn ids_carry_kind_prefix() {
        let ids = IdGen::new();
        assert!(ids.claim_id().starts_with("claim-"));
        assert!(ids.event_id().starts_with("evt-"));
        assert!(ids.contest_id().starts_with("contest-"));
        assert!(ids.handoff_id().starts_with("handoff-"));
    }

    #[test]
    fn ids_are_url_safe() {
        let ids = IdGen::new();
        let id = ids.handoff_id();
        assert!(id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-'));
    }
}
