//! Storage abstraction for claims and the event log.
//!
//! The repository persists claim records and appended events; the live
//! projection ([`crate::store::ClaimStore`]) and the versioned log
//! ([`crate::event_log::EventLog`]) sit on top of it. A volatile in-memory
//! implementation is provided for conformance tests; durable backends
//! implement the same trait.

use crate::domain::Claim;
use crate::errors::CoordResult;
use crate::events::EventRecord;

pub mod memory;

pub use memory::InMemoryRepository;

/// Persistence backend for claims and events.
///
/// Implementations must be safe for concurrent use; the coordinator calls
/// into the repository from inside per-issue critical sections.
pub trait ClaimRepository: Send + Sync {
    /// Save a claim record (create or update). Terminal claims stay stored
    /// for history.
    fn save_claim(&self, claim: &Claim) -> CoordResult<()>;

    /// Load every stored claim, terminal ones included.
    fn load_claims(&self) -> CoordResult<Vec<Claim>>;

    /// Append an event. Events are immutable once appended.
    fn append_event(&self, record: &EventRecord) -> CoordResult<()>;

    /// Read all events in append order.
    fn read_events(&self) -> CoordResult<Vec<EventRecord>>;
}
