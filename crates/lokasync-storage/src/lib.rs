//! Update session storage for LokaSync.
//!
//! [`SessionStore`] is the seam between the ingest pipeline and its data:
//! `RedbSessionStore` persists sessions on disk, `MemorySessionStore` keeps
//! them in process.

pub mod backends;
pub mod error;
pub mod store;

pub use backends::{MemorySessionStore, RedbSessionStore};
pub use error::{Error, Result};
pub use store::{FilterOptions, LogFilter, SessionStore, UpsertOutcome};
