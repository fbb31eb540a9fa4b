//! Session store backends.

pub mod memory;
pub mod redb;

pub use self::memory::MemorySessionStore;
pub use self::redb::RedbSessionStore;
