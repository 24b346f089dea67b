//! Ledger persistence: blob stores plus the identifier and snapshot ledgers
//! built on them.

pub mod blob;
mod codec;
pub mod identifiers;
pub mod snapshots;
pub mod store;

pub use blob::{InMemoryBlobStore, SqliteBlobStore};
pub use identifiers::{IdentifierLedger, MarkOutcome, DEFAULT_IDENTIFIER_LEDGER};
pub use snapshots::{SnapshotLedger, SNAPSHOT_PREFIX};
pub use store::LedgerStore;
