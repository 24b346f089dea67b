//! Turns complete newest-first history fetches into stable, append-only
//! numbered snapshots and tracks which items have been delivered.

pub mod delivery;
pub mod reconcile;

pub use delivery::{compute_undelivered, DeliveryTracker, PendingItem};
pub use reconcile::{reconcile, HistoryReconciler, ReconcileReport};
