use std::collections::BTreeSet;

use relay_core::{
    now_rfc3339, CoreError, FilteredHistory, HistoryEvent, StorageIndex, TicketId, TicketSnapshot,
};
use relay_ledger::SnapshotLedger;
use tracing::{info, warn};

/// A fetched event that has not been delivered yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingItem {
    pub storage_index: StorageIndex,
    pub event: HistoryEvent,
}

/// Maps every position `p` of the fresh newest-first list onto storage index
/// `N - p` and returns the events whose item is not yet delivered, in fresh
/// (newest-first) order.
pub fn compute_undelivered(snapshot: &TicketSnapshot, fresh: &FilteredHistory) -> Vec<PendingItem> {
    let len = fresh.len();
    fresh
        .newest_first()
        .iter()
        .enumerate()
        .filter_map(|(position, event)| {
            let storage_index = StorageIndex::from_source_position(len, position)?;
            let delivered = snapshot
                .item(storage_index)
                .is_some_and(|item| item.delivered);
            (!delivered).then(|| PendingItem {
                storage_index,
                event: event.clone(),
            })
        })
        .collect()
}

/// Owns the only write path that flips delivery flags.
#[derive(Debug, Clone)]
pub struct DeliveryTracker {
    snapshots: SnapshotLedger,
}

impl DeliveryTracker {
    pub fn new(snapshots: SnapshotLedger) -> Self {
        Self { snapshots }
    }

    /// Flips exactly the given flags in one write. Flags already set stay set;
    /// indices the snapshot does not know are ignored. Returns how many flags
    /// changed.
    pub async fn mark_delivered(
        &self,
        ticket_id: &TicketId,
        indices: &[StorageIndex],
    ) -> Result<usize, CoreError> {
        if indices.is_empty() {
            return Ok(0);
        }
        let Some(mut snapshot) = self.snapshots.load(ticket_id).await? else {
            return Err(CoreError::Persistence(format!(
                "no snapshot stored for ticket {ticket_id}"
            )));
        };

        let mut flipped = 0;
        for index in indices.iter().copied().collect::<BTreeSet<_>>() {
            match snapshot.item_mut(index) {
                Some(item) if !item.delivered => {
                    item.delivered = true;
                    flipped += 1;
                }
                Some(_) => {}
                None => {
                    warn!(ticket_id = %ticket_id, storage_index = %index, "cannot flag unknown history item");
                }
            }
        }

        if flipped > 0 {
            snapshot.updated_at = now_rfc3339();
            self.snapshots.save(&snapshot).await?;
            info!(ticket_id = %ticket_id, flipped, "history items marked delivered");
        }
        Ok(flipped)
    }
}
