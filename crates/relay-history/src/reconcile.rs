use relay_core::{
    now_rfc3339, CoreError, Environment, FilteredHistory, HistoryItem, StorageIndex, TicketId,
    TicketSnapshot,
};
use relay_ledger::SnapshotLedger;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub appended: usize,
    pub updated: usize,
    pub removed: usize,
    pub total: usize,
}

impl ReconcileReport {
    pub fn changed(&self) -> bool {
        self.appended > 0 || self.updated > 0 || self.removed > 0
    }
}

/// Folds a fresh fetch into `snapshot`. Position `k` of the oldest-first
/// list always lands on storage index `k`: existing items keep their
/// delivery flag and only have their descriptive fields refreshed, new
/// positions are appended undelivered, and positions past the fresh length
/// are dropped.
pub fn reconcile(
    snapshot: &mut TicketSnapshot,
    fresh: &FilteredHistory,
) -> Result<ReconcileReport, CoreError> {
    let mut report = ReconcileReport {
        total: fresh.len(),
        ..ReconcileReport::default()
    };

    for (position, event) in fresh.oldest_first().enumerate() {
        match snapshot.items.get_mut(position) {
            Some(item) => {
                if item.describe(event) {
                    report.updated += 1;
                }
            }
            None => {
                let index = u32::try_from(position + 1)
                    .ok()
                    .and_then(StorageIndex::new)
                    .ok_or_else(|| {
                        CoreError::InvalidInput(format!(
                            "history of ticket {} is too long to index",
                            snapshot.ticket_id
                        ))
                    })?;
                snapshot.items.push(HistoryItem::new(index, event));
                report.appended += 1;
            }
        }
    }

    if snapshot.items.len() > fresh.len() {
        report.removed = snapshot.items.len() - fresh.len();
        warn!(
            ticket_id = %snapshot.ticket_id,
            previous = snapshot.items.len(),
            current = fresh.len(),
            "ticket history shrank; dropping trailing items"
        );
        snapshot.items.truncate(fresh.len());
    }

    if report.changed() {
        snapshot.updated_at = now_rfc3339();
    }
    Ok(report)
}

/// Loads, reconciles and persists one ticket's snapshot.
#[derive(Debug, Clone)]
pub struct HistoryReconciler {
    snapshots: SnapshotLedger,
}

impl HistoryReconciler {
    pub fn new(snapshots: SnapshotLedger) -> Self {
        Self { snapshots }
    }

    pub async fn reconcile(
        &self,
        ticket_id: &TicketId,
        environment: &Environment,
        fresh: &FilteredHistory,
    ) -> Result<(TicketSnapshot, ReconcileReport), CoreError> {
        let (mut snapshot, created) = match self.snapshots.load(ticket_id).await? {
            Some(snapshot) => (snapshot, false),
            None => (
                TicketSnapshot::new(ticket_id.clone(), environment.clone(), None),
                true,
            ),
        };

        let report = reconcile(&mut snapshot, fresh)?;
        if created || report.changed() {
            self.snapshots.save(&snapshot).await?;
        }
        debug!(
            ticket_id = %ticket_id,
            appended = report.appended,
            updated = report.updated,
            removed = report.removed,
            total = report.total,
            "history reconciled"
        );
        Ok((snapshot, report))
    }
}
