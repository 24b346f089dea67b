use std::sync::Arc;

use relay_core::{
    CoreError, HousekeepingFilter, MonitorSettings, TicketHistorySource, TicketId, TicketSnapshot,
};
use relay_history::{compute_undelivered, HistoryReconciler, ReconcileReport};
use relay_ledger::SnapshotLedger;
use relay_notify::{DispatchOutcome, NotificationDispatcher};
use tokio::sync::watch;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TicketOutcome {
    /// The sender is on the exclusion list.
    Excluded,
    /// Fetch failed or came back empty; the snapshot was left alone.
    NoUpdate,
    Processed {
        reconcile: ReconcileReport,
        dispatch: DispatchOutcome,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub checked: usize,
    pub updated: usize,
    pub notified: usize,
    pub failed: usize,
    pub skipped: usize,
    /// Set when a stop request cut the cycle short.
    pub interrupted: bool,
}

/// One pass over every monitored ticket: fetch, filter, reconcile, dispatch.
pub struct MonitorCycle {
    history: Arc<dyn TicketHistorySource>,
    snapshots: SnapshotLedger,
    reconciler: HistoryReconciler,
    dispatcher: NotificationDispatcher,
    filter: HousekeepingFilter,
}

impl MonitorCycle {
    pub fn new(
        history: Arc<dyn TicketHistorySource>,
        snapshots: SnapshotLedger,
        dispatcher: NotificationDispatcher,
        filter: HousekeepingFilter,
    ) -> Self {
        Self {
            history,
            reconciler: HistoryReconciler::new(snapshots.clone()),
            snapshots,
            dispatcher,
            filter,
        }
    }

    /// Confirms the ledger backend answers.
    pub async fn health_check(&self) -> Result<usize, CoreError> {
        Ok(self.snapshots.list_tickets().await?.len())
    }

    /// Runs every ticket once. Per-ticket failures are counted and logged; only
    /// a listing failure or an unreachable persistence backend is returned.
    pub async fn run(
        &self,
        settings: &MonitorSettings,
        stop: Option<&watch::Receiver<bool>>,
    ) -> Result<CycleReport, CoreError> {
        let tickets = self.snapshots.list_tickets().await?;
        let mut report = CycleReport::default();

        for ticket_id in tickets {
            if stop.is_some_and(|stop| *stop.borrow()) {
                info!("stop requested; ending history cycle early");
                report.interrupted = true;
                break;
            }

            report.checked += 1;
            match self.process_ticket(&ticket_id, settings).await {
                Ok(TicketOutcome::Excluded) => report.skipped += 1,
                Ok(TicketOutcome::NoUpdate) => {}
                Ok(TicketOutcome::Processed {
                    reconcile,
                    dispatch,
                }) => {
                    if reconcile.changed() {
                        report.updated += 1;
                    }
                    match dispatch {
                        DispatchOutcome::Sent { .. } => report.notified += 1,
                        DispatchOutcome::SendFailed { .. } => report.failed += 1,
                        _ => {}
                    }
                }
                Err(error) if error.is_backend_unreachable() => return Err(error),
                Err(error) => {
                    warn!(ticket_id = %ticket_id, error = %error, "history check failed; retrying next cycle");
                    report.failed += 1;
                }
            }
        }

        info!(
            checked = report.checked,
            updated = report.updated,
            notified = report.notified,
            failed = report.failed,
            skipped = report.skipped,
            "history cycle finished"
        );
        Ok(report)
    }

    pub async fn process_ticket(
        &self,
        ticket_id: &TicketId,
        settings: &MonitorSettings,
    ) -> Result<TicketOutcome, CoreError> {
        let Some(snapshot) = self.snapshots.load(ticket_id).await? else {
            return Err(CoreError::Persistence(format!(
                "monitored ticket {ticket_id} has no stored snapshot"
            )));
        };
        if snapshot
            .sender_email
            .as_deref()
            .is_some_and(|sender| settings.is_sender_excluded(sender))
        {
            debug!(ticket_id = %ticket_id, "sender excluded from history monitoring");
            return Ok(TicketOutcome::Excluded);
        }

        let fetched = match self.history.fetch(ticket_id, &snapshot.environment).await {
            Ok(fetched) => fetched,
            Err(error) if error.is_backend_unreachable() => return Err(error),
            Err(error) => {
                warn!(ticket_id = %ticket_id, error = %error, "history fetch failed; no update this cycle");
                return Ok(TicketOutcome::NoUpdate);
            }
        };
        if fetched.is_empty() {
            debug!(ticket_id = %ticket_id, "history fetch returned nothing; no update this cycle");
            return Ok(TicketOutcome::NoUpdate);
        }

        let fresh = self.filter.apply(fetched);
        let (reconciled, reconcile) = self
            .reconciler
            .reconcile(ticket_id, &snapshot.environment, &fresh)
            .await?;
        let pending = compute_undelivered(&reconciled, &fresh);
        debug!(
            ticket_id = %ticket_id,
            items = reconciled.items.len(),
            delivered = reconciled.delivered_count(),
            pending = pending.len(),
            "history reconciled"
        );
        let dispatch = self
            .dispatcher
            .dispatch(
                ticket_id,
                &reconciled.environment,
                &pending,
                recipient(&reconciled),
            )
            .await?;

        Ok(TicketOutcome::Processed {
            reconcile,
            dispatch,
        })
    }
}

fn recipient(snapshot: &TicketSnapshot) -> Option<&str> {
    snapshot.sender_email.as_deref()
}
