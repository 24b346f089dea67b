use relay_core::{CoreError, Environment, TicketId, TicketSnapshot};
use tracing::info;

use crate::codec::{decode_snapshot, encode_snapshot, SnapshotDocument};
use crate::store::LedgerStore;

pub const SNAPSHOT_PREFIX: &str = "history/ticket_";
const SNAPSHOT_SUFFIX: &str = ".json";

/// Per-ticket history snapshots, one blob per monitored ticket.
#[derive(Debug, Clone)]
pub struct SnapshotLedger {
    store: LedgerStore,
}

impl SnapshotLedger {
    pub fn new(store: LedgerStore) -> Self {
        Self { store }
    }

    pub fn blob_name(ticket_id: &TicketId) -> Result<String, CoreError> {
        let raw = ticket_id.as_str().trim();
        if raw.is_empty() || raw.contains('/') || raw.contains('\\') {
            return Err(CoreError::InvalidInput(format!(
                "ticket id '{ticket_id}' cannot be used as a ledger name"
            )));
        }
        Ok(format!("{SNAPSHOT_PREFIX}{raw}{SNAPSHOT_SUFFIX}"))
    }

    pub async fn load(&self, ticket_id: &TicketId) -> Result<Option<TicketSnapshot>, CoreError> {
        let name = Self::blob_name(ticket_id)?;
        self.store
            .load_existing::<SnapshotDocument>(&name)
            .await?
            .map(decode_snapshot)
            .transpose()
    }

    pub async fn save(&self, snapshot: &TicketSnapshot) -> Result<(), CoreError> {
        let name = Self::blob_name(&snapshot.ticket_id)?;
        self.store.save(&name, &encode_snapshot(snapshot)).await
    }

    /// Starts monitoring a ticket. An existing snapshot is kept as is, except
    /// that a missing sender address is filled in.
    pub async fn register(
        &self,
        ticket_id: TicketId,
        environment: Environment,
        sender_email: Option<String>,
    ) -> Result<TicketSnapshot, CoreError> {
        match self.load(&ticket_id).await? {
            Some(mut existing) => {
                if existing.sender_email.is_none() && sender_email.is_some() {
                    existing.sender_email = sender_email;
                    self.save(&existing).await?;
                }
                Ok(existing)
            }
            None => {
                let snapshot = TicketSnapshot::new(ticket_id, environment, sender_email);
                self.save(&snapshot).await?;
                info!(ticket_id = %snapshot.ticket_id, "ticket registered for history monitoring");
                Ok(snapshot)
            }
        }
    }

    pub async fn list_tickets(&self) -> Result<Vec<TicketId>, CoreError> {
        let names = self.store.list(SNAPSHOT_PREFIX).await?;
        Ok(names
            .iter()
            .filter_map(|name| {
                name.strip_prefix(SNAPSHOT_PREFIX)
                    .and_then(|rest| rest.strip_suffix(SNAPSHOT_SUFFIX))
                    .filter(|raw| !raw.is_empty())
                    .map(TicketId::from)
            })
            .collect())
    }
}
