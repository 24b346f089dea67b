use relay_core::{now_rfc3339, CoreError, ProcessedIdentifier, TicketId};
use tracing::debug;

use crate::codec::{IdentifierEntry, IdentifierLedgerDocument};
use crate::store::LedgerStore;

pub const DEFAULT_IDENTIFIER_LEDGER: &str = "dedup/processed_identifiers.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkOutcome {
    Inserted,
    /// The identifier existed without a ticket and now carries one.
    Correlated,
    Unchanged,
}

/// Ledger of identifiers whose side effect has already happened.
#[derive(Debug, Clone)]
pub struct IdentifierLedger {
    store: LedgerStore,
    name: String,
}

impl IdentifierLedger {
    pub fn new(store: LedgerStore) -> Self {
        Self::with_name(store, DEFAULT_IDENTIFIER_LEDGER)
    }

    pub fn with_name(store: LedgerStore, name: impl Into<String>) -> Self {
        Self {
            store,
            name: name.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn lookup(&self, identifier: &str) -> Result<Option<ProcessedIdentifier>, CoreError> {
        let document: IdentifierLedgerDocument = self.store.load(&self.name).await?;
        Ok(document
            .identifiers
            .get(identifier)
            .map(|entry| to_processed(identifier, entry)))
    }

    pub async fn all(&self) -> Result<Vec<ProcessedIdentifier>, CoreError> {
        let document: IdentifierLedgerDocument = self.store.load(&self.name).await?;
        Ok(document
            .identifiers
            .iter()
            .map(|(identifier, entry)| to_processed(identifier, entry))
            .collect())
    }

    /// Records `identifier` as processed. Repeating the call is a no-op apart
    /// from attaching a ticket id to an entry that had none; an existing
    /// correlation is never replaced.
    pub async fn mark_processed(
        &self,
        identifier: &str,
        correlated_ticket_id: Option<TicketId>,
    ) -> Result<MarkOutcome, CoreError> {
        let identifier = identifier.trim();
        if identifier.is_empty() {
            return Err(CoreError::InvalidInput(
                "cannot mark an empty identifier as processed".to_owned(),
            ));
        }

        let mut document: IdentifierLedgerDocument = self.store.load(&self.name).await?;
        let outcome = match document.identifiers.get_mut(identifier) {
            None => {
                document.identifiers.insert(
                    identifier.to_owned(),
                    IdentifierEntry {
                        first_seen_at: now_rfc3339(),
                        correlated_ticket_id,
                    },
                );
                MarkOutcome::Inserted
            }
            Some(entry) => {
                if entry.correlated_ticket_id.is_none() && correlated_ticket_id.is_some() {
                    entry.correlated_ticket_id = correlated_ticket_id;
                    MarkOutcome::Correlated
                } else {
                    MarkOutcome::Unchanged
                }
            }
        };

        if outcome != MarkOutcome::Unchanged {
            self.store.save(&self.name, &document).await?;
        }
        debug!(identifier, ?outcome, ledger = %self.name, "identifier ledger updated");
        Ok(outcome)
    }
}

fn to_processed(identifier: &str, entry: &IdentifierEntry) -> ProcessedIdentifier {
    ProcessedIdentifier {
        identifier: identifier.to_owned(),
        first_seen_at: entry.first_seen_at.clone(),
        correlated_ticket_id: entry.correlated_ticket_id.clone(),
    }
}
