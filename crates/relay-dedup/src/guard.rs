use relay_core::{CoreError, DedupRule, TicketId};
use relay_ledger::{IdentifierLedger, MarkOutcome};
use tracing::{debug, info};

use crate::extract::{compile_rules, extract, CompiledRule};

/// An identifier seen for the first time. Hand it back to
/// [`DedupGuard::mark_processed`] once the side effect has succeeded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingIdentifier {
    pub identifier: String,
    pub rule: DedupRule,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DedupVerdict {
    /// An allow-list is configured and the sender is not on it. Nothing was
    /// extracted and nothing will be recorded.
    SenderNotListed,
    NoIdentifier,
    Fresh(PendingIdentifier),
    Duplicate {
        identifier: String,
        correlated_ticket_id: Option<TicketId>,
    },
}

impl DedupVerdict {
    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::Duplicate { .. })
    }

    pub fn identifier(&self) -> Option<&str> {
        match self {
            Self::Fresh(pending) => Some(&pending.identifier),
            Self::Duplicate { identifier, .. } => Some(identifier),
            Self::SenderNotListed | Self::NoIdentifier => None,
        }
    }
}

/// Decides whether a ticket-creation request repeats an earlier one.
#[derive(Debug, Clone)]
pub struct DedupGuard {
    rules: Vec<CompiledRule>,
    allowed_senders: Vec<String>,
    ledger: IdentifierLedger,
}

impl DedupGuard {
    pub fn new(rules: &[DedupRule], allowed_senders: &[String], ledger: IdentifierLedger) -> Self {
        Self {
            rules: compile_rules(rules),
            allowed_senders: allowed_senders
                .iter()
                .map(|sender| sender.trim().to_ascii_lowercase())
                .filter(|sender| !sender.is_empty())
                .collect(),
            ledger,
        }
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    /// The allow-list only filters messages that carry a sender address.
    fn sender_listed(&self, sender_email: Option<&str>) -> bool {
        let Some(sender) = sender_email.map(str::trim).filter(|sender| !sender.is_empty()) else {
            return true;
        };
        if self.allowed_senders.is_empty() {
            return true;
        }
        let sender = sender.to_ascii_lowercase();
        self.allowed_senders.iter().any(|allowed| *allowed == sender)
    }

    pub async fn check(
        &self,
        subject: &str,
        body: &str,
        sender_email: Option<&str>,
    ) -> Result<DedupVerdict, CoreError> {
        if !self.sender_listed(sender_email) {
            debug!(sender = ?sender_email, "sender not on dedup allow-list; skipping extraction");
            return Ok(DedupVerdict::SenderNotListed);
        }

        let Some(extraction) = extract(subject, body, &self.rules) else {
            return Ok(DedupVerdict::NoIdentifier);
        };

        match self.ledger.lookup(&extraction.identifier).await? {
            Some(existing) => {
                info!(
                    identifier = %existing.identifier,
                    correlated_ticket_id = ?existing.correlated_ticket_id,
                    "duplicate request detected"
                );
                Ok(DedupVerdict::Duplicate {
                    identifier: existing.identifier,
                    correlated_ticket_id: existing.correlated_ticket_id,
                })
            }
            None => Ok(DedupVerdict::Fresh(PendingIdentifier {
                identifier: extraction.identifier,
                rule: extraction.rule,
            })),
        }
    }

    pub async fn mark_processed(
        &self,
        pending: &PendingIdentifier,
        correlated_ticket_id: Option<TicketId>,
    ) -> Result<MarkOutcome, CoreError> {
        self.ledger
            .mark_processed(&pending.identifier, correlated_ticket_id)
            .await
    }
}
