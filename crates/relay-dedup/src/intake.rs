//! Inbound-message intake: sender policy, dedup, ticket creation and
//! registration for history monitoring, in that order.

use std::sync::Arc;

use relay_core::{CoreError, NewTicketRequest, TicketCreator, TicketId};
use relay_ledger::SnapshotLedger;
use tracing::{info, warn};

use crate::guard::{DedupGuard, DedupVerdict};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    /// Raw `From` header, either `addr` or `Name <addr>`.
    pub from: String,
    pub subject: String,
    pub body: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IntakePolicy {
    pub blocked_senders: Vec<String>,
    pub allowed_domains: Vec<String>,
}

impl IntakePolicy {
    fn is_blocked(&self, sender: Option<&str>) -> bool {
        sender.is_some_and(|sender| {
            self.blocked_senders
                .iter()
                .any(|blocked| blocked.trim().eq_ignore_ascii_case(sender))
        })
    }

    fn domain_allowed(&self, sender: Option<&str>) -> bool {
        let domains: Vec<&str> = self
            .allowed_domains
            .iter()
            .map(|domain| domain.trim().trim_start_matches('@'))
            .filter(|domain| !domain.is_empty())
            .collect();
        if domains.is_empty() {
            return true;
        }
        let Some(domain) = sender.and_then(|sender| sender.rsplit_once('@')).map(|(_, d)| d) else {
            return false;
        };
        domains
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(domain))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntakeOutcome {
    /// Sender is blocked; the message is dropped without a trace.
    Ignored { sender: Option<String> },
    /// Sender domain is outside the configured allow-list.
    Rejected { sender: Option<String> },
    Duplicate {
        identifier: String,
        correlated_ticket_id: Option<TicketId>,
    },
    CreationFailed { error: CoreError },
    Created {
        ticket_id: TicketId,
        identifier: Option<String>,
        /// Set when the ticket exists but recording it failed afterwards.
        ledger_error: Option<CoreError>,
    },
}

/// Pulls the bare address out of `Name <addr>`, lowercased.
pub fn extract_sender_address(from: &str) -> Option<String> {
    let from = from.trim();
    let address = match (from.rfind('<'), from.rfind('>')) {
        (Some(open), Some(close)) if open < close => &from[open + 1..close],
        _ => from,
    };
    let address = address.trim().trim_matches('"').trim();
    (!address.is_empty()).then(|| address.to_ascii_lowercase())
}

pub struct IntakePipeline {
    guard: DedupGuard,
    snapshots: SnapshotLedger,
    creator: Arc<dyn TicketCreator>,
    policy: IntakePolicy,
}

impl IntakePipeline {
    pub fn new(
        guard: DedupGuard,
        snapshots: SnapshotLedger,
        creator: Arc<dyn TicketCreator>,
        policy: IntakePolicy,
    ) -> Self {
        Self {
            guard,
            snapshots,
            creator,
            policy,
        }
    }

    /// Processes one message. An `Err` means the dedup ledger could not be
    /// consulted, in which case no ticket was created.
    pub async fn process(&self, message: &InboundMessage) -> Result<IntakeOutcome, CoreError> {
        let sender = extract_sender_address(&message.from);

        if self.policy.is_blocked(sender.as_deref()) {
            info!(sender = ?sender, "ignoring message from blocked sender");
            return Ok(IntakeOutcome::Ignored { sender });
        }
        if !self.policy.domain_allowed(sender.as_deref()) {
            info!(sender = ?sender, "rejecting message from domain outside allow-list");
            return Ok(IntakeOutcome::Rejected { sender });
        }

        let verdict = self
            .guard
            .check(&message.subject, &message.body, sender.as_deref())
            .await?;
        let pending = match verdict {
            DedupVerdict::Duplicate {
                identifier,
                correlated_ticket_id,
            } => {
                return Ok(IntakeOutcome::Duplicate {
                    identifier,
                    correlated_ticket_id,
                })
            }
            DedupVerdict::Fresh(pending) => Some(pending),
            DedupVerdict::NoIdentifier | DedupVerdict::SenderNotListed => None,
        };

        let request = NewTicketRequest {
            sender_email: sender.clone().unwrap_or_default(),
            subject: message.subject.clone(),
            body: message.body.clone(),
        };
        let created = match self.creator.create_ticket(request).await {
            Ok(created) => created,
            Err(error) => {
                warn!(sender = ?sender, error = %error, "ticket creation failed");
                return Ok(IntakeOutcome::CreationFailed { error });
            }
        };
        info!(ticket_id = %created.ticket_id, sender = ?sender, "ticket created from inbound message");

        let mut ledger_error = None;
        if let Some(pending) = &pending {
            if let Err(error) = self
                .guard
                .mark_processed(pending, Some(created.ticket_id.clone()))
                .await
            {
                warn!(
                    ticket_id = %created.ticket_id,
                    identifier = %pending.identifier,
                    error = %error,
                    "ticket created but identifier could not be recorded"
                );
                ledger_error = Some(error);
            }
        }
        if let Err(error) = self
            .snapshots
            .register(created.ticket_id.clone(), created.environment.clone(), sender)
            .await
        {
            warn!(
                ticket_id = %created.ticket_id,
                error = %error,
                "ticket created but could not be registered for monitoring"
            );
            ledger_error.get_or_insert(error);
        }

        Ok(IntakeOutcome::Created {
            ticket_id: created.ticket_id,
            identifier: pending.map(|pending| pending.identifier),
            ledger_error,
        })
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use relay_core::{CreatedTicket, DedupRule, Environment};
    use relay_ledger::{IdentifierLedger, InMemoryBlobStore, LedgerStore};
    use tokio::sync::Mutex;

    use super::*;

    #[derive(Default)]
    struct StubCreator {
        results: Mutex<Vec<Result<CreatedTicket, CoreError>>>,
        requests: Mutex<Vec<NewTicketRequest>>,
    }

    impl StubCreator {
        fn with(results: Vec<Result<CreatedTicket, CoreError>>) -> Self {
            Self {
                results: Mutex::new(results),
                requests: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl TicketCreator for StubCreator {
        async fn create_ticket(
            &self,
            request: NewTicketRequest,
        ) -> Result<CreatedTicket, CoreError> {
            self.requests.lock().await.push(request);
            let mut results = self.results.lock().await;
            if results.is_empty() {
                return Err(CoreError::DependencyUnavailable(
                    "no stub result queued".to_owned(),
                ));
            }
            results.remove(0)
        }
    }

    fn created(id: &str) -> Result<CreatedTicket, CoreError> {
        Ok(CreatedTicket {
            ticket_id: TicketId::new(id),
            environment: Environment::default(),
        })
    }

    fn pipeline(
        creator: Arc<StubCreator>,
        policy: IntakePolicy,
    ) -> (IntakePipeline, SnapshotLedger, IdentifierLedger) {
        let store = LedgerStore::new(Arc::new(InMemoryBlobStore::new()));
        let identifiers = IdentifierLedger::new(store.clone());
        let snapshots = SnapshotLedger::new(store);
        let guard = DedupGuard::new(&[DedupRule::keyword("MAC:")], &[], identifiers.clone());
        (
            IntakePipeline::new(guard, snapshots.clone(), creator, policy),
            snapshots,
            identifiers,
        )
    }

    fn message(from: &str, body: &str) -> InboundMessage {
        InboundMessage {
            from: from.to_owned(),
            subject: "Router offline".to_owned(),
            body: body.to_owned(),
        }
    }

    #[test]
    fn sender_address_is_parsed_from_display_form() {
        assert_eq!(
            extract_sender_address("Ana Souza <Ana@Example.com>"),
            Some("ana@example.com".to_owned())
        );
        assert_eq!(
            extract_sender_address(" ops@example.com "),
            Some("ops@example.com".to_owned())
        );
        assert_eq!(extract_sender_address("  "), None);
    }

    #[tokio::test]
    async fn new_message_creates_records_and_registers_ticket() {
        let creator = Arc::new(StubCreator::with(vec![created("7001")]));
        let (pipeline, snapshots, identifiers) = pipeline(creator.clone(), IntakePolicy::default());

        let outcome = pipeline
            .process(&message("Ana <ana@example.com>", "MAC: AABBCCDDEEFF"))
            .await
            .expect("process");

        assert_eq!(
            outcome,
            IntakeOutcome::Created {
                ticket_id: TicketId::new("7001"),
                identifier: Some("AABBCCDDEEFF".to_owned()),
                ledger_error: None,
            }
        );
        let recorded = identifiers
            .lookup("AABBCCDDEEFF")
            .await
            .expect("lookup")
            .expect("recorded");
        assert_eq!(recorded.correlated_ticket_id, Some(TicketId::new("7001")));
        let snapshot = snapshots
            .load(&TicketId::new("7001"))
            .await
            .expect("load")
            .expect("registered");
        assert_eq!(snapshot.sender_email.as_deref(), Some("ana@example.com"));
        assert_eq!(
            creator.requests.lock().await[0].sender_email,
            "ana@example.com"
        );
    }

    #[tokio::test]
    async fn resent_message_does_not_create_a_second_ticket() {
        let creator = Arc::new(StubCreator::with(vec![created("7001"), created("7002")]));
        let (pipeline, _, _) = pipeline(creator.clone(), IntakePolicy::default());

        pipeline
            .process(&message("ana@example.com", "MAC: AABBCCDDEEFF"))
            .await
            .expect("first");
        let second = pipeline
            .process(&message("ana@example.com", "MAC: AABBCCDDEEFF"))
            .await
            .expect("second");

        assert_eq!(
            second,
            IntakeOutcome::Duplicate {
                identifier: "AABBCCDDEEFF".to_owned(),
                correlated_ticket_id: Some(TicketId::new("7001")),
            }
        );
        assert_eq!(creator.requests.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn failed_creation_marks_nothing() {
        let creator = Arc::new(StubCreator::with(vec![Err(
            CoreError::DependencyUnavailable("ticket api down".to_owned()),
        )]));
        let (pipeline, snapshots, identifiers) = pipeline(creator, IntakePolicy::default());

        let outcome = pipeline
            .process(&message("ana@example.com", "MAC: AABBCCDDEEFF"))
            .await
            .expect("process");

        assert!(matches!(outcome, IntakeOutcome::CreationFailed { .. }));
        assert!(identifiers.all().await.expect("all").is_empty());
        assert!(snapshots.list_tickets().await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn blocked_and_foreign_senders_are_filtered_before_dedup() {
        let creator = Arc::new(StubCreator::default());
        let policy = IntakePolicy {
            blocked_senders: vec!["noreply@example.com".to_owned()],
            allowed_domains: vec!["example.com".to_owned()],
        };
        let (pipeline, _, identifiers) = pipeline(creator.clone(), policy);

        let blocked = pipeline
            .process(&message("Robot <NoReply@example.com>", "MAC: 11"))
            .await
            .expect("blocked");
        let foreign = pipeline
            .process(&message("someone@elsewhere.org", "MAC: 22"))
            .await
            .expect("foreign");

        assert!(matches!(blocked, IntakeOutcome::Ignored { .. }));
        assert!(matches!(foreign, IntakeOutcome::Rejected { .. }));
        assert!(creator.requests.lock().await.is_empty());
        assert!(identifiers.all().await.expect("all").is_empty());
    }
}
