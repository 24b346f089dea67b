use serde::{Deserialize, Serialize};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

use crate::identifiers::{Environment, StorageIndex, TicketId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HistoryKind {
    Transition,
    Comment,
    Attachment,
}

impl HistoryKind {
    pub fn as_key(self) -> &'static str {
        match self {
            Self::Transition => "TRANSITION",
            Self::Comment => "COMMENT",
            Self::Attachment => "ATTACHMENT",
        }
    }

    pub fn from_key(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "TRANSITION" => Some(Self::Transition),
            "COMMENT" => Some(Self::Comment),
            "ATTACHMENT" => Some(Self::Attachment),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl Actor {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            code: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentRef {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u32>,
}

/// Kind-specific descriptive fields of a history entry. Every field may be
/// amended by the source between polls.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub assignees: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub movement_sequence: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment: Option<AttachmentRef>,
}

/// One entry of a ticket's audit trail as returned by a fresh fetch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEvent {
    pub kind: HistoryKind,
    pub timestamp: String,
    pub actor: Actor,
    #[serde(default)]
    pub payload: EventPayload,
}

impl HistoryEvent {
    pub fn comment(timestamp: impl Into<String>, actor: &str, text: impl Into<String>) -> Self {
        Self {
            kind: HistoryKind::Comment,
            timestamp: timestamp.into(),
            actor: Actor::named(actor),
            payload: EventPayload {
                comment: Some(text.into()),
                ..EventPayload::default()
            },
        }
    }

    pub fn transition(
        timestamp: impl Into<String>,
        actor: &str,
        from: impl Into<String>,
        to: impl Into<String>,
    ) -> Self {
        Self {
            kind: HistoryKind::Transition,
            timestamp: timestamp.into(),
            actor: Actor::named(actor),
            payload: EventPayload {
                state_name: Some(from.into()),
                target_state: Some(to.into()),
                ..EventPayload::default()
            },
        }
    }

    pub fn attachment(timestamp: impl Into<String>, actor: &str, name: impl Into<String>) -> Self {
        Self {
            kind: HistoryKind::Attachment,
            timestamp: timestamp.into(),
            actor: Actor::named(actor),
            payload: EventPayload {
                attachment: Some(AttachmentRef {
                    name: name.into(),
                    id: None,
                    version: None,
                }),
                ..EventPayload::default()
            },
        }
    }

    pub fn comment_text(&self) -> Option<&str> {
        self.payload
            .comment
            .as_deref()
            .map(str::trim)
            .filter(|text| !text.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryItem {
    pub storage_index: StorageIndex,
    pub kind: HistoryKind,
    pub timestamp: String,
    pub actor: Actor,
    pub payload: EventPayload,
    pub delivered: bool,
}

impl HistoryItem {
    pub fn new(storage_index: StorageIndex, event: &HistoryEvent) -> Self {
        Self {
            storage_index,
            kind: event.kind,
            timestamp: event.timestamp.clone(),
            actor: event.actor.clone(),
            payload: event.payload.clone(),
            delivered: false,
        }
    }

    /// Overwrites the descriptive fields from a fresh event. Position and
    /// delivery state are left untouched. Returns whether anything changed.
    pub fn describe(&mut self, event: &HistoryEvent) -> bool {
        let changed = self.kind != event.kind
            || self.timestamp != event.timestamp
            || self.actor != event.actor
            || self.payload != event.payload;
        if changed {
            self.kind = event.kind;
            self.timestamp.clone_from(&event.timestamp);
            self.actor = event.actor.clone();
            self.payload = event.payload.clone();
        }
        changed
    }

    pub fn to_event(&self) -> HistoryEvent {
        HistoryEvent {
            kind: self.kind,
            timestamp: self.timestamp.clone(),
            actor: self.actor.clone(),
            payload: self.payload.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketSnapshot {
    pub ticket_id: TicketId,
    pub environment: Environment,
    pub sender_email: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub items: Vec<HistoryItem>,
}

impl TicketSnapshot {
    pub fn new(ticket_id: TicketId, environment: Environment, sender_email: Option<String>) -> Self {
        let now = now_rfc3339();
        Self {
            ticket_id,
            environment,
            sender_email,
            created_at: now.clone(),
            updated_at: now,
            items: Vec::new(),
        }
    }

    pub fn item(&self, index: StorageIndex) -> Option<&HistoryItem> {
        // Items are kept sorted and contiguous, so position == index - 1.
        self.items
            .get(index.get() as usize - 1)
            .filter(|item| item.storage_index == index)
    }

    pub fn item_mut(&mut self, index: StorageIndex) -> Option<&mut HistoryItem> {
        self.items
            .get_mut(index.get() as usize - 1)
            .filter(|item| item.storage_index == index)
    }

    pub fn delivered_count(&self) -> usize {
        self.items.iter().filter(|item| item.delivered).count()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessedIdentifier {
    pub identifier: String,
    pub first_seen_at: String,
    pub correlated_ticket_id: Option<TicketId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleKind {
    Regex,
    Keyword,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DedupRule {
    pub pattern: String,
    pub kind: RuleKind,
}

impl DedupRule {
    pub fn regex(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            kind: RuleKind::Regex,
        }
    }

    pub fn keyword(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            kind: RuleKind::Keyword,
        }
    }

    /// Classifies a bare pattern string: anything carrying a capture group is
    /// treated as a regular expression, everything else as a keyword.
    pub fn infer(pattern: impl Into<String>) -> Self {
        let pattern = pattern.into();
        let trimmed = pattern.trim();
        if trimmed.contains('(') && trimmed.contains(')') {
            Self::regex(trimmed)
        } else {
            Self::keyword(trimmed)
        }
    }
}

pub fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| OffsetDateTime::now_utc().unix_timestamp().to_string())
}
