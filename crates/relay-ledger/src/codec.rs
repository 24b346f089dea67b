//! On-disk documents for the ledgers. The layout here is private to this
//! crate; everything outside sees `relay_core` model types only.

use std::collections::BTreeMap;

use relay_core::{
    Actor, CoreError, Environment, EventPayload, HistoryItem, HistoryKind, StorageIndex, TicketId,
    TicketSnapshot,
};
use serde::{Deserialize, Serialize};

pub(crate) const DOCUMENT_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct IdentifierLedgerDocument {
    pub version: u32,
    #[serde(default)]
    pub identifiers: BTreeMap<String, IdentifierEntry>,
}

impl Default for IdentifierLedgerDocument {
    fn default() -> Self {
        Self {
            version: DOCUMENT_VERSION,
            identifiers: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct IdentifierEntry {
    pub first_seen_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlated_ticket_id: Option<TicketId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct SnapshotDocument {
    pub version: u32,
    pub ticket_id: TicketId,
    pub environment: Environment,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_email: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub total_items: usize,
    #[serde(default)]
    pub items: BTreeMap<u32, StoredItem>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct StoredItem {
    pub kind: HistoryKind,
    pub timestamp: String,
    pub actor: Actor,
    #[serde(default)]
    pub payload: EventPayload,
    pub delivered: String,
}

pub(crate) fn encode_snapshot(snapshot: &TicketSnapshot) -> SnapshotDocument {
    SnapshotDocument {
        version: DOCUMENT_VERSION,
        ticket_id: snapshot.ticket_id.clone(),
        environment: snapshot.environment.clone(),
        sender_email: snapshot.sender_email.clone(),
        created_at: snapshot.created_at.clone(),
        updated_at: snapshot.updated_at.clone(),
        total_items: snapshot.items.len(),
        items: snapshot
            .items
            .iter()
            .map(|item| {
                (
                    item.storage_index.get(),
                    StoredItem {
                        kind: item.kind,
                        timestamp: item.timestamp.clone(),
                        actor: item.actor.clone(),
                        payload: item.payload.clone(),
                        delivered: encode_flag(item.delivered).to_owned(),
                    },
                )
            })
            .collect(),
    }
}

pub(crate) fn decode_snapshot(document: SnapshotDocument) -> Result<TicketSnapshot, CoreError> {
    let ticket_id = document.ticket_id;
    let mut items = Vec::with_capacity(document.items.len());
    // BTreeMap iterates in key order, so contiguity is a simple running check.
    for (expected, (position, stored)) in (1_u32..).zip(document.items) {
        if position != expected {
            return Err(CoreError::Persistence(format!(
                "snapshot for ticket {ticket_id} has non-contiguous storage indices: expected {expected}, found {position}"
            )));
        }
        let storage_index = StorageIndex::new(position).ok_or_else(|| {
            CoreError::Persistence(format!(
                "snapshot for ticket {ticket_id} contains storage index 0"
            ))
        })?;
        items.push(HistoryItem {
            storage_index,
            kind: stored.kind,
            timestamp: stored.timestamp,
            actor: stored.actor,
            payload: stored.payload,
            delivered: decode_flag(&stored.delivered).ok_or_else(|| {
                CoreError::Persistence(format!(
                    "snapshot for ticket {ticket_id} has unreadable delivered flag '{}' at index {position}",
                    stored.delivered
                ))
            })?,
        });
    }

    Ok(TicketSnapshot {
        ticket_id,
        environment: document.environment,
        sender_email: document.sender_email,
        created_at: document.created_at,
        updated_at: document.updated_at,
        items,
    })
}

fn encode_flag(value: bool) -> &'static str {
    if value {
        "true"
    } else {
        "false"
    }
}

fn decode_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Some(true),
        "false" | "0" | "no" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use relay_core::HistoryEvent;

    use super::*;

    fn snapshot_with(count: u32) -> TicketSnapshot {
        let mut snapshot = TicketSnapshot::new(TicketId::new("42"), Environment::default(), None);
        for position in 1..=count {
            let index = StorageIndex::new(position).expect("index");
            let mut item = HistoryItem::new(
                index,
                &HistoryEvent::comment("2026-01-01T00:00:00Z", "ana", format!("c{position}")),
            );
            item.delivered = position % 2 == 0;
            snapshot.items.push(item);
        }
        snapshot
    }

    #[test]
    fn decode_restores_items_and_flags() {
        let snapshot = snapshot_with(3);
        let decoded = decode_snapshot(encode_snapshot(&snapshot)).expect("decode");

        assert_eq!(decoded, snapshot);
    }

    #[test]
    fn decode_rejects_gaps_in_storage_indices() {
        let mut document = encode_snapshot(&snapshot_with(3));
        document.items.remove(&2);

        let error = decode_snapshot(document).expect_err("gap should fail");
        assert!(error.to_string().contains("non-contiguous"));
    }

    #[test]
    fn decode_rejects_unknown_flag_values() {
        let mut document = encode_snapshot(&snapshot_with(1));
        if let Some(item) = document.items.get_mut(&1) {
            item.delivered = "maybe".to_owned();
        }

        assert!(decode_snapshot(document).is_err());
    }

    #[test]
    fn flags_are_stored_as_text() {
        let document = encode_snapshot(&snapshot_with(2));
        let rendered = serde_json::to_string(&document).expect("serialize");

        assert!(rendered.contains("\"delivered\":\"true\""));
        assert!(rendered.contains("\"delivered\":\"false\""));
    }
}
