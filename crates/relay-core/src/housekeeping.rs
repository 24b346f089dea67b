//! Housekeeping-marker filtering.
//!
//! The source system appends a "ticket created" system note to every ticket.
//! It must never receive a storage index, never count towards the history
//! length and never be delivered. Indexing code only accepts
//! [`FilteredHistory`], which can only be built through
//! [`HousekeepingFilter::apply`], so the filter runs exactly once per fetch
//! and identically at every call site.

use crate::model::{HistoryEvent, HistoryKind};

pub const DEFAULT_HOUSEKEEPING_MARKER: &str = "Registro criado";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HousekeepingFilter {
    marker: String,
}

impl Default for HousekeepingFilter {
    fn default() -> Self {
        Self::new(DEFAULT_HOUSEKEEPING_MARKER)
    }
}

impl HousekeepingFilter {
    pub fn new(marker: impl Into<String>) -> Self {
        Self {
            marker: marker.into().trim().to_owned(),
        }
    }

    pub fn marker(&self) -> &str {
        &self.marker
    }

    pub fn is_marker(&self, event: &HistoryEvent) -> bool {
        event.kind == HistoryKind::Comment
            && !self.marker.is_empty()
            && event
                .payload
                .comment
                .as_deref()
                .is_some_and(|text| text.trim() == self.marker)
    }

    /// Drops every housekeeping marker from a freshly fetched newest-first
    /// list, preserving the relative order of the remaining events.
    pub fn apply(&self, fetched_newest_first: Vec<HistoryEvent>) -> FilteredHistory {
        FilteredHistory {
            newest_first: fetched_newest_first
                .into_iter()
                .filter(|event| !self.is_marker(event))
                .collect(),
        }
    }
}

/// A newest-first history list with housekeeping markers removed.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FilteredHistory {
    newest_first: Vec<HistoryEvent>,
}

impl FilteredHistory {
    pub fn len(&self) -> usize {
        self.newest_first.len()
    }

    pub fn is_empty(&self) -> bool {
        self.newest_first.is_empty()
    }

    pub fn newest_first(&self) -> &[HistoryEvent] {
        &self.newest_first
    }

    pub fn oldest_first(&self) -> impl Iterator<Item = &HistoryEvent> {
        self.newest_first.iter().rev()
    }
}
