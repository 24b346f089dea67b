//! Per-state and per-kind presentation rules for history items.

use std::collections::HashMap;

use relay_core::{HistoryEvent, HistoryKind};

const AUTOMATIC_TASK_PREFIX: &str = "Automatic Task:";
const DEFAULT_ACTOR: &str = "System";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlowRule {
    /// Never show matching items. They are still settled as delivered.
    pub skip: bool,
    /// Replaces the headline. `{assignee}` and `{comment}` are substituted.
    pub step_description: Option<String>,
    pub show_comment: bool,
    pub show_assignees: bool,
}

impl FlowRule {
    fn decides(&self) -> bool {
        self.skip || self.step_description.is_some()
    }
}

/// What a reader sees for one history item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemView {
    pub kind: HistoryKind,
    pub headline: String,
    pub comment: Option<String>,
    pub assignee: Option<String>,
    pub actor: String,
    pub timestamp: String,
    pub attachment_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowDecision {
    Suppressed,
    Show(ItemView),
}

#[derive(Debug, Clone, Default)]
pub struct FlowRules {
    by_state: HashMap<String, FlowRule>,
    by_kind: HashMap<HistoryKind, FlowRule>,
}

impl FlowRules {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_state_rule(&mut self, state_name: impl Into<String>, rule: FlowRule) {
        let state_name = state_name.into().trim().to_owned();
        if !state_name.is_empty() {
            self.by_state.insert(state_name, rule);
        }
    }

    pub fn insert_kind_rule(&mut self, kind: HistoryKind, rule: FlowRule) {
        self.by_kind.insert(kind, rule);
    }

    pub fn len(&self) -> usize {
        self.by_state.len() + self.by_kind.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// State rules are consulted first, but only win when they skip or
    /// describe the step; otherwise the kind rule (if any) applies.
    pub fn apply(&self, event: &HistoryEvent) -> FlowDecision {
        let state_rule = event
            .payload
            .state_name
            .as_deref()
            .map(str::trim)
            .and_then(|state| self.by_state.get(state))
            .filter(|rule| rule.decides());
        let rule = state_rule.or_else(|| self.by_kind.get(&event.kind));

        match rule {
            Some(rule) if rule.skip => FlowDecision::Suppressed,
            Some(rule) => FlowDecision::Show(view_with_rule(event, rule)),
            None => FlowDecision::Show(default_view(event)),
        }
    }
}

fn first_assignee(event: &HistoryEvent) -> Option<String> {
    event
        .payload
        .assignees
        .iter()
        .map(|name| name.trim())
        .find(|name| !name.is_empty())
        .map(str::to_owned)
}

fn base_view(event: &HistoryEvent, headline: String) -> ItemView {
    let actor = event.actor.name.trim();
    ItemView {
        kind: event.kind,
        headline,
        comment: None,
        assignee: None,
        actor: if actor.is_empty() {
            DEFAULT_ACTOR.to_owned()
        } else {
            actor.to_owned()
        },
        timestamp: event.timestamp.clone(),
        attachment_name: attachment_name(event),
    }
}

fn attachment_name(event: &HistoryEvent) -> Option<String> {
    if event.kind != HistoryKind::Attachment {
        return None;
    }
    event
        .payload
        .attachment
        .as_ref()
        .map(|attachment| attachment.name.trim())
        .filter(|name| !name.is_empty())
        .map(str::to_owned)
}

fn default_headline(event: &HistoryEvent) -> String {
    match event.kind {
        HistoryKind::Transition => {
            let from = non_blank(event.payload.state_name.as_deref());
            let to = non_blank(event.payload.target_state.as_deref());
            match (from, to) {
                (Some(from), Some(to)) => format!("{from} → {to}"),
                (Some(state), None) => state.to_owned(),
                _ => event
                    .comment_text()
                    .map_or_else(|| "Transition".to_owned(), str::to_owned),
            }
        }
        HistoryKind::Comment => event
            .comment_text()
            .map_or_else(|| "Comment".to_owned(), str::to_owned),
        HistoryKind::Attachment => format!(
            "Attachment: {}",
            attachment_name(event).unwrap_or_else(|| "file".to_owned())
        ),
    }
}

fn default_view(event: &HistoryEvent) -> ItemView {
    let headline = default_headline(event);
    let mut view = base_view(event, headline);
    if event.kind == HistoryKind::Transition {
        view.comment = event
            .comment_text()
            .filter(|text| !text.starts_with(AUTOMATIC_TASK_PREFIX))
            .filter(|text| *text != view.headline)
            .map(str::to_owned);
    }
    view
}

fn view_with_rule(event: &HistoryEvent, rule: &FlowRule) -> ItemView {
    let assignee = first_assignee(event);
    let comment = event.comment_text().map(str::to_owned);

    let mut view = match rule.step_description.as_deref() {
        Some(template) => {
            let headline = template
                .replace("{assignee}", assignee.as_deref().unwrap_or_default())
                .replace("{comment}", comment.as_deref().unwrap_or_default())
                .trim()
                .to_owned();
            base_view(event, headline)
        }
        None => default_view(event),
    };

    if rule.show_comment {
        view.comment = comment.filter(|text| *text != view.headline);
    }
    if rule.show_assignees {
        view.assignee = assignee;
    }
    view
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}
