use std::sync::Arc;

use relay_core::{
    AttachmentSource, CoreError, Environment, HistoryKind, MailAttachment, MailSender,
    OutboundMail, StorageIndex, TicketId,
};
use relay_history::{DeliveryTracker, PendingItem};
use tracing::{error, info, warn};

use crate::attachments::resolve_attachment;
use crate::flow::{FlowDecision, FlowRules};
use crate::render::{render_notification, RenderedItem};

pub const DEFAULT_MAX_ITEMS: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotifySettings {
    pub max_items: usize,
    /// Link to the ticket, with `{ticket_id}` substituted.
    pub ticket_link_template: Option<String>,
}

impl Default for NotifySettings {
    fn default() -> Self {
        Self {
            max_items: DEFAULT_MAX_ITEMS,
            ticket_link_template: None,
        }
    }
}

impl NotifySettings {
    pub fn link_for(&self, ticket_id: &TicketId) -> Option<String> {
        self.ticket_link_template
            .as_deref()
            .map(str::trim)
            .filter(|template| !template.is_empty())
            .map(|template| template.replace("{ticket_id}", ticket_id.as_str()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    NothingPending,
    /// The ticket has no known recipient; nothing was sent or flagged.
    NoRecipient { pending: usize },
    /// Every pending item was hidden by a flow rule and settled without mail.
    Settled { suppressed: usize },
    /// No item could be rendered; all of them stay pending.
    Deferred { dropped: Vec<StorageIndex> },
    SendFailed { error: CoreError },
    Sent {
        delivered: Vec<StorageIndex>,
        dropped: Vec<StorageIndex>,
    },
}

/// Composes one notification per ticket and batch, sends it, and only then
/// settles the delivery flags of what was sent.
pub struct NotificationDispatcher {
    mail: Arc<dyn MailSender>,
    attachments: Arc<dyn AttachmentSource>,
    tracker: DeliveryTracker,
    flow: FlowRules,
    settings: NotifySettings,
}

impl NotificationDispatcher {
    pub fn new(
        mail: Arc<dyn MailSender>,
        attachments: Arc<dyn AttachmentSource>,
        tracker: DeliveryTracker,
        flow: FlowRules,
        settings: NotifySettings,
    ) -> Self {
        Self {
            mail,
            attachments,
            tracker,
            flow,
            settings,
        }
    }

    /// `items` must be newest first, as returned by
    /// [`relay_history::compute_undelivered`].
    pub async fn dispatch(
        &self,
        ticket_id: &TicketId,
        environment: &Environment,
        items: &[PendingItem],
        recipient: Option<&str>,
    ) -> Result<DispatchOutcome, CoreError> {
        if items.is_empty() {
            return Ok(DispatchOutcome::NothingPending);
        }
        let Some(recipient) = recipient.map(str::trim).filter(|r| !r.is_empty()) else {
            warn!(ticket_id = %ticket_id, pending = items.len(), "no recipient known; notification not sent");
            return Ok(DispatchOutcome::NoRecipient {
                pending: items.len(),
            });
        };

        let mut suppressed = Vec::new();
        let mut visible = Vec::new();
        for item in items {
            match self.flow.apply(&item.event) {
                FlowDecision::Suppressed => suppressed.push(item.storage_index),
                FlowDecision::Show(view) => visible.push((item, view)),
            }
        }

        if visible.is_empty() {
            self.tracker.mark_delivered(ticket_id, &suppressed).await?;
            return Ok(DispatchOutcome::Settled {
                suppressed: suppressed.len(),
            });
        }

        let max_items = self.settings.max_items.max(1);
        let overflow_items: Vec<&PendingItem> = visible
            .iter()
            .skip(max_items)
            .map(|(item, _)| *item)
            .collect();
        visible.truncate(max_items);

        let mut rendered = Vec::with_capacity(visible.len());
        let mut attachments: Vec<MailAttachment> = Vec::new();
        let mut included = Vec::with_capacity(visible.len());
        let mut dropped = Vec::new();
        for (item, view) in visible {
            let mut content_id = None;
            if item.event.kind == HistoryKind::Attachment {
                match self.fetch_attachment(ticket_id, environment, item).await {
                    Some(attachment) => {
                        content_id.clone_from(&attachment.content_id);
                        attachments.push(attachment);
                    }
                    None => {
                        dropped.push(item.storage_index);
                        continue;
                    }
                }
            }
            included.push(item.storage_index);
            rendered.push(RenderedItem { view, content_id });
        }

        if rendered.is_empty() {
            warn!(ticket_id = %ticket_id, dropped = dropped.len(), "no pending item could be rendered; deferring");
            return Ok(DispatchOutcome::Deferred { dropped });
        }

        // Overflow items are only counted in the body, but their files still
        // travel with this mail. An overflow file that cannot be fetched stays
        // pending for a later batch.
        let mut overflow = Vec::with_capacity(overflow_items.len());
        for item in overflow_items {
            if item.event.kind == HistoryKind::Attachment {
                match self.fetch_attachment(ticket_id, environment, item).await {
                    Some(mut attachment) => {
                        attachment.content_id = None;
                        attachments.push(attachment);
                    }
                    None => {
                        dropped.push(item.storage_index);
                        continue;
                    }
                }
            }
            overflow.push(item.storage_index);
        }

        let link = self.settings.link_for(ticket_id);
        let content = render_notification(ticket_id, &rendered, overflow.len(), link.as_deref());
        let mail = OutboundMail {
            recipient: recipient.to_owned(),
            subject: content.subject,
            text: content.text,
            html: content.html,
            attachments,
        };

        if let Err(send_error) = self.mail.send(mail).await {
            warn!(ticket_id = %ticket_id, error = %send_error, "notification send failed; items stay pending");
            return Ok(DispatchOutcome::SendFailed { error: send_error });
        }

        let mut delivered = included;
        delivered.extend(overflow);
        delivered.extend(suppressed);
        delivered.sort();
        if let Err(persist_error) = self.tracker.mark_delivered(ticket_id, &delivered).await {
            error!(
                ticket_id = %ticket_id,
                error = %persist_error,
                "notification sent but delivery flags were not saved; items may be sent again"
            );
            return Err(persist_error);
        }

        info!(
            ticket_id = %ticket_id,
            recipient,
            delivered = delivered.len(),
            dropped = dropped.len(),
            "notification sent"
        );
        Ok(DispatchOutcome::Sent { delivered, dropped })
    }

    async fn fetch_attachment(
        &self,
        ticket_id: &TicketId,
        environment: &Environment,
        item: &PendingItem,
    ) -> Option<MailAttachment> {
        let Some(reference) = item.event.payload.attachment.as_ref() else {
            warn!(ticket_id = %ticket_id, storage_index = %item.storage_index, "attachment item carries no file reference");
            return None;
        };
        match resolve_attachment(self.attachments.as_ref(), ticket_id, environment, reference).await {
            Ok(Some(attachment)) => Some(attachment),
            Ok(None) => {
                warn!(ticket_id = %ticket_id, name = %reference.name, "attachment not found at source");
                None
            }
            Err(fetch_error) => {
                warn!(ticket_id = %ticket_id, name = %reference.name, error = %fetch_error, "attachment download failed");
                None
            }
        }
    }
}
