use std::fmt;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::CoreError;
use crate::identifiers::{Environment, TicketId};
use crate::model::HistoryEvent;

/// Source of a ticket's complete audit trail. Every fetch returns the full
/// list, newest first; there is no incremental cursor.
#[async_trait]
pub trait TicketHistorySource: Send + Sync {
    async fn fetch(
        &self,
        ticket_id: &TicketId,
        environment: &Environment,
    ) -> Result<Vec<HistoryEvent>, CoreError>;
}

/// Named-blob persistence. Writes replace the whole blob.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn read(&self, name: &str) -> Result<Option<String>, CoreError>;
    async fn write(&self, name: &str, text: &str) -> Result<(), CoreError>;
    async fn list(&self, prefix: &str) -> Result<Vec<String>, CoreError>;
}

#[derive(Clone, PartialEq, Eq)]
pub struct MailAttachment {
    pub name: String,
    pub mime_type: String,
    pub content: Vec<u8>,
    /// Set for attachments rendered inline in the HTML body.
    pub content_id: Option<String>,
}

impl fmt::Debug for MailAttachment {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("MailAttachment")
            .field("name", &self.name)
            .field("mime_type", &self.mime_type)
            .field("content", &format_args!("<{} bytes>", self.content.len()))
            .field("content_id", &self.content_id)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMail {
    pub recipient: String,
    pub subject: String,
    pub text: String,
    pub html: String,
    pub attachments: Vec<MailAttachment>,
}

#[async_trait]
pub trait MailSender: Send + Sync {
    async fn send(&self, mail: OutboundMail) -> Result<(), CoreError>;
}

#[async_trait]
pub trait AttachmentSource: Send + Sync {
    async fn fetch(
        &self,
        ticket_id: &TicketId,
        environment: &Environment,
        name: &str,
    ) -> Result<Option<Vec<u8>>, CoreError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTicketRequest {
    pub sender_email: String,
    pub subject: String,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedTicket {
    pub ticket_id: TicketId,
    pub environment: Environment,
}

/// Creates a ticket in the external ticketing system.
#[async_trait]
pub trait TicketCreator: Send + Sync {
    async fn create_ticket(&self, request: NewTicketRequest) -> Result<CreatedTicket, CoreError>;
}

/// Settings the monitor re-reads at the start of every cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct MonitorSettings {
    pub enabled: bool,
    pub interval: Duration,
    pub excluded_senders: Vec<String>,
}

impl MonitorSettings {
    pub fn is_sender_excluded(&self, sender: &str) -> bool {
        let sender = sender.trim();
        self.excluded_senders
            .iter()
            .any(|excluded| excluded.trim().eq_ignore_ascii_case(sender))
    }
}

pub trait SettingsSource: Send + Sync {
    fn snapshot(&self) -> Result<MonitorSettings, CoreError>;
}

/// Fixed settings, mostly useful in tests and one-shot runs.
#[derive(Debug, Clone)]
pub struct StaticSettings(pub MonitorSettings);

impl SettingsSource for StaticSettings {
    fn snapshot(&self) -> Result<MonitorSettings, CoreError> {
        Ok(self.0.clone())
    }
}
