//! Domain model and collaborator seams shared by every relay crate.

pub mod adapters;
pub mod error;
pub mod housekeeping;
pub mod identifiers;
pub mod model;

pub use adapters::{
    AttachmentSource, BlobStore, CreatedTicket, MailAttachment, MailSender, MonitorSettings,
    NewTicketRequest, OutboundMail, SettingsSource, StaticSettings, TicketCreator,
    TicketHistorySource,
};
pub use error::CoreError;
pub use housekeeping::{FilteredHistory, HousekeepingFilter, DEFAULT_HOUSEKEEPING_MARKER};
pub use identifiers::{Environment, StorageIndex, TicketId, DEFAULT_ENVIRONMENT};
pub use model::{
    now_rfc3339, Actor, AttachmentRef, DedupRule, EventPayload, HistoryEvent, HistoryItem,
    HistoryKind, ProcessedIdentifier, RuleKind, TicketSnapshot,
};
