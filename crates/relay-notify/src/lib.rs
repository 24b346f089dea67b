//! Notification rendering and dispatch for newly observed history items.

pub mod attachments;
pub mod dispatch;
pub mod flow;
pub mod render;

pub use attachments::{content_id, is_inline_image, mime_type_for, resolve_attachment};
pub use dispatch::{DispatchOutcome, NotificationDispatcher, NotifySettings, DEFAULT_MAX_ITEMS};
pub use flow::{FlowDecision, FlowRule, FlowRules, ItemView};
pub use render::{format_timestamp, render_notification, NotificationContent, RenderedItem};
