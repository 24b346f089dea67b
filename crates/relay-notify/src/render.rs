use std::fmt::Write as _;

use relay_core::TicketId;
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime};

use crate::flow::ItemView;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedItem {
    pub view: ItemView,
    /// Set when the item's attachment is embedded in the HTML body.
    pub content_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationContent {
    pub subject: String,
    pub text: String,
    pub html: String,
}

pub fn subject_for(ticket_id: &TicketId) -> String {
    format!("Update on ticket #{ticket_id}")
}

/// `DD/MM/YYYY HH:MM` for parseable timestamps, the raw text otherwise.
pub fn format_timestamp(raw: &str) -> String {
    let display = format_description!("[day]/[month]/[year] [hour]:[minute]");
    let raw = raw.trim();
    if let Ok(parsed) = OffsetDateTime::parse(raw, &Rfc3339) {
        if let Ok(formatted) = parsed.format(display) {
            return formatted;
        }
    }
    let local = format_description!("[year]-[month]-[day]T[hour]:[minute]:[second]");
    if let Ok(parsed) = PrimitiveDateTime::parse(raw, local) {
        if let Ok(formatted) = parsed.format(display) {
            return formatted;
        }
    }
    raw.to_owned()
}

pub fn escape_html(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(ch),
        }
    }
    escaped
}

fn earlier_summary(earlier: usize) -> String {
    format!("… and {earlier} earlier update(s)")
}

/// Renders `items` (newest first) into text and HTML bodies. `earlier`
/// counts pending items left out of the listing.
pub fn render_notification(
    ticket_id: &TicketId,
    items: &[RenderedItem],
    earlier: usize,
    link: Option<&str>,
) -> NotificationContent {
    NotificationContent {
        subject: subject_for(ticket_id),
        text: render_text(ticket_id, items, earlier, link),
        html: render_html(ticket_id, items, earlier, link),
    }
}

fn render_text(
    ticket_id: &TicketId,
    items: &[RenderedItem],
    earlier: usize,
    link: Option<&str>,
) -> String {
    let mut text = format!("New update(s) on ticket #{ticket_id}\n\n");
    for item in items {
        let view = &item.view;
        let _ = writeln!(
            text,
            "- {} {}: {}",
            format_timestamp(&view.timestamp),
            view.actor,
            view.headline
        );
        if let Some(assignee) = &view.assignee {
            let _ = writeln!(text, "  Assignee: {assignee}");
        }
        if let Some(comment) = &view.comment {
            let _ = writeln!(text, "  Comment: {comment}");
        }
    }
    if earlier > 0 {
        let _ = writeln!(text, "{}", earlier_summary(earlier));
    }
    if let Some(link) = link {
        let _ = write!(text, "\nLink: {link}\n");
    }
    text
}

fn render_html(
    ticket_id: &TicketId,
    items: &[RenderedItem],
    earlier: usize,
    link: Option<&str>,
) -> String {
    let mut html = String::from("<html><body>");
    let _ = write!(
        html,
        "<h2>New update(s) on ticket #{}</h2><ul>",
        escape_html(ticket_id.as_str())
    );
    for item in items {
        let view = &item.view;
        let _ = write!(
            html,
            "<li><p><strong>{}</strong></p><p><small>{} · {}</small></p>",
            escape_html(&view.headline),
            escape_html(&format_timestamp(&view.timestamp)),
            escape_html(&view.actor)
        );
        if let Some(assignee) = &view.assignee {
            let _ = write!(html, "<p>Assignee: {}</p>", escape_html(assignee));
        }
        if let Some(comment) = &view.comment {
            let _ = write!(html, "<blockquote>{}</blockquote>", escape_html(comment));
        }
        if let Some(content_id) = &item.content_id {
            let alt = view.attachment_name.as_deref().unwrap_or("attachment");
            let _ = write!(
                html,
                "<p><img src=\"cid:{}\" alt=\"{}\" style=\"max-width:600px\"/></p>",
                escape_html(content_id),
                escape_html(alt)
            );
        }
        html.push_str("</li>");
    }
    html.push_str("</ul>");
    if earlier > 0 {
        let _ = write!(html, "<p><em>{}</em></p>", escape_html(&earlier_summary(earlier)));
    }
    if let Some(link) = link {
        let _ = write!(
            html,
            "<p><a href=\"{}\">Open ticket #{}</a></p>",
            escape_html(link),
            escape_html(ticket_id.as_str())
        );
    }
    html.push_str("</body></html>");
    html
}

#[cfg(test)]
mod tests {
    use relay_core::HistoryKind;

    use super::*;

    fn item(headline: &str, comment: Option<&str>) -> RenderedItem {
        RenderedItem {
            view: ItemView {
                kind: HistoryKind::Comment,
                headline: headline.to_owned(),
                comment: comment.map(str::to_owned),
                assignee: None,
                actor: "ana".to_owned(),
                timestamp: "2026-03-01T10:05:00Z".to_owned(),
                attachment_name: None,
            },
            content_id: None,
        }
    }

    #[test]
    fn timestamps_are_shown_day_first() {
        assert_eq!(format_timestamp("2026-03-01T10:05:00Z"), "01/03/2026 10:05");
        assert_eq!(format_timestamp("2026-03-01T10:05:00"), "01/03/2026 10:05");
        assert_eq!(format_timestamp("yesterday"), "yesterday");
    }

    #[test]
    fn text_body_lists_items_summary_and_link() {
        let content = render_notification(
            &TicketId::new("812"),
            &[item("Open → Triage", Some("checking"))],
            3,
            Some("https://tickets.example.com/812"),
        );

        assert_eq!(content.subject, "Update on ticket #812");
        assert!(content
            .text
            .contains("- 01/03/2026 10:05 ana: Open → Triage\n  Comment: checking"));
        assert!(content.text.contains("… and 3 earlier update(s)"));
        assert!(content.text.contains("Link: https://tickets.example.com/812"));
    }

    #[test]
    fn html_body_escapes_user_text_and_embeds_images() {
        let mut with_image = item("Attachment: a.png", None);
        with_image.content_id = Some("att_0011aabb".to_owned());
        with_image.view.attachment_name = Some("a.png".to_owned());

        let content = render_notification(
            &TicketId::new("812"),
            &[item("<script>", None), with_image],
            0,
            None,
        );

        assert!(content.html.contains("&lt;script&gt;"));
        assert!(!content.html.contains("<script>"));
        assert!(content.html.contains("src=\"cid:att_0011aabb\""));
        assert!(!content.html.contains("earlier update"));
    }
}
