use relay_core::{AttachmentRef, AttachmentSource, CoreError, Environment, MailAttachment, TicketId};
use sha2::{Digest, Sha256};

const OCTET_STREAM: &str = "application/octet-stream";

pub fn mime_type_for(name: &str) -> &'static str {
    let extension = name
        .rsplit_once('.')
        .map(|(_, extension)| extension.to_ascii_lowercase())
        .unwrap_or_default();
    match extension.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "pdf" => "application/pdf",
        "txt" | "log" => "text/plain",
        "csv" => "text/csv",
        _ => OCTET_STREAM,
    }
}

pub fn is_inline_image(mime_type: &str) -> bool {
    mime_type.starts_with("image/")
}

/// Stable content id for an inline attachment, derived from the source's
/// attachment id (when known) and the file name.
pub fn content_id(attachment: &AttachmentRef) -> String {
    let seed = match attachment.id.as_deref().filter(|id| !id.is_empty()) {
        Some(id) => format!("{id}_{}", attachment.name),
        None => attachment.name.clone(),
    };
    let digest = hex::encode(Sha256::digest(seed.as_bytes()));
    format!("att_{}", &digest[..8])
}

/// Downloads one attachment. `Ok(None)` means the source had nothing under
/// that name.
pub async fn resolve_attachment(
    source: &dyn AttachmentSource,
    ticket_id: &TicketId,
    environment: &Environment,
    attachment: &AttachmentRef,
) -> Result<Option<MailAttachment>, CoreError> {
    let Some(content) = source.fetch(ticket_id, environment, &attachment.name).await? else {
        return Ok(None);
    };
    if content.is_empty() {
        return Ok(None);
    }

    let mime_type = mime_type_for(&attachment.name);
    Ok(Some(MailAttachment {
        name: attachment.name.clone(),
        mime_type: mime_type.to_owned(),
        content,
        content_id: is_inline_image(mime_type).then(|| content_id(attachment)),
    }))
}
