//! Mail delivery into a spool directory. Each notification becomes one JSON
//! file that an external relay picks up.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use relay_core::{CoreError, MailSender, OutboundMail};
use serde::Serialize;
use tracing::info;

#[derive(Debug, Serialize)]
struct SpooledMail<'a> {
    recipient: &'a str,
    subject: &'a str,
    text: &'a str,
    html: &'a str,
    attachments: Vec<SpooledAttachment<'a>>,
}

#[derive(Debug, Serialize)]
struct SpooledAttachment<'a> {
    name: &'a str,
    mime_type: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    content_id: Option<&'a str>,
    content_hex: String,
}

#[derive(Debug)]
pub struct OutboxMailSender {
    directory: PathBuf,
    sequence: AtomicU64,
}

impl OutboxMailSender {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            sequence: AtomicU64::new(0),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn next_file_name(&self, recipient: &str) -> String {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_millis())
            .unwrap_or_default();
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        let recipient: String = recipient
            .chars()
            .map(|ch| if ch.is_ascii_alphanumeric() { ch } else { '_' })
            .collect();
        format!("{millis}-{sequence:04}-{recipient}.json")
    }
}

#[async_trait]
impl MailSender for OutboxMailSender {
    async fn send(&self, mail: OutboundMail) -> Result<(), CoreError> {
        let spooled = SpooledMail {
            recipient: &mail.recipient,
            subject: &mail.subject,
            text: &mail.text,
            html: &mail.html,
            attachments: mail
                .attachments
                .iter()
                .map(|attachment| SpooledAttachment {
                    name: &attachment.name,
                    mime_type: &attachment.mime_type,
                    content_id: attachment.content_id.as_deref(),
                    content_hex: hex::encode(&attachment.content),
                })
                .collect(),
        };
        let json = serde_json::to_string_pretty(&spooled).map_err(|error| {
            CoreError::DependencyUnavailable(format!("failed to encode outbound mail: {error}"))
        })?;

        tokio::fs::create_dir_all(&self.directory)
            .await
            .map_err(|error| {
                CoreError::DependencyUnavailable(format!(
                    "failed to create outbox {}: {error}",
                    self.directory.display()
                ))
            })?;

        // Written under a temporary name first so a reader never sees half a file.
        let file_name = self.next_file_name(&mail.recipient);
        let final_path = self.directory.join(&file_name);
        let temp_path = self.directory.join(format!(".{file_name}.tmp"));
        tokio::fs::write(&temp_path, json).await.map_err(|error| {
            CoreError::DependencyUnavailable(format!(
                "failed to write {}: {error}",
                temp_path.display()
            ))
        })?;
        tokio::fs::rename(&temp_path, &final_path)
            .await
            .map_err(|error| {
                CoreError::DependencyUnavailable(format!(
                    "failed to move {} into place: {error}",
                    final_path.display()
                ))
            })?;

        info!(recipient = %mail.recipient, path = %final_path.display(), "notification spooled");
        Ok(())
    }
}
