//! Audio uploads from the HTTP surface into a group conversation.
//!
//! The multipart body is staged in a temporary file that removes itself when
//! dropped, so no path through here leaves a staged upload behind.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::extract::Multipart;
use serde::Serialize;
use tempfile::NamedTempFile;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backend::BackendSession;
use crate::config::{AudioDelivery, RelayConfig};
use crate::error::RelayError;
use crate::protocol::MessageKind;

const DEFAULT_EXTENSION: &str = ".webm";
/// URL prefix persisted audio is served under.
pub const AUDIO_ROUTE: &str = "/audios";

/// Response body for a delivered upload.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadReceipt {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio_url: Option<String>,
}

/// A received upload still sitting in its staging file.
pub struct StagedAudio {
    file: NamedTempFile,
    pub len: u64,
    pub extension: String,
    pub sender: String,
    pub group_name: String,
}

impl StagedAudio {
    pub fn path(&self) -> &Path {
        self.file.path()
    }
}

pub struct MediaUploadBridge {
    session: Arc<BackendSession>,
    audio_dir: PathBuf,
    staging_dir: PathBuf,
    max_bytes: usize,
    delivery: AudioDelivery,
}

impl MediaUploadBridge {
    pub fn new(session: Arc<BackendSession>, config: &RelayConfig) -> Self {
        Self {
            session,
            audio_dir: config.audio_dir.clone(),
            staging_dir: config.upload_tmp_dir(),
            max_bytes: config.max_upload_bytes,
            delivery: config.audio_delivery,
        }
    }

    /// Stage the `audio` part and collect `sender` and `groupName`.
    pub async fn stage(&self, mut multipart: Multipart) -> Result<StagedAudio, RelayError> {
        tokio::fs::create_dir_all(&self.staging_dir).await?;

        let mut staged: Option<(NamedTempFile, u64, String)> = None;
        let mut sender = None;
        let mut group_name = None;

        while let Some(mut field) = multipart
            .next_field()
            .await
            .map_err(|e| RelayError::UploadRejected(e.to_string()))?
        {
            let name = field.name().unwrap_or_default().to_string();
            match name.as_str() {
                "audio" => {
                    let extension = field
                        .file_name()
                        .and_then(extension_of)
                        .unwrap_or_else(|| DEFAULT_EXTENSION.to_string());
                    let file = NamedTempFile::new_in(&self.staging_dir)?;
                    let mut writer = tokio::fs::File::from_std(file.reopen()?);
                    let mut len: u64 = 0;
                    while let Some(chunk) = field
                        .chunk()
                        .await
                        .map_err(|e| RelayError::UploadRejected(e.to_string()))?
                    {
                        len += chunk.len() as u64;
                        if len > self.max_bytes as u64 {
                            return Err(RelayError::UploadRejected(format!(
                                "audio exceeds {} bytes",
                                self.max_bytes
                            )));
                        }
                        writer.write_all(&chunk).await?;
                    }
                    writer.flush().await?;
                    staged = Some((file, len, extension));
                }
                "sender" => sender = Some(read_text(field).await?),
                "groupName" => group_name = Some(read_text(field).await?),
                other => debug!(field = other, "ignoring upload field"),
            }
        }

        let (file, len, extension) = match staged {
            Some(staged) if staged.1 > 0 => staged,
            _ => return Err(RelayError::NoFile),
        };
        let sender = required(sender, "sender")?;
        let group_name = required(group_name, "groupName")?;

        Ok(StagedAudio {
            file,
            len,
            extension,
            sender,
            group_name,
        })
    }

    /// Hand a staged upload to the chat service using the configured mode.
    pub async fn deliver(&self, staged: StagedAudio) -> Result<UploadReceipt, RelayError> {
        match self.delivery {
            AudioDelivery::Reference => self.deliver_reference(staged).await,
            AudioDelivery::Forward => self.deliver_forward(staged).await,
        }
    }

    async fn deliver_reference(&self, staged: StagedAudio) -> Result<UploadReceipt, RelayError> {
        tokio::fs::create_dir_all(&self.audio_dir).await?;
        let file_name = format!("{}{}", Uuid::new_v4(), staged.extension);
        let dest = self.audio_dir.join(&file_name);

        if let Err(err) = staged.file.persist(&dest) {
            // Staging and audio dirs on different filesystems; the temp file is
            // still removed when `err.file` drops.
            debug!(error = %err.error, "rename failed, copying staged audio");
            let _ = tokio::fs::copy(err.file.path(), &dest).await?;
        }

        let url = format!("{AUDIO_ROUTE}/{file_name}");
        if let Err(err) = self
            .session
            .send_message(&url, &staged.sender, &staged.group_name, MessageKind::Audio)
            .await
        {
            if let Err(rm) = tokio::fs::remove_file(&dest).await {
                warn!(path = %dest.display(), error = %rm, "could not remove undelivered audio");
            }
            return Err(err);
        }

        info!(sender = %staged.sender, group = %staged.group_name, bytes = staged.len, %url, "audio stored and announced");
        Ok(UploadReceipt {
            message: "OK".into(),
            audio_url: Some(url),
        })
    }

    async fn deliver_forward(&self, staged: StagedAudio) -> Result<UploadReceipt, RelayError> {
        let data = tokio::fs::read(staged.path()).await?;
        self.session
            .send_audio(&data, &staged.sender, &staged.group_name, &staged.extension)
            .await?;
        info!(sender = %staged.sender, group = %staged.group_name, bytes = staged.len, "audio forwarded");
        Ok(UploadReceipt {
            message: "OK".into(),
            audio_url: None,
        })
    }
}

async fn read_text(field: axum::extract::multipart::Field<'_>) -> Result<String, RelayError> {
    field
        .text()
        .await
        .map_err(|e| RelayError::UploadRejected(e.to_string()))
}

fn required(value: Option<String>, name: &str) -> Result<String, RelayError> {
    match value {
        Some(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(RelayError::InvalidPayload(format!("`{name}` must not be empty"))),
    }
}

/// `.ext` from an uploaded file name, when it is short and alphanumeric.
fn extension_of(file_name: &str) -> Option<String> {
    let ext = Path::new(file_name).extension()?.to_str()?;
    if ext.is_empty() || ext.len() > 8 || !ext.chars().all(|c| c.is_ascii_alphanumeric()) {
        return None;
    }
    Some(format!(".{}", ext.to_ascii_lowercase()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extension_comes_from_file_name() {
        assert_eq!(extension_of("nota.OGG").as_deref(), Some(".ogg"));
        assert_eq!(extension_of("blob").as_deref(), None);
        assert_eq!(extension_of("x.../../etc").as_deref(), None);
        assert_eq!(extension_of("a.verylongextension").as_deref(), None);
    }

    #[test]
    fn blank_fields_are_rejected() {
        assert!(required(Some("  ".into()), "sender").is_err());
        assert!(required(None, "sender").is_err());
        assert_eq!(required(Some("ana".into()), "sender").unwrap(), "ana");
    }

    #[test]
    fn receipt_serializes_camel_case() {
        let receipt = UploadReceipt {
            message: "OK".into(),
            audio_url: Some("/audios/a.webm".into()),
        };
        let value = serde_json::to_value(&receipt).unwrap();
        assert_eq!(value["audioUrl"], "/audios/a.webm");

        let forwarded = UploadReceipt {
            message: "OK".into(),
            audio_url: None,
        };
        let value = serde_json::to_value(&forwarded).unwrap();
        assert!(value.get("audioUrl").is_none());
    }
}
