use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::errors::GatewayError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttachmentKind {
    Image,
    File,
    Document,
}

/// Reference to an uploaded file carried on a chat message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatAttachment {
    pub file_id: String,
    #[serde(rename = "type")]
    pub kind: AttachmentKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachments: Option<Vec<ChatAttachment>>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
            attachments: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            attachments: None,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            attachments: None,
        }
    }
}

/// Parameters for a chat completion, provider-agnostic.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    /// Provider tag; the HTTP layer defaults this to "openai".
    #[serde(default)]
    pub provider: Option<String>,
}

impl ChatRequest {
    /// All unique attachment file ids across the request's messages.
    pub fn attachment_file_ids(&self) -> Vec<String> {
        let mut seen = Vec::new();
        for message in &self.messages {
            if let Some(attachments) = &message.attachments {
                for att in attachments {
                    if !seen.contains(&att.file_id) {
                        seen.push(att.file_id.clone());
                    }
                }
            }
        }
        seen
    }

    pub fn has_attachments(&self) -> bool {
        self.messages
            .iter()
            .any(|m| m.attachments.as_ref().is_some_and(|a| !a.is_empty()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: Option<u64>,
    #[serde(default)]
    pub completion_tokens: Option<u64>,
    #[serde(default)]
    pub total_tokens: Option<u64>,
}

impl Usage {
    /// Upstream total when reported, otherwise prompt + completion.
    pub fn total_or_sum(&self) -> u64 {
        self.total_tokens.unwrap_or_else(|| {
            self.prompt_tokens.unwrap_or(0) + self.completion_tokens.unwrap_or(0)
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    pub model: String,
    pub message: ResponseMessage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

/// A stored file resolved for a request: enough to build either a public
/// URL part (OpenAI) or an inline base64 block (Anthropic).
#[derive(Debug, Clone)]
pub struct ResolvedFile {
    pub id: String,
    pub filename: String,
    pub mime_type: String,
    pub public_url: String,
    pub storage_path: String,
}

/// file_id → resolved file, for every attachment in the request.
pub type StoredFiles = HashMap<String, ResolvedFile>;

/// Uniform upstream contract. Implementations translate the internal
/// request to their wire shape and classify every failure into a typed
/// [`GatewayError`] — nothing else escapes.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Whether this adapter can carry file/image attachments. Checked by
    /// the HTTP layer before a key is consumed.
    fn supports_attachments(&self) -> bool {
        false
    }

    async fn chat(
        &self,
        api_key: &str,
        request: &ChatRequest,
        stored_files: Option<&StoredFiles>,
    ) -> Result<ChatResponse, GatewayError>;
}

impl std::fmt::Debug for dyn ChatProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatProvider").field("name", &self.name()).finish()
    }
}

/// Contract test hooks: magic first-message contents that fail without
/// touching the upstream. Every adapter honors these.
pub fn simulated_failure(request: &ChatRequest) -> Option<GatewayError> {
    match request.messages.first().map(|m| m.content.as_str()) {
        Some("force429") => {
            warn!("simulating rate limit error for testing");
            Some(GatewayError::RateLimit {
                retry_after: Some(30),
            })
        }
        Some("force_transient_error") => {
            warn!("simulating transient error for testing");
            Some(GatewayError::Transient(
                "Simulated transient error for testing".into(),
            ))
        }
        _ => None,
    }
}

/// Resolve a stored file's `storage_path` to an on-disk path.
///
/// Tolerates absolute paths, paths relative to `storage_dir`, and legacy
/// values that already carry the `storage/` prefix.
pub fn resolve_storage_path(storage_dir: &Path, storage_path: &str) -> Option<PathBuf> {
    if storage_path.is_empty() {
        return None;
    }

    let raw = Path::new(storage_path);
    let resolved = if raw.is_absolute() {
        raw.to_path_buf()
    } else if let Ok(stripped) = raw.strip_prefix("storage") {
        storage_dir.join(stripped)
    } else {
        storage_dir.join(raw)
    };

    if resolved.exists() {
        Some(resolved)
    } else {
        warn!("storage path not found: {} (resolved to {})", storage_path, resolved.display());
        None
    }
}

#[cfg(test)]
mod tests;
