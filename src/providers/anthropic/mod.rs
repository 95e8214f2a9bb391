use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use reqwest::Client;
use serde_json::{Value, json};
use std::path::PathBuf;
use tracing::{debug, warn};

use crate::config::AppSettings;
use crate::errors::GatewayError;
use crate::providers::base::{
    AttachmentKind, ChatMessage, ChatProvider, ChatRequest, ChatResponse, ResponseMessage, Role,
    StoredFiles, Usage, resolve_storage_path, simulated_failure,
};
use crate::providers::errors::ProviderErrorHandler;

const ANTHROPIC_VERSION: &str = "2023-06-01";
/// Hard upper bound on max_tokens; model-specific limits below this are
/// enforced by the API itself.
const MAX_TOKENS_CAP: u32 = 64_000;

/// Adapter for the Anthropic Messages API.
///
/// System-role messages are lifted into the top-level `system` field, and
/// image attachments are embedded as base64 content blocks — Anthropic
/// cannot fetch gateway-local URLs.
pub struct AnthropicProvider {
    base_url: String,
    default_model: String,
    default_max_tokens: u32,
    storage_dir: PathBuf,
    client: Client,
}

impl AnthropicProvider {
    pub fn new(settings: &AppSettings, client: Client) -> Self {
        Self {
            base_url: settings.anthropic_base_url.trim_end_matches('/').to_string(),
            default_model: settings.anthropic_default_model.clone(),
            default_max_tokens: settings.default_max_tokens,
            storage_dir: PathBuf::from(&settings.storage_dir),
            client,
        }
    }

    #[cfg(test)]
    fn with_base_url(base_url: &str, storage_dir: &std::path::Path) -> Self {
        let settings = AppSettings {
            anthropic_base_url: base_url.to_string(),
            storage_dir: storage_dir.display().to_string(),
            ..AppSettings::default()
        };
        Self::new(&settings, Client::new())
    }

    /// Normalize a stored mime type to the set Anthropic accepts,
    /// defaulting to JPEG for anything unrecognized.
    fn normalize_media_type(mime_type: &str) -> &'static str {
        match mime_type.to_lowercase().as_str() {
            "image/jpg" | "image/jpeg" => "image/jpeg",
            "image/png" => "image/png",
            "image/gif" => "image/gif",
            "image/webp" => "image/webp",
            _ => "image/jpeg",
        }
    }

    /// One message as Anthropic content blocks. A lone text block collapses
    /// to a plain string, matching what the SDK sends.
    fn build_message(&self, message: &ChatMessage, stored_files: Option<&StoredFiles>) -> Value {
        let role = message.role.as_str();
        let mut blocks = Vec::new();
        if !message.content.is_empty() {
            blocks.push(json!({"type": "text", "text": message.content}));
        }

        let attachments = message.attachments.as_deref().unwrap_or_default();
        if let Some(stored_files) = stored_files {
            for att in attachments {
                let Some(file) = stored_files.get(&att.file_id) else {
                    warn!("file {} not resolved, skipping attachment", att.file_id);
                    continue;
                };
                if att.kind == AttachmentKind::Image {
                    blocks.push(self.image_block(&att.file_id, file));
                } else {
                    blocks.push(json!({
                        "type": "text",
                        "text": format!("[Attached file: {}]", file.filename)
                    }));
                }
            }
        }

        if blocks.is_empty() {
            json!({"role": role, "content": message.content})
        } else if blocks.len() == 1 && blocks[0]["type"] == "text" && attachments.is_empty() {
            json!({"role": role, "content": blocks[0]["text"].clone()})
        } else {
            json!({"role": role, "content": blocks})
        }
    }

    /// Read the image from storage and embed it as a base64 block. An
    /// unreadable file degrades to a text placeholder instead of failing
    /// the whole call.
    fn image_block(&self, file_id: &str, file: &crate::providers::base::ResolvedFile) -> Value {
        let Some(path) = resolve_storage_path(&self.storage_dir, &file.storage_path) else {
            warn!("image file not found for {} (path: {})", file_id, file.storage_path);
            return json!({
                "type": "text",
                "text": format!("[Image: {} - file not found]", file.filename)
            });
        };

        match std::fs::read(&path) {
            Ok(bytes) => {
                let media_type = Self::normalize_media_type(&file.mime_type);
                debug!(
                    "embedding image {} ({} bytes, {})",
                    file_id,
                    bytes.len(),
                    media_type
                );
                json!({
                    "type": "image",
                    "source": {
                        "type": "base64",
                        "media_type": media_type,
                        "data": BASE64.encode(bytes)
                    }
                })
            }
            Err(e) => {
                warn!("failed to read image {}: {}", path.display(), e);
                json!({
                    "type": "text",
                    "text": format!("[Image: {} - failed to encode]", file.filename)
                })
            }
        }
    }

    fn parse_response(&self, data: &Value, requested_model: &str) -> Result<ChatResponse, GatewayError> {
        let blocks = data["content"].as_array();
        let first = blocks
            .and_then(|b| b.first())
            .ok_or_else(|| GatewayError::Transient("Anthropic API returned empty content".into()))?;
        if first["type"] != "text" {
            return Err(GatewayError::Transient(format!(
                "Anthropic API returned unsupported content type: {}",
                first["type"].as_str().unwrap_or("unknown")
            )));
        }

        // Anthropic reports input/output token counts; rename to the
        // gateway's prompt/completion shape and derive the total
        let usage = data.get("usage").map(|u| {
            let input = u.get("input_tokens").and_then(Value::as_u64).unwrap_or(0);
            let output = u.get("output_tokens").and_then(Value::as_u64).unwrap_or(0);
            Usage {
                prompt_tokens: Some(input),
                completion_tokens: Some(output),
                total_tokens: Some(input + output),
            }
        });

        Ok(ChatResponse {
            model: data["model"]
                .as_str()
                .unwrap_or(requested_model)
                .to_string(),
            message: ResponseMessage {
                role: "assistant".to_string(),
                content: first["text"].as_str().unwrap_or_default().to_string(),
            },
            usage,
        })
    }
}

#[async_trait]
impl ChatProvider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    fn supports_attachments(&self) -> bool {
        true
    }

    async fn chat(
        &self,
        api_key: &str,
        request: &ChatRequest,
        stored_files: Option<&StoredFiles>,
    ) -> Result<ChatResponse, GatewayError> {
        if let Some(err) = simulated_failure(request) {
            return Err(err);
        }
        if api_key.is_empty() {
            return Err(GatewayError::Client("Anthropic API key is not provided".into()));
        }

        let model = request.model.as_deref().unwrap_or(&self.default_model);

        let mut system_parts = Vec::new();
        let mut messages = Vec::new();
        for message in &request.messages {
            if message.role == Role::System {
                system_parts.push(message.content.clone());
            } else {
                messages.push(self.build_message(message, stored_files));
            }
        }

        let max_tokens = request
            .max_tokens
            .unwrap_or(self.default_max_tokens)
            .min(MAX_TOKENS_CAP);

        let mut payload = json!({
            "model": model,
            "messages": messages,
            "max_tokens": max_tokens,
        });
        if !system_parts.is_empty() {
            payload["system"] = json!(system_parts.join("\n\n"));
        }
        if let Some(temperature) = request.temperature {
            payload["temperature"] = json!(temperature);
        }

        let response = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("Content-Type", "application/json")
            .json(&payload)
            .send()
            .await
            .map_err(|e| ProviderErrorHandler::transport("Anthropic", &e))?;

        let status = response.status();
        if status != reqwest::StatusCode::OK {
            let headers = response.headers().clone();
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderErrorHandler::classify(
                "Anthropic",
                status,
                &headers,
                &body,
            ));
        }

        let data: Value = response
            .json()
            .await
            .map_err(|e| ProviderErrorHandler::transport("Anthropic", &e))?;
        self.parse_response(&data, model)
    }
}
