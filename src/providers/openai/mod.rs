use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Value, json};

use crate::config::AppSettings;
use crate::errors::GatewayError;
use crate::providers::base::{
    AttachmentKind, ChatMessage, ChatProvider, ChatRequest, ChatResponse, ResponseMessage,
    StoredFiles, Usage, simulated_failure,
};
use crate::providers::errors::ProviderErrorHandler;

/// Adapter for the OpenAI chat-completions wire shape. Also serves any
/// compatible upstream (DeepSeek) pointed at a different base URL.
pub struct OpenAiCompatProvider {
    tag: String,
    label: String,
    base_url: String,
    default_model: String,
    supports_attachments: bool,
    client: Client,
}

impl OpenAiCompatProvider {
    pub fn openai(settings: &AppSettings, client: Client) -> Self {
        Self::with_config(
            "openai",
            "OpenAI",
            &settings.openai_base_url,
            &settings.openai_default_model,
            true,
            client,
        )
    }

    pub fn deepseek(settings: &AppSettings, client: Client) -> Self {
        Self::with_config(
            "deepseek",
            "DeepSeek",
            &settings.deepseek_base_url,
            &settings.deepseek_default_model,
            false,
            client,
        )
    }

    pub fn with_config(
        tag: &str,
        label: &str,
        base_url: &str,
        default_model: &str,
        supports_attachments: bool,
        client: Client,
    ) -> Self {
        Self {
            tag: tag.to_string(),
            label: label.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            default_model: default_model.to_string(),
            supports_attachments,
            client,
        }
    }

    /// Wire form of one message. With image attachments the content becomes
    /// an array of parts; otherwise it stays a plain string.
    fn build_message(&self, message: &ChatMessage, stored_files: Option<&StoredFiles>) -> Value {
        let attachments = message.attachments.as_deref().unwrap_or_default();
        if attachments.is_empty() || stored_files.is_none() {
            return json!({"role": message.role.as_str(), "content": message.content});
        }
        let stored_files = stored_files.unwrap();

        let mut parts = Vec::new();
        if !message.content.is_empty() {
            parts.push(json!({"type": "text", "text": message.content}));
        }
        for att in attachments {
            let Some(file) = stored_files.get(&att.file_id) else {
                tracing::warn!("file {} not resolved, skipping attachment", att.file_id);
                continue;
            };
            match att.kind {
                AttachmentKind::Image => {
                    parts.push(json!({
                        "type": "image_url",
                        "image_url": {"url": file.public_url}
                    }));
                }
                AttachmentKind::File | AttachmentKind::Document => {
                    parts.push(json!({
                        "type": "text",
                        "text": format!("[Attached file: {}]", file.filename)
                    }));
                }
            }
        }

        if parts.is_empty() {
            json!({"role": message.role.as_str(), "content": message.content})
        } else {
            json!({"role": message.role.as_str(), "content": parts})
        }
    }

    fn parse_response(&self, data: &Value, requested_model: &str) -> Result<ChatResponse, GatewayError> {
        let message = data["choices"]
            .as_array()
            .and_then(|choices| choices.first())
            .map(|choice| &choice["message"])
            .ok_or_else(|| {
                GatewayError::Transient(format!("{} API returned no choices", self.label))
            })?;

        let usage = data.get("usage").map(|u| Usage {
            prompt_tokens: u.get("prompt_tokens").and_then(Value::as_u64),
            completion_tokens: u.get("completion_tokens").and_then(Value::as_u64),
            total_tokens: u.get("total_tokens").and_then(Value::as_u64),
        });

        Ok(ChatResponse {
            model: data["model"]
                .as_str()
                .unwrap_or(requested_model)
                .to_string(),
            message: ResponseMessage {
                role: message["role"].as_str().unwrap_or("assistant").to_string(),
                content: message["content"].as_str().unwrap_or_default().to_string(),
            },
            usage,
        })
    }
}

#[async_trait]
impl ChatProvider for OpenAiCompatProvider {
    fn name(&self) -> &str {
        &self.tag
    }

    fn supports_attachments(&self) -> bool {
        self.supports_attachments
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
            return Err(GatewayError::Client(format!(
                "{} API key is not provided",
                self.label
            )));
        }

        let model = request.model.as_deref().unwrap_or(&self.default_model);
        let messages: Vec<Value> = request
            .messages
            .iter()
            .map(|m| self.build_message(m, stored_files))
            .collect();

        let mut payload = json!({"model": model, "messages": messages});
        if let Some(temperature) = request.temperature {
            payload["temperature"] = json!(temperature);
        }
        if let Some(max_tokens) = request.max_tokens {
            payload["max_tokens"] = json!(max_tokens);
        }

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", api_key))
            .header("Content-Type", "application/json")
            .json(&payload)
            .send()
            .await
            .map_err(|e| ProviderErrorHandler::transport(&self.label, &e))?;

        let status = response.status();
        if status != reqwest::StatusCode::OK {
            let headers = response.headers().clone();
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderErrorHandler::classify(
                &self.label,
                status,
                &headers,
                &body,
            ));
        }

        let data: Value = response
            .json()
            .await
            .map_err(|e| ProviderErrorHandler::transport(&self.label, &e))?;
        self.parse_response(&data, model)
    }
}
