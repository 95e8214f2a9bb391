use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Value, json};

use crate::config::AppSettings;
use crate::errors::GatewayError;
use crate::providers::base::{
    ChatProvider, ChatRequest, ChatResponse, ResponseMessage, Role, StoredFiles, Usage,
    simulated_failure,
};
use crate::providers::errors::ProviderErrorHandler;

/// Adapter for the Google Gemini `generateContent` API.
///
/// Roles map `assistant` → `model`; system messages hoist into
/// `systemInstruction`; sampling options ride in `generationConfig`.
/// No attachment support in this version.
pub struct GeminiProvider {
    base_url: String,
    default_model: String,
    client: Client,
}

impl GeminiProvider {
    pub fn new(settings: &AppSettings, client: Client) -> Self {
        Self {
            base_url: settings.gemini_base_url.trim_end_matches('/').to_string(),
            default_model: settings.gemini_default_model.clone(),
            client,
        }
    }

    #[cfg(test)]
    fn with_base_url(base_url: &str) -> Self {
        let settings = AppSettings {
            gemini_base_url: base_url.to_string(),
            ..AppSettings::default()
        };
        Self::new(&settings, Client::new())
    }

    fn parse_response(data: &Value, model: &str) -> Result<ChatResponse, GatewayError> {
        let candidate = data["candidates"]
            .as_array()
            .and_then(|c| c.first())
            .ok_or_else(|| {
                GatewayError::Transient("Gemini API returned no candidates".into())
            })?;

        let text = candidate["content"]["parts"]
            .as_array()
            .and_then(|parts| parts.first())
            .and_then(|part| part["text"].as_str())
            .ok_or_else(|| {
                GatewayError::Transient("Gemini API returned empty content".into())
            })?;

        let usage = data.get("usageMetadata").map(|u| Usage {
            prompt_tokens: u.get("promptTokenCount").and_then(Value::as_u64),
            completion_tokens: u.get("candidatesTokenCount").and_then(Value::as_u64),
            total_tokens: u.get("totalTokenCount").and_then(Value::as_u64),
        });

        Ok(ChatResponse {
            model: model.to_string(),
            message: ResponseMessage {
                role: "assistant".to_string(),
                content: text.to_string(),
            },
            usage,
        })
    }
}

#[async_trait]
impl ChatProvider for GeminiProvider {
    fn name(&self) -> &str {
        "gemini"
    }

    async fn chat(
        &self,
        api_key: &str,
        request: &ChatRequest,
        _stored_files: Option<&StoredFiles>,
    ) -> Result<ChatResponse, GatewayError> {
        if let Some(err) = simulated_failure(request) {
            return Err(err);
        }
        if api_key.is_empty() {
            return Err(GatewayError::Client("Gemini API key is not provided".into()));
        }

        let model = request.model.as_deref().unwrap_or(&self.default_model);

        let mut contents = Vec::new();
        let mut system_instruction = None;
        for message in &request.messages {
            match message.role {
                Role::System => system_instruction = Some(message.content.clone()),
                Role::Assistant => contents.push(json!({
                    "role": "model",
                    "parts": [{"text": message.content}]
                })),
                Role::User => contents.push(json!({
                    "role": "user",
                    "parts": [{"text": message.content}]
                })),
            }
        }

        let mut payload = json!({"contents": contents});
        if let Some(instruction) = system_instruction {
            payload["systemInstruction"] = json!({"parts": [{"text": instruction}]});
        }

        let mut generation_config = serde_json::Map::new();
        if let Some(temperature) = request.temperature {
            generation_config.insert("temperature".into(), json!(temperature));
        }
        if let Some(max_tokens) = request.max_tokens {
            generation_config.insert("maxOutputTokens".into(), json!(max_tokens));
        }
        if !generation_config.is_empty() {
            payload["generationConfig"] = Value::Object(generation_config);
        }

        // The API key travels as a query parameter on this API
        let response = self
            .client
            .post(format!(
                "{}/models/{}:generateContent?key={}",
                self.base_url, model, api_key
            ))
            .header("Content-Type", "application/json")
            .json(&payload)
            .send()
            .await
            .map_err(|e| ProviderErrorHandler::transport("Gemini", &e))?;

        let status = response.status();
        if status != reqwest::StatusCode::OK {
            let headers = response.headers().clone();
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderErrorHandler::classify("Gemini", status, &headers, &body));
        }

        let data: Value = response
            .json()
            .await
            .map_err(|e| ProviderErrorHandler::transport("Gemini", &e))?;
        Self::parse_response(&data, model)
    }
}
