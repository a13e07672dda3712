//! OpenAI-compatible chat-completions gateway client. Ported from
//! `llm/client.py::GapGPTClient`. The gateway answers either as a single
//! JSON document or as an SSE stream of `data:` chunks depending on
//! whether the caller asked for streaming — this client sniffs both.

use std::sync::Arc;

use reqwest::Client;
use serde_json::{json, Value};
use tokio::sync::Semaphore;
use tracing::warn;

use crate::config::GapGptSettings;
use crate::error::ProviderError;

pub struct LlmClient {
    http: Client,
    base_url: String,
    api_key: String,
    semaphore: Arc<Semaphore>,
}

impl LlmClient {
    pub fn new(
        settings: &GapGptSettings,
        max_parallel: usize,
        http_max_connections: usize,
    ) -> Result<LlmClient, ProviderError> {
        let http = Client::builder()
            .timeout(settings.timeout)
            .pool_max_idle_per_host(http_max_connections.max(1))
            .build()?;
        Ok(LlmClient {
            http,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            api_key: settings.api_key.clone(),
            semaphore: Arc::new(Semaphore::new(max_parallel.max(1))),
        })
    }

    /// Sends a chat-completion request. Returns an empty string (with a
    /// warning logged) if no API key is configured, matching the original
    /// client's no-op-rather-than-error behavior when credentials are
    /// absent from the environment.
    pub async fn chat(
        &self,
        messages: &[(String, String)],
        model: &str,
        temperature: f64,
        response_format_json: bool,
    ) -> Result<String, ProviderError> {
        if self.api_key.is_empty() {
            warn!("GapGPT API key not configured, skipping chat call");
            return Ok(String::new());
        }

        let _permit = self.semaphore.acquire().await;

        let mut body = json!({
            "model": model,
            "temperature": temperature,
            "messages": messages
                .iter()
                .map(|(role, content)| json!({ "role": role, "content": content }))
                .collect::<Vec<_>>(),
        });
        if response_format_json {
            body["response_format"] = json!({ "type": "json_object" });
        }

        let resp = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        let raw = resp.text().await?;

        if !status.is_success() {
            if let Some(quota) = ProviderError::classify_quota(status.as_u16(), &raw) {
                return Err(quota);
            }
            return Err(ProviderError::Rest {
                status: status.as_u16(),
                body: raw,
            });
        }

        if content_type.contains("text/event-stream") || raw.trim_start().starts_with("data:") {
            Ok(Self::extract_from_sse(&raw))
        } else {
            Ok(Self::extract_from_json(&raw))
        }
    }

    fn extract_from_sse(raw: &str) -> String {
        let mut out = String::new();
        for line in raw.lines() {
            let Some(data) = line.strip_prefix("data:") else {
                continue;
            };
            let data = data.trim();
            if data.is_empty() || data == "[DONE]" {
                continue;
            }
            let Ok(chunk) = serde_json::from_str::<Value>(data) else {
                continue;
            };
            if let Some(piece) = chunk["choices"][0]["delta"]["content"].as_str() {
                out.push_str(piece);
            }
        }
        out
    }

    fn extract_from_json(raw: &str) -> String {
        let Ok(value) = serde_json::from_str::<Value>(raw) else {
            return String::new();
        };
        value["choices"][0]["message"]["content"]
            .as_str()
            .unwrap_or("")
            .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_sse_chunks_in_order() {
        let raw = "data: {\"choices\":[{\"delta\":{\"content\":\"hel\"}}]}\n\
                   data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n\
                   data: [DONE]\n";
        assert_eq!(LlmClient::extract_from_sse(raw), "hello");
    }

    #[test]
    fn extracts_plain_json_message() {
        let raw = r#"{"choices":[{"message":{"content":"yes"}}]}"#;
        assert_eq!(LlmClient::extract_from_json(raw), "yes");
    }
}
