//! Speech-to-text gateway client. Ported from
//! `stt_tts/vira_stt.py::ViraSTTClient`. The gateway's response JSON is
//! deeply nested with synonym keys at most levels — `dig_text` etc. below
//! walk the same fallback chain the original's dict-lookup code did.

use std::sync::Arc;

use reqwest::multipart::{Form, Part};
use reqwest::Client;
use serde_json::Value;
use tokio::sync::Semaphore;

use crate::config::ViraSettings;
use crate::error::ProviderError;

#[derive(Debug, Clone, Default)]
pub struct SttResult {
    pub text: String,
    pub request_id: Option<String>,
    pub trace_id: Option<String>,
}

pub struct SttClient {
    http: Client,
    url: String,
    token: String,
    semaphore: Arc<Semaphore>,
}

impl SttClient {
    pub fn new(
        settings: &ViraSettings,
        max_parallel: usize,
        http_max_connections: usize,
    ) -> Result<SttClient, ProviderError> {
        let http = Client::builder()
            .timeout(settings.timeout)
            .danger_accept_invalid_certs(!settings.verify_ssl)
            .pool_max_idle_per_host(http_max_connections.max(1))
            .build()?;
        Ok(SttClient {
            http,
            url: settings.stt_url.clone(),
            token: settings.stt_token.clone(),
            semaphore: Arc::new(Semaphore::new(max_parallel.max(1))),
        })
    }

    pub async fn transcribe(
        &self,
        audio_bytes: Vec<u8>,
        hotwords: &[String],
    ) -> Result<SttResult, ProviderError> {
        if self.token.is_empty() {
            return Err(ProviderError::Unauthorized);
        }

        let _permit = self.semaphore.acquire().await;

        let mut form = Form::new()
            .part(
                "audio",
                Part::bytes(audio_bytes)
                    .file_name("audio.wav")
                    .mime_str("audio/wav")?,
            )
            .text("model", "default")
            .text("srt", "false")
            .text("inverseNormalizer", "true")
            .text("timestamp", "false")
            .text("spokenPunctuation", "false")
            .text("punctuation", "true")
            .text("numSpeakers", "1")
            .text("diarize", "false");
        for hotword in hotwords {
            form = form.text("hotwords[]", hotword.clone());
        }

        let resp = self
            .http
            .post(&self.url)
            .header("gateway-token", &self.token)
            .multipart(form)
            .send()
            .await?;

        let status = resp.status();
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
        if let Some(quota) = ProviderError::classify_quota(200, &raw) {
            return Err(quota);
        }

        let value: Value = serde_json::from_str(&raw).unwrap_or(Value::Null);
        Ok(SttResult {
            text: dig_text(&value).unwrap_or_default(),
            request_id: dig_first(&value, &["requestId", "request_id"]),
            trace_id: dig_first(&value, &["traceId", "trace_id"]),
        })
    }
}

/// Walks `data.data.aiResponse.result.text` and its known synonym paths,
/// returning the first non-empty string found.
fn dig_text(value: &Value) -> Option<String> {
    const PATHS: &[&[&str]] = &[
        &["data", "data", "aiResponse", "result", "text"],
        &["data", "aiResponse", "result", "text"],
        &["aiResponse", "result", "text"],
        &["result", "text"],
        &["data", "result", "text"],
        &["text"],
    ];
    for path in PATHS {
        if let Some(text) = dig_path(value, path).and_then(Value::as_str) {
            if !text.is_empty() {
                return Some(text.to_string());
            }
        }
    }
    None
}

fn dig_path<'a>(value: &'a Value, path: &[&str]) -> Option<&'a Value> {
    path.iter().try_fold(value, |v, key| v.get(key))
}

fn dig_first(value: &Value, keys: &[&str]) -> Option<String> {
    const PREFIXES: &[&[&str]] = &[
        &["data", "data", "aiResponse", "result"],
        &["data", "aiResponse", "result"],
        &["aiResponse", "result"],
        &["result"],
        &[],
    ];
    for prefix in PREFIXES {
        for key in keys {
            let mut path: Vec<&str> = prefix.to_vec();
            path.push(key);
            if let Some(found) = dig_path(value, &path).and_then(Value::as_str) {
                return Some(found.to_string());
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn digs_text_from_fully_nested_response() {
        let value = json!({
            "data": { "data": { "aiResponse": { "result": { "text": "hello there" } } } }
        });
        assert_eq!(dig_text(&value).as_deref(), Some("hello there"));
    }

    #[test]
    fn digs_text_from_shallow_response() {
        let value = json!({ "text": "ok" });
        assert_eq!(dig_text(&value).as_deref(), Some("ok"));
    }

    #[test]
    fn missing_text_yields_none() {
        let value = json!({ "status": "done" });
        assert_eq!(dig_text(&value), None);
    }
}
