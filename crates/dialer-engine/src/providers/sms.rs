//! SMS alert gateway client. Ported from
//! `integrations/sms/melipayamak.py::SMSClient`. Used only for ops
//! alerting (§2a: SMS failure-streak alerting), never on the live call path.

use std::time::Duration;

use reqwest::Client;
use serde_json::json;

use crate::config::SmsSettings;
use crate::error::ProviderError;

pub struct SmsClient {
    http: Client,
    api_key: String,
    sender: String,
    admins: Vec<String>,
}

impl SmsClient {
    pub fn new(settings: &SmsSettings, http_max_connections: usize) -> Result<SmsClient, ProviderError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(15))
            .pool_max_idle_per_host(http_max_connections.max(1))
            .build()?;
        Ok(SmsClient {
            http,
            api_key: settings.api_key.clone(),
            sender: settings.sender.clone(),
            admins: settings.admins.clone(),
        })
    }

    /// Sends `text` to `to_override` if given, else to every configured
    /// admin number. No-ops (with the caller expected to have already
    /// logged context) when no API key is configured.
    pub async fn send_message(
        &self,
        text: &str,
        to_override: Option<&[String]>,
    ) -> Result<(), ProviderError> {
        if self.api_key.is_empty() {
            return Err(ProviderError::Unauthorized);
        }
        let recipients = to_override.unwrap_or(&self.admins);
        if recipients.is_empty() {
            return Ok(());
        }

        let url = format!(
            "https://console.melipayamak.com/api/send/advanced/{}",
            self.api_key
        );
        let resp = self
            .http
            .post(&url)
            .json(&json!({
                "from": self.sender,
                "to": recipients,
                "text": text,
                "udh": "",
            }))
            .send()
            .await?;

        if resp.status().is_success() {
            Ok(())
        } else {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            Err(ProviderError::Rest { status, body })
        }
    }
}
