//! ARI REST command surface: bridges, channels, playback, recording,
//! origination. One thin method per endpoint, mirroring
//! `telephony/ari_client.py`'s `AriClient`.

use std::time::Duration;

use reqwest::Client;
use serde_json::{json, Value};

use crate::config::AriSettings;
use crate::error::TelephonyError;

pub struct AriClient {
    http: Client,
    base_url: String,
    app_name: String,
    username: String,
    password: String,
}

impl AriClient {
    pub fn new(settings: &AriSettings, http_max_connections: usize) -> Result<AriClient, TelephonyError> {
        let http = Client::builder()
            .timeout(settings.timeout)
            .pool_max_idle_per_host(http_max_connections.max(1))
            .build()?;
        Ok(AriClient {
            http,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            app_name: settings.app_name.clone(),
            username: settings.username.clone(),
            password: settings.password.clone(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn check(resp: reqwest::Response) -> Result<Value, TelephonyError> {
        let status = resp.status();
        if status.is_success() {
            let bytes = resp.bytes().await?;
            if bytes.is_empty() {
                return Ok(Value::Null);
            }
            Ok(serde_json::from_slice(&bytes).unwrap_or(Value::Null))
        } else {
            let body = resp.text().await.unwrap_or_default();
            Err(TelephonyError::Rest {
                status: status.as_u16(),
                body,
            })
        }
    }

    pub async fn create_bridge(&self, bridge_type: &str) -> Result<String, TelephonyError> {
        let resp = self
            .http
            .post(self.url("/bridges"))
            .basic_auth(&self.username, Some(&self.password))
            .json(&json!({ "type": bridge_type }))
            .send()
            .await?;
        let value = Self::check(resp).await?;
        Ok(value["id"].as_str().unwrap_or_default().to_string())
    }

    pub async fn delete_bridge(&self, bridge_id: &str) -> Result<(), TelephonyError> {
        let resp = self
            .http
            .delete(self.url(&format!("/bridges/{bridge_id}")))
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await?;
        Self::check(resp).await.map(|_| ())
    }

    pub async fn add_channel_to_bridge(
        &self,
        bridge_id: &str,
        channel_id: &str,
    ) -> Result<(), TelephonyError> {
        let resp = self
            .http
            .post(self.url(&format!("/bridges/{bridge_id}/addChannel")))
            .basic_auth(&self.username, Some(&self.password))
            .query(&[("channel", channel_id)])
            .send()
            .await?;
        Self::check(resp).await.map(|_| ())
    }

    pub async fn remove_channel_from_bridge(
        &self,
        bridge_id: &str,
        channel_id: &str,
    ) -> Result<(), TelephonyError> {
        let resp = self
            .http
            .post(self.url(&format!("/bridges/{bridge_id}/removeChannel")))
            .basic_auth(&self.username, Some(&self.password))
            .query(&[("channel", channel_id)])
            .send()
            .await?;
        Self::check(resp).await.map(|_| ())
    }

    pub async fn answer_channel(&self, channel_id: &str) -> Result<(), TelephonyError> {
        let resp = self
            .http
            .post(self.url(&format!("/channels/{channel_id}/answer")))
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await?;
        Self::check(resp).await.map(|_| ())
    }

    pub async fn hangup_channel(
        &self,
        channel_id: &str,
        reason: Option<&str>,
    ) -> Result<(), TelephonyError> {
        let mut req = self
            .http
            .delete(self.url(&format!("/channels/{channel_id}")))
            .basic_auth(&self.username, Some(&self.password));
        if let Some(reason) = reason {
            req = req.query(&[("reason", reason)]);
        }
        let resp = req.send().await?;
        match Self::check(resp).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub async fn play_on_channel(
        &self,
        channel_id: &str,
        media_uri: &str,
    ) -> Result<String, TelephonyError> {
        let resp = self
            .http
            .post(self.url(&format!("/channels/{channel_id}/play")))
            .basic_auth(&self.username, Some(&self.password))
            .query(&[("media", media_uri)])
            .send()
            .await?;
        let value = Self::check(resp).await?;
        Ok(value["id"].as_str().unwrap_or_default().to_string())
    }

    pub async fn play_on_bridge(
        &self,
        bridge_id: &str,
        media_uri: &str,
    ) -> Result<String, TelephonyError> {
        let resp = self
            .http
            .post(self.url(&format!("/bridges/{bridge_id}/play")))
            .basic_auth(&self.username, Some(&self.password))
            .query(&[("media", media_uri)])
            .send()
            .await?;
        let value = Self::check(resp).await?;
        Ok(value["id"].as_str().unwrap_or_default().to_string())
    }

    pub async fn stop_playback(&self, playback_id: &str) -> Result<(), TelephonyError> {
        let resp = self
            .http
            .delete(self.url(&format!("/playbacks/{playback_id}")))
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await?;
        match Self::check(resp).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub async fn record_channel(
        &self,
        channel_id: &str,
        name: &str,
        max_duration_secs: u32,
        max_silence_secs: u32,
    ) -> Result<(), TelephonyError> {
        let resp = self
            .http
            .post(self.url(&format!("/channels/{channel_id}/record")))
            .basic_auth(&self.username, Some(&self.password))
            .json(&json!({
                "name": name,
                "format": "wav",
                "maxDurationSeconds": max_duration_secs,
                "maxSilenceSeconds": max_silence_secs,
                "ifExists": "overwrite",
            }))
            .send()
            .await?;
        Self::check(resp).await.map(|_| ())
    }

    pub async fn record_bridge(
        &self,
        bridge_id: &str,
        name: &str,
        max_duration_secs: u32,
        max_silence_secs: u32,
    ) -> Result<(), TelephonyError> {
        let resp = self
            .http
            .post(self.url(&format!("/bridges/{bridge_id}/record")))
            .basic_auth(&self.username, Some(&self.password))
            .json(&json!({
                "name": name,
                "format": "wav",
                "maxDurationSeconds": max_duration_secs,
                "maxSilenceSeconds": max_silence_secs,
                "ifExists": "overwrite",
            }))
            .send()
            .await?;
        Self::check(resp).await.map(|_| ())
    }

    pub async fn fetch_stored_recording(&self, name: &str) -> Result<Vec<u8>, TelephonyError> {
        let resp = self
            .http
            .get(self.url(&format!("/recordings/stored/{name}/file")))
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(TelephonyError::Rest {
                status: status.as_u16(),
                body,
            });
        }
        Ok(resp.bytes().await?.to_vec())
    }

    /// Originates a call out a trunk endpoint into the Stasis application,
    /// returning the new channel's id.
    pub async fn originate_call(
        &self,
        endpoint: &str,
        caller_id: &str,
        timeout: Duration,
        variables: &std::collections::HashMap<String, String>,
    ) -> Result<String, TelephonyError> {
        let resp = self
            .http
            .post(self.url("/channels"))
            .basic_auth(&self.username, Some(&self.password))
            .json(&json!({
                "endpoint": endpoint,
                "app": self.app_name,
                "callerId": caller_id,
                "timeout": timeout.as_secs(),
                "variables": variables,
            }))
            .send()
            .await?;
        let value = Self::check(resp).await?;
        Ok(value["id"].as_str().unwrap_or_default().to_string())
    }

    pub async fn get_channel_variable(
        &self,
        channel_id: &str,
        variable: &str,
    ) -> Result<Option<String>, TelephonyError> {
        let resp = self
            .http
            .get(self.url(&format!("/channels/{channel_id}/variable")))
            .basic_auth(&self.username, Some(&self.password))
            .query(&[("variable", variable)])
            .send()
            .await?;
        match Self::check(resp).await {
            Ok(value) => Ok(value["value"].as_str().map(str::to_string)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }
}
