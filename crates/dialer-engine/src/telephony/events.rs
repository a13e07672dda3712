//! ARI (Asterisk REST Interface)-style websocket event envelope, parsed
//! into the subset of event types the session manager routes on.

use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, Clone)]
pub enum AriEvent {
    StasisStart {
        channel_id: String,
        app: String,
        args: Vec<String>,
        caller_number: Option<String>,
        dialed_extension: Option<String>,
        /// `channel.connected.number` — the number the far end believes it
        /// dialed, which for inbound trunk traffic is often more reliable
        /// than the dialplan extension (§4.2, §6).
        connected_number: Option<String>,
    },
    ChannelStateChange {
        channel_id: String,
        state: String,
    },
    ChannelHangupRequest {
        channel_id: String,
        cause: Option<u16>,
        cause_txt: Option<String>,
    },
    ChannelDestroyed {
        channel_id: String,
        cause: Option<u16>,
        cause_txt: Option<String>,
    },
    StasisEnd {
        channel_id: String,
    },
    PlaybackStarted {
        playback_id: String,
        target_uri: String,
    },
    PlaybackFinished {
        playback_id: String,
    },
    RecordingFinished {
        recording_name: String,
    },
    RecordingFailed {
        recording_name: String,
        cause: Option<String>,
    },
    /// Anything the session manager doesn't act on (DTMF, device state,
    /// etc.) is kept around for debug logging rather than dropped silently.
    Other {
        event_type: String,
        raw: Value,
    },
}

#[derive(Deserialize)]
struct RawEvent {
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    application: String,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    channel: Option<RawChannel>,
    #[serde(default)]
    cause: Option<u16>,
    #[serde(default)]
    cause_txt: Option<String>,
    #[serde(default)]
    playback: Option<RawPlayback>,
    #[serde(default)]
    recording: Option<RawRecording>,
}

#[derive(Deserialize)]
struct RawChannel {
    id: String,
    #[serde(default)]
    state: String,
    #[serde(default)]
    caller: Option<RawCallerId>,
    #[serde(default)]
    connected: Option<RawCallerId>,
    #[serde(default)]
    dialplan: Option<RawDialplan>,
}

#[derive(Deserialize)]
struct RawCallerId {
    #[serde(default)]
    number: String,
}

#[derive(Deserialize)]
struct RawDialplan {
    #[serde(default)]
    exten: String,
}

#[derive(Deserialize)]
struct RawPlayback {
    id: String,
    #[serde(default)]
    target_uri: String,
}

#[derive(Deserialize)]
struct RawRecording {
    name: String,
}

impl AriEvent {
    pub fn parse(raw: &str) -> Result<AriEvent, serde_json::Error> {
        let value: Value = serde_json::from_str(raw)?;
        let parsed: RawEvent = serde_json::from_value(value.clone())?;
        let fallback = |event_type: &str| AriEvent::Other {
            event_type: event_type.to_string(),
            raw: value.clone(),
        };

        Ok(match parsed.event_type.as_str() {
            "StasisStart" => match parsed.channel {
                Some(channel) => AriEvent::StasisStart {
                    channel_id: channel.id,
                    app: parsed.application,
                    args: parsed.args,
                    caller_number: channel.caller.map(|c| c.number).filter(|n| !n.is_empty()),
                    dialed_extension: channel
                        .dialplan
                        .map(|d| d.exten)
                        .filter(|e| !e.is_empty()),
                    connected_number: channel.connected.map(|c| c.number).filter(|n| !n.is_empty()),
                },
                None => fallback("StasisStart"),
            },
            "ChannelStateChange" => match parsed.channel {
                Some(channel) => AriEvent::ChannelStateChange {
                    channel_id: channel.id,
                    state: channel.state,
                },
                None => fallback("ChannelStateChange"),
            },
            "ChannelHangupRequest" => AriEvent::ChannelHangupRequest {
                channel_id: parsed
                    .channel
                    .map(|c| c.id)
                    .unwrap_or_default(),
                cause: parsed.cause,
                cause_txt: parsed.cause_txt,
            },
            "ChannelDestroyed" => AriEvent::ChannelDestroyed {
                channel_id: parsed
                    .channel
                    .map(|c| c.id)
                    .unwrap_or_default(),
                cause: parsed.cause,
                cause_txt: parsed.cause_txt,
            },
            "StasisEnd" => AriEvent::StasisEnd {
                channel_id: parsed
                    .channel
                    .map(|c| c.id)
                    .unwrap_or_default(),
            },
            "PlaybackStarted" => match parsed.playback {
                Some(playback) => AriEvent::PlaybackStarted {
                    playback_id: playback.id,
                    target_uri: playback.target_uri,
                },
                None => fallback("PlaybackStarted"),
            },
            "PlaybackFinished" => AriEvent::PlaybackFinished {
                playback_id: parsed
                    .playback
                    .map(|p| p.id)
                    .unwrap_or_default(),
            },
            "RecordingFinished" => AriEvent::RecordingFinished {
                recording_name: parsed
                    .recording
                    .map(|r| r.name)
                    .unwrap_or_default(),
            },
            "RecordingFailed" => AriEvent::RecordingFailed {
                recording_name: parsed
                    .recording
                    .map(|r| r.name)
                    .unwrap_or_default(),
                cause: parsed.cause_txt,
            },
            other => AriEvent::Other {
                event_type: other.to_string(),
                raw: value,
            },
        })
    }
}
