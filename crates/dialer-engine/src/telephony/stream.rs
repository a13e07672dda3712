//! Reconnecting ARI websocket event consumer.
//!
//! Grounded in `session-core/src/coordinator/event_handler.rs`'s
//! `run_event_loop`: subscribe, `while let Ok(event) = ...`, dispatch.
//! Here the subscription is a websocket instead of an in-process bus, so
//! a bounded-backoff reconnect loop wraps it.

use std::time::Duration;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use super::events::AriEvent;
use crate::config::AriSettings;

pub struct AriEventStream {
    ws_url: String,
    app_name: String,
    username: String,
    password: String,
}

impl AriEventStream {
    pub fn new(settings: &AriSettings) -> AriEventStream {
        AriEventStream {
            ws_url: settings.ws_url.clone(),
            app_name: settings.app_name.clone(),
            username: settings.username.clone(),
            password: settings.password.clone(),
        }
    }

    fn connect_url(&self) -> String {
        format!(
            "{}?app={}&api_key={}:{}&subscribeAll=true",
            self.ws_url, self.app_name, self.username, self.password
        )
    }

    /// Runs until `stop` fires, reconnecting with exponential backoff
    /// (1s, 2s, 4s, ... capped at 30s) whenever the socket drops. Parsed
    /// events are pushed onto `tx`; a send failure (receiver dropped)
    /// ends the loop.
    pub async fn run(
        self,
        tx: mpsc::Sender<AriEvent>,
        mut stop: tokio::sync::watch::Receiver<bool>,
    ) {
        let mut backoff = Duration::from_secs(1);
        const MAX_BACKOFF: Duration = Duration::from_secs(30);

        loop {
            if *stop.borrow() {
                return;
            }
            info!(url = %self.ws_url, "connecting to ARI event stream");
            match tokio_tungstenite::connect_async(self.connect_url()).await {
                Ok((socket, _resp)) => {
                    backoff = Duration::from_secs(1);
                    let (_write, mut read) = socket.split();
                    loop {
                        tokio::select! {
                            _ = stop.changed() => {
                                if *stop.borrow() {
                                    return;
                                }
                            }
                            msg = read.next() => {
                                match msg {
                                    Some(Ok(Message::Text(text))) => {
                                        match AriEvent::parse(&text) {
                                            Ok(event) => {
                                                if tx.send(event).await.is_err() {
                                                    return;
                                                }
                                            }
                                            Err(e) => warn!(error = %e, "unparseable ARI event"),
                                        }
                                    }
                                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                                    Some(Ok(Message::Close(frame))) => {
                                        debug!(?frame, "ARI event stream closed by server");
                                        break;
                                    }
                                    Some(Ok(_)) => {}
                                    Some(Err(e)) => {
                                        error!(error = %e, "ARI event stream error");
                                        break;
                                    }
                                    None => break,
                                }
                            }
                        }
                    }
                }
                Err(e) => {
                    error!(error = %e, backoff_secs = backoff.as_secs(), "failed to connect to ARI event stream");
                }
            }

            if *stop.borrow() {
                return;
            }
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }
}
