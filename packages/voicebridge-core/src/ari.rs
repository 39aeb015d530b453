//! Asterisk REST Interface client.
//!
//! Two halves: a thin REST command surface over `reqwest` (MOH, dialplan
//! continue, originate, playback, bridges) and the event WebSocket that
//! drives the engine (`StasisStart`, `StasisEnd`, `ChannelDtmfReceived`,
//! `PlaybackFinished`). The event loop reconnects on failure with the
//! shared bounded backoff schedule; individual command failures surface as
//! [`AriError`] and never tear the engine down.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use crate::config::AriSettings;
use crate::error::{AriError, AriResult};

/// Reconnect schedule shared by every long-lived wire connection: quick
/// retries first, then a steady 30 s cadence (~157 s total).
pub const RECONNECT_BACKOFF_SECS: [u64; 8] = [2, 5, 10, 20, 30, 30, 30, 30];

/// Events the engine consumes from the ARI WebSocket.
#[derive(Debug, Clone, PartialEq)]
pub enum AriEvent {
    StasisStart {
        channel_id: String,
        channel_name: String,
        caller_number: Option<String>,
        args: Vec<String>,
    },
    StasisEnd {
        channel_id: String,
    },
    ChannelDtmfReceived {
        channel_id: String,
        digit: char,
    },
    PlaybackFinished {
        playback_id: String,
    },
    ChannelDestroyed {
        channel_id: String,
    },
    /// Anything the engine does not route explicitly.
    Other {
        event_type: String,
    },
}

impl AriEvent {
    /// Maps a raw ARI JSON event into the typed enum.
    ///
    /// Returns `None` for frames without a `type` field.
    pub fn from_json(value: &Value) -> Option<Self> {
        let event_type = value.get("type")?.as_str()?;
        let channel_id = |v: &Value| {
            v.get("channel")
                .and_then(|c| c.get("id"))
                .and_then(Value::as_str)
                .map(str::to_string)
        };
        Some(match event_type {
            "StasisStart" => Self::StasisStart {
                channel_id: channel_id(value)?,
                channel_name: value
                    .get("channel")
                    .and_then(|c| c.get("name"))
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                caller_number: value
                    .get("channel")
                    .and_then(|c| c.get("caller"))
                    .and_then(|c| c.get("number"))
                    .and_then(Value::as_str)
                    .map(str::to_string),
                args: value
                    .get("args")
                    .and_then(Value::as_array)
                    .map(|args| {
                        args.iter()
                            .filter_map(Value::as_str)
                            .map(str::to_string)
                            .collect()
                    })
                    .unwrap_or_default(),
            },
            "StasisEnd" => Self::StasisEnd {
                channel_id: channel_id(value)?,
            },
            "ChannelDtmfReceived" => Self::ChannelDtmfReceived {
                channel_id: channel_id(value)?,
                digit: value
                    .get("digit")
                    .and_then(Value::as_str)
                    .and_then(|d| d.chars().next())?,
            },
            "PlaybackFinished" => Self::PlaybackFinished {
                playback_id: value
                    .get("playback")
                    .and_then(|p| p.get("id"))
                    .and_then(Value::as_str)?
                    .to_string(),
            },
            "ChannelDestroyed" => Self::ChannelDestroyed {
                channel_id: channel_id(value)?,
            },
            other => Self::Other {
                event_type: other.to_string(),
            },
        })
    }
}

/// ARI REST + WebSocket client.
#[derive(Clone)]
pub struct AriClient {
    http: reqwest::Client,
    settings: AriSettings,
}

impl AriClient {
    pub fn new(settings: AriSettings) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self { http, settings }
    }

    pub fn app_name(&self) -> &str {
        &self.settings.app_name
    }

    /// Low-level ARI command. `params` become the query string, `body`
    /// (when given) the JSON payload.
    pub async fn send_command(
        &self,
        method: reqwest::Method,
        resource: &str,
        params: &[(&str, String)],
        body: Option<Value>,
    ) -> AriResult<Value> {
        let url = format!("{}/{resource}", self.settings.base_url.trim_end_matches('/'));
        let mut request = self
            .http
            .request(method, &url)
            .basic_auth(&self.settings.username, Some(&self.settings.password))
            .query(params);
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(AriError::Status {
                status: status.as_u16(),
                body: text,
            });
        }
        if text.is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(&text)?)
    }

    pub async fn answer(&self, channel_id: &str) -> AriResult<()> {
        self.send_command(
            reqwest::Method::POST,
            &format!("channels/{channel_id}/answer"),
            &[],
            None,
        )
        .await
        .map(|_| ())
    }

    pub async fn hangup_channel(&self, channel_id: &str) -> AriResult<()> {
        self.send_command(
            reqwest::Method::DELETE,
            &format!("channels/{channel_id}"),
            &[],
            None,
        )
        .await
        .map(|_| ())
    }

    pub async fn start_moh(&self, channel_id: &str, moh_class: &str) -> AriResult<()> {
        self.send_command(
            reqwest::Method::POST,
            &format!("channels/{channel_id}/moh"),
            &[("mohClass", moh_class.to_string())],
            None,
        )
        .await
        .map(|_| ())
    }

    pub async fn stop_moh(&self, channel_id: &str) -> AriResult<()> {
        self.send_command(
            reqwest::Method::DELETE,
            &format!("channels/{channel_id}/moh"),
            &[],
            None,
        )
        .await
        .map(|_| ())
    }

    /// Leaves Stasis into the dialplan at context/extension/priority.
    pub async fn continue_to_dialplan(
        &self,
        channel_id: &str,
        context: &str,
        extension: &str,
        priority: u32,
    ) -> AriResult<()> {
        self.send_command(
            reqwest::Method::POST,
            &format!("channels/{channel_id}/continue"),
            &[
                ("context", context.to_string()),
                ("extension", extension.to_string()),
                ("priority", priority.to_string()),
            ],
            None,
        )
        .await
        .map(|_| ())
    }

    /// Originates a new channel into this application; returns its id.
    pub async fn originate(
        &self,
        endpoint: &str,
        caller_id: &str,
        timeout_seconds: u64,
        app_args: &str,
        variables: Value,
    ) -> AriResult<String> {
        let result = self
            .send_command(
                reqwest::Method::POST,
                "channels",
                &[
                    ("app", self.settings.app_name.clone()),
                    ("appArgs", app_args.to_string()),
                ],
                Some(json!({
                    "endpoint": endpoint,
                    "callerId": caller_id,
                    "timeout": timeout_seconds,
                    "variables": variables,
                })),
            )
            .await?;
        result
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| AriError::WebSocket("originate response missing channel id".into()))
    }

    /// Starts playback of a media URI on a channel; returns the playback id.
    pub async fn play_media(&self, channel_id: &str, media: &str) -> AriResult<String> {
        let result = self
            .send_command(
                reqwest::Method::POST,
                &format!("channels/{channel_id}/play"),
                &[("media", media.to_string())],
                None,
            )
            .await?;
        result
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| AriError::WebSocket("play response missing playback id".into()))
    }

    pub async fn create_bridge(&self, bridge_type: &str) -> AriResult<String> {
        let result = self
            .send_command(
                reqwest::Method::POST,
                "bridges",
                &[("type", bridge_type.to_string())],
                None,
            )
            .await?;
        result
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| AriError::WebSocket("bridge response missing id".into()))
    }

    pub async fn add_channel_to_bridge(&self, bridge_id: &str, channel_id: &str) -> AriResult<()> {
        self.send_command(
            reqwest::Method::POST,
            &format!("bridges/{bridge_id}/addChannel"),
            &[("channel", channel_id.to_string())],
            None,
        )
        .await
        .map(|_| ())
    }

    pub async fn destroy_bridge(&self, bridge_id: &str) -> AriResult<()> {
        self.send_command(
            reqwest::Method::DELETE,
            &format!("bridges/{bridge_id}"),
            &[],
            None,
        )
        .await
        .map(|_| ())
    }

    /// WebSocket URL for the event stream.
    fn events_url(&self) -> String {
        let ws_base = self
            .settings
            .base_url
            .trim_end_matches('/')
            .replacen("https://", "wss://", 1)
            .replacen("http://", "ws://", 1);
        format!(
            "{ws_base}/events?app={}&api_key={}:{}&subscribeAll=true",
            self.settings.app_name, self.settings.username, self.settings.password
        )
    }

    /// Runs the event WebSocket until cancelled, pushing typed events into
    /// `tx`. Connection loss retries on [`RECONNECT_BACKOFF_SECS`]; after
    /// the schedule is exhausted the loop ends and the engine shuts down.
    pub async fn run_events(&self, tx: mpsc::Sender<AriEvent>, cancel: CancellationToken) {
        let url = self.events_url();
        let mut backoff_idx: usize = 0;

        loop {
            if cancel.is_cancelled() {
                return;
            }
            let stream = tokio::select! {
                connected = connect_async(&url) => connected,
                () = cancel.cancelled() => return,
            };
            let (mut ws, _response) = match stream {
                Ok(ok) => ok,
                Err(e) => {
                    let Some(&delay) = RECONNECT_BACKOFF_SECS.get(backoff_idx) else {
                        log::error!("[Ari] Event WebSocket unreachable after retries: {e}");
                        return;
                    };
                    backoff_idx += 1;
                    log::warn!(
                        "[Ari] Event WebSocket connect failed (retry in {delay}s): {e}"
                    );
                    tokio::select! {
                        () = tokio::time::sleep(Duration::from_secs(delay)) => continue,
                        () = cancel.cancelled() => return,
                    }
                }
            };
            backoff_idx = 0;
            log::info!("[Ari] Event WebSocket connected");

            loop {
                let message = tokio::select! {
                    msg = ws.next() => msg,
                    () = cancel.cancelled() => {
                        let _ = ws.close(None).await;
                        return;
                    }
                };
                match message {
                    Some(Ok(Message::Text(text))) => {
                        let parsed: Value = match serde_json::from_str(&text) {
                            Ok(v) => v,
                            Err(e) => {
                                log::warn!("[Ari] Malformed event JSON: {e}");
                                continue;
                            }
                        };
                        if let Some(event) = AriEvent::from_json(&parsed) {
                            if tx.send(event).await.is_err() {
                                return;
                            }
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        let _ = ws.send(Message::Pong(payload)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        log::warn!("[Ari] Event WebSocket closed; reconnecting");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        log::warn!("[Ari] Event WebSocket error: {e}");
                        break;
                    }
                }
            }
        }
    }
}
