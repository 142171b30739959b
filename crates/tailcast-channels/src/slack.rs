use futures::future::BoxFuture;
use tracing::{debug, info};

use tailcast_core::types::Destination;
use tailcast_core::{Result, TailcastError};

use crate::format;
use crate::publisher::{EditOutcome, OutboundMessage, Publisher};

const SLACK_API: &str = "https://slack.com/api";

/// Slack publisher over the Web API (`chat.postMessage` / `chat.update`).
/// Bodies are Block Kit; the plain `text` field doubles as the notification
/// fallback.
pub struct SlackPublisher {
    http: reqwest::Client,
    token: String,
}

impl SlackPublisher {
    pub fn new(token: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            token: token.to_string(),
        }
    }

    fn channel_of(destination: &Destination) -> Result<&str> {
        match destination {
            Destination::Slack { channel } => Ok(channel),
            other => Err(TailcastError::Publish {
                platform: "slack".into(),
                message: format!("not a slack destination: {other}"),
            }),
        }
    }

    async fn call(&self, method: &str, payload: serde_json::Value) -> Result<serde_json::Value> {
        let resp = self
            .http
            .post(format!("{SLACK_API}/{method}"))
            .bearer_auth(&self.token)
            .json(&payload)
            .send()
            .await
            .map_err(|e| TailcastError::Publish {
                platform: "slack".into(),
                message: format!("{method} failed: {e}"),
            })?;

        resp.json().await.map_err(|e| TailcastError::Publish {
            platform: "slack".into(),
            message: format!("invalid {method} response: {e}"),
        })
    }

    fn fallback_text(message: &OutboundMessage) -> String {
        let escaped = format::escape_slack(&message.text);
        format::split_text(&escaped, format::SLACK_SECTION_MAX).remove(0)
    }
}

impl Publisher for SlackPublisher {
    fn platform(&self) -> &'static str {
        "slack"
    }

    fn validate(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let body = self.call("auth.test", serde_json::json!({})).await?;
            if !body["ok"].as_bool().unwrap_or(false) {
                return Err(TailcastError::BadCredentials {
                    platform: "slack".into(),
                    message: body["error"].as_str().unwrap_or("unknown").to_string(),
                });
            }
            info!(
                team = body["team"].as_str().unwrap_or(""),
                bot = body["user"].as_str().unwrap_or(""),
                "Slack credentials validated"
            );
            Ok(())
        })
    }

    fn send(
        &self,
        destination: &Destination,
        message: &OutboundMessage,
    ) -> BoxFuture<'_, Result<String>> {
        let message = message.clone();
        let destination = destination.clone();

        Box::pin(async move {
            let channel = Self::channel_of(&destination)?;
            let body = self
                .call(
                    "chat.postMessage",
                    serde_json::json!({
                        "channel": channel,
                        "text": Self::fallback_text(&message),
                        "blocks": format::slack_blocks(&message),
                    }),
                )
                .await?;

            if !body["ok"].as_bool().unwrap_or(false) {
                return Err(TailcastError::Publish {
                    platform: "slack".into(),
                    message: format!(
                        "chat.postMessage error: {}",
                        body["error"].as_str().unwrap_or("unknown")
                    ),
                });
            }

            body["ts"]
                .as_str()
                .map(str::to_string)
                .ok_or_else(|| TailcastError::Publish {
                    platform: "slack".into(),
                    message: "no ts in postMessage response".into(),
                })
        })
    }

    fn edit(
        &self,
        destination: &Destination,
        message_id: &str,
        message: &OutboundMessage,
    ) -> BoxFuture<'_, Result<EditOutcome>> {
        let message = message.clone();
        let destination = destination.clone();
        let message_id = message_id.to_string();

        Box::pin(async move {
            let channel = Self::channel_of(&destination)?;
            let body = self
                .call(
                    "chat.update",
                    serde_json::json!({
                        "channel": channel,
                        "ts": message_id,
                        "text": Self::fallback_text(&message),
                        "blocks": format::slack_blocks(&message),
                    }),
                )
                .await?;

            if body["ok"].as_bool().unwrap_or(false) {
                return Ok(EditOutcome::Edited);
            }

            match body["error"].as_str().unwrap_or("unknown") {
                "message_not_found" => {
                    debug!(ts = %message_id, "Slack edit: message gone");
                    Ok(EditOutcome::NotFound)
                }
                error => Err(TailcastError::Publish {
                    platform: "slack".into(),
                    message: format!("chat.update error: {error}"),
                }),
            }
        })
    }

    fn close(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async { Ok(()) })
    }
}
