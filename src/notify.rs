//! Slack delivery of up/down messages.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info};

use crate::models::ProbeResult;

pub const SLACK_API: &str = "https://slack.com/api";

/// Bound on a single Slack API call, so a hung API cannot hold up a cycle.
pub const SLACK_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("slack request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("slack rejected the call: {0}")]
    Api(String),

    #[error("delivery failed for {failed} of {total} channels")]
    Partial { failed: usize, total: usize },
}

/// Delivers a result to the destinations configured on its target.
pub trait Notifier: Send + Sync + 'static {
    fn notify(&self, result: &ProbeResult) -> impl Future<Output = Result<(), NotifyError>> + Send;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Attachment {
    pub title: String,
    pub fallback: String,
    pub text: String,
    pub color: &'static str,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SlackMessage {
    pub channel: String,
    pub username: String,
    pub icon_emoji: &'static str,
    pub attachments: Vec<Attachment>,
}

#[derive(Debug, Deserialize)]
struct SlackResponse {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    ts: Option<String>,
    #[serde(default)]
    profile: Option<SlackProfile>,
}

#[derive(Debug, Deserialize)]
struct SlackProfile {
    #[serde(default)]
    display_name: String,
}

impl SlackResponse {
    fn into_result(self) -> Result<Self, NotifyError> {
        if self.ok {
            Ok(self)
        } else {
            Err(NotifyError::Api(self.error.unwrap_or_else(|| "unknown_error".into())))
        }
    }
}

/// Builds the message for one channel.
pub fn render(result: &ProbeResult, channel: &str, username: &str) -> SlackMessage {
    let name = &result.target.name;
    let (title, mut text, emoji, color) = if result.status {
        (format!(":ok: \"{name}\" is up"), String::new(), ":ok:", "#22E722")
    } else {
        (
            format!(":no_entry: \"{name}\" is down"),
            format!("`{}`", result.message),
            ":no_entry:",
            "#E72222",
        )
    };

    let mentions = &result.target.notify.mentions;
    if !mentions.is_empty() {
        if !text.is_empty() {
            text.push('\n');
        }
        let tags: Vec<String> = mentions.iter().map(|m| format!("<@{m}>")).collect();
        text.push_str(&tags.join(", "));
    }

    SlackMessage {
        channel: channel.to_string(),
        username: username.to_string(),
        icon_emoji: emoji,
        attachments: vec![Attachment {
            fallback: title.clone(),
            title,
            text,
            color,
        }],
    }
}

pub struct SlackNotifier {
    http: reqwest::Client,
    token: String,
    username: String,
    api_base: String,
}

impl SlackNotifier {
    pub fn new(token: impl Into<String>, username: impl Into<String>) -> Result<Self, NotifyError> {
        Self::with_api_base(token, username, SLACK_API, SLACK_TIMEOUT)
    }

    pub fn with_api_base(
        token: impl Into<String>,
        username: impl Into<String>,
        api_base: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, NotifyError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            token: token.into(),
            username: username.into(),
            api_base: api_base.into().trim_end_matches('/').to_string(),
        })
    }

    /// Checks the token by fetching the bot's own profile.
    pub async fn connect(&self) -> Result<String, NotifyError> {
        let resp: SlackResponse = self
            .http
            .get(format!("{}/users.profile.get", self.api_base))
            .bearer_auth(&self.token)
            .send()
            .await?
            .json()
            .await?;
        let profile = resp.into_result()?.profile;
        let name = profile.map(|p| p.display_name).unwrap_or_default();
        info!(display_name = %name, "slack connected");
        Ok(name)
    }

    async fn post(&self, message: &SlackMessage) -> Result<Option<String>, NotifyError> {
        let resp: SlackResponse = self
            .http
            .post(format!("{}/chat.postMessage", self.api_base))
            .bearer_auth(&self.token)
            .json(message)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(resp.into_result()?.ts)
    }
}

impl Notifier for SlackNotifier {
    async fn notify(&self, result: &ProbeResult) -> Result<(), NotifyError> {
        let channels = &result.target.notify.channels;
        let mut failed = 0;

        for channel in channels {
            let message = render(result, channel, &self.username);
            match self.post(&message).await {
                Ok(ts) => info!(%channel, ts = ts.as_deref().unwrap_or("-"), "slack message sent"),
                Err(e) => {
                    error!(%channel, error = %e, "unable to send slack message");
                    failed += 1;
                }
            }
        }

        if failed > 0 {
            return Err(NotifyError::Partial {
                failed,
                total: channels.len(),
            });
        }
        Ok(())
    }
}
