//! Best-effort operator notifications.
//!
//! Delivery never blocks or fails the engine: [`Alerter`] spawns each
//! message onto the runtime and only logs transport failures.

use alloy::primitives::Address;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

const TELEGRAM_API: &str = "https://api.telegram.org";

/// Alert severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertLevel {
    Info,
    Success,
    Warning,
    Critical,
}

impl AlertLevel {
    fn emoji(self) -> &'static str {
        match self {
            AlertLevel::Info => "ℹ️",
            AlertLevel::Success => "✅",
            AlertLevel::Warning => "⚠️",
            AlertLevel::Critical => "🚨",
        }
    }
}

/// A single notification.
#[derive(Debug, Clone)]
pub struct Alert {
    pub level: AlertLevel,
    pub title: String,
    pub body: String,
    /// Leverage token the alert is about, if any
    pub token: Option<Address>,
    pub at: DateTime<Utc>,
}

impl Alert {
    pub fn new(level: AlertLevel, title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            level,
            title: title.into(),
            body: body.into(),
            token: None,
            at: Utc::now(),
        }
    }

    pub fn for_token(mut self, token: Address) -> Self {
        self.token = Some(token);
        self
    }

    /// Plain-text rendering used by chat transports.
    pub fn render(&self) -> String {
        let mut text = format!("{} {}\n{}", self.level.emoji(), self.title, self.body);
        if let Some(token) = self.token {
            text.push_str(&format!("\ntoken: {token}"));
        }
        text.push_str(&format!("\n{}", self.at.format("%Y-%m-%d %H:%M:%S UTC")));
        text
    }
}

/// Notification transport.
#[async_trait]
pub trait AlertSink: Send + Sync {
    fn name(&self) -> &str;

    async fn deliver(&self, alert: &Alert) -> Result<()>;
}

/// Writes alerts to the tracing log.
#[derive(Debug, Default, Clone)]
pub struct LogAlertSink;

#[async_trait]
impl AlertSink for LogAlertSink {
    fn name(&self) -> &str {
        "log"
    }

    async fn deliver(&self, alert: &Alert) -> Result<()> {
        let token = alert.token.map(|t| t.to_string()).unwrap_or_default();
        match alert.level {
            AlertLevel::Critical => error!(title = %alert.title, token = %token, "{}", alert.body),
            AlertLevel::Warning => warn!(title = %alert.title, token = %token, "{}", alert.body),
            AlertLevel::Info | AlertLevel::Success => {
                info!(title = %alert.title, token = %token, "{}", alert.body)
            }
        }
        Ok(())
    }
}

/// Telegram Bot API transport.
pub struct TelegramAlertSink {
    client: reqwest::Client,
    bot_token: String,
    chat_id: String,
    base_url: String,
}

impl std::fmt::Debug for TelegramAlertSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelegramAlertSink")
            .field("chat_id", &self.chat_id)
            .finish()
    }
}

#[derive(Serialize)]
struct SendMessage<'a> {
    chat_id: &'a str,
    text: &'a str,
    disable_web_page_preview: bool,
}

impl TelegramAlertSink {
    pub fn new(bot_token: impl Into<String>, chat_id: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            bot_token: bot_token.into(),
            chat_id: chat_id.into(),
            base_url: TELEGRAM_API.to_string(),
        })
    }

    /// Point at a different API host (tests, self-hosted bot API).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn endpoint(&self) -> String {
        format!("{}/bot{}/sendMessage", self.base_url, self.bot_token)
    }
}

#[async_trait]
impl AlertSink for TelegramAlertSink {
    fn name(&self) -> &str {
        "telegram"
    }

    async fn deliver(&self, alert: &Alert) -> Result<()> {
        let text = alert.render();
        let body = SendMessage {
            chat_id: &self.chat_id,
            text: &text,
            disable_web_page_preview: true,
        };

        let response = self.client.post(self.endpoint()).json(&body).send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Telegram API error: {} - {}", status, body);
        }
        Ok(())
    }
}

/// Fire-and-forget fan-out to every configured sink.
#[derive(Clone)]
pub struct Alerter {
    sinks: Vec<Arc<dyn AlertSink>>,
}

impl std::fmt::Debug for Alerter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.sinks.iter().map(|s| s.name()).collect();
        f.debug_struct("Alerter").field("sinks", &names).finish()
    }
}

impl Alerter {
    pub fn new(sinks: Vec<Arc<dyn AlertSink>>) -> Self {
        Self { sinks }
    }

    /// Log-only alerter.
    pub fn log_only() -> Self {
        Self::new(vec![Arc::new(LogAlertSink)])
    }

    /// Queue `alert` for delivery. Must be called inside a tokio runtime.
    pub fn send(&self, alert: Alert) {
        let sinks = self.sinks.clone();
        tokio::spawn(async move {
            Self::deliver_all(&sinks, &alert).await;
        });
    }

    /// Deliver to every sink, swallowing failures.
    pub async fn deliver_all(sinks: &[Arc<dyn AlertSink>], alert: &Alert) {
        for sink in sinks {
            if let Err(e) = sink.deliver(alert).await {
                warn!(sink = sink.name(), title = %alert.title, error = %e, "Alert delivery failed");
            }
        }
    }
}
