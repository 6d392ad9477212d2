//! Alert delivery channels.
//!
//! Every channel implements the same `deliver(subject, body) -> bool`
//! capability; the dispatcher fans an alert out to all configured channels.

use async_trait::async_trait;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, warn};
use watchdog_core::alert::Deliver;
use watchdog_core::models::{Alert, Severity};
use watchdog_core::settings::{AlertSettings, ChannelSettings};

const TELEGRAM_API: &str = "https://api.telegram.org";
const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

pub enum AlertChannel {
    Console,
    Telegram {
        client: reqwest::Client,
        bot_token: String,
        chat_id: String,
    },
    Email {
        to: String,
        from: Option<String>,
        sendmail: PathBuf,
    },
}

impl AlertChannel {
    pub fn from_settings(settings: &ChannelSettings) -> Self {
        match settings {
            ChannelSettings::Console => Self::Console,
            ChannelSettings::Telegram { bot_token, chat_id } => {
                let client = reqwest::Client::builder()
                    .user_agent("watchdog-service/0.1")
                    .timeout(HTTP_TIMEOUT)
                    .build()
                    .unwrap_or_else(|e| {
                        warn!(error = %e, "falling back to default http client");
                        reqwest::Client::new()
                    });
                Self::Telegram {
                    client,
                    bot_token: bot_token.clone(),
                    chat_id: chat_id.clone(),
                }
            }
            ChannelSettings::Email { to, from, sendmail } => Self::Email {
                to: to.clone(),
                from: from.clone(),
                sendmail: sendmail.clone(),
            },
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Console => "console",
            Self::Telegram { .. } => "telegram",
            Self::Email { .. } => "email",
        }
    }

    async fn send_telegram(
        client: &reqwest::Client,
        bot_token: &str,
        chat_id: &str,
        subject: &str,
        body: &str,
    ) -> Result<(), String> {
        let url = format!("{TELEGRAM_API}/bot{bot_token}/sendMessage");
        let text = format!(
            "<b>{}</b>\n<pre>{}</pre>",
            escape_html(subject),
            escape_html(body)
        );
        let res = client
            .post(url)
            .json(&json!({
                "chat_id": chat_id,
                "text": text,
                "parse_mode": "HTML",
            }))
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if res.status().is_success() {
            return Ok(());
        }
        Err(format!("telegram responded with status {}", res.status()))
    }

    async fn send_email(
        sendmail: &Path,
        to: &str,
        from: Option<&str>,
        subject: &str,
        body: &str,
    ) -> Result<(), String> {
        let message = compose_email(to, from, subject, body);
        let mut child = tokio::process::Command::new(sendmail)
            .arg("-t")
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| format!("spawn {}: {e}", sendmail.display()))?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(message.as_bytes())
                .await
                .map_err(|e| e.to_string())?;
        }
        let output = child.wait_with_output().await.map_err(|e| e.to_string())?;
        if output.status.success() {
            return Ok(());
        }
        Err(format!(
            "sendmail exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        ))
    }
}

#[async_trait]
impl Deliver for AlertChannel {
    async fn deliver(&self, subject: &str, body: &str) -> bool {
        let result = match self {
            Self::Console => {
                warn!(target: "watchdog::alert", %subject, "{body}");
                Ok(())
            }
            Self::Telegram {
                client,
                bot_token,
                chat_id,
            } => Self::send_telegram(client, bot_token, chat_id, subject, body).await,
            Self::Email { to, from, sendmail } => {
                Self::send_email(sendmail, to, from.as_deref(), subject, body).await
            }
        };
        match result {
            Ok(()) => {
                debug!(channel = self.name(), %subject, "alert delivered");
                true
            }
            Err(e) => {
                error!(channel = self.name(), %subject, error = %e, "alert delivery failed");
                false
            }
        }
    }
}

/// Fans alerts out to every configured channel at or above `min_severity`.
pub struct AlertDispatcher {
    channels: Vec<AlertChannel>,
    min_severity: Severity,
}

impl AlertDispatcher {
    pub fn new(channels: Vec<AlertChannel>, min_severity: Severity) -> Self {
        Self {
            channels,
            min_severity,
        }
    }

    pub fn from_settings(settings: &AlertSettings) -> Self {
        Self::new(
            settings
                .channels
                .iter()
                .map(AlertChannel::from_settings)
                .collect(),
            settings.min_severity,
        )
    }

    pub fn channel_names(&self) -> Vec<&'static str> {
        self.channels.iter().map(AlertChannel::name).collect()
    }
}

#[async_trait]
impl Deliver for AlertDispatcher {
    /// True only when every channel accepted the message.
    async fn deliver(&self, subject: &str, body: &str) -> bool {
        let mut all_ok = true;
        for channel in &self.channels {
            all_ok &= channel.deliver(subject, body).await;
        }
        all_ok
    }

    async fn deliver_alert(&self, alert: &Alert) -> bool {
        if alert.severity < self.min_severity {
            debug!(path = %alert.file_path, severity = alert.severity.as_str(), "alert below delivery threshold");
            return true;
        }
        self.deliver(&alert.subject(), &alert.body()).await
    }
}

fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

fn compose_email(to: &str, from: Option<&str>, subject: &str, body: &str) -> String {
    let mut message = String::new();
    if let Some(from) = from {
        message.push_str(&format!("From: {from}\n"));
    }
    message.push_str(&format!("To: {to}\n"));
    message.push_str(&format!("Subject: {}\n", subject.replace(['\r', '\n'], " ")));
    message.push_str("Content-Type: text/plain; charset=utf-8\n\n");
    message.push_str(body);
    message.push('\n');
    message
}
