use crate::error::AlerterError;
use configuration::AlertSettings;
use core_types::{CommandPriority, CommandStatus, Severity};
use events::{Envelope, FanoutEvent};
use reqwest::Client;
use serde::Serialize;
use tokio::sync::broadcast;
pub mod error;

/// The JSON payload for the Telegram `sendMessage` endpoint.
#[derive(Debug, Serialize)]
struct SendMessagePayload<'a> {
    chat_id: &'a str,
    text: &'a str,
    parse_mode: &'a str,
}

/// A client for sending messages to the Telegram Bot API.
pub struct TelegramAlerter {
    client: Client,
    token: String,
    chat_id: String,
}

impl TelegramAlerter {
    /// Returns `None` when alerting is disabled or the token or chat id is
    /// missing, so the caller can simply skip the service.
    pub fn new(settings: &AlertSettings) -> Option<Self> {
        if !settings.enabled {
            return None;
        }
        match (
            settings.telegram_bot_token.as_deref().filter(|t| !t.is_empty()),
            settings.telegram_chat_id.as_deref().filter(|c| !c.is_empty()),
        ) {
            (Some(token), Some(chat_id)) => Some(Self {
                client: Client::new(),
                token: token.to_string(),
                chat_id: chat_id.to_string(),
            }),
            _ => {
                tracing::warn!("Telegram alerter is not configured (missing token or chat_id).");
                None
            }
        }
    }

    /// Sends a text message to the configured Telegram chat.
    pub async fn send_message(&self, message: &str) -> Result<(), AlerterError> {
        let url = format!("https://api.telegram.org/bot{}/sendMessage", self.token);

        let payload = SendMessagePayload {
            chat_id: &self.chat_id,
            text: message,
            parse_mode: "MarkdownV2",
        };

        let response = self.client.post(&url).json(&payload).send().await?;

        if !response.status().is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Failed to decode error response".to_string());
            return Err(AlerterError::ApiError(error_text));
        }

        Ok(())
    }
}

/// Decides whether an envelope on the bus deserves an alert, and formats it.
///
/// Alerts go out for emergency stops, critical risk updates and failed
/// URGENT commands. Everything else is ignored.
pub fn format_alert(envelope: &Envelope) -> Option<String> {
    match &envelope.event {
        FanoutEvent::EmergencyStop(notice) => Some(format!(
            "🛑 *EMERGENCY STOP* on `{}`\n{} executor\\(s\\) targeted\nReason: {}",
            escape_markdown(&envelope.channel.to_string()),
            notice.executor_count,
            escape_markdown(notice.reason.as_deref().unwrap_or("none given"))
        )),
        FanoutEvent::RiskUpdate(alert) if alert.risk_level == Severity::Critical => {
            let lines: Vec<String> = alert
                .violations
                .iter()
                .map(|v| format!("• {} {}", v.severity, escape_markdown(&v.message)))
                .collect();
            Some(format!(
                "🚨 *CRITICAL RISK* for `{}` \\(score {}\\)\n{}",
                escape_markdown(&alert.user_id.to_string()),
                alert.risk_score,
                lines.join("\n")
            ))
        }
        FanoutEvent::CommandStatus(update)
            if update.status == CommandStatus::Failed
                && update.priority == CommandPriority::Urgent =>
        {
            let reason = update
                .result
                .as_ref()
                .map(|r| r.to_string())
                .unwrap_or_else(|| "no result".to_string());
            Some(format!(
                "⚠️ *URGENT {} FAILED* on executor `{}`\n`{}`",
                escape_markdown(update.command.as_str()),
                escape_markdown(&update.executor_id.to_string()),
                escape_markdown(&reason)
            ))
        }
        _ => None,
    }
}

/// A long-running service that listens to every envelope on the fan-out bus
/// and sends Telegram alerts for the ones [`format_alert`] selects.
pub async fn run_alerter_service(alerter: TelegramAlerter, mut event_rx: broadcast::Receiver<Envelope>) {
    tracing::info!("Alerter service started. Listening for critical events.");

    let _ = alerter.send_message("✅ *Warden control plane started*").await;

    loop {
        match event_rx.recv().await {
            Ok(envelope) => {
                if let Some(msg) = format_alert(&envelope) {
                    if let Err(e) = alerter.send_message(&msg).await {
                        tracing::error!(error = ?e, "Failed to send Telegram alert.");
                    }
                }
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::warn!("Alerter service lagged, skipped {} messages.", n);
            }
            Err(broadcast::error::RecvError::Closed) => {
                tracing::error!("Broadcast channel closed. Alerter service shutting down.");
                break;
            }
        }
    }
}

/// Escapes characters that have special meaning in Telegram's MarkdownV2.
fn escape_markdown(text: &str) -> String {
    let special_chars = r"_*[]()~`>#+-=|{}.!";
    text.chars().fold(String::with_capacity(text.len()), |mut s, c| {
        if special_chars.contains(c) {
            s.push('\\');
        }
        s.push(c);
        s
    })
}
