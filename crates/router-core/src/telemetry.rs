//! Out-of-band operator alerting.
//!
//! Delivery is best-effort and never on the request path; failures to
//! notify are logged and swallowed. No business logic may depend on
//! notification outcome.

use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::AlertsConfig;

/// Alert severity, used as a message prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "INFO",
            Severity::Warning => "WARNING",
            Severity::Critical => "CRITICAL",
        }
    }
}

/// Out-of-band notifier contract.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, severity: Severity, subject: &str, body: &str);
}

/// Fallback notifier that writes alerts to the log stream.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, severity: Severity, subject: &str, body: &str) {
        warn!(
            severity = severity.as_str(),
            subject = %subject,
            body = %body,
            "alert"
        );
    }
}

/// Telegram Bot API notifier.
pub struct TelegramNotifier {
    http: reqwest::Client,
    bot_token: String,
    chat_id: String,
}

impl TelegramNotifier {
    pub fn new(bot_token: String, chat_id: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            bot_token,
            chat_id,
        }
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn notify(&self, severity: Severity, subject: &str, body: &str) {
        let url = format!("https://api.telegram.org/bot{}/sendMessage", self.bot_token);
        let text = format!("[{}] {}\n{}", severity.as_str(), subject, body);
        let payload = serde_json::json!({
            "chat_id": self.chat_id,
            "text": text,
        });

        match self.http.post(&url).json(&payload).send().await {
            Ok(resp) if resp.status().is_success() => {
                debug!(subject = %subject, "alert delivered");
            }
            Ok(resp) => {
                warn!(
                    subject = %subject,
                    status = %resp.status(),
                    "telegram rejected alert"
                );
            }
            Err(e) => {
                warn!(subject = %subject, error = %e, "failed to deliver alert");
            }
        }
    }
}

/// Build the configured notifier, falling back to logs when Telegram is not
/// fully configured.
pub fn notifier_from_config(alerts: &AlertsConfig) -> Arc<dyn Notifier> {
    match (&alerts.telegram_bot_token, &alerts.telegram_chat_id) {
        (Some(token), Some(chat_id)) => {
            Arc::new(TelegramNotifier::new(token.clone(), chat_id.clone()))
        }
        _ => Arc::new(LogNotifier),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_falls_back_to_log_notifier() {
        let alerts = AlertsConfig::default();
        // Just exercises the selection logic; LogNotifier has no observable
        // side effects beyond the log stream.
        let _ = notifier_from_config(&alerts);

        let alerts = AlertsConfig {
            telegram_bot_token: Some("token".to_string()),
            telegram_chat_id: None,
        };
        let _ = notifier_from_config(&alerts);
    }
}
