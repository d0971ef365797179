//! Typed RPC facade over the external pool service.
//!
//! The pool owns broker connections, streaming, and order execution; this
//! client owns error classification and per-account outcome tracking. A
//! transport failure is never collapsed into an empty result.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::breaker::BreakerRegistry;
use crate::error::{PoolError, PoolResult};
use crate::telemetry::{Notifier, Severity};
use crate::types::{AccountInfo, CloseResult, HistoricalTrade, Position, Side, TradeResult};

/// Request to open a position on a destination account.
#[derive(Debug, Clone, Serialize)]
pub struct ExecuteTradeRequest {
    pub account_id: String,
    pub region: String,
    pub symbol: String,
    pub action: Side,
    #[serde(with = "rust_decimal::serde::float")]
    pub volume: Decimal,
    #[serde(
        with = "rust_decimal::serde::float_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub stop_loss: Option<Decimal>,
    #[serde(
        with = "rust_decimal::serde::float_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub take_profit: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

/// Pool service operations used by the router.
#[async_trait]
pub trait PoolApi: Send + Sync {
    async fn account_info(&self, account_id: &str, region: &str) -> PoolResult<AccountInfo>;

    /// Current open positions. Empty list only on success; a transport
    /// failure surfaces as `PoolError::Transport`.
    async fn positions(&self, account_id: &str, region: &str) -> PoolResult<Vec<Position>>;

    async fn execute_trade(&self, request: &ExecuteTradeRequest) -> PoolResult<TradeResult>;

    async fn modify_position(
        &self,
        account_id: &str,
        region: &str,
        position_id: &str,
        stop_loss: Option<Decimal>,
        take_profit: Option<Decimal>,
    ) -> PoolResult<()>;

    async fn close_position(
        &self,
        account_id: &str,
        region: &str,
        position_id: &str,
    ) -> PoolResult<CloseResult>;

    /// Recent trade history, best-effort.
    async fn history(
        &self,
        account_id: &str,
        days: u32,
        limit: u32,
    ) -> PoolResult<Vec<HistoricalTrade>>;
}

/// HTTP/JSON client for the pool service with per-account failure tracking.
pub struct PoolClient {
    base_url: String,
    http: reqwest::Client,
    breakers: Arc<BreakerRegistry>,
    notifier: Arc<dyn Notifier>,
    nicknames: RwLock<HashMap<String, String>>,
}

impl PoolClient {
    pub fn new(
        base_url: impl Into<String>,
        timeout: Duration,
        breakers: Arc<BreakerRegistry>,
        notifier: Arc<dyn Notifier>,
    ) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http,
            breakers,
            notifier,
            nicknames: RwLock::new(HashMap::new()),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn breakers(&self) -> Arc<BreakerRegistry> {
        Arc::clone(&self.breakers)
    }

    /// Refresh the account id -> nickname table used in alerts. Called at
    /// startup and on config reload.
    pub fn set_nicknames(&self, names: HashMap<String, String>) {
        if let Ok(mut table) = self.nicknames.write() {
            *table = names;
        }
    }

    /// Ask the pool to POST to `callback_url` whenever a broker resync
    /// happens, so snapshots refresh without waiting for the next tick.
    pub async fn register_reconnection_callback(&self, callback_url: &str) -> PoolResult<()> {
        let url = format!("{}/streaming/register-reconnection-callback", self.base_url);
        let body = serde_json::json!({ "url": callback_url });
        let resp = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(classify_send_error)?;
        read_json::<AckResponse>(resp).await?;
        Ok(())
    }

    fn nickname(&self, account_id: &str) -> String {
        self.nicknames
            .read()
            .ok()
            .and_then(|table| table.get(account_id).cloned())
            .unwrap_or_else(|| account_id.to_string())
    }

    /// Record the per-account outcome of a call and emit a (rate-limited)
    /// alert when a failure streak crosses the threshold. Alerts are
    /// dispatched off the request path.
    fn track<T>(&self, account_id: &str, result: PoolResult<T>) -> PoolResult<T> {
        match &result {
            Ok(_) => self.breakers.record_success(account_id),
            Err(e) if e.counts_for_breaker() => {
                if self.breakers.record_failure(account_id) {
                    let nickname = self.nickname(account_id);
                    let failures = self
                        .breakers
                        .state(account_id)
                        .map(|s| s.consecutive_failures)
                        .unwrap_or_default();
                    let body = format!(
                        "{} consecutive pool call failures for account {} ({}): {}",
                        failures, nickname, account_id, e
                    );
                    let notifier = Arc::clone(&self.notifier);
                    tokio::spawn(async move {
                        notifier
                            .notify(Severity::Warning, "pool connectivity degraded", &body)
                            .await;
                    });
                }
            }
            // Broker-level rejections mean the pool answered: the account's
            // connectivity is fine.
            Err(PoolError::Rejected { .. }) | Err(PoolError::UnknownPosition) => {
                self.breakers.record_success(account_id)
            }
            Err(_) => {}
        }
        result
    }

    async fn get_json<T: DeserializeOwned>(&self, url: String) -> PoolResult<T> {
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(classify_send_error)?;
        read_json(resp).await
    }

    async fn post_json<B: Serialize, T: DeserializeOwned>(
        &self,
        url: String,
        body: &B,
    ) -> PoolResult<T> {
        let resp = self
            .http
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(classify_send_error)?;
        read_json(resp).await
    }
}

#[async_trait]
impl PoolApi for PoolClient {
    async fn account_info(&self, account_id: &str, region: &str) -> PoolResult<AccountInfo> {
        let url = format!(
            "{}/account/{}?region={}",
            self.base_url, account_id, region
        );
        let result = self.get_json::<AccountInfo>(url).await;
        self.track(account_id, result)
    }

    async fn positions(&self, account_id: &str, region: &str) -> PoolResult<Vec<Position>> {
        let url = format!(
            "{}/positions/{}?region={}",
            self.base_url, account_id, region
        );
        let result = self
            .get_json::<PositionsResponse>(url)
            .await
            .map(|r| r.positions);
        self.track(account_id, result)
    }

    async fn execute_trade(&self, request: &ExecuteTradeRequest) -> PoolResult<TradeResult> {
        let url = format!("{}/trade/execute", self.base_url);
        let result = match self.post_json::<_, ExecuteResponse>(url, request).await {
            Ok(resp) if resp.success => resp.result.ok_or_else(|| {
                PoolError::transport("trade accepted but result missing from response")
            }),
            Ok(resp) => Err(PoolError::Rejected {
                status: 200,
                message: resp.error.unwrap_or_else(|| "trade rejected".to_string()),
            }),
            Err(e) => Err(e),
        };
        debug!(
            account = %request.account_id,
            symbol = %request.symbol,
            action = %request.action,
            success = result.is_ok(),
            "executeTrade"
        );
        self.track(&request.account_id, result)
    }

    async fn modify_position(
        &self,
        account_id: &str,
        region: &str,
        position_id: &str,
        stop_loss: Option<Decimal>,
        take_profit: Option<Decimal>,
    ) -> PoolResult<()> {
        let url = format!("{}/position/modify", self.base_url);
        let body = ModifyBody {
            account_id,
            region,
            position_id,
            stop_loss,
            take_profit,
        };
        let result = match self.post_json::<_, AckResponse>(url, &body).await {
            Ok(resp) if resp.success => Ok(()),
            Ok(resp) => Err(reject_or_unknown(
                200,
                resp.error.unwrap_or_else(|| "modify rejected".to_string()),
            )),
            Err(e) => Err(map_unknown_position(e)),
        };
        self.track(account_id, result)
    }

    async fn close_position(
        &self,
        account_id: &str,
        region: &str,
        position_id: &str,
    ) -> PoolResult<CloseResult> {
        let url = format!("{}/position/close", self.base_url);
        let body = CloseBody {
            account_id,
            region,
            position_id,
        };
        let result = match self.post_json::<_, CloseResponse>(url, &body).await {
            Ok(resp) if resp.success => Ok(CloseResult {
                profit: resp.profit.unwrap_or_default(),
                order_id: resp.order_id.unwrap_or_default(),
            }),
            Ok(resp) => Err(reject_or_unknown(
                200,
                resp.error.unwrap_or_else(|| "close rejected".to_string()),
            )),
            Err(e) => Err(map_unknown_position(e)),
        };
        if let Err(e) = &result {
            warn!(
                account = %account_id,
                position = %position_id,
                error = %e,
                "closePosition failed"
            );
        }
        self.track(account_id, result)
    }

    async fn history(
        &self,
        account_id: &str,
        days: u32,
        limit: u32,
    ) -> PoolResult<Vec<HistoricalTrade>> {
        let url = format!(
            "{}/history/{}?days={}&limit={}",
            self.base_url, account_id, days, limit
        );
        let result = self
            .get_json::<HistoryResponse>(url)
            .await
            .map(|r| r.trades);
        self.track(account_id, result)
    }
}

// Wire envelopes.

#[derive(Debug, Deserialize)]
struct PositionsResponse {
    positions: Vec<Position>,
}

#[derive(Debug, Deserialize)]
struct ExecuteResponse {
    success: bool,
    #[serde(default)]
    result: Option<TradeResult>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AckResponse {
    success: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CloseResponse {
    success: bool,
    #[serde(default, with = "rust_decimal::serde::float_option")]
    profit: Option<Decimal>,
    #[serde(default)]
    order_id: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct HistoryResponse {
    #[serde(default)]
    trades: Vec<HistoricalTrade>,
}

#[derive(Debug, Serialize)]
struct ModifyBody<'a> {
    account_id: &'a str,
    region: &'a str,
    position_id: &'a str,
    #[serde(with = "rust_decimal::serde::float_option")]
    stop_loss: Option<Decimal>,
    #[serde(with = "rust_decimal::serde::float_option")]
    take_profit: Option<Decimal>,
}

#[derive(Debug, Serialize)]
struct CloseBody<'a> {
    account_id: &'a str,
    region: &'a str,
    position_id: &'a str,
}

fn classify_send_error(e: reqwest::Error) -> PoolError {
    if e.is_connect() {
        PoolError::connection_refused(e.to_string())
    } else {
        PoolError::transport(e.to_string())
    }
}

async fn read_json<T: DeserializeOwned>(resp: reqwest::Response) -> PoolResult<T> {
    let status = resp.status();
    if status.is_success() {
        return resp
            .json::<T>()
            .await
            .map_err(|e| PoolError::transport(format!("invalid response body: {e}")));
    }

    let body = resp.text().await.unwrap_or_default();
    Err(classify_status(status, body))
}

fn classify_status(status: StatusCode, body: String) -> PoolError {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        PoolError::transport(format!("pool returned {status}: {body}"))
    } else {
        PoolError::Rejected {
            status: status.as_u16(),
            message: body,
        }
    }
}

/// Broker phrasing for "no such position" varies; match the common forms.
fn is_unknown_position_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("position not found")
        || lower.contains("unknown position")
        || lower.contains("no such position")
        || lower.contains("position_not_found")
}

fn reject_or_unknown(status: u16, message: String) -> PoolError {
    if is_unknown_position_message(&message) {
        PoolError::UnknownPosition
    } else {
        PoolError::Rejected { status, message }
    }
}

fn map_unknown_position(e: PoolError) -> PoolError {
    match e {
        PoolError::Rejected { status, message }
            if status == 404 || is_unknown_position_message(&message) =>
        {
            PoolError::UnknownPosition
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_status() {
        assert!(classify_status(StatusCode::INTERNAL_SERVER_ERROR, String::new()).is_retryable());
        assert!(classify_status(StatusCode::BAD_GATEWAY, String::new()).is_retryable());
        assert!(classify_status(StatusCode::TOO_MANY_REQUESTS, String::new()).is_retryable());
        assert!(!classify_status(StatusCode::BAD_REQUEST, "invalid volume".into()).is_retryable());
    }

    #[test]
    fn test_unknown_position_mapping() {
        let e = map_unknown_position(PoolError::Rejected {
            status: 404,
            message: "gone".into(),
        });
        assert!(matches!(e, PoolError::UnknownPosition));

        let e = map_unknown_position(PoolError::Rejected {
            status: 400,
            message: "Position not found: #555".into(),
        });
        assert!(matches!(e, PoolError::UnknownPosition));

        let e = map_unknown_position(PoolError::Rejected {
            status: 400,
            message: "market closed".into(),
        });
        assert!(matches!(e, PoolError::Rejected { .. }));
    }

    #[test]
    fn test_execute_request_serializes_snake_case() {
        let request = ExecuteTradeRequest {
            account_id: "D1".into(),
            region: "london".into(),
            symbol: "XAUUSDm".into(),
            action: Side::Buy,
            volume: Decimal::new(20, 2),
            stop_loss: None,
            take_profit: None,
            comment: Some("cp-abc".into()),
        };

        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["action"], "BUY");
        assert_eq!(json["account_id"], "D1");
        assert!(json.get("stop_loss").is_none());
        assert_eq!(json["volume"], 0.2);
    }
}
