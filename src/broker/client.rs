use async_trait::async_trait;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::{BrokerConfig, LimiterConfig};
use crate::model::OrderIntent;
use crate::rate_limiter::{ApiOperation, RateBucket};

#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("network error: {0}")]
    Network(String),
    #[error("api error: {0}")]
    Api(String),
    #[error("authentication error: {0}")]
    Auth(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("trading is disabled")]
    TradingDisabled,
}

/// Reports whether order placement is currently allowed. Implemented by the
/// session manager; injected after construction because the session manager
/// itself needs the client for the login exchange.
pub trait TradingGate: Send + Sync {
    fn trading_enabled(&self) -> bool;
}

/// Result of the login token exchange.
#[derive(Debug, Clone, Deserialize)]
pub struct LoginSession {
    pub user_id: String,
    pub user_name: String,
    pub access_token: String,
}

/// The brokerage operations the rest of the system is allowed to call.
/// Each implementation applies its own rate limiting per operation.
#[async_trait]
pub trait BrokerApi: Send + Sync {
    /// Exchange a request token for an access token.
    async fn login(&self, request_token: &str) -> Result<LoginSession, BrokerError>;

    /// Install (or clear) the access token used for authenticated calls.
    fn set_access_token(&self, token: Option<String>);

    /// Place one order. Fails fast without a network call when the trading
    /// gate reports trading disabled.
    async fn place_order(&self, intent: &OrderIntent) -> Result<String, BrokerError>;

    /// Available cash in the equity segment.
    async fn available_funds(&self) -> Result<Decimal, BrokerError>;

    async fn positions(&self) -> Result<serde_json::Value, BrokerError>;

    async fn orders(&self) -> Result<serde_json::Value, BrokerError>;

    async fn cancel_order(&self, order_id: &str) -> Result<String, BrokerError>;

    async fn logout(&self) -> Result<(), BrokerError>;
}

/// Login checksum required by the remote protocol:
/// `hex(sha256(api_key + request_token + api_secret))`. Fixed external
/// detail, reproduced bit-exactly.
pub fn compute_checksum(api_key: &str, request_token: &str, api_secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(api_key.as_bytes());
    hasher.update(request_token.as_bytes());
    hasher.update(api_secret.as_bytes());
    hex::encode(hasher.finalize())
}

fn is_rate_limit_violation(status: reqwest::StatusCode, body: &str) -> bool {
    status.as_u16() == 429 || body.to_lowercase().contains("rate limit")
}

/// Kite-protocol HTTP client. Holds the API key pair and the current access
/// token; every outbound call passes the token bucket first.
pub struct KiteClient {
    api_key: String,
    api_secret: String,
    api_url: String,
    login_url: String,
    redirect_url: String,
    client: reqwest::Client,
    limiter: RateBucket,
    violation_backoff: Duration,
    access_token: RwLock<Option<String>>,
    gate: RwLock<Option<Arc<dyn TradingGate>>>,
}

impl KiteClient {
    pub fn new(broker: &BrokerConfig, limiter: &LimiterConfig) -> Result<Self, BrokerError> {
        if broker.api_key.is_empty() || broker.api_secret.is_empty() {
            return Err(BrokerError::Config(
                "broker api_key/api_secret not set (check config or SCANNER_BROKER__* env)"
                    .to_string(),
            ));
        }

        Ok(Self {
            api_key: broker.api_key.clone(),
            api_secret: broker.api_secret.clone(),
            api_url: broker.api_url.clone(),
            login_url: broker.login_url.clone(),
            redirect_url: broker.redirect_url.clone(),
            client: reqwest::Client::new(),
            limiter: RateBucket::from_config(limiter),
            violation_backoff: Duration::from_secs_f64(crate::rate_limiter::sanitize_secs(
                limiter.violation_backoff_secs,
                1.0,
            )),
            access_token: RwLock::new(None),
            gate: RwLock::new(None),
        })
    }

    /// Wire up the trading gate. Called once at startup after the session
    /// manager exists.
    pub fn set_gate(&self, gate: Arc<dyn TradingGate>) {
        *self.gate.write() = Some(gate);
    }

    /// URL the operator visits to start the web login flow.
    pub fn login_redirect_url(&self) -> String {
        let params = [
            ("v", "3".to_string()),
            ("api_key", self.api_key.clone()),
            ("redirect_url", self.redirect_url.clone()),
        ];
        let query = serde_urlencoded::to_string(params).unwrap_or_default();
        format!("{}?{}", self.login_url, query)
    }

    fn auth_header(&self) -> Result<String, BrokerError> {
        match self.access_token.read().as_ref() {
            Some(token) => Ok(format!("token {}:{}", self.api_key, token)),
            None => Err(BrokerError::Auth("no access token set".to_string())),
        }
    }

    /// Unwrap the remote envelope (`{"status": ..., "data": ...}`), mapping
    /// failures and applying the defensive rate-limit backoff. The remote
    /// side stays the final arbiter on limits; the extra sleep just eases
    /// the next attempt.
    async fn read_body(&self, resp: reqwest::Response) -> Result<serde_json::Value, BrokerError> {
        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| BrokerError::Network(e.to_string()))?;

        if !status.is_success() {
            if is_rate_limit_violation(status, &text) {
                warn!("Remote rate limit violation despite local limiter: {}", text);
                tokio::time::sleep(self.violation_backoff).await;
            }
            return Err(BrokerError::Api(format!("HTTP {}: {}", status, text)));
        }

        let json: serde_json::Value = serde_json::from_str(&text)
            .map_err(|e| BrokerError::Api(format!("unparsable response: {}", e)))?;
        Ok(json["data"].clone())
    }

    async fn get_authed(
        &self,
        path: &str,
        op: ApiOperation,
    ) -> Result<serde_json::Value, BrokerError> {
        let auth = self.auth_header()?;
        self.limiter.acquire(op.cost()).await;

        let resp = self
            .client
            .get(format!("{}{}", self.api_url, path))
            .header("X-Kite-Version", "3")
            .header("Authorization", auth)
            .send()
            .await
            .map_err(|e| BrokerError::Network(e.to_string()))?;
        self.read_body(resp).await
    }

    async fn delete_authed(
        &self,
        path: &str,
        op: ApiOperation,
    ) -> Result<serde_json::Value, BrokerError> {
        let auth = self.auth_header()?;
        self.limiter.acquire(op.cost()).await;

        let resp = self
            .client
            .delete(format!("{}{}", self.api_url, path))
            .header("X-Kite-Version", "3")
            .header("Authorization", auth)
            .send()
            .await
            .map_err(|e| BrokerError::Network(e.to_string()))?;
        self.read_body(resp).await
    }
}

#[async_trait]
impl BrokerApi for KiteClient {
    async fn login(&self, request_token: &str) -> Result<LoginSession, BrokerError> {
        self.limiter.acquire(ApiOperation::Login.cost()).await;

        let checksum = compute_checksum(&self.api_key, request_token, &self.api_secret);
        let form = [
            ("api_key", self.api_key.as_str()),
            ("request_token", request_token),
            ("checksum", checksum.as_str()),
        ];

        let resp = self
            .client
            .post(format!("{}/session/token", self.api_url))
            .header("X-Kite-Version", "3")
            .form(&form)
            .send()
            .await
            .map_err(|e| BrokerError::Network(e.to_string()))?;
        let data = self.read_body(resp).await?;

        let session: LoginSession = serde_json::from_value(data)
            .map_err(|e| BrokerError::Api(format!("malformed login response: {}", e)))?;
        self.set_access_token(Some(session.access_token.clone()));
        info!("Login exchange complete for {}", session.user_name);
        Ok(session)
    }

    fn set_access_token(&self, token: Option<String>) {
        *self.access_token.write() = token;
    }

    async fn place_order(&self, intent: &OrderIntent) -> Result<String, BrokerError> {
        // Fail fast before any network traffic
        let enabled = self
            .gate
            .read()
            .as_ref()
            .map(|g| g.trading_enabled())
            .unwrap_or(false);
        if !enabled {
            return Err(BrokerError::TradingDisabled);
        }
        let auth = self.auth_header()?;

        self.limiter.acquire(ApiOperation::PlaceOrder.cost()).await;

        let mut form: Vec<(&str, String)> = vec![
            ("tradingsymbol", intent.symbol.clone()),
            ("exchange", intent.exchange.clone()),
            ("transaction_type", intent.action.as_wire().to_string()),
            ("quantity", intent.quantity.to_string()),
            ("order_type", intent.kind.as_wire().to_string()),
            ("product", "MIS".to_string()),
        ];
        if let Some(price) = intent.limit_price {
            form.push(("price", price.to_string()));
        }
        if let Some(trigger) = intent.trigger_price {
            form.push(("trigger_price", trigger.to_string()));
        }

        let body = serde_urlencoded::to_string(&form)
            .map_err(|e| BrokerError::Api(format!("urlencode error: {}", e)))?;

        let resp = self
            .client
            .post(format!("{}/orders/regular", self.api_url))
            .header("X-Kite-Version", "3")
            .header("Authorization", auth)
            .header("Content-Type", "application/x-www-form-urlencoded")
            .body(body)
            .send()
            .await
            .map_err(|e| BrokerError::Network(e.to_string()))?;
        let data = self.read_body(resp).await?;

        data["order_id"]
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| BrokerError::Api("no order_id in response".to_string()))
    }

    async fn available_funds(&self) -> Result<Decimal, BrokerError> {
        let data = self
            .get_authed("/user/margins/equity", ApiOperation::Margins)
            .await?;
        let cash = data["available"]["cash"].as_f64().ok_or_else(|| {
            BrokerError::Api("margins response missing available.cash".to_string())
        })?;
        Decimal::from_f64_retain(cash)
            .ok_or_else(|| BrokerError::Api(format!("unrepresentable cash value {}", cash)))
    }

    async fn positions(&self) -> Result<serde_json::Value, BrokerError> {
        self.get_authed("/portfolio/positions", ApiOperation::Positions)
            .await
    }

    async fn orders(&self) -> Result<serde_json::Value, BrokerError> {
        self.get_authed("/orders", ApiOperation::Orders).await
    }

    async fn cancel_order(&self, order_id: &str) -> Result<String, BrokerError> {
        let data = self
            .delete_authed(
                &format!("/orders/regular/{}", order_id),
                ApiOperation::CancelOrder,
            )
            .await?;
        data["order_id"]
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| BrokerError::Api("no order_id in response".to_string()))
    }

    async fn logout(&self) -> Result<(), BrokerError> {
        let token = self
            .access_token
            .read()
            .clone()
            .ok_or_else(|| BrokerError::Auth("no access token set".to_string()))?;
        self.limiter.acquire(ApiOperation::Logout.cost()).await;

        let resp = self
            .client
            .delete(format!("{}/session/token", self.api_url))
            .header("X-Kite-Version", "3")
            .query(&[("api_key", self.api_key.as_str()), ("access_token", &token)])
            .send()
            .await
            .map_err(|e| BrokerError::Network(e.to_string()))?;
        self.read_body(resp).await?;

        self.set_access_token(None);
        Ok(())
    }
}
