#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::collections::HashSet;
use std::sync::Arc;

use scanner_execution_rs::broker::{BrokerApi, BrokerError, LoginSession, TradingGate};
use scanner_execution_rs::context::SimulatedTimeProvider;
use scanner_execution_rs::model::{Alert, AlertPayload, OrderIntent, StringOrList};
use scanner_execution_rs::storage::FileStorage;

/// Scripted broker: fixed funds, optional per-symbol failures, and a record
/// of every order it was asked to place.
pub struct MockBroker {
    pub funds: Decimal,
    pub fail_symbols: HashSet<String>,
    pub orders: Mutex<Vec<OrderIntent>>,
}

impl MockBroker {
    pub fn with_funds(funds: Decimal) -> Arc<Self> {
        Arc::new(Self {
            funds,
            fail_symbols: HashSet::new(),
            orders: Mutex::new(Vec::new()),
        })
    }

    pub fn failing(funds: Decimal, fail: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            funds,
            fail_symbols: fail.iter().map(|s| s.to_string()).collect(),
            orders: Mutex::new(Vec::new()),
        })
    }

    pub fn placed(&self) -> Vec<OrderIntent> {
        self.orders.lock().clone()
    }
}

#[async_trait]
impl BrokerApi for MockBroker {
    async fn login(&self, _request_token: &str) -> Result<LoginSession, BrokerError> {
        Ok(LoginSession {
            user_id: "AB1234".to_string(),
            user_name: "Test User".to_string(),
            access_token: "mock_access_token".to_string(),
        })
    }

    fn set_access_token(&self, _token: Option<String>) {}

    async fn place_order(&self, intent: &OrderIntent) -> Result<String, BrokerError> {
        if self.fail_symbols.contains(&intent.symbol) {
            return Err(BrokerError::Api("order rejected by exchange".to_string()));
        }
        let mut orders = self.orders.lock();
        orders.push(intent.clone());
        Ok(format!("order_{}", orders.len()))
    }

    async fn available_funds(&self) -> Result<Decimal, BrokerError> {
        Ok(self.funds)
    }

    async fn positions(&self) -> Result<serde_json::Value, BrokerError> {
        Ok(serde_json::Value::Null)
    }

    async fn orders(&self) -> Result<serde_json::Value, BrokerError> {
        Ok(serde_json::Value::Null)
    }

    async fn cancel_order(&self, _order_id: &str) -> Result<String, BrokerError> {
        Err(BrokerError::Api("not implemented".to_string()))
    }

    async fn logout(&self) -> Result<(), BrokerError> {
        Ok(())
    }
}

/// Gate that always allows trading.
pub struct OpenGate;

impl TradingGate for OpenGate {
    fn trading_enabled(&self) -> bool {
        true
    }
}

/// Gate that always refuses trading.
pub struct ClosedGate;

impl TradingGate for ClosedGate {
    fn trading_enabled(&self) -> bool {
        false
    }
}

/// Captures outbound notifications for assertions.
pub struct RecordingSink {
    pub messages: Mutex<Vec<String>>,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            messages: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl scanner_execution_rs::notify::Notifier for RecordingSink {
    async fn send(&self, text: &str) {
        self.messages.lock().push(text.to_string());
    }
}

/// Isolated storage rooted in a fresh temp directory, backups included.
pub fn temp_storage() -> (Arc<FileStorage>, std::path::PathBuf) {
    let dir = std::env::temp_dir().join(format!("scanner_it_{}", uuid::Uuid::new_v4()));
    let storage = Arc::new(FileStorage::with_backup_dir(
        dir.to_str().expect("utf-8 temp path"),
        dir.clone(),
    ));
    (storage, dir)
}

pub fn sim_clock(start_ms: i64) -> Arc<SimulatedTimeProvider> {
    Arc::new(SimulatedTimeProvider::new(start_ms))
}

/// Build a normalized alert the way the webhook would.
pub fn alert(scan_name: &str, stocks: &str, prices: &str) -> Alert {
    let payload = AlertPayload {
        stocks: StringOrList::Joined(stocks.to_string()),
        trigger_prices: StringOrList::Joined(prices.to_string()),
        triggered_at: "2:34 pm".to_string(),
        scan_name: scan_name.to_string(),
        scan_url: String::new(),
        alert_name: format!("Alert for {}", scan_name),
    };
    Alert::from_payload(payload).expect("valid test alert")
}
