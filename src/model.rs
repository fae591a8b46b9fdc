use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Sentinel used to pad `reference_prices` when the scanner omits entries.
/// It never parses as a price, so the padded symbols are skipped, not errored.
pub const PRICE_SENTINEL: &str = "";

const SELL_KEYWORDS: [&str; 5] = ["sell", "short", "bearish", "breakdown", "down"];

/// A webhook field that may arrive either as a comma-joined string or as an
/// array of strings. Both forms normalize to a trimmed item list.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum StringOrList {
    Joined(String),
    List(Vec<String>),
}

impl StringOrList {
    pub fn into_items(self) -> Vec<String> {
        match self {
            StringOrList::Joined(s) => s.split(',').map(|p| p.trim().to_string()).collect(),
            StringOrList::List(items) => {
                items.into_iter().map(|p| p.trim().to_string()).collect()
            }
        }
    }
}

impl Default for StringOrList {
    fn default() -> Self {
        StringOrList::List(Vec::new())
    }
}

/// Raw scanner webhook body, field names fixed by the external protocol.
#[derive(Debug, Clone, Deserialize)]
pub struct AlertPayload {
    #[serde(default)]
    pub stocks: StringOrList,
    #[serde(default)]
    pub trigger_prices: StringOrList,
    #[serde(default)]
    pub triggered_at: String,
    #[serde(default)]
    pub scan_name: String,
    #[serde(default)]
    pub scan_url: String,
    #[serde(default)]
    pub alert_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeAction {
    Buy,
    Sell,
}

impl TradeAction {
    /// Derive the action once from keyword matching on the scanner name.
    pub fn from_scan_name(scan_name: &str) -> Self {
        let lower = scan_name.to_lowercase();
        if SELL_KEYWORDS.iter().any(|kw| lower.contains(kw)) {
            TradeAction::Sell
        } else {
            TradeAction::Buy
        }
    }

    pub fn as_wire(&self) -> &'static str {
        match self {
            TradeAction::Buy => "BUY",
            TradeAction::Sell => "SELL",
        }
    }

    pub fn opposite(&self) -> Self {
        match self {
            TradeAction::Buy => TradeAction::Sell,
            TradeAction::Sell => TradeAction::Buy,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderKind {
    Market,
    Limit,
    StopLoss,
}

impl OrderKind {
    pub fn as_wire(&self) -> &'static str {
        match self {
            OrderKind::Market => "MARKET",
            OrderKind::Limit => "LIMIT",
            OrderKind::StopLoss => "SL",
        }
    }
}

/// A normalized scanner alert. `symbols` and `reference_prices` are always the
/// same length; prices stay raw strings until per-symbol parsing so one bad
/// entry cannot reject the batch.
#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub scanner_name: String,
    pub symbols: Vec<String>,
    pub reference_prices: Vec<String>,
    pub triggered_at: String,
    pub action: TradeAction,
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum AlertError {
    #[error("alert has no symbols")]
    Empty,
    #[error("price list longer than symbol list ({prices} > {symbols})")]
    LengthMismatch { symbols: usize, prices: usize },
}

impl Alert {
    /// Normalize a raw payload. Shorter price lists are extended with the
    /// sentinel; a price list longer than the symbol list rejects the alert.
    pub fn from_payload(payload: AlertPayload) -> Result<Self, AlertError> {
        let symbols: Vec<String> = payload
            .stocks
            .into_items()
            .into_iter()
            .filter(|s| !s.is_empty())
            .collect();
        if symbols.is_empty() {
            return Err(AlertError::Empty);
        }

        let mut prices = payload.trigger_prices.into_items();
        // A lone empty entry is the parse of an absent/empty field.
        if prices.len() == 1 && prices[0].is_empty() {
            prices.clear();
        }
        if prices.len() > symbols.len() {
            return Err(AlertError::LengthMismatch {
                symbols: symbols.len(),
                prices: prices.len(),
            });
        }
        while prices.len() < symbols.len() {
            prices.push(PRICE_SENTINEL.to_string());
        }

        let action = TradeAction::from_scan_name(&payload.scan_name);
        Ok(Alert {
            scanner_name: payload.scan_name,
            symbols,
            reference_prices: prices,
            triggered_at: payload.triggered_at,
            action,
        })
    }
}

/// Split an exchange prefix off a scanner symbol, defaulting to NSE.
pub fn qualify_symbol(raw: &str) -> (String, String) {
    for exchange in ["NSE", "NFO", "BSE"] {
        let prefix = format!("{}:", exchange);
        if let Some(bare) = raw.strip_prefix(&prefix) {
            return (exchange.to_string(), bare.to_string());
        }
    }
    ("NSE".to_string(), raw.to_string())
}

/// One order the pipeline intends to place. Derived per surviving symbol;
/// a filled BUY entry additionally derives dependent exit intents.
#[derive(Debug, Clone)]
pub struct OrderIntent {
    pub symbol: String,
    pub exchange: String,
    pub action: TradeAction,
    pub kind: OrderKind,
    pub quantity: u32,
    pub limit_price: Option<Decimal>,
    pub trigger_price: Option<Decimal>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Outcome {
    Placed,
    Rejected,
    Skipped,
}

#[derive(Debug, Clone, Serialize)]
pub struct OrderResult {
    pub symbol: String,
    pub outcome: Outcome,
    pub order_id: Option<String>,
    pub reason: Option<String>,
}

impl OrderResult {
    pub fn placed(symbol: &str, order_id: String) -> Self {
        Self {
            symbol: symbol.to_string(),
            outcome: Outcome::Placed,
            order_id: Some(order_id),
            reason: None,
        }
    }

    pub fn rejected(symbol: &str, reason: String) -> Self {
        Self {
            symbol: symbol.to_string(),
            outcome: Outcome::Rejected,
            order_id: None,
            reason: Some(reason),
        }
    }

    pub fn skipped(symbol: &str, reason: &str) -> Self {
        Self {
            symbol: symbol.to_string(),
            outcome: Outcome::Skipped,
            order_id: None,
            reason: Some(reason.to_string()),
        }
    }
}

/// Durable record appended for every placed entry order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeLedgerEntry {
    pub id: uuid::Uuid,
    pub timestamp: DateTime<Utc>,
    pub symbol: String,
    pub exchange: String,
    pub action: TradeAction,
    pub price: Decimal,
    pub quantity: u32,
    pub scanner: String,
    pub order_id: String,
    pub stop_loss_order_id: Option<String>,
    pub target_order_id: Option<String>,
}

/// The broker session credential. Superseded, never mutated: a re-login
/// produces a fresh value that atomically replaces the old one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credential {
    pub subject_id: String,
    pub display_name: String,
    pub secret_token: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_or_list_forms() {
        let joined = StringOrList::Joined("AAA, BBB ,CCC".to_string());
        assert_eq!(joined.into_items(), vec!["AAA", "BBB", "CCC"]);

        let list = StringOrList::List(vec![" AAA ".to_string(), "BBB".to_string()]);
        assert_eq!(list.into_items(), vec!["AAA", "BBB"]);
    }

    #[test]
    fn test_action_keyword_matching() {
        assert_eq!(TradeAction::from_scan_name("Breakout"), TradeAction::Buy);
        assert_eq!(
            TradeAction::from_scan_name("Bearish Breakdown"),
            TradeAction::Sell
        );
        assert_eq!(TradeAction::from_scan_name("Short squeeze"), TradeAction::Sell);
        assert_eq!(TradeAction::from_scan_name("sell signal"), TradeAction::Sell);
        assert_eq!(TradeAction::from_scan_name("Momentum Up"), TradeAction::Buy);
    }

    #[test]
    fn test_alert_pads_missing_prices() {
        let payload = AlertPayload {
            stocks: StringOrList::Joined("AAA,BBB,CCC".to_string()),
            trigger_prices: StringOrList::Joined("100.5".to_string()),
            triggered_at: "2:34 pm".to_string(),
            scan_name: "Breakout".to_string(),
            scan_url: String::new(),
            alert_name: String::new(),
        };
        let alert = Alert::from_payload(payload).unwrap();
        assert_eq!(alert.symbols.len(), alert.reference_prices.len());
        assert_eq!(alert.reference_prices[0], "100.5");
        assert_eq!(alert.reference_prices[2], PRICE_SENTINEL);
    }

    #[test]
    fn test_alert_rejects_excess_prices() {
        let payload = AlertPayload {
            stocks: StringOrList::Joined("AAA".to_string()),
            trigger_prices: StringOrList::Joined("100,200".to_string()),
            triggered_at: String::new(),
            scan_name: String::new(),
            scan_url: String::new(),
            alert_name: String::new(),
        };
        assert!(matches!(
            Alert::from_payload(payload),
            Err(AlertError::LengthMismatch { .. })
        ));
    }

    #[test]
    fn test_alert_rejects_empty_symbols() {
        let payload = AlertPayload {
            stocks: StringOrList::Joined(" , ".to_string()),
            trigger_prices: StringOrList::default(),
            triggered_at: String::new(),
            scan_name: String::new(),
            scan_url: String::new(),
            alert_name: String::new(),
        };
        assert!(matches!(Alert::from_payload(payload), Err(AlertError::Empty)));
    }

    #[test]
    fn test_qualify_symbol_prefixes() {
        assert_eq!(qualify_symbol("INFY"), ("NSE".into(), "INFY".into()));
        assert_eq!(qualify_symbol("NFO:NIFTY24FEB"), ("NFO".into(), "NIFTY24FEB".into()));
        assert_eq!(qualify_symbol("NSE:TCS"), ("NSE".into(), "TCS".into()));
    }

    #[test]
    fn test_payload_accepts_array_form() {
        let body = r#"{
            "stocks": ["AAA", "BBB"],
            "trigger_prices": "100,50",
            "triggered_at": "2:34 pm",
            "scan_name": "Short term breakouts",
            "scan_url": "short-term-breakouts",
            "alert_name": "Alert for Short term breakouts"
        }"#;
        let payload: AlertPayload = serde_json::from_str(body).unwrap();
        let alert = Alert::from_payload(payload).unwrap();
        assert_eq!(alert.symbols, vec!["AAA", "BBB"]);
        assert_eq!(alert.action, TradeAction::Buy);
    }
}
