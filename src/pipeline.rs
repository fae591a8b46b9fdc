use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::broker::{BrokerApi, BrokerError, TradingGate};
use crate::config::{ParamStore, TradingParams};
use crate::context::SharedClock;
use crate::metrics;
use crate::model::{
    qualify_symbol, Alert, OrderIntent, OrderKind, OrderResult, Outcome, TradeAction,
    TradeLedgerEntry, PRICE_SENTINEL,
};
use crate::notify::SharedNotifier;
use crate::storage::FileStorage;

/// Aggregate result of one alert, returned in the webhook response.
#[derive(Debug, Clone, Serialize)]
pub struct AlertReport {
    pub scanner: String,
    pub action: TradeAction,
    pub success_count: u32,
    pub error_count: u32,
    pub skipped_count: u32,
    pub funds_used: Decimal,
    pub outcomes: Vec<OrderResult>,
}

impl AlertReport {
    fn new(alert: &Alert) -> Self {
        Self {
            scanner: alert.scanner_name.clone(),
            action: alert.action,
            success_count: 0,
            error_count: 0,
            skipped_count: 0,
            funds_used: Decimal::ZERO,
            outcomes: Vec::new(),
        }
    }
}

/// Turns a normalized alert into broker orders.
///
/// The available-funds figure is fetched once per alert and drawn down
/// locally as orders are placed, so a multi-symbol alert can never commit
/// more than the cash that was available when it arrived. Per-symbol
/// failures never abort the batch.
pub struct ExecutionPipeline {
    broker: Arc<dyn BrokerApi>,
    gate: Arc<dyn TradingGate>,
    params: Arc<ParamStore>,
    storage: Arc<FileStorage>,
    notifier: SharedNotifier,
    clock: SharedClock,
    /// Alerts for one account never run concurrently: the funds draw-down is
    /// a running total that two interleaved alerts would both overspend.
    alert_lock: tokio::sync::Mutex<()>,
}

impl ExecutionPipeline {
    pub fn new(
        broker: Arc<dyn BrokerApi>,
        gate: Arc<dyn TradingGate>,
        params: Arc<ParamStore>,
        storage: Arc<FileStorage>,
        notifier: SharedNotifier,
        clock: SharedClock,
    ) -> Self {
        Self {
            broker,
            gate,
            params,
            storage,
            notifier,
            clock,
            alert_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub async fn execute_alert(&self, alert: &Alert) -> Result<AlertReport, BrokerError> {
        let _serialized = self.alert_lock.lock().await;

        if !self.gate.trading_enabled() {
            warn!(scanner = %alert.scanner_name, "Alert refused, trading disabled");
            return Err(BrokerError::TradingDisabled);
        }

        if let Err(e) = self.storage.append_alert(alert) {
            warn!("Failed to log alert: {}", e);
        }

        // One parameter snapshot per alert; mid-alert updates apply to the
        // next alert only
        let params = self.params.snapshot();
        let mut report = AlertReport::new(alert);

        let funds = self.broker.available_funds().await?;
        info!(
            scanner = %alert.scanner_name,
            symbols = alert.symbols.len(),
            funds = %funds,
            "Executing alert"
        );

        if funds <= Decimal::ZERO {
            warn!("No funds available, alert not executed");
            report.skipped_count = 1;
            report
                .outcomes
                .push(OrderResult::skipped("*", "insufficient funds"));
            metrics::SYMBOLS_SKIPPED.inc();
            self.notify_summary(alert, &report).await;
            return Ok(report);
        }

        let mut remaining = funds;
        for (raw_symbol, raw_price) in alert.symbols.iter().zip(alert.reference_prices.iter()) {
            let result = self
                .execute_symbol(alert, raw_symbol, raw_price, &params, &mut remaining)
                .await;
            match result.outcome {
                Outcome::Placed => {
                    report.success_count += 1;
                    metrics::ORDERS_PLACED.inc();
                }
                Outcome::Rejected => {
                    report.error_count += 1;
                    metrics::ORDER_ERRORS.inc();
                }
                Outcome::Skipped => {
                    report.skipped_count += 1;
                    metrics::SYMBOLS_SKIPPED.inc();
                }
            }
            report.outcomes.push(result);
        }

        report.funds_used = funds - remaining;
        info!(
            placed = report.success_count,
            errors = report.error_count,
            skipped = report.skipped_count,
            funds_used = %report.funds_used,
            "Alert complete"
        );
        self.notify_summary(alert, &report).await;
        Ok(report)
    }

    async fn execute_symbol(
        &self,
        alert: &Alert,
        raw_symbol: &str,
        raw_price: &str,
        params: &TradingParams,
        remaining: &mut Decimal,
    ) -> OrderResult {
        let (exchange, symbol) = qualify_symbol(raw_symbol);

        let price = match parse_price(raw_price) {
            Some(p) => p,
            None => {
                warn!(%symbol, raw = %raw_price, "No usable reference price, skipping");
                return OrderResult::skipped(&symbol, "no valid reference price");
            }
        };

        if price > *remaining {
            warn!(%symbol, %price, remaining = %*remaining, "Price exceeds remaining funds");
            return OrderResult::skipped(&symbol, "insufficient funds");
        }

        let quantity = match size_position(price, params, *remaining) {
            Some(q) => q,
            None => {
                warn!(%symbol, %price, "Cannot size a position within remaining funds");
                return OrderResult::skipped(&symbol, "insufficient funds");
            }
        };

        // Entries go to market: the reference price sizes the position and
        // anchors the exits, but a fill must not depend on it staying current
        let entry = OrderIntent {
            symbol: symbol.clone(),
            exchange: exchange.clone(),
            action: alert.action,
            kind: OrderKind::Market,
            quantity,
            limit_price: None,
            trigger_price: None,
        };

        let order_id = match self.broker.place_order(&entry).await {
            Ok(id) => id,
            Err(e) => {
                error!(%symbol, "Order failed: {}", e);
                return OrderResult::rejected(&symbol, e.to_string());
            }
        };
        info!(%symbol, quantity, %price, order_id = %order_id, "Order placed");
        *remaining -= price * Decimal::from(quantity);

        // Exits only bracket long entries; a short entry is closed manually
        // or by the product's end-of-day square-off
        let mut stop_loss_order_id = None;
        let mut target_order_id = None;
        if alert.action == TradeAction::Buy {
            stop_loss_order_id = self
                .place_exit(stop_loss_intent(&entry, price, params), "stop-loss")
                .await;
            target_order_id = self
                .place_exit(target_intent(&entry, price, params), "target")
                .await;
        }

        let ledger = TradeLedgerEntry {
            id: uuid::Uuid::new_v4(),
            timestamp: self.clock.now(),
            symbol: symbol.clone(),
            exchange,
            action: alert.action,
            price,
            quantity,
            scanner: alert.scanner_name.clone(),
            order_id: order_id.clone(),
            stop_loss_order_id,
            target_order_id,
        };
        if let Err(e) = self.storage.append_trade(&ledger) {
            warn!(%symbol, "Failed to record trade: {}", e);
        }

        OrderResult::placed(&symbol, order_id)
    }

    /// Place a dependent exit order. A failure here never fails the entry,
    /// which is already on the book.
    async fn place_exit(&self, intent: OrderIntent, label: &str) -> Option<String> {
        match self.broker.place_order(&intent).await {
            Ok(id) => {
                info!(symbol = %intent.symbol, order_id = %id, "Placed {} order", label);
                Some(id)
            }
            Err(e) => {
                error!(symbol = %intent.symbol, "Failed to place {} order: {}", label, e);
                metrics::ORDER_ERRORS.inc();
                None
            }
        }
    }

    async fn notify_summary(&self, alert: &Alert, report: &AlertReport) {
        let header = match alert.action {
            TradeAction::Buy => "📈 <b>Alert Executed</b>",
            TradeAction::Sell => "📉 <b>Alert Executed</b>",
        };
        let mut lines = vec![
            header.to_string(),
            String::new(),
            format!("Scanner: {}", alert.scanner_name),
            format!(
                "{} placed, {} failed, {} skipped",
                report.success_count, report.error_count, report.skipped_count
            ),
        ];
        if report.funds_used > Decimal::ZERO {
            lines.push(format!("Funds used: {}", report.funds_used));
        }
        self.notifier.send(&lines.join("\n")).await;
    }
}

fn parse_price(raw: &str) -> Option<Decimal> {
    if raw == PRICE_SENTINEL {
        return None;
    }
    let price: Decimal = raw.trim().parse().ok()?;
    if price <= Decimal::ZERO {
        return None;
    }
    // Exchange tick size: one decimal place
    Some(price.round_dp(1))
}

/// Position size for one symbol: the per-trade cap or whatever cash is left,
/// whichever is tighter. When even one share exceeds the cap, the configured
/// default quantity applies as long as its cost still fits the remaining
/// funds.
fn size_position(price: Decimal, params: &TradingParams, remaining: Decimal) -> Option<u32> {
    let budget = params.max_trade_value.min(remaining);
    let quantity = (budget / price).floor().to_u32().unwrap_or(0);
    if quantity > 0 {
        return Some(quantity);
    }

    let fallback = params.default_quantity;
    if fallback > 0 && price * Decimal::from(fallback) <= remaining {
        Some(fallback)
    } else {
        None
    }
}

/// Stop order protecting a filled entry: the opposite side, limit offset by
/// the stop-loss percent from the reference price, trigger offset beyond the
/// limit so the exchange releases the order before the limit is reached.
fn stop_loss_intent(entry: &OrderIntent, price: Decimal, params: &TradingParams) -> OrderIntent {
    let hundred = dec!(100);
    let exit_action = entry.action.opposite();

    let limit = match exit_action {
        TradeAction::Sell => price * (hundred - params.stop_loss_percent) / hundred,
        TradeAction::Buy => price * (hundred + params.stop_loss_percent) / hundred,
    }
    .round_dp(1);

    let trigger = match exit_action {
        TradeAction::Sell => limit * (hundred + params.trigger_offset_percent) / hundred,
        TradeAction::Buy => limit * (hundred - params.trigger_offset_percent) / hundred,
    }
    .round_dp(1);

    OrderIntent {
        symbol: entry.symbol.clone(),
        exchange: entry.exchange.clone(),
        action: exit_action,
        kind: OrderKind::StopLoss,
        quantity: entry.quantity,
        limit_price: Some(limit),
        trigger_price: Some(trigger),
    }
}

/// Profit-taking limit order on the opposite side of the entry.
fn target_intent(entry: &OrderIntent, price: Decimal, params: &TradingParams) -> OrderIntent {
    let hundred = dec!(100);
    let exit_action = entry.action.opposite();

    let limit = match exit_action {
        TradeAction::Sell => price * (hundred + params.target_percent) / hundred,
        TradeAction::Buy => price * (hundred - params.target_percent) / hundred,
    }
    .round_dp(1);

    OrderIntent {
        symbol: entry.symbol.clone(),
        exchange: entry.exchange.clone(),
        action: exit_action,
        kind: OrderKind::Limit,
        quantity: entry.quantity,
        limit_price: Some(limit),
        trigger_price: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TradingConfig;

    fn params() -> TradingParams {
        TradingParams::from_config(&TradingConfig::default())
    }

    #[test]
    fn test_parse_price_rejects_sentinel_and_garbage() {
        assert_eq!(parse_price("100.55"), Some(dec!(100.6)));
        assert_eq!(parse_price(" 99.9 "), Some(dec!(99.9)));
        assert_eq!(parse_price(PRICE_SENTINEL), None);
        assert_eq!(parse_price("abc"), None);
        assert_eq!(parse_price("-5"), None);
        assert_eq!(parse_price("0"), None);
    }

    #[test]
    fn test_sizing_uses_tighter_of_cap_and_remaining() {
        let mut p = params();
        p.max_trade_value = dec!(150);

        // Cap binds: 150 / 50 = 3
        assert_eq!(size_position(dec!(50), &p, dec!(1000)), Some(3));
        // Remaining binds: 120 / 50 = 2
        assert_eq!(size_position(dec!(50), &p, dec!(120)), Some(2));
    }

    #[test]
    fn test_sizing_fallback_requires_affordable_cost() {
        let mut p = params();
        p.max_trade_value = dec!(150);
        p.default_quantity = 1;

        // One share over the cap, but remaining covers it
        assert_eq!(size_position(dec!(200), &p, dec!(300)), Some(1));
        // Remaining does not cover the fallback either
        assert_eq!(size_position(dec!(200), &p, dec!(150)), None);
    }

    fn market_entry() -> OrderIntent {
        OrderIntent {
            symbol: "INFY".to_string(),
            exchange: "NSE".to_string(),
            action: TradeAction::Buy,
            kind: OrderKind::Market,
            quantity: 10,
            limit_price: None,
            trigger_price: None,
        }
    }

    #[test]
    fn test_stop_loss_brackets_a_buy() {
        let p = params(); // 2% stop, 5% trigger offset
        let sl = stop_loss_intent(&market_entry(), dec!(100), &p);
        assert_eq!(sl.action, TradeAction::Sell);
        assert_eq!(sl.kind, OrderKind::StopLoss);
        assert_eq!(sl.quantity, 10);
        assert_eq!(sl.limit_price, Some(dec!(98.0)));
        // Trigger sits above the limit for a sell stop: 98 * 1.05 = 102.9
        assert_eq!(sl.trigger_price, Some(dec!(102.9)));
    }

    #[test]
    fn test_target_brackets_a_buy() {
        let p = params(); // 4% target
        let target = target_intent(&market_entry(), dec!(100), &p);
        assert_eq!(target.action, TradeAction::Sell);
        assert_eq!(target.kind, OrderKind::Limit);
        assert_eq!(target.limit_price, Some(dec!(104.0)));
        assert_eq!(target.trigger_price, None);
    }
}
