mod common;

use common::{alert, sim_clock, temp_storage, ClosedGate, MockBroker, OpenGate, RecordingSink};
use rust_decimal_macros::dec;
use std::sync::Arc;

use scanner_execution_rs::config::{ParamStore, TradingConfig, TradingParams};
use scanner_execution_rs::model::{OrderKind, Outcome, TradeAction};
use scanner_execution_rs::pipeline::ExecutionPipeline;

fn pipeline_with(
    broker: Arc<MockBroker>,
    max_trade_value: rust_decimal::Decimal,
) -> (ExecutionPipeline, Arc<RecordingSink>, std::path::PathBuf) {
    let (storage, dir) = temp_storage();
    let sink = RecordingSink::new();
    let mut params = TradingParams::from_config(&TradingConfig::default());
    params.max_trade_value = max_trade_value;

    let pipeline = ExecutionPipeline::new(
        broker,
        Arc::new(OpenGate),
        Arc::new(ParamStore::new(params)),
        storage,
        sink.clone(),
        sim_clock(1_756_000_000_000),
    );
    (pipeline, sink, dir)
}

#[tokio::test]
async fn disabled_trading_refuses_the_alert_before_any_call() {
    let broker = MockBroker::with_funds(dec!(1000));
    let (storage, dir) = temp_storage();
    let pipeline = ExecutionPipeline::new(
        broker.clone(),
        Arc::new(ClosedGate),
        Arc::new(ParamStore::new(TradingParams::from_config(
            &TradingConfig::default(),
        ))),
        storage,
        RecordingSink::new(),
        sim_clock(1_756_000_000_000),
    );

    let result = pipeline.execute_alert(&alert("Breakout", "AAA", "100")).await;
    assert!(matches!(
        result,
        Err(scanner_execution_rs::broker::BrokerError::TradingDisabled)
    ));
    assert!(broker.placed().is_empty());

    let _ = std::fs::remove_dir_all(dir);
}

#[tokio::test]
async fn funds_window_caps_a_multi_symbol_alert() {
    let broker = MockBroker::with_funds(dec!(300));
    let (pipeline, _, dir) = pipeline_with(broker.clone(), dec!(150));

    let report = pipeline
        .execute_alert(&alert("Breakout", "AAA,BBB", "100,50"))
        .await
        .unwrap();

    assert_eq!(report.success_count, 2);
    assert_eq!(report.error_count, 0);
    assert_eq!(report.funds_used, dec!(250));

    // Cap binds the first entry (150/100 = 1), remaining funds size the rest
    let orders = broker.placed();
    let entries: Vec<_> = orders
        .iter()
        .filter(|o| o.kind == OrderKind::Market)
        .collect();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].quantity, 1);
    assert_eq!(entries[1].quantity, 3);

    let _ = std::fs::remove_dir_all(dir);
}

#[tokio::test]
async fn buy_entries_are_bracketed_with_stop_and_target() {
    let broker = MockBroker::with_funds(dec!(1000));
    let (pipeline, _, dir) = pipeline_with(broker.clone(), dec!(500));

    pipeline
        .execute_alert(&alert("Breakout", "AAA", "100"))
        .await
        .unwrap();

    let orders = broker.placed();
    assert_eq!(orders.len(), 3);

    // The entry hits the market unpriced; only the exits carry prices
    assert_eq!(orders[0].action, TradeAction::Buy);
    assert_eq!(orders[0].kind, OrderKind::Market);
    assert_eq!(orders[0].quantity, 5);
    assert_eq!(orders[0].limit_price, None);
    assert_eq!(orders[0].trigger_price, None);

    let stop = &orders[1];
    assert_eq!(stop.action, TradeAction::Sell);
    assert_eq!(stop.kind, OrderKind::StopLoss);
    assert_eq!(stop.limit_price, Some(dec!(98.0)));
    assert_eq!(stop.trigger_price, Some(dec!(102.9)));

    let target = &orders[2];
    assert_eq!(target.action, TradeAction::Sell);
    assert_eq!(target.kind, OrderKind::Limit);
    assert_eq!(target.limit_price, Some(dec!(104.0)));

    let _ = std::fs::remove_dir_all(dir);
}

#[tokio::test]
async fn sell_alerts_place_no_exit_orders() {
    let broker = MockBroker::with_funds(dec!(1000));
    let (pipeline, _, dir) = pipeline_with(broker.clone(), dec!(500));

    let report = pipeline
        .execute_alert(&alert("Bearish Breakdown", "AAA", "100"))
        .await
        .unwrap();

    assert_eq!(report.action, TradeAction::Sell);
    assert_eq!(report.success_count, 1);

    let orders = broker.placed();
    assert_eq!(orders.len(), 1);
    assert_eq!(orders[0].action, TradeAction::Sell);

    let _ = std::fs::remove_dir_all(dir);
}

#[tokio::test]
async fn zero_funds_abort_the_whole_alert() {
    let broker = MockBroker::with_funds(dec!(0));
    let (pipeline, sink, dir) = pipeline_with(broker.clone(), dec!(500));

    let report = pipeline
        .execute_alert(&alert("Breakout", "AAA,BBB,CCC", "10,10,10"))
        .await
        .unwrap();

    assert_eq!(report.success_count, 0);
    assert_eq!(report.skipped_count, 1);
    assert_eq!(report.outcomes.len(), 1);
    assert_eq!(report.outcomes[0].outcome, Outcome::Skipped);
    assert!(broker.placed().is_empty());
    // The summary still goes out so the operator learns nothing executed
    assert_eq!(sink.messages.lock().len(), 1);

    let _ = std::fs::remove_dir_all(dir);
}

#[tokio::test]
async fn one_failing_symbol_does_not_abort_the_batch() {
    let broker = MockBroker::failing(dec!(10000), &["BBB"]);
    let (pipeline, _, dir) = pipeline_with(broker.clone(), dec!(100));

    let report = pipeline
        .execute_alert(&alert("Breakout", "AAA,BBB,CCC", "10,10,10"))
        .await
        .unwrap();

    assert_eq!(report.success_count, 2);
    assert_eq!(report.error_count, 1);
    assert_eq!(report.outcomes[1].outcome, Outcome::Rejected);
    assert_eq!(report.outcomes[2].outcome, Outcome::Placed);

    let _ = std::fs::remove_dir_all(dir);
}

#[tokio::test]
async fn padded_prices_skip_instead_of_erroring() {
    let broker = MockBroker::with_funds(dec!(1000));
    let (pipeline, _, dir) = pipeline_with(broker.clone(), dec!(500));

    // Scanner sent one price for two symbols; the second is padded out
    let report = pipeline
        .execute_alert(&alert("Breakout", "AAA,BBB", "100"))
        .await
        .unwrap();

    assert_eq!(report.success_count, 1);
    assert_eq!(report.skipped_count, 1);
    assert_eq!(report.outcomes[1].outcome, Outcome::Skipped);

    let _ = std::fs::remove_dir_all(dir);
}

#[tokio::test]
async fn exchange_prefixes_route_to_the_right_exchange() {
    let broker = MockBroker::with_funds(dec!(10000));
    let (pipeline, _, dir) = pipeline_with(broker.clone(), dec!(500));

    pipeline
        .execute_alert(&alert("Breakout", "BSE:XYZ,AAA", "100,100"))
        .await
        .unwrap();

    let orders = broker.placed();
    assert_eq!(orders[0].exchange, "BSE");
    assert_eq!(orders[0].symbol, "XYZ");
    // Bare symbols default to NSE
    let nse_entry = orders
        .iter()
        .find(|o| o.symbol == "AAA" && o.kind == OrderKind::Market)
        .unwrap();
    assert_eq!(nse_entry.exchange, "NSE");

    let _ = std::fs::remove_dir_all(dir);
}

#[tokio::test]
async fn trade_ledger_records_each_placed_entry() {
    let broker = MockBroker::with_funds(dec!(1000));
    let (storage, dir) = temp_storage();
    let sink = RecordingSink::new();
    let params = TradingParams::from_config(&TradingConfig::default());
    let pipeline = ExecutionPipeline::new(
        broker,
        Arc::new(OpenGate),
        Arc::new(ParamStore::new(params)),
        storage,
        sink,
        sim_clock(1_756_000_000_000),
    );

    pipeline
        .execute_alert(&alert("Breakout", "AAA,BBB", "100,50"))
        .await
        .unwrap();

    let ledger = std::fs::read_to_string(dir.join("trade_log.json")).unwrap();
    assert_eq!(ledger.lines().count(), 2);
    let first: serde_json::Value = serde_json::from_str(ledger.lines().next().unwrap()).unwrap();
    assert_eq!(first["symbol"], "AAA");
    assert!(first["stop_loss_order_id"].is_string());
    assert!(first["target_order_id"].is_string());

    let _ = std::fs::remove_dir_all(dir);
}
