use config::{Config, ConfigError, Environment, File};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::env;

/// Static process configuration. Every numeric knob is overridable through
/// the environment (prefix `SCANNER`, `__` separator) without a code change,
/// e.g. `SCANNER_TRADING__MAX_TRADE_VALUE=10000`.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub limiter: LimiterConfig,
    #[serde(default)]
    pub market: MarketConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub calendar: CalendarConfig,
    #[serde(default)]
    pub trading: TradingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Public base URL used in notification login links.
    #[serde(default)]
    pub app_url: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct BrokerConfig {
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub api_secret: String,
    #[serde(default = "default_api_url")]
    pub api_url: String,
    #[serde(default = "default_login_url")]
    pub login_url: String,
    #[serde(default)]
    pub redirect_url: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LimiterConfig {
    /// Token refill rate, calls per second.
    #[serde(default = "default_rate")]
    pub rate: f64,
    /// Maximum burst capacity.
    #[serde(default = "default_capacity")]
    pub capacity: f64,
    /// Defensive cap on a single rate-limit sleep.
    #[serde(default = "default_max_wait_secs")]
    pub max_wait_secs: f64,
    /// Extra sleep after the remote side reports a rate-limit violation.
    #[serde(default = "default_violation_backoff_secs")]
    pub violation_backoff_secs: f64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct MarketConfig {
    #[serde(default = "default_open_hour")]
    pub open_hour: u32,
    #[serde(default)]
    pub open_minute: u32,
    #[serde(default = "default_close_hour")]
    pub close_hour: u32,
    #[serde(default = "default_close_minute")]
    pub close_minute: u32,
    /// Exchange-local civil time offset from UTC, minutes (IST = +330).
    #[serde(default = "default_tz_offset")]
    pub tz_offset_minutes: i32,
    /// Wall-clock hour (exchange-local) at which the credential dies daily.
    #[serde(default = "default_expiry_hour")]
    pub expiry_hour: u32,
    /// Warning window before credential expiry, minutes.
    #[serde(default = "default_warning_window")]
    pub warning_window_minutes: i64,
    /// Run in full mode regardless of market status (testing/backfills).
    #[serde(default)]
    pub bypass_market_hours: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct TelegramConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub bot_token: String,
    #[serde(default)]
    pub chat_id: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CalendarConfig {
    #[serde(default = "default_holiday_url")]
    pub holiday_url: String,
    #[serde(default = "default_cache_ttl_hours")]
    pub cache_ttl_hours: i64,
}

/// Config-file/env form of the per-alert trading parameters.
#[derive(Debug, Deserialize, Clone)]
pub struct TradingConfig {
    #[serde(default = "default_quantity")]
    pub default_quantity: u32,
    #[serde(default = "default_max_trade_value")]
    pub max_trade_value: f64,
    #[serde(default = "default_stop_loss_percent")]
    pub stop_loss_percent: f64,
    #[serde(default = "default_target_percent")]
    pub target_percent: f64,
    /// Trigger offset between a stop order's limit and trigger prices, percent.
    #[serde(default = "default_trigger_offset_percent")]
    pub trigger_offset_percent: f64,
}

fn default_port() -> u16 {
    5000
}
fn default_bind() -> String {
    "0.0.0.0".to_string()
}
fn default_api_url() -> String {
    "https://api.kite.trade".to_string()
}
fn default_login_url() -> String {
    "https://kite.zerodha.com/connect/login".to_string()
}
fn default_rate() -> f64 {
    3.0
}
fn default_capacity() -> f64 {
    10.0
}
fn default_max_wait_secs() -> f64 {
    30.0
}
fn default_violation_backoff_secs() -> f64 {
    1.0
}
fn default_open_hour() -> u32 {
    9
}
fn default_close_hour() -> u32 {
    15
}
fn default_close_minute() -> u32 {
    30
}
fn default_tz_offset() -> i32 {
    330
}
fn default_expiry_hour() -> u32 {
    6
}
fn default_warning_window() -> i64 {
    60
}
fn default_data_dir() -> String {
    "data".to_string()
}
fn default_holiday_url() -> String {
    "https://www.nseindia.com/api/holiday-master?type=trading".to_string()
}
fn default_cache_ttl_hours() -> i64 {
    24
}
fn default_quantity() -> u32 {
    1
}
fn default_max_trade_value() -> f64 {
    5000.0
}
fn default_stop_loss_percent() -> f64 {
    2.0
}
fn default_target_percent() -> f64 {
    4.0
}
fn default_trigger_offset_percent() -> f64 {
    5.0
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind: default_bind(),
            app_url: String::new(),
        }
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            api_secret: String::new(),
            api_url: default_api_url(),
            login_url: default_login_url(),
            redirect_url: String::new(),
        }
    }
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            rate: default_rate(),
            capacity: default_capacity(),
            max_wait_secs: default_max_wait_secs(),
            violation_backoff_secs: default_violation_backoff_secs(),
        }
    }
}

impl Default for MarketConfig {
    fn default() -> Self {
        Self {
            open_hour: default_open_hour(),
            open_minute: 0,
            close_hour: default_close_hour(),
            close_minute: default_close_minute(),
            tz_offset_minutes: default_tz_offset(),
            expiry_hour: default_expiry_hour(),
            warning_window_minutes: default_warning_window(),
            bypass_market_hours: false,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

impl Default for CalendarConfig {
    fn default() -> Self {
        Self {
            holiday_url: default_holiday_url(),
            cache_ttl_hours: default_cache_ttl_hours(),
        }
    }
}

impl Default for TradingConfig {
    fn default() -> Self {
        Self {
            default_quantity: default_quantity(),
            max_trade_value: default_max_trade_value(),
            stop_loss_percent: default_stop_loss_percent(),
            target_percent: default_target_percent(),
            trigger_offset_percent: default_trigger_offset_percent(),
        }
    }
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        let home = env::var("HOME").unwrap_or_else(|_| ".".into());

        let s = Config::builder()
            // Global config, then project config, then local overrides
            .add_source(File::with_name(&format!("{}/.scanner/config", home)).required(false))
            .add_source(File::with_name("config/config").required(false))
            .add_source(File::with_name("config/local").required(false))
            // e.g. SCANNER_BROKER__API_KEY, SCANNER_LIMITER__RATE
            .add_source(Environment::with_prefix("SCANNER").separator("__"))
            .build()?;

        s.try_deserialize()
    }
}

/// Per-alert trading parameters, in the numeric form the pipeline computes
/// with. Re-read from the store on every alert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradingParams {
    pub default_quantity: u32,
    pub max_trade_value: Decimal,
    pub stop_loss_percent: Decimal,
    pub target_percent: Decimal,
    pub trigger_offset_percent: Decimal,
}

impl TradingParams {
    pub fn from_config(cfg: &TradingConfig) -> Self {
        Self {
            default_quantity: cfg.default_quantity,
            max_trade_value: decimal_from_f64(cfg.max_trade_value),
            stop_loss_percent: decimal_from_f64(cfg.stop_loss_percent),
            target_percent: decimal_from_f64(cfg.target_percent),
            trigger_offset_percent: decimal_from_f64(cfg.trigger_offset_percent),
        }
    }
}

fn decimal_from_f64(v: f64) -> Decimal {
    Decimal::from_f64_retain(v).unwrap_or_default()
}

/// Single owner of the mutable trading parameters. Readers take a snapshot;
/// updates swap the whole object, so a running alert never observes a
/// half-applied change.
pub struct ParamStore {
    inner: RwLock<TradingParams>,
}

impl ParamStore {
    pub fn new(params: TradingParams) -> Self {
        Self {
            inner: RwLock::new(params),
        }
    }

    pub fn snapshot(&self) -> TradingParams {
        self.inner.read().clone()
    }

    pub fn replace(&self, params: TradingParams) {
        *self.inner.write() = params;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.limiter.rate, 3.0);
        let limiter = LimiterConfig::default();
        assert_eq!(limiter.rate, 3.0);
        assert_eq!(limiter.capacity, 10.0);
        let market = MarketConfig::default();
        assert_eq!(market.expiry_hour, 6);
        assert_eq!(market.tz_offset_minutes, 330);
    }

    #[test]
    fn test_trading_params_from_config() {
        let cfg = TradingConfig::default();
        let params = TradingParams::from_config(&cfg);
        assert_eq!(params.default_quantity, 1);
        assert_eq!(params.max_trade_value, dec!(5000));
        assert_eq!(params.stop_loss_percent, dec!(2));
    }

    #[test]
    fn test_param_store_swap() {
        let store = ParamStore::new(TradingParams::from_config(&TradingConfig::default()));
        let mut updated = store.snapshot();
        updated.max_trade_value = dec!(150);
        store.replace(updated.clone());
        assert_eq!(store.snapshot(), updated);
    }
}
