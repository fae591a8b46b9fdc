use async_trait::async_trait;
use chrono::{Datelike, NaiveDate};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::config::CalendarConfig;

/// Holiday lookup consumed by the lifecycle scheduler. A lookup failure is
/// treated as "not a holiday" and retried at the next scheduled check.
#[async_trait]
pub trait MarketCalendar: Send + Sync {
    async fn is_holiday(&self, date: NaiveDate) -> bool;
}

pub type SharedCalendar = Arc<dyn MarketCalendar>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HolidayEntry {
    pub date: String,
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct HolidayCache {
    year: i32,
    expires: i64,
    holidays: Vec<HolidayEntry>,
}

/// Exchange holiday calendar fetched over HTTP with a file cache.
///
/// Fetch order: in-memory copy, then the cache file if unexpired, then the
/// remote list. On a fetch error an expired cache is still used rather than
/// treating every day as a trading day blindly.
pub struct HolidayCalendar {
    client: reqwest::Client,
    url: String,
    cache_file: PathBuf,
    cache_ttl_hours: i64,
    memory: RwLock<Option<HolidayCache>>,
}

impl HolidayCalendar {
    pub fn new(cfg: &CalendarConfig, data_dir: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: cfg.holiday_url.clone(),
            cache_file: PathBuf::from(data_dir).join("holidays.json"),
            cache_ttl_hours: cfg.cache_ttl_hours,
            memory: RwLock::new(None),
        }
    }

    async fn holidays_for(&self, year: i32, now_ts: i64) -> Vec<HolidayEntry> {
        if let Some(cache) = self.memory.read().clone() {
            if cache.year == year && cache.expires > now_ts {
                return cache.holidays;
            }
        }

        if let Some(cache) = self.read_cache_file() {
            if cache.year == year && cache.expires > now_ts {
                *self.memory.write() = Some(cache.clone());
                return cache.holidays;
            }
        }

        match self.fetch_remote(year).await {
            Ok(holidays) => {
                let cache = HolidayCache {
                    year,
                    expires: now_ts + self.cache_ttl_hours * 3600,
                    holidays: holidays.clone(),
                };
                self.write_cache_file(&cache);
                *self.memory.write() = Some(cache);
                info!("Cached {} exchange holidays for {}", holidays.len(), year);
                holidays
            }
            Err(e) => {
                error!("Holiday fetch failed: {}", e);
                // Stale cache beats no calendar at all
                if let Some(cache) = self.read_cache_file() {
                    if cache.year == year {
                        warn!("Using expired holiday cache for {}", year);
                        return cache.holidays;
                    }
                }
                Vec::new()
            }
        }
    }

    async fn fetch_remote(&self, year: i32) -> Result<Vec<HolidayEntry>, reqwest::Error> {
        info!("Fetching exchange holidays for {} from {}", year, self.url);
        let resp = self
            .client
            .get(&self.url)
            .header("User-Agent", "Mozilla/5.0")
            .header("Accept", "application/json")
            .send()
            .await?
            .error_for_status()?;

        let body: serde_json::Value = resp.json().await?;
        let mut holidays = Vec::new();

        // "CM" is the capital market segment of the upstream payload
        if let Some(entries) = body.get("CM").and_then(|v| v.as_array()) {
            for entry in entries {
                let raw_date = entry.get("tradingDate").and_then(|v| v.as_str());
                let description = entry
                    .get("description")
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_string();
                if let Some(raw) = raw_date {
                    match NaiveDate::parse_from_str(raw, "%d-%b-%Y") {
                        Ok(date) => holidays.push(HolidayEntry {
                            date: date.format("%Y-%m-%d").to_string(),
                            description,
                        }),
                        Err(e) => warn!("Unparsable holiday date {:?}: {}", raw, e),
                    }
                }
            }
        }

        Ok(holidays)
    }

    fn read_cache_file(&self) -> Option<HolidayCache> {
        let data = std::fs::read(&self.cache_file).ok()?;
        match serde_json::from_slice(&data) {
            Ok(cache) => Some(cache),
            Err(e) => {
                warn!("Corrupt holiday cache: {}", e);
                None
            }
        }
    }

    fn write_cache_file(&self, cache: &HolidayCache) {
        match serde_json::to_vec(cache) {
            Ok(data) => {
                if let Err(e) = std::fs::write(&self.cache_file, data) {
                    error!("Failed to write holiday cache: {}", e);
                }
            }
            Err(e) => error!("Failed to serialize holiday cache: {}", e),
        }
    }
}

#[async_trait]
impl MarketCalendar for HolidayCalendar {
    async fn is_holiday(&self, date: NaiveDate) -> bool {
        let date_str = date.format("%Y-%m-%d").to_string();
        let now_ts = chrono::Utc::now().timestamp();
        self.holidays_for(date.year(), now_ts)
            .await
            .iter()
            .any(|h| h.date == date_str)
    }
}

/// Fixed holiday set, for tests and offline runs.
pub struct StaticCalendar {
    holidays: Vec<NaiveDate>,
}

impl StaticCalendar {
    pub fn new(holidays: Vec<NaiveDate>) -> Self {
        Self { holidays }
    }

    pub fn empty() -> Self {
        Self { holidays: Vec::new() }
    }
}

#[async_trait]
impl MarketCalendar for StaticCalendar {
    async fn is_holiday(&self, date: NaiveDate) -> bool {
        self.holidays.contains(&date)
    }
}
