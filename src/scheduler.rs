use chrono::{DateTime, Datelike, FixedOffset, Offset, Timelike, Utc};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::calendar::SharedCalendar;
use crate::config::MarketConfig;
use crate::context::SharedClock;
use crate::metrics;
use crate::notify::SharedNotifier;
use crate::session::SessionManager;

/// How much of the system is running.
///
/// `Full` carries the webhook pipeline and the periodic session checks;
/// `Minimal` keeps only the HTTP surface alive for health probes and the
/// login flow while the market is closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MarketMode {
    Full,
    Minimal,
}

const BOUNDARY_SLACK_MINUTES: i64 = 15;
const NEAR_BOUNDARY_CHECK: Duration = Duration::from_secs(60);
const IN_WINDOW_CHECK: Duration = Duration::from_secs(15 * 60);
const FAR_CHECK: Duration = Duration::from_secs(60 * 60);

/// Market-open predicate and adaptive recheck cadence.
pub struct MarketSchedule {
    market: MarketConfig,
    tz: FixedOffset,
    calendar: SharedCalendar,
    clock: SharedClock,
}

impl MarketSchedule {
    pub fn new(market: &MarketConfig, calendar: SharedCalendar, clock: SharedClock) -> Self {
        let tz =
            FixedOffset::east_opt(market.tz_offset_minutes * 60).unwrap_or_else(|| Utc.fix());
        Self {
            market: market.clone(),
            tz,
            calendar,
            clock,
        }
    }

    fn local_now(&self) -> DateTime<FixedOffset> {
        self.clock.now().with_timezone(&self.tz)
    }

    fn open_minute(&self) -> i64 {
        (self.market.open_hour * 60 + self.market.open_minute) as i64
    }

    fn close_minute(&self) -> i64 {
        (self.market.close_hour * 60 + self.market.close_minute) as i64
    }

    /// Trading-day predicate: a weekday that is not an exchange holiday,
    /// inside the open/close window. The configured bypass forces full mode
    /// for off-hours testing.
    pub async fn market_open(&self) -> bool {
        if self.market.bypass_market_hours {
            return true;
        }

        let local = self.local_now();
        let weekday = local.weekday().number_from_monday();
        if weekday > 5 {
            return false;
        }
        if self.calendar.is_holiday(local.date_naive()).await {
            return false;
        }

        let minute = (local.hour() * 60 + local.minute()) as i64;
        // Both boundary instants count as open
        self.open_minute() <= minute && minute <= self.close_minute()
    }

    /// How long until the mode should be re-evaluated. Checks tighten to one
    /// minute near the open/close boundaries so a transition is never more
    /// than a minute late, and relax away from them.
    pub fn next_check_delay(&self) -> Duration {
        let local = self.local_now();
        let minute = (local.hour() * 60 + local.minute()) as i64;
        let open = self.open_minute();
        let close = self.close_minute();

        if (minute - open).abs() <= BOUNDARY_SLACK_MINUTES
            || (minute - close).abs() <= BOUNDARY_SLACK_MINUTES
        {
            NEAR_BOUNDARY_CHECK
        } else if open <= minute && minute < close {
            IN_WINDOW_CHECK
        } else {
            FAR_CHECK
        }
    }
}

/// Drives the mode transitions and owns the per-mode background tasks.
///
/// A transition aborts the previous mode's tasks and spawns the next
/// mode's, so the two groups never run at the same time.
pub struct Supervisor {
    schedule: MarketSchedule,
    session: Arc<SessionManager>,
    notifier: SharedNotifier,
    mode: RwLock<Option<MarketMode>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Supervisor {
    pub fn new(
        schedule: MarketSchedule,
        session: Arc<SessionManager>,
        notifier: SharedNotifier,
    ) -> Arc<Self> {
        Arc::new(Self {
            schedule,
            session,
            notifier,
            mode: RwLock::new(None),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Current mode. `Minimal` until the first evaluation completes.
    pub fn mode(&self) -> MarketMode {
        self.mode.read().unwrap_or(MarketMode::Minimal)
    }

    pub fn accepting_alerts(&self) -> bool {
        self.mode() == MarketMode::Full
    }

    /// Supervision loop. Evaluates the desired mode eagerly at startup and
    /// then on the adaptive cadence.
    pub async fn run(self: Arc<Self>) {
        loop {
            let desired = if self.schedule.market_open().await {
                MarketMode::Full
            } else {
                MarketMode::Minimal
            };
            self.transition_to(desired).await;
            tokio::time::sleep(self.schedule.next_check_delay()).await;
        }
    }

    async fn transition_to(&self, desired: MarketMode) {
        let previous = *self.mode.read();
        if previous == Some(desired) {
            return;
        }

        self.abort_tasks();
        *self.mode.write() = Some(desired);
        metrics::MODE_TRANSITIONS.inc();

        match desired {
            MarketMode::Full => {
                metrics::ACTIVE_MODE.set(1);
                info!("Market open, entering full mode");
                self.spawn_full_tasks();
                // Operators only care when trading capacity comes up; the
                // nightly wind-down stays in the logs
                self.notifier
                    .send("🟢 <b>Trading Active</b>\n\nMarket is open, alerts are being executed.")
                    .await;
            }
            MarketMode::Minimal => {
                metrics::ACTIVE_MODE.set(0);
                info!("Market closed, entering minimal mode");
                self.spawn_minimal_tasks();
            }
        }
    }

    #[cfg(test)]
    pub fn force_mode(&self, mode: MarketMode) {
        *self.mode.write() = Some(mode);
    }

    fn abort_tasks(&self) {
        let mut tasks = self.tasks.lock();
        for task in tasks.drain(..) {
            task.abort();
        }
    }

    fn spawn_full_tasks(&self) {
        let session = self.session.clone();
        let heartbeat = tokio::spawn(async move {
            loop {
                session.check();
                session.flush_notifications().await;
                tokio::time::sleep(Duration::from_secs(60)).await;
            }
        });
        self.tasks.lock().push(heartbeat);
    }

    fn spawn_minimal_tasks(&self) {
        let session = self.session.clone();
        let housekeeping = tokio::spawn(async move {
            loop {
                // Expiry usually lands while the market is closed; keep the
                // lazy check ticking so the state is right when it reopens
                session.check();
                session.flush_notifications().await;
                if !session.is_trading_enabled() {
                    warn!("Session not authenticated while market closed, login required before open");
                }
                tokio::time::sleep(Duration::from_secs(30 * 60)).await;
            }
        });
        self.tasks.lock().push(housekeeping);
    }
}
