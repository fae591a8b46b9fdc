use chrono::{DateTime, Duration, FixedOffset, Offset, TimeZone, Timelike, Utc};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tracing::{info, warn};

use crate::broker::{BrokerApi, BrokerError, TradingGate};
use crate::config::MarketConfig;
use crate::context::SharedClock;
use crate::model::Credential;
use crate::notify::SharedNotifier;
use crate::storage::FileStorage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SessionState {
    Unauthenticated,
    Authenticated,
    Expired,
}

struct SessionInner {
    state: SessionState,
    credential: Option<Credential>,
    /// One notification per expiry event.
    expiry_notified: bool,
    /// One warning per credential inside the warning window.
    warning_sent: bool,
}

/// Owns the current broker credential and its fixed daily expiry.
///
/// The credential dies at a fixed wall-clock hour in exchange-local time,
/// which can fall inside the trading window. Expiry is checked lazily on
/// every `is_trading_enabled`/`access_token` call rather than with a live
/// timer, because the process is not guaranteed to be running continuously.
///
/// Notification side effects are queued and drained by `flush_notifications`
/// from an async context, so the lazy checks stay synchronous and callable
/// from the broker's trading gate.
pub struct SessionManager {
    storage: Arc<FileStorage>,
    notifier: SharedNotifier,
    broker: Arc<dyn BrokerApi>,
    clock: SharedClock,
    tz: FixedOffset,
    expiry_hour: u32,
    warning_window: Duration,
    market: MarketConfig,
    app_url: String,
    inner: RwLock<SessionInner>,
    pending_messages: Mutex<Vec<String>>,
}

impl SessionManager {
    pub fn new(
        storage: Arc<FileStorage>,
        notifier: SharedNotifier,
        broker: Arc<dyn BrokerApi>,
        market: &MarketConfig,
        app_url: String,
        clock: SharedClock,
    ) -> Arc<Self> {
        let tz =
            FixedOffset::east_opt(market.tz_offset_minutes * 60).unwrap_or_else(|| Utc.fix());

        let manager = Arc::new(Self {
            storage,
            notifier,
            broker,
            clock,
            tz,
            expiry_hour: market.expiry_hour,
            warning_window: Duration::minutes(market.warning_window_minutes),
            market: market.clone(),
            app_url,
            inner: RwLock::new(SessionInner {
                state: SessionState::Unauthenticated,
                credential: None,
                expiry_notified: false,
                warning_sent: false,
            }),
            pending_messages: Mutex::new(Vec::new()),
        });
        manager.load_persisted();
        manager
    }

    /// Next occurrence of the fixed expiry hour strictly after `now`, in
    /// exchange-local civil time. May be later today or tomorrow.
    pub fn next_expiry(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let local = now.with_timezone(&self.tz);
        let mut candidate_date = local.date_naive();
        if local.hour() >= self.expiry_hour {
            candidate_date += Duration::days(1);
        }
        let Some(naive) = candidate_date.and_hms_opt(self.expiry_hour.min(23), 0, 0) else {
            return now + Duration::hours(24);
        };
        match self.tz.from_local_datetime(&naive) {
            chrono::LocalResult::Single(dt) => dt.with_timezone(&Utc),
            // Fixed offsets have no gaps
            _ => now + Duration::hours(24),
        }
    }

    fn load_persisted(&self) {
        let Some(credential) = self.storage.load_credential() else {
            warn!("No persisted credential found, starting unauthenticated");
            return;
        };

        let now = self.clock.now();
        let mut inner = self.inner.write();
        if now < credential.expires_at {
            info!(
                "Loaded valid credential for {}, expires at {}",
                credential.display_name, credential.expires_at
            );
            self.broker
                .set_access_token(Some(credential.secret_token.clone()));
            inner.state = SessionState::Authenticated;
        } else {
            warn!(
                "Loaded expired credential for {} (expired {})",
                credential.display_name, credential.expires_at
            );
            inner.state = SessionState::Expired;
            // Stale at startup: no notification for an expiry that happened
            // while we were down
            inner.expiry_notified = true;
        }
        inner.credential = Some(credential);
    }

    /// Complete the web login flow: exchange the request token, compute the
    /// fixed-hour expiry, persist and adopt the new credential.
    pub async fn complete_login(&self, request_token: &str) -> Result<Credential, BrokerError> {
        let session = self.broker.login(request_token).await?;
        let now = self.clock.now();
        let credential = Credential {
            subject_id: session.user_id,
            display_name: session.user_name,
            secret_token: session.access_token,
            issued_at: now,
            expires_at: self.next_expiry(now),
        };
        self.adopt_credential(credential.clone());
        Ok(credential)
    }

    /// Install a fresh credential, superseding any previous one atomically.
    pub fn adopt_credential(&self, credential: Credential) {
        if let Err(e) = self.storage.save_credential(&credential) {
            // In-memory state keeps the process usable until the next restart
            warn!("Failed to persist credential: {}", e);
        }
        self.broker
            .set_access_token(Some(credential.secret_token.clone()));

        let mut inner = self.inner.write();
        info!(
            "Session authenticated for {}, expires at {}",
            credential.display_name, credential.expires_at
        );
        inner.credential = Some(credential);
        inner.state = SessionState::Authenticated;
        inner.expiry_notified = false;
        inner.warning_sent = false;
    }

    /// Lazy expiry check. Transitions `Authenticated → Expired` when the
    /// clock has crossed `expires_at` and queues the one-shot notifications.
    pub fn check(&self) {
        let now = self.clock.now();
        let mut inner = self.inner.write();

        let Some(credential) = inner.credential.clone() else {
            return;
        };

        if inner.state == SessionState::Authenticated && now >= credential.expires_at {
            inner.state = SessionState::Expired;
            warn!(
                "Credential for {} expired at {}, trading disabled",
                credential.display_name, credential.expires_at
            );
            if !inner.expiry_notified {
                inner.expiry_notified = true;
                self.queue_message(format!(
                    "⚠️ <b>Token Expired - Trading Disabled</b>\n\n\
                     The broker credential expired at its fixed daily hour. \
                     Log in again to resume trading: {}",
                    self.login_link()
                ));
            }
            return;
        }

        if inner.state == SessionState::Authenticated && !inner.warning_sent {
            let remaining = credential.expires_at - now;
            if remaining <= self.warning_window {
                inner.warning_sent = true;
                let minutes = remaining.num_minutes().max(0);
                info!("Credential expires in {} minutes, warning queued", minutes);
                self.queue_message(format!(
                    "⏰ <b>Token Expiring Soon</b>\n\n\
                     The broker credential expires in {} minutes. \
                     Re-login to prevent a trading interruption: {}",
                    minutes,
                    self.login_link()
                ));
            }
        }
    }

    pub fn is_trading_enabled(&self) -> bool {
        self.check();
        self.inner.read().state == SessionState::Authenticated
    }

    pub fn access_token(&self) -> Option<String> {
        self.check();
        let inner = self.inner.read();
        if inner.state == SessionState::Authenticated {
            inner.credential.as_ref().map(|c| c.secret_token.clone())
        } else {
            None
        }
    }

    pub fn state(&self) -> SessionState {
        self.check();
        self.inner.read().state
    }

    /// Detailed status for the auth endpoint.
    pub fn status(&self) -> serde_json::Value {
        self.check();
        let now = self.clock.now();
        let inner = self.inner.read();

        let mut status = serde_json::json!({
            "state": inner.state,
            "authenticated": inner.state == SessionState::Authenticated,
            "trading_enabled": inner.state == SessionState::Authenticated,
            "current_time": now.to_rfc3339(),
        });

        if let Some(credential) = &inner.credential {
            let remaining = credential.expires_at - now;
            let hours = (remaining.num_minutes() as f64 / 60.0).max(0.0);
            status["username"] = serde_json::json!(credential.display_name);
            status["expires_at"] = serde_json::json!(credential.expires_at.to_rfc3339());
            status["hours_until_expiry"] = serde_json::json!((hours * 100.0).round() / 100.0);
            status["expires_during_market_hours"] =
                serde_json::json!(self.expires_during_market_hours(credential, now));
        }

        status
    }

    /// True when the credential dies on the current trading day inside the
    /// open/close window, i.e. the session will degrade mid-session.
    fn expires_during_market_hours(&self, credential: &Credential, now: DateTime<Utc>) -> bool {
        let local_expiry = credential.expires_at.with_timezone(&self.tz);
        let local_now = now.with_timezone(&self.tz);
        local_expiry.date_naive() == local_now.date_naive()
            && self.market.open_hour <= self.expiry_hour
            && self.expiry_hour <= self.market.close_hour
    }

    fn login_link(&self) -> String {
        if self.app_url.is_empty() {
            "/auth/login".to_string()
        } else {
            format!("{}/auth/login", self.app_url)
        }
    }

    fn queue_message(&self, message: String) {
        self.pending_messages.lock().push(message);
    }

    /// Drain queued notifications. Called from the periodic session task and
    /// after alert handling; delivery failures are logged by the sink.
    pub async fn flush_notifications(&self) {
        let messages: Vec<String> = std::mem::take(&mut *self.pending_messages.lock());
        for message in messages {
            self.notifier.send(&message).await;
        }
    }

    #[cfg(test)]
    pub fn pending_count(&self) -> usize {
        self.pending_messages.lock().len()
    }
}

impl TradingGate for SessionManager {
    fn trading_enabled(&self) -> bool {
        self.is_trading_enabled()
    }
}
