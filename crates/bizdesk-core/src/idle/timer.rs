//! Idle deadline tracking with a pre-expiry warning.
//!
//! While armed, exactly one deadline is live. Every reset cancels both
//! pending timers before the new ones are spawned, and each timer carries the
//! generation it was armed with so a timer that is already running when it is
//! cancelled still cannot act on a newer deadline.

use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, trace};

use super::ActivityKind;
use crate::auth::SessionEpoch;

/// Default idle timeout (30 minutes)
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Default warning window before expiry (1 minute)
pub const DEFAULT_WARNING_WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdleConfig {
    pub idle_timeout: Duration,
    pub warning_window: Duration,
}

impl Default for IdleConfig {
    fn default() -> Self {
        Self {
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            warning_window: DEFAULT_WARNING_WINDOW,
        }
    }
}

/// What a countdown surface needs to render the pre-expiry warning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct ExpiryNotice {
    pub visible: bool,
    #[cfg_attr(feature = "ts", ts(type = "string | null"))]
    pub end_time: Option<DateTime<Utc>>,
    #[cfg_attr(feature = "ts", ts(type = "number"))]
    pub warning_window_ms: u64,
}

impl ExpiryNotice {
    fn hidden(end_time: Option<DateTime<Utc>>, config: &IdleConfig) -> Self {
        Self {
            visible: false,
            end_time,
            warning_window_ms: config.warning_window.as_millis() as u64,
        }
    }

    /// Whole seconds left before `end_time`, floored at zero.
    pub fn seconds_remaining(&self, now: DateTime<Utc>) -> Option<i64> {
        self.end_time.map(|end| (end - now).num_seconds().max(0))
    }
}

type ExpireHook = Box<dyn Fn(SessionEpoch) + Send + Sync>;

struct ArmedDeadline {
    generation: u64,
    epoch: SessionEpoch,
    deadline: Instant,
    end_time: DateTime<Utc>,
    warning: JoinHandle<()>,
    expiry: JoinHandle<()>,
}

impl ArmedDeadline {
    fn cancel(self) {
        self.warning.abort();
        self.expiry.abort();
    }
}

#[derive(Default)]
struct TimerState {
    generation: u64,
    armed: Option<ArmedDeadline>,
}

struct Inner {
    config: IdleConfig,
    runtime: Option<Handle>,
    state: Mutex<TimerState>,
    notice: watch::Sender<ExpiryNotice>,
    on_expire: ExpireHook,
}

/// Two-state controller: armed (one live deadline) or disarmed (no timers).
///
/// Clone is cheap and every clone drives the same deadline.
#[derive(Clone)]
pub struct IdleTimer {
    inner: Arc<Inner>,
}

impl IdleTimer {
    /// `on_expire` runs on the timer task once the deadline passes with no
    /// activity, after the timer has already disarmed itself.
    ///
    /// Timers run on the runtime current at construction, so activity may be
    /// recorded from any thread afterwards.
    pub fn new(config: IdleConfig, on_expire: impl Fn(SessionEpoch) + Send + Sync + 'static) -> Self {
        let (notice, _) = watch::channel(ExpiryNotice::hidden(None, &config));
        Self {
            inner: Arc::new(Inner {
                config,
                runtime: Handle::try_current().ok(),
                state: Mutex::new(TimerState::default()),
                notice,
                on_expire: Box::new(on_expire),
            }),
        }
    }

    /// Arm a fresh deadline for `epoch`, replacing any live one.
    pub fn arm(&self, epoch: SessionEpoch) {
        let mut state = self.lock();
        self.arm_locked(&mut state, epoch);
        debug!(epoch, "Idle timer armed");
    }

    /// Push the deadline out to `now + idle_timeout`.
    /// Does nothing while disarmed; returns whether a reset happened.
    pub fn reset(&self) -> bool {
        let mut state = self.lock();
        let Some(epoch) = state.armed.as_ref().map(|a| a.epoch) else {
            return false;
        };
        self.arm_locked(&mut state, epoch);
        true
    }

    /// Record user or network activity.
    pub fn record_activity(&self, kind: ActivityKind) -> bool {
        let reset = self.reset();
        if reset {
            trace!(%kind, "Idle deadline reset by activity");
        }
        reset
    }

    /// Cancel both timers immediately. Idempotent.
    pub fn disarm(&self) {
        let mut state = self.lock();
        if let Some(armed) = state.armed.take() {
            armed.cancel();
            self.inner
                .notice
                .send_replace(ExpiryNotice::hidden(None, &self.inner.config));
            drop(state);
            debug!("Idle timer disarmed");
        }
    }

    pub fn is_armed(&self) -> bool {
        self.lock().armed.is_some()
    }

    /// True while the pre-expiry warning is showing.
    pub fn in_warning(&self) -> bool {
        self.inner.notice.borrow().visible
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.lock().armed.as_ref().map(|a| a.deadline)
    }

    pub fn remaining(&self) -> Option<Duration> {
        self.deadline()
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    pub fn subscribe(&self) -> watch::Receiver<ExpiryNotice> {
        self.inner.notice.subscribe()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TimerState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn arm_locked(&self, state: &mut TimerState, epoch: SessionEpoch) {
        // Cancel before computing the new deadline
        if let Some(previous) = state.armed.take() {
            previous.cancel();
        }

        let Some(runtime) = self
            .inner
            .runtime
            .clone()
            .or_else(|| Handle::try_current().ok())
        else {
            error!(epoch, "No async runtime available, idle timer left disarmed");
            self.inner
                .notice
                .send_replace(ExpiryNotice::hidden(None, &self.inner.config));
            return;
        };
        // Clock reads and spawns both go through the timer's runtime
        let _runtime = runtime.enter();

        let config = self.inner.config;
        state.generation += 1;
        let generation = state.generation;

        let now = Instant::now();
        let deadline = now + config.idle_timeout;
        let warn_at = now + config.idle_timeout.saturating_sub(config.warning_window);
        let end_time = chrono::Duration::from_std(config.idle_timeout)
            .ok()
            .and_then(|d| Utc::now().checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        let weak = Arc::downgrade(&self.inner);
        let warning = runtime.spawn(async move {
            sleep_until(warn_at).await;
            enter_warning(&weak, generation);
        });

        let weak = Arc::downgrade(&self.inner);
        let expiry = runtime.spawn(async move {
            sleep_until(deadline).await;
            expire(&weak, generation);
        });

        state.armed = Some(ArmedDeadline {
            generation,
            epoch,
            deadline,
            end_time,
            warning,
            expiry,
        });

        self.inner
            .notice
            .send_replace(ExpiryNotice::hidden(Some(end_time), &config));
    }
}

fn enter_warning(inner: &Weak<Inner>, generation: u64) {
    let Some(inner) = inner.upgrade() else {
        return;
    };
    let state = inner.state.lock().unwrap_or_else(PoisonError::into_inner);
    let Some(armed) = state.armed.as_ref().filter(|a| a.generation == generation) else {
        return;
    };
    // Published under the lock so a concurrent reset cannot be overwritten
    inner.notice.send_replace(ExpiryNotice {
        visible: true,
        end_time: Some(armed.end_time),
        warning_window_ms: inner.config.warning_window.as_millis() as u64,
    });
    drop(state);

    debug!("Idle warning shown");
}

fn expire(inner: &Weak<Inner>, generation: u64) {
    let Some(inner) = inner.upgrade() else {
        return;
    };
    let mut state = inner.state.lock().unwrap_or_else(PoisonError::into_inner);
    if !state.armed.as_ref().is_some_and(|a| a.generation == generation) {
        return;
    }
    let Some(armed) = state.armed.take() else {
        return;
    };
    inner
        .notice
        .send_replace(ExpiryNotice::hidden(None, &inner.config));
    drop(state);

    // This task is the expiry timer; only the warning timer is left to stop.
    armed.warning.abort();

    info!(epoch = armed.epoch, "Idle timeout reached");
    (inner.on_expire)(armed.epoch);
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::time::sleep;

    use super::*;

    const MINUTE: Duration = Duration::from_secs(60);

    fn counting_timer() -> (IdleTimer, Arc<AtomicUsize>) {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        let timer = IdleTimer::new(IdleConfig::default(), move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        (timer, fired)
    }

    #[tokio::test(start_paused = true)]
    async fn test_warning_then_activity_hides_it() {
        let (timer, fired) = counting_timer();
        timer.arm(1);
        assert!(!timer.in_warning());

        sleep(MINUTE * 29 + Duration::from_secs(1)).await;
        assert!(timer.in_warning());
        let remaining = timer.remaining().unwrap();
        assert!(remaining <= Duration::from_secs(60) && remaining >= Duration::from_secs(58));

        sleep(Duration::from_secs(29)).await; // t = 29:30
        let reset_at = Instant::now();
        assert!(timer.record_activity(ActivityKind::KeyDown));
        assert!(!timer.in_warning());
        assert_eq!(timer.deadline(), Some(reset_at + MINUTE * 30));

        // The original 30:00 deadline passes without effect
        sleep(MINUTE * 2).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(timer.is_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expires_exactly_once_without_activity() {
        let (timer, fired) = counting_timer();
        timer.arm(7);

        sleep(MINUTE * 30 - Duration::from_secs(1)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        sleep(Duration::from_secs(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!timer.is_armed());
        assert!(!timer.in_warning());

        sleep(MINUTE * 60).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_follows_last_reset() {
        let (timer, fired) = counting_timer();
        timer.arm(1);

        let start = Instant::now();
        let mut last_reset = start;
        for at in [5u32, 12, 20, 29] {
            sleep_until(start + MINUTE * at).await;
            last_reset = Instant::now();
            assert!(timer.reset());
        }
        assert_eq!(timer.deadline(), Some(last_reset + MINUTE * 30));

        // Well past the first deadline, still armed
        sleep_until(last_reset + MINUTE * 30 - Duration::from_secs(1)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        sleep_until(last_reset + MINUTE * 30 + Duration::from_secs(1)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disarm_cancels_pending_timers() {
        let (timer, fired) = counting_timer();
        let mut notices = timer.subscribe();
        timer.arm(1);

        sleep(MINUTE * 29 + Duration::from_secs(10)).await;
        assert!(timer.in_warning());

        timer.disarm();
        assert!(!timer.in_warning());
        assert!(timer.deadline().is_none());

        sleep(MINUTE * 5).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(!notices.borrow_and_update().visible);
    }

    #[tokio::test(start_paused = true)]
    async fn test_activity_while_disarmed_schedules_nothing() {
        let (timer, fired) = counting_timer();

        assert!(!timer.record_activity(ActivityKind::PointerMove));
        assert!(!timer.is_armed());

        sleep(MINUTE * 45).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearm_keeps_single_deadline() {
        let (timer, fired) = counting_timer();
        timer.arm(1);
        sleep(MINUTE * 10).await;
        timer.arm(1);

        sleep(MINUTE * 30 + Duration::from_secs(1)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_reports_armed_epoch() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let timer = IdleTimer::new(IdleConfig::default(), move |epoch| {
            sink.lock().unwrap().push(epoch);
        });

        timer.arm(3);
        sleep(MINUTE * 31).await;
        assert_eq!(*seen.lock().unwrap(), vec![3]);
    }

    #[test]
    fn test_notice_seconds_remaining() {
        let now = Utc::now();
        let notice = ExpiryNotice {
            visible: true,
            end_time: Some(now + chrono::Duration::seconds(42)),
            warning_window_ms: 60_000,
        };
        assert_eq!(notice.seconds_remaining(now), Some(42));
        assert_eq!(
            notice.seconds_remaining(now + chrono::Duration::seconds(90)),
            Some(0)
        );

        let serialized = serde_json::to_value(&notice).unwrap();
        assert_eq!(serialized["visible"], true);
        assert_eq!(serialized["warningWindowMs"], 60_000);
        assert!(serialized["endTime"].is_string());
    }
}
