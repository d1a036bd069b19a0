//! Console rendering of the idle warning and forced sign-outs.

use std::time::Duration;

use bizdesk_core::{ExpiryNotice, SessionEvent, SessionLifecycle, SignOutReason};
use chrono::{DateTime, Utc};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

/// How often the countdown is repeated while the warning is visible
const COUNTDOWN_TICK: Duration = Duration::from_secs(15);

/// Countdown line for a visible warning, or `None` when hidden.
pub fn countdown_message(notice: &ExpiryNotice, now: DateTime<Utc>) -> Option<String> {
    if !notice.visible {
        return None;
    }
    let secs = notice.seconds_remaining(now)?;
    Some(format!(
        "Your session ends in {}s due to inactivity. Press Enter to stay signed in.",
        secs
    ))
}

/// Message for a sign-out the user did not ask for.
pub fn sign_out_message(reason: SignOutReason) -> Option<String> {
    match reason {
        SignOutReason::UserLogout => None,
        SignOutReason::IdleTimeout => {
            Some("You were signed out after a period of inactivity. Type 'login' to sign in again.".to_string())
        }
        SignOutReason::RefreshFailed => {
            Some("Your session expired. Type 'login' to sign in again.".to_string())
        }
    }
}

pub fn spawn(lifecycle: SessionLifecycle) -> JoinHandle<()> {
    let mut notices = lifecycle.expiry_notices();
    let mut events = lifecycle.subscribe();

    tokio::spawn(async move {
        let mut ticker = interval(COUNTDOWN_TICK);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                changed = notices.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let notice = notices.borrow_and_update().clone();
                    if let Some(message) = countdown_message(&notice, Utc::now()) {
                        println!("\n{}", message);
                        ticker.reset();
                    }
                }
                _ = ticker.tick() => {
                    let notice = notices.borrow().clone();
                    if let Some(message) = countdown_message(&notice, Utc::now()) {
                        println!("\n{}", message);
                    }
                }
                event = events.recv() => match event {
                    Ok(SessionEvent::SignedOut { reason, .. }) => {
                        if let Some(message) = sign_out_message(reason) {
                            println!("\n{}", message);
                        }
                    }
                    Ok(_) | Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => break,
                },
            }
        }
    })
}
