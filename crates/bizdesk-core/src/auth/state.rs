use std::fmt;
use std::sync::{Mutex, PoisonError};

use serde::Serialize;
use tokio::sync::broadcast;

/// Buffer size for session event subscribers.
/// Transitions are rare; a lagging subscriber only misses history, never the current state.
const EVENT_BUFFER_SIZE: usize = 16;

/// Identifies one authenticated session. Incremented on every sign-in.
pub type SessionEpoch = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SignOutReason {
    /// The user asked to log out.
    UserLogout,
    /// A rejected call could not be recovered by renewing the credential.
    RefreshFailed,
    /// No activity was observed before the idle deadline.
    IdleTimeout,
}

impl fmt::Display for SignOutReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            SignOutReason::UserLogout => "logged out",
            SignOutReason::RefreshFailed => "session expired",
            SignOutReason::IdleTimeout => "signed out after inactivity",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    SignedIn { epoch: SessionEpoch },
    Renewed { epoch: SessionEpoch },
    SignedOut { epoch: SessionEpoch, reason: SignOutReason },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthStatus {
    pub authenticated: bool,
    pub epoch: SessionEpoch,
}

/// Process-wide record of whether a user is currently authenticated.
///
/// This only records the flag and announces transitions; the side effects
/// that must accompany a transition are sequenced by `SessionLifecycle`.
pub struct AuthState {
    status: Mutex<AuthStatus>,
    events: broadcast::Sender<SessionEvent>,
}

impl AuthState {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER_SIZE);
        Self {
            status: Mutex::new(AuthStatus {
                authenticated: false,
                epoch: 0,
            }),
            events,
        }
    }

    pub fn status(&self) -> AuthStatus {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_authenticated(&self) -> bool {
        self.status().authenticated
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Transition false -> true, starting a new epoch.
    /// Returns `None` if already authenticated.
    pub(crate) fn sign_in(&self) -> Option<SessionEpoch> {
        let mut status = self.status.lock().unwrap_or_else(PoisonError::into_inner);
        if status.authenticated {
            return None;
        }
        status.authenticated = true;
        status.epoch += 1;
        let epoch = status.epoch;
        drop(status);

        let _ = self.events.send(SessionEvent::SignedIn { epoch });
        Some(epoch)
    }

    /// Record a silent credential renewal within the current session.
    pub(crate) fn renewed(&self, epoch: SessionEpoch) {
        let _ = self.events.send(SessionEvent::Renewed { epoch });
    }

    /// Transition true -> false. Returns the epoch that ended, or `None`
    /// if already unauthenticated or if `expected` names a session that has
    /// already ended.
    pub(crate) fn sign_out(
        &self,
        expected: Option<SessionEpoch>,
        reason: SignOutReason,
    ) -> Option<SessionEpoch> {
        let mut status = self.status.lock().unwrap_or_else(PoisonError::into_inner);
        if !status.authenticated || expected.is_some_and(|e| e != status.epoch) {
            return None;
        }
        status.authenticated = false;
        let epoch = status.epoch;
        drop(status);

        let _ = self.events.send(SessionEvent::SignedOut { epoch, reason });
        Some(epoch)
    }
}

impl Default for AuthState {
    fn default() -> Self {
        Self::new()
    }
}
