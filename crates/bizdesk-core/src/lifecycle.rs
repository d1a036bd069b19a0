//! Session lifecycle service.
//!
//! Owns the credential store, the authenticated flag and the idle timer, and
//! is the only code that moves the session between signed-in and signed-out.
//! Each transition runs under one lock so credential writes and timer
//! cancel-then-rearm never interleave with another transition.
//!
//! Signing in persists the credential and arms the idle timer. Signing out,
//! for any reason, disarms the timer and clears the credential before the
//! `SignedOut` event is announced.

use std::sync::{Arc, Mutex, PoisonError, Weak};

use anyhow::{Context, Result};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use crate::auth::{
    AuthState, AuthStatus, Credential, CredentialStore, SessionEpoch, SessionEvent, SignOutReason,
};
use crate::idle::{ActivityKind, ExpiryNotice, IdleConfig, IdleTimer};

struct Inner {
    store: Arc<dyn CredentialStore>,
    auth: AuthState,
    idle: IdleTimer,
    transition: Mutex<()>,
}

/// Clone is cheap; all clones share one session.
#[derive(Clone)]
pub struct SessionLifecycle {
    inner: Arc<Inner>,
}

impl SessionLifecycle {
    pub fn new(store: Arc<dyn CredentialStore>, idle_config: IdleConfig) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<Inner>| {
            let weak = weak.clone();
            let idle = IdleTimer::new(idle_config, move |epoch| {
                if let Some(inner) = weak.upgrade() {
                    SessionLifecycle { inner }.end(Some(epoch), SignOutReason::IdleTimeout);
                }
            });
            Inner {
                store,
                auth: AuthState::new(),
                idle,
                transition: Mutex::new(()),
            }
        });
        Self { inner }
    }

    /// Resume a session from a credential left in the store by an earlier run.
    pub fn restore(&self) -> bool {
        let _guard = self.lock_transition();
        if self.inner.auth.is_authenticated() || self.inner.store.get().is_none() {
            return false;
        }
        if let Some(epoch) = self.inner.auth.sign_in() {
            self.inner.idle.arm(epoch);
            info!(epoch, "Session restored from stored credential");
        }
        true
    }

    /// Begin a session with a freshly issued credential.
    ///
    /// The credential is persisted before the flag changes; if the store
    /// rejects it the session is left as it was. If a session is already
    /// active the credential replaces the current one and a fresh deadline
    /// is armed; the epoch is unchanged.
    pub fn sign_in(&self, credential: Credential) -> Result<SessionEpoch> {
        let _guard = self.lock_transition();
        self.inner
            .store
            .set(&credential)
            .context("Failed to persist credential")?;

        let epoch = match self.inner.auth.sign_in() {
            Some(epoch) => {
                info!(epoch, "Signed in");
                epoch
            }
            None => {
                let epoch = self.inner.auth.status().epoch;
                self.inner.auth.renewed(epoch);
                debug!(epoch, "Credential replaced on active session");
                epoch
            }
        };
        self.inner.idle.arm(epoch);
        Ok(epoch)
    }

    /// Store a silently renewed credential, but only if `epoch` is still the
    /// live session. Returns `Ok(false)` for a renewal that arrived after
    /// sign-out, and an error if the store rejects the credential.
    pub fn renew(&self, epoch: SessionEpoch, credential: Credential) -> Result<bool> {
        let _guard = self.lock_transition();
        if !self.is_current(epoch) {
            debug!(epoch, "Discarding renewal for ended session");
            return Ok(false);
        }
        self.inner
            .store
            .set(&credential)
            .context("Failed to persist renewed credential")?;
        self.inner.auth.renewed(epoch);
        debug!(epoch, "Credential renewed");
        Ok(true)
    }

    /// End the current session. Returns whether a transition happened.
    pub fn sign_out(&self, reason: SignOutReason) -> bool {
        self.end(None, reason)
    }

    /// End the session only if `epoch` is still the live one.
    pub fn sign_out_epoch(&self, epoch: SessionEpoch, reason: SignOutReason) -> bool {
        self.end(Some(epoch), reason)
    }

    /// Push the idle deadline out. No effect while signed out.
    pub fn reset_idle(&self) -> bool {
        self.inner.idle.record_activity(ActivityKind::Manual)
    }

    pub fn record_activity(&self, kind: ActivityKind) -> bool {
        self.inner.idle.record_activity(kind)
    }

    /// Count a successful API response as activity, unless the session it
    /// was dispatched under has since ended.
    pub fn record_api_activity(&self, epoch: SessionEpoch) -> bool {
        if !self.is_current(epoch) {
            debug!(epoch, "Ignoring response from ended session");
            return false;
        }
        self.inner.idle.record_activity(ActivityKind::ApiCall)
    }

    /// Tear the session down as a user sign-out. The idle timer is only ever
    /// disarmed together with the flag dropping, never on its own.
    pub fn disarm(&self) -> bool {
        self.end(None, SignOutReason::UserLogout)
    }

    pub fn credential(&self) -> Option<Credential> {
        self.inner.store.get()
    }

    pub fn status(&self) -> AuthStatus {
        self.inner.auth.status()
    }

    pub fn is_authenticated(&self) -> bool {
        self.inner.auth.is_authenticated()
    }

    pub fn is_current(&self, epoch: SessionEpoch) -> bool {
        let status = self.inner.auth.status();
        status.authenticated && status.epoch == epoch
    }

    pub fn idle(&self) -> &IdleTimer {
        &self.inner.idle
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.auth.subscribe()
    }

    pub fn expiry_notices(&self) -> watch::Receiver<ExpiryNotice> {
        self.inner.idle.subscribe()
    }

    fn end(&self, expected: Option<SessionEpoch>, reason: SignOutReason) -> bool {
        let _guard = self.lock_transition();
        let status = self.inner.auth.status();
        if expected.is_some_and(|e| !status.authenticated || e != status.epoch) {
            return false;
        }

        self.inner.idle.disarm();
        if let Err(e) = self.inner.store.clear() {
            warn!(error = %e, "Failed to clear stored credential");
        }

        match self.inner.auth.sign_out(expected, reason) {
            Some(epoch) => {
                info!(epoch, %reason, "Signed out");
                true
            }
            None => false,
        }
    }

    fn lock_transition(&self) -> std::sync::MutexGuard<'_, ()> {
        self.inner
            .transition
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use tokio::time::{sleep, sleep_until, Instant};

    use super::*;
    use crate::auth::MemoryStore;

    /// Memory store whose writes can be made to fail, like a locked keychain.
    #[derive(Default)]
    struct FlakyStore {
        slot: MemoryStore,
        fail_writes: AtomicBool,
    }

    impl CredentialStore for FlakyStore {
        fn get(&self) -> Option<Credential> {
            self.slot.get()
        }

        fn set(&self, credential: &Credential) -> anyhow::Result<()> {
            if self.fail_writes.load(Ordering::SeqCst) {
                anyhow::bail!("keychain is locked");
            }
            self.slot.set(credential)
        }

        fn clear(&self) -> anyhow::Result<()> {
            self.slot.clear()
        }
    }

    const MINUTE: Duration = Duration::from_secs(60);

    fn lifecycle() -> (SessionLifecycle, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let lifecycle = SessionLifecycle::new(store.clone(), IdleConfig::default());
        (lifecycle, store)
    }

    fn count_sign_outs(rx: &mut broadcast::Receiver<SessionEvent>) -> usize {
        let mut count = 0;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, SessionEvent::SignedOut { .. }) {
                count += 1;
            }
        }
        count
    }

    #[tokio::test(start_paused = true)]
    async fn test_sign_in_persists_and_arms() {
        let (lifecycle, store) = lifecycle();
        let epoch = lifecycle.sign_in(Credential::new("token")).unwrap();

        assert_eq!(epoch, 1);
        assert!(lifecycle.is_authenticated());
        assert!(lifecycle.idle().is_armed());
        assert_eq!(store.get(), Some(Credential::new("token")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timeout_signs_out_exactly_once() {
        let (lifecycle, store) = lifecycle();
        let mut events = lifecycle.subscribe();
        lifecycle.sign_in(Credential::new("token")).unwrap();

        // A reset early on must not leave its predecessor's timer behind
        sleep(MINUTE * 3).await;
        lifecycle.reset_idle();
        let deadline = lifecycle.idle().deadline().unwrap();

        sleep_until(deadline - Duration::from_secs(1)).await;
        assert!(lifecycle.is_authenticated());

        sleep_until(deadline + Duration::from_secs(1)).await;
        assert!(!lifecycle.is_authenticated());
        assert!(store.get().is_none());
        assert!(!lifecycle.idle().is_armed());

        sleep(MINUTE * 60).await;
        assert_eq!(count_sign_outs(&mut events), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sign_out_disarms_immediately() {
        let (lifecycle, store) = lifecycle();
        let mut events = lifecycle.subscribe();
        lifecycle.sign_in(Credential::new("token")).unwrap();

        sleep(MINUTE * 10).await;
        assert!(lifecycle.sign_out(SignOutReason::UserLogout));
        assert!(!lifecycle.sign_out(SignOutReason::UserLogout));
        assert!(store.get().is_none());
        assert!(!lifecycle.idle().is_armed());

        sleep(MINUTE * 45).await;
        assert!(!lifecycle.is_authenticated());
        assert_eq!(count_sign_outs(&mut events), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_epoch_cannot_touch_new_session() {
        let (lifecycle, store) = lifecycle();
        let first = lifecycle.sign_in(Credential::new("one")).unwrap();
        lifecycle.sign_out(SignOutReason::UserLogout);
        let second = lifecycle.sign_in(Credential::new("two")).unwrap();
        assert_ne!(first, second);

        assert!(!lifecycle.sign_out_epoch(first, SignOutReason::RefreshFailed));
        assert!(!lifecycle.renew(first, Credential::new("late")).unwrap());
        assert!(!lifecycle.record_api_activity(first));

        assert!(lifecycle.is_authenticated());
        assert_eq!(store.get(), Some(Credential::new("two")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_activity_ignored_after_sign_out() {
        let (lifecycle, _store) = lifecycle();
        let epoch = lifecycle.sign_in(Credential::new("token")).unwrap();
        lifecycle.sign_out(SignOutReason::UserLogout);

        assert!(!lifecycle.record_activity(ActivityKind::KeyDown));
        assert!(!lifecycle.record_api_activity(epoch));
        assert!(!lifecycle.idle().is_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_restore_from_stored_credential() {
        let store = Arc::new(MemoryStore::new());
        store.set(&Credential::new("saved")).unwrap();

        let lifecycle = SessionLifecycle::new(store.clone(), IdleConfig::default());
        assert!(lifecycle.restore());
        assert!(lifecycle.is_authenticated());
        assert!(lifecycle.idle().is_armed());
        assert!(!lifecycle.restore());

        let empty = SessionLifecycle::new(Arc::new(MemoryStore::new()), IdleConfig::default());
        assert!(!empty.restore());
        assert!(!empty.idle().is_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_renew_keeps_epoch_and_replaces_credential() {
        let (lifecycle, store) = lifecycle();
        let mut events = lifecycle.subscribe();
        let epoch = lifecycle.sign_in(Credential::new("old")).unwrap();

        assert!(lifecycle.renew(epoch, Credential::new("new")).unwrap());
        assert_eq!(lifecycle.status().epoch, epoch);
        assert_eq!(store.get(), Some(Credential::new("new")));

        assert_eq!(events.try_recv().unwrap(), SessionEvent::SignedIn { epoch });
        assert_eq!(events.try_recv().unwrap(), SessionEvent::Renewed { epoch });
    }

    #[tokio::test(start_paused = true)]
    async fn test_sign_in_on_active_session_arms_fresh_deadline() {
        let (lifecycle, store) = lifecycle();
        let epoch = lifecycle.sign_in(Credential::new("a")).unwrap();

        sleep(MINUTE * 10).await;
        let now = Instant::now();
        assert_eq!(lifecycle.sign_in(Credential::new("b")).unwrap(), epoch);
        assert_eq!(lifecycle.idle().deadline(), Some(now + MINUTE * 30));
        assert_eq!(store.get(), Some(Credential::new("b")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disarm_ends_session_and_next_sign_in_is_armed() {
        let (lifecycle, store) = lifecycle();
        let first = lifecycle.sign_in(Credential::new("a")).unwrap();

        assert!(lifecycle.disarm());
        assert!(!lifecycle.is_authenticated());
        assert!(!lifecycle.idle().is_armed());
        assert!(store.get().is_none());

        let second = lifecycle.sign_in(Credential::new("b")).unwrap();
        assert_ne!(first, second);
        assert!(lifecycle.idle().is_armed());

        sleep(MINUTE * 180).await;
        assert!(!lifecycle.is_authenticated());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_credential_write_leaves_session_signed_out() {
        let store = Arc::new(FlakyStore::default());
        store.fail_writes.store(true, Ordering::SeqCst);
        let lifecycle = SessionLifecycle::new(store.clone(), IdleConfig::default());
        let mut events = lifecycle.subscribe();

        assert!(lifecycle.sign_in(Credential::new("token")).is_err());

        assert!(!lifecycle.is_authenticated());
        assert!(!lifecycle.idle().is_armed());
        assert!(lifecycle.credential().is_none());
        assert!(events.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_renewal_write_is_reported() {
        let store = Arc::new(FlakyStore::default());
        let lifecycle = SessionLifecycle::new(store.clone(), IdleConfig::default());
        let epoch = lifecycle.sign_in(Credential::new("old")).unwrap();

        store.fail_writes.store(true, Ordering::SeqCst);
        assert!(lifecycle.renew(epoch, Credential::new("new")).is_err());
        assert_eq!(lifecycle.credential(), Some(Credential::new("old")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_activity_from_thread_outside_runtime() {
        let (lifecycle, _store) = lifecycle();
        lifecycle.sign_in(Credential::new("token")).unwrap();
        sleep(MINUTE * 20).await;

        let host = lifecycle.clone();
        let reset_at = Instant::now();
        let reset = std::thread::spawn(move || host.record_activity(ActivityKind::PointerDown))
            .join()
            .unwrap();

        assert!(reset);
        let deadline = lifecycle.idle().deadline().unwrap();
        assert!(deadline >= reset_at + MINUTE * 30);

        sleep(MINUTE * 20).await;
        assert!(lifecycle.is_authenticated());
        sleep(MINUTE * 11).await;
        assert!(!lifecycle.is_authenticated());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_idle_only_while_signed_in() {
        let (lifecycle, _store) = lifecycle();
        assert!(!lifecycle.reset_idle());

        lifecycle.sign_in(Credential::new("token")).unwrap();
        sleep(MINUTE * 25).await;
        let now = Instant::now();
        assert!(lifecycle.reset_idle());
        assert_eq!(lifecycle.idle().deadline(), Some(now + MINUTE * 30));
    }
}
