//! Authentication module for credentials and the signed-in flag.
//!
//! This module provides:
//! - `CredentialStore`: the single durable slot for the access token
//! - `AuthState`: the process-wide authenticated flag and its transition events
//! - `SessionRefresher`: the one-shot credential renewal call

pub mod credentials;
pub mod refresh;
pub mod state;

pub use credentials::{Credential, CredentialStore, FileStore, KeyringStore, MemoryStore};
pub use refresh::{RefreshError, SessionRefresher};
pub use state::{AuthState, AuthStatus, SessionEpoch, SessionEvent, SignOutReason};
