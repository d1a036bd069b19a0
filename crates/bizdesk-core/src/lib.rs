//! bizdesk core - session lifecycle for the bizdesk business client.
//!
//! Authenticated API calls renew an expired credential once and retry once;
//! an idle timer warns before forcing the session closed; both act through
//! one [`SessionLifecycle`] so they never race each other.

pub mod api;
pub mod auth;
pub mod config;
pub mod idle;
pub mod lifecycle;

pub use api::{ApiClient, ApiError, ApiSettings, Method, Payload};
pub use auth::{Credential, CredentialStore, SessionEvent, SignOutReason};
pub use config::Config;
pub use idle::{ActivityKind, ExpiryNotice, IdleConfig, IdleTimer};
pub use lifecycle::SessionLifecycle;
