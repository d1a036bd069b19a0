//! Idle-logout controller.
//!
//! Activity signals keep a rolling deadline alive. A warning is published
//! `warning_window` before the deadline, and the session is ended when it
//! passes with no further activity.

pub mod activity;
pub mod timer;

pub use activity::ActivityKind;
pub use timer::{ExpiryNotice, IdleConfig, IdleTimer, DEFAULT_IDLE_TIMEOUT, DEFAULT_WARNING_WINDOW};
