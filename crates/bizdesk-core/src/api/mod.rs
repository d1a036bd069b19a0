//! REST API client module for the bizdesk backend.
//!
//! This module provides the `ApiClient` for authenticated calls and the
//! sign-in, registration and sign-out actions.
//!
//! The API uses bearer token authentication. An expired token is renewed
//! transparently through the refresh endpoint, once per call.

pub mod client;
pub mod error;

pub use client::{ApiClient, ApiSettings, Payload, DEFAULT_BASE_URL};
pub use reqwest::Method;
pub use error::ApiError;
