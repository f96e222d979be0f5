//! HTTP plumbing for the session core.
//!
//! This module provides the `AuthClient` for the authentication and refresh
//! endpoints, and the `Transport` seam through which every protected request
//! is executed.
//!
//! The endpoints issue JWT access/refresh pairs; protected resources expect
//! the access token as a bearer credential.

pub mod client;
pub mod error;
pub mod transport;

pub use client::{AuthBackend, AuthClient};
pub use error::ApiError;
pub use transport::{ApiRequest, ApiResponse, HttpTransport, Transport};
