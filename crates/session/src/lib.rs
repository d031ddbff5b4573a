//! Porthole Session Lifecycle
//!
//! Owns the live bastion session: creates it, polls it to readiness with
//! jittered backoff, watches it for the refresh window and expiry, and
//! tears it down. There is deliberately no in-place extension — a session
//! close to expiry is replaced wholesale by the supervisor.

mod error;
mod manager;

pub use error::{Result, SessionError};
pub use manager::{SessionEvent, SessionManager};
