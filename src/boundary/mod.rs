//! # Boundary adapter
//!
//! The typed external surface: registration and sessions, per-user rate
//! limiting, input validation, and translation of internal errors into the
//! stable wire taxonomy. The HTTP/JSON framing that sits in front of this
//! is a thin transport concern and lives outside the core.

pub mod adapter;
pub mod auth;
pub mod ratelimit;

pub use adapter::{
    BoundaryAdapter, ExportResponse, MemoryPage, MemoryView, RegisterResponse, SessionResponse,
    WireError, WireResult,
};
pub use auth::{AuthManager, Principal, RegisteredUser};
pub use ratelimit::{OpClass, RateLimiter};
