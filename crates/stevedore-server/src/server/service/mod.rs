//! HTTP routes and the mapping from pool outcomes to responses.
//!
//! ## Structure
//!
//! - [`handler`] - axum `Router` and request handlers.

pub mod handler;
