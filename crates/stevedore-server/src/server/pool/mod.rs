//! Worker pool wiring for the HTTP service.
//!
//! - [`worker`] - the [`EchoWorker`](worker::EchoWorker) each pool thread owns.
//! - [`manager`] - opens, drives and closes the pool for request handlers.

pub mod manager;
pub mod worker;
