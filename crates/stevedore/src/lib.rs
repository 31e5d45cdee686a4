mod config;
mod dispatcher;
mod error;
pub mod metrics;
mod pool;
mod request;
mod runner;
mod worker;


pub use crate::config::*;
pub use crate::dispatcher::*;
pub use crate::error::*;
pub use crate::metrics::{Metrics, MetricsSnapshot};
pub use crate::pool::*;
pub use crate::request::*;
pub use crate::worker::*;
