//! Reliability helpers used by the coordinator
//!
//! - [`RetryPolicy`] - delays and budget for tasks whose worker was lost
//! - [`TimeoutKind`] - the three places a task can time out

mod retry;
mod timeout;

pub use retry::RetryPolicy;
pub use timeout::{exceeded, TimeoutKind};
