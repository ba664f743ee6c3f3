//! Rate limiting logic and state management.

mod bucket;
mod registry;
mod sweeper;

pub use bucket::{Quota, TokenBucket};
pub use registry::LimiterRegistry;
