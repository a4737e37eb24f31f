//! Rate limiting logic and state management.

mod backend;
mod key;
mod limiter;
mod registry;
mod scheduler;
mod token_bucket;
mod window;

pub use backend::{Admission, Decision};
pub use key::LimitKey;
pub use limiter::{RateLimiter, WindowLimiter};
pub use registry::{Counter, Registry};
pub use scheduler::{Scheduler, TickFn, TickHandle, TokioScheduler};
pub use token_bucket::TokenBucket;
pub use window::WindowCounter;
