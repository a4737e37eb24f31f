//! Request-facing facade over the limiters.
//!
//! The facade owns nothing but a key extractor and a limiter; status codes,
//! retries and transport concerns stay with the embedding service.

mod extractor;
mod gate;

pub use extractor::{KeyExtractor, PathExtractor};
pub use gate::{Gate, Verdict};
