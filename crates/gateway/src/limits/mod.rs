//! Admission control: the token-bucket limiter and the HTTP/WS rule
//! layer on top of it.

pub mod bucket;
pub mod rules;

pub use bucket::{Decision, TokenBucketLimiter};
