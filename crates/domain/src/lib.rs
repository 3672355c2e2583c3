//! Shared domain types for ClipForge: configuration, the common error
//! type, model-facing context messages, WebSocket wire frames, and the
//! edit-template data model.

pub mod config;
pub mod error;
pub mod message;
pub mod template;
pub mod wire;

pub use error::{Error, Result};

/// Current wall-clock time as fractional unix seconds.
///
/// History entries, artifact metadata, and templates all carry float
/// timestamps on the wire.
pub fn unix_now() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// A short random hex id (lowercase), `len` chars, `len <= 32`.
pub fn short_hex_id(len: usize) -> String {
    let mut s = uuid::Uuid::new_v4().simple().to_string();
    s.truncate(len);
    s
}
