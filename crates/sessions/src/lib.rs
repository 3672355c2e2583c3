//! Per-session chat state: conversation history, the model-facing
//! context, the media tables with their staging/pending lifecycle, and
//! the resumable-upload table.

pub mod history;
pub mod session;
pub mod store;
pub mod uploads;

pub use history::{HistoryEntry, HistoryLog, ToolState};
pub use session::{ChatSession, ResumableInit};
pub use store::SessionStore;
pub use uploads::ResumableUpload;
