//! Turn orchestration: the agent seam and the streaming turn
//! controller.

pub mod agent;
pub mod turn;

pub use turn::{run_turn, sanitize_on_cancel};
