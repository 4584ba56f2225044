//! WebSocket pub/sub for job status updates.
//!
//! Observers connect, subscribe to one job id at a time, and receive the
//! status frames the coordinator broadcasts for that job.

mod handler;
pub mod manager;

pub use handler::{run_connection, ws_handler};
pub use manager::{BroadcastError, ConnectionId, ConnectionManager};
