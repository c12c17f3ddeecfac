//! HTTP control API
//!
//! Status, calibration and tap management for the flow monitor, plus an SSE
//! stream of keg events.

pub mod handlers;
pub mod server;
pub mod sse;

pub use server::{create_router, run, AppContext};
