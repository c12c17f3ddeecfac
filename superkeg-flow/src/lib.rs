//! # SuperKeg Flow Monitor Library (superkeg-flow)
//!
//! Turns flow-meter pulses into recorded pours.
//!
//! **Pipeline:** edge source -> pulse counter -> pour session tracker ->
//! volume reconciler (keg API, database fallback), one pipeline per tap,
//! owned by the multi-tap coordinator. An HTTP/SSE control interface exposes
//! status, calibration and tap management.

pub mod api;
pub mod calibration;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod pour;
pub mod reconcile;
pub mod sensor;

pub use coordinator::MultiTapCoordinator;
pub use error::{Error, Result};
