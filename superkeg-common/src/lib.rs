//! # SuperKeg Common Library
//!
//! Shared code for the SuperKeg processes including:
//! - Keg store: schema, models, and the atomic pour commit
//! - Runtime settings stored in the database
//! - Event types (KegEvent enum) and the EventBus
//! - Bootstrap configuration loading
//! - Unit conversions

pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod units;

pub use error::{Error, Result};
