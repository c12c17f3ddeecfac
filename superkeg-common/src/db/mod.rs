//! Database models and queries

pub mod init;
pub mod kegs;
pub mod models;
pub mod settings;

pub use init::*;
pub use kegs::*;
pub use models::*;
pub use settings::*;
