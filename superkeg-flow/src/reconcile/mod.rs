//! Reconciling measured pours with keg state
//!
//! - `reconciler`: commit finished pours (keg API first, database fallback)
//! - `progress`: live progress board and the display publisher task
//! - `remote`: HTTP clients for the keg web application

pub mod progress;
pub mod reconciler;
pub mod remote;

pub use progress::{display_estimate, run_publisher, ProgressBoard};
pub use reconciler::{CommitReport, VolumeReconciler};
pub use remote::{DisplayPublisher, HttpDisplayPublisher, KegApi, KegApiClient, RemoteOutcome};
