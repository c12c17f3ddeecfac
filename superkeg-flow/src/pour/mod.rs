//! Pour session detection

pub mod session;

pub use session::{FinishedPour, PourProgress, PourSession, PourSessionTracker, SessionOutcome};
