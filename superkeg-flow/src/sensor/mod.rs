//! Flow-meter input: edge sources and the pulse counter
//!
//! Edge sources turn hardware (or simulated) rising edges into timestamps on
//! a per-tap channel. The pulse counter turns accepted edges into volume and
//! flow rate.

pub mod edge;
pub mod pulse_counter;

pub use edge::{EdgeSink, EdgeSource, EdgeSubscription, ManualSource, SimulatedSource, SysfsGpioSource};
pub use pulse_counter::{PulseCounter, PulseCounterStatus, PulseSample};
