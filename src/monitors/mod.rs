//! Fleet-wide monitoring state shared by every session
//!
//! - `critical`: threshold hysteresis per device
//! - `top`: Top-N ranking per resource category
//! - `derivation`: turns a poll into series, threshold and ranking updates

pub mod critical;
pub mod derivation;
pub mod top;

pub use critical::{CriticalDetector, CriticalTransition, Resource, ThresholdRegistry};
pub use derivation::{Derivation, Deriver};
pub use top::{TopCategory, TopEntry, TopTable, TopValue};
