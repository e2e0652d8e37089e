//! Mass-Marking Engine (spec §4.H).

pub mod engine;
pub mod parser;

pub use engine::{MarkingOutcome, MassMarkingEngine, NotificationSummary};
