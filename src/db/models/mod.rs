pub mod clip_outcome;

pub use clip_outcome::{ClipOutcomeCounts, ClipOutcomeRecord};
