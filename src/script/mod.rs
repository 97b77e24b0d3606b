//! Job script handling: key extraction, synthesis and redaction.

pub mod extract;
pub mod synth;

pub use extract::{KeyLookup, find_key};
pub use synth::{ConnectionBlock, FAILURE_SENTINEL, SUCCESS_SENTINEL, SynthesizedScript};
