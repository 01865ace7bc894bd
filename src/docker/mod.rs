pub mod compose;
pub mod discovery;
pub mod env;
#[cfg(test)]
pub mod fake;
pub mod runtime;
pub mod sequencer;
pub mod snapshot;
pub mod synth;
