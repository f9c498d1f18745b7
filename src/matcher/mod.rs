//! Exact-substring multi-pattern matching.

pub mod automaton;
pub mod types;

pub use automaton::{PatternStore, PatternStoreBuilder};
pub use types::{Binding, MatchSpan};
