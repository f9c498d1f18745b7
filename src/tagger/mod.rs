pub mod builder;
pub mod registry;
pub mod reload;
pub mod service;
pub mod source;
pub mod types;

pub use builder::build_tagger;
pub use registry::{ReloadReport, TaggerRegistry};
pub use reload::reload_loop;
pub use service::MatchService;
pub use source::DictionarySource;
pub use types::*;

// Module-level constants
pub const TARGET_TAGGER: &str = "tagger";
