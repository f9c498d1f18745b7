pub mod core;
mod dictionary;
mod document;
mod schema;
mod statistics;

// Re-export Database and essential traits
pub use self::core::Database;
pub use self::core::DbLockErrorExt;
