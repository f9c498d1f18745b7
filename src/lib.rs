pub mod annotate;
pub mod api;
pub mod db;
pub mod environment;
pub mod error;
pub mod logging;
pub mod matcher;
pub mod retag;
pub mod tagger;

pub const TARGET_WEB_REQUEST: &str = "web_request";
pub const TARGET_DB: &str = "db_query";
