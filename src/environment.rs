use std::env;
use std::str::FromStr;
use tokio::time::Duration;

pub const DEFAULT_DOCUMENT_ELEMENTS: &str =
    "briefTitle;officialTitle;briefSummary;detailedDescription;studyDesign";

/// Retrieves an environment variable and splits it into a vector of strings based on a delimiter.
///
/// # Arguments
/// - `var`: The name of the environment variable.
/// - `delimiter`: The character to split the environment variable's value by.
///
/// # Returns
/// - `Vec<String>`, empty pieces removed
pub fn get_env_var_as_vec(var: &str, delimiter: char) -> Vec<String> {
    split_list(&env::var(var).unwrap_or_default(), delimiter)
}

/// Parses an environment variable, falling back to `default` when unset or unparsable.
pub fn get_env_var_or<T: FromStr>(var: &str, default: T) -> T {
    env::var(var)
        .ok()
        .and_then(|value| value.trim().parse::<T>().ok())
        .unwrap_or(default)
}

fn split_list(value: &str, delimiter: char) -> Vec<String> {
    value
        .split(delimiter)
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Runtime settings for the tag service and the retag sweep.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub database_path: String,
    pub port: u16,
    pub reload_interval: Duration,
    /// `None` disables the in-process retag sweep.
    pub retag_interval: Option<Duration>,
    pub retag_concurrency: usize,
    pub document_elements: Vec<String>,
    pub stats_top_n: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            database_path: "tagservice.db".to_string(),
            port: 8080,
            reload_interval: Duration::from_secs(300),
            retag_interval: Some(Duration::from_secs(300)),
            retag_concurrency: 4,
            document_elements: split_list(DEFAULT_DOCUMENT_ELEMENTS, ';'),
            stats_top_n: 200,
        }
    }
}

impl ServiceConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let document_elements = match get_env_var_as_vec("DOCUMENT_ELEMENTS", ';') {
            elements if elements.is_empty() => defaults.document_elements,
            elements => elements,
        };

        let retag_secs: u64 = get_env_var_or("RETAG_INTERVAL", 300);

        Self {
            database_path: env::var("DATABASE_PATH").unwrap_or(defaults.database_path),
            port: get_env_var_or("PORT", defaults.port),
            reload_interval: Duration::from_secs(get_env_var_or("RELOAD_INTERVAL", 300u64).max(1)),
            retag_interval: (retag_secs > 0).then(|| Duration::from_secs(retag_secs)),
            retag_concurrency: get_env_var_or("RETAG_CONCURRENCY", defaults.retag_concurrency)
                .max(1),
            document_elements,
            stats_top_n: get_env_var_or("STATS_TOP_N", defaults.stats_top_n),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_list_drops_blank_pieces() {
        assert_eq!(
            split_list(" briefTitle ; ;studyDesign;", ';'),
            vec!["briefTitle".to_string(), "studyDesign".to_string()]
        );
        assert!(split_list("", ';').is_empty());
    }

    #[test]
    fn test_default_elements() {
        let config = ServiceConfig::default();
        assert_eq!(config.document_elements.len(), 5);
        assert_eq!(config.document_elements[0], "briefTitle");
        assert_eq!(config.stats_top_n, 200);
    }

    #[test]
    fn test_get_env_var_or_falls_back() {
        assert_eq!(get_env_var_or("TAGSERVICE_SURELY_UNSET_VAR", 42u16), 42);
    }
}
