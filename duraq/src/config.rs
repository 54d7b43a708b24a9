use std::path::PathBuf;

use figment::providers::{Env, Format, Yaml};
use figment::Figment;
use serde::Deserialize;

use crate::queue::{DEFAULT_CONCURRENCY, DEFAULT_RETRY_LIMIT};

/// Queue settings, layered from `duraq.yml` (when present) and `DURAQ_*`
/// environment variables, env taking precedence.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_retry_limit")]
    pub retry_limit: i64,
}

impl Config {
    pub fn load() -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Yaml::file("duraq.yml"))
            .merge(Env::prefixed("DURAQ_"))
            .extract()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            concurrency: default_concurrency(),
            retry_limit: default_retry_limit(),
        }
    }
}

fn default_database_path() -> PathBuf {
    PathBuf::from("duraq.db")
}

fn default_concurrency() -> usize {
    DEFAULT_CONCURRENCY
}

fn default_retry_limit() -> i64 {
    DEFAULT_RETRY_LIMIT
}
