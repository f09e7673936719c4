//! Configuration handling for sqlweave.
//!
//! A database is described by a locator URL. Options this crate understands are
//! stripped from the query string; the rest is passed to the SQLite driver.
//! The CLI binary adds its own arguments on top via [`Config`].

use crate::db::params::{Binding, TaggedValue};
use crate::models::{ParamType, Value};
use clap::Parser;
use std::collections::HashMap;
use std::time::Duration;
use url::Url;

// Pool configuration defaults
pub const DEFAULT_MAX_CONNECTIONS: u32 = 4;
pub const DEFAULT_ACQUIRE_TIMEOUT_SECS: u64 = 30;

/// Prepared statements kept per connection.
pub const DEFAULT_STATEMENT_CACHE: usize = 32;

// Transient-conflict retry defaults
pub const DEFAULT_RETRY_ATTEMPTS: u32 = 3;
pub const DEFAULT_RETRY_BACKOFF_MS: u64 = 25;
pub const DEFAULT_RETRY_MAX_BACKOFF_MS: u64 = 1000;

/// Connection pool configuration options parsed from the locator.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct PoolOptions {
    /// Maximum connections in pool (default: 4)
    pub max_connections: Option<u32>,
    /// Connection acquire timeout in seconds (default: 30)
    pub acquire_timeout_secs: Option<u64>,
}

impl PoolOptions {
    /// Get max_connections with default value.
    pub fn max_connections_or_default(&self) -> u32 {
        self.max_connections.unwrap_or(DEFAULT_MAX_CONNECTIONS)
    }

    /// Get acquire_timeout with default value.
    pub fn acquire_timeout_or_default(&self) -> u64 {
        self.acquire_timeout_secs
            .unwrap_or(DEFAULT_ACQUIRE_TIMEOUT_SECS)
    }

    /// Validate pool options and return an error message if invalid.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_connections == Some(0) {
            return Err("max_connections must be greater than 0".to_string());
        }
        Ok(())
    }
}

/// How a session retries a unit of work after a transient conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_RETRY_ATTEMPTS,
            initial_backoff: Duration::from_millis(DEFAULT_RETRY_BACKOFF_MS),
            max_backoff: Duration::from_millis(DEFAULT_RETRY_MAX_BACKOFF_MS),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay after the given failed attempt (1-based), doubling each time.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.max_backoff)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.max_attempts == 0 {
            return Err("retry_attempts must be greater than 0".to_string());
        }
        Ok(())
    }
}

/// Database configuration parsed from a locator.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Locator with crate-specific options removed.
    pub connection_string: String,
    /// Open without write access.
    pub read_only: bool,
    /// Engine-side wait on a locked database, in milliseconds.
    pub busy_timeout_ms: Option<u64>,
    /// Prepared statements kept per connection; 0 disables caching.
    pub statement_cache: Option<usize>,
    /// Passphrase for SQLCipher-encrypted databases.
    pub encryption_key: Option<String>,
    pub pool_options: PoolOptions,
    pub retry: RetryPolicy,
}

impl DatabaseConfig {
    /// Option keys that we extract from URL query parameters.
    const OPTION_KEYS: &'static [&'static str] = &[
        "max_connections",
        "acquire_timeout",
        "statement_cache",
        "busy_timeout",
        "read_only",
        "encryption_key",
        "retry_attempts",
        "retry_backoff",
        "retry_max_backoff",
    ];

    /// Parse a database locator.
    ///
    /// # Format
    ///
    /// ```text
    /// sqlite:data.db
    /// sqlite:///var/lib/app/data.db?max_connections=8&retry_attempts=5
    /// sqlite::memory:
    /// /var/lib/app/data.db                # bare paths get the sqlite scheme
    /// ```
    ///
    /// Numeric options that fail to parse are ignored and the default applies.
    pub fn parse(s: &str) -> Result<Self, String> {
        let locator = if s.contains(':') && !s.starts_with('/') {
            s.to_string()
        } else {
            format!("sqlite://{}", s)
        };

        let mut url = Url::parse(&locator).map_err(|e| format!("Invalid URL: {e}"))?;
        if !url.scheme().eq_ignore_ascii_case("sqlite") {
            return Err(format!(
                "Unsupported database scheme '{}'. Only sqlite locators are supported.",
                url.scheme()
            ));
        }

        let mut opts = Self::extract_options(&mut url, Self::OPTION_KEYS);

        let pool_options = PoolOptions {
            max_connections: opts.remove("max_connections").and_then(|v| v.parse().ok()),
            acquire_timeout_secs: opts.remove("acquire_timeout").and_then(|v| v.parse().ok()),
        };
        pool_options.validate()?;

        let defaults = RetryPolicy::default();
        let retry = RetryPolicy {
            max_attempts: opts
                .remove("retry_attempts")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_attempts),
            initial_backoff: opts
                .remove("retry_backoff")
                .and_then(|v| v.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.initial_backoff),
            max_backoff: opts
                .remove("retry_max_backoff")
                .and_then(|v| v.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.max_backoff),
        };
        retry.validate()?;

        let read_only = opts
            .remove("read_only")
            .is_some_and(|v| v.eq_ignore_ascii_case("true"));

        Ok(Self {
            connection_string: url.to_string(),
            read_only,
            busy_timeout_ms: opts.remove("busy_timeout").and_then(|v| v.parse().ok()),
            statement_cache: opts.remove("statement_cache").and_then(|v| v.parse().ok()),
            encryption_key: opts.remove("encryption_key").filter(|v| !v.is_empty()),
            pool_options,
            retry,
        })
    }

    pub fn busy_timeout(&self) -> Option<Duration> {
        self.busy_timeout_ms.map(Duration::from_millis)
    }

    pub fn statement_cache_or_default(&self) -> usize {
        self.statement_cache.unwrap_or(DEFAULT_STATEMENT_CACHE)
    }

    /// Extract crate-specific options from URL query params, keeping others for the driver.
    fn extract_options(url: &mut Url, keys: &[&str]) -> HashMap<String, String> {
        let mut opts = HashMap::new();
        let remaining: Vec<(String, String)> = url
            .query_pairs()
            .filter_map(|(k, v)| {
                let key_lower = k.to_ascii_lowercase();
                if keys.contains(&key_lower.as_str()) {
                    opts.insert(key_lower, v.into_owned());
                    None
                } else {
                    Some((k.into_owned(), v.into_owned()))
                }
            })
            .collect();

        if remaining.is_empty() {
            url.set_query(None);
        } else {
            url.query_pairs_mut().clear().extend_pairs(remaining);
        }
        opts
    }
}

/// Parse a CLI parameter.
///
/// `TAG:VALUE` binds one value for a `?` marker and `TAG*:V1,V2,...` binds a
/// list for a `?*` marker. Tags are `i` integer, `d` float, `s` text and `b`
/// blob (the text's bytes). A bare `null` binds NULL.
pub fn parse_param(s: &str) -> Result<Binding, String> {
    if s.eq_ignore_ascii_case("null") {
        return Ok(Binding::Single(TaggedValue::new('s', Value::Null)));
    }
    let (tag, raw) = s
        .split_once(':')
        .ok_or_else(|| format!("Expected TAG:VALUE, got '{}'", s))?;

    let (tag, spread) = match tag.strip_suffix('*') {
        Some(tag) => (tag, true),
        None => (tag, false),
    };
    let mut chars = tag.chars();
    let (Some(code), None) = (chars.next(), chars.next()) else {
        return Err(format!("Type tag must be one character, got '{}'", tag));
    };
    let kind =
        ParamType::from_tag(code).ok_or_else(|| format!("Unknown type tag '{}'", code))?;

    if spread {
        if raw.is_empty() {
            return Ok(Binding::List(Vec::new()));
        }
        let items = raw
            .split(',')
            .map(|item| parse_scalar(kind, item).map(|v| TaggedValue::typed(kind, v)))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Binding::List(items))
    } else {
        Ok(Binding::Single(TaggedValue::typed(kind, parse_scalar(kind, raw)?)))
    }
}

fn parse_scalar(kind: ParamType, raw: &str) -> Result<Value, String> {
    match kind {
        ParamType::Integer => raw
            .trim()
            .parse::<i64>()
            .map(Value::Integer)
            .map_err(|e| format!("Invalid integer '{}': {}", raw, e)),
        ParamType::Float => raw
            .trim()
            .parse::<f64>()
            .map(Value::Float)
            .map_err(|e| format!("Invalid float '{}': {}", raw, e)),
        ParamType::Text => Ok(Value::Text(raw.to_string())),
        ParamType::Blob => Ok(Value::Blob(raw.as_bytes().to_vec())),
    }
}

/// Configuration for the sqlweave CLI.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "sqlweave",
    about = "Run a parameterized statement against a SQLite database and reshape its rows",
    version,
    author
)]
pub struct Config {
    /// Database locator, e.g. "sqlite:data.db?max_connections=2"
    #[arg(short = 'd', long = "database", value_name = "URL", env = "SQLWEAVE_DATABASE")]
    pub database: String,

    /// Statement text. `?` binds one parameter, `?*` binds a list.
    #[arg(value_name = "SQL")]
    pub sql: String,

    /// Parameters in binding order: "i:42", "s:text", "d:1.5", "i*:1,2,3", "null"
    #[arg(short = 'p', long = "param", value_name = "TAG:VALUE", value_parser = parse_param)]
    pub params: Vec<Binding>,

    /// Run for side effects and print affected rows and the last insert id
    #[arg(short = 'x', long, conflicts_with_all = ["key", "group"])]
    pub execute: bool,

    /// Collect rows keyed by this column instead of streaming them
    #[arg(short = 'k', long, value_name = "COLUMN")]
    pub key: Option<String>,

    /// Group a column's values into a list: "COLUMN:LABEL"
    #[arg(short = 'g', long, value_name = "COLUMN:LABEL")]
    pub group: Option<String>,

    /// Require exactly one distinct key
    #[arg(long)]
    pub one: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn", env = "SQLWEAVE_LOG_LEVEL")]
    pub log_level: String,

    /// Enable JSON logging format
    #[arg(long, env = "SQLWEAVE_JSON_LOGS")]
    pub json_logs: bool,
}

impl Config {
    /// Parse configuration from command line arguments.
    pub fn parse_args() -> Self {
        Self::parse()
    }

    pub fn database_config(&self) -> Result<DatabaseConfig, String> {
        DatabaseConfig::parse(&self.database)
    }

    /// Split `--group` into (column, label).
    pub fn group_target(&self) -> Result<Option<(String, String)>, String> {
        self.group
            .as_deref()
            .map(|g| {
                g.split_once(':')
                    .filter(|(column, label)| !column.is_empty() && !label.is_empty())
                    .map(|(column, label)| (column.to_string(), label.to_string()))
                    .ok_or_else(|| format!("Expected COLUMN:LABEL, got '{}'", g))
            })
            .transpose()
    }

    /// Whether rows go through the collecting pipeline rather than being streamed.
    pub fn collects(&self) -> bool {
        self.key.is_some() || self.group.is_some() || self.one
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_defaults() {
        let config = DatabaseConfig::parse("sqlite:data.db").unwrap();
        assert_eq!(config.connection_string, "sqlite:data.db");
        assert!(!config.read_only);
        assert_eq!(config.pool_options, PoolOptions::default());
        assert_eq!(config.pool_options.max_connections_or_default(), DEFAULT_MAX_CONNECTIONS);
        assert_eq!(config.statement_cache_or_default(), DEFAULT_STATEMENT_CACHE);
        assert_eq!(config.retry, RetryPolicy::default());
        assert_eq!(config.busy_timeout(), None);
        assert_eq!(config.encryption_key, None);
    }

    #[test]
    fn test_parse_strips_known_options() {
        let config = DatabaseConfig::parse(
            "sqlite:data.db?max_connections=8&mode=rwc&statement_cache=0&busy_timeout=250",
        )
        .unwrap();
        assert_eq!(config.pool_options.max_connections, Some(8));
        assert_eq!(config.statement_cache, Some(0));
        assert_eq!(config.busy_timeout(), Some(Duration::from_millis(250)));
        assert_eq!(config.connection_string, "sqlite:data.db?mode=rwc");
    }

    #[test]
    fn test_parse_encryption_key() {
        let config = DatabaseConfig::parse("sqlite:secret.db?encryption_key=s3cr%27t&mode=rwc").unwrap();
        assert_eq!(config.encryption_key.as_deref(), Some("s3cr't"));
        assert_eq!(config.connection_string, "sqlite:secret.db?mode=rwc");

        let config = DatabaseConfig::parse("sqlite:secret.db?encryption_key=").unwrap();
        assert_eq!(config.encryption_key, None);
    }

    #[test]
    fn test_parse_retry_options() {
        let config = DatabaseConfig::parse(
            "sqlite:data.db?retry_attempts=5&retry_backoff=10&retry_max_backoff=40",
        )
        .unwrap();
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.initial_backoff, Duration::from_millis(10));
        assert_eq!(config.retry.max_backoff, Duration::from_millis(40));
    }

    #[test]
    fn test_parse_invalid_number_uses_default() {
        let config = DatabaseConfig::parse("sqlite:data.db?max_connections=lots").unwrap();
        assert_eq!(config.pool_options.max_connections, None);
    }

    #[test]
    fn test_parse_rejects_zero_connections() {
        let err = DatabaseConfig::parse("sqlite:data.db?max_connections=0").unwrap_err();
        assert!(err.contains("max_connections"));
        let err = DatabaseConfig::parse("sqlite:data.db?retry_attempts=0").unwrap_err();
        assert!(err.contains("retry_attempts"));
    }

    #[test]
    fn test_parse_read_only_case_insensitive() {
        assert!(DatabaseConfig::parse("sqlite:data.db?read_only=TRUE").unwrap().read_only);
        assert!(!DatabaseConfig::parse("sqlite:data.db?read_only=yes").unwrap().read_only);
    }

    #[test]
    fn test_parse_memory_and_bare_path() {
        let config = DatabaseConfig::parse("sqlite::memory:").unwrap();
        assert_eq!(config.connection_string, "sqlite::memory:");
        let config = DatabaseConfig::parse("/tmp/app.db").unwrap();
        assert_eq!(config.connection_string, "sqlite:///tmp/app.db");
    }

    #[test]
    fn test_parse_rejects_other_schemes() {
        let err = DatabaseConfig::parse("postgres://localhost/db").unwrap_err();
        assert!(err.contains("Unsupported database scheme"));
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_backoff: Duration::from_millis(25),
            max_backoff: Duration::from_millis(100),
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(25));
        assert_eq!(policy.backoff(2), Duration::from_millis(50));
        assert_eq!(policy.backoff(3), Duration::from_millis(100));
        assert_eq!(policy.backoff(30), Duration::from_millis(100));
    }

    #[test]
    fn test_parse_param_scalar() {
        assert_eq!(
            parse_param("i:42").unwrap(),
            Binding::Single(TaggedValue::new('i', 42))
        );
        assert_eq!(
            parse_param("s:a:b").unwrap(),
            Binding::Single(TaggedValue::new('s', "a:b"))
        );
        assert_eq!(
            parse_param("NULL").unwrap(),
            Binding::Single(TaggedValue::new('s', Value::Null))
        );
    }

    #[test]
    fn test_parse_param_list() {
        assert_eq!(
            parse_param("i*:1,2").unwrap(),
            Binding::List(vec![TaggedValue::new('i', 1), TaggedValue::new('i', 2)])
        );
        assert_eq!(parse_param("s*:").unwrap(), Binding::List(vec![]));
    }

    #[test]
    fn test_parse_param_errors() {
        assert!(parse_param("42").is_err());
        assert!(parse_param("x:1").unwrap_err().contains("Unknown type tag"));
        assert!(parse_param("ii:1").is_err());
        assert!(parse_param("i:seven").unwrap_err().contains("Invalid integer"));
    }

    #[test]
    fn test_cli_parses() {
        let config = Config::try_parse_from([
            "sqlweave",
            "-d",
            "sqlite:data.db",
            "SELECT * FROM users WHERE id IN (?*)",
            "-p",
            "i*:1,2",
            "--key",
            "id",
            "--group",
            "address:addresses",
        ])
        .unwrap();
        assert_eq!(config.params.len(), 1);
        assert!(config.collects());
        assert_eq!(
            config.group_target().unwrap(),
            Some(("address".to_string(), "addresses".to_string()))
        );
    }

    #[test]
    fn test_cli_execute_conflicts_with_key() {
        let result = Config::try_parse_from([
            "sqlweave", "-d", "sqlite:x.db", "DELETE FROM t", "-x", "--key", "id",
        ]);
        assert!(result.is_err());
    }
}
