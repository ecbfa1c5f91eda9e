//! Configuration module for the tandem backend.
//!
//! Handles loading and parsing configuration from environment variables using
//! the figment crate. Durations accept both numeric values (interpreted as
//! seconds) and duration strings with units.

use fundu::{DurationParser, TimeUnit};
use indexmap::IndexMap;
use serde::{Deserialize, Deserializer};
use std::time::Duration;

/// Main application configuration containing all sub-configurations
#[derive(Deserialize, Clone)]
pub struct Config {
    /// Log level for the application
    ///
    /// This value is used to set the log level for this application's target specifically.
    /// e.g. "debug" would be similar to "warn,tandem=debug,..."
    ///
    /// Valid values are: "trace", "debug", "info", "warn", "error"
    /// Defaults to "info" if not specified
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Port for the web server (default: 8080)
    #[serde(default = "default_port")]
    pub port: u16,
    /// Database connection URL
    pub database_url: String,
    /// Graceful shutdown timeout duration
    #[serde(
        default = "default_shutdown_timeout",
        deserialize_with = "deserialize_duration"
    )]
    pub shutdown_timeout: Duration,

    /// Token lifetime configuration
    #[serde(default)]
    pub tokens: TokenConfig,
    /// Request dispatch configuration
    #[serde(default)]
    pub dispatch: DispatchConfig,
    /// Worker pool configuration
    #[serde(default)]
    pub workers: WorkerConfig,
    /// Per-IP hourly request caps, keyed by endpoint pattern
    #[serde(default = "default_rate_limits")]
    pub rate_limits: IndexMap<String, u32>,
}

/// Default log level of "info"
fn default_log_level() -> String {
    "info".to_string()
}

/// Default port of 8080
fn default_port() -> u16 {
    8080
}

/// Default shutdown timeout of 8 seconds
fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(8)
}

fn default_rate_limits() -> IndexMap<String, u32> {
    IndexMap::from([("/api/session".to_string(), 600), ("/ws".to_string(), 120)])
}

/// TTLs for every level of the token hierarchy.
#[derive(Deserialize, Clone, Debug)]
pub struct TokenConfig {
    /// Absolute lifetime of an auth token
    #[serde(
        default = "default_auth_token_ttl",
        deserialize_with = "deserialize_duration"
    )]
    pub auth_token_ttl: Duration,
    /// Upper bound on a session token's lifetime (clamped to the parent auth TTL)
    #[serde(
        default = "default_session_token_ttl",
        deserialize_with = "deserialize_duration"
    )]
    pub session_token_ttl: Duration,
    /// Lifetime of a one-shot email verification token
    #[serde(
        default = "default_verification_token_ttl",
        deserialize_with = "deserialize_duration"
    )]
    pub verification_token_ttl: Duration,
    /// Lifetime of a one-shot password reset token
    #[serde(
        default = "default_reset_token_ttl",
        deserialize_with = "deserialize_duration"
    )]
    pub reset_token_ttl: Duration,
    /// Safety margin between a token's expiry hook and the token itself.
    ///
    /// Hooks fire this much before the main record expires so cascading
    /// cleanup runs while the record is still readable.
    #[serde(
        default = "default_expiry_margin",
        deserialize_with = "deserialize_duration"
    )]
    pub expiry_margin: Duration,
    /// Maximum entries retained in a project's context change-log before
    /// older entries are compacted into the base context map
    #[serde(default = "default_changelog_cap")]
    pub changelog_cap: usize,
    /// Whether project context is flushed to durable storage when the
    /// project's last parent session dies
    #[serde(default = "default_store_context")]
    pub store_multi_file_context_durably: bool,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            auth_token_ttl: default_auth_token_ttl(),
            session_token_ttl: default_session_token_ttl(),
            verification_token_ttl: default_verification_token_ttl(),
            reset_token_ttl: default_reset_token_ttl(),
            expiry_margin: default_expiry_margin(),
            changelog_cap: default_changelog_cap(),
            store_multi_file_context_durably: default_store_context(),
        }
    }
}

/// Default auth token lifetime of 12 hours
fn default_auth_token_ttl() -> Duration {
    Duration::from_secs(12 * 3600)
}

/// Default session token lifetime of 4 hours
fn default_session_token_ttl() -> Duration {
    Duration::from_secs(4 * 3600)
}

/// Default verification token lifetime of 15 minutes
fn default_verification_token_ttl() -> Duration {
    Duration::from_secs(15 * 60)
}

/// Default reset token lifetime of 15 minutes
fn default_reset_token_ttl() -> Duration {
    Duration::from_secs(15 * 60)
}

/// Default expiry hook margin of 5 seconds
fn default_expiry_margin() -> Duration {
    Duration::from_secs(5)
}

/// Default change-log bound of 256 entries per project
fn default_changelog_cap() -> usize {
    256
}

fn default_store_context() -> bool {
    true
}

/// Deadlines and queue watermarks for the request path.
#[derive(Deserialize, Clone, Debug)]
pub struct DispatchConfig {
    /// End-to-end deadline for a completion/chat request
    #[serde(
        default = "default_request_deadline",
        deserialize_with = "deserialize_duration"
    )]
    pub request_deadline: Duration,
    /// Per-model invocation timeout, strictly less than the request deadline
    #[serde(
        default = "default_per_model_timeout",
        deserialize_with = "deserialize_duration"
    )]
    pub per_model_timeout: Duration,
    /// Inference queue depth above which new requests are refused with `busy`
    #[serde(default = "default_inference_high_water")]
    pub inference_queue_high_water: usize,
    /// Inference queue depth below which admission resumes
    #[serde(default = "default_inference_low_water")]
    pub inference_queue_low_water: usize,
    /// Persistence queue depth beyond which the analytics sink samples
    #[serde(default = "default_persist_hard_cap")]
    pub persistence_queue_hard_cap: usize,
    /// Models used when a request does not name any
    #[serde(default = "default_model_ids")]
    pub default_model_ids: Vec<i32>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            request_deadline: default_request_deadline(),
            per_model_timeout: default_per_model_timeout(),
            inference_queue_high_water: default_inference_high_water(),
            inference_queue_low_water: default_inference_low_water(),
            persistence_queue_hard_cap: default_persist_hard_cap(),
            default_model_ids: default_model_ids(),
        }
    }
}

/// Default request deadline of 10 seconds
fn default_request_deadline() -> Duration {
    Duration::from_secs(10)
}

/// Default per-model timeout of 8 seconds
fn default_per_model_timeout() -> Duration {
    Duration::from_secs(8)
}

fn default_inference_high_water() -> usize {
    512
}

fn default_inference_low_water() -> usize {
    384
}

fn default_persist_hard_cap() -> usize {
    8192
}

fn default_model_ids() -> Vec<i32> {
    vec![1]
}

/// Sizing and retry policy for the worker pools.
#[derive(Deserialize, Clone, Debug)]
pub struct WorkerConfig {
    /// Number of inference workers
    #[serde(default = "default_inference_workers")]
    pub inference_workers: usize,
    /// Per-worker cap on concurrent model invocations
    #[serde(default = "default_model_concurrency")]
    pub model_concurrency: usize,
    /// Number of persistence workers
    #[serde(default = "default_persistence_workers")]
    pub persistence_workers: usize,
    /// Rows batched per gateway round-trip on the persistence path
    #[serde(default = "default_persistence_batch_size")]
    pub persistence_batch_size: usize,
    /// Retry cap for transient persistence failures
    #[serde(default = "default_persistence_max_retries")]
    pub persistence_max_retries: u32,
    /// How long a claimed task stays invisible before redelivery
    #[serde(
        default = "default_visibility_timeout",
        deserialize_with = "deserialize_duration"
    )]
    pub visibility_timeout: Duration,
    /// Whether model invokers are warmed at worker boot
    #[serde(default)]
    pub preload_models: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            inference_workers: default_inference_workers(),
            model_concurrency: default_model_concurrency(),
            persistence_workers: default_persistence_workers(),
            persistence_batch_size: default_persistence_batch_size(),
            persistence_max_retries: default_persistence_max_retries(),
            visibility_timeout: default_visibility_timeout(),
            preload_models: false,
        }
    }
}

fn default_inference_workers() -> usize {
    4
}

fn default_model_concurrency() -> usize {
    4
}

fn default_persistence_workers() -> usize {
    2
}

fn default_persistence_batch_size() -> usize {
    64
}

fn default_persistence_max_retries() -> u32 {
    5
}

/// Default visibility timeout of 30 seconds
fn default_visibility_timeout() -> Duration {
    Duration::from_secs(30)
}

/// Duration parser configured to handle various time units with seconds as default
///
/// Supports:
/// - Seconds (s) - default unit
/// - Milliseconds (ms)
/// - Minutes (m)
/// - Hours (h)
///
/// Does not support fractions, exponents, or infinity values
/// Allows for whitespace between the number and the time unit
/// Allows for multiple time units to be specified (summed together, e.g "10s 2m" = 120 + 10 = 130 seconds)
const DURATION_PARSER: DurationParser<'static> = DurationParser::builder()
    .time_units(&[
        TimeUnit::Second,
        TimeUnit::MilliSecond,
        TimeUnit::Minute,
        TimeUnit::Hour,
    ])
    .parse_multiple(None)
    .allow_time_unit_delimiter()
    .disable_infinity()
    .disable_fraction()
    .disable_exponent()
    .default_unit(TimeUnit::Second)
    .build();

/// Custom deserializer for duration fields that accepts both numeric and string values
///
/// - Unsigned integers (interpreted as seconds)
/// - Signed integers (interpreted as seconds, must be non-negative)
/// - Strings (parsed using the fundu duration parser)
///
/// # Examples
///
/// - `1` -> 1 second
/// - `"30s"` -> 30 seconds
/// - `"2 m"` -> 2 minutes
/// - `"1500ms"` -> 1.5 seconds
fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Visitor;

    struct DurationVisitor;

    impl<'de> Visitor<'de> for DurationVisitor {
        type Value = Duration;

        fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
            formatter.write_str("a duration string or number")
        }

        fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            DURATION_PARSER
                .parse(value)
                .map_err(|e| {
                    serde::de::Error::custom(format!(
                        "Invalid duration format '{}': {}. Examples: '5' (5 seconds), '3500ms', '30s', '2m'",
                        value, e
                    ))
                })?
                .try_into()
                .map_err(|e| serde::de::Error::custom(format!("Duration conversion error: {}", e)))
        }

        fn visit_u64<E>(self, value: u64) -> Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            Ok(Duration::from_secs(value))
        }

        fn visit_i64<E>(self, value: i64) -> Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            if value < 0 {
                return Err(serde::de::Error::custom("Duration cannot be negative"));
            }
            Ok(Duration::from_secs(value as u64))
        }
    }

    deserializer.deserialize_any(DurationVisitor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_consistent() {
        let dispatch = DispatchConfig::default();
        assert!(dispatch.per_model_timeout < dispatch.request_deadline);
        assert!(dispatch.inference_queue_low_water < dispatch.inference_queue_high_water);
    }

    #[test]
    fn duration_parser_accepts_units() {
        let parsed: Duration = DURATION_PARSER.parse("1500ms").unwrap().try_into().unwrap();
        assert_eq!(parsed, Duration::from_millis(1500));
        let parsed: Duration = DURATION_PARSER.parse("2m").unwrap().try_into().unwrap();
        assert_eq!(parsed, Duration::from_secs(120));
    }
}
