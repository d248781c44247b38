//! Per-binary configuration structs, spec.md §6 "Consumer configuration"
//! plus §12's ambient CLI surface. Shaped after `siem_consumer::Config`'s
//! flat struct with env fallback, but sourced from `clap::Parser` derive
//! instead of hand-rolled `env::var(...)` parsing, since each binary now
//! has its own CLI surface (`ingest-consumer`, `replacer-consumer`,
//! `subscriptions-consumer`) instead of one.

use clap::Parser;

use crate::broker::AutoOffsetReset;
use crate::{Error, Result};

fn parse_auto_offset_reset(raw: &str) -> std::result::Result<AutoOffsetReset, String> {
    raw.parse().map_err(|e: Error| e.to_string())
}

#[derive(Parser, Debug, Clone)]
#[command(name = "ingest-consumer", about = "Consumes the raw events topic into the column store")]
pub struct IngestConfig {
    #[arg(long, env = "BOOTSTRAP_SERVERS", value_delimiter = ',')]
    pub bootstrap_servers: Vec<String>,

    #[arg(long, env = "RAW_EVENTS_TOPIC")]
    pub raw_events_topic: String,

    #[arg(long, env = "REPLACEMENTS_TOPIC")]
    pub replacements_topic: Option<String>,

    #[arg(long, env = "COMMIT_LOG_TOPIC", default_value = "snuba-commit-log")]
    pub commit_log_topic: String,

    #[arg(long, env = "CONSUMER_GROUP")]
    pub consumer_group: String,

    #[arg(long, env = "AUTO_OFFSET_RESET", default_value = "error", value_parser = parse_auto_offset_reset)]
    pub auto_offset_reset: AutoOffsetReset,

    #[arg(long, env = "ENABLE_END_OF_PARTITION", default_value_t = true)]
    pub enable_end_of_partition: bool,

    #[arg(long, env = "MAX_BATCH_SIZE", default_value_t = 1000)]
    pub max_batch_size: usize,

    #[arg(long, env = "MAX_BATCH_TIME_MS", default_value_t = 1000)]
    pub max_batch_time_ms: u64,

    #[arg(long, env = "QUEUED_MAX_MESSAGES_KBYTES", default_value_t = 10_000_000)]
    pub queued_max_messages_kbytes: i64,

    #[arg(long, env = "QUEUED_MIN_MESSAGES", default_value_t = 10_000)]
    pub queued_min_messages: i64,

    #[arg(long, env = "CLICKHOUSE_URL")]
    pub clickhouse_url: String,

    #[arg(long, env = "CLICKHOUSE_DATABASE", default_value = "default")]
    pub clickhouse_database: String,

    #[arg(long, env = "CLICKHOUSE_USER", default_value = "default")]
    pub clickhouse_user: String,

    #[arg(long, env = "CLICKHOUSE_PASSWORD", default_value = "")]
    pub clickhouse_password: String,

    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

#[derive(Parser, Debug, Clone)]
#[command(name = "replacer-consumer", about = "Consumes the replacements topic, applying idempotent rewrites")]
pub struct ReplacerConfig {
    #[arg(long, env = "BOOTSTRAP_SERVERS", value_delimiter = ',')]
    pub bootstrap_servers: Vec<String>,

    #[arg(long, env = "REPLACEMENTS_TOPIC")]
    pub replacements_topic: String,

    #[arg(long, env = "CONSUMER_GROUP")]
    pub consumer_group: String,

    #[arg(long, env = "AUTO_OFFSET_RESET", default_value = "error", value_parser = parse_auto_offset_reset)]
    pub auto_offset_reset: AutoOffsetReset,

    #[arg(long, env = "MAX_BATCH_SIZE", default_value_t = 1000)]
    pub max_batch_size: usize,

    #[arg(long, env = "MAX_BATCH_TIME_MS", default_value_t = 1000)]
    pub max_batch_time_ms: u64,

    #[arg(long, env = "CLICKHOUSE_URL")]
    pub clickhouse_url: String,

    #[arg(long, env = "CLICKHOUSE_DATABASE", default_value = "default")]
    pub clickhouse_database: String,

    #[arg(long, env = "CLICKHOUSE_USER", default_value = "default")]
    pub clickhouse_user: String,

    #[arg(long, env = "CLICKHOUSE_PASSWORD", default_value = "")]
    pub clickhouse_password: String,

    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

#[derive(Parser, Debug, Clone)]
#[command(name = "subscriptions-consumer", about = "Schedules and evaluates subscriptions over tick intervals")]
pub struct SubscriptionsConfig {
    #[arg(long, env = "BOOTSTRAP_SERVERS", value_delimiter = ',')]
    pub bootstrap_servers: Vec<String>,

    #[arg(long, env = "RAW_EVENTS_TOPIC")]
    pub raw_events_topic: String,

    #[arg(long, env = "COMMIT_LOG_TOPIC", default_value = "snuba-commit-log")]
    pub commit_log_topic: String,

    #[arg(long, env = "RESULT_TOPIC")]
    pub result_topic: String,

    #[arg(long, env = "CONSUMER_GROUP")]
    pub consumer_group: String,

    #[arg(long, env = "SCHEDULE_TTL_SECONDS", default_value_t = 300)]
    pub schedule_ttl_seconds: u64,

    #[arg(long, env = "MAX_QUERY_WORKERS", default_value_t = 16)]
    pub max_query_workers: usize,

    #[arg(long, env = "QUERY_TIMEOUT_MS", default_value_t = 30_000)]
    pub query_timeout_ms: u64,

    #[arg(long, env = "REDIS_URL")]
    pub redis_url: String,

    #[arg(long, env = "CLICKHOUSE_URL")]
    pub clickhouse_url: String,

    #[arg(long, env = "CLICKHOUSE_DATABASE", default_value = "default")]
    pub clickhouse_database: String,

    #[arg(long, env = "CLICKHOUSE_USER", default_value = "default")]
    pub clickhouse_user: String,

    #[arg(long, env = "CLICKHOUSE_PASSWORD", default_value = "")]
    pub clickhouse_password: String,

    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

/// Exit codes per spec.md §6: 0 normal shutdown, 1 fatal consumer error, 2
/// configuration error.
pub fn exit_code_for(error: &Error) -> i32 {
    match error {
        Error::Config(_) => 2,
        _ => 1,
    }
}

pub fn require_nonempty(servers: &[String], field: &str) -> Result<()> {
    if servers.is_empty() {
        return Err(Error::Config(format!("{field} must not be empty")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_errors_exit_one_config_errors_exit_two() {
        assert_eq!(exit_code_for(&Error::Config("bad".to_string())), 2);
        assert_eq!(exit_code_for(&Error::InvariantViolation("bad".to_string())), 1);
    }
}
