//! Bridge configuration.

use crate::common::{BridgeError, PatternSet, Result};
use crate::postgres::params::{redact_dsn, ConnectParams};

/// PostgreSQL identifiers are limited to 63 bytes (NAMEDATALEN - 1).
const PG_MAX_IDENTIFIER_LEN: usize = 63;

/// Configuration for one bridge instance.
#[derive(Clone)]
pub struct BridgeConfig {
    /// Source DSN. `None` falls back to the libpq environment variables.
    pub source: Option<String>,
    /// Kinesis stream name to publish to.
    pub stream: String,
    /// Logical replication slot on the source database.
    pub slot: String,
    /// Table patterns to include (empty means all tables).
    pub include_tables: Vec<String>,
    /// Table patterns to exclude; takes precedence over includes.
    pub exclude_tables: Vec<String>,
    /// Keep retrying the initial connection instead of exiting.
    pub retry_initial: bool,
    /// Kinesis endpoint override (LocalStack-style deployments).
    pub endpoint_url: Option<String>,
}

impl std::fmt::Debug for BridgeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeConfig")
            .field("source", &self.source.as_deref().map(redact_dsn))
            .field("stream", &self.stream)
            .field("slot", &self.slot)
            .field("include_tables", &self.include_tables)
            .field("exclude_tables", &self.exclude_tables)
            .field("retry_initial", &self.retry_initial)
            .field("endpoint_url", &self.endpoint_url)
            .finish()
    }
}

impl BridgeConfig {
    /// Create a new configuration builder.
    pub fn builder() -> BridgeConfigBuilder {
        BridgeConfigBuilder::default()
    }

    /// Resolve the source connection parameters.
    pub fn connect_params(&self) -> Result<ConnectParams> {
        match self.source.as_deref() {
            Some(dsn) => ConnectParams::from_dsn(dsn)
                .map_err(|e| BridgeError::config(format!("{e:#}"))),
            None => Ok(ConnectParams::from_env()),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.stream.is_empty() {
            return Err(BridgeError::config(
                "stream name is required; pass --stream",
            ));
        }
        if self.slot.is_empty() {
            return Err(BridgeError::config("slot name must not be blank"));
        }
        if self.slot.len() > PG_MAX_IDENTIFIER_LEN {
            return Err(BridgeError::config(format!(
                "slot name exceeds the PostgreSQL identifier limit of {} characters (got {})",
                PG_MAX_IDENTIFIER_LEN,
                self.slot.len()
            )));
        }
        for patterns in [&self.include_tables, &self.exclude_tables] {
            PatternSet::from_patterns(patterns)
                .map_err(|e| BridgeError::config(format!("invalid table pattern: {e}")))?;
        }
        Ok(())
    }
}

/// Builder for [`BridgeConfig`].
#[derive(Default)]
pub struct BridgeConfigBuilder {
    source: Option<String>,
    stream: Option<String>,
    slot: Option<String>,
    include_tables: Vec<String>,
    exclude_tables: Vec<String>,
    retry_initial: bool,
    endpoint_url: Option<String>,
}

impl BridgeConfigBuilder {
    /// Set the source DSN.
    pub fn source(mut self, dsn: impl Into<String>) -> Self {
        self.source = Some(dsn.into());
        self
    }

    /// Set an optional source DSN (None keeps the env fallback).
    pub fn source_opt(mut self, dsn: Option<String>) -> Self {
        self.source = dsn;
        self
    }

    /// Set the Kinesis stream name.
    pub fn stream(mut self, stream: impl Into<String>) -> Self {
        self.stream = Some(stream.into());
        self
    }

    /// Set the replication slot name.
    pub fn slot(mut self, slot: impl Into<String>) -> Self {
        self.slot = Some(slot.into());
        self
    }

    /// Add an include pattern.
    pub fn table(mut self, pattern: impl Into<String>) -> Self {
        self.include_tables.push(pattern.into());
        self
    }

    /// Set all include patterns.
    pub fn tables(mut self, patterns: Vec<String>) -> Self {
        self.include_tables = patterns;
        self
    }

    /// Add an exclude pattern.
    pub fn exclude_table(mut self, pattern: impl Into<String>) -> Self {
        self.exclude_tables.push(pattern.into());
        self
    }

    /// Set all exclude patterns.
    pub fn exclude_tables(mut self, patterns: Vec<String>) -> Self {
        self.exclude_tables = patterns;
        self
    }

    /// Keep retrying the initial connection (HA deployments).
    pub fn retry_initial(mut self, retry: bool) -> Self {
        self.retry_initial = retry;
        self
    }

    /// Override the Kinesis endpoint.
    pub fn endpoint_url(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint_url = Some(endpoint.into());
        self
    }

    /// Build and validate the configuration.
    pub fn build(self) -> Result<BridgeConfig> {
        let config = BridgeConfig {
            source: self.source,
            stream: self.stream.unwrap_or_default(),
            slot: self.slot.unwrap_or_else(|| "pg_kinesis".to_string()),
            include_tables: self.include_tables,
            exclude_tables: self.exclude_tables,
            retry_initial: self.retry_initial,
            endpoint_url: self.endpoint_url,
        };
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config() {
        let config = BridgeConfig::builder().stream("events").build().unwrap();
        assert_eq!(config.stream, "events");
        assert_eq!(config.slot, "pg_kinesis");
        assert!(config.include_tables.is_empty());
    }

    #[test]
    fn test_stream_is_required() {
        let err = BridgeConfig::builder().build().unwrap_err();
        assert!(err.to_string().contains("stream"));
    }

    #[test]
    fn test_blank_slot_rejected() {
        let err = BridgeConfig::builder()
            .stream("events")
            .slot("")
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("slot"));
    }

    #[test]
    fn test_overlong_slot_rejected() {
        let err = BridgeConfig::builder()
            .stream("events")
            .slot("s".repeat(64))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("identifier limit"));
    }

    #[test]
    fn test_invalid_pattern_rejected() {
        let err = BridgeConfig::builder()
            .stream("events")
            .table("")
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("pattern"));
    }

    #[test]
    fn test_debug_redacts_dsn_password() {
        let config = BridgeConfig::builder()
            .source("postgres://u:topsecret@db/x")
            .stream("events")
            .build()
            .unwrap();
        let debug = format!("{config:?}");
        assert!(!debug.contains("topsecret"));
    }

    #[test]
    fn test_connect_params_from_dsn() {
        let config = BridgeConfig::builder()
            .source("postgres://u@dbhost/x")
            .stream("events")
            .build()
            .unwrap();
        let params = config.connect_params().unwrap();
        assert_eq!(params.host, "dbhost");
    }
}
