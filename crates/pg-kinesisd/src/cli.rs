//! CLI argument parsing for the pg_kinesis daemon.

use clap::Parser;
use pg_kinesis_cdc::{BridgeConfig, Result};

/// Replicate output from PostgreSQL's test_decoding plugin to AWS Kinesis.
///
/// The replication slot's confirmed position only advances once records
/// have been durably accepted by Kinesis, so delivery is at-least-once
/// across crashes and restarts (consumers dedupe by LSN).
#[derive(Parser, Debug)]
#[command(name = "pg_kinesis")]
#[command(author, version, about)]
pub struct Cli {
    /// Source database URI/DSN. The libpq-standard PGHOST/PGDATABASE/etc.
    /// environment variables are used when this is absent.
    #[arg(long)]
    pub source: Option<String>,

    /// Name of the AWS Kinesis stream to publish to (required).
    #[arg(long)]
    pub stream: Option<String>,

    /// Logical replication slot on the source database.
    #[arg(long, default_value = "pg_kinesis")]
    pub slot: String,

    /// Create the replication slot before starting replication.
    #[arg(long)]
    pub create: bool,

    /// Drop the replication slot. Exits upon success.
    #[arg(long)]
    pub drop: bool,

    /// Table to transfer (repeatable). Defaults to all tables. Patterns
    /// use the psql syntax: `*` matches any run, `?` a single character.
    #[arg(short = 't', long = "table")]
    pub tables: Vec<String>,

    /// Table to exclude (repeatable). Takes precedence over -t.
    #[arg(short = 'T', long = "exclude-table")]
    pub exclude_tables: Vec<String>,

    /// Retry the initial connection to the replication slot; useful for
    /// high-availability setups running pg_kinesis from multiple hosts.
    #[arg(long)]
    pub retry_initial: bool,

    /// Kinesis endpoint override (LocalStack-style deployments).
    #[arg(long, env = "KINESIS_ENDPOINT_URL")]
    pub endpoint_url: Option<String>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "RUST_LOG")]
    pub log_level: String,
}

impl Cli {
    /// Validate flag combinations that clap cannot express with exit
    /// code 1 semantics.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.create && self.drop {
            return Err("specify one of --create or --drop, not both".to_string());
        }
        if !self.drop && self.stream.as_deref().unwrap_or("").is_empty() {
            return Err("blank stream; please specify a stream with --stream".to_string());
        }
        Ok(())
    }

    /// Build the bridge configuration.
    pub fn into_config(self) -> Result<BridgeConfig> {
        let mut builder = BridgeConfig::builder()
            .source_opt(self.source)
            .stream(self.stream.unwrap_or_default())
            .slot(self.slot)
            .tables(self.tables)
            .exclude_tables(self.exclude_tables)
            .retry_initial(self.retry_initial);
        if let Some(endpoint) = self.endpoint_url {
            builder = builder.endpoint_url(endpoint);
        }
        builder.build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cli = Cli::parse_from(["pg_kinesis", "--stream", "events"]);
        assert_eq!(cli.slot, "pg_kinesis");
        assert!(!cli.create);
        assert!(!cli.drop);
        assert!(cli.validate().is_ok());
    }

    #[test]
    fn test_missing_stream_is_config_error() {
        let cli = Cli::parse_from(["pg_kinesis"]);
        assert!(cli.validate().is_err());
    }

    #[test]
    fn test_drop_does_not_need_stream() {
        let cli = Cli::parse_from(["pg_kinesis", "--drop"]);
        assert!(cli.validate().is_ok());
    }

    #[test]
    fn test_create_and_drop_conflict() {
        let cli = Cli::parse_from(["pg_kinesis", "--stream", "s", "--create", "--drop"]);
        assert!(cli.validate().is_err());
    }

    #[test]
    fn test_repeatable_table_flags() {
        let cli = Cli::parse_from([
            "pg_kinesis",
            "--stream",
            "events",
            "-t",
            "public.*",
            "-t",
            "audit.log",
            "-T",
            "public.secret",
        ]);
        assert_eq!(cli.tables, vec!["public.*", "audit.log"]);
        assert_eq!(cli.exclude_tables, vec!["public.secret"]);

        let config = cli.into_config().unwrap();
        assert_eq!(config.include_tables.len(), 2);
        assert_eq!(config.exclude_tables.len(), 1);
    }
}
