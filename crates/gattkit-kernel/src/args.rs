//! Command-line and environment settings shared by the gattkit binaries.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgAction, Args};
use clap::builder::BoolishValueParser;
use gattkit_events::DEFAULT_TAIL_CAPACITY;
use gattkit_protocol::parse_ble_uuid;
use gattkit_session::RegistryConfig;
use uuid::Uuid;

use crate::KernelConfig;

#[derive(Debug, Clone, Args)]
pub struct KernelArgs {
    /// Enable characteristic and descriptor writes.
    #[arg(
        long,
        env = "GATTKIT_ALLOW_WRITES",
        action = ArgAction::Set,
        value_parser = BoolishValueParser::new(),
        num_args = 0..=1,
        default_value = "false",
        default_missing_value = "true"
    )]
    pub allow_writes: bool,

    /// Comma-separated characteristic UUIDs writes are limited to.
    #[arg(long, env = "GATTKIT_WRITE_ALLOWLIST")]
    pub write_allowlist: Option<String>,

    #[arg(long, env = "GATTKIT_MAX_CONNECTIONS", default_value_t = 3)]
    pub max_connections: usize,

    #[arg(long, env = "GATTKIT_MAX_SCANS", default_value_t = 5)]
    pub max_scans: usize,

    #[arg(long, env = "GATTKIT_MAX_SUBSCRIPTIONS_PER_CONN", default_value_t = 10)]
    pub max_subscriptions_per_conn: usize,

    /// Notifications buffered per subscription before the oldest are dropped.
    #[arg(long, env = "GATTKIT_NOTIFICATION_CAPACITY", default_value_t = 256)]
    pub notification_capacity: usize,

    /// Append trace events to this jsonl file.
    #[arg(long, env = "GATTKIT_TRACE_FILE")]
    pub trace_file: Option<PathBuf>,

    #[arg(long, env = "GATTKIT_SHUTDOWN_TIMEOUT_S", default_value_t = 5.0)]
    pub shutdown_timeout_s: f64,
}

impl KernelArgs {
    pub fn to_config(&self) -> Result<KernelConfig> {
        let write_allowlist = self
            .write_allowlist
            .as_deref()
            .map(parse_allowlist)
            .transpose()?;
        let shutdown_timeout = Duration::try_from_secs_f64(self.shutdown_timeout_s)
            .context("shutdown timeout must be a non-negative number of seconds")?;
        Ok(KernelConfig {
            registry: RegistryConfig {
                notification_capacity: self.notification_capacity.max(1),
                max_connections: self.max_connections,
                max_scans: self.max_scans,
                max_subscriptions_per_connection: self.max_subscriptions_per_conn,
                shutdown_timeout,
                ..RegistryConfig::default()
            },
            allow_writes: self.allow_writes,
            write_allowlist,
            trace_file: self.trace_file.clone(),
            trace_tail_capacity: DEFAULT_TAIL_CAPACITY,
        })
    }
}

/// Blank entries are skipped; an all-blank list is no allowlist at all.
fn parse_allowlist(raw: &str) -> Result<Vec<Uuid>> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| parse_ble_uuid(entry).with_context(|| format!("bad allowlist entry `{entry}`")))
        .collect()
}

#[cfg(test)]
mod tests {
    use clap::Parser;
    use gattkit_protocol::uuid_from_short;

    use super::*;

    #[derive(Debug, Parser)]
    struct Cli {
        #[command(flatten)]
        kernel: KernelArgs,
    }

    #[test]
    fn defaults_match_the_registry() {
        let cli = Cli::try_parse_from(["gattkitd"]).unwrap();
        let config = cli.kernel.to_config().unwrap();
        assert!(!config.allow_writes);
        assert_eq!(config.write_allowlist, None);
        assert_eq!(config.registry.max_connections, 3);
        assert_eq!(config.registry.max_scans, 5);
        assert_eq!(config.registry.max_subscriptions_per_connection, 10);
        assert_eq!(config.registry.notification_capacity, 256);
    }

    #[test]
    fn allowlist_accepts_short_forms() {
        let cli = Cli::try_parse_from([
            "gattkitd",
            "--allow-writes",
            "--write-allowlist",
            "fff1, 00002a19-0000-1000-8000-00805f9b34fb,",
            "--max-connections",
            "1",
        ])
        .unwrap();
        let config = cli.kernel.to_config().unwrap();
        assert!(config.allow_writes);
        assert_eq!(
            config.write_allowlist,
            Some(vec![uuid_from_short(0xfff1), uuid_from_short(0x2a19)])
        );
        assert_eq!(config.registry.max_connections, 1);
    }

    #[test]
    fn bad_allowlist_entries_are_errors() {
        let cli = Cli::try_parse_from(["gattkitd", "--write-allowlist", "fff1,nope"]).unwrap();
        assert!(cli.kernel.to_config().is_err());
    }
}
