/// Layered node configuration.
///
/// Sources, lowest precedence first: built-in defaults, an optional
/// `config/blobber.{toml,yaml,json}` file (or the file named by `BLOBBER_CONFIG`), and
/// environment variables prefixed `BLOBBER__` with `__` separating nested keys, e.g.
/// `BLOBBER__CHAIN__SHARDERS=http://s1,http://s2`. A `.env` file is loaded by `main`
/// before this runs.
use config::{Config, Environment, File};
use log::info;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use validator::Validate;

use crate::error::Result;

/// Challenges may not be polled faster than this.
pub const MIN_CHALLENGE_POLL_SECS: u64 = 30;

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct BlobberConfig {
    #[validate]
    pub node: NodeConfig,
    #[validate]
    pub chain: ChainConfig,
    #[validate]
    pub challenge: ChallengeConfig,
    #[validate]
    pub write_marker: WriteMarkerConfig,
    #[validate]
    pub disk: DiskConfig,
    #[validate(range(min = 1))]
    pub health_check_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct NodeConfig {
    #[validate(length(min = 1, message = "db_path cannot be empty"))]
    pub db_path: String,
    #[validate(length(min = 1, message = "bind_address cannot be empty"))]
    pub bind_address: String,
    /// Public URL validators and clients reach this node at.
    pub url: String,
    /// Hex ed25519 secret; a random identity is generated when empty.
    pub secret_key: String,
    /// Advertised capacity in bytes.
    pub capacity: u64,
    /// Register with the storage contract on startup.
    pub register_on_start: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ChainConfig {
    pub sharders: Vec<String>,
    pub miners: Vec<String>,
    #[validate(length(min = 1))]
    pub storage_contract_address: String,
    #[validate(range(min = 1))]
    pub request_timeout_secs: u64,
    #[validate(range(min = 1))]
    pub retry_count: u32,
    pub retry_sleep_ms: u64,
    pub sleep_before_verify_secs: u64,
    #[validate(range(min = 1))]
    pub max_confirmation_retries: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ChallengeConfig {
    #[validate(range(min = 30, message = "challenge polling interval must be at least 30 seconds"))]
    pub polling_interval_secs: u64,
    #[validate(range(min = 1))]
    pub completion_time_secs: i64,
    #[validate(range(min = 1, max = 50))]
    pub page_limit: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct WriteMarkerConfig {
    #[validate(range(min = 1))]
    pub redeem_interval_secs: u64,
    #[validate(range(min = 1))]
    pub lock_timeout_secs: i64,
    #[validate(range(min = 1, max = 64))]
    pub max_concurrent_redemptions: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct DiskConfig {
    /// Directory whose immediate subdirectories are candidate volumes.
    #[validate(length(min = 1))]
    pub mount_point: String,
    /// Volumes with less free space are ignored.
    pub min_volume_size: u64,
    #[validate(length(min = 1))]
    pub strategy: String,
    #[validate(range(min = 1))]
    pub refresh_interval_secs: u64,
    pub migration_grace_period_secs: u64,
}

impl ChainConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn retry_sleep(&self) -> Duration {
        Duration::from_millis(self.retry_sleep_ms)
    }

    pub fn sleep_before_verify(&self) -> Duration {
        Duration::from_secs(self.sleep_before_verify_secs)
    }
}

impl ChallengeConfig {
    /// Polling interval, clamped to the 30 second floor.
    pub fn polling_interval(&self) -> Duration {
        Duration::from_secs(self.polling_interval_secs.max(MIN_CHALLENGE_POLL_SECS))
    }
}

impl BlobberConfig {
    /// Loads and validates configuration from file and environment.
    pub fn load() -> Result<Self> {
        let file = std::env::var("BLOBBER_CONFIG").unwrap_or_else(|_| "config/blobber".into());
        let settings = Self::defaults()?
            .add_source(File::with_name(&file).required(false))
            .add_source(
                Environment::with_prefix("BLOBBER")
                    .prefix_separator("__")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("chain.sharders")
                    .with_list_parse_key("chain.miners")
                    .try_parsing(true),
            )
            .build()?;
        let config: BlobberConfig = settings.try_deserialize()?;
        config.validate()?;
        info!(
            "Loaded configuration: {} sharders, {} miners, mount point {}",
            config.chain.sharders.len(),
            config.chain.miners.len(),
            config.disk.mount_point
        );
        Ok(config)
    }

    fn defaults() -> Result<config::builder::ConfigBuilder<config::builder::DefaultState>> {
        Ok(Config::builder()
            .set_default("node.db_path", "./blobberdb")?
            .set_default("node.bind_address", "127.0.0.1:5051")?
            .set_default("node.url", "http://127.0.0.1:5051")?
            .set_default("node.secret_key", "")?
            .set_default("node.capacity", 1u64 << 30)?
            .set_default("node.register_on_start", false)?
            .set_default("chain.sharders", Vec::<String>::new())?
            .set_default("chain.miners", Vec::<String>::new())?
            .set_default(
                "chain.storage_contract_address",
                "6dba10422e368813802877a85039d3985d96760ed844092319743fb3a76712d7",
            )?
            .set_default("chain.request_timeout_secs", 10)?
            .set_default("chain.retry_count", 3)?
            .set_default("chain.retry_sleep_ms", 1000)?
            .set_default("chain.sleep_before_verify_secs", 5)?
            .set_default("chain.max_confirmation_retries", 10)?
            .set_default("challenge.polling_interval_secs", 30)?
            .set_default("challenge.completion_time_secs", 30 * 60)?
            .set_default("challenge.page_limit", 50)?
            .set_default("write_marker.redeem_interval_secs", 10)?
            .set_default("write_marker.lock_timeout_secs", 30)?
            .set_default("write_marker.max_concurrent_redemptions", 5)?
            .set_default("disk.mount_point", "./volumes")?
            .set_default("disk.min_volume_size", 0u64)?
            .set_default("disk.strategy", "min_size_first")?
            .set_default("disk.refresh_interval_secs", 60)?
            .set_default("disk.migration_grace_period_secs", 300)?
            .set_default("health_check_interval_secs", 3600)?)
    }
}

impl BlobberConfig {
    /// Built-in defaults only, without file or environment sources.
    pub fn from_defaults() -> Result<Self> {
        Ok(Self::defaults()?.build()?.try_deserialize()?)
    }
}
