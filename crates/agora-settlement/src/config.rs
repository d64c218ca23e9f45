//! Marketplace configuration
//!
//! Every component has its own config struct with defaults; [`MarketConfig`]
//! gathers them and loads overrides from files and the environment.

use std::time::Duration;

use agora_auction::AuctionEngineConfig;
use agora_bidder::{BidderConfig, RlConfig};
use agora_ledger::LedgerConfig;
use serde::{Deserialize, Serialize};

/// Settlement orchestrator tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SettlementConfig {
    /// How often an allocation checks whether its auction finished
    #[serde(with = "agora_types::duration_serde::millis")]
    pub auction_poll_interval: Duration,

    /// Grace period past the auction duration before giving up
    #[serde(with = "agora_types::duration_serde::millis")]
    pub completion_buffer: Duration,

    /// Execution timeout for tasks that do not set one
    #[serde(with = "agora_types::duration_serde::millis")]
    pub execution_timeout: Duration,

    /// Consecutive backend failures before the breaker opens
    pub breaker_threshold: u32,

    #[serde(with = "agora_types::duration_serde::secs")]
    pub breaker_cooldown: Duration,

    /// Allowed drift of split ratios from 1.0
    pub split_tolerance: f64,
}

impl Default for SettlementConfig {
    fn default() -> Self {
        Self {
            auction_poll_interval: Duration::from_millis(100),
            completion_buffer: Duration::from_secs(5),
            execution_timeout: Duration::from_secs(30),
            breaker_threshold: 5,
            breaker_cooldown: Duration::from_secs(60),
            split_tolerance: 1e-4,
        }
    }
}

/// Configuration for a whole marketplace node
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MarketConfig {
    pub ledger: LedgerConfig,
    pub auction: AuctionEngineConfig,
    pub settlement: SettlementConfig,
    pub bidder: BidderConfig,
    pub rl: RlConfig,
}

impl MarketConfig {
    /// Load configuration from `.env`, config files and the environment
    ///
    /// Sources, lowest priority first: the file at `config_path` (if given),
    /// `config/default`, `config/local`, then `AGORA__SECTION__KEY`
    /// variables. Missing files are skipped.
    pub fn load(config_path: Option<&str>) -> Result<Self, config::ConfigError> {
        // .env is optional
        let _ = dotenvy::dotenv();

        let mut builder = config::Config::builder();

        if let Some(path) = config_path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }

        builder = builder
            .add_source(config::File::with_name("config/default").required(false))
            .add_source(config::File::with_name("config/local").required(false))
            .add_source(
                config::Environment::with_prefix("AGORA")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    /// Small timings for simulations and tests
    pub fn development() -> Self {
        let mut config = Self::default();
        config.auction.default_duration = Duration::from_millis(200);
        config.settlement.auction_poll_interval = Duration::from_millis(10);
        config.settlement.completion_buffer = Duration::from_secs(1);
        config.settlement.execution_timeout = Duration::from_secs(2);
        config
    }
}
