use config::{Config, ConfigError, Environment, File, Map};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use tide_ordering::{GapFillStrategy, OrderingConfig};

#[derive(Debug, Deserialize, Clone)]
pub struct ReplayConfig {
    pub ordering_enabled: bool,
    pub gap_fill: bool,
    pub gap_fill_strategy: GapFillStrategy,
    #[serde(with = "humantime_serde")]
    pub initial_wait_time: Duration,
    #[serde(with = "humantime_serde")]
    pub retry_wait_time: Duration,
    pub max_requests_per_gap: u32,
    /// Address the fixture storage node answers to.
    pub storage_node: String,
}

impl ReplayConfig {
    pub fn new(config_path: Option<PathBuf>) -> Result<Self, ConfigError> {
        Self::from_sources(config_path, None)
    }

    /// Builds the config from defaults, an optional file and `TIDE_*`
    /// variables (taken from `env` when given, the process otherwise).
    pub fn from_sources(
        config_path: Option<PathBuf>,
        env: Option<Map<String, String>>,
    ) -> Result<Self, ConfigError> {
        let mut builder = Config::builder()
            .set_default("ordering_enabled", true)?
            .set_default("gap_fill", true)?
            .set_default("gap_fill_strategy", "full")?
            .set_default("initial_wait_time", "5s")?
            .set_default("retry_wait_time", "5s")?
            .set_default("max_requests_per_gap", 5)?
            .set_default("storage_node", "fixture")?;

        if let Some(path) = config_path {
            builder = builder.add_source(File::from(path));
        }

        builder = builder.add_source(
            Environment::with_prefix("TIDE")
                .try_parsing(true)
                .source(env),
        );

        builder.build()?.try_deserialize()
    }

    pub fn ordering(&self) -> OrderingConfig {
        OrderingConfig {
            ordering_enabled: self.ordering_enabled,
            gap_fill: self.gap_fill,
            gap_fill_strategy: self.gap_fill_strategy,
            initial_wait_time: self.initial_wait_time,
            retry_wait_time: self.retry_wait_time,
            max_requests_per_gap: self.max_requests_per_gap,
        }
    }
}
