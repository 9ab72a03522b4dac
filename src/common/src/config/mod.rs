use std::path::Path;
use std::time::Duration;

use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};

use once_cell::sync::OnceCell;

pub static CONFIG: OnceCell<Configuration> = OnceCell::new();

pub const CONFIG_FILE: &str = "promsearch.toml";
pub const ENV_PREFIX: &str = "PROMSEARCH__";

/// Query engine settings
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct PromqlConfig {
    /// IANA zone used to align step buckets
    pub timezone: String,
    /// Maximum number of one-minute buckets a downtime query may span
    pub max_query_points: i64,
    /// Step used when a range query does not give one
    #[serde(with = "humantime_serde")]
    pub default_step: Duration,
    /// How far back an instant selector looks for its latest sample
    #[serde(with = "humantime_serde")]
    pub lookback_delta: Duration,
}

impl Default for PromqlConfig {
    fn default() -> Self {
        Self {
            timezone: "UTC".to_string(),
            max_query_points: 10_000,
            default_step: Duration::from_secs(60),
            lookback_delta: Duration::from_secs(300),
        }
    }
}

impl PromqlConfig {
    pub fn tz(&self) -> Result<Tz, chrono_tz::ParseError> {
        self.timezone.parse()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    /// `tracing_subscriber::EnvFilter` directives; `RUST_LOG` wins when set
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Default, PartialEq)]
pub struct Configuration {
    pub promql: PromqlConfig,
    pub logging: LoggingConfig,
}

impl Configuration {
    fn figment(file: &Path) -> Figment {
        Figment::from(Serialized::defaults(Configuration::default()))
            .merge(Toml::file(file))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    pub fn load() -> Result<Self, Box<figment::Error>> {
        Self::load_from_path(Path::new(CONFIG_FILE))
    }

    pub fn load_from_path(path: &Path) -> Result<Self, Box<figment::Error>> {
        let config = Self::figment(path).extract().map_err(Box::new)?;

        Ok(config)
    }

    /// Loads the configuration once and keeps it for the process.
    pub fn global() -> Result<&'static Configuration, Box<figment::Error>> {
        CONFIG.get_or_try_init(Self::load)
    }
}
