//! Configuration loading and lookup.
//!
//! `load_config` reads an optional `config/default.{toml,yaml,json}` file and
//! `NSQ_*` environment variables, and merges them over the defaults.
//! `HostConfig` is the narrow lookup the `BrokerClient` consumes during
//! `init`: a string value per key with a fallback.

mod settings;

use std::collections::HashMap;

use config::{Config, ConfigError, Environment, File};

pub use settings::{
    DEFAULT_NSQ_ADDR, DEFAULT_NSQ_LOOKUPD_ADDR, NSQ_ADDR_KEY, NSQ_LOOKUPD_ADDR_KEY,
    PartialSettings, Settings,
};

/// Loads the configuration from the default file and environment variables
/// Merges the configuration with default values
pub fn load_config() -> Result<Settings, ConfigError> {
    load_config_from("config/default")
}

/// Same as `load_config` with an explicit file stem (without extension).
pub fn load_config_from(path: &str) -> Result<Settings, ConfigError> {
    let builder = Config::builder()
        .add_source(File::with_name(path).required(false))
        .add_source(Environment::with_prefix("NSQ").try_parsing(true));

    let config = builder.build()?;

    // Try to deserialize what is available
    let partial: PartialSettings = config.try_deserialize()?;

    Ok(partial.merge(Settings::default()))
}

/// String lookup over the host application's configuration.
pub trait HostConfig: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;

    /// Value for `key`, or `default` when it is missing or empty.
    fn get_or(&self, key: &str, default: &str) -> String {
        self.get(key)
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| default.to_string())
    }
}

impl HostConfig for Settings {
    fn get(&self, key: &str) -> Option<String> {
        match key {
            NSQ_ADDR_KEY => Some(self.addr.clone()),
            NSQ_LOOKUPD_ADDR_KEY => Some(self.lookupd_addr.clone()),
            _ => None,
        }
    }
}

impl HostConfig for HashMap<String, String> {
    fn get(&self, key: &str) -> Option<String> {
        HashMap::get(self, key).cloned()
    }
}

#[cfg(test)]
mod tests;
