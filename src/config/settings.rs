use serde::Deserialize;

/// Environment/config key holding the nsqd TCP address.
pub const NSQ_ADDR_KEY: &str = "NSQ_ADDR";
/// Environment/config key holding the nsqlookupd HTTP address.
pub const NSQ_LOOKUPD_ADDR_KEY: &str = "NSQ_LOOKUPD_ADDR";

pub const DEFAULT_NSQ_ADDR: &str = "127.0.0.1:4150";
pub const DEFAULT_NSQ_LOOKUPD_ADDR: &str = "127.0.0.1:4161";

/// Configuration settings for the NSQ client.
///
/// Every field maps to an `NSQ_`-prefixed environment variable
/// (`addr` -> `NSQ_ADDR`, `lookupd_addr` -> `NSQ_LOOKUPD_ADDR`, ...).
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct Settings {
    /// nsqd TCP address used by the producer.
    pub addr: String,
    /// nsqlookupd HTTP address used for discovery and topic creation.
    pub lookupd_addr: String,
    /// Create topics through nsqlookupd before subscribing.
    pub auto_create_topic: bool,
    /// Verbosity of transport logging.
    pub log_level: String,
    /// Messages a consumer may have in flight per nsqd connection.
    pub max_in_flight: usize,
    /// Handler tasks per subscription.
    pub concurrency: usize,
}

/// Partial configuration settings loaded from files or environment.
///
/// Any subset of fields may be set. Missing values are filled from defaults.
#[derive(Debug, Default, Deserialize)]
pub struct PartialSettings {
    pub addr: Option<String>,
    pub lookupd_addr: Option<String>,
    pub auto_create_topic: Option<bool>,
    pub log_level: Option<String>,
    pub max_in_flight: Option<usize>,
    pub concurrency: Option<usize>,
}

impl PartialSettings {
    /// Fill every missing value from `defaults`.
    pub fn merge(self, defaults: Settings) -> Settings {
        Settings {
            addr: self.addr.unwrap_or(defaults.addr),
            lookupd_addr: self.lookupd_addr.unwrap_or(defaults.lookupd_addr),
            auto_create_topic: self.auto_create_topic.unwrap_or(defaults.auto_create_topic),
            log_level: self.log_level.unwrap_or(defaults.log_level),
            max_in_flight: self
                .max_in_flight
                .filter(|n| *n > 0)
                .unwrap_or(defaults.max_in_flight),
            concurrency: self
                .concurrency
                .filter(|n| *n > 0)
                .unwrap_or(defaults.concurrency),
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            addr: DEFAULT_NSQ_ADDR.to_string(),
            lookupd_addr: DEFAULT_NSQ_LOOKUPD_ADDR.to_string(),
            auto_create_topic: false,
            log_level: "info".to_string(),
            max_in_flight: 1,
            concurrency: 1,
        }
    }
}
