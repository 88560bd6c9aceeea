use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

pub const DEFAULT_MAX_CONTENT_LENGTH: usize = 4000;
pub const DEFAULT_PAGE_SIZE: u64 = 50;
pub const DEFAULT_MAX_WARNINGS: u32 = 3;
pub const DEFAULT_WARNING_EXPIRY_SECS: i64 = 30 * 24 * 60 * 60;
pub const DEFAULT_MUTE_SECS: i64 = 60 * 60;
pub const DEFAULT_EVENT_CHANNEL_CAPACITY: usize = 256;
pub const DEFAULT_LOG_FILTER: &str = "threadline_services=debug,threadline_db=debug";

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Settings {
    pub database: DatabaseSettings,
    pub messaging: MessagingSettings,
    pub moderation: ModerationSettings,
    pub events: EventSettings,
    pub logging: LoggingSettings,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseSettings {
    pub url: String,
    pub name: String,
    pub max_pool_size: Option<u32>,
    pub min_pool_size: Option<u32>,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            url: "mongodb://localhost:27017".to_string(),
            name: "threadline".to_string(),
            max_pool_size: None,
            min_pool_size: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct MessagingSettings {
    /// Upper bound on message content, counted in chars.
    pub max_content_length: usize,
    pub default_page_size: u64,
}

impl Default for MessagingSettings {
    fn default() -> Self {
        Self {
            max_content_length: DEFAULT_MAX_CONTENT_LENGTH,
            default_page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

/// Server-wide moderation defaults. Individual servers may override these
/// through their stored moderation settings.
#[derive(Debug, Deserialize, Clone)]
pub struct ModerationSettings {
    pub max_warnings: u32,
    pub warning_expiry_secs: i64,
    pub default_mute_secs: i64,
    /// `None` means bans without an explicit rule duration are permanent.
    pub default_ban_secs: Option<i64>,
}

impl Default for ModerationSettings {
    fn default() -> Self {
        Self {
            max_warnings: DEFAULT_MAX_WARNINGS,
            warning_expiry_secs: DEFAULT_WARNING_EXPIRY_SECS,
            default_mute_secs: DEFAULT_MUTE_SECS,
            default_ban_secs: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct EventSettings {
    pub channel_capacity: usize,
}

impl Default for EventSettings {
    fn default() -> Self {
        Self {
            channel_capacity: DEFAULT_EVENT_CHANNEL_CAPACITY,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingSettings {
    pub filter: String,
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            filter: DEFAULT_LOG_FILTER.to_string(),
            json: false,
        }
    }
}

impl Settings {
    pub fn load() -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            .add_source(
                Environment::default()
                    .separator("__")
                    .prefix("THREADLINE"),
            )
            .set_default("database.url", "mongodb://localhost:27017")?
            .set_default("database.name", "threadline")?
            .set_default("messaging.max_content_length", DEFAULT_MAX_CONTENT_LENGTH as i64)?
            .set_default("messaging.default_page_size", DEFAULT_PAGE_SIZE as i64)?
            .set_default("moderation.max_warnings", DEFAULT_MAX_WARNINGS as i64)?
            .set_default("moderation.warning_expiry_secs", DEFAULT_WARNING_EXPIRY_SECS)?
            .set_default("moderation.default_mute_secs", DEFAULT_MUTE_SECS)?
            .set_default("events.channel_capacity", DEFAULT_EVENT_CHANNEL_CAPACITY as i64)?
            .set_default("logging.filter", DEFAULT_LOG_FILTER)?
            .set_default("logging.json", false)?
            .build()?;

        config.try_deserialize()
    }
}
