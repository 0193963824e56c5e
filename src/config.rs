//! Runtime configuration, taken from CLI flags with environment fallbacks.

use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Clone, Parser)]
#[command(name = "tussam-api", version, about = "Paradas y tiempos de TUSSAM (Sevilla)")]
pub struct Settings {
    /// Address the HTTP server binds to.
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Port the HTTP server listens on.
    #[arg(long, env = "PORT", default_value_t = 8080)]
    pub port: u16,

    /// SQLite database location. Plain paths and sqlite:/// URLs both work.
    #[arg(long, env = "DATABASE_URL", default_value = "data/tussam.db")]
    pub database_url: String,

    /// Shared key the sync endpoints require. Leaving it unset keeps them
    /// open, which is only sensible in development.
    #[arg(long, env = "SYNC_API_KEY")]
    pub sync_api_key: Option<String>,

    /// Whether the weekly background sync runs at all.
    #[arg(
        long,
        env = "SYNC_ENABLED",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    pub sync_enabled: bool,

    /// Weekday of the scheduled sync (mon..sun).
    #[arg(long, env = "SYNC_DAY", default_value = "sun")]
    pub sync_day: String,

    /// Hour of the scheduled sync, UTC.
    #[arg(long, env = "SYNC_HOUR", default_value_t = 4)]
    pub sync_hour: u32,

    /// Minute of the scheduled sync.
    #[arg(long, env = "SYNC_MINUTE", default_value_t = 0)]
    pub sync_minute: u32,
}

impl Settings {
    /// The on-disk database path. Deployments migrated from ORM-style
    /// configuration still carry URL prefixes, so those are stripped.
    pub fn database_file(&self) -> PathBuf {
        let raw = self.database_url.trim();
        let path = raw
            .strip_prefix("sqlite+aiosqlite:///")
            .or_else(|| raw.strip_prefix("sqlite:///"))
            .unwrap_or(raw);
        PathBuf::from(path)
    }
}
