use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;

pub const DEFAULT_LISTEN_ADDR: &str = "[::1]:50051";
pub const DEFAULT_FFMPEG_PATH: &str = "ffmpeg";
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: SocketAddr,
    pub ffmpeg_path: PathBuf,
    /// How long a transcoder gets to exit after SIGTERM before it is killed.
    pub grace_period: Duration,
}

impl Config {
    /// Reads the process environment. Call `dotenv()` first to pick up a `.env` file.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let listen_addr = match lookup("KAWA_LISTEN_ADDR") {
            Some(value) => value
                .parse()
                .map_err(|source| ConfigError::ListenAddr { value, source })?,
            None => DEFAULT_LISTEN_ADDR
                .parse()
                .map_err(|source| ConfigError::ListenAddr {
                    value: DEFAULT_LISTEN_ADDR.to_string(),
                    source,
                })?,
        };

        let ffmpeg_path = lookup("KAWA_FFMPEG_PATH")
            .filter(|path| !path.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_FFMPEG_PATH));

        let grace_period = match lookup("KAWA_GRACE_PERIOD_SECS") {
            Some(value) => parse_grace_period(&value)?,
            None => DEFAULT_GRACE_PERIOD,
        };

        Ok(Config {
            listen_addr,
            ffmpeg_path,
            grace_period,
        })
    }
}

fn parse_grace_period(value: &str) -> Result<Duration, ConfigError> {
    match value.trim().parse::<f64>() {
        Ok(secs) if secs.is_finite() && secs > 0.0 => Ok(Duration::from_secs_f64(secs)),
        _ => Err(ConfigError::GracePeriod {
            value: value.to_string(),
        }),
    }
}
