use std::fmt;
use std::str::FromStr;

use crate::error::RouterError;

/// Upstream ingest platforms a session can publish to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Twitch,
    Youtube,
}

impl Platform {
    fn ingest_base(&self) -> &'static str {
        match self {
            Platform::Twitch => "rtmp://live.twitch.tv/app/",
            Platform::Youtube => "rtmp://a.rtmp.youtube.com/live2/",
        }
    }

    pub fn destination(&self, stream_key: &str) -> String {
        format!("{}{}", self.ingest_base(), stream_key)
    }
}

impl FromStr for Platform {
    type Err = RouterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "twitch" => Ok(Platform::Twitch),
            "youtube" => Ok(Platform::Youtube),
            _ => Err(RouterError::InvalidPlatform(s.to_string())),
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Platform::Twitch => write!(f, "twitch"),
            Platform::Youtube => write!(f, "youtube"),
        }
    }
}

/// What a client asked to publish. `platform` is kept as sent so that an
/// unset or unknown platform is only rejected when the destination is resolved.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamConfig {
    pub platform: String,
    pub stream_key: String,
    pub title: String,
    pub description: String,
}

/// A destination ready to hand to the transcoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    pub platform: Platform,
    pub url: String,
}

/// Hides the stream key of a destination url so it can be logged.
pub fn redacted(url: &str) -> String {
    match url.rfind('/') {
        Some(i) if i + 1 < url.len() => format!("{}****", &url[..=i]),
        _ => url.to_string(),
    }
}

pub fn resolve_destination(config: &StreamConfig) -> Result<Destination, RouterError> {
    let platform: Platform = config.platform.parse()?;
    Ok(Destination {
        platform,
        url: platform.destination(&config.stream_key),
    })
}
