use std::fmt;

use slab::Slab;
use tokio::sync::RwLock;

use crate::platform::StreamConfig;

/// Identity of one client connection. Stable for the lifetime of the
/// connection; only reused after the registry entry has been removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(usize);

impl SessionId {
    pub fn as_u64(&self) -> u64 {
        self.0 as u64
    }
}

impl From<usize> for SessionId {
    fn from(key: usize) -> Self {
        SessionId(key)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Connected,
    Configured,
    Closing,
}

#[derive(Debug, Clone)]
pub struct Session {
    config: Option<StreamConfig>,
    status: Status,
}

impl Session {
    fn new() -> Self {
        Session {
            config: None,
            status: Status::Connected,
        }
    }

    pub fn config(&self) -> Option<&StreamConfig> {
        self.config.as_ref()
    }

    pub fn status(&self) -> Status {
        self.status
    }
}

/// Per-session stream configuration, independent of any running process.
pub struct SessionRegistry {
    sessions: RwLock<Slab<Session>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        SessionRegistry {
            sessions: RwLock::new(Slab::new()),
        }
    }

    pub async fn open(&self) -> SessionId {
        let mut sessions = self.sessions.write().await;
        SessionId(sessions.insert(Session::new()))
    }

    /// Stores `config` for an open session. Returns false if the session is
    /// unknown or already closing.
    pub async fn set(&self, id: SessionId, config: StreamConfig) -> bool {
        let mut sessions = self.sessions.write().await;
        match sessions.get_mut(id.0) {
            Some(session) if session.status != Status::Closing => {
                session.config = Some(config);
                session.status = Status::Configured;
                true
            }
            _ => false,
        }
    }

    pub async fn get(&self, id: SessionId) -> Option<StreamConfig> {
        let sessions = self.sessions.read().await;
        sessions.get(id.0).and_then(|session| session.config.clone())
    }

    #[cfg(test)]
    pub async fn status(&self, id: SessionId) -> Option<Status> {
        let sessions = self.sessions.read().await;
        sessions.get(id.0).map(Session::status)
    }

    pub async fn mark_closing(&self, id: SessionId) {
        let mut sessions = self.sessions.write().await;
        if let Some(session) = sessions.get_mut(id.0) {
            session.status = Status::Closing;
        }
    }

    pub async fn remove(&self, id: SessionId) -> Option<Session> {
        let mut sessions = self.sessions.write().await;
        sessions.try_remove(id.0)
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(platform: &str) -> StreamConfig {
        StreamConfig {
            platform: platform.to_string(),
            stream_key: "key".to_string(),
            title: "Friday stream".to_string(),
            description: "testing".to_string(),
        }
    }

    #[tokio::test]
    async fn set_get_remove() {
        let registry = SessionRegistry::new();
        let id = registry.open().await;
        assert_eq!(registry.status(id).await, Some(Status::Connected));
        assert_eq!(registry.get(id).await, None);

        assert!(registry.set(id, config("twitch")).await);
        assert!(registry.set(id, config("youtube")).await);
        assert_eq!(registry.get(id).await.unwrap().platform, "youtube");
        assert_eq!(registry.status(id).await, Some(Status::Configured));

        let removed = registry.remove(id).await.unwrap();
        assert_eq!(removed.config().unwrap().title, "Friday stream");
        assert!(registry.remove(id).await.is_none());
        assert_eq!(registry.len().await, 0);
    }

    #[tokio::test]
    async fn closing_sessions_reject_configuration() {
        let registry = SessionRegistry::new();
        let id = registry.open().await;
        registry.mark_closing(id).await;
        assert!(!registry.set(id, config("twitch")).await);
        assert!(!registry.set(SessionId(42), config("twitch")).await);
    }

    #[tokio::test]
    async fn identities_are_distinct_while_open() {
        let registry = SessionRegistry::new();
        let a = registry.open().await;
        let b = registry.open().await;
        assert_ne!(a, b);
        registry.remove(a).await;
        let c = registry.open().await;
        assert_ne!(c, b);
    }
}
