use tokio::sync::watch;

use crate::error::{RouterError, TranscoderError};
use crate::platform::{resolve_destination, Platform, StreamConfig};
use crate::session::{SessionId, SessionRegistry};
use crate::supervisor::Supervisor;
use crate::transcoder::TranscoderCommand;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouterStatus {
    pub open_sessions: usize,
    pub bound_transcoders: usize,
    pub accepting: bool,
}

/// Dispatches connection events to the session registry and the supervisor.
///
/// Events for one session are expected to arrive one at a time, in order.
/// Events for different sessions may interleave freely.
pub struct EventRouter {
    registry: SessionRegistry,
    supervisor: Supervisor,
    command: TranscoderCommand,
    shutdown: watch::Sender<bool>,
}

impl EventRouter {
    pub fn new(supervisor: Supervisor, command: TranscoderCommand) -> Self {
        let (shutdown, _) = watch::channel(false);
        EventRouter {
            registry: SessionRegistry::new(),
            supervisor,
            command,
            shutdown,
        }
    }

    pub fn is_accepting(&self) -> bool {
        !*self.shutdown.borrow()
    }

    /// Resolves once process shutdown has begun.
    pub async fn closed(&self) {
        let mut shutdown = self.shutdown.subscribe();
        let _ = shutdown.wait_for(|closed| *closed).await;
    }

    pub async fn on_connect(&self) -> Result<SessionId, RouterError> {
        if !self.is_accepting() {
            return Err(RouterError::ShuttingDown);
        }
        let session = self.registry.open().await;
        log::info!("{}: connected", session);
        Ok(session)
    }

    /// Stores the configuration and rebinds the session's transcoder to the
    /// destination it resolves to. An unresolvable configuration leaves the
    /// session exactly as it was.
    pub async fn on_configure(
        &self,
        session: SessionId,
        config: StreamConfig,
    ) -> Result<Platform, RouterError> {
        if !self.is_accepting() {
            return Err(RouterError::ShuttingDown);
        }

        let destination = match resolve_destination(&config) {
            Ok(destination) => destination,
            Err(e) => {
                log::error!("{}: rejected configuration: {}", session, e);
                return Err(e);
            }
        };

        log::info!(
            "{}: configuring {} stream {:?}",
            session,
            destination.platform,
            config.title
        );
        log::debug!("{}: description {:?}", session, config.description);
        if !self.registry.set(session, config).await {
            log::error!("{}: configuration for a closed session", session);
            return Err(RouterError::UnknownSession);
        }

        self.supervisor
            .bind(session, destination.url, &self.command)
            .await
            .map_err(|e| match e {
                TranscoderError::SupervisorClosed => RouterError::ShuttingDown,
                e => RouterError::Launch(e),
            })?;
        Ok(destination.platform)
    }

    pub async fn on_chunk(&self, session: SessionId, bytes: &[u8]) -> bool {
        if !self.is_accepting() {
            log::debug!("{}: shutting down, dropping {} bytes", session, bytes.len());
            return false;
        }
        self.supervisor.forward(session, bytes).await
    }

    /// Releases the session's transcoder, then forgets the session. The
    /// registry entry outlives the process so the identity cannot be reused
    /// while a termination is still settling.
    pub async fn on_disconnect(&self, session: SessionId) {
        self.registry.mark_closing(session).await;
        if let Some(termination) = self.supervisor.release(session).await {
            log::info!("{}: transcoder stopped ({})", session, termination);
        }
        match self.registry.remove(session).await {
            Some(removed) => log::info!(
                "{}: disconnected ({:?}, {:?})",
                session,
                removed.status(),
                removed.config().map(|config| config.title.as_str())
            ),
            None => log::debug!("{}: already disconnected", session),
        }
    }

    /// Stops accepting events and terminates every transcoder. Connections
    /// waiting on [`EventRouter::closed`] are told to wind down.
    pub async fn on_process_shutdown(&self) {
        if self.shutdown.send_replace(true) {
            return;
        }
        log::info!("shutting down, releasing all transcoders");
        self.supervisor.release_all().await;
    }

    pub async fn status(&self) -> RouterStatus {
        RouterStatus {
            open_sessions: self.registry.len().await,
            bound_transcoders: self.supervisor.running().await,
            accepting: self.is_accepting(),
        }
    }
}
