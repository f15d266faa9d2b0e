use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinSet;

use crate::error::TranscoderError;
use crate::platform::redacted;
use crate::session::SessionId;
#[cfg(test)]
use crate::transcoder::HandleState;
use crate::transcoder::{Termination, TranscoderCommand, TranscoderHandle};

/// The transcoder bound to one session. `bind` holds the slot lock for its
/// whole replace sequence, which orders it against every other operation on
/// that session without touching any other session.
#[derive(Default)]
struct SlotState {
    handle: Option<Arc<TranscoderHandle>>,
    /// Set once the slot has been removed from the map. A bind that raced
    /// the removal must look the session up again.
    retired: bool,
}

type Slot = Mutex<SlotState>;

/// Maps sessions to their transcoder process, at most one per session.
pub struct Supervisor {
    grace_period: Duration,
    slots: Mutex<HashMap<SessionId, Arc<Slot>>>,
    /// Set by `release_all` under the map lock. No transcoder is launched
    /// afterwards.
    closing: AtomicBool,
}

impl Supervisor {
    pub fn new(grace_period: Duration) -> Self {
        Supervisor {
            grace_period,
            slots: Mutex::new(HashMap::new()),
            closing: AtomicBool::new(false),
        }
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    /// Binds a fresh transcoder for `destination` to `session`. Any previous
    /// transcoder is fully terminated before the new one is launched, so the
    /// two never accept input at the same time.
    pub async fn bind(
        &self,
        session: SessionId,
        destination: String,
        command: &TranscoderCommand,
    ) -> Result<(), TranscoderError> {
        let mut bound = loop {
            let slot = self
                .slot_or_insert(session)
                .await
                .ok_or(TranscoderError::SupervisorClosed)?;
            let bound = slot.lock_owned().await;
            // Released between the lookup and the lock, look it up again.
            if !bound.retired {
                break bound;
            }
        };

        if let Some(previous) = bound.handle.take() {
            let termination = previous.terminate().await;
            log::info!(
                "{}: replaced transcoder {:?} ({})",
                session,
                previous.pid(),
                termination
            );
        }

        if self.is_closing() {
            log::info!("{}: shutting down, not launching a transcoder", session);
            return Err(TranscoderError::SupervisorClosed);
        }

        match TranscoderHandle::spawn(command, destination, self.grace_period) {
            Ok(handle) => {
                log::info!(
                    "{}: bound transcoder {:?} to {}",
                    session,
                    handle.pid(),
                    redacted(handle.destination())
                );
                bound.handle = Some(Arc::new(handle));
                Ok(())
            }
            Err(e) => {
                log::error!("{}: {}", session, e);
                Err(e)
            }
        }
    }

    /// Forwards a chunk to the session's transcoder. Chunks for sessions
    /// without a running transcoder are dropped.
    pub async fn forward(&self, session: SessionId, bytes: &[u8]) -> bool {
        let handle = match self.slot(session).await {
            Some(slot) => {
                let bound = slot.lock().await;
                bound.handle.clone()
            }
            None => None,
        };

        let handle = match handle {
            Some(handle) if handle.is_running() => handle,
            Some(_) => {
                log::warn!(
                    "{}: transcoder is shutting down, dropping {} bytes",
                    session,
                    bytes.len()
                );
                return false;
            }
            None => {
                log::warn!("{}: not configured, dropping {} bytes", session, bytes.len());
                return false;
            }
        };

        match handle.write(bytes).await {
            Ok(()) => true,
            Err(e) => {
                log::warn!("{}: dropping {} bytes: {}", session, bytes.len(), e);
                false
            }
        }
    }

    /// Terminates and unbinds the session's transcoder. A no-op when nothing
    /// is bound. If a termination is already underway it is awaited rather
    /// than repeated.
    pub async fn release(&self, session: SessionId) -> Option<Termination> {
        let slot = self.slot(session).await?;
        let termination = drain(session, &slot).await;
        self.forget_if_empty(session, &slot).await;
        termination
    }

    /// Closes the supervisor and terminates every bound transcoder
    /// concurrently, waiting for all of them to settle. Later binds fail
    /// with [`TranscoderError::SupervisorClosed`].
    pub async fn release_all(&self) -> usize {
        let slots: Vec<(SessionId, Arc<Slot>)> = {
            let slots = self.slots.lock().await;
            self.closing.store(true, Ordering::SeqCst);
            slots
                .iter()
                .map(|(session, slot)| (*session, slot.clone()))
                .collect()
        };

        let mut set = JoinSet::new();
        for (session, slot) in slots.iter().cloned() {
            set.spawn(async move { drain(session, &slot).await });
        }

        let mut released = 0;
        while let Some(result) = set.join_next().await {
            match result {
                Ok(Some(_)) => released += 1,
                Ok(None) => {}
                Err(e) => log::error!("transcoder release task failed: {}", e),
            }
        }

        for (session, slot) in &slots {
            self.forget_if_empty(*session, slot).await;
        }
        log::info!("released {} transcoder(s)", released);
        released
    }

    #[cfg(test)]
    pub async fn state(&self, session: SessionId) -> Option<HandleState> {
        let slot = self.slot(session).await?;
        let bound = slot.lock().await;
        bound.handle.as_ref().map(|handle| handle.state())
    }

    #[cfg(test)]
    pub async fn destination(&self, session: SessionId) -> Option<String> {
        let slot = self.slot(session).await?;
        let bound = slot.lock().await;
        bound
            .handle
            .as_ref()
            .map(|handle| handle.destination().to_string())
    }

    #[cfg(test)]
    pub async fn tracked(&self) -> usize {
        self.slots.lock().await.len()
    }

    /// Number of sessions with a transcoder that still accepts input. Waits
    /// out any bind in progress.
    pub async fn running(&self) -> usize {
        let slots: Vec<Arc<Slot>> = self.slots.lock().await.values().cloned().collect();
        let mut running = 0;
        for slot in slots {
            let bound = slot.lock().await;
            if bound.handle.as_ref().map_or(false, |handle| handle.is_running()) {
                running += 1;
            }
        }
        running
    }

    async fn slot(&self, session: SessionId) -> Option<Arc<Slot>> {
        self.slots.lock().await.get(&session).cloned()
    }

    /// `None` once the supervisor is closing.
    async fn slot_or_insert(&self, session: SessionId) -> Option<Arc<Slot>> {
        let mut slots = self.slots.lock().await;
        if self.is_closing() {
            return None;
        }
        Some(slots.entry(session).or_default().clone())
    }

    /// Drops the map entry once the slot is empty. The slot lock is taken
    /// first and the map lock second, the reverse never happens.
    async fn forget_if_empty(&self, session: SessionId, slot: &Arc<Slot>) {
        let mut bound = slot.lock().await;
        if bound.handle.is_some() || bound.retired {
            return;
        }
        let mut slots = self.slots.lock().await;
        if slots
            .get(&session)
            .map_or(false, |current| Arc::ptr_eq(current, slot))
        {
            slots.remove(&session);
            bound.retired = true;
        }
    }
}

/// Terminates whatever is bound in `slot`. The handle stays in the slot
/// while it shuts down, so forwards see it terminating and drop their chunk,
/// and a concurrent release awaits the same exit instead of starting another.
async fn drain(session: SessionId, slot: &Slot) -> Option<Termination> {
    let handle = slot.lock().await.handle.clone()?;
    let termination = handle.terminate().await;

    let mut bound = slot.lock().await;
    if bound
        .handle
        .as_ref()
        .map_or(false, |current| Arc::ptr_eq(current, &handle))
    {
        bound.handle = None;
        log::info!(
            "{}: released transcoder {:?} ({}, {} bytes forwarded)",
            session,
            handle.pid(),
            termination,
            handle.bytes_written()
        );
    }
    Some(termination)
}
