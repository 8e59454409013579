use std::collections::HashMap;
use tokio::sync::{mpsc, Mutex, RwLock};
use uuid::Uuid;

use crate::commands::{ClientCommand, ServerMessage};

/// Outbound messages buffered per client before broadcasts start skipping it
pub const OUTBOUND_CAPACITY: usize = 100;

/// Client commands waiting for the coordinator. Submitters wait once it is full.
pub const INBOUND_CAPACITY: usize = 1;

pub type SessionId = Uuid;

/// Receiving end of one client's outbound queue. `recv` yields `None` once
/// the registry has dropped the session.
pub struct Session {
    pub id: SessionId,
    pub outbound: mpsc::Receiver<ServerMessage>,
}

/// Connected client sessions plus the shared inbound command queue.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<SessionId, mpsc::Sender<ServerMessage>>>,
    inbound_tx: mpsc::Sender<ClientCommand>,
    inbound_rx: Mutex<mpsc::Receiver<ClientCommand>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);
        Self {
            sessions: RwLock::new(HashMap::new()),
            inbound_tx,
            inbound_rx: Mutex::new(inbound_rx),
        }
    }

    /// Add a session with a fresh id
    pub async fn register(&self) -> Session {
        let (tx, rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let id = Uuid::new_v4();
        let mut sessions = self.sessions.write().await;
        sessions.insert(id, tx);
        log::info!("Registered client session {} ({} connected)", id, sessions.len());
        Session { id, outbound: rx }
    }

    /// Remove a session. Unknown ids are ignored.
    pub async fn unregister(&self, id: &SessionId) {
        let mut sessions = self.sessions.write().await;
        if sessions.remove(id).is_some() {
            log::info!("Unregistered client session {} ({} connected)", id, sessions.len());
        }
    }

    /// Queue `message` for every session without waiting on any of them.
    /// Returns the number of sessions that accepted it.
    pub async fn broadcast(&self, message: ServerMessage) -> usize {
        let targets: Vec<(SessionId, mpsc::Sender<ServerMessage>)> = {
            let sessions = self.sessions.read().await;
            sessions.iter().map(|(id, tx)| (*id, tx.clone())).collect()
        };

        let mut delivered = 0;
        for (id, tx) in targets {
            match tx.try_send(message.clone()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    log::warn!("Session {} is not keeping up, dropped {} message", id, message.action());
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    log::debug!("Session {} already closed, skipping {}", id, message.action());
                }
            }
        }
        delivered
    }

    /// Hand a command to the coordinator, waiting while the queue is full.
    /// Returns false if nobody will ever read it.
    pub async fn submit(&self, command: ClientCommand) -> bool {
        self.inbound_tx.send(command).await.is_ok()
    }

    /// Next queued client command. Cancel safe.
    pub async fn receive_next(&self) -> Option<ClientCommand> {
        self.inbound_rx.lock().await.recv().await
    }

    pub async fn has_clients(&self) -> bool {
        !self.sessions.read().await.is_empty()
    }

    pub async fn client_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Drop every session's queue so its socket closes, and forget any
    /// command still waiting.
    pub async fn disconnect_all(&self) {
        let dropped = {
            let mut sessions = self.sessions.write().await;
            let count = sessions.len();
            sessions.clear();
            count
        };
        if dropped > 0 {
            log::info!("Disconnected {} client sessions", dropped);
        }
        self.discard_pending().await;
    }

    /// Throw away queued inbound commands
    pub async fn discard_pending(&self) {
        let mut rx = self.inbound_rx.lock().await;
        while let Ok(command) = rx.try_recv() {
            log::debug!("Discarding pending {} command", command.action());
        }
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
