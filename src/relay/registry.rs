//! Code-phrase registry: pairs anonymous sender and receiver connections.
//!
//! Keys are `<code phrase>-<channel id>`, so every parallel channel of a
//! transfer has its own namespace. A session moves through two states:
//!
//! - `Waiting`: the first peer registered and holds the receiving half of a
//!   one-shot channel. Its own task keeps the connection and watches it, so
//!   a hang-up releases the key at once.
//! - `Piping`: the second peer's connection was handed over; the first
//!   peer's task runs the pipe and calls [`Registry::release`] when done.
//!
//! The registry never holds a connection itself. All state lives behind one
//! `Mutex`; no operation spans more than one key.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{oneshot, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::RelayError;

/// Role token announced by senders. Anything else is a receiver.
pub const SENDER_TOKEN: &str = "s";
/// Role token sent by receivers (any non-sender token is accepted).
pub const RECEIVER_TOKEN: &str = "r";

/// Registry key: code phrase plus channel id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey(String);

impl SessionKey {
    pub fn new(code_phrase: &str, channel: u16) -> Self {
        Self(format!("{code_phrase}-{channel}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Which end of a transfer a connection is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Sender,
    Receiver,
}

impl Role {
    /// Parse the handshake role token.
    pub fn from_token(token: &str) -> Self {
        if token == SENDER_TOKEN {
            Self::Sender
        } else {
            Self::Receiver
        }
    }

    pub fn token(self) -> &'static str {
        match self {
            Self::Sender => SENDER_TOKEN,
            Self::Receiver => RECEIVER_TOKEN,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sender => "sender",
            Self::Receiver => "receiver",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifies one pairing. Releasing with a stale ticket is a no-op, so a
/// late cleanup can never delete a newer session that reused the key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionTicket {
    key: SessionKey,
    id: Uuid,
}

impl SessionTicket {
    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    pub fn id(&self) -> Uuid {
        self.id
    }
}

/// Held by whichever peer registered first.
pub struct PeerWaiter<C> {
    ticket: SessionTicket,
    role: Role,
    rx: oneshot::Receiver<C>,
}

impl<C> PeerWaiter<C> {
    pub fn ticket(&self) -> &SessionTicket {
        &self.ticket
    }

    pub fn role(&self) -> Role {
        self.role
    }
}

/// Outcome of [`Registry::register`].
pub enum Registration<C> {
    /// First to arrive; wait with [`Registry::await_peer`]. The caller keeps
    /// its connection.
    Waiting { waiter: PeerWaiter<C>, conn: C },
    /// The connection was handed to the peer waiting under this key.
    Delivered,
}

impl<C> fmt::Debug for Registration<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Waiting { waiter, .. } => f
                .debug_struct("Waiting")
                .field("ticket", &waiter.ticket)
                .field("role", &waiter.role)
                .finish(),
            Self::Delivered => f.write_str("Delivered"),
        }
    }
}

/// A refused registration. The connection is handed back so the caller can
/// answer it before closing.
pub struct Rejection<C> {
    pub conn: C,
    pub error: RelayError,
}

impl<C> fmt::Debug for Rejection<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rejection")
            .field("error", &self.error)
            .finish_non_exhaustive()
    }
}

enum Slot<C> {
    Waiting {
        role: Role,
        waker: oneshot::Sender<C>,
    },
    Piping,
}

struct Session<C> {
    id: Uuid,
    opened: Instant,
    slot: Slot<C>,
}

impl<C> Session<C> {
    fn new(slot: Slot<C>) -> Self {
        Self {
            id: Uuid::new_v4(),
            opened: Instant::now(),
            slot,
        }
    }

    fn ticket(&self, key: &SessionKey) -> SessionTicket {
        SessionTicket {
            key: key.clone(),
            id: self.id,
        }
    }

    fn is_half_open(&self) -> bool {
        !matches!(self.slot, Slot::Piping)
    }
}

/// Directory of pending and active pairings.
///
/// Cloneable — all clones share the same inner map.
pub struct Registry<C> {
    sessions: Arc<Mutex<HashMap<SessionKey, Session<C>>>>,
}

impl<C> Clone for Registry<C> {
    fn clone(&self) -> Self {
        Self {
            sessions: Arc::clone(&self.sessions),
        }
    }
}

impl<C> Default for Registry<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> Registry<C> {
    pub fn new() -> Self {
        Self {
            sessions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Register `conn` under `role` for `key`.
    ///
    /// A waiter whose task is gone no longer counts; its slot is taken over.
    pub async fn register(
        &self,
        key: &SessionKey,
        role: Role,
        conn: C,
    ) -> Result<Registration<C>, Rejection<C>> {
        let mut sessions = self.sessions.lock().await;

        let Some(session) = sessions.get_mut(key) else {
            return Ok(Self::start_waiting(&mut sessions, key, role, conn));
        };

        match std::mem::replace(&mut session.slot, Slot::Piping) {
            Slot::Waiting {
                role: waiting,
                waker,
            } if waiting != role => match waker.send(conn) {
                Ok(()) => {
                    info!(key = %key, session = %session.id, role = %role, "delivered to waiting {waiting}");
                    Ok(Registration::Delivered)
                }
                Err(conn) => {
                    debug!(key = %key, "waiting {waiting} vanished, taking over the key");
                    Ok(Self::start_waiting(&mut sessions, key, role, conn))
                }
            },
            Slot::Waiting { waker, .. } if waker.is_closed() => {
                debug!(key = %key, "stale {role} replaced");
                Ok(Self::start_waiting(&mut sessions, key, role, conn))
            }
            slot => {
                session.slot = slot;
                Err(Rejection {
                    conn,
                    error: RelayError::DuplicateRole {
                        key: key.clone(),
                        role,
                    },
                })
            }
        }
    }

    fn start_waiting(
        sessions: &mut HashMap<SessionKey, Session<C>>,
        key: &SessionKey,
        role: Role,
        conn: C,
    ) -> Registration<C> {
        let (waker, rx) = oneshot::channel();
        let session = Session::new(Slot::Waiting { role, waker });
        let ticket = session.ticket(key);
        sessions.insert(key.clone(), session);
        debug!(key = %key, role = %role, "registered, awaiting peer");
        Registration::Waiting {
            waiter: PeerWaiter { ticket, role, rx },
            conn,
        }
    }

    /// Wait for the other peer to arrive, for at most `timeout`.
    ///
    /// On expiry the session is removed. A peer that slipped in just before
    /// the removal is still returned. Cancel-safe: a dropped call leaves the
    /// waiter usable for [`Registry::abandon`].
    pub async fn await_peer(
        &self,
        waiter: &mut PeerWaiter<C>,
        timeout: Duration,
    ) -> Result<C, RelayError> {
        match tokio::time::timeout(timeout, &mut waiter.rx).await {
            Ok(Ok(peer)) => Ok(peer),
            // Waker dropped: the session was swept as expired.
            Ok(Err(_)) => {
                self.release(&waiter.ticket).await;
                Err(RelayError::Timeout {
                    what: "peer (session expired)",
                    after: timeout,
                })
            }
            Err(_) => {
                let mut sessions = self.sessions.lock().await;
                // Deliveries happen under this lock, so this check is final.
                if let Ok(peer) = waiter.rx.try_recv() {
                    return Ok(peer);
                }
                let ticket = &waiter.ticket;
                if sessions.get(&ticket.key).is_some_and(|s| s.id == ticket.id) {
                    sessions.remove(&ticket.key);
                }
                Err(RelayError::Timeout {
                    what: "peer",
                    after: timeout,
                })
            }
        }
    }

    /// Give up waiting because the waiter's own connection went away.
    /// A peer delivered in the same instant is closed with it.
    pub async fn abandon(&self, waiter: PeerWaiter<C>) -> bool {
        let PeerWaiter { ticket, role, mut rx } = waiter;
        let released = self.release(&ticket).await;
        if rx.try_recv().is_ok() {
            warn!(key = %ticket.key, role = %role, "peer arrived as the waiter hung up; closing both");
        }
        released
    }

    /// Delete the session named by `ticket`. Returns whether it was present.
    pub async fn release(&self, ticket: &SessionTicket) -> bool {
        let mut sessions = self.sessions.lock().await;
        if sessions.get(&ticket.key).is_some_and(|s| s.id == ticket.id) {
            sessions.remove(&ticket.key);
            debug!(key = %ticket.key, session = %ticket.id, "session released");
            true
        } else {
            false
        }
    }

    /// Evict half-registered sessions older than `max_age`. Their waiters
    /// see a timeout.
    pub async fn sweep_expired(&self, max_age: Duration) -> Vec<SessionKey> {
        let mut sessions = self.sessions.lock().await;
        let expired: Vec<SessionKey> = sessions
            .iter()
            .filter(|(_, s)| s.is_half_open() && s.opened.elapsed() >= max_age)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            sessions.remove(key);
        }
        if !expired.is_empty() {
            info!(count = expired.len(), "Swept expired sessions");
        }
        expired
    }

    pub async fn contains(&self, key: &SessionKey) -> bool {
        self.sessions.lock().await.contains_key(key)
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.lock().await.is_empty()
    }
}
