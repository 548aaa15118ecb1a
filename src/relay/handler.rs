//! Per-connection rendezvous: prompt, read the role and code phrase,
//! register, then either wait for the peer or hand the connection over.
//!
//! Whichever peer arrives first owns the pipe. While it waits, its task
//! watches the socket, so a peer that hangs up frees the key at once. The
//! second peer's task ends as soon as its connection is delivered.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tracing::{debug, info, warn};

use super::pipe::{self, PipeOptions, PipeStats};
use super::registry::{Registration, Registry, Role, SessionKey, SessionTicket};
use crate::error::RelayError;
use crate::frame::{self, CONTROL_WIDTH, NO, OK, TIMEOUT, WHO};

#[derive(Debug, Clone, Copy)]
pub struct HandshakeSettings {
    /// Deadline for the `role.codePhrase` reply to `who?`.
    pub handshake_timeout: Duration,
    /// How long the first peer waits for the second.
    pub pairing_timeout: Duration,
    pub pipe: PipeOptions,
}

impl Default for HandshakeSettings {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(30),
            pairing_timeout: Duration::from_secs(3600),
            pipe: PipeOptions::default(),
        }
    }
}

/// How a handled connection ended.
#[derive(Debug)]
pub enum Outcome {
    /// First peer's side: the pair was piped to completion.
    Piped { key: SessionKey, stats: PipeStats },
    /// Connection handed to the waiting peer's task.
    Delivered { key: SessionKey },
    /// Role already taken for this key; the peer was told `no`.
    Rejected { key: SessionKey, role: Role },
    /// Nobody arrived in time; the waiting peer was told `timeout`.
    PairingTimedOut { key: SessionKey, role: Role },
    /// The waiting peer hung up before being paired.
    Abandoned { key: SessionKey, role: Role },
}

/// Split `role.codePhrase` at the first dot.
pub fn parse_hello(hello: &str) -> Result<(Role, &str), RelayError> {
    match hello.split_once('.') {
        Some((role, phrase)) if !role.is_empty() && !phrase.is_empty() => {
            Ok((Role::from_token(role), phrase))
        }
        _ => Err(RelayError::MalformedHandshake(hello.to_string())),
    }
}

/// Run the rendezvous for one accepted connection on `channel`.
pub async fn handle_connection<C>(
    mut conn: C,
    channel: u16,
    registry: &Registry<C>,
    settings: &HandshakeSettings,
) -> Result<Outcome, RelayError>
where
    C: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    frame::write_frame(&mut conn, WHO, CONTROL_WIDTH).await?;
    let hello = tokio::time::timeout(
        settings.handshake_timeout,
        frame::read_frame(&mut conn, CONTROL_WIDTH),
    )
    .await
    .map_err(|_| RelayError::Timeout {
        what: "handshake",
        after: settings.handshake_timeout,
    })??;

    let (role, phrase) = parse_hello(&hello)?;
    let key = SessionKey::new(phrase, channel);
    debug!(channel, key = %key, role = %role, "handshake complete");

    let registration = match registry.register(&key, role, conn).await {
        Ok(r) => r,
        Err(mut rejection) => {
            warn!(key = %key, role = %role, "{}", rejection.error);
            let _ = frame::write_frame(&mut rejection.conn, NO, CONTROL_WIDTH).await;
            return Ok(Outcome::Rejected { key, role });
        }
    };

    let Registration::Waiting { mut waiter, mut conn } = registration else {
        return Ok(Outcome::Delivered { key });
    };

    let waited = tokio::select! {
        peer = registry.await_peer(&mut waiter, settings.pairing_timeout) => Some(peer),
        () = hung_up(&mut conn) => None,
    };

    match waited {
        Some(Ok(peer)) => {
            let ticket = waiter.ticket().clone();
            let (sender, receiver) = match role {
                Role::Sender => (conn, peer),
                Role::Receiver => (peer, conn),
            };
            let stats = notify_and_pipe(sender, receiver, &ticket, registry, settings).await?;
            Ok(Outcome::Piped { key, stats })
        }
        Some(Err(RelayError::Timeout { .. })) => {
            info!(key = %key, role = %role, after = ?settings.pairing_timeout, "no peer arrived");
            let _ = frame::write_frame(&mut conn, TIMEOUT, CONTROL_WIDTH).await;
            Ok(Outcome::PairingTimedOut { key, role })
        }
        Some(Err(e)) => Err(e),
        None => {
            registry.abandon(waiter).await;
            info!(key = %key, role = %role, "peer left before pairing");
            Ok(Outcome::Abandoned { key, role })
        }
    }
}

/// Resolves once a waiting peer closes its connection. Neither client sends
/// anything before it is paired, so early bytes end the wait too.
async fn hung_up<C>(conn: &mut C)
where
    C: AsyncRead + Unpin,
{
    let mut byte = [0u8; 1];
    let _ = conn.read(&mut byte).await;
}

/// Tell the sender to start, pipe until either side closes, then release.
async fn notify_and_pipe<C>(
    mut sender: C,
    receiver: C,
    ticket: &SessionTicket,
    registry: &Registry<C>,
    settings: &HandshakeSettings,
) -> Result<PipeStats, RelayError>
where
    C: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    if let Err(e) = frame::write_frame(&mut sender, OK, CONTROL_WIDTH).await {
        registry.release(ticket).await;
        return Err(e.into());
    }
    info!(key = %ticket.key(), session = %ticket.id(), "piping");
    let stats = pipe::pipe(sender, receiver, settings.pipe).await;
    registry.release(ticket).await;
    info!(
        key = %ticket.key(),
        bytes_to_receiver = stats.a_to_b,
        bytes_to_sender = stats.b_to_a,
        end = stats.end.as_str(),
        "pipe closed"
    );
    Ok(stats)
}
