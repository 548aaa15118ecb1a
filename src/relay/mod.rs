//! Rendezvous relay: W TCP channel listeners sharing one code-phrase registry.
//!
//! Channel `i` listens on `base_port + i`. Every accepted connection runs the
//! rendezvous handler in its own task. A sweep task evicts half-open sessions
//! older than the pairing timeout whose waiters missed their own deadline.
//!
//! ```text
//! sender  ──┐                      ┌── receiver
//!           ├─ channel i listener ─┤
//!           └──── registry[phrase-i] ────┘
//!                      │
//!                    pipe
//! ```

pub mod handler;
pub mod pipe;
pub mod registry;

use std::future::Future;
use std::io;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::config::RelayConfig;
use crate::error::RelayError;
use handler::HandshakeSettings;
use pipe::PipeOptions;
use registry::Registry;

pub use handler::{handle_connection, parse_hello, Outcome};
pub use pipe::{PipeEnd, PipeStats};
pub use registry::{Role, SessionKey};

/// An unbound relay: configuration plus the shared registry.
pub struct Relay {
    config: RelayConfig,
    registry: Registry<TcpStream>,
}

impl Relay {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            config,
            registry: Registry::new(),
        }
    }

    pub fn registry(&self) -> &Registry<TcpStream> {
        &self.registry
    }

    fn handshake_settings(&self) -> HandshakeSettings {
        HandshakeSettings {
            handshake_timeout: self.config.handshake_timeout(),
            pairing_timeout: self.config.pairing_timeout(),
            pipe: PipeOptions {
                buffer_size: self.config.buffer_size,
                idle_timeout: self.config.idle_timeout(),
            },
        }
    }

    /// Bind every channel port. Fails on the first port that cannot be bound.
    pub async fn bind(&self) -> Result<BoundRelay, RelayError> {
        let channels = self.config.channels;
        if channels == 0 {
            return Err(RelayError::NoChannels);
        }
        let mut listeners = Vec::with_capacity(usize::from(channels));

        for channel in 0..channels {
            let port = if self.config.base_port == 0 {
                Some(0)
            } else {
                self.config.base_port.checked_add(channel)
            };
            let Some(port) = port else {
                return Err(RelayError::Bind {
                    channel,
                    addr: format!("{}:{}+{channel}", self.config.host, self.config.base_port),
                    source: io::Error::new(io::ErrorKind::InvalidInput, "port out of range"),
                });
            };

            let addr = format!("{}:{port}", self.config.host);
            let listener = TcpListener::bind(&addr)
                .await
                .map_err(|source| RelayError::Bind {
                    channel,
                    addr: addr.clone(),
                    source,
                })?;
            let local = listener.local_addr()?;
            info!(channel, addr = %local, "Channel listening");
            listeners.push((channel, listener));
        }

        Ok(BoundRelay {
            listeners,
            registry: self.registry.clone(),
            settings: self.handshake_settings(),
            session_max_age: self.config.pairing_timeout(),
            sweep_interval: self.config.sweep_interval(),
        })
    }

    /// Bind, then serve until `shutdown` resolves.
    pub async fn run<F>(&self, shutdown: F) -> Result<(), RelayError>
    where
        F: Future<Output = ()>,
    {
        self.bind().await?.serve(shutdown).await;
        Ok(())
    }
}

/// A relay whose channel ports are bound and ready to accept.
pub struct BoundRelay {
    listeners: Vec<(u16, TcpListener)>,
    registry: Registry<TcpStream>,
    settings: HandshakeSettings,
    session_max_age: Duration,
    sweep_interval: Duration,
}

impl BoundRelay {
    /// Actual local ports, in channel order.
    pub fn ports(&self) -> Vec<u16> {
        self.listeners
            .iter()
            .filter_map(|(_, l)| l.local_addr().ok().map(|a| a.port()))
            .collect()
    }

    /// Accept on every channel until `shutdown` resolves or all listeners fail.
    pub async fn serve<F>(self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let mut channels = JoinSet::new();
        for (channel, listener) in self.listeners {
            channels.spawn(accept_loop(
                channel,
                listener,
                self.registry.clone(),
                self.settings,
            ));
        }

        // Periodic sweep: evict sessions that never found their peer
        let registry = self.registry.clone();
        let max_age = self.session_max_age;
        let sweep_interval = self.sweep_interval;
        let sweep_task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(sweep_interval);
            loop {
                interval.tick().await;
                let expired = registry.sweep_expired(max_age).await;
                for key in expired {
                    debug!(key = %key, "Expired half-open session");
                }
            }
        });

        info!("Relay ready");

        tokio::select! {
            () = shutdown => info!("Relay shutting down"),
            () = async { while channels.join_next().await.is_some() {} } => {
                warn!("All channel listeners stopped");
            }
        }

        channels.abort_all();
        sweep_task.abort();
    }
}

async fn accept_loop(
    channel: u16,
    listener: TcpListener,
    registry: Registry<TcpStream>,
    settings: HandshakeSettings,
) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(source) => {
                error!("{}", RelayError::Accept { channel, source });
                return;
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            debug!(channel, peer = %peer, "set_nodelay failed: {e}");
        }
        debug!(channel, peer = %peer, "Accepted connection");

        let registry = registry.clone();
        tokio::spawn(async move {
            match handler::handle_connection(stream, channel, &registry, &settings).await {
                Ok(outcome) => debug!(channel, peer = %peer, ?outcome, "Connection handled"),
                Err(e) => warn!(channel, peer = %peer, "Rendezvous failed: {e}"),
            }
        });
    }
}
