use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};
use tracing::{debug, error, info, warn};

use crate::network::protocol::{Envelope, PeerAddress, TransferEvent};
use crate::{DccError, Result};

/// Upper bound for one envelope line; a 64 KiB chunk encodes to ~88 KiB.
pub const MAX_LINE_LENGTH: usize = 16 * 1024 * 1024;

/// Lines queued per peer before `send` waits.
const LINK_CAPACITY: usize = 8;

/// Decoded inbound traffic, tagged with the sender's advertised address.
pub type InboundSender = mpsc::UnboundedSender<(PeerAddress, TransferEvent)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkTimeouts {
    pub connect: Duration,
    /// Longest a single line may wait on a peer that is not reading.
    pub write: Duration,
}

impl Default for LinkTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(10),
            write: Duration::from_secs(30),
        }
    }
}

struct Outbound {
    line: String,
    written: oneshot::Sender<Result<()>>,
}

type Link = mpsc::Sender<Outbound>;

/// Peer-socket layer: one listener for inbound envelopes and one lazily
/// opened, write-only connection per remote peer.
///
/// Replies never travel back over the connection that carried the request;
/// a peer answers by connecting to the `from_ip:from_port` it was given.
pub struct PeerNetwork {
    local_address: PeerAddress,
    timeouts: LinkTimeouts,
    links: Mutex<HashMap<PeerAddress, Link>>,
    accept_task: JoinHandle<()>,
}

impl PeerNetwork {
    /// Binds `bind_addr` and starts accepting peers. The advertised port is
    /// the one actually bound, so port 0 works.
    pub async fn bind(
        bind_addr: SocketAddr,
        advertise_host: &str,
        timeouts: LinkTimeouts,
        inbound: InboundSender,
    ) -> Result<Self> {
        let listener = TcpListener::bind(bind_addr).await.map_err(|e| {
            DccError::Transport(format!("Failed to bind {}: {}", bind_addr, e))
        })?;
        let port = listener.local_addr()?.port();
        let local_address = PeerAddress::new(advertise_host, port);

        info!("Peer listener on {} (advertised as {})", listener.local_addr()?, local_address);

        let accept_task = tokio::spawn(Self::accept_loop(listener, inbound));

        Ok(Self {
            local_address,
            timeouts,
            links: Mutex::new(HashMap::new()),
            accept_task,
        })
    }

    pub fn local_address(&self) -> &PeerAddress {
        &self.local_address
    }

    async fn accept_loop(listener: TcpListener, inbound: InboundSender) {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    debug!("Accepted connection from {}", addr);
                    tokio::spawn(Self::read_loop(stream, addr, inbound.clone()));
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                }
            }
        }
    }

    async fn read_loop(stream: TcpStream, addr: SocketAddr, inbound: InboundSender) {
        let mut lines = FramedRead::new(stream, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));

        while let Some(line) = lines.next().await {
            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    warn!("Connection read error from {}: {}", addr, e);
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }

            match Envelope::from_line(&line) {
                Ok(envelope) => {
                    let from = envelope.from_address();
                    debug!(
                        "📥 {} '{}' from {} (socket {})",
                        envelope.event.kind().event_name(),
                        envelope.event.name(),
                        from,
                        addr
                    );
                    if inbound.send((from, envelope.event)).is_err() {
                        debug!("Inbound receiver gone, closing connection from {}", addr);
                        break;
                    }
                }
                Err(e) => warn!("Dropping malformed envelope from {}: {}", addr, e),
            }
        }
        debug!("Read task ended for {}", addr);
    }

    /// Delivers `event` to `peer`, opening the connection on first use.
    /// Returns once the line has been written to the socket, so a peer that
    /// stops reading slows the caller down instead of growing a queue.
    pub async fn send(&self, peer: &PeerAddress, event: TransferEvent) -> Result<()> {
        let line = Envelope::new(&self.local_address, peer, event).to_line()?;
        let (written_tx, written_rx) = oneshot::channel();

        let link = self.link(peer)?;
        link.send(Outbound {
            line,
            written: written_tx,
        })
        .await
        .map_err(|_| DccError::Transport(format!("Connection to {} is closed", peer)))?;

        written_rx.await.map_err(|_| {
            DccError::Transport(format!("Connection to {} closed before the write finished", peer))
        })?
    }

    fn link(&self, peer: &PeerAddress) -> Result<Link> {
        let mut links = self
            .links
            .lock()
            .map_err(|e| DccError::Transport(format!("Peer link table poisoned: {}", e)))?;

        if let Some(link) = links.get(peer).filter(|link| !link.is_closed()) {
            return Ok(link.clone());
        }

        let (link, queue) = mpsc::channel(LINK_CAPACITY);
        tokio::spawn(Self::write_loop(peer.clone(), self.timeouts, queue));
        links.insert(peer.clone(), link.clone());
        Ok(link)
    }

    /// Owns the connection to one peer. Connects on the first queued line
    /// and stops at the first failure; lines still queued then fail too.
    async fn write_loop(peer: PeerAddress, timeouts: LinkTimeouts, mut queue: mpsc::Receiver<Outbound>) {
        let Some(mut outbound) = queue.recv().await else {
            return;
        };

        let stream = match Self::connect(&peer, timeouts.connect).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!("{}", e);
                let _ = outbound.written.send(Err(e));
                return;
            }
        };
        let mut sink = FramedWrite::new(stream, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));

        loop {
            let result = match timeout(timeouts.write, sink.send(outbound.line)).await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(DccError::Transport(format!("Failed to write to {}: {}", peer, e))),
                Err(_) => Err(DccError::Transport(format!(
                    "Peer {} stopped reading ({:?} without progress)",
                    peer, timeouts.write
                ))),
            };

            let failed = result.is_err();
            if let Err(ref e) = result {
                error!("{}", e);
            }
            let _ = outbound.written.send(result);
            if failed {
                break;
            }

            match queue.recv().await {
                Some(next) => outbound = next,
                None => break,
            }
        }
        debug!("Write task ended for peer {}", peer);
    }

    async fn connect(peer: &PeerAddress, limit: Duration) -> Result<TcpStream> {
        info!("Connecting to peer {}", peer);
        match timeout(limit, TcpStream::connect((peer.host.as_str(), peer.port))).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) => Err(DccError::Transport(format!("Failed to connect to {}: {}", peer, e))),
            Err(_) => Err(DccError::Transport(format!(
                "Timed out connecting to {} after {:?}",
                peer, limit
            ))),
        }
    }

    /// Drops the outbound connection to `peer`, if any.
    pub fn disconnect(&self, peer: &PeerAddress) -> bool {
        self.links
            .lock()
            .map(|mut links| links.remove(peer).is_some())
            .unwrap_or(false)
    }
}

impl Drop for PeerNetwork {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}
