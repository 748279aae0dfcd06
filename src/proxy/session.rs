use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::proxy::stats::ForwarderStats;
use crate::proxy::transform::Transform;
use crate::proxy::upstream::{Upstream, UpstreamLink};
use crate::proxy::{BoxedStream, READ_BUF_SIZE};

/// How long a closing session keeps relaying target bytes after half-closing
/// the upstream connection.
pub const CLOSE_LINGER: Duration = Duration::from_secs(2);

/// Lifecycle of a session's upstream side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No live upstream link; the next chunk will establish one.
    Idle,
    /// An outbound connection is being opened.
    Establishing,
    /// A live upstream link is in place.
    Connected,
    /// The client went away or the session was shut down. Terminal.
    Closed,
}

/// The parts of a session its upstream link relay needs to reach back into.
pub(crate) struct SessionShared {
    downstream: Mutex<WriteHalf<BoxedStream>>,
    pub(crate) transform: Arc<dyn Transform>,
    pub(crate) closed: CancellationToken,
    pub(crate) stats: Arc<ForwarderStats>,
    state: watch::Sender<SessionState>,
}

impl SessionShared {
    pub(crate) async fn write_downstream(&self, chunk: &[u8]) -> std::io::Result<()> {
        let mut downstream = self.downstream.lock().await;
        downstream.write_all(chunk).await?;
        downstream.flush().await?;
        ForwarderStats::add(&self.stats.bytes_downstream, chunk.len());
        Ok(())
    }

    fn set_state(&self, next: SessionState) {
        self.state.send_if_modified(|state| {
            if *state == SessionState::Closed || *state == next {
                return false;
            }
            *state = next;
            true
        });
    }

    /// Called by the relay when the target side goes away.
    pub(crate) fn link_lost(&self) {
        self.state.send_if_modified(|state| {
            if *state != SessionState::Connected {
                return false;
            }
            *state = SessionState::Idle;
            true
        });
    }
}

/// Forwarding state for one accepted client connection.
///
/// Holds a single upstream slot behind an async mutex. Whoever finds the slot
/// empty (or holding a dead link) establishes the connection while holding
/// the lock, so chunks arriving meanwhile queue up in order and are written
/// over that one connection instead of racing to open their own.
pub struct Session {
    peer: SocketAddr,
    upstream: Arc<Upstream>,
    shared: Arc<SessionShared>,
    slot: Mutex<Option<UpstreamLink>>,
}

impl Session {
    pub fn new(
        peer: SocketAddr,
        downstream: WriteHalf<BoxedStream>,
        upstream: Arc<Upstream>,
        transform: Arc<dyn Transform>,
        closed: CancellationToken,
        stats: Arc<ForwarderStats>,
    ) -> Self {
        let (state, _) = watch::channel(SessionState::Idle);
        Self {
            peer,
            upstream,
            shared: Arc::new(SessionShared {
                downstream: Mutex::new(downstream),
                transform,
                closed,
                stats,
                state,
            }),
            slot: Mutex::new(None),
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn state(&self) -> SessionState {
        *self.shared.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.shared.state.subscribe()
    }

    /// Forward one chunk read from the client to the target.
    ///
    /// A chunk that cannot be delivered (establishment failed, write failed,
    /// session closed) is dropped and never retried.
    pub async fn forward(&self, chunk: Vec<u8>) -> Result<()> {
        let mut slot = self.slot.lock().await;
        if self.shared.closed.is_cancelled() {
            return Err(Error::SessionClosed);
        }

        let link = match slot.take() {
            Some(link) if link.is_alive() => slot.insert(link),
            stale => {
                if stale.is_some() {
                    debug!("upstream link lost, reconnecting");
                }
                drop(stale);
                let link = self.establish().await?;
                slot.insert(link)
            }
        };

        let chunk = self.shared.transform.transform_outbound(chunk);
        let written = tokio::select! {
            result = link.write(&chunk) => result,
            _ = self.shared.closed.cancelled() => return Err(Error::SessionClosed),
        };

        match written {
            Ok(()) => {
                ForwarderStats::add(&self.shared.stats.bytes_upstream, chunk.len());
                Ok(())
            }
            Err(e) => {
                *slot = None;
                self.shared.set_state(SessionState::Idle);
                Err(Error::Io(e))
            }
        }
    }

    async fn establish(&self) -> Result<UpstreamLink> {
        self.shared.set_state(SessionState::Establishing);

        let result = tokio::select! {
            result = UpstreamLink::establish(&self.upstream, Arc::clone(&self.shared)) => result,
            _ = self.shared.closed.cancelled() => Err(Error::SessionClosed),
        };

        self.shared.set_state(match result {
            Ok(_) => SessionState::Connected,
            Err(_) => SessionState::Idle,
        });
        result
    }

    /// Read from the client until it disconnects or the session is cancelled,
    /// then tear the session down.
    pub async fn run(&self, mut reader: ReadHalf<BoxedStream>) {
        let mut buf = vec![0u8; READ_BUF_SIZE];
        loop {
            let read = tokio::select! {
                read = reader.read(&mut buf) => read,
                _ = self.shared.closed.cancelled() => break,
            };

            let n = match read {
                Ok(0) => {
                    debug!("client closed connection");
                    break;
                }
                Ok(n) => n,
                Err(e) => {
                    debug!(error = %e, "client read failed");
                    break;
                }
            };

            debug!(bytes = n, data = %buf[..n].escape_ascii(), "client data received");
            match self.forward(buf[..n].to_vec()).await {
                Ok(()) => {}
                Err(Error::SessionClosed) => break,
                Err(e) => {
                    warn!(error = %e, bytes = n, upstream = %self.upstream.config().target(), "chunk dropped");
                }
            }
        }

        self.close().await;
    }

    /// Close the session: cancel any in-flight establishment, close the
    /// upstream link and shut down the client side.
    pub async fn close(&self) {
        self.shared.closed.cancel();
        self.shared.set_state(SessionState::Closed);

        let link = self.slot.lock().await.take();
        if let Some(link) = link {
            link.close(CLOSE_LINGER).await;
        }

        let _ = tokio::time::timeout(CLOSE_LINGER, async {
            let _ = self.shared.downstream.lock().await.shutdown().await;
        })
        .await;
        debug!("session closed");
    }
}

/// Run a session over an accepted (and, if configured, TLS-terminated)
/// client connection until it ends.
pub async fn serve(
    stream: BoxedStream,
    peer: SocketAddr,
    upstream: Arc<Upstream>,
    transform: Arc<dyn Transform>,
    closed: CancellationToken,
    stats: Arc<ForwarderStats>,
) {
    let (reader, writer) = tokio::io::split(stream);
    let session = Session::new(peer, writer, upstream, transform, closed, stats);
    session.run(reader).await;
}
