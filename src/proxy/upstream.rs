use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::ServerName;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;
use tracing::{debug, Instrument};

use crate::config::UpstreamConfig;
use crate::error::{Error, Result};
use crate::proxy::session::SessionShared;
use crate::proxy::stats::ForwarderStats;
use crate::proxy::{BoxedStream, READ_BUF_SIZE};

/// Dials the fixed target, plain or over TLS.
pub struct Upstream {
    config: UpstreamConfig,
    tls: Option<(TlsConnector, ServerName<'static>)>,
}

impl Upstream {
    pub fn new(config: UpstreamConfig) -> Self {
        let tls = config
            .tls
            .as_ref()
            .map(|tls| (TlsConnector::from(Arc::clone(&tls.config)), tls.server_name.clone()));
        Self { config, tls }
    }

    pub fn config(&self) -> &UpstreamConfig {
        &self.config
    }

    /// Open one outbound connection. TCP connect and the TLS handshake share
    /// a single `connect_timeout` budget.
    pub async fn connect(&self) -> Result<BoxedStream> {
        tokio::time::timeout(self.config.connect_timeout, self.dial())
            .await
            .map_err(|_| Error::Timeout {
                what: "upstream connect",
                after: self.config.connect_timeout,
            })?
    }

    async fn dial(&self) -> Result<BoxedStream> {
        let tcp = TcpStream::connect((self.config.host.as_str(), self.config.port))
            .await
            .map_err(|source| Error::Connect {
                target: self.config.target(),
                source,
            })?;
        let _ = tcp.set_nodelay(true);

        let Some((connector, name)) = &self.tls else {
            return Ok(Box::new(tcp));
        };
        let tls = connector.connect(name.clone(), tcp).await.map_err(|e| {
            Error::Tls(format!("handshake with {} failed: {e}", self.config.target()))
        })?;
        Ok(Box::new(tls))
    }
}

/// One live outbound connection owned by a session.
///
/// The write half stays here; the read half is driven by a relay task that
/// pushes target bytes back to the session's client. The link is alive until
/// that task observes EOF or an error.
pub struct UpstreamLink {
    writer: WriteHalf<BoxedStream>,
    alive: CancellationToken,
    relay: JoinHandle<()>,
}

impl UpstreamLink {
    pub(crate) async fn establish(upstream: &Upstream, session: Arc<SessionShared>) -> Result<Self> {
        let stream = match upstream.connect().await {
            Ok(stream) => stream,
            Err(e) => {
                ForwarderStats::incr(&session.stats.upstream_failures);
                return Err(e);
            }
        };
        ForwarderStats::incr(&session.stats.upstream_connects);
        debug!(upstream = %upstream.config().target(), "upstream connected");

        let (reader, writer) = tokio::io::split(stream);
        let alive = CancellationToken::new();
        let relay = tokio::spawn(
            relay_inbound(reader, session, alive.clone()).instrument(tracing::Span::current()),
        );

        Ok(Self {
            writer,
            alive,
            relay,
        })
    }

    pub fn is_alive(&self) -> bool {
        !self.alive.is_cancelled()
    }

    pub(crate) async fn write(&mut self, chunk: &[u8]) -> std::io::Result<()> {
        self.writer.write_all(chunk).await?;
        self.writer.flush().await
    }

    /// Half-close toward the target, then give the relay up to `linger` to
    /// deliver whatever the target still sends before tearing it down.
    pub(crate) async fn close(mut self, linger: Duration) {
        let drained = tokio::time::timeout(linger, async {
            let _ = self.writer.shutdown().await;
            let _ = (&mut self.relay).await;
        })
        .await;

        if drained.is_err() {
            debug!("upstream relay still busy after linger, aborting");
        }
    }
}

impl Drop for UpstreamLink {
    fn drop(&mut self) {
        self.relay.abort();
    }
}

async fn relay_inbound(
    mut reader: ReadHalf<BoxedStream>,
    session: Arc<SessionShared>,
    alive: CancellationToken,
) {
    let mut buf = vec![0u8; READ_BUF_SIZE];
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => {
                debug!("upstream closed connection");
                break;
            }
            Ok(n) => n,
            Err(e) => {
                debug!(error = %e, "upstream read failed");
                break;
            }
        };

        debug!(bytes = n, data = %buf[..n].escape_ascii(), "upstream data received");
        let chunk = session.transform.transform_inbound(buf[..n].to_vec());

        if let Err(e) = session.write_downstream(&chunk).await {
            debug!(error = %e, "client write failed, closing session");
            session.closed.cancel();
            break;
        }
    }

    // State first: once `alive` flips, a new link may already be connecting.
    session.link_lost();
    alive.cancel();
}
