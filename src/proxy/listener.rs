use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn, Instrument};

use crate::config::{ListenerConfig, UpstreamConfig};
use crate::error::Result;
use crate::proxy::session;
use crate::proxy::stats::ForwarderStats;
use crate::proxy::transform::Transform;
use crate::proxy::upstream::Upstream;
use crate::proxy::BoxedStream;

/// Accepts client connections and runs one forwarding session per connection.
pub struct Listener {
    listener: TcpListener,
    config: ListenerConfig,
    acceptor: Option<TlsAcceptor>,
    upstream: Arc<Upstream>,
    transform: Arc<dyn Transform>,
    stats: Arc<ForwarderStats>,
}

impl Listener {
    pub async fn bind(
        config: ListenerConfig,
        upstream: UpstreamConfig,
        transform: Arc<dyn Transform>,
    ) -> Result<Self> {
        let listener = TcpListener::bind((config.host.as_str(), config.port)).await?;
        let local_addr = listener.local_addr()?;
        info!(
            addr = %local_addr,
            tls = config.tls.is_some(),
            upstream = %upstream.target(),
            upstream_tls = upstream.tls.is_some(),
            "forwarder listening"
        );

        Ok(Self {
            listener,
            acceptor: config.tls.clone().map(TlsAcceptor::from),
            config,
            upstream: Arc::new(Upstream::new(upstream)),
            transform,
            stats: Arc::new(ForwarderStats::default()),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn stats(&self) -> Arc<ForwarderStats> {
        Arc::clone(&self.stats)
    }

    /// Accept connections until `shutdown` fires, then stop accepting and
    /// wait up to the drain timeout for open sessions before closing them.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let Listener {
            listener,
            config,
            acceptor,
            upstream,
            transform,
            stats,
        } = self;

        let tracker = TaskTracker::new();
        let sessions = CancellationToken::new();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    let (tcp_stream, peer_addr) = match result {
                        Ok(conn) => conn,
                        Err(e) => {
                            error!(error = %e, "failed to accept TCP connection");
                            tokio::time::sleep(Duration::from_millis(100)).await;
                            continue;
                        }
                    };

                    debug!(peer = %peer_addr, "accepted TCP connection");
                    let _ = tcp_stream.set_nodelay(true);

                    let accept = Accept {
                        acceptor: acceptor.clone(),
                        handshake_timeout: config.handshake_timeout,
                        upstream: Arc::clone(&upstream),
                        transform: Arc::clone(&transform),
                        closed: sessions.child_token(),
                        stats: Arc::clone(&stats),
                    };
                    tracker.spawn(
                        accept
                            .handle(tcp_stream, peer_addr)
                            .instrument(tracing::info_span!("session", peer = %peer_addr)),
                    );
                }
                _ = shutdown.cancelled() => {
                    info!("forwarder shutting down");
                    break;
                }
            }
        }

        drop(listener);
        tracker.close();

        if !tracker.is_empty() {
            info!(sessions = tracker.len(), "waiting for open sessions to finish");
        }
        if tokio::time::timeout(config.drain_timeout, tracker.wait())
            .await
            .is_err()
        {
            warn!(
                sessions = tracker.len(),
                "drain timeout elapsed, closing remaining sessions"
            );
            sessions.cancel();
            tracker.wait().await;
        }

        stats.log_summary();
        Ok(())
    }

    /// Run until `signal` resolves, then drain as [`Listener::run`] does.
    ///
    /// A signal source that fails also stops the listener; its error is
    /// returned once the open sessions are gone.
    pub async fn run_until<F>(self, signal: F) -> Result<()>
    where
        F: Future<Output = io::Result<()>>,
    {
        let shutdown = CancellationToken::new();
        let trigger = shutdown.clone();
        let watch_signal = async move {
            let result = signal.await;
            match &result {
                Ok(()) => info!("shutdown signal received, stopping..."),
                Err(e) => error!(error = %e, "failed to listen for shutdown signals, stopping"),
            }
            trigger.cancel();
            result
        };

        let (signal_result, run_result) = tokio::join!(watch_signal, self.run(shutdown));
        run_result?;
        Ok(signal_result?)
    }
}

/// Everything a freshly accepted connection needs to become a session.
struct Accept {
    acceptor: Option<TlsAcceptor>,
    handshake_timeout: Duration,
    upstream: Arc<Upstream>,
    transform: Arc<dyn Transform>,
    closed: CancellationToken,
    stats: Arc<ForwarderStats>,
}

impl Accept {
    async fn handle(self, tcp_stream: TcpStream, peer_addr: SocketAddr) {
        let stream: BoxedStream = match self.acceptor {
            Some(acceptor) => {
                let handshake =
                    tokio::time::timeout(self.handshake_timeout, acceptor.accept(tcp_stream));
                let result = tokio::select! {
                    result = handshake => result,
                    _ = self.closed.cancelled() => {
                        debug!("listener closing, TLS handshake abandoned");
                        return;
                    }
                };
                match result {
                    Ok(Ok(tls_stream)) => Box::new(tls_stream),
                    Ok(Err(e)) => {
                        ForwarderStats::incr(&self.stats.handshake_failures);
                        debug!(error = %e, "TLS handshake failed");
                        return;
                    }
                    Err(_) => {
                        ForwarderStats::incr(&self.stats.handshake_failures);
                        debug!(timeout = ?self.handshake_timeout, "TLS handshake timed out");
                        return;
                    }
                }
            }
            None => Box::new(tcp_stream),
        };

        ForwarderStats::incr(&self.stats.sessions_accepted);
        ForwarderStats::incr(&self.stats.sessions_active);

        session::serve(
            stream,
            peer_addr,
            self.upstream,
            self.transform,
            self.closed,
            Arc::clone(&self.stats),
        )
        .await;

        ForwarderStats::decr(&self.stats.sessions_active);
    }
}
