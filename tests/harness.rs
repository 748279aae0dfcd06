//! Test harness for forwarder integration tests.
//!
//! Provides plain and TLS targets that count their connections and record
//! what they receive, plus a handle that runs a forwarder on an ephemeral port.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tokio_util::sync::CancellationToken;

use traffic_forwarder::{tls, ForwarderStats, Listener, ListenerConfig, Transform, UpstreamConfig};

/// How the target treats each accepted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(dead_code)]
pub enum Mode {
    /// Echo everything back until the peer closes.
    Echo,
    /// Echo the first read, then close the connection.
    EchoOnce,
    /// Record only, never answer.
    Sink,
    /// Accept the TCP connection and never read or write.
    Silent,
}

/// A self-signed certificate for `localhost`.
#[allow(dead_code)]
pub struct TestCert {
    pub cert_pem: String,
    pub key_pem: String,
}

#[allow(dead_code)]
impl TestCert {
    pub fn localhost() -> Self {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])
            .expect("generate certificate");
        Self {
            cert_pem: cert.cert.pem(),
            key_pem: cert.key_pair.serialize_pem(),
        }
    }

    /// Certificate chain followed by the key, as accepted by `--cert`.
    pub fn combined_pem(&self) -> String {
        format!("{}{}", self.cert_pem, self.key_pem)
    }

    pub fn server_config(&self) -> rustls::ServerConfig {
        tls::build_server_config(self.cert_pem.as_bytes(), self.key_pem.as_bytes())
            .expect("server config")
    }

    /// Client context trusting this certificate as a root.
    pub fn client_config(&self) -> rustls::ClientConfig {
        tls::build_client_config(Some(self.cert_pem.as_bytes())).expect("client config")
    }
}

#[allow(dead_code)]
pub struct Target {
    pub addr: SocketAddr,
    connections: Arc<AtomicU64>,
    received: Arc<Mutex<Vec<Vec<u8>>>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

#[allow(dead_code)]
impl Target {
    pub async fn spawn(mode: Mode) -> io::Result<Self> {
        Self::spawn_inner(mode, None).await
    }

    pub async fn spawn_tls(mode: Mode, cert: &TestCert) -> io::Result<Self> {
        Self::spawn_tls_after(mode, cert, Duration::ZERO).await
    }

    /// A TLS target that waits `delay` after each TCP accept before it
    /// starts the handshake.
    pub async fn spawn_tls_after(mode: Mode, cert: &TestCert, delay: Duration) -> io::Result<Self> {
        let acceptor = TlsAcceptor::from(Arc::new(cert.server_config()));
        Self::spawn_inner(mode, Some((acceptor, delay))).await
    }

    async fn spawn_inner(
        mode: Mode,
        acceptor: Option<(TlsAcceptor, Duration)>,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let connections = Arc::new(AtomicU64::new(0));
        let received = Arc::new(Mutex::new(Vec::new()));
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

        let conn_clone = Arc::clone(&connections);
        let received_clone = Arc::clone(&received);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accept_result = listener.accept() => {
                        let Ok((stream, _)) = accept_result else { break };
                        conn_clone.fetch_add(1, Ordering::Relaxed);

                        let index = {
                            let mut received = received_clone.lock().unwrap();
                            received.push(Vec::new());
                            received.len() - 1
                        };
                        let received = Arc::clone(&received_clone);
                        let acceptor = acceptor.clone();

                        tokio::spawn(async move {
                            match acceptor {
                                Some((acceptor, delay)) if mode != Mode::Silent => {
                                    tokio::time::sleep(delay).await;
                                    if let Ok(tls_stream) = acceptor.accept(stream).await {
                                        serve_connection(tls_stream, mode, received, index).await;
                                    }
                                }
                                _ => serve_connection(stream, mode, received, index).await,
                            }
                        });
                    }
                    _ = &mut shutdown_rx => break,
                }
            }
        });

        Ok(Self {
            addr,
            connections,
            received,
            shutdown_tx: Some(shutdown_tx),
        })
    }

    pub fn connection_count(&self) -> u64 {
        self.connections.load(Ordering::Relaxed)
    }

    /// Bytes received on each accepted connection, in accept order.
    pub fn received(&self) -> Vec<Vec<u8>> {
        self.received.lock().unwrap().clone()
    }

    /// Wait until the target has received `len` bytes in total.
    pub async fn wait_for_bytes(&self, len: usize) -> Vec<Vec<u8>> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let received = self.received();
            let total: usize = received.iter().map(Vec::len).sum();
            if total >= len || tokio::time::Instant::now() >= deadline {
                return received;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

impl Drop for Target {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

async fn serve_connection<S>(
    mut stream: S,
    mode: Mode,
    received: Arc<Mutex<Vec<Vec<u8>>>>,
    index: usize,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if mode == Mode::Silent {
        // Hold the connection open without ever answering.
        let _ = stream.read(&mut [0u8; 1]).await;
        tokio::time::sleep(Duration::from_secs(60)).await;
        return;
    }

    let mut buf = vec![0u8; 8192];
    loop {
        let n = match stream.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        received.lock().unwrap()[index].extend_from_slice(&buf[..n]);

        if mode != Mode::Sink && stream.write_all(&buf[..n]).await.is_err() {
            break;
        }
        if mode == Mode::EchoOnce {
            let _ = stream.shutdown().await;
            break;
        }
    }
}

/// A forwarder running on an ephemeral local port.
#[allow(dead_code)]
pub struct ForwarderHandle {
    pub addr: SocketAddr,
    pub stats: Arc<ForwarderStats>,
    shutdown: CancellationToken,
    task: JoinHandle<traffic_forwarder::Result<()>>,
}

#[allow(dead_code)]
impl ForwarderHandle {
    pub async fn spawn(
        listener: ListenerConfig,
        upstream: UpstreamConfig,
        transform: Arc<dyn Transform>,
    ) -> Self {
        let listener = Listener::bind(listener, upstream, transform)
            .await
            .expect("bind forwarder");
        let addr = listener.local_addr().expect("local addr");
        let stats = listener.stats();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(listener.run(shutdown.clone()));
        Self {
            addr,
            stats,
            shutdown,
            task,
        }
    }

    pub async fn plain(target: &Target, transform: Arc<dyn Transform>) -> Self {
        Self::spawn(
            ListenerConfig::plain("127.0.0.1", 0),
            UpstreamConfig::plain("127.0.0.1", target.addr.port()),
            transform,
        )
        .await
    }

    pub async fn stop(self) -> traffic_forwarder::Result<()> {
        self.shutdown.cancel();
        self.task.await.expect("forwarder task panicked")
    }
}

/// Connect a TLS client that trusts `cert` and verifies `localhost`.
#[allow(dead_code)]
pub async fn tls_client_connect(
    addr: SocketAddr,
    cert: &TestCert,
) -> io::Result<tokio_rustls::client::TlsStream<TcpStream>> {
    let connector = TlsConnector::from(Arc::new(cert.client_config()));
    let stream = TcpStream::connect(addr).await?;
    let server_name = ServerName::try_from("localhost".to_string())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    connector.connect(server_name, stream).await
}

/// Read exactly `len` bytes or fail after a short timeout.
#[allow(dead_code)]
pub async fn read_n<S: AsyncRead + Unpin>(stream: &mut S, len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    tokio::time::timeout(Duration::from_secs(5), stream.read_exact(&mut buf))
        .await
        .expect("timed out waiting for forwarded bytes")
        .expect("read forwarded bytes");
    buf
}
