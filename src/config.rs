use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{ArgAction, Parser, ValueEnum};
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, ServerConfig};
use tracing::level_filters::LevelFilter;

use crate::error::{Error, Result};
use crate::tls;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Command line surface of the forwarder.
#[derive(Parser, Debug, Clone)]
#[command(version, about = "Traffic forwarder", long_about = None)]
pub struct Args {
    /// Host to listen on
    #[arg(short = 'H', long, default_value = "127.0.0.1")]
    pub host: String,

    /// Port to listen on
    #[arg(short, long, default_value_t = 8800)]
    pub port: u16,

    /// Host to connect to
    #[arg(short = 'T', long, default_value = "127.0.0.1")]
    pub target: String,

    /// Port to connect to
    #[arg(short = 'x', long, default_value_t = 8080)]
    pub target_port: u16,

    /// Terminate TLS on the listener (requires --cert)
    #[arg(long)]
    pub ssl: bool,

    /// PEM certificate chain for the TLS listener; holds the key too unless --key is given
    #[arg(long)]
    pub cert: Option<PathBuf>,

    /// PEM private key for the TLS listener
    #[arg(long)]
    pub key: Option<PathBuf>,

    /// Connect to the target with TLS
    #[arg(long)]
    pub target_ssl: bool,

    /// Extra PEM CA bundle trusted when connecting to the target
    #[arg(long)]
    pub target_ca: Option<PathBuf>,

    /// Server name presented to the target [default: the target host]
    #[arg(long)]
    pub target_sni: Option<String>,

    /// Upstream connect and TLS handshake timeout in seconds
    #[arg(long, value_name = "SECS", default_value_t = DEFAULT_CONNECT_TIMEOUT.as_secs())]
    pub connect_timeout: u64,

    /// Inbound TLS handshake timeout in seconds
    #[arg(long, value_name = "SECS", default_value_t = DEFAULT_HANDSHAKE_TIMEOUT.as_secs())]
    pub handshake_timeout: u64,

    /// Time allowed for open sessions to finish on shutdown, in seconds
    #[arg(long, value_name = "SECS", default_value_t = DEFAULT_DRAIN_TIMEOUT.as_secs())]
    pub drain_timeout: u64,

    /// Verbose logging (repeat for more verbosity)
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,

    /// Only log errors
    #[arg(short, long, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Pretty)]
    pub log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Json,
    Pretty,
}

/// Listening side: where to bind and whether to terminate TLS.
#[derive(Clone)]
pub struct ListenerConfig {
    pub host: String,
    pub port: u16,
    pub tls: Option<Arc<ServerConfig>>,
    pub handshake_timeout: Duration,
    pub drain_timeout: Duration,
}

impl ListenerConfig {
    pub fn plain(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            tls: None,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        }
    }

    pub fn with_tls(mut self, tls: Arc<ServerConfig>) -> Self {
        self.tls = Some(tls);
        self
    }
}

impl fmt::Debug for ListenerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("tls", &self.tls.is_some())
            .field("handshake_timeout", &self.handshake_timeout)
            .field("drain_timeout", &self.drain_timeout)
            .finish()
    }
}

/// TLS settings used when originating connections to the target.
#[derive(Clone)]
pub struct UpstreamTls {
    pub config: Arc<ClientConfig>,
    pub server_name: ServerName<'static>,
}

/// Target side: the fixed upstream every session connects to.
#[derive(Clone)]
pub struct UpstreamConfig {
    pub host: String,
    pub port: u16,
    pub tls: Option<UpstreamTls>,
    pub connect_timeout: Duration,
}

impl UpstreamConfig {
    pub fn plain(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            tls: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn with_tls(mut self, config: Arc<ClientConfig>, server_name: ServerName<'static>) -> Self {
        self.tls = Some(UpstreamTls {
            config,
            server_name,
        });
        self
    }

    /// `host:port` as used for logging and connection errors.
    pub fn target(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Debug for UpstreamConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpstreamConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("tls", &self.tls.as_ref().map(|t| t.server_name.to_str()))
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}

/// Validated runtime configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub listener: ListenerConfig,
    pub upstream: UpstreamConfig,
}

impl Config {
    /// Validate arguments and build both TLS contexts. Nothing is bound here.
    pub fn from_args(args: &Args) -> Result<Self> {
        let mut listener = ListenerConfig::plain(args.host.clone(), args.port);
        listener.handshake_timeout = non_zero_secs("--handshake-timeout", args.handshake_timeout)?;
        listener.drain_timeout = Duration::from_secs(args.drain_timeout);

        if args.ssl {
            let cert = args
                .cert
                .as_deref()
                .ok_or_else(|| Error::Config("certificate missing: --ssl requires --cert".into()))?;
            let server = tls::load_server_config(cert, args.key.as_deref())?;
            listener = listener.with_tls(Arc::new(server));
        } else if args.cert.is_some() || args.key.is_some() {
            return Err(Error::Config("--cert and --key are only valid with --ssl".into()));
        }

        let mut upstream = UpstreamConfig::plain(args.target.clone(), args.target_port);
        upstream.connect_timeout = non_zero_secs("--connect-timeout", args.connect_timeout)?;

        if args.target_ssl {
            let client = tls::load_client_config(args.target_ca.as_deref())?;
            let name = tls::server_name(args.target_sni.as_deref().unwrap_or(&args.target))?;
            upstream = upstream.with_tls(Arc::new(client), name);
        } else if args.target_ca.is_some() || args.target_sni.is_some() {
            return Err(Error::Config(
                "--target-ca and --target-sni are only valid with --target-ssl".into(),
            ));
        }

        Ok(Config { listener, upstream })
    }
}

/// `-q` logs errors only, the default is info, and any `-v` enables debug.
pub fn log_level(verbose: u8, quiet: bool) -> LevelFilter {
    if quiet {
        return LevelFilter::ERROR;
    }
    match verbose {
        0 => LevelFilter::INFO,
        _ => LevelFilter::DEBUG,
    }
}

fn non_zero_secs(flag: &str, secs: u64) -> Result<Duration> {
    if secs == 0 {
        return Err(Error::Config(format!("{flag} must be at least 1 second")));
    }
    Ok(Duration::from_secs(secs))
}
