use std::sync::Arc;

use clap::Parser;
use tracing::level_filters::LevelFilter;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use traffic_forwarder::config::{log_level, Args, Config, LogFormat};
use traffic_forwarder::{Listener, Passthrough};

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_logging(log_level(args.verbose, args.quiet), args.log_format, args.verbose > 0);

    let config = match Config::from_args(&args) {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            std::process::exit(1);
        }
    };

    info!(
        listen = %format!("{}:{}", config.listener.host, config.listener.port),
        ssl = config.listener.tls.is_some(),
        target = %config.upstream.target(),
        target_ssl = config.upstream.tls.is_some(),
        "traffic-forwarder starting"
    );

    if let Err(e) = run(config).await {
        error!(error = %e, "traffic-forwarder exited with error");
        std::process::exit(1);
    }
}

async fn run(config: Config) -> traffic_forwarder::Result<()> {
    let listener = Listener::bind(config.listener, config.upstream, Arc::new(Passthrough)).await?;

    listener.run_until(shutdown_signal()).await?;
    info!("traffic-forwarder stopped");

    Ok(())
}

async fn shutdown_signal() -> std::io::Result<()> {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            result = ctrl_c => result?,
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    ctrl_c.await?;

    Ok(())
}

fn init_logging(level: LevelFilter, format: LogFormat, with_location: bool) {
    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_file(with_location)
        .with_line_number(with_location);

    match format {
        LogFormat::Json => subscriber.json().init(),
        LogFormat::Pretty => subscriber.init(),
    }
}
