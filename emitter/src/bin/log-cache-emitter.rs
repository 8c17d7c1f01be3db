use std::{path::PathBuf, time::Duration};

use clap::{Args, Parser, Subcommand};
use jemallocator::Jemalloc;
use log_cache_emitter::{
    config::{self, Config, Telemetry},
    ingress::{self, GrpcConnector},
    sender::CALL_TIMEOUT,
    server::{self, Server},
    signals,
};
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::{runtime::Builder, signal, task::JoinError};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, util::SubscriberInitExt};

#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

#[derive(thiserror::Error, Debug)]
enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("invalid configuration: {0}")]
    Config(#[from] config::Error),
    #[error("Unable to prepare Log Cache connection: {0}")]
    Ingress(#[from] ingress::Error),
    #[error("HTTP server returned an error: {0}")]
    Server(#[from] server::Error),
    #[error("Failed to install prometheus recorder: {0}")]
    Prometheus(#[from] metrics_exporter_prometheus::BuildError),
}

#[derive(Parser)]
#[clap(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the emit endpoints
    Run(RunCommand),
    /// Validate configuration and exit
    ConfigCheck(ConfigCheckCommand),
}

#[derive(Args)]
struct RunCommand {
    /// path on disk to the configuration file, environment variables are
    /// applied on top of it
    #[clap(long)]
    config_path: Option<PathBuf>,
    /// the maximum time to wait, in seconds, for in-flight emissions once
    /// shutdown begins
    #[clap(long, default_value_t = 30)]
    max_shutdown_delay: u16,
}

#[derive(Args)]
struct ConfigCheckCommand {
    /// path on disk to the configuration file
    #[clap(long)]
    config_path: Option<PathBuf>,
}

fn install_telemetry(telemetry: Option<Telemetry>) -> Result<(), Error> {
    if let Some(Telemetry::Prometheus {
        addr,
        global_labels,
    }) = telemetry
    {
        let mut builder = PrometheusBuilder::new().with_http_listener(addr);
        for (k, v) in global_labels {
            builder = builder.add_global_label(k, v);
        }
        builder.install()?;
        info!("Prometheus exporter listening on {addr}");
    }
    Ok(())
}

async fn inner_main(config: Config, max_shutdown_delay: Duration) -> Result<(), Error> {
    install_telemetry(config.telemetry.clone())?;

    let connector = GrpcConnector::new(&config, CALL_TIMEOUT)?;
    let (shutdown_watcher, shutdown_broadcast) = signals::signal();
    let server = Server::new(
        config.addr,
        config.concurrent_requests_max,
        connector,
        shutdown_watcher,
    );
    let mut server = tokio::spawn(server.run());

    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("received ctrl-c");
            shutdown_broadcast.signal();
        }
        res = &mut server => return joined(res),
    }

    // In-flight emissions run to completion, bounded by the shutdown delay.
    match tokio::time::timeout(max_shutdown_delay, server).await {
        Ok(res) => joined(res),
        Err(_) => {
            info!(
                "In-flight emissions still running after {} seconds, abandoning them.",
                max_shutdown_delay.as_secs()
            );
            Ok(())
        }
    }
}

fn joined(res: Result<Result<(), server::Error>, JoinError>) -> Result<(), Error> {
    match res {
        Ok(res) => Ok(res?),
        Err(err) => {
            error!("Could not join the HTTP server task: {err}");
            Ok(())
        }
    }
}

fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_ansi(false)
        .finish()
        .init();

    let cli = Cli::parse();
    let args = match cli.command {
        Commands::Run(run_cmd) => run_cmd,
        Commands::ConfigCheck(check_cmd) => {
            match Config::load(check_cmd.config_path.as_deref()) {
                Ok(config) => {
                    config.report();
                    info!("Configuration is valid");
                    std::process::exit(0)
                }
                Err(err) => {
                    error!("invalid configuration: {err}");
                    std::process::exit(1)
                }
            }
        }
    };

    let version = env!("CARGO_PKG_VERSION");
    info!("Starting LogCache Emitter {version}...");

    let config = Config::load(args.config_path.as_deref()).map_err(|err| {
        error!("invalid configuration: {err}");
        err
    })?;
    config.report();

    let max_shutdown_delay = Duration::from_secs(args.max_shutdown_delay.into());
    let runtime = Builder::new_multi_thread()
        .enable_io()
        .enable_time()
        .build()?;
    let res = runtime.block_on(inner_main(config, max_shutdown_delay));
    info!(
        "Shutting down runtime with a {} second delay. May leave orphaned tasks.",
        max_shutdown_delay.as_secs(),
    );
    runtime.shutdown_timeout(max_shutdown_delay);
    info!("Closing LogCache Emitter.");
    res
}
