use std::path::PathBuf;

use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;

use ferrite_common::config::ReplicaOf;
use ferrite_server::{config_file, startup};

/// Redis-wire-compatible in-memory data server with single-leader replication.
#[derive(Parser, Debug)]
#[command(name = "ferrite-server", version, about)]
struct Cli {
    /// RESP listener port.
    #[arg(long)]
    port: Option<u16>,

    /// Run as a follower of the given leader.
    #[arg(long, num_args = 2, value_names = ["HOST", "PORT"])]
    replicaof: Option<Vec<String>>,

    /// Directory containing the RDB dump.
    #[arg(long)]
    dir: Option<String>,

    /// RDB dump file name.
    #[arg(long)]
    dbfilename: Option<String>,

    /// Optional TOML configuration file; flags override its values.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Admin HTTP port for /health and /metrics. 0 disables the endpoint.
    #[arg(long)]
    admin_port: Option<u16>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();

    let mut config = match cli.config.as_deref().map(config_file::load).transpose() {
        Ok(loaded) => loaded.unwrap_or_default(),
        Err(e) => {
            tracing::error!(error = %e, "Failed to load configuration, refusing to start");
            std::process::exit(1);
        }
    };

    if let Some(port) = cli.port {
        config.network.port = port;
    }
    if let Some(admin_port) = cli.admin_port {
        config.network.admin_port = admin_port;
    }
    if let Some(dir) = cli.dir {
        config.storage.dir = dir;
    }
    if let Some(dbfilename) = cli.dbfilename {
        config.storage.dbfilename = dbfilename;
    }
    if let Some(pair) = &cli.replicaof {
        let port = match pair[1].parse() {
            Ok(port) => port,
            Err(_) => {
                tracing::error!(value = %pair[1], "Invalid --replicaof port");
                std::process::exit(1);
            }
        };
        config.replication.replicaof = Some(ReplicaOf {
            host: pair[0].clone(),
            port,
        });
    }

    // Install the Prometheus metrics recorder.
    let metrics_handle = match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => Some(handle),
        Err(e) => {
            tracing::warn!(error = %e, "Metrics recorder unavailable");
            None
        }
    };

    let server = match startup::start(config, metrics_handle).await {
        Ok(server) => server,
        Err(e) => {
            tracing::error!(error = %e, "Startup failed, exiting");
            std::process::exit(1);
        }
    };

    server.wait().await;
}
