//! Wires the pieces together: snapshot load, core task, RESP listener,
//! admin endpoint, and the replica link when configured as a follower.
//! The binary's `main` stays a thin adapter over [`start`].

use std::sync::Arc;

use metrics_exporter_prometheus::PrometheusHandle;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use ferrite_common::config::ServerConfig;
use ferrite_common::{FerriteError, Result};

use crate::admin::{self, AppState};
use crate::core::replication::generate_replid;
use crate::core::{Core, CoreSender};
use crate::keyspace::Keyspace;
use crate::rdb;
use crate::replica::ReplicaClient;
use crate::server::Listener;

/// A running server. Dropping this does not stop it; call [`Server::shutdown`].
pub struct Server {
    addr: std::net::SocketAddr,
    core: CoreSender,
    shutdown: watch::Sender<bool>,
    accept_task: JoinHandle<()>,
}

impl Server {
    /// Address the RESP listener is bound to.
    pub fn addr(&self) -> std::net::SocketAddr {
        self.addr
    }

    pub fn core(&self) -> CoreSender {
        self.core.clone()
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Wait for the accept loop to finish.
    pub async fn wait(self) {
        let _ = self.accept_task.await;
    }
}

/// Boot a server from its configuration. A leader bootstraps the keyspace
/// from the configured RDB file; a follower starts empty and fills from
/// the leader's snapshot.
pub async fn start(config: ServerConfig, metrics_handle: Option<PrometheusHandle>) -> Result<Server> {
    let mut keyspace = Keyspace::new();
    if config.is_leader() {
        rdb::load_file(&config.rdb_path(), &mut keyspace)
            .map_err(|e| FerriteError::Rdb(e.to_string()))?;
    }

    let (core, core_tx) = Core::new(config.clone(), keyspace, generate_replid());
    tokio::spawn(core.run());

    let bind = format!("{}:{}", config.network.bind_addr, config.network.port);
    let listener = Listener::bind(&bind).await?;
    let addr = listener.local_addr()?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let accept_task = tokio::spawn(listener.run(core_tx.clone(), shutdown_rx));

    if config.network.admin_port > 0 {
        if let Some(handle) = metrics_handle {
            let state = Arc::new(AppState {
                core: core_tx.clone(),
                metrics_handle: handle,
            });
            let admin_addr = format!("{}:{}", config.network.bind_addr, config.network.admin_port);
            tokio::spawn(async move {
                if let Err(e) = admin::serve(admin_addr, state).await {
                    tracing::error!(error = %e, "Admin endpoint failed");
                }
            });
        } else {
            tracing::warn!("Admin port configured but no metrics recorder installed");
        }
    }

    if let Some(master) = config.replication.replicaof.clone() {
        let client = ReplicaClient::new(master, addr.port());
        let link_core = core_tx.clone();
        tokio::spawn(async move {
            if let Err(e) = client.run(link_core).await {
                tracing::error!(error = %e, "Replica link failed");
            }
        });
    }

    tracing::info!(
        addr = %addr,
        role = if config.is_leader() { "leader" } else { "follower" },
        "Server started"
    );

    Ok(Server {
        addr,
        core: core_tx,
        shutdown: shutdown_tx,
        accept_task,
    })
}
