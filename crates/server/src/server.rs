//! TCP front end: the accept loop plus per-connection reader/writer tasks.
//! Connections only frame bytes; every decision happens in the core task.

use std::sync::atomic::{AtomicU64, Ordering};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};

use ferrite_common::{FerriteError, Result};

use crate::core::{ConnectionId, CoreMessage, CoreSender};
use crate::protocol::parser::RequestParser;

/// Connection IDs start at 1; 0 is reserved for the master channel.
static NEXT_CONN: AtomicU64 = AtomicU64::new(1);

pub struct Listener {
    listener: TcpListener,
}

impl Listener {
    pub async fn bind(addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| FerriteError::Bind(format!("{}: {}", addr, e)))?;
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> Result<std::net::SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until the shutdown flag flips.
    pub async fn run(self, core: CoreSender, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let conn = NEXT_CONN.fetch_add(1, Ordering::Relaxed);
                            tracing::debug!(conn, peer = %peer, "Connection accepted");
                            tokio::spawn(serve_connection(conn, stream, core.clone()));
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "Accept failed");
                        }
                    }
                }
                changed = shutdown.changed() => {
                    // A dropped sender counts as shutdown too.
                    if changed.is_err() || *shutdown.borrow() {
                        tracing::info!("Listener shutting down");
                        return;
                    }
                }
            }
        }
    }
}

async fn serve_connection(conn: ConnectionId, stream: TcpStream, core: CoreSender) {
    let (mut reader, mut writer) = stream.into_split();

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    if core
        .send(CoreMessage::Connected { conn, out: out_tx })
        .is_err()
    {
        return;
    }

    let write_task = tokio::spawn(async move {
        while let Some(bytes) = out_rx.recv().await {
            if writer.write_all(&bytes).await.is_err() {
                break;
            }
        }
    });

    let mut parser = RequestParser::new();
    let mut buf = [0u8; 4096];
    'read: loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                tracing::debug!(conn, error = %e, "Read failed");
                break;
            }
        };
        parser.feed(&buf[..n]);
        loop {
            match parser.next_request() {
                Ok(Some(request)) => {
                    if core.send(CoreMessage::Request { conn, request }).is_err() {
                        break 'read;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    // Malformed framing closes the connection with no reply.
                    tracing::warn!(conn, error = %e, "Protocol framing error, closing connection");
                    metrics::counter!("connections.protocol_errors").increment(1);
                    break 'read;
                }
            }
        }
    }

    // Telling the core drops every clone of the outbound sender, which lets
    // the writer drain queued replies and exit.
    let _ = core.send(CoreMessage::Disconnected { conn });
    let _ = write_task.await;
    tracing::debug!(conn, "Connection task finished");
}
