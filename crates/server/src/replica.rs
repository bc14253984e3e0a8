//! Follower side of replication: connect to the leader, run the
//! PING → REPLCONF → PSYNC handshake, hand the snapshot to the core, then
//! feed the propagated write stream in with replies suppressed.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use ferrite_common::config::ReplicaOf;
use ferrite_common::{FerriteError, Result};

use crate::core::{CoreMessage, CoreSender};
use crate::protocol::parser::RequestParser;
use crate::protocol::resp;

/// Handshake progress, for logging and error context.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum HandshakeStage {
    Ping,
    ReplconfPort,
    ReplconfCapa,
    Psync,
    Streaming,
}

pub struct ReplicaClient {
    master: ReplicaOf,
    /// Our own RESP port, reported via `REPLCONF listening-port`.
    listening_port: u16,
    stage: HandshakeStage,
    parser: RequestParser,
}

impl ReplicaClient {
    pub fn new(master: ReplicaOf, listening_port: u16) -> Self {
        Self {
            master,
            listening_port,
            stage: HandshakeStage::Ping,
            parser: RequestParser::new(),
        }
    }

    pub async fn run(mut self, core: CoreSender) -> Result<()> {
        let addr = format!("{}:{}", self.master.host, self.master.port);
        tracing::info!(leader = %addr, "Connecting to leader");
        let stream = TcpStream::connect(&addr)
            .await
            .map_err(|e| FerriteError::Replication(format!("connect {}: {}", addr, e)))?;
        let (mut reader, mut writer) = stream.into_split();

        writer.write_all(&resp::command(&[b"PING"])).await?;
        let pong = self.read_simple_line(&mut reader).await?;
        if !pong.eq_ignore_ascii_case("PONG") {
            return Err(FerriteError::Replication(format!(
                "unexpected PING reply: {}",
                pong
            )));
        }
        self.advance(HandshakeStage::ReplconfPort);

        let port_text = self.listening_port.to_string();
        writer
            .write_all(&resp::command(&[
                b"REPLCONF",
                b"listening-port",
                port_text.as_bytes(),
            ]))
            .await?;
        self.expect_ok(&mut reader).await?;
        self.advance(HandshakeStage::ReplconfCapa);

        writer
            .write_all(&resp::command(&[b"REPLCONF", b"capa", b"psync2"]))
            .await?;
        self.expect_ok(&mut reader).await?;
        self.advance(HandshakeStage::Psync);

        writer
            .write_all(&resp::command(&[b"PSYNC", b"?", b"-1"]))
            .await?;
        let fullresync = self.read_simple_line(&mut reader).await?;
        let replid = parse_fullresync(&fullresync)?;
        let snapshot = self.read_rdb(&mut reader).await?;
        self.advance(HandshakeStage::Streaming);
        tracing::info!(
            replid = %replid,
            snapshot_bytes = snapshot.len(),
            "Handshake complete, streaming"
        );
        metrics::counter!("replication.handshakes").increment(1);

        // Writer half drains the core's GETACK replies.
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        tokio::spawn(async move {
            while let Some(bytes) = out_rx.recv().await {
                if writer.write_all(&bytes).await.is_err() {
                    break;
                }
            }
        });
        core.send(CoreMessage::MasterLink {
            out: out_tx,
            replid,
            snapshot,
        })
        .map_err(|_| FerriteError::Replication("core task gone".into()))?;

        // Streaming: frame propagated requests and feed the core. The
        // parser may already hold bytes that arrived glued to the snapshot.
        let mut buf = [0u8; 4096];
        loop {
            loop {
                match self.parser.next_request() {
                    Ok(Some(request)) => {
                        if core.send(CoreMessage::MasterRequest { request }).is_err() {
                            return Ok(());
                        }
                    }
                    Ok(None) => break,
                    Err(e) => return Err(FerriteError::Protocol(e.to_string())),
                }
            }
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                return Err(FerriteError::Replication("leader closed the link".into()));
            }
            self.parser.feed(&buf[..n]);
        }
    }

    fn advance(&mut self, next: HandshakeStage) {
        tracing::debug!(from = ?self.stage, to = ?next, "Handshake stage");
        self.stage = next;
    }

    async fn read_simple_line(&mut self, reader: &mut OwnedReadHalf) -> Result<String> {
        loop {
            if let Some(line) = self
                .parser
                .next_simple_line()
                .map_err(|e| FerriteError::Protocol(e.to_string()))?
            {
                return Ok(line);
            }
            let mut buf = [0u8; 1024];
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                return Err(FerriteError::Replication(format!(
                    "leader closed during handshake at {:?}",
                    self.stage
                )));
            }
            self.parser.feed(&buf[..n]);
        }
    }

    async fn expect_ok(&mut self, reader: &mut OwnedReadHalf) -> Result<()> {
        let line = self.read_simple_line(reader).await?;
        if line.eq_ignore_ascii_case("OK") {
            Ok(())
        } else {
            Err(FerriteError::Replication(format!(
                "expected +OK at {:?}, got {}",
                self.stage, line
            )))
        }
    }

    async fn read_rdb(&mut self, reader: &mut OwnedReadHalf) -> Result<Vec<u8>> {
        loop {
            if let Some(payload) = self
                .parser
                .next_rdb_payload()
                .map_err(|e| FerriteError::Protocol(e.to_string()))?
            {
                return Ok(payload);
            }
            let mut buf = [0u8; 4096];
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                return Err(FerriteError::Replication(
                    "leader closed during snapshot transfer".into(),
                ));
            }
            self.parser.feed(&buf[..n]);
        }
    }
}

fn parse_fullresync(line: &str) -> Result<String> {
    let mut parts = line.split_whitespace();
    match (parts.next(), parts.next()) {
        (Some("FULLRESYNC"), Some(replid)) => Ok(replid.to_string()),
        _ => Err(FerriteError::Replication(format!(
            "unexpected PSYNC reply: {}",
            line
        ))),
    }
}
