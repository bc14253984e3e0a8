//! The command-execution core: a single task owning the keyspace, the
//! replication state, and all parked waiters, fed by a channel. Connection
//! tasks only frame bytes and forward requests, which keeps everything a
//! client can observe linearizable without locks.

pub mod blocking;
pub mod commands;
pub mod replication;

use std::collections::HashMap;

use tokio::sync::{mpsc, oneshot};

use ferrite_common::config::ServerConfig;

use crate::keyspace::Keyspace;
use crate::protocol::parser::Request;

use blocking::BlockedReads;
use replication::{FollowerState, LeaderState, ReplicaLink, Role};

/// Integer handle of a client connection, assigned by the acceptor.
pub type ConnectionId = u64;

/// Reserved handle for the follower's master channel. Replies on it are
/// suppressed, so it never reaches the connection table.
pub(crate) const MASTER_CONN: ConnectionId = 0;

pub type CoreSender = mpsc::UnboundedSender<CoreMessage>;

/// Messages feeding the core task.
#[derive(Debug)]
pub enum CoreMessage {
    /// A connection opened; `out` is its outbound byte channel.
    Connected {
        conn: ConnectionId,
        out: mpsc::UnboundedSender<Vec<u8>>,
    },
    /// A connection closed. Drops its replica record and parked waiters.
    Disconnected { conn: ConnectionId },
    /// A framed request from a client connection.
    Request { conn: ConnectionId, request: Request },
    /// The follower's link to its leader is up: the outbound channel for
    /// ACK replies, the leader's replid, and the FULLRESYNC snapshot.
    MasterLink {
        out: mpsc::UnboundedSender<Vec<u8>>,
        replid: String,
        snapshot: Vec<u8>,
    },
    /// A framed request received from the leader on the master channel.
    MasterRequest { request: Request },
    /// A WAIT deadline elapsed.
    WaitTimeout { token: u64 },
    /// An XREAD BLOCK deadline elapsed.
    ReadTimeout { conn: ConnectionId, token: u64 },
    /// Admin endpoint snapshot request.
    AdminStatus {
        reply: oneshot::Sender<StatusSnapshot>,
    },
}

/// Point-in-time state for the admin endpoint.
#[derive(Debug, Clone, serde::Serialize)]
pub struct StatusSnapshot {
    pub role: &'static str,
    pub connected_clients: usize,
    /// Replicas past FULLRESYNC and receiving the write stream.
    pub connected_replicas: usize,
    pub keys: usize,
    pub repl_offset: u64,
}

struct ConnState {
    out: mpsc::UnboundedSender<Vec<u8>>,
    /// Set once the connection completes PSYNC and becomes replica traffic.
    is_replica: bool,
}

pub struct Core {
    pub(crate) config: ServerConfig,
    pub(crate) keyspace: Keyspace,
    conns: HashMap<ConnectionId, ConnState>,
    pub(crate) role: Role,
    pub(crate) blocked: BlockedReads,
    next_token: u64,
    pub(crate) tx: CoreSender,
    rx: mpsc::UnboundedReceiver<CoreMessage>,
}

impl Core {
    pub fn new(config: ServerConfig, keyspace: Keyspace, replid: String) -> (Self, CoreSender) {
        let (tx, rx) = mpsc::unbounded_channel();
        let role = if config.is_leader() {
            Role::Leader(LeaderState::new(replid))
        } else {
            Role::Follower(FollowerState::new())
        };
        let core = Self {
            config,
            keyspace,
            conns: HashMap::new(),
            role,
            blocked: BlockedReads::new(),
            next_token: 0,
            tx: tx.clone(),
            rx,
        };
        (core, tx)
    }

    pub async fn run(mut self) {
        while let Some(msg) = self.rx.recv().await {
            self.handle(msg);
        }
        tracing::debug!("Core channel closed, command loop exiting");
    }

    fn handle(&mut self, msg: CoreMessage) {
        match msg {
            CoreMessage::Connected { conn, out } => self.on_connected(conn, out),
            CoreMessage::Disconnected { conn } => self.on_disconnected(conn),
            CoreMessage::Request { conn, request } => self.dispatch(conn, &request, false),
            CoreMessage::MasterLink {
                out,
                replid,
                snapshot,
            } => self.on_master_link(out, replid, snapshot),
            CoreMessage::MasterRequest { request } => self.apply_from_master(&request),
            CoreMessage::WaitTimeout { token } => self.on_wait_timeout(token),
            CoreMessage::ReadTimeout { conn, token } => self.on_read_timeout(conn, token),
            CoreMessage::AdminStatus { reply } => {
                let _ = reply.send(self.status_snapshot());
            }
        }
    }

    fn on_connected(&mut self, conn: ConnectionId, out: mpsc::UnboundedSender<Vec<u8>>) {
        self.conns.insert(
            conn,
            ConnState {
                out,
                is_replica: false,
            },
        );
        metrics::counter!("connections.accepted").increment(1);
        metrics::gauge!("connections.open").set(self.conns.len() as f64);
        tracing::debug!(conn, "Connection registered");
    }

    fn on_disconnected(&mut self, conn: ConnectionId) {
        let Some(state) = self.conns.remove(&conn) else {
            return;
        };
        metrics::counter!("connections.closed").increment(1);
        metrics::gauge!("connections.open").set(self.conns.len() as f64);

        if state.is_replica {
            if let Role::Leader(leader) = &mut self.role {
                leader.detach_replica(conn);
                tracing::info!(conn, "Replica detached");
            }
        }
        // A parked waiter for a vanished client resolves into nothing.
        self.blocked.drop_conn(conn);
        if let Role::Leader(leader) = &mut self.role {
            if leader.pending_wait.as_ref().is_some_and(|w| w.conn == conn) {
                leader.pending_wait = None;
            }
        }
        tracing::debug!(conn, "Connection dropped");
    }

    fn on_master_link(
        &mut self,
        out: mpsc::UnboundedSender<Vec<u8>>,
        replid: String,
        snapshot: Vec<u8>,
    ) {
        if let Role::Follower(follower) = &mut self.role {
            follower.master_out = Some(out);
            follower.master_replid = replid;
        } else {
            tracing::warn!("Ignoring master link on a leader");
            return;
        }
        match crate::rdb::parse(&snapshot, &mut self.keyspace) {
            Ok(stats) => {
                tracing::info!(keys = stats.keys, "Snapshot ingested from leader")
            }
            Err(e) => tracing::warn!(error = %e, "Discarding malformed snapshot from leader"),
        }
    }

    fn status_snapshot(&self) -> StatusSnapshot {
        let (role, connected_replicas, repl_offset) = match &self.role {
            Role::Leader(leader) => {
                let streaming = leader
                    .replicas
                    .values()
                    .filter(|r| r.link == ReplicaLink::Streaming)
                    .count();
                ("master", streaming, leader.repl_offset)
            }
            Role::Follower(follower) => ("slave", 0, follower.master_offset),
        };
        StatusSnapshot {
            role,
            connected_clients: self.conns.len(),
            connected_replicas,
            keys: self.keyspace.len(),
            repl_offset,
        }
    }

    pub(crate) fn send_to(&self, conn: ConnectionId, bytes: Vec<u8>) {
        if let Some(state) = self.conns.get(&conn) {
            // A failed send means the writer already went away; the
            // Disconnected message will clean up.
            let _ = state.out.send(bytes);
        }
    }

    pub(crate) fn take_token(&mut self) -> u64 {
        self.next_token += 1;
        self.next_token
    }

    /// Flag `conn` as replica traffic and hand back its outbound channel.
    pub(crate) fn mark_replica(
        &mut self,
        conn: ConnectionId,
    ) -> Option<mpsc::UnboundedSender<Vec<u8>>> {
        let state = self.conns.get_mut(&conn)?;
        state.is_replica = true;
        Some(state.out.clone())
    }
}

/// Wall-clock milliseconds, the time base for expiry and stream auto-IDs.
pub(crate) fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

#[cfg(test)]
mod tests {
    use super::replication::GETACK_FRAME;
    use super::*;
    use crate::protocol::resp;
    use ferrite_common::config::ReplicaOf;

    fn req(parts: &[&str]) -> Request {
        let args: Vec<Vec<u8>> = parts.iter().map(|p| p.as_bytes().to_vec()).collect();
        let encoded: Vec<&[u8]> = parts.iter().map(|p| p.as_bytes()).collect();
        Request {
            args,
            raw: resp::command(&encoded),
        }
    }

    fn leader_core() -> Core {
        let (core, _) = Core::new(ServerConfig::default(), Keyspace::new(), "f".repeat(40));
        core
    }

    fn follower_core() -> Core {
        let mut config = ServerConfig::default();
        config.replication.replicaof = Some(ReplicaOf {
            host: "localhost".into(),
            port: 6379,
        });
        let (core, _) = Core::new(config, Keyspace::new(), String::new());
        core
    }

    fn connect(core: &mut Core, conn: ConnectionId) -> mpsc::UnboundedReceiver<Vec<u8>> {
        let (tx, rx) = mpsc::unbounded_channel();
        core.handle(CoreMessage::Connected { conn, out: tx });
        rx
    }

    fn recv(rx: &mut mpsc::UnboundedReceiver<Vec<u8>>) -> Vec<u8> {
        rx.try_recv().expect("expected a reply")
    }

    fn send(core: &mut Core, conn: ConnectionId, parts: &[&str]) {
        core.handle(CoreMessage::Request {
            conn,
            request: req(parts),
        });
    }

    #[test]
    fn test_ping_echo_set_get() {
        let mut core = leader_core();
        let mut rx = connect(&mut core, 1);

        send(&mut core, 1, &["PING"]);
        assert_eq!(recv(&mut rx), b"+PONG\r\n");

        send(&mut core, 1, &["ECHO", "hey"]);
        assert_eq!(recv(&mut rx), b"$3\r\nhey\r\n");

        send(&mut core, 1, &["SET", "foo", "bar"]);
        assert_eq!(recv(&mut rx), b"+OK\r\n");

        send(&mut core, 1, &["GET", "foo"]);
        assert_eq!(recv(&mut rx), b"$3\r\nbar\r\n");

        send(&mut core, 1, &["GET", "nope"]);
        assert_eq!(recv(&mut rx), b"$-1\r\n");

        send(&mut core, 1, &["TYPE", "foo"]);
        assert_eq!(recv(&mut rx), b"+string\r\n");
        send(&mut core, 1, &["TYPE", "nope"]);
        assert_eq!(recv(&mut rx), b"+none\r\n");
    }

    #[test]
    fn test_unknown_command() {
        let mut core = leader_core();
        let mut rx = connect(&mut core, 1);
        send(&mut core, 1, &["FLUSHALL"]);
        assert_eq!(recv(&mut rx), b"-ERR unknown command 'flushall'\r\n");
    }

    #[test]
    fn test_xadd_rejections_on_the_wire() {
        let mut core = leader_core();
        let mut rx = connect(&mut core, 1);

        send(&mut core, 1, &["XADD", "s", "5-*", "a", "1"]);
        assert_eq!(recv(&mut rx), b"$3\r\n5-0\r\n");
        send(&mut core, 1, &["XADD", "s", "5-*", "b", "2"]);
        assert_eq!(recv(&mut rx), b"$3\r\n5-1\r\n");

        send(&mut core, 1, &["XADD", "s", "4-*", "c", "3"]);
        assert_eq!(
            recv(&mut rx),
            b"-ERR The ID specified in XADD is equal or smaller than the target stream top item\r\n"
        );
        send(&mut core, 1, &["XADD", "s", "0-0", "d", "4"]);
        assert_eq!(
            recv(&mut rx),
            b"-ERR The ID specified in XADD must be greater than 0-0\r\n"
        );
    }

    #[test]
    fn test_xrange_literal_shape() {
        let mut core = leader_core();
        let mut rx = connect(&mut core, 1);
        send(&mut core, 1, &["XADD", "s", "5-*", "a", "1"]);
        recv(&mut rx);
        send(&mut core, 1, &["XADD", "s", "5-*", "b", "2"]);
        recv(&mut rx);

        send(&mut core, 1, &["XRANGE", "s", "-", "+"]);
        assert_eq!(
            recv(&mut rx),
            b"*2\r\n*2\r\n$3\r\n5-0\r\n*2\r\n$1\r\na\r\n$1\r\n1\r\n\
              *2\r\n$3\r\n5-1\r\n*2\r\n$1\r\nb\r\n$1\r\n2\r\n"
                .to_vec()
        );
    }

    #[test]
    fn test_wrongtype_enforcement() {
        let mut core = leader_core();
        let mut rx = connect(&mut core, 1);
        send(&mut core, 1, &["XADD", "st", "1-1", "a", "1"]);
        recv(&mut rx);
        send(&mut core, 1, &["SET", "str", "v"]);
        recv(&mut rx);

        send(&mut core, 1, &["GET", "st"]);
        assert!(recv(&mut rx).starts_with(b"-WRONGTYPE"));
        send(&mut core, 1, &["XADD", "str", "1-1", "a", "1"]);
        assert!(recv(&mut rx).starts_with(b"-WRONGTYPE"));
        send(&mut core, 1, &["XRANGE", "str", "-", "+"]);
        assert!(recv(&mut rx).starts_with(b"-WRONGTYPE"));
    }

    #[test]
    fn test_config_get_and_info() {
        let mut core = leader_core();
        let mut rx = connect(&mut core, 1);

        send(&mut core, 1, &["CONFIG", "GET", "dbfilename"]);
        assert_eq!(
            recv(&mut rx),
            b"*2\r\n$10\r\ndbfilename\r\n$8\r\ndump.rdb\r\n"
        );

        send(&mut core, 1, &["INFO", "replication"]);
        let info = recv(&mut rx);
        let text = String::from_utf8_lossy(&info);
        assert!(text.contains("role:master"));
        assert!(text.contains(&format!("master_replid:{}", "f".repeat(40))));
        assert!(text.contains("master_repl_offset:0"));
    }

    #[test]
    fn test_psync_attaches_replica_and_propagation() {
        let mut core = leader_core();
        let mut client = connect(&mut core, 1);
        let mut replica = connect(&mut core, 2);

        send(&mut core, 2, &["PSYNC", "?", "-1"]);
        let header = recv(&mut replica);
        assert!(header.starts_with(format!("+FULLRESYNC {} 0\r\n", "f".repeat(40)).as_bytes()));
        let payload = recv(&mut replica);
        assert!(payload.starts_with(b"$"));
        assert!(!payload.ends_with(b"\r\n"));

        // A write now fans out byte-exactly and advances the offset.
        let set = req(&["SET", "foo", "bar"]);
        let set_len = set.raw.len() as u64;
        core.handle(CoreMessage::Request {
            conn: 1,
            request: set.clone(),
        });
        assert_eq!(recv(&mut client), b"+OK\r\n");
        assert_eq!(recv(&mut replica), set.raw);

        match &core.role {
            Role::Leader(leader) => assert_eq!(leader.repl_offset, set_len),
            _ => panic!("expected leader role"),
        }
    }

    #[test]
    fn test_wait_immediate_paths() {
        let mut core = leader_core();
        let mut client = connect(&mut core, 1);

        // No replicas.
        send(&mut core, 1, &["WAIT", "1", "100"]);
        assert_eq!(recv(&mut client), b":0\r\n");

        // Replica attached but nothing propagated yet.
        let mut replica = connect(&mut core, 2);
        send(&mut core, 2, &["PSYNC", "?", "-1"]);
        recv(&mut replica);
        recv(&mut replica);
        send(&mut core, 1, &["WAIT", "1", "100"]);
        assert_eq!(recv(&mut client), b":1\r\n");
    }

    #[tokio::test]
    async fn test_wait_quorum_via_ack() {
        let mut core = leader_core();
        let mut client = connect(&mut core, 1);
        let mut replica = connect(&mut core, 2);
        send(&mut core, 2, &["PSYNC", "?", "-1"]);
        recv(&mut replica);
        recv(&mut replica);

        let set = req(&["SET", "foo", "bar"]);
        let set_len = set.raw.len() as u64;
        core.handle(CoreMessage::Request {
            conn: 1,
            request: set,
        });
        recv(&mut client);
        recv(&mut replica);

        let wait = req(&["WAIT", "1", "500"]);
        let wait_len = wait.raw.len() as u64;
        core.handle(CoreMessage::Request {
            conn: 1,
            request: wait,
        });
        // The GETACK broadcast goes out, the client is parked.
        assert_eq!(recv(&mut replica), GETACK_FRAME.to_vec());
        assert!(client.try_recv().is_err());

        // An acknowledgement at the baseline resolves the quorum.
        send(&mut core, 2, &["REPLCONF", "ACK", &set_len.to_string()]);
        assert_eq!(recv(&mut client), b":1\r\n");

        // The observed quirk: the WAIT frame's own length joins the offset.
        match &core.role {
            Role::Leader(leader) => assert_eq!(leader.repl_offset, set_len + wait_len),
            _ => panic!("expected leader role"),
        }
    }

    #[tokio::test]
    async fn test_wait_zero_required_still_broadcasts() {
        let mut core = leader_core();
        let mut client = connect(&mut core, 1);
        let mut replica = connect(&mut core, 2);
        send(&mut core, 2, &["PSYNC", "?", "-1"]);
        recv(&mut replica);
        recv(&mut replica);

        let set = req(&["SET", "a", "1"]);
        let set_len = set.raw.len() as u64;
        core.handle(CoreMessage::Request {
            conn: 1,
            request: set,
        });
        recv(&mut client);
        recv(&mut replica);

        // Even a zero quorum parks and does the replica round-trip.
        core.handle(CoreMessage::Request {
            conn: 1,
            request: req(&["WAIT", "0", "500"]),
        });
        assert_eq!(recv(&mut replica), GETACK_FRAME.to_vec());
        assert!(client.try_recv().is_err());

        send(&mut core, 2, &["REPLCONF", "ACK", &set_len.to_string()]);
        assert_eq!(recv(&mut client), b":1\r\n");
    }

    #[tokio::test]
    async fn test_wait_timeout_reports_partial_acks() {
        let mut core = leader_core();
        let mut client = connect(&mut core, 1);
        let mut replica = connect(&mut core, 2);
        send(&mut core, 2, &["PSYNC", "?", "-1"]);
        recv(&mut replica);
        recv(&mut replica);

        core.handle(CoreMessage::Request {
            conn: 1,
            request: req(&["SET", "a", "1"]),
        });
        recv(&mut client);
        recv(&mut replica);

        core.handle(CoreMessage::Request {
            conn: 1,
            request: req(&["WAIT", "2", "50"]),
        });
        recv(&mut replica); // GETACK

        // A stale ACK below the baseline does not count.
        send(&mut core, 2, &["REPLCONF", "ACK", "1"]);
        assert!(client.try_recv().is_err());

        let token = match &core.role {
            Role::Leader(leader) => leader.pending_wait.as_ref().expect("wait parked").token,
            _ => panic!("expected leader role"),
        };
        core.handle(CoreMessage::WaitTimeout { token });
        assert_eq!(recv(&mut client), b":0\r\n");

        // A late timeout for an already-resolved wait is a no-op.
        core.handle(CoreMessage::WaitTimeout { token });
        assert!(client.try_recv().is_err());
    }

    #[test]
    fn test_ack_without_pending_wait_is_tolerated() {
        let mut core = leader_core();
        let mut replica = connect(&mut core, 2);
        send(&mut core, 2, &["PSYNC", "?", "-1"]);
        recv(&mut replica);
        recv(&mut replica);

        send(&mut core, 2, &["REPLCONF", "ACK", "42"]);
        // No reply, no panic; the replica record simply advances.
        assert!(replica.try_recv().is_err());
        match &core.role {
            Role::Leader(leader) => {
                assert_eq!(leader.replicas[&2].acked_offset, 42)
            }
            _ => panic!("expected leader role"),
        }
    }

    #[test]
    fn test_blocked_xread_wakes_on_xadd() {
        let mut core = leader_core();
        let mut reader = connect(&mut core, 1);
        let mut writer = connect(&mut core, 2);

        send(&mut core, 1, &["XREAD", "BLOCK", "0", "STREAMS", "s", "$"]);
        assert!(reader.try_recv().is_err());

        send(&mut core, 2, &["XADD", "s", "1-1", "k", "v"]);
        recv(&mut writer);
        assert_eq!(
            recv(&mut reader),
            b"*1\r\n*2\r\n$1\r\ns\r\n*1\r\n*2\r\n$3\r\n1-1\r\n*2\r\n$1\r\nk\r\n$1\r\nv\r\n"
                .to_vec()
        );
    }

    #[test]
    fn test_blocked_xread_timeout_replies_null() {
        let mut core = leader_core();
        let mut reader = connect(&mut core, 1);

        send(&mut core, 1, &["XREAD", "BLOCK", "0", "STREAMS", "s", "$"]);
        let token = core.blocked.waiters[&1].token;

        core.handle(CoreMessage::ReadTimeout { conn: 1, token });
        assert_eq!(recv(&mut reader), b"$-1\r\n");

        // Stale timers for a resolved waiter do nothing.
        core.handle(CoreMessage::ReadTimeout { conn: 1, token });
        assert!(reader.try_recv().is_err());
    }

    #[test]
    fn test_xread_unbalanced_lists_rejected() {
        let mut core = leader_core();
        let mut rx = connect(&mut core, 1);
        send(&mut core, 1, &["XREAD", "STREAMS", "a", "b", "0-0"]);
        assert!(recv(&mut rx).starts_with(b"-ERR Unbalanced XREAD"));
    }

    #[test]
    fn test_follower_applies_silently_and_tracks_offset() {
        let mut core = follower_core();
        let (master_tx, mut master_rx) = mpsc::unbounded_channel();
        core.handle(CoreMessage::MasterLink {
            out: master_tx,
            replid: "a".repeat(40),
            snapshot: crate::rdb::empty_rdb(),
        });

        let set = req(&["SET", "foo", "123"]);
        let set_len = set.raw.len() as u64;
        core.handle(CoreMessage::MasterRequest { request: set });

        // Applied, no reply anywhere.
        assert!(master_rx.try_recv().is_err());
        assert_eq!(core.keyspace.get(b"foo", now_ms()), Some(b"123".to_vec()));

        // GETACK answers with the pre-frame offset, then counts the frame.
        let getack = req(&["REPLCONF", "GETACK", "*"]);
        let getack_len = getack.raw.len() as u64;
        core.handle(CoreMessage::MasterRequest { request: getack });
        let ack = recv(&mut master_rx);
        assert_eq!(
            ack,
            resp::command(&[b"REPLCONF", b"ACK", set_len.to_string().as_bytes()])
        );

        match &core.role {
            Role::Follower(follower) => {
                assert_eq!(follower.master_offset, set_len + getack_len)
            }
            _ => panic!("expected follower role"),
        }

        // A second GETACK now reports the inclusive count.
        core.handle(CoreMessage::MasterRequest {
            request: req(&["REPLCONF", "GETACK", "*"]),
        });
        let ack = recv(&mut master_rx);
        assert_eq!(
            ack,
            resp::command(&[
                b"REPLCONF",
                b"ACK",
                (set_len + getack_len).to_string().as_bytes()
            ])
        );
    }

    #[test]
    fn test_disconnect_cleans_up_replica_and_waiters() {
        let mut core = leader_core();
        let mut replica = connect(&mut core, 2);
        send(&mut core, 2, &["PSYNC", "?", "-1"]);
        recv(&mut replica);
        recv(&mut replica);

        connect(&mut core, 3);
        send(&mut core, 3, &["XREAD", "BLOCK", "0", "STREAMS", "s", "$"]);
        assert!(!core.blocked.is_empty());

        core.handle(CoreMessage::Disconnected { conn: 2 });
        core.handle(CoreMessage::Disconnected { conn: 3 });
        match &core.role {
            Role::Leader(leader) => assert!(leader.replicas.is_empty()),
            _ => panic!("expected leader role"),
        }
        assert!(core.blocked.is_empty());
    }
}
