//! Replication bookkeeping for both roles. The leader tracks attached
//! replicas, the propagated-byte offset, and at most one pending WAIT;
//! the follower tracks the leader link and its consumed-byte offset.

use std::collections::HashMap;

use rand::Rng;
use tokio::sync::mpsc;

use crate::protocol::parser::Request;
use crate::protocol::resp;

use super::{commands, ConnectionId, Core, CoreMessage, MASTER_CONN};

/// The literal `REPLCONF GETACK *` frame a leader broadcasts when a WAIT
/// needs fresh acknowledgements.
pub const GETACK_FRAME: &[u8] = b"*3\r\n$8\r\nREPLCONF\r\n$6\r\nGETACK\r\n$1\r\n*\r\n";

/// 40 hex characters identifying this leader's replication history.
pub fn generate_replid() -> String {
    const HEX: &[u8] = b"0123456789abcdef";
    let mut rng = rand::thread_rng();
    (0..40).map(|_| HEX[rng.gen_range(0..16)] as char).collect()
}

pub(crate) enum Role {
    Leader(LeaderState),
    Follower(FollowerState),
}

pub(crate) struct LeaderState {
    pub replid: String,
    /// Total bytes of propagated request stream.
    pub repl_offset: u64,
    /// Attached replicas keyed by connection ID (handle-based indirection,
    /// no back-pointers into connection state).
    pub replicas: HashMap<ConnectionId, ReplicaRecord>,
    pub pending_wait: Option<PendingWait>,
}

pub(crate) struct ReplicaRecord {
    /// Outbound byte channel of the replica's connection.
    pub out: mpsc::UnboundedSender<Vec<u8>>,
    /// Offset from the replica's most recent REPLCONF ACK.
    pub acked_offset: u64,
    pub link: ReplicaLink,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ReplicaLink {
    /// FULLRESYNC sent, snapshot transfer queued.
    Syncing,
    /// Receiving the propagated write stream.
    Streaming,
}

/// A parked WAIT command.
pub(crate) struct PendingWait {
    /// Distinguishes this wait from stale timer messages.
    pub token: u64,
    pub conn: ConnectionId,
    pub required: usize,
    /// The leader offset when the WAIT was issued; acknowledgements at or
    /// past it count toward the quorum.
    pub baseline: u64,
    pub acks: usize,
    /// Byte length of the WAIT request frame itself, added to the offset on
    /// resolution when `wait_adds_own_length` is configured.
    pub request_len: usize,
}

impl LeaderState {
    pub fn new(replid: String) -> Self {
        Self {
            replid,
            repl_offset: 0,
            replicas: HashMap::new(),
            pending_wait: None,
        }
    }

    /// Forward a write's raw request bytes to every replica and advance the
    /// offset by their length. The bytes are the ones received from the
    /// client, never a re-encoding.
    pub fn propagate(&mut self, raw: &[u8]) {
        for record in self.replicas.values() {
            let _ = record.out.send(raw.to_vec());
        }
        self.repl_offset += raw.len() as u64;
        metrics::counter!("replication.propagated_bytes").increment(raw.len() as u64);
    }

    /// Send a control frame to every replica without touching the offset.
    pub fn broadcast(&self, frame: &[u8]) {
        for record in self.replicas.values() {
            let _ = record.out.send(frame.to_vec());
        }
    }

    pub fn attach_replica(&mut self, conn: ConnectionId, out: mpsc::UnboundedSender<Vec<u8>>) {
        self.replicas.insert(
            conn,
            ReplicaRecord {
                out,
                acked_offset: 0,
                link: ReplicaLink::Syncing,
            },
        );
        metrics::gauge!("replication.replicas").set(self.replicas.len() as f64);
    }

    pub fn mark_streaming(&mut self, conn: ConnectionId) {
        if let Some(record) = self.replicas.get_mut(&conn) {
            record.link = ReplicaLink::Streaming;
        }
    }

    pub fn detach_replica(&mut self, conn: ConnectionId) {
        if self.replicas.remove(&conn).is_some() {
            metrics::gauge!("replication.replicas").set(self.replicas.len() as f64);
        }
    }
}

pub(crate) struct FollowerState {
    /// Learned from the leader's FULLRESYNC reply.
    pub master_replid: String,
    /// Bytes of the propagated stream consumed and applied.
    pub master_offset: u64,
    /// Outbound channel of the leader link, for REPLCONF ACK replies.
    pub master_out: Option<mpsc::UnboundedSender<Vec<u8>>>,
}

impl FollowerState {
    pub fn new() -> Self {
        Self {
            master_replid: "?".repeat(40),
            master_offset: 0,
            master_out: None,
        }
    }
}

impl Default for FollowerState {
    fn default() -> Self {
        Self::new()
    }
}

impl Core {
    /// `PSYNC ? -1`: FULLRESYNC header, then the snapshot framed as
    /// `$<len>\r\n<bytes>` with no trailing CRLF. Afterward the socket is
    /// replica traffic and receives the propagated write stream.
    pub(crate) fn cmd_psync(&mut self, conn: ConnectionId) {
        if !matches!(self.role, Role::Leader(_)) {
            self.send_to(
                conn,
                resp::simple_error("ERR PSYNC can only be issued to a leader"),
            );
            return;
        }
        let Some(out) = self.mark_replica(conn) else {
            return;
        };
        let Role::Leader(leader) = &mut self.role else {
            return;
        };

        let header = resp::simple_string(&format!(
            "FULLRESYNC {} {}",
            leader.replid, leader.repl_offset
        ));
        let _ = out.send(header);

        leader.attach_replica(conn, out.clone());
        let payload = crate::rdb::empty_rdb();
        let mut framed = format!("${}\r\n", payload.len()).into_bytes();
        framed.extend_from_slice(&payload);
        let _ = out.send(framed);
        leader.mark_streaming(conn);

        tracing::info!(conn, "Replica attached after PSYNC");
        metrics::counter!("replication.full_syncs").increment(1);
    }

    pub(crate) fn cmd_replconf(&mut self, conn: ConnectionId, request: &Request, suppress: bool) {
        let sub = request
            .args
            .get(1)
            .map(|a| String::from_utf8_lossy(a).to_uppercase())
            .unwrap_or_default();
        match sub.as_str() {
            // A replica's processed-byte report. Never acknowledged.
            "ACK" => {
                let acked = request
                    .args
                    .get(2)
                    .and_then(|a| commands::parse_u64(a))
                    .unwrap_or(0);
                self.handle_replica_ack(conn, acked);
            }
            // GETACK is only meaningful on a follower's master channel,
            // where apply_from_master answers it.
            "GETACK" => {}
            // listening-port and capa during the handshake.
            _ => self.reply(conn, suppress, resp::simple_string("OK")),
        }
    }

    fn handle_replica_ack(&mut self, conn: ConnectionId, acked: u64) {
        let resolved = {
            let Role::Leader(leader) = &mut self.role else {
                return;
            };
            if let Some(record) = leader.replicas.get_mut(&conn) {
                record.acked_offset = acked;
            }
            // An ACK with no WAIT in flight is routine; late replies land
            // after the deadline all the time.
            let quorum = match &mut leader.pending_wait {
                Some(wait) if acked >= wait.baseline => {
                    wait.acks += 1;
                    tracing::debug!(
                        conn,
                        acked,
                        acks = wait.acks,
                        required = wait.required,
                        "Replica acknowledged"
                    );
                    wait.acks >= wait.required
                }
                _ => false,
            };
            if quorum {
                leader.pending_wait.take()
            } else {
                None
            }
        };
        if let Some(wait) = resolved {
            self.finish_wait(wait);
        }
    }

    pub(crate) fn cmd_wait(&mut self, conn: ConnectionId, request: &Request, suppress: bool) {
        let args = &request.args;
        if args.len() != 3 {
            return self.reply(conn, suppress, commands::wrong_args("wait"));
        }
        let (Some(required), Some(timeout_ms)) =
            (commands::parse_u64(&args[1]), commands::parse_u64(&args[2]))
        else {
            return self.reply(
                conn,
                suppress,
                resp::simple_error("ERR value is not an integer or out of range"),
            );
        };

        let token = self.take_token();
        let request_len = request.raw.len();

        enum Outcome {
            Reply(Vec<u8>),
            Parked,
        }
        let outcome = match &mut self.role {
            Role::Follower(_) => Outcome::Reply(resp::simple_error(
                "ERR WAIT cannot be used with replica instances",
            )),
            Role::Leader(leader) => {
                if leader.replicas.is_empty() {
                    Outcome::Reply(resp::integer(0))
                } else if leader.repl_offset == 0 {
                    Outcome::Reply(resp::integer(leader.replicas.len() as i64))
                } else if leader.pending_wait.is_some() {
                    // Overlapping WAITs are unspecified; refuse the second.
                    Outcome::Reply(resp::simple_error("ERR WAIT already in progress"))
                } else {
                    leader.pending_wait = Some(PendingWait {
                        token,
                        conn,
                        required: required as usize,
                        baseline: leader.repl_offset,
                        acks: 0,
                        request_len,
                    });
                    leader.broadcast(GETACK_FRAME);
                    Outcome::Parked
                }
            }
        };

        match outcome {
            Outcome::Reply(bytes) => self.reply(conn, suppress, bytes),
            Outcome::Parked => {
                tracing::debug!(conn, required, timeout_ms, "WAIT parked, GETACK broadcast");
                if timeout_ms > 0 {
                    let timer = self.tx.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(std::time::Duration::from_millis(timeout_ms)).await;
                        let _ = timer.send(CoreMessage::WaitTimeout { token });
                    });
                }
            }
        }
    }

    pub(crate) fn on_wait_timeout(&mut self, token: u64) {
        let expired = match &mut self.role {
            Role::Leader(leader)
                if leader
                    .pending_wait
                    .as_ref()
                    .is_some_and(|w| w.token == token) =>
            {
                leader.pending_wait.take()
            }
            _ => None,
        };
        if let Some(wait) = expired {
            self.finish_wait(wait);
        }
    }

    fn finish_wait(&mut self, wait: PendingWait) {
        tracing::debug!(conn = wait.conn, acks = wait.acks, "WAIT resolved");
        self.send_to(wait.conn, resp::integer(wait.acks as i64));
        if self.config.replication.wait_adds_own_length {
            if let Role::Leader(leader) = &mut self.role {
                leader.repl_offset += wait.request_len as u64;
            }
        }
    }

    /// A frame received on the master channel. Applied with replies
    /// suppressed; `REPLCONF GETACK *` is the sole frame answered, and it is
    /// answered on the master channel itself.
    pub(crate) fn apply_from_master(&mut self, request: &Request) {
        let frame_len = request.raw.len() as u64;
        let is_getack = request.verb() == "REPLCONF"
            && request
                .args
                .get(1)
                .is_some_and(|a| a.eq_ignore_ascii_case(b"GETACK"));

        if is_getack {
            // The ACK reports the offset as of before this frame; the frame
            // itself is counted right after, so later GETACKs include it.
            if let Role::Follower(follower) = &mut self.role {
                if let Some(out) = &follower.master_out {
                    let ack = resp::command(&[
                        b"REPLCONF",
                        b"ACK",
                        follower.master_offset.to_string().as_bytes(),
                    ]);
                    let _ = out.send(ack);
                }
                follower.master_offset += frame_len;
            }
            return;
        }

        self.dispatch(MASTER_CONN, request, true);
        if let Role::Follower(follower) = &mut self.role {
            follower.master_offset += frame_len;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replid_shape() {
        let id = generate_replid();
        assert_eq!(id.len(), 40);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(generate_replid(), id);
    }

    #[test]
    fn test_propagate_fans_out_and_advances_offset() {
        let mut leader = LeaderState::new(generate_replid());
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        leader.attach_replica(1, tx_a);
        leader.attach_replica(2, tx_b);

        let raw = b"*3\r\n$3\r\nSET\r\n$3\r\nfoo\r\n$3\r\nbar\r\n";
        leader.propagate(raw);

        assert_eq!(leader.repl_offset, raw.len() as u64);
        assert_eq!(rx_a.try_recv().unwrap(), raw.to_vec());
        assert_eq!(rx_b.try_recv().unwrap(), raw.to_vec());
    }

    #[test]
    fn test_broadcast_leaves_offset_alone() {
        let mut leader = LeaderState::new(generate_replid());
        let (tx, mut rx) = mpsc::unbounded_channel();
        leader.attach_replica(1, tx);

        leader.broadcast(GETACK_FRAME);
        assert_eq!(leader.repl_offset, 0);
        assert_eq!(rx.try_recv().unwrap(), GETACK_FRAME.to_vec());
    }

    #[test]
    fn test_getack_frame_is_byte_exact() {
        assert_eq!(
            GETACK_FRAME,
            b"*3\r\n$8\r\nREPLCONF\r\n$6\r\nGETACK\r\n$1\r\n*\r\n"
        );
    }
}
