//! Command dispatch and handlers. Writes flow through [`Core::after_write`]
//! so a leader propagates the raw request bytes; on a follower the same
//! handlers run with replies suppressed.

use ferrite_common::stream::{StreamEntry, StreamEntryId};

use crate::keyspace::{Expiry, RequestedId, ValueKind, WrongTypeError};
use crate::protocol::parser::Request;
use crate::protocol::resp;

use super::replication::Role;
use super::{now_ms, ConnectionId, Core};

impl Core {
    pub(crate) fn dispatch(&mut self, conn: ConnectionId, request: &Request, suppress: bool) {
        let verb = request.verb();
        if verb.is_empty() {
            return;
        }
        metrics::counter!("commands.processed", "verb" => verb.clone()).increment(1);
        tracing::debug!(conn, verb = %verb, suppress, "Dispatching command");

        match verb.as_str() {
            "PING" => self.reply(conn, suppress, resp::simple_string("PONG")),
            "ECHO" => self.cmd_echo(conn, request, suppress),
            "SET" => self.cmd_set(conn, request, suppress),
            "GET" => self.cmd_get(conn, request, suppress),
            "TYPE" => self.cmd_type(conn, request, suppress),
            "KEYS" => self.cmd_keys(conn, request, suppress),
            "CONFIG" => self.cmd_config(conn, request, suppress),
            "INFO" => self.cmd_info(conn, suppress),
            "REPLCONF" => self.cmd_replconf(conn, request, suppress),
            "PSYNC" => self.cmd_psync(conn),
            "WAIT" => self.cmd_wait(conn, request, suppress),
            "XADD" => self.cmd_xadd(conn, request, suppress),
            "XRANGE" => self.cmd_xrange(conn, request, suppress),
            "XREAD" => self.cmd_xread(conn, request, suppress),
            _ => self.reply(
                conn,
                suppress,
                resp::simple_error(&format!("ERR unknown command '{}'", verb.to_lowercase())),
            ),
        }
    }

    pub(crate) fn reply(&self, conn: ConnectionId, suppress: bool, bytes: Vec<u8>) {
        if !suppress {
            self.send_to(conn, bytes);
        }
    }

    /// Leader-side write fan-out, called after a write handler succeeds.
    fn after_write(&mut self, request: &Request) {
        if let Role::Leader(leader) = &mut self.role {
            leader.propagate(&request.raw);
        }
    }

    fn cmd_echo(&mut self, conn: ConnectionId, request: &Request, suppress: bool) {
        match request.args.get(1) {
            Some(message) => self.reply(conn, suppress, resp::bulk_string(message)),
            None => self.reply(conn, suppress, wrong_args("echo")),
        }
    }

    fn cmd_set(&mut self, conn: ConnectionId, request: &Request, suppress: bool) {
        let args = &request.args;
        if args.len() < 3 {
            return self.reply(conn, suppress, wrong_args("set"));
        }
        let mut expiry = None;
        if args.len() > 3 {
            if args.len() == 5 && args[3].eq_ignore_ascii_case(b"PX") {
                match parse_u64(&args[4]) {
                    Some(ms) => expiry = Some(Expiry::InMs(ms)),
                    None => {
                        return self.reply(
                            conn,
                            suppress,
                            resp::simple_error("ERR value is not an integer or out of range"),
                        )
                    }
                }
            } else {
                return self.reply(conn, suppress, resp::simple_error("ERR syntax error"));
            }
        }

        self.keyspace
            .set(args[1].clone(), args[2].clone(), expiry, now_ms());
        self.reply(conn, suppress, resp::simple_string("OK"));
        self.after_write(request);
    }

    fn cmd_get(&mut self, conn: ConnectionId, request: &Request, suppress: bool) {
        let args = &request.args;
        if args.len() != 2 {
            return self.reply(conn, suppress, wrong_args("get"));
        }
        let now = now_ms();
        if self.keyspace.kind(&args[1], now) == ValueKind::Stream {
            return self.reply(conn, suppress, resp::simple_error(&WrongTypeError.to_string()));
        }
        let reply = match self.keyspace.get(&args[1], now) {
            Some(value) => resp::bulk_string(&value),
            None => resp::null_bulk_string(),
        };
        self.reply(conn, suppress, reply);
    }

    fn cmd_type(&mut self, conn: ConnectionId, request: &Request, suppress: bool) {
        let args = &request.args;
        if args.len() != 2 {
            return self.reply(conn, suppress, wrong_args("type"));
        }
        let kind = self.keyspace.kind(&args[1], now_ms());
        self.reply(conn, suppress, resp::simple_string(kind.as_str()));
    }

    fn cmd_keys(&mut self, conn: ConnectionId, request: &Request, suppress: bool) {
        let args = &request.args;
        if args.len() != 2 {
            return self.reply(conn, suppress, wrong_args("keys"));
        }
        let mut keys = self.keyspace.keys(now_ms());
        if args[1] != b"*" {
            // Only the match-all pattern is supported; anything else
            // degrades to an exact-match filter.
            keys.retain(|k| *k == args[1]);
        }
        keys.sort();
        let reply = resp::array(keys.iter().map(|k| resp::bulk_string(k)).collect());
        self.reply(conn, suppress, reply);
    }

    fn cmd_config(&mut self, conn: ConnectionId, request: &Request, suppress: bool) {
        let args = &request.args;
        if args.len() != 3 || !args[1].eq_ignore_ascii_case(b"GET") {
            return self.reply(conn, suppress, wrong_args("config"));
        }
        let name = String::from_utf8_lossy(&args[2]).to_lowercase();
        let value = match name.as_str() {
            "dir" => Some(self.config.storage.dir.clone()),
            "dbfilename" => Some(self.config.storage.dbfilename.clone()),
            _ => None,
        };
        let reply = match value {
            Some(value) => resp::array(vec![
                resp::bulk_string(name.as_bytes()),
                resp::bulk_string(value.as_bytes()),
            ]),
            None => resp::array(vec![]),
        };
        self.reply(conn, suppress, reply);
    }

    fn cmd_info(&mut self, conn: ConnectionId, suppress: bool) {
        let body = match &self.role {
            Role::Leader(leader) => format!(
                "# Replication\r\nrole:master\r\nmaster_replid:{}\r\nmaster_repl_offset:{}\r\n",
                leader.replid, leader.repl_offset
            ),
            Role::Follower(follower) => format!(
                "# Replication\r\nrole:slave\r\nmaster_replid:{}\r\nmaster_repl_offset:{}\r\n",
                follower.master_replid, follower.master_offset
            ),
        };
        self.reply(conn, suppress, resp::bulk_string(body.as_bytes()));
    }

    fn cmd_xadd(&mut self, conn: ConnectionId, request: &Request, suppress: bool) {
        let args = &request.args;
        if args.len() < 5 || (args.len() - 3) % 2 != 0 {
            return self.reply(conn, suppress, wrong_args("xadd"));
        }
        let id_text = String::from_utf8_lossy(&args[2]).into_owned();
        let Some(requested) = RequestedId::parse(&id_text) else {
            return self.reply(conn, suppress, resp::simple_error(BAD_STREAM_ID));
        };
        let fields = args[3..]
            .chunks(2)
            .map(|pair| (pair[0].clone(), pair[1].clone()))
            .collect();

        match self.keyspace.xadd(&args[1], requested, fields, now_ms()) {
            Ok(id) => {
                self.reply(conn, suppress, resp::bulk_string(id.to_string().as_bytes()));
                self.after_write(request);
                self.wake_blocked_reads();
            }
            Err(e) => self.reply(conn, suppress, resp::simple_error(&e.to_string())),
        }
    }

    fn cmd_xrange(&mut self, conn: ConnectionId, request: &Request, suppress: bool) {
        let args = &request.args;
        if args.len() != 4 {
            return self.reply(conn, suppress, wrong_args("xrange"));
        }
        let start = match range_bound(&args[2], RangeEnd::Start) {
            Some(id) => id,
            None => return self.reply(conn, suppress, resp::simple_error(BAD_STREAM_ID)),
        };
        let end = match range_bound(&args[3], RangeEnd::End) {
            Some(id) => id,
            None => return self.reply(conn, suppress, resp::simple_error(BAD_STREAM_ID)),
        };

        match self.keyspace.xrange(&args[1], start, end, now_ms()) {
            Ok(entries) => {
                let reply = resp::array(entries.iter().map(encode_entry).collect());
                self.reply(conn, suppress, reply);
            }
            Err(e) => self.reply(conn, suppress, resp::simple_error(&e.to_string())),
        }
    }

    fn cmd_xread(&mut self, conn: ConnectionId, request: &Request, suppress: bool) {
        let args = &request.args;
        let mut idx = 1;
        let mut block_ms = None;
        if args.len() > idx + 1 && args[idx].eq_ignore_ascii_case(b"BLOCK") {
            match parse_u64(&args[idx + 1]) {
                Some(ms) => block_ms = Some(ms),
                None => {
                    return self.reply(
                        conn,
                        suppress,
                        resp::simple_error("ERR timeout is not an integer or out of range"),
                    )
                }
            }
            idx += 2;
        }
        if args.len() <= idx || !args[idx].eq_ignore_ascii_case(b"STREAMS") {
            return self.reply(conn, suppress, resp::simple_error("ERR syntax error"));
        }
        idx += 1;

        let rest = &args[idx..];
        if rest.is_empty() || rest.len() % 2 != 0 {
            return self.reply(
                conn,
                suppress,
                resp::simple_error(
                    "ERR Unbalanced XREAD list of streams: for each stream key an ID or '$' must be specified.",
                ),
            );
        }

        let (keys, ids) = rest.split_at(rest.len() / 2);
        let now = now_ms();
        let mut queries = Vec::with_capacity(keys.len());
        for (key, id_raw) in keys.iter().zip(ids) {
            if self.keyspace.kind(key, now) == ValueKind::String {
                return self.reply(conn, suppress, resp::simple_error(&WrongTypeError.to_string()));
            }
            let after = if id_raw == b"$" {
                self.keyspace
                    .last_stream_id(key)
                    .unwrap_or(StreamEntryId::ZERO)
            } else {
                let text = String::from_utf8_lossy(id_raw);
                match StreamEntryId::parse(&text, 0) {
                    Some(id) => id,
                    None => return self.reply(conn, suppress, resp::simple_error(BAD_STREAM_ID)),
                }
            };
            queries.push((key.clone(), after));
        }

        let results = self.keyspace.xread_after(&queries);
        if !results.is_empty() {
            return self.reply(conn, suppress, encode_xread_reply(&results));
        }
        match block_ms {
            Some(ms) if !suppress => self.park_blocked_read(conn, queries, ms),
            _ => self.reply(conn, suppress, resp::null_bulk_string()),
        }
    }
}

/// `XRANGE` bound parsing: `-`/`+` are the open ends; a bare ms defaults
/// its sequence to the lowest (start) or highest (end) value.
enum RangeEnd {
    Start,
    End,
}

fn range_bound(raw: &[u8], end: RangeEnd) -> Option<StreamEntryId> {
    match (raw, &end) {
        (b"-", _) => Some(StreamEntryId::ZERO),
        (b"+", _) => Some(StreamEntryId::MAX),
        _ => {
            let text = String::from_utf8_lossy(raw);
            let default_seq = match end {
                RangeEnd::Start => 0,
                RangeEnd::End => u64::MAX,
            };
            StreamEntryId::parse(&text, default_seq)
        }
    }
}

const BAD_STREAM_ID: &str = "ERR Invalid stream ID specified as stream command argument";

pub(crate) fn wrong_args(verb: &str) -> Vec<u8> {
    resp::simple_error(&format!(
        "ERR wrong number of arguments for '{}' command",
        verb
    ))
}

pub(crate) fn parse_u64(raw: &[u8]) -> Option<u64> {
    std::str::from_utf8(raw).ok()?.parse().ok()
}

/// One stream entry: `[id, [field, value, ...]]`.
fn encode_entry(entry: &StreamEntry) -> Vec<u8> {
    let mut flat = Vec::with_capacity(entry.fields.len() * 2);
    for (name, value) in &entry.fields {
        flat.push(resp::bulk_string(name));
        flat.push(resp::bulk_string(value));
    }
    resp::array(vec![
        resp::bulk_string(entry.id.to_string().as_bytes()),
        resp::array(flat),
    ])
}

/// The XREAD shape: an array of `[key, [entry, ...]]` per stream with news.
pub(crate) fn encode_xread_reply(results: &[(Vec<u8>, Vec<StreamEntry>)]) -> Vec<u8> {
    resp::array(
        results
            .iter()
            .map(|(key, entries)| {
                resp::array(vec![
                    resp::bulk_string(key),
                    resp::array(entries.iter().map(encode_entry).collect()),
                ])
            })
            .collect(),
    )
}
