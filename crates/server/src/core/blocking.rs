//! Waiter records for `XREAD BLOCK`. A waiter parks on the core with a
//! token and an optional single-shot timer; any XADD re-evaluates the
//! table, and stale timer messages are recognized by token mismatch.

use std::collections::HashMap;

use ferrite_common::stream::StreamEntryId;

use crate::protocol::resp;

use super::{commands, ConnectionId, Core, CoreMessage};

pub(crate) struct ReadWaiter {
    /// Distinguishes this waiter from stale timer messages.
    pub token: u64,
    /// `(key, after)` pairs with `$` already substituted.
    pub queries: Vec<(Vec<u8>, StreamEntryId)>,
}

/// At most one blocked read per connection.
#[derive(Default)]
pub(crate) struct BlockedReads {
    pub waiters: HashMap<ConnectionId, ReadWaiter>,
}

impl BlockedReads {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn park(&mut self, conn: ConnectionId, waiter: ReadWaiter) {
        self.waiters.insert(conn, waiter);
        self.report();
    }

    /// Remove the waiter for `conn` if its token matches.
    pub fn take_if_current(&mut self, conn: ConnectionId, token: u64) -> Option<ReadWaiter> {
        if self.waiters.get(&conn).is_some_and(|w| w.token == token) {
            let waiter = self.waiters.remove(&conn);
            self.report();
            return waiter;
        }
        None
    }

    pub fn drop_conn(&mut self, conn: ConnectionId) {
        if self.waiters.remove(&conn).is_some() {
            self.report();
        }
    }

    pub fn remove(&mut self, conn: ConnectionId) -> Option<ReadWaiter> {
        let waiter = self.waiters.remove(&conn);
        self.report();
        waiter
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }

    fn report(&self) {
        metrics::gauge!("blocking.waiters").set(self.waiters.len() as f64);
    }
}

impl Core {
    pub(crate) fn park_blocked_read(
        &mut self,
        conn: ConnectionId,
        queries: Vec<(Vec<u8>, StreamEntryId)>,
        timeout_ms: u64,
    ) {
        let token = self.take_token();
        self.blocked.park(conn, ReadWaiter { token, queries });
        tracing::debug!(conn, timeout_ms, "XREAD parked");
        if timeout_ms > 0 {
            let timer = self.tx.clone();
            tokio::spawn(async move {
                tokio::time::sleep(std::time::Duration::from_millis(timeout_ms)).await;
                let _ = timer.send(CoreMessage::ReadTimeout { conn, token });
            });
        }
    }

    /// Re-evaluate every parked read after an append; a non-empty result
    /// resolves the waiter immediately and orphans its timer.
    pub(crate) fn wake_blocked_reads(&mut self) {
        if self.blocked.is_empty() {
            return;
        }
        let mut ready = Vec::new();
        for (conn, waiter) in &self.blocked.waiters {
            let results = self.keyspace.xread_after(&waiter.queries);
            if !results.is_empty() {
                ready.push((*conn, results));
            }
        }
        for (conn, results) in ready {
            self.blocked.remove(conn);
            self.send_to(conn, commands::encode_xread_reply(&results));
            tracing::debug!(conn, "Blocked XREAD woken by append");
        }
    }

    pub(crate) fn on_read_timeout(&mut self, conn: ConnectionId, token: u64) {
        let Some(waiter) = self.blocked.take_if_current(conn, token) else {
            // The waiter already resolved or the connection re-blocked.
            return;
        };
        let results = self.keyspace.xread_after(&waiter.queries);
        let reply = if results.is_empty() {
            resp::null_bulk_string()
        } else {
            commands::encode_xread_reply(&results)
        };
        self.send_to(conn, reply);
        tracing::debug!(conn, "Blocked XREAD timed out");
    }
}
