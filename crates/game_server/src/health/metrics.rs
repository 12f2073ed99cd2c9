//! Server counters for production monitoring.
//!
//! Every counter is a relaxed atomic so hot paths can bump them without
//! contention. [`ServerStats::snapshot`] produces a serializable copy for
//! periodic logging.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Live counters shared by the server, the registry and the store.
#[derive(Debug)]
pub struct ServerStats {
    start_time: Instant,
    connections_accepted: AtomicU64,
    connections_rejected: AtomicU64,
    connections_active: AtomicU64,
    frames_received: AtomicU64,
    frames_dispatched: AtomicU64,
    unhandled_messages: AtomicU64,
    unauthorized_messages: AtomicU64,
    handler_failures: AtomicU64,
    protocol_violations: AtomicU64,
    idle_timeouts: AtomicU64,
    sessions_created: AtomicU64,
    sessions_evicted: AtomicU64,
    store_degraded_ops: AtomicU64,
    write_behind_skipped: AtomicU64,
}

macro_rules! counter {
    ($inc:ident, $field:ident) => {
        pub fn $inc(&self) {
            self.$field.fetch_add(1, Ordering::Relaxed);
        }
    };
}

impl ServerStats {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            connections_accepted: AtomicU64::new(0),
            connections_rejected: AtomicU64::new(0),
            connections_active: AtomicU64::new(0),
            frames_received: AtomicU64::new(0),
            frames_dispatched: AtomicU64::new(0),
            unhandled_messages: AtomicU64::new(0),
            unauthorized_messages: AtomicU64::new(0),
            handler_failures: AtomicU64::new(0),
            protocol_violations: AtomicU64::new(0),
            idle_timeouts: AtomicU64::new(0),
            sessions_created: AtomicU64::new(0),
            sessions_evicted: AtomicU64::new(0),
            store_degraded_ops: AtomicU64::new(0),
            write_behind_skipped: AtomicU64::new(0),
        }
    }

    /// Counts an accepted connection and marks it active.
    pub fn connection_opened(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
        self.connections_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        let _ = self
            .connections_active
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    counter!(connection_rejected, connections_rejected);
    counter!(frame_received, frames_received);
    counter!(frame_dispatched, frames_dispatched);
    counter!(message_unhandled, unhandled_messages);
    counter!(message_unauthorized, unauthorized_messages);
    counter!(handler_failed, handler_failures);
    counter!(protocol_violation, protocol_violations);
    counter!(idle_timeout, idle_timeouts);
    counter!(session_created, sessions_created);
    counter!(store_degraded, store_degraded_ops);
    counter!(write_behind_skip, write_behind_skipped);

    pub fn sessions_evicted(&self, count: usize) {
        self.sessions_evicted.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn active_connections(&self) -> u64 {
        self.connections_active.load(Ordering::Relaxed)
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Point-in-time copy of every counter.
    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            uptime_seconds: self.uptime_seconds(),
            connections_accepted: load(&self.connections_accepted),
            connections_rejected: load(&self.connections_rejected),
            connections_active: load(&self.connections_active),
            frames_received: load(&self.frames_received),
            frames_dispatched: load(&self.frames_dispatched),
            unhandled_messages: load(&self.unhandled_messages),
            unauthorized_messages: load(&self.unauthorized_messages),
            handler_failures: load(&self.handler_failures),
            protocol_violations: load(&self.protocol_violations),
            idle_timeouts: load(&self.idle_timeouts),
            sessions_created: load(&self.sessions_created),
            sessions_evicted: load(&self.sessions_evicted),
            store_degraded_ops: load(&self.store_degraded_ops),
            write_behind_skipped: load(&self.write_behind_skipped),
        }
    }
}

impl Default for ServerStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of all counters at a point in time
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub uptime_seconds: u64,
    pub connections_accepted: u64,
    pub connections_rejected: u64,
    pub connections_active: u64,
    pub frames_received: u64,
    pub frames_dispatched: u64,
    pub unhandled_messages: u64,
    pub unauthorized_messages: u64,
    pub handler_failures: u64,
    pub protocol_violations: u64,
    pub idle_timeouts: u64,
    pub sessions_created: u64,
    pub sessions_evicted: u64,
    pub store_degraded_ops: u64,
    pub write_behind_skipped: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let stats = ServerStats::new();
        stats.frame_received();
        stats.frame_received();
        stats.handler_failed();
        stats.sessions_evicted(3);

        let snap = stats.snapshot();
        assert_eq!(snap.frames_received, 2);
        assert_eq!(snap.handler_failures, 1);
        assert_eq!(snap.sessions_evicted, 3);
        assert_eq!(snap.unhandled_messages, 0);
    }

    #[test]
    fn test_active_connections_never_underflow() {
        let stats = ServerStats::new();
        stats.connection_opened();
        stats.connection_closed();
        stats.connection_closed();
        assert_eq!(stats.active_connections(), 0);
        assert_eq!(stats.snapshot().connections_accepted, 1);
    }

    #[test]
    fn test_snapshot_serializes() {
        let stats = ServerStats::new();
        stats.protocol_violation();
        let json = serde_json::to_value(stats.snapshot()).unwrap();
        assert_eq!(json["protocol_violations"], 1);
    }
}
