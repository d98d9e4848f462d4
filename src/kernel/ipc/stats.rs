// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! IPC Statistics
//!
//! Event counters for the port layer. Counters are relaxed atomics and
//! only meant for diagnostics; a snapshot is not a consistent cut.

use core::sync::atomic::{AtomicU64, Ordering};

/// Live IPC counters
#[derive(Debug, Default)]
pub struct IpcStats {
    pub(crate) ports_allocated: AtomicU64,
    pub(crate) ports_destroyed: AtomicU64,
    pub(crate) psets_allocated: AtomicU64,
    pub(crate) psets_destroyed: AtomicU64,
    pub(crate) circularity_fast: AtomicU64,
    pub(crate) circularity_slow: AtomicU64,
    pub(crate) circularity_detected: AtomicU64,
    pub(crate) request_grows: AtomicU64,
    pub(crate) grow_races_lost: AtomicU64,
    pub(crate) turnstile_races_lost: AtomicU64,
    pub(crate) no_senders_sent: AtomicU64,
    pub(crate) dead_names_sent: AtomicU64,
    pub(crate) port_destroyed_sent: AtomicU64,
    pub(crate) send_possible_sent: AtomicU64,
    pub(crate) srp_lost_links: AtomicU64,
}

/// Point-in-time copy of [`IpcStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IpcStatsSnapshot {
    /// Ports created
    pub ports_allocated: u64,

    /// Ports that went dead
    pub ports_destroyed: u64,

    pub psets_allocated: u64,
    pub psets_destroyed: u64,

    /// Transit links made on the try-lock path
    pub circularity_fast: u64,

    /// Transit links made under the global transit lock
    pub circularity_slow: u64,

    /// Links refused because they would close a cycle
    pub circularity_detected: u64,

    /// Request tables installed
    pub request_grows: u64,

    /// Grown tables discarded because another thread won
    pub grow_races_lost: u64,

    /// Spare send turnstiles discarded because another thread won
    pub turnstile_races_lost: u64,

    pub no_senders_sent: u64,
    pub dead_names_sent: u64,
    pub port_destroyed_sent: u64,
    pub send_possible_sent: u64,

    /// Special reply ports unlinked before their reply was sent
    pub srp_lost_links: u64,
}

impl IpcStats {
    /// Create zeroed counters
    pub const fn new() -> Self {
        Self {
            ports_allocated: AtomicU64::new(0),
            ports_destroyed: AtomicU64::new(0),
            psets_allocated: AtomicU64::new(0),
            psets_destroyed: AtomicU64::new(0),
            circularity_fast: AtomicU64::new(0),
            circularity_slow: AtomicU64::new(0),
            circularity_detected: AtomicU64::new(0),
            request_grows: AtomicU64::new(0),
            grow_races_lost: AtomicU64::new(0),
            turnstile_races_lost: AtomicU64::new(0),
            no_senders_sent: AtomicU64::new(0),
            dead_names_sent: AtomicU64::new(0),
            port_destroyed_sent: AtomicU64::new(0),
            send_possible_sent: AtomicU64::new(0),
            srp_lost_links: AtomicU64::new(0),
        }
    }

    /// Bump a counter
    #[inline]
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Copy every counter
    pub fn snapshot(&self) -> IpcStatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        IpcStatsSnapshot {
            ports_allocated: load(&self.ports_allocated),
            ports_destroyed: load(&self.ports_destroyed),
            psets_allocated: load(&self.psets_allocated),
            psets_destroyed: load(&self.psets_destroyed),
            circularity_fast: load(&self.circularity_fast),
            circularity_slow: load(&self.circularity_slow),
            circularity_detected: load(&self.circularity_detected),
            request_grows: load(&self.request_grows),
            grow_races_lost: load(&self.grow_races_lost),
            turnstile_races_lost: load(&self.turnstile_races_lost),
            no_senders_sent: load(&self.no_senders_sent),
            dead_names_sent: load(&self.dead_names_sent),
            port_destroyed_sent: load(&self.port_destroyed_sent),
            send_possible_sent: load(&self.send_possible_sent),
            srp_lost_links: load(&self.srp_lost_links),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_snapshot() {
        let stats = IpcStats::new();
        IpcStats::bump(&stats.request_grows);
        IpcStats::bump(&stats.request_grows);
        IpcStats::bump(&stats.circularity_detected);

        let snap = stats.snapshot();
        assert_eq!(snap.request_grows, 2);
        assert_eq!(snap.circularity_detected, 1);
        assert_eq!(snap.ports_allocated, 0);
    }
}
