// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Rustux IPC - Ports, Port Sets and Priority Inheritance
//!
//! This module implements the capability object model of the IPC layer:
//! ports with their rights accounting, port sets, the in-transit /
//! in-limbo life cycle with cycle detection, destruction and its
//! notifications, and the turnstile linkage that carries the priority of
//! blocked threads along chains of ports.
//!
//! # Design
//!
//! - **Context object**: process-wide state (the transit lock, the
//!   receive-turnstile index, collaborators, tunables and counters) lives
//!   in one [`Ipc`] value created at boot and passed by reference
//! - **Collaborators**: the capability space, the notifier and the event
//!   filter are traits implemented outside this crate
//! - **Lock discipline**: see [`port`] for the ordering; notifications and
//!   turnstile completions always run after every port lock is released
//!
//! # Usage
//!
//! ```rust
//! let ipc = Ipc::new(IpcConfig::from_cmdline(&cmdline), notifier, filter);
//! let (name, rcv) = ipc.port_alloc(&space, PortFlags::empty())?;
//! let send = rcv.port().make_send();
//! ipc.release_send(send);
//! ```

pub mod config;
pub mod destroy;
pub mod filter;
pub mod linkage;
pub mod mqueue;
pub mod notify;
pub mod port;
pub mod pset;
pub mod request;
pub mod rights;
pub mod space;
pub mod special_reply;
pub mod stats;
pub mod transit;
pub mod turnstile;

#[cfg(test)]
pub(crate) mod testing;

pub use config::IpcConfig;
pub use destroy::PortDestroyed;
pub use filter::{EventFilter, NoEventFilter};
pub use linkage::{BlockedReceiver, BlockedSender};
pub use mqueue::Message;
pub use notify::Notifier;
pub use port::{BindingKind, Port, PortFlags, PortInfo, PortState, SyncLinkKind};
pub use pset::PortSet;
pub use request::{RequestFlags, RequestIndex};
pub use rights::{ReceiveRight, SendOnceRight, SendRight};
pub use space::{EntryRights, Space, SpaceEntry, SpaceObject};
pub use special_reply::SrpAdjust;
pub use stats::{IpcStats, IpcStatsSnapshot};
pub use turnstile::{InheritorFlags, Turnstile, TurnstileInheritor};

use crate::rustux::types::*;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use spin::Mutex;

use crate::log_info;

/// A failed operation that hands a moved-in value back to the caller
#[derive(Debug)]
pub struct Rejected<T> {
    /// Why the operation failed
    pub status: Status,

    /// The value the caller passed in
    pub returned: T,
}

impl<T> Rejected<T> {
    pub(crate) fn new(status: Status, returned: T) -> Self {
        Self { status, returned }
    }
}

/// Outcome of a circularity check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Circularity {
    /// The port is now in transit to the destination
    Linked,

    /// Linking would close a cycle; nothing changed
    Circular,
}

/// IPC context
pub struct Ipc {
    pub(crate) config: IpcConfig,
    pub(crate) notifier: Arc<dyn Notifier>,
    pub(crate) filter: Arc<dyn EventFilter>,

    /// Serializes slow-path chain walks
    pub(crate) transit_lock: Mutex<()>,

    /// Receive turnstiles, keyed by port
    pub(crate) receive_turnstiles: Mutex<BTreeMap<PortId, linkage::ReceiveTurnstileSlot>>,

    pub(crate) stats: IpcStats,
}

impl Ipc {
    /// Create the IPC context
    pub fn new(config: IpcConfig, notifier: Arc<dyn Notifier>, filter: Arc<dyn EventFilter>) -> Self {
        log_info!(
            "ipc: init requests_max={} qlimit={}/{} srp_diagnostics={}",
            config.requests_max,
            config.qlimit_default,
            config.qlimit_max,
            config.srp_link_diagnostics
        );
        Self {
            config,
            notifier,
            filter,
            transit_lock: Mutex::new(()),
            receive_turnstiles: Mutex::new(BTreeMap::new()),
            stats: IpcStats::new(),
        }
    }

    /// Get the active configuration
    pub fn config(&self) -> &IpcConfig {
        &self.config
    }

    /// Snapshot the event counters
    pub fn stats(&self) -> IpcStatsSnapshot {
        self.stats.snapshot()
    }
}
