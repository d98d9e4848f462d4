// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Turnstile Linkage
//!
//! Ports carry two turnstiles:
//!
//! - **Send turnstile**: installed lazily on the port itself. Blocked
//!   senders wait on it. Its inheritor is the destination's send turnstile
//!   while the port is in transit, otherwise the turnstile of the
//!   event-filter registration watching the port (or one of its sets).
//!   Every holder of the linkage owns a `ts_port_ref`; the turnstile is
//!   detached when the last one is released.
//! - **Receive turnstile**: kept in the context's index, keyed by port.
//!   Blocked receivers wait on it. For a special reply port its inheritor
//!   is the reply link, so a client waiting for its reply pushes on
//!   whoever will send it.
//!
//! Inheritors are chosen with the port locked; the push is moved by
//! `update_inheritor_complete` once every port lock is dropped.

use crate::kernel::ipc::port::{Binding, Port, PortInner, SyncLink};
use crate::kernel::ipc::pset::PortSet;
use crate::kernel::ipc::stats::IpcStats;
use crate::kernel::ipc::turnstile::{InheritorFlags, Turnstile, TurnstileInheritor};
use crate::kernel::ipc::Ipc;
use crate::rustux::types::err::*;
use crate::rustux::types::*;
use alloc::sync::Arc;

use crate::{log_trace_if, log_warn};

const LOCAL_TRACE: bool = false;

/// Receive turnstile index entry
pub(crate) struct ReceiveTurnstileSlot {
    turnstile: Arc<Turnstile>,
    refs: u32,
}

/// A sender blocked on a full port
#[must_use = "blocked senders must be ended with sender_wait_end"]
#[derive(Debug)]
pub struct BlockedSender {
    port: Arc<Port>,
    turnstile: Arc<Turnstile>,
    tid: ThreadId,
}

impl BlockedSender {
    /// Turnstile the sender waits on
    pub fn turnstile(&self) -> &Arc<Turnstile> {
        &self.turnstile
    }
}

/// A receiver blocked on an empty port
#[must_use = "blocked receivers must be ended with receiver_wait_end"]
#[derive(Debug)]
pub struct BlockedReceiver {
    port: Arc<Port>,
    turnstile: Arc<Turnstile>,
    tid: ThreadId,
}

impl BlockedReceiver {
    /// Turnstile the receiver waits on
    pub fn turnstile(&self) -> &Arc<Turnstile> {
        &self.turnstile
    }
}

impl Ipc {
    /// Pick the inheritor for a port's send turnstile
    pub(crate) fn send_turnstile_inheritor(&self, inner: &PortInner) -> TurnstileInheritor {
        if !inner.is_active() {
            return TurnstileInheritor::None;
        }
        if let Binding::InTransit { dest_turnstile, .. } = &inner.binding {
            return TurnstileInheritor::Turnstile(dest_turnstile.clone());
        }

        let knote_ts = inner
            .knote
            .and_then(|knote| self.filter.kqueue_turnstile_of(knote))
            .or_else(|| {
                inner
                    .psets
                    .iter()
                    .filter_map(|pset| pset.knote())
                    .find_map(|knote| self.filter.kqueue_turnstile_of(knote))
            });
        match knote_ts {
            Some(ts) => TurnstileInheritor::Turnstile(ts),
            None => TurnstileInheritor::None,
        }
    }

    /// Re-point the send turnstile with the port locked
    ///
    /// Returns the turnstile to complete once the lock is dropped.
    pub(crate) fn send_turnstile_update_locked(&self, inner: &PortInner) -> Option<Arc<Turnstile>> {
        let ts = inner.send_turnstile.clone()?;
        ts.update_inheritor(self.send_turnstile_inheritor(inner), InheritorFlags::IMMEDIATE_UPDATE);
        Some(ts)
    }

    /// Take a reference on the port's send turnstile, installing it if needed
    pub fn send_turnstile_prepare(&self, port: &Arc<Port>) -> Arc<Turnstile> {
        let mut spare: Option<Arc<Turnstile>> = None;
        loop {
            let mut guard = port.lock();
            if let Some(ts) = guard.send_turnstile.clone() {
                guard.ts_port_ref += 1;
                drop(guard);
                if spare.is_some() {
                    IpcStats::bump(&self.stats.turnstile_races_lost);
                    log_trace_if!(LOCAL_TRACE, "port {}: lost send turnstile race", port.id());
                }
                return ts;
            }

            match spare.take() {
                Some(ts) => {
                    ts.attach(port.id());
                    ts.update_inheritor(
                        self.send_turnstile_inheritor(&guard),
                        InheritorFlags::IMMEDIATE_UPDATE,
                    );
                    guard.send_turnstile = Some(ts.clone());
                    guard.ts_port_ref = 1;
                    drop(guard);
                    ts.update_inheritor_complete();
                    return ts;
                }
                None => {
                    drop(guard);
                    spare = Some(Turnstile::alloc());
                }
            }
        }
    }

    /// Release a send turnstile reference
    ///
    /// The last reference detaches the turnstile from the port.
    pub fn send_turnstile_complete(&self, port: &Port) {
        let released = {
            let mut guard = port.lock();
            if guard.ts_port_ref == 0 {
                log_warn!("port {}: send turnstile released without a reference", port.id());
                return;
            }
            guard.ts_port_ref -= 1;
            if guard.ts_port_ref == 0 {
                guard.send_turnstile.take()
            } else {
                None
            }
        };

        if let Some(ts) = released {
            ts.update_inheritor(TurnstileInheritor::None, InheritorFlags::IMMEDIATE_UPDATE);
            ts.detach();
            ts.update_inheritor_complete();
        }
    }

    /// Re-derive the send turnstile's inheritor
    pub fn send_turnstile_recompute(&self, port: &Port) {
        let ts = {
            let guard = port.lock();
            self.send_turnstile_update_locked(&guard)
        };
        if let Some(ts) = ts {
            ts.update_inheritor_complete();
        }
    }

    /// Register an event-filter knote on a port
    pub fn port_attach_knote(&self, port: &Arc<Port>, knote: KnoteId) -> Result {
        let ts = {
            let mut guard = port.lock();
            if !guard.is_active() {
                return Err(RX_ERR_TERMINATED);
            }
            if guard.knote.is_some() {
                return Err(RX_ERR_ALREADY_EXISTS);
            }
            guard.knote = Some(knote);
            self.send_turnstile_update_locked(&guard)
        };
        if let Some(ts) = ts {
            ts.update_inheritor_complete();
        }
        Ok(())
    }

    /// Drop a port's knote registration
    pub fn port_detach_knote(&self, port: &Arc<Port>) -> Option<KnoteId> {
        let (knote, ts) = {
            let mut guard = port.lock();
            let knote = guard.knote.take();
            (knote, self.send_turnstile_update_locked(&guard))
        };
        if let Some(ts) = ts {
            ts.update_inheritor_complete();
        }
        knote
    }

    /// Look up a port's receive turnstile
    pub fn receive_turnstile(&self, port: &Port) -> Option<Arc<Turnstile>> {
        self.receive_turnstiles
            .lock()
            .get(&port.id())
            .map(|slot| slot.turnstile.clone())
    }

    /// Take a reference on the port's receive turnstile, installing it if needed
    pub fn receive_turnstile_prepare(&self, port: &Arc<Port>) -> Arc<Turnstile> {
        let spare = Turnstile::alloc();
        let (ts, installed) = {
            let mut index = self.receive_turnstiles.lock();
            let slot = index.entry(port.id()).or_insert_with(|| ReceiveTurnstileSlot {
                turnstile: spare.clone(),
                refs: 0,
            });
            slot.refs += 1;
            (slot.turnstile.clone(), Arc::ptr_eq(&slot.turnstile, &spare))
        };

        if installed {
            ts.attach(port.id());
            if port.is_special_reply() {
                self.special_reply_update_inheritor(port);
            }
        }
        ts
    }

    /// Release a receive turnstile reference
    pub fn receive_turnstile_complete(&self, port: &Port) {
        let released = {
            let mut index = self.receive_turnstiles.lock();
            match index.get_mut(&port.id()) {
                Some(slot) if slot.refs > 1 => {
                    slot.refs -= 1;
                    None
                }
                Some(_) => index.remove(&port.id()).map(|slot| slot.turnstile),
                None => {
                    log_warn!("port {}: receive turnstile released without a reference", port.id());
                    None
                }
            }
        };

        if let Some(ts) = released {
            ts.update_inheritor(TurnstileInheritor::None, InheritorFlags::IMMEDIATE_UPDATE);
            ts.detach();
            ts.update_inheritor_complete();
        }
    }

    /// Inheritor of a special reply port's receive turnstile
    pub(crate) fn sync_link_inheritor(&self, inner: &PortInner) -> TurnstileInheritor {
        match &inner.sync_link {
            SyncLink::None => TurnstileInheritor::None,
            SyncLink::Port { turnstile, .. } => TurnstileInheritor::Turnstile(turnstile.clone()),
            SyncLink::Knote(knote) => self
                .filter
                .kqueue_turnstile_of(*knote)
                .map_or(TurnstileInheritor::None, TurnstileInheritor::Turnstile),
            SyncLink::Stashed(ts) => TurnstileInheritor::Turnstile(ts.clone()),
        }
    }

    /// Point a special reply port's receive turnstile at its link
    pub(crate) fn special_reply_update_inheritor(&self, srp: &Port) {
        let ts = match self.receive_turnstile(srp) {
            Some(ts) => ts,
            None => return,
        };
        {
            let guard = srp.lock();
            ts.update_inheritor(self.sync_link_inheritor(&guard), InheritorFlags::IMMEDIATE_UPDATE);
        }
        ts.update_inheritor_complete();
    }

    /// Block a sender on a full port
    pub fn sender_wait_begin(
        &self,
        port: &Arc<Port>,
        tid: ThreadId,
        priority: Priority,
    ) -> Result<BlockedSender> {
        if !port.is_active() {
            return Err(RX_ERR_TERMINATED);
        }
        let turnstile = self.send_turnstile_prepare(port);
        turnstile.add_waiter(tid, priority);
        log_trace_if!(LOCAL_TRACE, "port {}: sender {} blocked at {}", port.id(), tid, priority);
        Ok(BlockedSender {
            port: port.clone(),
            turnstile,
            tid,
        })
    }

    /// Wake a blocked sender
    pub fn sender_wait_end(&self, blocked: BlockedSender) {
        let BlockedSender {
            port,
            turnstile,
            tid,
        } = blocked;
        turnstile.remove_waiter(tid);
        drop(turnstile);
        self.send_turnstile_complete(&port);
    }

    /// Block a receiver on a port
    pub fn receiver_wait_begin(
        &self,
        port: &Arc<Port>,
        tid: ThreadId,
        priority: Priority,
    ) -> Result<BlockedReceiver> {
        if !port.is_active() {
            return Err(RX_ERR_TERMINATED);
        }
        let turnstile = self.receive_turnstile_prepare(port);
        turnstile.add_waiter(tid, priority);
        Ok(BlockedReceiver {
            port: port.clone(),
            turnstile,
            tid,
        })
    }

    /// Wake a blocked receiver
    pub fn receiver_wait_end(&self, blocked: BlockedReceiver) {
        let BlockedReceiver {
            port,
            turnstile,
            tid,
        } = blocked;
        turnstile.remove_waiter(tid);
        drop(turnstile);
        self.receive_turnstile_complete(&port);
    }

    /// Re-derive the send turnstile of every member of a set
    pub(crate) fn pset_recompute_members(&self, pset: &PortSet) {
        for port in pset.members() {
            self.send_turnstile_recompute(&port);
        }
    }
}
