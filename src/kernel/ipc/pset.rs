// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Port Sets
//!
//! A port set lets one thread wait on many ports. The set's aggregator
//! holds weak references to its members and a wake generation; each
//! member records the set in its own `psets` list. Both sides are only
//! changed with the member's port lock held and the aggregator locked
//! inside it, through [`PortGuard::lock_aggregator`].
//!
//! Teardown paths that start from the set (destroy, knote attach, ready
//! polling) snapshot the members under the aggregator lock alone and then
//! visit each port under its own lock.

use crate::kernel::ipc::port::{Binding, Port, PortGuard, PortInner};
use crate::kernel::ipc::stats::IpcStats;
use crate::kernel::ipc::Ipc;
use crate::rustux::types::err::*;
use crate::rustux::types::*;
use alloc::collections::BTreeMap;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};
use spin::{Mutex, MutexGuard};

use crate::log_trace_if;

const LOCAL_TRACE: bool = false;

/// Next port set ID counter
static NEXT_PSET_ID: AtomicU64 = AtomicU64::new(1);

/// No knote registered
const KNOTE_NONE: KnoteId = 0;

/// Set-side membership state
pub(crate) struct Aggregator {
    pub(crate) active: bool,
    pub(crate) members: BTreeMap<PortId, Weak<Port>>,

    /// Bumped whenever waiters on the set must re-check
    pub(crate) wakeups: u64,
}

/// Port set
pub struct PortSet {
    id: PsetId,
    space: SpaceId,
    name: PortName,

    /// Event-filter registration watching the set
    knote: AtomicU64,

    inner: Mutex<Aggregator>,
}

impl PortSet {
    pub(crate) fn new(space: SpaceId, name: PortName) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_PSET_ID.fetch_add(1, Ordering::Relaxed),
            space,
            name,
            knote: AtomicU64::new(KNOTE_NONE),
            inner: Mutex::new(Aggregator {
                active: true,
                members: BTreeMap::new(),
                wakeups: 0,
            }),
        })
    }

    pub fn id(&self) -> PsetId {
        self.id
    }

    pub fn space(&self) -> SpaceId {
        self.space
    }

    pub fn name(&self) -> PortName {
        self.name
    }

    pub fn is_active(&self) -> bool {
        self.inner.lock().active
    }

    pub fn member_count(&self) -> usize {
        self.inner.lock().members.len()
    }

    /// Get the wake generation
    pub fn wakeups(&self) -> u64 {
        self.inner.lock().wakeups
    }

    /// Get the knote watching the set
    pub fn knote(&self) -> Option<KnoteId> {
        match self.knote.load(Ordering::Acquire) {
            KNOTE_NONE => None,
            knote => Some(knote),
        }
    }

    /// Wake everybody waiting on the set
    pub(crate) fn wake(&self) {
        self.inner.lock().wakeups += 1;
    }

    /// Snapshot the live members
    pub(crate) fn members(&self) -> Vec<Arc<Port>> {
        self.inner
            .lock()
            .members
            .values()
            .filter_map(Weak::upgrade)
            .collect()
    }
}

impl fmt::Debug for PortSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PortSet")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish()
    }
}

/// A port lock with a set's aggregator locked inside it
pub(crate) struct AggregatorGuard<'p, 's> {
    // Declared first so the aggregator unlocks before the port
    aggregator: MutexGuard<'s, Aggregator>,
    port: PortGuard<'p>,
}

impl<'p, 's> AggregatorGuard<'p, 's> {
    /// Borrow both sides of the membership at once
    pub(crate) fn parts(&mut self) -> (&mut PortInner, &mut Aggregator) {
        (&mut *self.port, &mut *self.aggregator)
    }

    /// Unlock the aggregator, keeping the port locked
    pub(crate) fn unlock_aggregator(self) -> PortGuard<'p> {
        let Self { aggregator, port } = self;
        drop(aggregator);
        port
    }
}

impl<'p> PortGuard<'p> {
    /// Lock a set's aggregator inside this port lock
    pub(crate) fn lock_aggregator<'s>(self, pset: &'s PortSet) -> AggregatorGuard<'p, 's> {
        AggregatorGuard {
            aggregator: pset.inner.lock(),
            port: self,
        }
    }

    /// Leave every set the port belongs to
    pub(crate) fn leave_all_sets(mut self) -> (Self, usize) {
        let sets = core::mem::take(&mut self.psets);
        let id = self.port().id();
        for pset in &sets {
            let mut both = self.lock_aggregator(pset);
            let (_, agg) = both.parts();
            agg.members.remove(&id);
            self = both.unlock_aggregator();
        }
        (self, sets.len())
    }
}

impl Ipc {
    /// Add a receiver-bound port to a set
    pub fn pset_add(&self, pset: &Arc<PortSet>, port: &Arc<Port>) -> Result {
        let guard = port.lock();
        if !guard.is_active() {
            return Err(RX_ERR_TERMINATED);
        }
        if !matches!(guard.binding, Binding::Receiver { .. }) {
            return Err(RX_ERR_BAD_STATE);
        }

        let mut both = guard.lock_aggregator(pset);
        let (inner, agg) = both.parts();
        if !agg.active {
            return Err(RX_ERR_TERMINATED);
        }
        if agg.members.contains_key(&port.id()) {
            return Err(RX_ERR_ALREADY_EXISTS);
        }
        agg.members.insert(port.id(), Arc::downgrade(port));
        inner.psets.push(pset.clone());
        let guard = both.unlock_aggregator();

        let ts = self.send_turnstile_update_locked(&guard);
        drop(guard);
        if let Some(ts) = ts {
            ts.update_inheritor_complete();
        }

        log_trace_if!(LOCAL_TRACE, "pset {}: added port {}", pset.id(), port.id());
        Ok(())
    }

    /// Remove a port from a set
    ///
    /// A port that is not a member is left untouched.
    pub fn pset_remove(&self, pset: &Arc<PortSet>, port: &Arc<Port>) -> Result {
        let guard = port.lock();
        let mut both = guard.lock_aggregator(pset);
        let (inner, agg) = both.parts();

        let position = inner.psets.iter().position(|p| Arc::ptr_eq(p, pset));
        let position = match position {
            Some(position) if agg.members.contains_key(&port.id()) => position,
            _ => return Err(RX_ERR_NOT_IN_SET),
        };
        agg.members.remove(&port.id());
        let removed = inner.psets.swap_remove(position);
        let guard = both.unlock_aggregator();

        let ts = self.send_turnstile_update_locked(&guard);
        drop(guard);
        drop(removed);
        if let Some(ts) = ts {
            ts.update_inheritor_complete();
        }

        log_trace_if!(LOCAL_TRACE, "pset {}: removed port {}", pset.id(), port.id());
        Ok(())
    }

    /// Remove a port from every set it belongs to
    ///
    /// Returns the number of sets left.
    pub fn pset_remove_from_all(&self, port: &Arc<Port>) -> usize {
        let (guard, count) = port.lock().leave_all_sets();
        let ts = if count > 0 {
            self.send_turnstile_update_locked(&guard)
        } else {
            None
        };
        drop(guard);
        if let Some(ts) = ts {
            ts.update_inheritor_complete();
        }
        count
    }

    /// Check set membership
    pub fn pset_member(&self, pset: &Arc<PortSet>, port: &Port) -> bool {
        port.lock().psets.iter().any(|p| Arc::ptr_eq(p, pset))
    }

    /// Destroy a set, releasing every member
    pub fn pset_destroy(&self, pset: &Arc<PortSet>) {
        let members = {
            let mut agg = pset.inner.lock();
            if !agg.active {
                return;
            }
            agg.active = false;
            agg.wakeups += 1;
            core::mem::take(&mut agg.members)
        };
        pset.knote.store(KNOTE_NONE, Ordering::Release);

        for port in members.values().filter_map(Weak::upgrade) {
            let (ts, removed) = {
                let mut guard = port.lock();
                let removed = guard
                    .psets
                    .iter()
                    .position(|p| Arc::ptr_eq(p, pset))
                    .map(|position| guard.psets.swap_remove(position));
                (self.send_turnstile_update_locked(&guard), removed)
            };
            drop(removed);
            if let Some(ts) = ts {
                ts.update_inheritor_complete();
            }
        }

        IpcStats::bump(&self.stats.psets_destroyed);
        log_trace_if!(LOCAL_TRACE, "pset {}: destroyed with {} members", pset.id(), members.len());
    }

    /// Register (or clear) the knote watching a set
    ///
    /// Every member's send turnstile is re-pointed.
    pub fn pset_attach_knote(&self, pset: &Arc<PortSet>, knote: Option<KnoteId>) -> Result {
        if !pset.is_active() {
            return Err(RX_ERR_TERMINATED);
        }
        pset.knote.store(knote.unwrap_or(KNOTE_NONE), Ordering::Release);
        self.pset_recompute_members(pset);
        Ok(())
    }

    /// Find a member with a message ready to receive
    pub fn pset_ready_member(&self, pset: &Arc<PortSet>) -> Option<Arc<Port>> {
        pset.members().into_iter().find(|port| {
            let guard = port.lock();
            guard.is_active()
                && guard.mqueue.msgcount() > 0
                && guard.psets.iter().any(|p| Arc::ptr_eq(p, pset))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::ipc::mqueue::Message;
    use crate::kernel::ipc::testing::*;
    use crate::kernel::ipc::turnstile::Turnstile;
    use alloc::vec;

    #[test]
    fn test_add_remove_membership_both_sides() {
        let (ipc, _notes) = new_ipc();
        let space = TestSpace::new(1);
        let (_, pset) = ipc.pset_alloc(&space).unwrap();
        let port = alloc_port(&ipc, &space);

        ipc.pset_add(&pset, &port).unwrap();
        assert!(port.in_pset());
        assert!(ipc.pset_member(&pset, &port));
        assert_eq!(pset.member_count(), 1);
        assert_eq!(ipc.pset_add(&pset, &port), Err(RX_ERR_ALREADY_EXISTS));

        ipc.pset_remove(&pset, &port).unwrap();
        assert!(!port.in_pset());
        assert_eq!(pset.member_count(), 0);
    }

    #[test]
    fn test_remove_is_idempotent() {
        let (ipc, _notes) = new_ipc();
        let space = TestSpace::new(1);
        let (_, pset) = ipc.pset_alloc(&space).unwrap();
        let port = alloc_port(&ipc, &space);

        ipc.pset_add(&pset, &port).unwrap();
        assert_eq!(ipc.pset_remove(&pset, &port), Ok(()));
        let before = port.info();
        assert_eq!(ipc.pset_remove(&pset, &port), Err(RX_ERR_NOT_IN_SET));
        assert_eq!(port.info(), before);
        assert_eq!(pset.member_count(), 0);
    }

    #[test]
    fn test_add_requires_receiver_bound_port() {
        let (ipc, _notes) = new_ipc();
        let space = TestSpace::new(1);
        let (_, pset) = ipc.pset_alloc(&space).unwrap();
        let port = alloc_port(&ipc, &space);

        ipc.port_make_limbo(&port).unwrap();
        assert_eq!(ipc.pset_add(&pset, &port), Err(RX_ERR_BAD_STATE));

        ipc.pset_destroy(&pset);
        let other = alloc_port(&ipc, &space);
        assert_eq!(ipc.pset_add(&pset, &other), Err(RX_ERR_TERMINATED));
        assert!(!other.in_pset());
    }

    #[test]
    fn test_remove_from_all() {
        let (ipc, _notes) = new_ipc();
        let space = TestSpace::new(1);
        let (_, a) = ipc.pset_alloc(&space).unwrap();
        let (_, b) = ipc.pset_alloc(&space).unwrap();
        let port = alloc_port(&ipc, &space);

        ipc.pset_add(&a, &port).unwrap();
        ipc.pset_add(&b, &port).unwrap();
        assert_eq!(port.info().pset_count, 2);

        assert_eq!(ipc.pset_remove_from_all(&port), 2);
        assert!(!port.in_pset());
        assert_eq!(a.member_count() + b.member_count(), 0);
        assert_eq!(ipc.pset_remove_from_all(&port), 0);
    }

    #[test]
    fn test_destroy_releases_members_and_wakes() {
        let (ipc, _notes) = new_ipc();
        let space = TestSpace::new(1);
        let (_, pset) = ipc.pset_alloc(&space).unwrap();
        let p1 = alloc_port(&ipc, &space);
        let p2 = alloc_port(&ipc, &space);
        ipc.pset_add(&pset, &p1).unwrap();
        ipc.pset_add(&pset, &p2).unwrap();

        let gen = pset.wakeups();
        ipc.pset_destroy(&pset);
        assert!(!pset.is_active());
        assert_eq!(pset.wakeups(), gen + 1);
        assert!(!p1.in_pset() && !p2.in_pset());
        assert_eq!(ipc.stats().psets_destroyed, 1);
    }

    #[test]
    fn test_ready_member_and_enqueue_wakeup() {
        let (ipc, _notes) = new_ipc();
        let space = TestSpace::new(1);
        let (_, pset) = ipc.pset_alloc(&space).unwrap();
        let idle = alloc_port(&ipc, &space);
        let busy = alloc_port(&ipc, &space);
        ipc.pset_add(&pset, &idle).unwrap();
        ipc.pset_add(&pset, &busy).unwrap();
        assert!(ipc.pset_ready_member(&pset).is_none());

        let gen = pset.wakeups();
        ipc.port_enqueue(&busy, Message::new(vec![7])).unwrap();
        assert_eq!(pset.wakeups(), gen + 1);
        assert_eq!(ipc.pset_ready_member(&pset).map(|p| p.id()), Some(busy.id()));
    }

    #[test]
    fn test_set_knote_boosts_member_senders() {
        let filter = TestFilter::new();
        let (ipc, _notes) = new_ipc_with_filter(filter.clone());
        let space = TestSpace::new(1);
        let (_, pset) = ipc.pset_alloc(&space).unwrap();
        let port = alloc_port(&ipc, &space);
        ipc.pset_add(&pset, &port).unwrap();

        let kq = Turnstile::alloc();
        filter.set_knote_turnstile(40, kq.clone());
        let blocked = ipc.sender_wait_begin(&port, 3, 25).unwrap();
        assert_eq!(kq.effective_priority(), 0);

        ipc.pset_attach_knote(&pset, Some(40)).unwrap();
        assert_eq!(pset.knote(), Some(40));
        assert_eq!(kq.effective_priority(), 25);

        // Leaving the set drops the push
        ipc.pset_remove(&pset, &port).unwrap();
        assert_eq!(kq.effective_priority(), 0);

        ipc.sender_wait_end(blocked);
    }
}
