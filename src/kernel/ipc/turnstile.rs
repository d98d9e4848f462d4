// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Turnstiles
//!
//! A turnstile is the priority-inheritance primitive the IPC layer hangs
//! its linkage on. Threads blocked on a turnstile donate their priority to
//! the turnstile's inheritor, which is either another turnstile (the push
//! continues down the chain) or a thread.
//!
//! # Design
//!
//! - **Reference counted**: turnstiles are shared through `Arc`; whoever
//!   holds a clone keeps the turnstile alive
//! - **Two-phase inheritor update**: `update_inheritor` is called with the
//!   proprietor's lock held and only records the new inheritor;
//!   `update_inheritor_complete` moves the priority push and must be called
//!   after every object lock has been dropped
//! - **One lock at a time**: propagation never holds two turnstile locks
//!
//! # Usage
//!
//! ```rust
//! let ts = Turnstile::alloc();
//! ts.update_inheritor(TurnstileInheritor::Thread(tid), InheritorFlags::IMMEDIATE_UPDATE);
//! ts.update_inheritor_complete();
//! ts.add_waiter(blocked_tid, 31);
//! ```

use crate::rustux::types::*;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use bitflags::bitflags;
use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};
use spin::Mutex;

use crate::log_warn;

/// Turnstile identifier
pub type TurnstileId = u64;

/// Upper bound on inheritor chain length walked by one propagation
pub const TURNSTILE_MAX_HOP: usize = 64;

/// Next turnstile ID counter
static NEXT_TURNSTILE_ID: AtomicU64 = AtomicU64::new(1);

/// Allocate a new turnstile ID
fn alloc_turnstile_id() -> TurnstileId {
    NEXT_TURNSTILE_ID.fetch_add(1, Ordering::Relaxed)
}

bitflags! {
    /// Inheritor update flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct InheritorFlags: u8 {
        /// Make the new inheritor visible right away; the push still
        /// moves in `update_inheritor_complete`
        const IMMEDIATE_UPDATE = 1 << 0;
    }
}

/// Where a turnstile pushes its waiters' priority
#[derive(Clone, Default)]
pub enum TurnstileInheritor {
    /// Nobody inherits
    #[default]
    None,

    /// Another turnstile inherits (the push continues)
    Turnstile(Arc<Turnstile>),

    /// A thread inherits
    Thread(ThreadId),
}

impl TurnstileInheritor {
    /// Get the inheriting turnstile, if any
    pub fn turnstile(&self) -> Option<&Arc<Turnstile>> {
        match self {
            Self::Turnstile(ts) => Some(ts),
            _ => None,
        }
    }

    /// Check if nobody inherits
    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }

    /// Compare by identity
    pub fn same_as(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::None, Self::None) => true,
            (Self::Turnstile(a), Self::Turnstile(b)) => Arc::ptr_eq(a, b),
            (Self::Thread(a), Self::Thread(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Debug for TurnstileInheritor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "None"),
            Self::Turnstile(ts) => write!(f, "Turnstile({})", ts.id),
            Self::Thread(tid) => write!(f, "Thread({})", tid),
        }
    }
}

struct TurnstileState {
    /// Current inheritor
    inheritor: TurnstileInheritor,

    /// Inheritor staged by a non-immediate update
    pending: Option<TurnstileInheritor>,

    /// Turnstile currently holding our push
    pushed_to: Option<Arc<Turnstile>>,

    /// Blocked threads and their base priorities
    waiters: BTreeMap<ThreadId, Priority>,

    /// Pushes received from turnstiles that inherit into this one
    donors: BTreeMap<TurnstileId, Priority>,

    /// Object this turnstile is attached to
    proprietor: Option<PortId>,
}

impl TurnstileState {
    fn effective_priority(&self) -> Priority {
        self.waiters
            .values()
            .chain(self.donors.values())
            .copied()
            .max()
            .unwrap_or(0)
    }
}

/// Priority-inheritance turnstile
pub struct Turnstile {
    /// Turnstile ID
    id: TurnstileId,

    state: Mutex<TurnstileState>,
}

impl Turnstile {
    /// Allocate a free-floating turnstile
    pub fn alloc() -> Arc<Self> {
        Arc::new(Self {
            id: alloc_turnstile_id(),
            state: Mutex::new(TurnstileState {
                inheritor: TurnstileInheritor::None,
                pending: None,
                pushed_to: None,
                waiters: BTreeMap::new(),
                donors: BTreeMap::new(),
                proprietor: None,
            }),
        })
    }

    /// Get turnstile ID
    pub fn id(&self) -> TurnstileId {
        self.id
    }

    /// Get the current inheritor
    pub fn inheritor(&self) -> TurnstileInheritor {
        self.state.lock().inheritor.clone()
    }

    /// Get the object this turnstile is attached to
    pub fn proprietor(&self) -> Option<PortId> {
        self.state.lock().proprietor
    }

    pub(crate) fn attach(&self, proprietor: PortId) {
        self.state.lock().proprietor = Some(proprietor);
    }

    pub(crate) fn detach(&self) {
        self.state.lock().proprietor = None;
    }

    /// Record a new inheritor
    ///
    /// Safe to call with the proprietor's lock held. The priority push is
    /// not moved until `update_inheritor_complete`.
    pub fn update_inheritor(&self, new: TurnstileInheritor, flags: InheritorFlags) {
        let mut st = self.state.lock();
        if flags.contains(InheritorFlags::IMMEDIATE_UPDATE) {
            st.inheritor = new;
            st.pending = None;
        } else {
            st.pending = Some(new);
        }
    }

    /// Move the priority push to the current inheritor
    ///
    /// Must be called without any IPC object lock held.
    pub fn update_inheritor_complete(self: &Arc<Self>) {
        let (old, new) = {
            let mut st = self.state.lock();
            if let Some(pending) = st.pending.take() {
                st.inheritor = pending;
            }
            let new = st.inheritor.turnstile().cloned();
            let old = core::mem::replace(&mut st.pushed_to, new.clone());
            (old, new)
        };

        if let Some(old) = old {
            let moved = new.as_ref().map_or(true, |n| !Arc::ptr_eq(n, &old));
            if moved {
                Self::withdraw(&old, self.id);
            }
        }
        Self::propagate(self.clone());
    }

    /// Block a thread on this turnstile
    pub fn add_waiter(self: &Arc<Self>, tid: ThreadId, priority: Priority) {
        let changed = {
            let mut st = self.state.lock();
            let before = st.effective_priority();
            st.waiters.insert(tid, priority);
            before != st.effective_priority()
        };
        if changed {
            Self::propagate(self.clone());
        }
    }

    /// Unblock a thread
    ///
    /// Returns false if the thread was not waiting here.
    pub fn remove_waiter(self: &Arc<Self>, tid: ThreadId) -> bool {
        let (found, changed) = {
            let mut st = self.state.lock();
            let before = st.effective_priority();
            let found = st.waiters.remove(&tid).is_some();
            (found, before != st.effective_priority())
        };
        if changed {
            Self::propagate(self.clone());
        }
        found
    }

    /// Get the number of blocked threads
    pub fn waiter_count(&self) -> usize {
        self.state.lock().waiters.len()
    }

    /// Get the highest priority pushing on this turnstile
    pub fn effective_priority(&self) -> Priority {
        self.state.lock().effective_priority()
    }

    /// Follow the inheritor chain to its end
    pub fn final_inheritor(self: &Arc<Self>) -> TurnstileInheritor {
        let mut cur = self.clone();
        for _ in 0..TURNSTILE_MAX_HOP {
            let next = cur.inheritor();
            match next {
                TurnstileInheritor::Turnstile(ts) => cur = ts,
                other => return other,
            }
        }
        TurnstileInheritor::Turnstile(cur)
    }

    fn withdraw(target: &Arc<Self>, donor: TurnstileId) {
        let changed = {
            let mut st = target.state.lock();
            let before = st.effective_priority();
            st.donors.remove(&donor);
            before != st.effective_priority()
        };
        if changed {
            Self::propagate(target.clone());
        }
    }

    fn propagate(start: Arc<Self>) {
        let mut cur = start;
        for _ in 0..TURNSTILE_MAX_HOP {
            let (priority, next) = {
                let st = cur.state.lock();
                (st.effective_priority(), st.pushed_to.clone())
            };
            let next = match next {
                Some(next) => next,
                None => return,
            };
            let changed = {
                let mut st = next.state.lock();
                let before = st.effective_priority();
                st.donors.insert(cur.id, priority);
                before != st.effective_priority()
            };
            if !changed {
                return;
            }
            cur = next;
        }
        log_warn!("turnstile: push exceeded {} hops", TURNSTILE_MAX_HOP);
    }
}

impl fmt::Debug for Turnstile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Turnstile").field("id", &self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_turnstile_waiter_priority() {
        let ts = Turnstile::alloc();
        assert_eq!(ts.effective_priority(), 0);
        ts.add_waiter(1, 20);
        ts.add_waiter(2, 40);
        assert_eq!(ts.effective_priority(), 40);
        assert!(ts.remove_waiter(2));
        assert!(!ts.remove_waiter(2));
        assert_eq!(ts.effective_priority(), 20);
        assert_eq!(ts.waiter_count(), 1);
    }

    #[test]
    fn test_turnstile_push_follows_chain() {
        let a = Turnstile::alloc();
        let b = Turnstile::alloc();
        let c = Turnstile::alloc();

        b.update_inheritor(TurnstileInheritor::Turnstile(c.clone()), InheritorFlags::IMMEDIATE_UPDATE);
        b.update_inheritor_complete();
        a.update_inheritor(TurnstileInheritor::Turnstile(b.clone()), InheritorFlags::IMMEDIATE_UPDATE);
        a.update_inheritor_complete();

        a.add_waiter(7, 50);
        assert_eq!(b.effective_priority(), 50);
        assert_eq!(c.effective_priority(), 50);

        a.remove_waiter(7);
        assert_eq!(c.effective_priority(), 0);
    }

    #[test]
    fn test_turnstile_inheritor_change_moves_push() {
        let a = Turnstile::alloc();
        let old = Turnstile::alloc();
        let new = Turnstile::alloc();
        a.add_waiter(3, 33);

        a.update_inheritor(TurnstileInheritor::Turnstile(old.clone()), InheritorFlags::empty());
        // Staged only until completion
        assert!(a.inheritor().is_none());
        a.update_inheritor_complete();
        assert_eq!(old.effective_priority(), 33);

        a.update_inheritor(TurnstileInheritor::Turnstile(new.clone()), InheritorFlags::IMMEDIATE_UPDATE);
        assert!(a.inheritor().same_as(&TurnstileInheritor::Turnstile(new.clone())));
        a.update_inheritor_complete();
        assert_eq!(old.effective_priority(), 0);
        assert_eq!(new.effective_priority(), 33);
    }

    #[test]
    fn test_turnstile_final_inheritor() {
        let a = Turnstile::alloc();
        let b = Turnstile::alloc();
        b.update_inheritor(TurnstileInheritor::Thread(99), InheritorFlags::IMMEDIATE_UPDATE);
        a.update_inheritor(TurnstileInheritor::Turnstile(b.clone()), InheritorFlags::IMMEDIATE_UPDATE);
        assert!(a.final_inheritor().same_as(&TurnstileInheritor::Thread(99)));
    }
}
