// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Ports
//!
//! A port is the rendezvous object behind every IPC right: one receive
//! right, any number of send and send-once rights, a message queue, the
//! dead-name / send-possible request table and the turnstile linkage used
//! for priority inheritance.
//!
//! # Design
//!
//! - **Reference counting**: a port reference is an `Arc<Port>`; rights,
//!   transit edges and special reply links each hold one
//! - **State**: ACTIVE until the receive right is destroyed; a dead port
//!   keeps answering rights operations with dead sentinels
//! - **Binding**: while active a port is exactly one of receiver-bound,
//!   in transit (inside a message headed for `dest`) or in limbo
//! - **Locking**: every mutable field lives behind the port lock. The lock
//!   is taken through [`PortGuard`], and a port-set aggregator can only be
//!   locked from a guard that is consumed in the process, so the
//!   port → aggregator nesting cannot be inverted
//!
//! # Lock Ordering
//!
//! 1. Global transit lock (chain walks only)
//! 2. Port lock (chain walks lock several, in walk order)
//! 3. Port-set aggregator lock

use crate::kernel::ipc::mqueue::{Message, MessageQueue};
use crate::kernel::ipc::pset::PortSet;
use crate::kernel::ipc::request::RequestTable;
use crate::kernel::ipc::rights::SendOnceRight;
use crate::kernel::ipc::turnstile::{Turnstile, TurnstileId};
use crate::rustux::types::*;
use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use bitflags::bitflags;
use core::fmt;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicU64, Ordering};
use spin::{Mutex, MutexGuard};

/// ============================================================================
/// Port ID
/// ============================================================================

/// Next port ID counter
static NEXT_PORT_ID: AtomicU64 = AtomicU64::new(1);

/// Allocate a new port ID
fn alloc_port_id() -> PortId {
    NEXT_PORT_ID.fetch_add(1, Ordering::Relaxed)
}

bitflags! {
    /// Port creation flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PortFlags: u8 {
        /// One-shot reply port that boosts whoever will answer through it
        const SPECIAL_REPLY = 1 << 0;
    }
}

/// ============================================================================
/// Port State
/// ============================================================================

/// Port state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortState {
    /// Receive right exists
    Active,

    /// Receive right destroyed (dead)
    Inactive,
}

/// Who currently owns the receive right
pub(crate) enum Binding {
    /// Named in a capability space
    Receiver { space: SpaceId, name: PortName },

    /// Carried by a message queued on `dest`
    ///
    /// Owns one reference on `dest` and one `ts_port_ref` on its send
    /// turnstile, which is `dest_turnstile`.
    InTransit {
        dest: Arc<Port>,
        dest_turnstile: Arc<Turnstile>,
    },

    /// Held by the kernel, neither named nor queued
    InLimbo,
}

/// Public view of a port's binding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingKind {
    /// Named in a capability space
    Receiver { space: SpaceId, name: PortName },

    /// Carried by a message headed for `dest`
    InTransit { dest: PortId },

    /// Held by the kernel
    InLimbo,

    /// Port is dead
    Dead,
}

/// Special reply port linkage
pub(crate) enum SyncLink {
    /// No linkage
    None,

    /// Linked to a destination port's send turnstile
    ///
    /// Owns one reference on `dest` and one `ts_port_ref` on `turnstile`.
    Port {
        dest: Arc<Port>,
        turnstile: Arc<Turnstile>,
    },

    /// Linked to an event-filter registration's turnstile
    Knote(KnoteId),

    /// Linked to a stashed turnstile (owns one turnstile reference)
    Stashed(Arc<Turnstile>),
}

/// Public view of a special reply port's linkage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncLinkKind {
    /// No linkage
    None,

    /// Linked to a destination port
    Port(PortId),

    /// Linked to an event-filter registration
    Knote(KnoteId),

    /// Linked to a stashed turnstile
    Stashed(TurnstileId),
}

/// ============================================================================
/// Port
/// ============================================================================

/// Lock-protected port state
pub(crate) struct PortInner {
    pub(crate) state: PortState,
    pub(crate) binding: Binding,

    /// Outstanding send rights
    pub(crate) srights: u32,

    /// Outstanding send-once rights
    pub(crate) sorights: u32,

    /// Send rights ever made (reset when the receiver is cleared)
    pub(crate) mscount: MakeSendCount,

    /// Armed no-senders notification
    pub(crate) nsrequest: Option<SendOnceRight>,

    /// Backup port (port-destroyed notification)
    pub(crate) pdrequest: Option<SendOnceRight>,

    /// Dead-name / send-possible requests
    pub(crate) requests: Option<Box<RequestTable>>,

    /// Some send-possible request may be armed
    pub(crate) sprequests: bool,

    pub(crate) mqueue: MessageQueue,

    /// Preallocated message buffer
    pub(crate) premsg: Option<Message>,

    /// Turnstile blocked senders push on (lazily installed)
    pub(crate) send_turnstile: Option<Arc<Turnstile>>,

    /// Holders of the send turnstile linkage
    pub(crate) ts_port_ref: u32,

    pub(crate) sync_link: SyncLink,

    /// A reply was sent through this special reply port
    pub(crate) srp_msg_sent: bool,

    /// Linkage was severed before a reply was sent
    pub(crate) srp_lost_link: bool,

    /// Port sets this port belongs to
    pub(crate) psets: Vec<Arc<PortSet>>,

    /// Event-filter registration monitoring this port
    pub(crate) knote: Option<KnoteId>,
}

impl PortInner {
    /// Check if the port is alive
    pub(crate) fn is_active(&self) -> bool {
        self.state == PortState::Active
    }

    /// Check if the port belongs to at least one port set
    pub(crate) fn in_pset(&self) -> bool {
        !self.psets.is_empty()
    }

    pub(crate) fn is_in_transit(&self) -> bool {
        self.is_active() && matches!(self.binding, Binding::InTransit { .. })
    }

    /// Get the destination of an in-transit port
    pub(crate) fn destination(&self) -> Option<&Arc<Port>> {
        match &self.binding {
            Binding::InTransit { dest, .. } if self.is_active() => Some(dest),
            _ => None,
        }
    }

    pub(crate) fn binding_kind(&self) -> BindingKind {
        if !self.is_active() {
            return BindingKind::Dead;
        }
        match &self.binding {
            Binding::Receiver { space, name } => BindingKind::Receiver {
                space: *space,
                name: *name,
            },
            Binding::InTransit { dest, .. } => BindingKind::InTransit { dest: dest.id() },
            Binding::InLimbo => BindingKind::InLimbo,
        }
    }

    pub(crate) fn sync_link_kind(&self) -> SyncLinkKind {
        match &self.sync_link {
            SyncLink::None => SyncLinkKind::None,
            SyncLink::Port { dest, .. } => SyncLinkKind::Port(dest.id()),
            SyncLink::Knote(knote) => SyncLinkKind::Knote(*knote),
            SyncLink::Stashed(ts) => SyncLinkKind::Stashed(ts.id()),
        }
    }
}

/// IPC port
pub struct Port {
    /// Port ID
    id: PortId,

    /// Creation flags
    flags: PortFlags,

    inner: Mutex<PortInner>,
}

impl Port {
    /// Create a receiver-bound port
    pub(crate) fn new(flags: PortFlags, space: SpaceId, name: PortName, qlimit: usize) -> Arc<Self> {
        Arc::new(Self {
            id: alloc_port_id(),
            flags,
            inner: Mutex::new(PortInner {
                state: PortState::Active,
                binding: Binding::Receiver { space, name },
                srights: 0,
                sorights: 0,
                mscount: 0,
                nsrequest: None,
                pdrequest: None,
                requests: None,
                sprequests: false,
                mqueue: MessageQueue::init(qlimit),
                premsg: None,
                send_turnstile: None,
                ts_port_ref: 0,
                sync_link: SyncLink::None,
                srp_msg_sent: false,
                srp_lost_link: false,
                psets: Vec::new(),
                knote: None,
            }),
        })
    }

    /// Get port ID
    pub fn id(&self) -> PortId {
        self.id
    }

    /// Get creation flags
    pub fn flags(&self) -> PortFlags {
        self.flags
    }

    /// Check if this is a special reply port
    pub fn is_special_reply(&self) -> bool {
        self.flags.contains(PortFlags::SPECIAL_REPLY)
    }

    /// Acquire the port lock
    pub(crate) fn lock(&self) -> PortGuard<'_> {
        PortGuard {
            port: self,
            inner: self.inner.lock(),
        }
    }

    /// Try to acquire the port lock without spinning
    pub(crate) fn try_lock(&self) -> Option<PortGuard<'_>> {
        self.inner.try_lock().map(|inner| PortGuard { port: self, inner })
    }

    /// Check if the port is alive
    pub fn is_active(&self) -> bool {
        self.lock().is_active()
    }

    /// Get the outstanding send right count
    pub fn srights(&self) -> u32 {
        self.lock().srights
    }

    /// Get the outstanding send-once right count
    pub fn sorights(&self) -> u32 {
        self.lock().sorights
    }

    /// Get the make-send count
    pub fn mscount(&self) -> MakeSendCount {
        self.lock().mscount
    }

    /// Check if the port belongs to a port set
    pub fn in_pset(&self) -> bool {
        self.lock().in_pset()
    }

    /// Get the port's binding
    pub fn binding(&self) -> BindingKind {
        self.lock().binding_kind()
    }

    /// Get the current send turnstile, if one is installed
    pub fn send_turnstile(&self) -> Option<Arc<Turnstile>> {
        self.lock().send_turnstile.clone()
    }

    /// Take a consistent snapshot for diagnostics
    pub fn info(&self) -> PortInfo {
        let inner = self.lock();
        PortInfo {
            id: self.id,
            active: inner.is_active(),
            binding: inner.binding_kind(),
            srights: inner.srights,
            sorights: inner.sorights,
            mscount: inner.mscount,
            seqno: inner.mqueue.seqno(),
            msgcount: inner.mqueue.msgcount(),
            qlimit: inner.mqueue.qlimit(),
            queue_valid: inner.mqueue.is_valid(),
            wakeups: inner.mqueue.wakeups(),
            pset_count: inner.psets.len(),
            request_slots: inner.requests.as_ref().map_or(0, |t| t.usable()),
            live_requests: inner.requests.as_ref().map_or(0, |t| t.live_count()),
            has_nsrequest: inner.nsrequest.is_some(),
            has_pdrequest: inner.pdrequest.is_some(),
            has_premsg: inner.premsg.is_some(),
            send_turnstile: inner.send_turnstile.as_ref().map(|ts| ts.id()),
            ts_port_ref: inner.ts_port_ref,
            sync_link: inner.sync_link_kind(),
            srp_msg_sent: inner.srp_msg_sent,
            srp_lost_link: inner.srp_lost_link,
            knote: inner.knote,
        }
    }
}

impl fmt::Debug for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Port")
            .field("id", &self.id)
            .field("flags", &self.flags)
            .finish()
    }
}

/// Port snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortInfo {
    pub id: PortId,
    pub active: bool,
    pub binding: BindingKind,
    pub srights: u32,
    pub sorights: u32,
    pub mscount: MakeSendCount,
    pub seqno: SeqNo,
    pub msgcount: usize,
    pub qlimit: usize,
    pub queue_valid: bool,
    pub wakeups: u64,
    pub pset_count: usize,
    pub request_slots: usize,
    pub live_requests: usize,
    pub has_nsrequest: bool,
    pub has_pdrequest: bool,
    pub has_premsg: bool,
    pub send_turnstile: Option<TurnstileId>,
    pub ts_port_ref: u32,
    pub sync_link: SyncLinkKind,
    pub srp_msg_sent: bool,
    pub srp_lost_link: bool,
    pub knote: Option<KnoteId>,
}

/// ============================================================================
/// Port Guard
/// ============================================================================

/// Held port lock
pub(crate) struct PortGuard<'a> {
    port: &'a Port,
    inner: MutexGuard<'a, PortInner>,
}

impl<'a> PortGuard<'a> {
    /// Get the locked port
    pub(crate) fn port(&self) -> &'a Port {
        self.port
    }
}

impl Deref for PortGuard<'_> {
    type Target = PortInner;

    fn deref(&self) -> &PortInner {
        &self.inner
    }
}

impl DerefMut for PortGuard<'_> {
    fn deref_mut(&mut self) -> &mut PortInner {
        &mut self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_new_is_receiver_bound() {
        let port = Port::new(PortFlags::empty(), 1, 0x103, 5);
        let info = port.info();
        assert!(info.active);
        assert_eq!(info.binding, BindingKind::Receiver { space: 1, name: 0x103 });
        assert_eq!((info.srights, info.sorights, info.mscount), (0, 0, 0));
        assert_eq!(info.qlimit, 5);
        assert!(!port.in_pset());
        assert!(!port.is_special_reply());
    }

    #[test]
    fn test_port_ids_unique() {
        let a = Port::new(PortFlags::empty(), 1, 1, 5);
        let b = Port::new(PortFlags::SPECIAL_REPLY, 1, 2, 5);
        assert_ne!(a.id(), b.id());
        assert!(b.is_special_reply());
    }

    #[test]
    fn test_port_try_lock_contended() {
        let port = Port::new(PortFlags::empty(), 1, 1, 5);
        let guard = port.lock();
        assert!(port.try_lock().is_none());
        drop(guard);
        assert!(port.try_lock().is_some());
    }
}
