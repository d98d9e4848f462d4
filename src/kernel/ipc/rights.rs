// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Port Rights
//!
//! Rights are move-only tokens. Each one owns a port reference and is
//! counted in the port's `srights` / `sorights`. A right made from a dead
//! port is the dead sentinel: it owns nothing and every operation on it
//! succeeds trivially.
//!
//! Rights are not released on drop. Giving one up goes through
//! [`Ipc::release_send`] / [`Ipc::release_sonce`] so the no-senders
//! protocol can run.

use crate::kernel::ipc::port::Port;
use crate::kernel::ipc::{Ipc, Rejected};
use crate::rustux::types::err::*;
use crate::rustux::types::*;
use alloc::sync::Arc;

use crate::log_trace_if;

const LOCAL_TRACE: bool = false;

/// The receive right of a port
#[must_use = "dropping a receive right leaks the port; destroy it instead"]
#[derive(Debug)]
pub struct ReceiveRight {
    port: Arc<Port>,
}

impl ReceiveRight {
    pub(crate) fn new(port: Arc<Port>) -> Self {
        Self { port }
    }

    /// Get the port
    pub fn port(&self) -> &Arc<Port> {
        &self.port
    }

    pub(crate) fn into_port(self) -> Arc<Port> {
        self.port
    }
}

/// A send right
///
/// Either counted in a port's `srights` or the dead sentinel. Only the
/// port layer can make a counted one.
#[must_use = "send rights must be released"]
#[derive(Debug)]
pub struct SendRight(Option<Arc<Port>>);

impl SendRight {
    /// Get the dead sentinel
    pub const fn dead() -> Self {
        Self(None)
    }

    /// Wrap a port whose `srights` was already bumped
    pub(crate) fn counted(port: Arc<Port>) -> Self {
        Self(Some(port))
    }

    /// Check for the dead sentinel
    pub fn is_dead(&self) -> bool {
        self.0.is_none()
    }

    /// Get the port, unless dead
    pub fn port(&self) -> Option<&Arc<Port>> {
        self.0.as_ref()
    }

    pub fn port_id(&self) -> Option<PortId> {
        self.port().map(|p| p.id())
    }

    fn into_port(self) -> Option<Arc<Port>> {
        self.0
    }
}

/// A send-once right
///
/// Either counted in a port's `sorights` or the dead sentinel.
#[must_use = "send-once rights must be consumed or released"]
#[derive(Debug)]
pub struct SendOnceRight(Option<Arc<Port>>);

impl SendOnceRight {
    /// Get the dead sentinel
    pub const fn dead() -> Self {
        Self(None)
    }

    pub(crate) fn counted(port: Arc<Port>) -> Self {
        Self(Some(port))
    }

    /// Check for the dead sentinel
    pub fn is_dead(&self) -> bool {
        self.0.is_none()
    }

    /// Get the port, unless dead
    pub fn port(&self) -> Option<&Arc<Port>> {
        self.0.as_ref()
    }

    pub fn port_id(&self) -> Option<PortId> {
        self.port().map(|p| p.id())
    }

    fn into_port(self) -> Option<Arc<Port>> {
        self.0
    }
}

impl Port {
    /// Make a send right from the receive right
    pub fn make_send(self: &Arc<Self>) -> SendRight {
        let mut guard = self.lock();
        if !guard.is_active() {
            return SendRight::dead();
        }
        guard.srights += 1;
        guard.mscount += 1;
        log_trace_if!(
            LOCAL_TRACE,
            "port {}: make-send srights={} mscount={}",
            self.id(),
            guard.srights,
            guard.mscount
        );
        SendRight::counted(self.clone())
    }

    /// Duplicate an existing send right
    ///
    /// The make-send count does not change. A port with no counted send
    /// rights cannot be copied from and yields the dead sentinel.
    pub fn copy_send(right: &SendRight) -> SendRight {
        let port = match right.port() {
            Some(port) => port,
            None => return SendRight::dead(),
        };
        let mut guard = port.lock();
        if !guard.is_active() || guard.srights == 0 {
            return SendRight::dead();
        }
        guard.srights += 1;
        SendRight::counted(port.clone())
    }

    /// Make a send-once right from the receive right
    pub fn make_sonce(self: &Arc<Self>) -> SendOnceRight {
        let mut guard = self.lock();
        if !guard.is_active() {
            return SendOnceRight::dead();
        }
        guard.sorights += 1;
        SendOnceRight::counted(self.clone())
    }
}

impl Ipc {
    /// Give up a send right
    ///
    /// Dropping the last send right of an active port fires its armed
    /// no-senders notification with the make-send count seen at the
    /// decrement.
    pub fn release_send(&self, right: SendRight) {
        let port = match right.into_port() {
            Some(port) => port,
            None => return,
        };

        let fire = {
            let mut guard = port.lock();
            assert!(guard.srights > 0, "port {}: send right underflow", port.id());
            guard.srights -= 1;
            if guard.srights == 0 && guard.is_active() {
                let mscount = guard.mscount;
                guard.nsrequest.take().map(|notify| (notify, mscount))
            } else {
                None
            }
        };

        if let Some((notify, mscount)) = fire {
            self.notify_no_senders(notify, mscount);
        }
    }

    /// Give up a send-once right without using it
    pub fn release_sonce(&self, right: SendOnceRight) {
        if let Some(port) = right.into_port() {
            let mut guard = port.lock();
            assert!(guard.sorights > 0, "port {}: send-once right underflow", port.id());
            guard.sorights -= 1;
        }
    }

    /// Arm (or disarm) the no-senders notification
    ///
    /// Hands back the previously armed right. When the port already has no
    /// senders and `sync` is not ahead of the make-send count, `notify`
    /// fires right away instead of being stored.
    pub fn nsrequest(
        &self,
        port: &Arc<Port>,
        sync: MakeSendCount,
        notify: Option<SendOnceRight>,
    ) -> core::result::Result<Option<SendOnceRight>, Rejected<Option<SendOnceRight>>> {
        let mut guard = port.lock();
        if !guard.is_active() {
            return Err(Rejected::new(RX_ERR_TERMINATED, notify));
        }

        let previous = guard.nsrequest.take();
        match notify {
            Some(notify) if guard.srights == 0 && sync <= guard.mscount => {
                let mscount = guard.mscount;
                drop(guard);
                self.notify_no_senders(notify, mscount);
            }
            notify => guard.nsrequest = notify,
        }
        Ok(previous)
    }

    /// Register (or clear) the backup port
    ///
    /// Hands back the previous backup.
    pub fn pdrequest(
        &self,
        port: &Arc<Port>,
        notify: Option<SendOnceRight>,
    ) -> core::result::Result<Option<SendOnceRight>, Rejected<Option<SendOnceRight>>> {
        let mut guard = port.lock();
        if !guard.is_active() {
            return Err(Rejected::new(RX_ERR_TERMINATED, notify));
        }
        Ok(core::mem::replace(&mut guard.pdrequest, notify))
    }
}
