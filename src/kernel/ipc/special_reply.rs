// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Special Reply Ports
//!
//! A client that sends a request and waits for the answer on a special
//! reply port links that port to whoever will produce the reply: the
//! destination port (its send turnstile) or the event-filter registration
//! that will deliver the request. The reply port's receive turnstile then
//! inherits from the link, so the waiting client boosts the server.
//!
//! A link owns exactly what it took: a port reference plus one
//! `ts_port_ref` for a port link, a turnstile reference for a stashed
//! link, nothing for a plain knote link.

use crate::kernel::ipc::port::{Port, SyncLink, SyncLinkKind};
use crate::kernel::ipc::stats::IpcStats;
use crate::kernel::ipc::Ipc;
use crate::rustux::types::err::*;
use crate::rustux::types::*;
use alloc::sync::Arc;
use bitflags::bitflags;

use crate::{log_debug, log_trace_if};

const LOCAL_TRACE: bool = false;

bitflags! {
    /// Special reply port link adjustments
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SrpAdjust: u8 {
        /// The reply went out; the link is no longer needed
        const MSG_SENT = 1 << 0;

        /// The link is torn down before a reply was seen
        const CLEAR = 1 << 1;
    }
}

impl Ipc {
    /// Link a special reply port to a destination port
    pub fn special_reply_link_port(&self, srp: &Arc<Port>, dest: &Arc<Port>) -> Result {
        if !srp.is_special_reply() || Arc::ptr_eq(srp, dest) {
            return Err(RX_ERR_INVALID_ARGS);
        }

        let turnstile = self.send_turnstile_prepare(dest);
        if !dest.is_active() {
            drop(turnstile);
            self.send_turnstile_complete(dest);
            return Err(RX_ERR_TERMINATED);
        }
        {
            let mut guard = srp.lock();
            let status = if !guard.is_active() {
                Some(RX_ERR_TERMINATED)
            } else if !matches!(guard.sync_link, SyncLink::None) {
                Some(RX_ERR_BAD_STATE)
            } else {
                None
            };
            if let Some(status) = status {
                drop(guard);
                drop(turnstile);
                self.send_turnstile_complete(dest);
                return Err(status);
            }

            guard.sync_link = SyncLink::Port {
                dest: dest.clone(),
                turnstile,
            };
            guard.srp_msg_sent = false;
            guard.srp_lost_link = false;
        }

        log_trace_if!(LOCAL_TRACE, "srp {}: linked to port {}", srp.id(), dest.id());
        self.special_reply_update_inheritor(srp);
        Ok(())
    }

    /// Link a special reply port to an event-filter registration
    ///
    /// Uses the turnstile the filter stashes for `knote`, else the knote's
    /// own turnstile. A knote nobody services falls back to `dest`.
    pub fn special_reply_link_knote(
        &self,
        srp: &Arc<Port>,
        knote: KnoteId,
        dest: Option<&Arc<Port>>,
    ) -> Result {
        if !srp.is_special_reply() {
            return Err(RX_ERR_INVALID_ARGS);
        }

        let link = match self.filter.stash(knote, srp) {
            Some(ts) => SyncLink::Stashed(ts),
            None if self.filter.kqueue_turnstile_of(knote).is_some() => SyncLink::Knote(knote),
            None => match dest {
                Some(dest) => return self.special_reply_link_port(srp, dest),
                None => SyncLink::Knote(knote),
            },
        };

        {
            let mut guard = srp.lock();
            if !guard.is_active() {
                return Err(RX_ERR_TERMINATED);
            }
            if !matches!(guard.sync_link, SyncLink::None) {
                return Err(RX_ERR_BAD_STATE);
            }
            guard.sync_link = link;
            guard.srp_msg_sent = false;
            guard.srp_lost_link = false;
        }

        log_trace_if!(LOCAL_TRACE, "srp {}: linked to knote {}", srp.id(), knote);
        self.special_reply_update_inheritor(srp);
        Ok(())
    }

    /// Sever a special reply port's link
    pub fn special_reply_adjust(&self, srp: &Arc<Port>, adjust: SrpAdjust) {
        let old = {
            let mut guard = srp.lock();
            if adjust.contains(SrpAdjust::MSG_SENT) {
                guard.srp_msg_sent = true;
            }
            let old = core::mem::replace(&mut guard.sync_link, SyncLink::None);
            let linked = !matches!(old, SyncLink::None);
            if adjust.contains(SrpAdjust::CLEAR)
                && linked
                && !guard.srp_msg_sent
                && self.config.srp_link_diagnostics
            {
                guard.srp_lost_link = true;
                IpcStats::bump(&self.stats.srp_lost_links);
                log_debug!("srp {}: link lost before reply", srp.id());
            }
            old
        };

        self.special_reply_sever(old);
        self.special_reply_update_inheritor(srp);
    }

    /// Get a special reply port's link
    pub fn special_reply_link(&self, srp: &Port) -> SyncLinkKind {
        srp.lock().sync_link_kind()
    }

    /// Drop whatever a detached link owned
    pub(crate) fn special_reply_sever(&self, link: SyncLink) {
        match link {
            SyncLink::Port { dest, turnstile } => {
                drop(turnstile);
                self.send_turnstile_complete(&dest);
            }
            SyncLink::Stashed(ts) => drop(ts),
            SyncLink::Knote(_) | SyncLink::None => {}
        }
    }
}
