// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Port Destruction
//!
//! Giving up a receive right destroys the port unless a backup was
//! registered, in which case the right moves to the backup's owner through
//! a port-destroyed notification and the port lives on in limbo.
//!
//! Destruction is terminal. Everything the port owned is detached under
//! the port lock, the same lock the queue's validity bit lives under, and
//! released after unlocking: queued messages, the armed no-senders
//! notification (fired), the request table (every live entry gets a
//! dead-name notification), the special reply link, the transit edge and
//! the send turnstile's push.

use crate::kernel::ipc::port::{Binding, PortState, SyncLink};
use crate::kernel::ipc::rights::ReceiveRight;
use crate::kernel::ipc::stats::IpcStats;
use crate::kernel::ipc::turnstile::{InheritorFlags, TurnstileInheritor};
use crate::kernel::ipc::Ipc;
use alloc::collections::VecDeque;

use crate::{log_debug, log_trace_if};

const LOCAL_TRACE: bool = false;

/// What became of a destroyed receive right
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortDestroyed {
    /// Port is dead
    Dead,

    /// Receive right went to the backup; the port is in limbo
    InLimbo,
}

impl Ipc {
    /// Give up a receive right
    pub fn port_destroy(&self, right: ReceiveRight) -> PortDestroyed {
        let port = right.port().clone();
        let mut guard = port.lock();
        if !guard.is_active() {
            return PortDestroyed::Dead;
        }

        if let Some(backup) = guard.pdrequest.take() {
            let (mut guard, edge) = self.make_limbo_locked(guard);
            let link = core::mem::replace(&mut guard.sync_link, SyncLink::None);
            let ts = self.send_turnstile_update_locked(&guard);
            drop(guard);

            if let Some(ts) = ts {
                ts.update_inheritor_complete();
            }
            self.release_transit_edge(edge);
            self.special_reply_sever(link);
            self.special_reply_update_inheritor(&port);

            log_trace_if!(LOCAL_TRACE, "port {}: handed to backup", port.id());
            self.notify_port_destroyed(backup, right);
            return PortDestroyed::InLimbo;
        }

        guard.state = PortState::Inactive;
        let (mut guard, sets) = guard.leave_all_sets();

        let reap = guard.mqueue.mark_invalid();
        let messages = if reap {
            guard.mqueue.destroy()
        } else {
            VecDeque::new()
        };
        guard.premsg = None;
        guard.sprequests = false;

        let nsrequest = guard.nsrequest.take();
        let mscount = guard.mscount;
        let requests = guard.requests.take();
        let binding = core::mem::replace(&mut guard.binding, Binding::InLimbo);
        let link = core::mem::replace(&mut guard.sync_link, SyncLink::None);
        guard.knote = None;

        let send_ts = guard.send_turnstile.clone();
        if let Some(ts) = &send_ts {
            ts.update_inheritor(TurnstileInheritor::None, InheritorFlags::IMMEDIATE_UPDATE);
        }
        drop(guard);

        drop(messages);
        if let Some(notify) = nsrequest {
            self.notify_no_senders(notify, mscount);
        }
        self.special_reply_sever(link);
        self.special_reply_update_inheritor(&port);
        if let Some(table) = requests {
            self.request_dead_names(table);
        }
        if let Binding::InTransit {
            dest,
            dest_turnstile,
        } = binding
        {
            self.release_transit_edge(Some((dest, dest_turnstile)));
        }
        if let Some(ts) = send_ts {
            ts.update_inheritor_complete();
        }

        IpcStats::bump(&self.stats.ports_destroyed);
        log_debug!("port {}: destroyed (left {} sets)", port.id(), sets);
        drop(right);
        PortDestroyed::Dead
    }
}
